mod common;

use std::sync::Arc;

use common::{eventually, host};
use direct_connection::mock::MockTransportFactory;
use direct_connection::{
    pump_inbox, AcceptOptions, BusRelay, CloseOptions, Connection, ConnectionParams,
    ConnectionRegistry, ConnectionSettings, ConnectionState, Role,
};
use signal_bus::{LocalSignalBus, SignalBus};

struct Peer {
    conn: Connection,
    factory: Arc<MockTransportFactory>,
    registry: Arc<ConnectionRegistry>,
}

fn peer(bus: &Arc<LocalSignalBus>, role: Role, me: &str, other: &str) -> Peer {
    let relay = BusRelay::new(bus.clone(), me, other, "call-1").with_reports_to("service");
    let factory = Arc::new(MockTransportFactory::new());
    let mut params = ConnectionParams::new(role, "call-1", Arc::new(relay), factory.clone())
        .with_settings(ConnectionSettings::localhost());
    if role == Role::Responder {
        params = params
            .with_connection_id("conn-bob")
            .with_local_connection_id("conn-bob");
    }
    let conn = Connection::new(params);
    let registry = Arc::new(ConnectionRegistry::new());
    registry.insert(conn.clone());
    tokio::spawn(pump_inbox(bus.register(me), registry.clone()));
    Peer {
        conn,
        factory,
        registry,
    }
}

#[test_timeout::tokio_timeout_test]
async fn two_peers_negotiate_over_the_bus() {
    let bus = Arc::new(LocalSignalBus::new());
    let mut service = bus.register("service");
    let alice = peer(&bus, Role::Initiator, "alice", "bob");
    let bob = peer(&bus, Role::Responder, "bob", "alice");

    bob.conn.accept(AcceptOptions::default()).await.unwrap();
    bob.conn.approve();
    alice.conn.accept(AcceptOptions::default()).await.unwrap();
    alice.conn.approve();

    let (a, b) = (alice.conn.clone(), bob.conn.clone());
    eventually("both answered", || {
        a.state() == ConnectionState::Answered && b.state() == ConnectionState::Answered
    })
    .await;
    assert_eq!(alice.conn.connection_id().as_deref(), Some("conn-bob"));

    let alice_transport = alice.factory.last_transport().unwrap();
    let bob_transport = bob.factory.last_transport().unwrap();
    alice_transport.discover(host(1));
    bob_transport.discover(host(2));
    eventually("candidates crossed", || {
        bob_transport.applied_candidates() == vec![host(1).candidate]
            && alice_transport.applied_candidates() == vec![host(2).candidate]
    })
    .await;

    alice.conn.close(CloseOptions::default());
    let b = bob.conn.clone();
    eventually("bye reached bob", || b.state() == ConnectionState::Ended).await;
    assert_eq!(bob.conn.report().connection_stopped_reason, "Remote side hung up");
    assert!(bob.registry.is_empty());
    assert!(alice.registry.is_empty());

    let mut reports = 0;
    while let Ok(envelope) = service.try_recv() {
        let body: serde_json::Value = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(body["signalType"], "report");
        reports += 1;
    }
    assert_eq!(reports, 2);
}
