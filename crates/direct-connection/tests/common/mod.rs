#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use direct_connection::mock::{MockTransport, MockTransportFactory, RecordingRelay};
use direct_connection::{
    AcceptOptions, AnswerSignal, CandidateSignal, Connection, ConnectionParams, ConnectionSettings,
    IceCandidate, OfferSignal, Role, SessionDescription,
};

pub struct Harness {
    pub conn: Connection,
    pub relay: Arc<RecordingRelay>,
    pub factory: Arc<MockTransportFactory>,
}

impl Harness {
    pub fn new(role: Role) -> Self {
        Self::with_factory(role, MockTransportFactory::new(), |params| params)
    }

    pub fn with_factory(
        role: Role,
        factory: MockTransportFactory,
        configure: impl FnOnce(ConnectionParams) -> ConnectionParams,
    ) -> Self {
        let relay = Arc::new(RecordingRelay::new());
        let factory = Arc::new(factory);
        let params = ConnectionParams::new(role, "session-1", relay.clone(), factory.clone())
            .with_settings(ConnectionSettings::localhost());
        Self {
            conn: Connection::new(configure(params)),
            relay,
            factory,
        }
    }

    pub fn transport(&self) -> Arc<MockTransport> {
        self.factory
            .last_transport()
            .expect("accept should have built a transport")
    }

    pub async fn accept(&self) {
        self.conn
            .accept(AcceptOptions::default())
            .await
            .expect("accept failed");
    }

    /// Initiator: accept, approve and wait until the offer went out.
    pub async fn offered(&self) {
        self.accept().await;
        self.conn.approve();
        let relay = self.relay.clone();
        eventually("offer signaled", || relay.count("offer") == 1).await;
    }

    /// Initiator: run the full exchange up to an applied remote answer.
    pub async fn answered(&self) {
        self.offered().await;
        self.conn.set_answer(answer("conn-1"));
        let transport = self.transport();
        eventually("remote answer applied", || {
            transport.remote_descriptions().len() == 1
        })
        .await;
    }
}

pub fn host(n: u8) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
        Some("0".into()),
        Some(0),
    )
}

pub fn relay_candidate(n: u8) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{n} 1 udp 41885439 203.0.113.{n} 3478{n} typ relay raddr 0.0.0.0 rport 0"),
        Some("0".into()),
        Some(0),
    )
}

pub fn remote(candidate: IceCandidate) -> CandidateSignal {
    CandidateSignal {
        candidate: Some(candidate),
    }
}

pub fn offer() -> OfferSignal {
    OfferSignal {
        sdp: SessionDescription::offer("v=0\r\no=remote-offer\r\n"),
    }
}

pub fn answer(connection_id: &str) -> AnswerSignal {
    AnswerSignal {
        sdp: SessionDescription::answer(format!("v=0\r\no=remote-answer-{connection_id}\r\n")),
        connection_id: Some(connection_id.to_string()),
    }
}

/// Polls `check` until it holds, yielding to spawned tasks in between.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

/// Gives spawned tasks time to run so a test can assert nothing happened.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
