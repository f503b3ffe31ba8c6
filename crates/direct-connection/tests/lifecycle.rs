mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, settle, Harness};
use direct_connection::connection::{ANSWERED_ELSEWHERE, HUNG_UP_BEFORE_APPROVAL, REMOTE_HUNG_UP};
use direct_connection::mock::{MockStep, MockTransportFactory};
use direct_connection::{
    AcceptOptions, ByeSignal, CloseOptions, ConnectedSignal, ConnectionError, ConnectionEvent,
    ConnectionState, EventKind, Role, StatsOptions,
};
use serde_json::json;

#[test_timeout::tokio_timeout_test]
async fn responder_applies_offer_once_whatever_the_order() {
    #[derive(Debug, Clone, Copy)]
    enum Step {
        Offer,
        Accept,
        Approve,
    }
    let orders = [
        [Step::Offer, Step::Accept, Step::Approve],
        [Step::Approve, Step::Accept, Step::Offer],
        [Step::Accept, Step::Offer, Step::Approve],
        [Step::Accept, Step::Approve, Step::Offer],
    ];

    for order in orders {
        let h = Harness::new(Role::Responder);
        for (index, step) in order.iter().enumerate() {
            match step {
                Step::Offer => h.conn.set_offer(common::offer()),
                Step::Accept => h.accept().await,
                Step::Approve => h.conn.approve(),
            }
            if index < order.len() - 1 {
                settle().await;
                if let Some(transport) = h.factory.last_transport() {
                    assert!(
                        transport.remote_descriptions().is_empty(),
                        "offer applied early for {order:?}"
                    );
                }
            }
        }
        let transport = h.transport();
        let relay = h.relay.clone();
        eventually("answer signaled", || relay.count("answer") == 1).await;
        settle().await;
        assert_eq!(transport.remote_descriptions(), vec![common::offer().sdp]);
        assert_eq!(h.conn.state(), ConnectionState::Answered);
        assert_eq!(h.relay.count("answer"), 1);
    }
}

#[test_timeout::tokio_timeout_test]
async fn responder_reviews_offer_before_approval() {
    let h = Harness::new(Role::Responder);
    h.conn.set_offer(common::offer());
    assert_eq!(h.conn.state(), ConnectionState::InReview);
    assert_eq!(h.conn.report().last_sdp_string, common::offer().sdp.sdp);
    h.conn.approve();
    assert_eq!(h.conn.state(), ConnectionState::Approved);
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_answer_is_ignored() {
    let h = Harness::new(Role::Initiator);
    h.answered().await;
    h.conn.set_answer(common::answer("conn-2"));
    settle().await;

    let transport = h.transport();
    assert_eq!(
        transport.remote_descriptions(),
        vec![common::answer("conn-1").sdp]
    );
    assert_eq!(h.conn.state(), ConnectionState::Answered);
    assert_eq!(h.conn.connection_id().as_deref(), Some("conn-1"));
    assert_eq!(h.relay.count("connected"), 1);
    assert_eq!(h.conn.report().sdps_received.len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn offer_resolves_only_after_it_was_signaled() {
    let h = Harness::new(Role::Initiator);
    h.accept().await;
    h.conn.approve();
    let offer = h.conn.offer_ready().await.unwrap();
    assert_eq!(h.relay.count("offer"), 1);
    assert_eq!(h.conn.state(), ConnectionState::Offered);
    assert_eq!(h.conn.report().sdps_sent, vec![offer]);
}

#[test_timeout::tokio_timeout_test]
async fn initiator_approving_before_accept_offers_after_it() {
    let h = Harness::new(Role::Initiator);
    h.conn.approve();
    settle().await;
    assert_eq!(h.relay.count("offer"), 0);
    h.accept().await;
    let relay = h.relay.clone();
    eventually("offer signaled", || relay.count("offer") == 1).await;
}

#[test_timeout::tokio_timeout_test]
async fn send_message_needs_an_open_channel() {
    let h = Harness::new(Role::Initiator);
    assert!(matches!(
        h.conn.send_message("hi"),
        Err(ConnectionError::ChannelNotOpen)
    ));
    h.answered().await;
    let transport = h.transport();
    let channel = transport.channel().unwrap();

    assert!(matches!(
        h.conn.send_message("hi"),
        Err(ConnectionError::ChannelNotOpen)
    ));
    assert!(channel.sent().is_empty());
    assert!(!h.conn.is_active());

    let mut events = h.conn.subscribe();
    transport.open_channel();
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Open);
    assert_eq!(h.conn.state(), ConnectionState::Flowing);
    assert!(h.conn.is_active());

    h.conn.send_message("hi").unwrap();
    assert_eq!(channel.sent(), vec![r#"{"message":"hi"}"#.to_string()]);
    h.conn.send_message(json!({ "kind": "ping" })).unwrap();
    assert_eq!(channel.sent()[1], r#"{"kind":"ping"}"#);
}

#[test_timeout::tokio_timeout_test]
async fn incoming_messages_are_decoded() {
    let h = Harness::new(Role::Responder);
    let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = received.clone();
    h.conn
        .accept(AcceptOptions {
            on_message: Some(Arc::new(move |event: &ConnectionEvent| {
                if let ConnectionEvent::Message(value) = event {
                    sink.lock().push(value.clone());
                }
            })),
            ..Default::default()
        })
        .await
        .unwrap();
    let transport = h.transport();
    transport.announce_channel("direct-data");
    transport.open_channel();
    transport.emit(direct_connection::TransportEvent::ChannelMessage(
        r#"{"message":"hello"}"#.into(),
    ));
    transport.emit(direct_connection::TransportEvent::ChannelMessage(
        "not json".into(),
    ));
    eventually("messages delivered", || received.lock().len() == 2).await;
    assert_eq!(
        *received.lock(),
        vec![json!({ "message": "hello" }), json!("not json")]
    );
    assert!(h.conn.is_active());
}

#[test_timeout::tokio_timeout_test]
async fn close_many_times_reports_once() {
    let h = Harness::new(Role::Initiator);
    h.answered().await;
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    h.conn.listen(
        EventKind::Close,
        Arc::new(move |event: &ConnectionEvent| {
            assert_eq!(*event, ConnectionEvent::Close { sent_signal: true });
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    for _ in 0..3 {
        h.conn.close(CloseOptions::default());
    }
    h.conn.reject(CloseOptions::default());

    assert_eq!(h.relay.count("report"), 1);
    assert_eq!(h.relay.count("terminate"), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.conn.state(), ConnectionState::Ended);
    assert_eq!(h.conn.state_label(), "ENDED");
    assert!(!h.conn.is_active());

    let transport = h.transport();
    let channel = transport.channel().unwrap();
    eventually("handles released", || {
        transport.is_closed() && channel.is_closed()
    })
    .await;
    assert!(h.conn.report().connection_stopped > 0);
}

#[test_timeout::tokio_timeout_test]
async fn close_can_skip_the_terminate_signal() {
    let h = Harness::new(Role::Responder);
    let mut events = h.conn.subscribe();
    h.conn.close(CloseOptions::silent());
    assert_eq!(h.relay.names(), vec!["report"]);
    assert_eq!(
        events.recv().await.unwrap(),
        ConnectionEvent::Close { sent_signal: false }
    );
}

#[test_timeout::tokio_timeout_test]
async fn close_from_inside_a_callback() {
    let h = Harness::new(Role::Initiator);
    let conn = h.conn.clone();
    h.conn.listen(
        EventKind::Open,
        Arc::new(move |_: &ConnectionEvent| conn.close(CloseOptions::default())),
    );
    h.answered().await;
    h.transport().open_channel();
    let probe = h.conn.clone();
    eventually("closed by callback", || probe.state().is_terminal()).await;
    assert_eq!(h.relay.count("report"), 1);
}

#[test_timeout::tokio_timeout_test]
async fn reject_before_approval_unblocks_waiters() {
    let h = Harness::new(Role::Responder);
    let conn = h.conn.clone();
    let waiter = tokio::spawn(async move { conn.approved().await });
    settle().await;
    h.conn.reject(CloseOptions::default());
    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.reason(), HUNG_UP_BEFORE_APPROVAL);
    assert!(h.conn.offer_ready().await.is_err());
}

#[test_timeout::tokio_timeout_test]
async fn approval_survives_a_later_close() {
    let h = Harness::new(Role::Responder);
    h.conn.approve();
    h.conn.approve();
    h.conn.close(CloseOptions::default());
    assert!(h.conn.approved().await.is_ok());
}

#[test_timeout::tokio_timeout_test]
async fn offer_on_initiator_is_answered_with_terminate() {
    let h = Harness::new(Role::Initiator);
    h.conn.set_offer(common::offer());
    assert_eq!(h.relay.names(), vec!["terminate"]);
    let err = h.conn.offer_ready().await.unwrap_err();
    assert_eq!(err.reason(), "Received offer in a bad state.");
    assert_eq!(h.conn.state(), ConnectionState::Started);
}

#[test_timeout::tokio_timeout_test]
async fn bye_records_the_remote_reason() {
    let h = Harness::new(Role::Initiator);
    h.answered().await;
    h.conn.set_bye(ByeSignal { reason: None });
    assert_eq!(h.conn.state(), ConnectionState::Ended);
    assert_eq!(h.relay.count("terminate"), 0);
    assert_eq!(h.conn.report().connection_stopped_reason, REMOTE_HUNG_UP);
}

#[test_timeout::tokio_timeout_test]
async fn responder_closes_when_answered_elsewhere() {
    let h = Harness::with_factory(Role::Responder, MockTransportFactory::new(), |params| {
        params.with_local_connection_id("me")
    });
    h.conn.set_connected(ConnectedSignal {
        connection_id: "me".into(),
    });
    assert_eq!(h.conn.state(), ConnectionState::Started);

    h.conn.set_connected(ConnectedSignal {
        connection_id: "someone-else".into(),
    });
    assert_eq!(h.conn.state(), ConnectionState::Ended);
    assert_eq!(h.relay.count("terminate"), 0);
    assert_eq!(h.conn.report().connection_stopped_reason, ANSWERED_ELSEWHERE);
}

#[test_timeout::tokio_timeout_test]
async fn transport_creation_failure_is_a_media_error() {
    let factory = MockTransportFactory::new();
    factory.fail(MockStep::Create);
    let h = Harness::with_factory(Role::Initiator, factory, |params| params);
    let err = h.conn.accept(AcceptOptions::default()).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Transport(_)));
    assert_eq!(h.conn.state(), ConnectionState::MediaError);
    assert_eq!(
        h.conn.report().connection_stopped_reason,
        "Could not create transport."
    );
    assert_eq!(h.relay.count("report"), 1);
    assert!(matches!(
        h.conn.accept(AcceptOptions::default()).await,
        Err(ConnectionError::Closed)
    ));
}

#[test_timeout::tokio_timeout_test]
async fn failed_local_offer_closes_without_terminate() {
    let factory = MockTransportFactory::new();
    factory.fail(MockStep::SetLocal);
    let h = Harness::with_factory(Role::Initiator, factory, |params| params);
    h.accept().await;
    h.conn.approve();
    let err = h.conn.offer_ready().await.unwrap_err();
    assert_eq!(err.reason(), "setLocalDescription failed at offer.");
    assert_eq!(h.conn.state(), ConnectionState::Ended);
    assert_eq!(h.relay.count("offer"), 0);
    assert_eq!(h.relay.count("terminate"), 0);
    assert_eq!(h.relay.count("report"), 1);
}

#[test_timeout::tokio_timeout_test]
async fn failed_remote_answer_closes_with_reason() {
    let factory = MockTransportFactory::new();
    let h = Harness::with_factory(Role::Initiator, factory, |params| params);
    h.offered().await;
    h.factory.fail(MockStep::SetRemote);
    h.conn.set_answer(common::answer("conn-1"));
    let probe = h.conn.clone();
    eventually("closed after failure", || probe.state().is_terminal()).await;
    assert_eq!(
        h.conn.report().connection_stopped_reason,
        "setRemoteDescription failed at answer."
    );
    assert_eq!(h.relay.count("terminate"), 1);
}

#[test_timeout::tokio_timeout_test]
async fn native_failure_ends_in_media_error() {
    let h = Harness::new(Role::Initiator);
    h.answered().await;
    h.transport()
        .emit(direct_connection::TransportEvent::Failed("ICE failed".into()));
    let probe = h.conn.clone();
    eventually("media error", || {
        probe.state() == ConnectionState::MediaError
    })
    .await;
    assert_eq!(h.conn.report().connection_stopped_reason, "ICE failed");
}

#[test_timeout::tokio_timeout_test]
async fn state_label_tracks_transport_creation() {
    let h = Harness::new(Role::Initiator);
    assert_eq!(h.conn.state_label(), "before");
    h.accept().await;
    assert_eq!(h.conn.state_label(), "STARTED");
    h.accept().await;
    assert_eq!(h.factory.created(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn stats_need_transport_support() {
    let h = Harness::new(Role::Initiator);
    assert!(matches!(
        h.conn.get_stats(StatsOptions::default()),
        Err(ConnectionError::NoTransport)
    ));
    h.accept().await;
    assert!(matches!(
        h.conn.get_stats(StatsOptions::default()),
        Err(ConnectionError::StatsUnavailable)
    ));
}

#[test_timeout::tokio_timeout_test(secs = 60, start_paused)]
async fn stats_are_sampled_after_negotiation_until_close() {
    let h = Harness::with_factory(Role::Initiator, MockTransportFactory::with_stats(), |p| p);
    h.accept().await;
    h.conn
        .get_stats(StatsOptions {
            interval: Some(Duration::from_secs(1)),
        })
        .unwrap();
    let mut events = h.conn.subscribe();

    h.conn.approve();
    let relay = h.relay.clone();
    eventually("offer signaled", || relay.count("offer") == 1).await;
    assert!(h.conn.report().stats.is_empty());
    h.conn.set_answer(common::answer("conn-1"));

    let mut samples = Vec::new();
    while samples.len() < 3 {
        if let ConnectionEvent::Stats(sample) = events.recv().await.unwrap() {
            samples.push(sample);
        }
    }
    assert_eq!(samples[0], json!({ "sample": 0 }));
    assert_eq!(samples[2], json!({ "sample": 2 }));

    h.conn.close(CloseOptions::default());
    let recorded = h.conn.report().stats.len();
    assert!(recorded >= 3);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.conn.report().stats.len(), recorded);
}

#[test_timeout::tokio_timeout_test(secs = 60, start_paused)]
async fn zero_stats_interval_still_samples() {
    let h = Harness::with_factory(Role::Initiator, MockTransportFactory::with_stats(), |p| p);
    h.accept().await;
    h.conn
        .get_stats(StatsOptions {
            interval: Some(Duration::ZERO),
        })
        .unwrap();
    let mut events = h.conn.subscribe();
    h.conn.approve();
    let relay = h.relay.clone();
    eventually("offer signaled", || relay.count("offer") == 1).await;
    h.conn.set_answer(common::answer("conn-1"));

    loop {
        if let ConnectionEvent::Stats(sample) = events.recv().await.unwrap() {
            assert_eq!(sample, json!({ "sample": 0 }));
            break;
        }
    }
    assert!(!h.conn.report().stats.is_empty());
    h.conn.close(CloseOptions::default());
}
