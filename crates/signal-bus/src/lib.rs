//! Endpoint-addressed signaling bus.
//!
//! Every endpoint registers an inbox; senders deliver opaque envelopes to a
//! named endpoint. The payload format belongs to whoever sits on top of the
//! bus, the bus only routes.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

const INBOX_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    /// Groups envelopes belonging to one negotiated link.
    pub session: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("no inbox registered for endpoint {0}")]
    UnknownEndpoint(String),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub type Inbox = broadcast::Receiver<Envelope>;

pub trait SignalBus: Send + Sync {
    /// Registers `endpoint` (idempotent) and returns a fresh receiver for it.
    fn register(&self, endpoint: &str) -> Inbox;
    fn unregister(&self, endpoint: &str);
    fn deliver(&self, envelope: Envelope) -> BusResult<()>;
}

/// In-process bus, used by the loopback CLI and by tests.
#[derive(Debug, Default)]
pub struct LocalSignalBus {
    inboxes: RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl LocalSignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inboxes.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl SignalBus for LocalSignalBus {
    fn register(&self, endpoint: &str) -> Inbox {
        let mut guard = self.inboxes.write();
        guard
            .entry(endpoint.to_string())
            .or_insert_with(|| broadcast::channel(INBOX_CAPACITY).0)
            .subscribe()
    }

    fn unregister(&self, endpoint: &str) {
        self.inboxes.write().remove(endpoint);
    }

    fn deliver(&self, envelope: Envelope) -> BusResult<()> {
        let sender = self
            .inboxes
            .read()
            .get(&envelope.to)
            .cloned()
            .ok_or_else(|| BusError::UnknownEndpoint(envelope.to.clone()))?;
        trace!(
            target = "signal_bus",
            from = %envelope.from,
            to = %envelope.to,
            session = %envelope.session,
            payload_len = envelope.payload.len(),
            "delivering envelope"
        );
        sender.send(envelope).map(|_| ()).map_err(|_| BusError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(to: &str, body: &'static [u8]) -> Envelope {
        Envelope {
            from: "alice".into(),
            to: to.into(),
            session: "s-1".into(),
            payload: Bytes::from_static(body),
        }
    }

    #[tokio::test]
    async fn delivers_to_registered_inbox() {
        let bus = LocalSignalBus::new();
        let mut inbox = bus.register("bob");
        bus.deliver(envelope("bob", b"offer")).expect("deliver ok");
        let msg = inbox.recv().await.expect("receive ok");
        assert_eq!(msg.from, "alice");
        assert_eq!(msg.session, "s-1");
        assert_eq!(msg.payload, Bytes::from_static(b"offer"));
    }

    #[test]
    fn unknown_endpoint_is_an_error() {
        let bus = LocalSignalBus::new();
        let err = bus.deliver(envelope("nobody", b"x")).unwrap_err();
        assert!(matches!(err, BusError::UnknownEndpoint(name) if name == "nobody"));
    }

    #[test]
    fn dropped_inbox_reports_closed() {
        let bus = LocalSignalBus::new();
        drop(bus.register("bob"));
        let err = bus.deliver(envelope("bob", b"x")).unwrap_err();
        assert!(matches!(err, BusError::Closed));
    }

    #[test]
    fn unregister_removes_endpoint() {
        let bus = LocalSignalBus::new();
        let _a = bus.register("alice");
        let _b = bus.register("bob");
        bus.unregister("alice");
        assert_eq!(bus.endpoints(), vec!["bob".to_string()]);
    }
}
