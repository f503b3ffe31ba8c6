//! Typed event subscription shared by application callbacks and the
//! connection's own internal handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Accept,
    Approve,
    Open,
    /// Decoded JSON payload; non-JSON text arrives as a JSON string.
    Message(Value),
    Stats(Value),
    Close { sent_signal: bool },
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Accept => EventKind::Accept,
            ConnectionEvent::Approve => EventKind::Approve,
            ConnectionEvent::Open => EventKind::Open,
            ConnectionEvent::Message(_) => EventKind::Message,
            ConnectionEvent::Stats(_) => EventKind::Stats,
            ConnectionEvent::Close { .. } => EventKind::Close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Accept,
    Approve,
    Open,
    Message,
    Stats,
    Close,
}

pub type Callback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

pub struct Listeners {
    callbacks: Mutex<Vec<(EventKind, Callback)>>,
    stream: broadcast::Sender<ConnectionEvent>,
    silenced: AtomicBool,
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("callbacks", &self.callbacks.lock().len())
            .field("subscribers", &self.stream.receiver_count())
            .field("silenced", &self.silenced.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for Listeners {
    fn default() -> Self {
        Self::new()
    }
}

impl Listeners {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            callbacks: Mutex::new(Vec::new()),
            stream,
            silenced: AtomicBool::new(false),
        }
    }

    pub fn listen(&self, kind: EventKind, callback: Callback) {
        self.callbacks.lock().push((kind, callback));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.stream.subscribe()
    }

    /// Callbacks run on the caller's thread with no internal lock held, so
    /// they may call back into the connection (including `close`).
    pub fn fire(&self, event: ConnectionEvent) {
        if self.silenced.load(Ordering::Acquire) {
            return;
        }
        let kind = event.kind();
        let matching: Vec<Callback> = self
            .callbacks
            .lock()
            .iter()
            .filter(|(registered, _)| *registered == kind)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in matching {
            callback(&event);
        }
        let _ = self.stream.send(event);
    }

    /// Drops every callback and stops dispatching for good.
    pub fn ignore_all(&self) {
        self.silenced.store(true, Ordering::Release);
        self.callbacks.lock().clear();
    }

    pub fn is_silenced(&self) -> bool {
        self.silenced.load(Ordering::Acquire)
    }
}
