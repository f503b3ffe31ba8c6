//! Explicit lookup of live connections by session id. Owned by the
//! application and handed to whatever demultiplexes inbound signals.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::event::{ConnectionEvent, EventKind};
use crate::signal::InboundSignal;

type Entries = RwLock<HashMap<String, Connection>>;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Arc<Entries>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `connection` under its session id, replacing any previous
    /// entry for that session. The entry is dropped again when the
    /// connection closes, whoever closed it.
    pub fn insert(&self, connection: Connection) -> Option<Connection> {
        let session_id = connection.session_id().to_string();
        let id = connection.id().to_string();
        let entries: Weak<Entries> = Arc::downgrade(&self.connections);
        {
            let session_id = session_id.clone();
            let id = id.clone();
            connection.listen(
                EventKind::Close,
                Arc::new(move |_: &ConnectionEvent| {
                    if let Some(entries) = entries.upgrade() {
                        evict(&entries, &session_id, &id);
                    }
                }),
            );
        }
        let terminal = connection.state().is_terminal();
        let previous = self.connections.write().insert(session_id.clone(), connection);
        if terminal {
            evict(&self.connections, &session_id, &id);
        }
        previous
    }

    pub fn remove(&self, session_id: &str) -> Option<Connection> {
        self.connections.write().remove(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Connection> {
        self.connections.read().get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Hands `signal` to the connection registered for `session_id`.
    /// Connections that reached a terminal state are dropped afterwards.
    /// Returns `false` when nothing is registered for the session.
    pub fn dispatch(&self, session_id: &str, signal: InboundSignal) -> bool {
        let Some(connection) = self.get(session_id) else {
            debug!(target = "direct_connection::registry", session = %session_id, "no connection for signal");
            return false;
        };
        trace!(target = "direct_connection::registry", session = %session_id, "dispatching signal");
        connection.handle_signal(signal);
        if connection.state().is_terminal() {
            evict(&self.connections, session_id, connection.id());
        }
        true
    }
}

// A replacement registered under the same session must survive the old
// connection's close.
fn evict(entries: &Entries, session_id: &str, id: &str) {
    let mut entries = entries.write();
    if entries.get(session_id).is_some_and(|current| current.id() == id) {
        entries.remove(session_id);
        trace!(target = "direct_connection::registry", session = %session_id, "connection closed; unregistered");
    }
}
