//! Contract between the negotiation core and a native peer transport.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::candidate::IceCandidate;
use crate::config::IceServer;
use crate::error::TransportError;
use crate::signal::SessionDescription;
use crate::state::Role;

/// Notifications a transport pushes back to its owning connection.
#[derive(Clone)]
pub enum TransportEvent {
    /// `None` marks the end of local gathering.
    Candidate(Option<IceCandidate>),
    NegotiationNeeded,
    /// A data channel created by the remote side was announced.
    ChannelAnnounced(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelMessage(String),
    ChannelError(String),
    ChannelClose,
    /// The native connection gave up (for example ICE failed).
    Failed(String),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Candidate(candidate) => {
                f.debug_tuple("Candidate").field(candidate).finish()
            }
            TransportEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            TransportEvent::ChannelAnnounced(channel) => f
                .debug_tuple("ChannelAnnounced")
                .field(&channel.label())
                .finish(),
            TransportEvent::ChannelOpen => f.write_str("ChannelOpen"),
            TransportEvent::ChannelMessage(text) => {
                f.debug_tuple("ChannelMessage").field(&text.len()).finish()
            }
            TransportEvent::ChannelError(err) => f.debug_tuple("ChannelError").field(err).finish(),
            TransportEvent::ChannelClose => f.write_str("ChannelClose"),
            TransportEvent::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// What a factory needs to build a transport for one connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub role: Role,
    pub ice_servers: Vec<IceServer>,
    pub force_relay: bool,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: TransportConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn NativeTransport>, TransportError>;
}

/// Native peer transport. Every async method completes (or fails) exactly
/// once; the connection serializes calls so no two run at the same time.
#[async_trait]
pub trait NativeTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    fn supports_stats(&self) -> bool {
        false
    }

    async fn stats(&self) -> Result<Value, TransportError> {
        Err(TransportError::Unsupported)
    }

    async fn close(&self);
}

/// Message channel carried by the transport.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Queues `text` for delivery and returns without waiting for it.
    fn send_text(&self, text: String) -> Result<(), TransportError>;
    async fn close(&self);
}
