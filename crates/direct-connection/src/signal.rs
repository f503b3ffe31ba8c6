//! Signal payloads exchanged with the relay, and the relay contract itself.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::candidate::IceCandidate;
use crate::error::RelayError;
use crate::report::UsageReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Everything the negotiation core asks the relay to carry to the remote
/// side (or, for reports, to the signaling service).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signalType", rename_all = "camelCase")]
pub enum OutboundSignal {
    Offer {
        sdp: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        sdp: SessionDescription,
        connection_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: String },
    #[serde(rename_all = "camelCase")]
    Candidate {
        candidate: IceCandidate,
        connection_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Terminate { connection_id: Option<String> },
    #[serde(rename_all = "camelCase")]
    Report {
        report: Box<UsageReport>,
        connection_id: Option<String>,
    },
}

impl OutboundSignal {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundSignal::Offer { .. } => "offer",
            OutboundSignal::Answer { .. } => "answer",
            OutboundSignal::Connected { .. } => "connected",
            OutboundSignal::Candidate { .. } => "candidate",
            OutboundSignal::Terminate { .. } => "terminate",
            OutboundSignal::Report { .. } => "report",
        }
    }

    /// Teardown signals still go out after the connection reached a
    /// terminal state; everything else is dropped at that point.
    pub fn is_teardown(&self) -> bool {
        matches!(
            self,
            OutboundSignal::Terminate { .. } | OutboundSignal::Report { .. }
        )
    }

    /// What the remote connection receives when this signal reaches it.
    /// Reports are addressed to the signaling service, not to the peer.
    pub fn into_inbound(self) -> Option<InboundSignal> {
        match self {
            OutboundSignal::Offer { sdp } => Some(InboundSignal::Offer(OfferSignal { sdp })),
            OutboundSignal::Answer { sdp, connection_id } => {
                Some(InboundSignal::Answer(AnswerSignal { sdp, connection_id }))
            }
            OutboundSignal::Connected { connection_id } => {
                Some(InboundSignal::Connected(ConnectedSignal { connection_id }))
            }
            OutboundSignal::Candidate { candidate, .. } => {
                Some(InboundSignal::Candidate(CandidateSignal {
                    candidate: Some(candidate),
                }))
            }
            OutboundSignal::Terminate { .. } => Some(InboundSignal::Bye(ByeSignal::default())),
            OutboundSignal::Report { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferSignal {
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSignal {
    pub sdp: SessionDescription,
    #[serde(default)]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedSignal {
    pub connection_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSignal {
    #[serde(default)]
    pub candidate: Option<IceCandidate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByeSignal {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Signals the demultiplexer hands to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signalType", content = "body", rename_all = "camelCase")]
pub enum InboundSignal {
    Offer(OfferSignal),
    Answer(AnswerSignal),
    Connected(ConnectedSignal),
    Candidate(CandidateSignal),
    Bye(ByeSignal),
}

/// Outbound half of the signaling transport. Sends are fire-and-forget:
/// the core never re-sends, so an `Err` is logged and dropped.
pub trait SignalRelay: Send + Sync {
    fn send(&self, signal: OutboundSignal) -> Result<(), RelayError>;
}

/// Relay that pushes signals onto an unbounded channel for someone else to
/// forward.
#[derive(Debug, Clone)]
pub struct ChannelRelay {
    tx: mpsc::UnboundedSender<OutboundSignal>,
}

impl ChannelRelay {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SignalRelay for ChannelRelay {
    fn send(&self, signal: OutboundSignal) -> Result<(), RelayError> {
        self.tx.send(signal).map_err(|_| RelayError::Closed)
    }
}
