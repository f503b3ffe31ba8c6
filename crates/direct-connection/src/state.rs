use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of the link this connection plays. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn from_initiator(initiator: bool) -> Self {
        if initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// Connection lifecycle. Declaration order is the negotiation order, so the
/// derived `Ord` is what the candidate gating compares against.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Started,
    InReview,
    Approved,
    Offered,
    Answered,
    Flowing,
    Ended,
    MediaError,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Ended | ConnectionState::MediaError)
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Started => "STARTED",
            ConnectionState::InReview => "IN_REVIEW",
            ConnectionState::Approved => "APPROVED",
            ConnectionState::Offered => "OFFERED",
            ConnectionState::Answered => "ANSWERED",
            ConnectionState::Flowing => "FLOWING",
            ConnectionState::Ended => "ENDED",
            ConnectionState::MediaError => "MEDIA_ERROR",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Label reported before any transport exists, whatever the internal state.
pub const BEFORE_TRANSPORT_LABEL: &str = "before";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered_by_negotiation_progress() {
        assert!(ConnectionState::Started < ConnectionState::InReview);
        assert!(ConnectionState::Approved < ConnectionState::Offered);
        assert!(ConnectionState::Offered < ConnectionState::Answered);
        assert!(ConnectionState::Answered < ConnectionState::Flowing);
        assert!(ConnectionState::Flowing < ConnectionState::Ended);
    }

    #[test]
    fn only_ended_and_media_error_are_terminal() {
        let terminal: Vec<_> = [
            ConnectionState::Started,
            ConnectionState::InReview,
            ConnectionState::Approved,
            ConnectionState::Offered,
            ConnectionState::Answered,
            ConnectionState::Flowing,
            ConnectionState::Ended,
            ConnectionState::MediaError,
        ]
        .into_iter()
        .filter(|state| state.is_terminal())
        .collect();
        assert_eq!(
            terminal,
            vec![ConnectionState::Ended, ConnectionState::MediaError]
        );
    }

    #[test]
    fn labels_match_serialized_names() {
        let json = serde_json::to_string(&ConnectionState::InReview).unwrap();
        assert_eq!(json, "\"IN_REVIEW\"");
        assert_eq!(ConnectionState::MediaError.to_string(), "MEDIA_ERROR");
    }
}
