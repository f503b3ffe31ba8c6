use thiserror::Error;

/// Reason a negotiation future was rejected. Cheap to clone so every waiter
/// receives the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct NegotiationError {
    reason: String,
}

impl NegotiationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Failures raised by a native transport adapter.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("invalid candidate: {0}")]
    Candidate(String),
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("operation not supported by this transport")]
    Unsupported,
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("signal relay closed")]
    Closed,
    #[error("failed to encode signal: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signal bus error: {0}")]
    Bus(#[from] signal_bus::BusError),
}

/// Caller-facing failures of the connection facade.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("no transport has been created for this connection")]
    NoTransport,
    #[error("statistics are not available for this transport")]
    StatsUnavailable,
    #[error("connection is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_error_displays_its_reason() {
        let err = NegotiationError::new("Remote side hung up");
        assert_eq!(err.to_string(), "Remote side hung up");
        let boxed: Box<dyn std::error::Error> = Box::new(err.clone());
        assert_eq!(boxed.to_string(), err.reason());
    }
}
