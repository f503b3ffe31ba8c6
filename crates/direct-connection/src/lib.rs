//! Offer/answer negotiation for one peer data-channel link: lifecycle state
//! machine, trickle-candidate queuing, a usage report flushed at close, and
//! the facade applications drive.

pub mod bus_relay;
pub mod candidate;
pub mod config;
pub mod connection;
pub mod deferred;
pub mod error;
pub mod event;
pub mod mock;
pub mod negotiation;
pub mod registry;
pub mod report;
pub mod signal;
pub mod state;
pub mod transport;
pub mod webrtc_transport;

pub use bus_relay::{pump_inbox, BusRelay};
pub use candidate::IceCandidate;
pub use config::{ConnectionSettings, IceServer};
pub use connection::{
    AcceptOptions, CloseOptions, Connection, ConnectionParams, OutgoingMessage, StatsOptions,
};
pub use error::{ConfigError, ConnectionError, NegotiationError, RelayError, TransportError};
pub use event::{Callback, ConnectionEvent, EventKind};
pub use registry::ConnectionRegistry;
pub use report::UsageReport;
pub use signal::{
    AnswerSignal, ByeSignal, CandidateSignal, ConnectedSignal, InboundSignal, OfferSignal,
    OutboundSignal, SessionDescription, SignalRelay,
};
pub use state::{ConnectionState, Role};
pub use transport::{DataChannel, NativeTransport, TransportEvent, TransportFactory};
pub use webrtc_transport::WebRtcTransportFactory;
