//! Signal relay over a [`SignalBus`]: outbound signals travel as JSON
//! envelopes, and [`pump_inbox`] feeds arriving envelopes to the registry.

use std::sync::Arc;

use bytes::Bytes;
use signal_bus::{Envelope, Inbox, SignalBus};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace, warn};

use crate::error::RelayError;
use crate::registry::ConnectionRegistry;
use crate::signal::{OutboundSignal, SignalRelay};

#[derive(Clone)]
pub struct BusRelay {
    bus: Arc<dyn SignalBus>,
    from: String,
    to: String,
    session: String,
    reports_to: Option<String>,
}

impl BusRelay {
    pub fn new(
        bus: Arc<dyn SignalBus>,
        from: impl Into<String>,
        to: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            from: from.into(),
            to: to.into(),
            session: session.into(),
            reports_to: None,
        }
    }

    /// Usage reports go to `endpoint` instead of being dropped.
    pub fn with_reports_to(mut self, endpoint: impl Into<String>) -> Self {
        self.reports_to = Some(endpoint.into());
        self
    }
}

impl SignalRelay for BusRelay {
    fn send(&self, signal: OutboundSignal) -> Result<(), RelayError> {
        let to = match (&signal, &self.reports_to) {
            (OutboundSignal::Report { .. }, Some(endpoint)) => endpoint.clone(),
            (OutboundSignal::Report { .. }, None) => {
                debug!(target = "direct_connection::bus_relay", session = %self.session, "no report endpoint; dropping usage report");
                return Ok(());
            }
            _ => self.to.clone(),
        };
        let payload = serde_json::to_vec(&signal)?;
        self.bus.deliver(Envelope {
            from: self.from.clone(),
            to,
            session: self.session.clone(),
            payload: Bytes::from(payload),
        })?;
        Ok(())
    }
}

/// Decodes envelopes from `inbox` and dispatches them until the bus closes.
pub async fn pump_inbox(mut inbox: Inbox, registry: Arc<ConnectionRegistry>) {
    loop {
        let envelope = match inbox.recv().await {
            Ok(envelope) => envelope,
            Err(RecvError::Lagged(skipped)) => {
                warn!(target = "direct_connection::bus_relay", skipped, "inbox lagged; signals lost");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let signal = match serde_json::from_slice::<OutboundSignal>(&envelope.payload) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(target = "direct_connection::bus_relay", from = %envelope.from, error = %err, "undecodable signal");
                continue;
            }
        };
        trace!(target = "direct_connection::bus_relay", from = %envelope.from, signal = signal.name(), "signal received");
        match signal.into_inbound() {
            Some(inbound) => {
                registry.dispatch(&envelope.session, inbound);
            }
            None => debug!(target = "direct_connection::bus_relay", "report reached a peer inbox; ignoring"),
        }
    }
}
