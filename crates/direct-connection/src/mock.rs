//! In-memory transport and relay for driving a [`Connection`] without a
//! network. Every call is recorded; failures can be injected per step.
//!
//! [`Connection`]: crate::Connection

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::candidate::IceCandidate;
use crate::error::{RelayError, TransportError};
use crate::signal::{OutboundSignal, SessionDescription, SignalRelay};
use crate::transport::{
    DataChannel, NativeTransport, TransportConfig, TransportEvent, TransportEvents,
    TransportFactory,
};

/// Transport operations a test can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    Create,
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
    AddCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    CreateDataChannel(String),
    Stats,
    Close,
}

#[derive(Default)]
pub struct MockTransportFactory {
    failures: Arc<Mutex<HashSet<MockStep>>>,
    stats: bool,
    configs: Mutex<Vec<TransportConfig>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transports built by this factory report statistics.
    pub fn with_stats() -> Self {
        Self {
            stats: true,
            ..Self::default()
        }
    }

    pub fn fail(&self, step: MockStep) {
        self.failures.lock().insert(step);
    }

    pub fn configs(&self) -> Vec<TransportConfig> {
        self.configs.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn last_transport(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        config: TransportConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn NativeTransport>, TransportError> {
        self.configs.lock().push(config);
        if self.failures.lock().contains(&MockStep::Create) {
            return Err(TransportError::Setup("mock refused to build".into()));
        }
        let transport = Arc::new(MockTransport {
            events,
            failures: Arc::clone(&self.failures),
            stats: self.stats,
            calls: Mutex::new(Vec::new()),
            channel: Mutex::new(None),
            samples: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

pub struct MockTransport {
    events: TransportEvents,
    failures: Arc<Mutex<HashSet<MockStep>>>,
    stats: bool,
    calls: Mutex<Vec<MockCall>>,
    channel: Mutex<Option<Arc<MockDataChannel>>>,
    samples: AtomicUsize,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::SetRemote(desc) => Some(desc.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::AddCandidate(candidate) => Some(candidate.candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> Option<Arc<MockDataChannel>> {
        self.channel.lock().clone()
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn discover(&self, candidate: IceCandidate) {
        self.emit(TransportEvent::Candidate(Some(candidate)));
    }

    /// Simulates the remote side's channel arriving (responder side).
    pub fn announce_channel(&self, label: &str) -> Arc<MockDataChannel> {
        let channel = Arc::new(MockDataChannel::new(label));
        *self.channel.lock() = Some(Arc::clone(&channel));
        self.emit(TransportEvent::ChannelAnnounced(channel.clone()));
        channel
    }

    /// Marks the channel open and notifies the connection.
    pub fn open_channel(&self) {
        if let Some(channel) = self.channel.lock().as_ref() {
            channel.open.store(true, Ordering::SeqCst);
        }
        self.emit(TransportEvent::ChannelOpen);
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }

    fn check(&self, step: MockStep) -> Result<(), TransportError> {
        if self.failures.lock().contains(&step) {
            return Err(TransportError::Description(format!("mock failure at {step:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl NativeTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(MockCall::CreateOffer);
        self.check(MockStep::CreateOffer)?;
        Ok(SessionDescription::offer("v=0\r\no=mock-offer\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(MockCall::CreateAnswer);
        self.check(MockStep::CreateAnswer)?;
        Ok(SessionDescription::answer("v=0\r\no=mock-answer\r\n"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(MockCall::SetLocal(desc));
        self.check(MockStep::SetLocal)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(MockCall::SetRemote(desc));
        self.check(MockStep::SetRemote)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(MockCall::AddCandidate(candidate));
        self.check(MockStep::AddCandidate)
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.record(MockCall::CreateDataChannel(label.to_string()));
        let channel = Arc::new(MockDataChannel::new(label));
        *self.channel.lock() = Some(Arc::clone(&channel));
        Ok(channel)
    }

    fn supports_stats(&self) -> bool {
        self.stats
    }

    async fn stats(&self) -> Result<Value, TransportError> {
        self.record(MockCall::Stats);
        let sample = self.samples.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "sample": sample }))
    }

    async fn close(&self) {
        self.record(MockCall::Close);
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockDataChannel {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Channel("mock channel is not open".into()));
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Relay that keeps every signal it is asked to send.
#[derive(Default)]
pub struct RecordingRelay {
    signals: Mutex<Vec<OutboundSignal>>,
}

impl RecordingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<OutboundSignal> {
        self.signals.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.signals.lock().iter().map(OutboundSignal::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.signals
            .lock()
            .iter()
            .filter(|signal| signal.name() == name)
            .count()
    }

    /// Candidate strings signaled so far, in order.
    pub fn candidates(&self) -> Vec<String> {
        self.signals
            .lock()
            .iter()
            .filter_map(|signal| match signal {
                OutboundSignal::Candidate { candidate, .. } => Some(candidate.candidate.clone()),
                _ => None,
            })
            .collect()
    }
}

impl SignalRelay for RecordingRelay {
    fn send(&self, signal: OutboundSignal) -> Result<(), RelayError> {
        self.signals.lock().push(signal);
        Ok(())
    }
}
