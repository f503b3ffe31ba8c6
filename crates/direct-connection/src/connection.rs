//! The connection facade: one peer link from creation to teardown.
//!
//! Every handler takes the core lock, decides what must happen, and returns a
//! list of [`Effect`]s. Effects (signals, events, settlements, handle
//! release) run after the lock is dropped, in the order they were produced,
//! so callbacks may call straight back into the connection. Calls into the
//! native transport go through a per-connection worker that runs them one at
//! a time, in submission order.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::candidate::{
    filter_local, validate_remote, CandidateQueue, IceCandidate, LocalCandidate, RemoteCandidate,
};
use crate::config::{ConnectionSettings, IceServer};
use crate::deferred::{self, Deferred};
use crate::error::{ConnectionError, NegotiationError, TransportError};
use crate::event::{Callback, ConnectionEvent, EventKind, Listeners};
use crate::negotiation::{advance, procedure_for, Procedure, Trigger};
use crate::report::UsageReport;
use crate::signal::{
    AnswerSignal, ByeSignal, CandidateSignal, ConnectedSignal, InboundSignal, OfferSignal,
    OutboundSignal, SessionDescription, SignalRelay,
};
use crate::state::{ConnectionState, Role, BEFORE_TRANSPORT_LABEL};
use crate::transport::{
    DataChannel, NativeTransport, TransportConfig, TransportEvent, TransportFactory,
};

pub const HUNG_UP_BEFORE_APPROVAL: &str = "Call hung up before approval.";
pub const REMOTE_HUNG_UP: &str = "Remote side hung up";
pub const ANSWERED_ELSEWHERE: &str = "Answered elsewhere.";
const OFFER_IN_BAD_STATE: &str = "Received offer in a bad state.";
const CLOSED_BEFORE_NEGOTIATED: &str = "Connection closed before negotiation completed.";
const MIN_STATS_INTERVAL: Duration = Duration::from_millis(1);

/// Everything needed to build a [`Connection`].
pub struct ConnectionParams {
    pub role: Role,
    /// Key the demultiplexer routes inbound signals by.
    pub session_id: String,
    pub relay: Arc<dyn SignalRelay>,
    pub factory: Arc<dyn TransportFactory>,
    pub settings: ConnectionSettings,
    /// Connection id assigned by the signaling service, when already known.
    pub connection_id: Option<String>,
    /// This endpoint's own connection id, checked against `connected`.
    pub local_connection_id: Option<String>,
}

impl ConnectionParams {
    pub fn new(
        role: Role,
        session_id: impl Into<String>,
        relay: Arc<dyn SignalRelay>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            role,
            session_id: session_id.into(),
            relay,
            factory,
            settings: ConnectionSettings::default(),
            connection_id: None,
            local_connection_id: None,
        }
    }

    pub fn with_settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_connection_id(mut self, id: impl Into<String>) -> Self {
        self.connection_id = Some(id.into());
        self
    }

    pub fn with_local_connection_id(mut self, id: impl Into<String>) -> Self {
        self.local_connection_id = Some(id.into());
        self
    }
}

#[derive(Clone, Default)]
pub struct AcceptOptions {
    pub on_open: Option<Callback>,
    pub on_close: Option<Callback>,
    pub on_message: Option<Callback>,
    /// Overrides the configured relay-only policy.
    pub force_relay: Option<bool>,
    /// Overrides the configured ICE servers.
    pub ice_servers: Option<Vec<IceServer>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CloseOptions {
    /// Whether to tell the remote side. Defaults to `true`.
    pub signal: Option<bool>,
}

impl CloseOptions {
    pub fn silent() -> Self {
        Self {
            signal: Some(false),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsOptions {
    pub interval: Option<Duration>,
}

/// Payload for [`Connection::send_message`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingMessage {
    /// Sent as `{"message": text}`.
    Text(String),
    /// Sent as-is.
    Object(Value),
}

impl OutgoingMessage {
    fn into_value(self) -> Value {
        match self {
            OutgoingMessage::Text(text) => json!({ "message": text }),
            OutgoingMessage::Object(value) => value,
        }
    }
}

impl From<&str> for OutgoingMessage {
    fn from(text: &str) -> Self {
        OutgoingMessage::Text(text.to_string())
    }
}

impl From<String> for OutgoingMessage {
    fn from(text: String) -> Self {
        OutgoingMessage::Text(text)
    }
}

impl From<Value> for OutgoingMessage {
    fn from(value: Value) -> Self {
        OutgoingMessage::Object(value)
    }
}

/// Transport work, run strictly in submission order.
#[derive(Debug)]
enum Op {
    CreateOffer,
    AnswerRemoteOffer(SessionDescription),
    ApplyRemoteAnswer(SessionDescription),
    AddRemoteCandidate(IceCandidate),
}

enum Settlement {
    Approved(Result<(), NegotiationError>),
    Offer(Result<SessionDescription, NegotiationError>),
    Answer(Result<SessionDescription, NegotiationError>),
}

enum Effect {
    Signal(OutboundSignal),
    Emit(ConnectionEvent),
    Settle(Settlement),
    ClearListeners,
    Release {
        transport: Option<Arc<dyn NativeTransport>>,
        channel: Option<Arc<dyn DataChannel>>,
        tasks: Vec<JoinHandle<()>>,
    },
}

struct Core {
    state: ConnectionState,
    settings: ConnectionSettings,
    connection_id: Option<String>,
    local_connection_id: Option<String>,
    queue: CandidateQueue,
    report: UsageReport,
    transport: Option<Arc<dyn NativeTransport>>,
    channel: Option<Arc<dyn DataChannel>>,
    ops: Option<mpsc::UnboundedSender<Op>>,
    tasks: Vec<JoinHandle<()>>,
    accepting: bool,
    transport_created: bool,
    approved: bool,
    offer_requested: bool,
    offer_received: bool,
    answer_received: bool,
}

impl Core {
    fn advance(&mut self, id: &str, trigger: Trigger) -> bool {
        match advance(self.state, trigger) {
            Some(next) if next != self.state => {
                info!(
                    target = "direct_connection::connection",
                    connection = %id,
                    from = %self.state,
                    to = %next,
                    "state changed"
                );
                self.state = next;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    fn submit(&self, op: Op) {
        match &self.ops {
            Some(ops) => {
                if ops.send(op).is_err() {
                    debug!(target = "direct_connection::connection", "transport worker is gone");
                }
            }
            None => debug!(target = "direct_connection::connection", op = ?op, "no transport to run op on"),
        }
    }

    // Until the queue has been drained once, later candidates line up behind
    // the held ones even if the state already allows them through.
    fn holds_outbound(&self, procedure: &dyn Procedure) -> bool {
        procedure.holds_outbound(self.state)
            || (procedure.role().is_initiator() && !self.queue.is_drained())
    }

    fn holds_inbound(&self, procedure: &dyn Procedure) -> bool {
        procedure.holds_inbound(self.state) || !self.queue.is_drained()
    }

    /// Releases every held candidate: outbound ones become signals, inbound
    /// ones are queued for the transport behind whatever is already pending.
    fn drain_queues(&mut self, effects: &mut Vec<Effect>) {
        let drained = self.queue.drain();
        for candidate in drained.outbound {
            self.report.candidates_sent.push(candidate.clone());
            effects.push(Effect::Signal(OutboundSignal::Candidate {
                candidate,
                connection_id: self.connection_id.clone(),
            }));
        }
        for candidate in drained.inbound {
            self.submit(Op::AddRemoteCandidate(candidate));
        }
    }
}

struct Shared {
    id: String,
    session_id: String,
    role: Role,
    procedure: &'static dyn Procedure,
    relay: Arc<dyn SignalRelay>,
    factory: Arc<dyn TransportFactory>,
    core: Mutex<Core>,
    listeners: Listeners,
    approved: Deferred<()>,
    offer: Deferred<SessionDescription>,
    answer: Deferred<SessionDescription>,
}

/// Handle to one peer link. Cheap to clone; every clone drives the same
/// connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("session_id", &self.shared.session_id)
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(params: ConnectionParams) -> Self {
        let core = Core {
            state: ConnectionState::Started,
            settings: params.settings,
            connection_id: params.connection_id,
            local_connection_id: params.local_connection_id,
            queue: CandidateQueue::new(),
            report: UsageReport::default(),
            transport: None,
            channel: None,
            ops: None,
            tasks: Vec::new(),
            accepting: false,
            transport_created: false,
            approved: false,
            offer_requested: false,
            offer_received: false,
            answer_received: false,
        };
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4().to_string(),
                session_id: params.session_id,
                role: params.role,
                procedure: procedure_for(params.role),
                relay: params.relay,
                factory: params.factory,
                core: Mutex::new(core),
                listeners: Listeners::new(),
                approved: Deferred::new(),
                offer: Deferred::new(),
                answer: Deferred::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn is_initiator(&self) -> bool {
        self.shared.role.is_initiator()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.shared.core.lock().connection_id.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().state
    }

    /// Lifecycle label, or `"before"` while no transport exists.
    pub fn state_label(&self) -> &'static str {
        let core = self.shared.core.lock();
        if core.transport_created {
            core.state.label()
        } else {
            BEFORE_TRANSPORT_LABEL
        }
    }

    /// Snapshot of the usage report as it stands.
    pub fn report(&self) -> UsageReport {
        self.shared.core.lock().report.clone()
    }

    pub fn listen(&self, kind: EventKind, callback: Callback) {
        self.shared.listeners.listen(kind, callback);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.listeners.subscribe()
    }

    pub async fn approved(&self) -> Result<(), NegotiationError> {
        self.shared.approved.wait().await
    }

    pub async fn offer_ready(&self) -> Result<SessionDescription, NegotiationError> {
        self.shared.offer.wait().await
    }

    pub async fn answer_ready(&self) -> Result<SessionDescription, NegotiationError> {
        self.shared.answer.wait().await
    }

    /// Both final descriptions, once the offer/answer exchange is done.
    pub async fn negotiated(
        &self,
    ) -> Result<(SessionDescription, SessionDescription), NegotiationError> {
        deferred::join(&self.shared.offer, &self.shared.answer).await
    }

    /// Creates the transport (and, for the initiator, the local channel).
    /// A second call only updates listeners and transport settings.
    pub async fn accept(&self, options: AcceptOptions) -> Result<(), ConnectionError> {
        let shared = &self.shared;
        for (kind, callback) in [
            (EventKind::Open, options.on_open),
            (EventKind::Close, options.on_close),
            (EventKind::Message, options.on_message),
        ] {
            if let Some(callback) = callback {
                shared.listeners.listen(kind, callback);
            }
        }

        let (config, label) = {
            let mut core = shared.core.lock();
            if let Some(force_relay) = options.force_relay {
                core.settings.force_relay = force_relay;
            }
            if let Some(servers) = options.ice_servers {
                core.settings.ice_servers = servers;
            }
            if core.state.is_terminal() {
                return Err(ConnectionError::Closed);
            }
            if core.accepting {
                debug!(target = "direct_connection::connection", connection = %shared.id, "accept called again; settings updated");
                return Ok(());
            }
            core.accepting = true;
            core.advance(&shared.id, Trigger::Accept);
            core.report.mark_started();
            (
                TransportConfig {
                    role: shared.role,
                    ice_servers: core.settings.ice_servers.clone(),
                    force_relay: core.settings.force_relay,
                },
                core.settings.data_channel_label.clone(),
            )
        };
        shared.apply(vec![Effect::Emit(ConnectionEvent::Accept)]);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match shared.factory.create(config, events_tx).await {
            Ok(transport) => transport,
            Err(err) => {
                shared.fail(Trigger::TransportFailed, "Could not create transport.", &err);
                return Err(err.into());
            }
        };
        let channel = if shared.role.is_initiator() {
            match transport.create_data_channel(&label).await {
                Ok(channel) => Some(channel),
                Err(err) => {
                    transport.close().await;
                    shared.fail(Trigger::TransportFailed, "Could not create data channel.", &err);
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(shared);
        {
            let mut core = shared.core.lock();
            if core.state.is_terminal() {
                drop(core);
                shared.apply(vec![Effect::Release {
                    transport: Some(transport),
                    channel,
                    tasks: Vec::new(),
                }]);
                return Err(ConnectionError::Closed);
            }
            core.transport = Some(Arc::clone(&transport));
            core.channel = channel;
            core.ops = Some(ops_tx);
            core.transport_created = true;
            core.tasks
                .push(tokio::spawn(run_ops(weak.clone(), Arc::clone(&transport), ops_rx)));
            core.tasks
                .push(tokio::spawn(pump_transport_events(weak.clone(), events_rx)));
            if core.offer_requested {
                core.offer_requested = false;
                core.submit(Op::CreateOffer);
            }
            if !shared.role.is_initiator() {
                let approved = shared.approved.clone();
                let offer = shared.offer.clone();
                core.tasks.push(tokio::spawn(async move {
                    match deferred::join(&approved, &offer).await {
                        Ok(((), offer)) => {
                            if let Some(shared) = weak.upgrade() {
                                shared.remote_offer_ready(offer);
                            }
                        }
                        Err(err) => {
                            debug!(target = "direct_connection::connection", reason = %err, "negotiation abandoned before answering");
                        }
                    }
                }));
            }
        }
        info!(target = "direct_connection::connection", connection = %shared.id, role = ?shared.role, "transport created");
        Ok(())
    }

    /// Approves the connection. The initiator starts generating its offer
    /// (or does so as soon as `accept` has built the transport).
    pub fn approve(&self) {
        let shared = &self.shared;
        let effects = {
            let mut core = shared.core.lock();
            if core.state.is_terminal() {
                trace!(target = "direct_connection::connection", "approve after close ignored");
                return;
            }
            if core.approved {
                debug!(target = "direct_connection::connection", "already approved");
                return;
            }
            core.approved = true;
            core.advance(&shared.id, Trigger::Approve);
            if shared.procedure.offers_on_approve() {
                if core.ops.is_some() {
                    core.submit(Op::CreateOffer);
                } else {
                    core.offer_requested = true;
                }
            }
            vec![
                Effect::Emit(ConnectionEvent::Approve),
                Effect::Settle(Settlement::Approved(Ok(()))),
            ]
        };
        shared.apply(effects);
    }

    pub fn close(&self, options: CloseOptions) {
        self.shared.close_with(options, Trigger::Close);
    }

    /// Same as [`Connection::close`]; reads better before negotiation is done.
    pub fn reject(&self, options: CloseOptions) {
        self.close(options);
    }

    /// Sends `message` over the data channel without waiting for delivery.
    pub fn send_message(&self, message: impl Into<OutgoingMessage>) -> Result<(), ConnectionError> {
        let channel = self
            .shared
            .core
            .lock()
            .channel
            .clone()
            .ok_or(ConnectionError::ChannelNotOpen)?;
        if !channel.is_open() {
            return Err(ConnectionError::ChannelNotOpen);
        }
        let text = serde_json::to_string(&message.into().into_value())?;
        channel.send_text(text)?;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        let core = self.shared.core.lock();
        if core.transport.is_none() || core.state.is_terminal() {
            return false;
        }
        core.channel.as_ref().is_some_and(|channel| channel.is_open())
    }

    /// Starts periodic sampling of transport statistics once both
    /// descriptions are settled. Samples arrive as `stats` events and are
    /// appended to the usage report; sampling stops on close. Must be called
    /// from within a Tokio runtime.
    pub fn get_stats(&self, options: StatsOptions) -> Result<(), ConnectionError> {
        let shared = &self.shared;
        let mut core = shared.core.lock();
        let transport = core.transport.clone().ok_or(ConnectionError::NoTransport)?;
        if !transport.supports_stats() {
            return Err(ConnectionError::StatsUnavailable);
        }
        let interval = options
            .interval
            .unwrap_or_else(|| core.settings.stats_interval())
            .max(MIN_STATS_INTERVAL);
        let weak = Arc::downgrade(shared);
        let offer = shared.offer.clone();
        let answer = shared.answer.clone();
        core.tasks.push(tokio::spawn(async move {
            if let Err(err) = deferred::join(&offer, &answer).await {
                debug!(target = "direct_connection::connection", reason = %err, "no statistics without a negotiated session");
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let sample = match transport.stats().await {
                    Ok(sample) => sample,
                    Err(err) => {
                        warn!(target = "direct_connection::connection", error = %err, "failed to sample statistics");
                        continue;
                    }
                };
                let Some(shared) = weak.upgrade() else { break };
                if !shared.record_stats(sample) {
                    break;
                }
            }
        }));
        Ok(())
    }

    /// Remote offer arrived (responder only).
    pub fn set_offer(&self, signal: OfferSignal) {
        let shared = &self.shared;
        let effects = {
            let mut core = shared.core.lock();
            if core.state.is_terminal() {
                trace!(target = "direct_connection::connection", "offer after close ignored");
                return;
            }
            if !shared.procedure.accepts_remote_offer() {
                warn!(target = "direct_connection::connection", connection = %shared.id, "{OFFER_IN_BAD_STATE}");
                vec![
                    Effect::Settle(Settlement::Offer(Err(NegotiationError::new(
                        OFFER_IN_BAD_STATE,
                    )))),
                    Effect::Signal(OutboundSignal::Terminate {
                        connection_id: core.connection_id.clone(),
                    }),
                ]
            } else if core.offer_received {
                debug!(target = "direct_connection::connection", "Ignoring duplicate offer.");
                return;
            } else {
                core.offer_received = true;
                core.report.record_received_sdp(&signal.sdp);
                core.advance(&shared.id, Trigger::RemoteOfferReceived);
                vec![Effect::Settle(Settlement::Offer(Ok(signal.sdp)))]
            }
        };
        shared.apply(effects);
    }

    /// Remote answer arrived (initiator only). Only the first is applied.
    pub fn set_answer(&self, signal: AnswerSignal) {
        let shared = &self.shared;
        let effects = {
            let mut core = shared.core.lock();
            if core.state.is_terminal() {
                trace!(target = "direct_connection::connection", "answer after close ignored");
                return;
            }
            if !shared.procedure.accepts_remote_answer() {
                warn!(target = "direct_connection::connection", connection = %shared.id, "responder received an answer; ignoring");
                return;
            }
            if core.answer_received {
                debug!(target = "direct_connection::connection", "Ignoring duplicate answer.");
                return;
            }
            if core.ops.is_none() {
                warn!(target = "direct_connection::connection", "answer arrived before the transport exists; ignoring");
                return;
            }
            if advance(core.state, Trigger::RemoteAnswerReceived).is_none() {
                warn!(target = "direct_connection::connection", state = %core.state, "Received answer in a bad state.");
                return;
            }
            core.answer_received = true;
            core.advance(&shared.id, Trigger::RemoteAnswerReceived);
            core.report.record_received_sdp(&signal.sdp);
            if signal.connection_id.is_some() {
                core.connection_id = signal.connection_id;
            }

            let mut effects = Vec::new();
            match core.connection_id.clone() {
                Some(connection_id) => {
                    effects.push(Effect::Signal(OutboundSignal::Connected { connection_id }))
                }
                None => debug!(target = "direct_connection::connection", "answer carried no connection id"),
            }
            core.submit(Op::ApplyRemoteAnswer(signal.sdp));
            effects
        };
        shared.apply(effects);
    }

    pub fn add_remote_candidate(&self, signal: CandidateSignal) {
        let shared = &self.shared;
        let mut core = shared.core.lock();
        if core.state.is_terminal() {
            trace!(target = "direct_connection::connection", "candidate after close ignored");
            return;
        }
        match validate_remote(signal.candidate) {
            RemoteCandidate::Empty => {
                trace!(target = "direct_connection::connection", "remote side finished gathering");
            }
            RemoteCandidate::Malformed(candidate) => {
                warn!(
                    target = "direct_connection::connection",
                    candidate = %candidate.candidate,
                    "discarding remote candidate without sdpMLineIndex"
                );
            }
            RemoteCandidate::Usable(candidate) => {
                if core.holds_inbound(shared.procedure) {
                    trace!(target = "direct_connection::connection", candidate = %candidate.candidate, "holding remote candidate");
                    core.queue.hold_inbound(candidate);
                } else {
                    core.submit(Op::AddRemoteCandidate(candidate));
                }
            }
        }
    }

    /// The signaling service confirmed which endpoint's answer won.
    pub fn set_connected(&self, signal: ConnectedSignal) {
        if self.shared.role.is_initiator() {
            debug!(target = "direct_connection::connection", "initiator ignores connected");
            return;
        }
        let lost = {
            let mut core = self.shared.core.lock();
            match &core.local_connection_id {
                Some(local) if *local != signal.connection_id => {
                    core.report.set_stop_reason(ANSWERED_ELSEWHERE);
                    true
                }
                _ => false,
            }
        };
        if lost {
            info!(target = "direct_connection::connection", connection = %self.shared.id, "answered elsewhere; closing");
            self.close(CloseOptions::silent());
        }
    }

    pub fn set_bye(&self, signal: ByeSignal) {
        let reason = signal.reason.unwrap_or_else(|| REMOTE_HUNG_UP.to_string());
        self.shared.core.lock().report.set_stop_reason(reason);
        self.close(CloseOptions::silent());
    }

    /// Routes one inbound signal to the matching entry point.
    pub fn handle_signal(&self, signal: InboundSignal) {
        match signal {
            InboundSignal::Offer(offer) => self.set_offer(offer),
            InboundSignal::Answer(answer) => self.set_answer(answer),
            InboundSignal::Connected(connected) => self.set_connected(connected),
            InboundSignal::Candidate(candidate) => self.add_remote_candidate(candidate),
            InboundSignal::Bye(bye) => self.set_bye(bye),
        }
    }
}

impl Shared {
    fn is_terminal(&self) -> bool {
        self.core.lock().state.is_terminal()
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Signal(signal) => self.send_signal(signal),
                Effect::Emit(event) => self.listeners.fire(event),
                Effect::Settle(settlement) => {
                    match settlement {
                        Settlement::Approved(Ok(())) => self.approved.resolve(()),
                        Settlement::Approved(Err(err)) => self.approved.reject(err),
                        Settlement::Offer(Ok(desc)) => self.offer.resolve(desc),
                        Settlement::Offer(Err(err)) => self.offer.reject(err),
                        Settlement::Answer(Ok(desc)) => self.answer.resolve(desc),
                        Settlement::Answer(Err(err)) => self.answer.reject(err),
                    };
                }
                Effect::ClearListeners => self.listeners.ignore_all(),
                Effect::Release {
                    transport,
                    channel,
                    tasks,
                } => release(transport, channel, tasks),
            }
        }
    }

    fn send_signal(&self, signal: OutboundSignal) {
        if !signal.is_teardown() && self.is_terminal() {
            trace!(target = "direct_connection::connection", signal = signal.name(), "dropping signal after close");
            return;
        }
        let name = signal.name();
        debug!(target = "direct_connection::connection", connection = %self.id, signal = name, "signaling");
        if let Err(err) = self.relay.send(signal) {
            warn!(target = "direct_connection::connection", signal = name, error = %err, "failed to relay signal");
        }
    }

    fn close_with(&self, options: CloseOptions, trigger: Trigger) {
        let effects = {
            let mut core = self.core.lock();
            if core.state.is_terminal() {
                trace!(target = "direct_connection::connection", "close got called twice");
                return;
            }
            let prior = core.state;
            core.advance(&self.id, trigger);

            let sent_signal =
                options.signal.unwrap_or(true) && !self.procedure.suppresses_terminate(prior);
            let rejection = if core.report.connection_stopped_reason.is_empty() {
                NegotiationError::new(CLOSED_BEFORE_NEGOTIATED)
            } else {
                NegotiationError::new(core.report.connection_stopped_reason.clone())
            };

            let mut effects = vec![Effect::Settle(Settlement::Approved(Err(
                NegotiationError::new(HUNG_UP_BEFORE_APPROVAL),
            )))];
            if sent_signal {
                effects.push(Effect::Signal(OutboundSignal::Terminate {
                    connection_id: core.connection_id.clone(),
                }));
            }
            core.report.mark_stopped();
            effects.push(Effect::Signal(OutboundSignal::Report {
                report: Box::new(core.report.clone()),
                connection_id: core.connection_id.clone(),
            }));
            effects.push(Effect::Settle(Settlement::Offer(Err(rejection.clone()))));
            effects.push(Effect::Settle(Settlement::Answer(Err(rejection))));
            effects.push(Effect::Emit(ConnectionEvent::Close { sent_signal }));
            effects.push(Effect::ClearListeners);

            core.queue.clear();
            core.ops = None;
            effects.push(Effect::Release {
                transport: core.transport.take(),
                channel: core.channel.take(),
                tasks: std::mem::take(&mut core.tasks),
            });
            info!(
                target = "direct_connection::connection",
                connection = %self.id,
                from = %prior,
                sent_signal,
                reason = %core.report.connection_stopped_reason,
                "connection closed"
            );
            effects
        };
        self.apply(effects);
    }

    /// Records `reason` and tears the connection down. Failures are never
    /// retried.
    fn fail(&self, trigger: Trigger, reason: &str, err: &TransportError) {
        error!(target = "direct_connection::connection", connection = %self.id, error = %err, "{reason}");
        self.core.lock().report.set_stop_reason(reason);
        self.close_with(CloseOptions::default(), trigger);
    }

    fn remote_offer_ready(&self, offer: SessionDescription) {
        let core = self.core.lock();
        if core.state.is_terminal() {
            return;
        }
        core.submit(Op::AnswerRemoteOffer(offer));
    }

    fn record_stats(&self, sample: Value) -> bool {
        {
            let mut core = self.core.lock();
            if core.state.is_terminal() {
                return false;
            }
            core.report.stats.push(sample.clone());
        }
        self.listeners.fire(ConnectionEvent::Stats(sample));
        true
    }

    async fn run_op(&self, transport: &dyn NativeTransport, op: Op) {
        match op {
            Op::CreateOffer => {
                let offer = match transport.create_offer().await {
                    Ok(offer) => offer,
                    Err(err) => return self.fail(Trigger::Close, "Error creating SDP offer.", &err),
                };
                if let Err(err) = transport.set_local_description(offer.clone()).await {
                    return self.fail(Trigger::Close, "setLocalDescription failed at offer.", &err);
                }
                let effects = {
                    let mut core = self.core.lock();
                    if core.state.is_terminal() {
                        return;
                    }
                    core.advance(&self.id, Trigger::LocalOfferApplied);
                    core.report.record_sent_sdp(&offer);
                    vec![
                        Effect::Signal(OutboundSignal::Offer { sdp: offer.clone() }),
                        Effect::Settle(Settlement::Offer(Ok(offer))),
                    ]
                };
                self.apply(effects);
            }
            Op::AnswerRemoteOffer(offer) => {
                if let Err(err) = transport.set_remote_description(offer).await {
                    return self.fail(Trigger::Close, "setRemoteDescription failed at offer.", &err);
                }
                {
                    let mut core = self.core.lock();
                    if core.state.is_terminal() {
                        return;
                    }
                    core.advance(&self.id, Trigger::RemoteOfferApplied);
                }
                let answer = match transport.create_answer().await {
                    Ok(answer) => answer,
                    Err(err) => return self.fail(Trigger::Close, "Error creating SDP answer.", &err),
                };
                if let Err(err) = transport.set_local_description(answer.clone()).await {
                    return self.fail(Trigger::Close, "setLocalDescription failed at answer.", &err);
                }
                let effects = {
                    let mut core = self.core.lock();
                    if core.state.is_terminal() {
                        return;
                    }
                    core.advance(&self.id, Trigger::LocalAnswerApplied);
                    core.report.record_sent_sdp(&answer);
                    let mut effects = vec![Effect::Signal(OutboundSignal::Answer {
                        sdp: answer.clone(),
                        connection_id: core.connection_id.clone(),
                    })];
                    core.drain_queues(&mut effects);
                    effects.push(Effect::Settle(Settlement::Answer(Ok(answer))));
                    effects
                };
                self.apply(effects);
            }
            Op::ApplyRemoteAnswer(answer) => {
                if let Err(err) = transport.set_remote_description(answer.clone()).await {
                    return self.fail(Trigger::Close, "setRemoteDescription failed at answer.", &err);
                }
                let effects = {
                    let mut core = self.core.lock();
                    if core.state.is_terminal() {
                        return;
                    }
                    let mut effects = Vec::new();
                    core.drain_queues(&mut effects);
                    effects.push(Effect::Settle(Settlement::Answer(Ok(answer))));
                    effects
                };
                self.apply(effects);
            }
            Op::AddRemoteCandidate(candidate) => {
                match transport.add_ice_candidate(candidate.clone()).await {
                    Ok(()) => self.core.lock().report.candidates_received.push(candidate),
                    Err(err) => {
                        error!(target = "direct_connection::connection", error = %err, "failed to apply remote candidate");
                    }
                }
            }
        }
    }

    fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Candidate(candidate) => self.on_local_candidate(candidate),
            TransportEvent::NegotiationNeeded => {
                warn!(target = "direct_connection::connection", connection = %self.id, "renegotiation requested; not supported");
            }
            TransportEvent::ChannelAnnounced(channel) => {
                let mut core = self.core.lock();
                if core.state.is_terminal() {
                    return;
                }
                debug!(target = "direct_connection::connection", channel = channel.label(), "data channel announced");
                core.channel = Some(channel);
            }
            TransportEvent::ChannelOpen => {
                {
                    let mut core = self.core.lock();
                    if core.state.is_terminal() {
                        return;
                    }
                    core.advance(&self.id, Trigger::ChannelOpened);
                }
                self.apply(vec![Effect::Emit(ConnectionEvent::Open)]);
            }
            TransportEvent::ChannelMessage(text) => {
                if self.is_terminal() {
                    return;
                }
                let message = serde_json::from_str(&text).unwrap_or(Value::String(text));
                self.apply(vec![Effect::Emit(ConnectionEvent::Message(message))]);
            }
            TransportEvent::ChannelError(err) => {
                self.core
                    .lock()
                    .report
                    .set_stop_reason(format!("Data channel error: {err}"));
                self.close_with(CloseOptions::default(), Trigger::Close);
            }
            TransportEvent::ChannelClose => {
                self.core.lock().report.set_stop_reason("Data channel closed.");
                self.close_with(CloseOptions::silent(), Trigger::Close);
            }
            TransportEvent::Failed(reason) => {
                self.core.lock().report.set_stop_reason(reason);
                self.close_with(CloseOptions::default(), Trigger::TransportFailed);
            }
        }
    }

    fn on_local_candidate(&self, candidate: Option<IceCandidate>) {
        let effects = {
            let mut core = self.core.lock();
            if core.state.is_terminal() {
                return;
            }
            match filter_local(candidate, core.settings.force_relay) {
                LocalCandidate::EndOfCandidates => {
                    trace!(target = "direct_connection::connection", "local gathering finished");
                    return;
                }
                LocalCandidate::NotRelay => {
                    trace!(target = "direct_connection::connection", "dropping non-relay candidate");
                    return;
                }
                LocalCandidate::Usable(candidate) => {
                    if core.holds_outbound(self.procedure) {
                        trace!(target = "direct_connection::connection", candidate = %candidate.candidate, "holding local candidate");
                        core.queue.hold_outbound(candidate);
                        return;
                    }
                    core.report.candidates_sent.push(candidate.clone());
                    vec![Effect::Signal(OutboundSignal::Candidate {
                        candidate,
                        connection_id: core.connection_id.clone(),
                    })]
                }
            }
        };
        self.apply(effects);
    }
}

async fn run_ops(
    shared: Weak<Shared>,
    transport: Arc<dyn NativeTransport>,
    mut ops: mpsc::UnboundedReceiver<Op>,
) {
    while let Some(op) = ops.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        if shared.is_terminal() {
            break;
        }
        shared.run_op(transport.as_ref(), op).await;
    }
}

async fn pump_transport_events(
    shared: Weak<Shared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        shared.on_transport_event(event);
    }
}

fn release(
    transport: Option<Arc<dyn NativeTransport>>,
    channel: Option<Arc<dyn DataChannel>>,
    tasks: Vec<JoinHandle<()>>,
) {
    for task in tasks {
        task.abort();
    }
    if transport.is_none() && channel.is_none() {
        return;
    }
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Some(channel) = channel {
                    channel.close().await;
                }
                if let Some(transport) = transport {
                    transport.close().await;
                }
            });
        }
        Err(_) => {
            debug!(target = "direct_connection::connection", "no runtime; dropping transport without closing it");
        }
    }
}
