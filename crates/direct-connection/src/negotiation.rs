//! Transition table shared by both roles, plus the two role-specific
//! procedures that decide what each side does at the branching points.

use crate::state::{ConnectionState, Role};

/// Inputs that can move a connection along its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Accept,
    RemoteOfferReceived,
    Approve,
    LocalOfferApplied,
    RemoteOfferApplied,
    LocalAnswerApplied,
    RemoteAnswerReceived,
    ChannelOpened,
    TransportFailed,
    Close,
}

use ConnectionState::*;

/// `(from, trigger, to)`. Terminal short-circuits are handled in [`advance`]
/// rather than listed per state.
const TRANSITIONS: &[(ConnectionState, Trigger, ConnectionState)] = &[
    (Started, Trigger::Accept, Started),
    (Started, Trigger::RemoteOfferReceived, InReview),
    (Started, Trigger::Approve, Approved),
    (InReview, Trigger::Approve, Approved),
    (Approved, Trigger::LocalOfferApplied, Offered),
    (Approved, Trigger::RemoteOfferApplied, Offered),
    (Offered, Trigger::LocalAnswerApplied, Answered),
    (Offered, Trigger::RemoteAnswerReceived, Answered),
    (Answered, Trigger::ChannelOpened, Flowing),
];

/// Looks up the state a trigger leads to. `None` means the trigger does not
/// move the connection from `from` (the caller keeps its current state).
pub fn advance(from: ConnectionState, trigger: Trigger) -> Option<ConnectionState> {
    if from.is_terminal() {
        return None;
    }
    match trigger {
        Trigger::Close => return Some(Ended),
        Trigger::TransportFailed => return Some(MediaError),
        _ => {}
    }
    TRANSITIONS
        .iter()
        .find(|(state, candidate, _)| *state == from && *candidate == trigger)
        .map(|(_, _, to)| *to)
}

/// Role-specific decisions. Both implementations drive the same table.
pub trait Procedure: Send + Sync {
    fn role(&self) -> Role;

    /// Whether approving starts local offer generation.
    fn offers_on_approve(&self) -> bool;

    /// Whether a remote offer is a legal input for this side.
    fn accepts_remote_offer(&self) -> bool;

    /// Whether a remote answer is a legal input for this side.
    fn accepts_remote_answer(&self) -> bool;

    /// Local candidates are held back instead of signaled.
    fn holds_outbound(&self, state: ConnectionState) -> bool;

    /// Remote candidates are held back instead of applied.
    fn holds_inbound(&self, state: ConnectionState) -> bool;

    /// Whether closing from `state` must not emit a terminate signal.
    fn suppresses_terminate(&self, state: ConnectionState) -> bool;
}

#[derive(Debug, Default)]
pub struct InitiatorProcedure;

impl Procedure for InitiatorProcedure {
    fn role(&self) -> Role {
        Role::Initiator
    }

    fn offers_on_approve(&self) -> bool {
        true
    }

    fn accepts_remote_offer(&self) -> bool {
        false
    }

    fn accepts_remote_answer(&self) -> bool {
        true
    }

    fn holds_outbound(&self, state: ConnectionState) -> bool {
        state < Answered
    }

    fn holds_inbound(&self, state: ConnectionState) -> bool {
        state < Answered
    }

    // Nothing has reached the remote side until the offer went out.
    fn suppresses_terminate(&self, state: ConnectionState) -> bool {
        state < Offered
    }
}

#[derive(Debug, Default)]
pub struct ResponderProcedure;

impl Procedure for ResponderProcedure {
    fn role(&self) -> Role {
        Role::Responder
    }

    fn offers_on_approve(&self) -> bool {
        false
    }

    fn accepts_remote_offer(&self) -> bool {
        true
    }

    fn accepts_remote_answer(&self) -> bool {
        false
    }

    fn holds_outbound(&self, _state: ConnectionState) -> bool {
        false
    }

    // The responder's transport only takes candidates once the remote offer
    // and local answer are both applied; before `accept` it has none at all.
    fn holds_inbound(&self, state: ConnectionState) -> bool {
        state < Answered
    }

    fn suppresses_terminate(&self, _state: ConnectionState) -> bool {
        false
    }
}

static INITIATOR: InitiatorProcedure = InitiatorProcedure;
static RESPONDER: ResponderProcedure = ResponderProcedure;

pub fn procedure_for(role: Role) -> &'static dyn Procedure {
    match role {
        Role::Initiator => &INITIATOR,
        Role::Responder => &RESPONDER,
    }
}
