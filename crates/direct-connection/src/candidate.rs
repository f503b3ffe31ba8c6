use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Network path descriptor exchanged during connectivity discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_mline_index,
            username_fragment: None,
        }
    }

    /// Empty candidate strings mark the end of gathering.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }

    pub fn is_relay(&self) -> bool {
        self.candidate.contains("typ relay")
    }
}

/// Outcome of running a locally discovered candidate through the filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCandidate {
    Usable(IceCandidate),
    EndOfCandidates,
    NotRelay,
}

/// Applies the end-of-candidates and force-relay filters, in that order.
/// Gating happens afterwards, on whatever survives.
pub fn filter_local(candidate: Option<IceCandidate>, force_relay: bool) -> LocalCandidate {
    match candidate {
        None => LocalCandidate::EndOfCandidates,
        Some(candidate) if candidate.is_end_of_candidates() => LocalCandidate::EndOfCandidates,
        Some(candidate) if force_relay && !candidate.is_relay() => LocalCandidate::NotRelay,
        Some(candidate) => LocalCandidate::Usable(candidate),
    }
}

/// Outcome of validating a remote candidate signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCandidate {
    Usable(IceCandidate),
    /// Nothing to apply; end of the remote side's gathering.
    Empty,
    /// Missing the media line index the transport needs.
    Malformed(IceCandidate),
}

pub fn validate_remote(candidate: Option<IceCandidate>) -> RemoteCandidate {
    match candidate {
        None => RemoteCandidate::Empty,
        Some(candidate) if candidate.is_end_of_candidates() => RemoteCandidate::Empty,
        Some(candidate) if candidate.sdp_mline_index.is_none() => {
            RemoteCandidate::Malformed(candidate)
        }
        Some(candidate) => RemoteCandidate::Usable(candidate),
    }
}

/// Candidates released by a drain, each list in arrival order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drained {
    pub outbound: Vec<IceCandidate>,
    pub inbound: Vec<IceCandidate>,
}

/// Outbound and inbound FIFO buffers, drained exactly once.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    outbound: VecDeque<IceCandidate>,
    inbound: VecDeque<IceCandidate>,
    drained: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold_outbound(&mut self, candidate: IceCandidate) {
        self.outbound.push_back(candidate);
    }

    pub fn hold_inbound(&mut self, candidate: IceCandidate) {
        self.inbound.push_back(candidate);
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Releases everything held so far. Only the first call yields anything.
    pub fn drain(&mut self) -> Drained {
        if self.drained {
            return Drained::default();
        }
        self.drained = true;
        Drained {
            outbound: self.outbound.drain(..).collect(),
            inbound: self.inbound.drain(..).collect(),
        }
    }

    pub fn clear(&mut self) {
        self.outbound.clear();
        self.inbound.clear();
    }
}
