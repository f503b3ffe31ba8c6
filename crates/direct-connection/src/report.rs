use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::candidate::IceCandidate;
use crate::signal::SessionDescription;

pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Lifecycle summary sent to the signaling layer once, when the connection
/// closes. Append-only until then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    /// Milliseconds since the Unix epoch; zero until the transport starts.
    pub connection_started: i64,
    pub connection_stopped: i64,
    pub connection_stopped_reason: String,
    #[serde(rename = "lastSDPString")]
    pub last_sdp_string: String,
    pub sdps_sent: Vec<SessionDescription>,
    pub sdps_received: Vec<SessionDescription>,
    pub candidates_sent: Vec<IceCandidate>,
    pub candidates_received: Vec<IceCandidate>,
    pub stats: Vec<Value>,
    pub user_agent: String,
    pub os: String,
}

impl Default for UsageReport {
    fn default() -> Self {
        Self {
            connection_started: 0,
            connection_stopped: 0,
            connection_stopped_reason: String::new(),
            last_sdp_string: String::new(),
            sdps_sent: Vec::new(),
            sdps_received: Vec::new(),
            candidates_sent: Vec::new(),
            candidates_received: Vec::new(),
            stats: Vec::new(),
            user_agent: USER_AGENT.to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

impl UsageReport {
    pub fn mark_started(&mut self) {
        self.connection_started = now_millis();
    }

    pub fn mark_stopped(&mut self) {
        self.connection_stopped = now_millis();
    }

    pub fn record_sent_sdp(&mut self, sdp: &SessionDescription) {
        self.sdps_sent.push(sdp.clone());
    }

    pub fn record_received_sdp(&mut self, sdp: &SessionDescription) {
        self.last_sdp_string = sdp.sdp.clone();
        self.sdps_received.push(sdp.clone());
    }

    /// Keeps the first reason; later failures are consequences of it.
    pub fn set_stop_reason(&mut self, reason: impl Into<String>) {
        if self.connection_stopped_reason.is_empty() {
            self.connection_stopped_reason = reason.into();
        }
    }
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_wire_field_names() {
        let mut report = UsageReport::default();
        report.record_received_sdp(&SessionDescription::offer("v=0\r\n"));
        let json = serde_json::to_value(&report).unwrap();
        for key in [
            "connectionStarted",
            "connectionStopped",
            "connectionStoppedReason",
            "lastSDPString",
            "sdpsSent",
            "sdpsReceived",
            "candidatesSent",
            "candidatesReceived",
            "stats",
            "userAgent",
            "os",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["lastSDPString"], "v=0\r\n");
        assert_eq!(json["sdpsReceived"][0]["type"], "offer");
    }

    #[test]
    fn first_stop_reason_sticks() {
        let mut report = UsageReport::default();
        report.set_stop_reason("setRemoteDescription failed at answer.");
        report.set_stop_reason("Remote side hung up");
        assert_eq!(
            report.connection_stopped_reason,
            "setRemoteDescription failed at answer."
        );
    }

    #[test]
    fn timestamps_are_epoch_millis() {
        let mut report = UsageReport::default();
        report.mark_started();
        report.mark_stopped();
        assert!(report.connection_started > 1_600_000_000_000);
        assert!(report.connection_stopped >= report.connection_started);
    }
}
