//! `NativeTransport` backed by webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::candidate::IceCandidate;
use crate::config::{without_turn_servers, IceServer};
use crate::error::TransportError;
use crate::signal::{SdpKind, SessionDescription};
use crate::transport::{
    DataChannel, NativeTransport, TransportConfig, TransportEvent, TransportEvents,
    TransportFactory,
};

/// Builds webrtc-rs peer connections.
#[derive(Debug, Default, Clone)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        config: TransportConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn NativeTransport>, TransportError> {
        let peer = match new_peer_connection(&config.ice_servers, config.force_relay).await {
            Ok(peer) => peer,
            Err(err) if config.ice_servers.iter().any(IceServer::is_turn) => {
                warn!(
                    target = "direct_connection::webrtc",
                    error = %err,
                    "peer connection rejected its TURN servers; retrying without them"
                );
                let pruned = without_turn_servers(&config.ice_servers);
                new_peer_connection(&pruned, config.force_relay).await?
            }
            Err(err) => return Err(err),
        };
        let peer = Arc::new(peer);
        wire_peer(&peer, events.clone());
        Ok(Arc::new(WebRtcTransport { peer, events }))
    }
}

async fn new_peer_connection(
    servers: &[IceServer],
    force_relay: bool,
) -> Result<RTCPeerConnection, TransportError> {
    let mut media = MediaEngine::default();
    media
        .register_default_codecs()
        .map_err(|err| TransportError::Setup(err.to_string()))?;
    let registry = register_default_interceptors(Registry::new(), &mut media)
        .map_err(|err| TransportError::Setup(err.to_string()))?;
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();

    let rtc_config = RTCConfiguration {
        ice_servers: servers.iter().map(to_rtc_server).collect(),
        ice_transport_policy: if force_relay {
            RTCIceTransportPolicy::Relay
        } else {
            RTCIceTransportPolicy::All
        },
        ..Default::default()
    };
    api.new_peer_connection(rtc_config)
        .await
        .map_err(|err| TransportError::Setup(err.to_string()))
}

fn to_rtc_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn wire_peer(peer: &Arc<RTCPeerConnection>, events: TransportEvents) {
    let candidate_events = events.clone();
    peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let candidate = match candidate.map(|c| c.to_json()) {
                Some(Ok(init)) => Some(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                }),
                Some(Err(err)) => {
                    warn!(target = "direct_connection::webrtc", error = %err, "failed to serialize local candidate");
                    return;
                }
                None => None,
            };
            let _ = events.send(TransportEvent::Candidate(candidate));
        })
    }));

    let negotiation_events = events.clone();
    peer.on_negotiation_needed(Box::new(move || {
        let events = negotiation_events.clone();
        Box::pin(async move {
            let _ = events.send(TransportEvent::NegotiationNeeded);
        })
    }));

    let channel_events = events.clone();
    peer.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let events = channel_events.clone();
        Box::pin(async move {
            info!(target = "direct_connection::webrtc", channel = %dc.label(), "remote data channel announced");
            let channel = WebRtcDataChannel::wire(dc, events.clone());
            let _ = events.send(TransportEvent::ChannelAnnounced(channel));
        })
    }));

    peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = events.clone();
        Box::pin(async move {
            debug!(target = "direct_connection::webrtc", state = ?state, "peer connection state changed");
            if state == RTCPeerConnectionState::Failed {
                let _ = events.send(TransportEvent::Failed(
                    "Peer connection failed.".to_string(),
                ));
            }
        })
    }));
}

pub struct WebRtcTransport {
    peer: Arc<RTCPeerConnection>,
    events: TransportEvents,
}

impl WebRtcTransport {
    pub fn peer(&self) -> &Arc<RTCPeerConnection> {
        &self.peer
    }
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(TransportError::Description(format!(
                "unexpected description type {other}"
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let converted = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    converted.map_err(|err| TransportError::Description(err.to_string()))
}

#[async_trait]
impl NativeTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .peer
            .create_offer(None)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .peer
            .create_answer(None)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.peer
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.peer
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer
            .add_ice_candidate(init)
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .peer
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| TransportError::Channel(err.to_string()))?;
        Ok(WebRtcDataChannel::wire(dc, self.events.clone()))
    }

    fn supports_stats(&self) -> bool {
        true
    }

    async fn stats(&self) -> Result<Value, TransportError> {
        let report = self.peer.get_stats().await;
        let mut summary = json!({});
        let mut channels = Vec::new();
        for stats in report.reports.values() {
            match stats {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    summary["candidatePair"] = json!({
                        "packetsSent": pair.packets_sent,
                        "packetsReceived": pair.packets_received,
                        "bytesSent": pair.bytes_sent,
                        "bytesReceived": pair.bytes_received,
                        "roundTripTimeMs": pair.current_round_trip_time * 1000.0,
                    });
                }
                StatsReportType::DataChannel(dc) => {
                    channels.push(json!({
                        "label": dc.label,
                        "messagesSent": dc.messages_sent,
                        "messagesReceived": dc.messages_received,
                        "bytesSent": dc.bytes_sent,
                        "bytesReceived": dc.bytes_received,
                    }));
                }
                _ => {}
            }
        }
        summary["dataChannels"] = Value::Array(channels);
        Ok(summary)
    }

    async fn close(&self) {
        if let Err(err) = self.peer.close().await {
            debug!(target = "direct_connection::webrtc", error = %err, "peer connection close failed");
        }
    }
}

/// Data channel with an outbound queue drained by a sender task, so
/// `send_text` never blocks the caller.
pub struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl WebRtcDataChannel {
    fn wire(dc: Arc<RTCDataChannel>, events: TransportEvents) -> Arc<dyn DataChannel> {
        let label = dc.label().to_string();

        let open_events = events.clone();
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                info!(target = "direct_connection::webrtc", channel = %open_label, "data channel open");
                let _ = open_events.send(TransportEvent::ChannelOpen);
            })
        }));

        let close_events = events.clone();
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            let events = close_events.clone();
            let label = close_label.clone();
            Box::pin(async move {
                info!(target = "direct_connection::webrtc", channel = %label, "data channel closed");
                let _ = events.send(TransportEvent::ChannelClose);
            })
        }));

        let error_events = events.clone();
        let error_label = label.clone();
        dc.on_error(Box::new(move |err| {
            let events = error_events.clone();
            let label = error_label.clone();
            Box::pin(async move {
                warn!(target = "direct_connection::webrtc", channel = %label, error = %err, "data channel error");
                let _ = events.send(TransportEvent::ChannelError(err.to_string()));
            })
        }));

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                if !msg.is_string {
                    debug!(target = "direct_connection::webrtc", bytes = msg.data.len(), "ignoring binary message");
                    return;
                }
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(TransportEvent::ChannelMessage(text));
                    }
                    Err(err) => {
                        warn!(target = "direct_connection::webrtc", error = %err, "dropping non-utf8 text message");
                    }
                }
            })
        }));

        let (outbound, mut rx) = mpsc::unbounded_channel::<String>();
        let sender = Arc::clone(&dc);
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(err) = sender.send_text(text).await {
                    warn!(target = "direct_connection::webrtc", error = %err, "failed to send data channel message");
                }
            }
        });

        Arc::new(Self {
            dc,
            label,
            outbound,
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Channel("data channel is not open".into()));
        }
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!(target = "direct_connection::webrtc", error = %err, "data channel close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_carry_credentials() {
        let server = to_rtc_server(&IceServer::with_credentials(
            "turn:turn.example.org:3478",
            "user",
            "secret",
        ));
        assert_eq!(server.urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(server.username, "user");
        assert_eq!(server.credential, "secret");
    }

    #[test]
    fn descriptions_convert_both_ways() {
        let rtc = to_rtc(SessionDescription::answer("v=0\r\n")).unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Answer);
        let back = from_rtc(rtc).unwrap();
        assert_eq!(back, SessionDescription::answer("v=0\r\n"));
    }

    #[tokio::test]
    async fn creates_offer_with_data_channel() {
        let (events, _rx) = mpsc::unbounded_channel();
        let transport = WebRtcTransportFactory::new()
            .create(
                TransportConfig {
                    role: crate::state::Role::Initiator,
                    ice_servers: Vec::new(),
                    force_relay: false,
                },
                events,
            )
            .await
            .unwrap();
        let channel = transport.create_data_channel("direct-data").await.unwrap();
        assert_eq!(channel.label(), "direct-data");
        assert!(!channel.is_open());
        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("webrtc-datachannel"));
        transport.close().await;
    }
}
