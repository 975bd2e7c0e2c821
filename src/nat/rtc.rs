//! `webrtc` backed peer connector

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{ConnectionState, IceCandidate, IceServer, PeerConnector, PeerEvents, PeerSession, SdpType};
use crate::config::NatConfig;
use crate::error::NegotiationError;

const OPUS_PAYLOAD_TYPE: u8 = 111;

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

fn transport_err(e: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Transport(e.to_string())
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Builds peer connections with a single send/receive Opus track
#[derive(Debug, Default)]
pub struct WebRtcConnector;

impl WebRtcConnector {
    pub fn new() -> Self {
        Self
    }

    fn build_api(&self, config: &NatConfig) -> Result<API, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: OPUS_PAYLOAD_TYPE,
                    stats_id: String::new(),
                },
                RTPCodecType::Audio,
            )
            .map_err(transport_err)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine).map_err(transport_err)?;

        let mut setting_engine = SettingEngine::default();
        let mut network_types = vec![NetworkType::Udp4, NetworkType::Tcp4];
        if config.enable_ipv6 {
            network_types.extend([NetworkType::Udp6, NetworkType::Tcp6]);
        }
        setting_engine.set_network_types(network_types);

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }

    fn rtc_config(servers: &[IceServer]) -> RTCConfiguration {
        let ice_servers = servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![server.url.clone()],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        servers: &[IceServer],
        config: &NatConfig,
        events: PeerEvents,
    ) -> Result<Arc<dyn PeerSession>, NegotiationError> {
        let api = self.build_api(config)?;
        let pc = Arc::new(
            api.new_peer_connection(Self::rtc_config(servers))
                .await
                .map_err(transport_err)?,
        );

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if let Some(state) = map_state(state) {
                state_events.state_changed(state);
            }
            Box::pin(async {})
        }));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => candidate_events.local_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid.unwrap_or_default(),
                        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                    }),
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let events = track_events.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                tracing::info!(generation = %events.generation(), "Remote audio track");
                loop {
                    match track.read_rtp().await {
                        Ok((packet, _)) => {
                            if !packet.payload.is_empty() {
                                events.audio_frame(&packet.payload);
                            }
                        }
                        Err(e) => {
                            tracing::debug!("Remote track ended: {}", e);
                            break;
                        }
                    }
                }
            })
        }));

        let track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_string(),
            "voip-core".to_string(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(transport_err)?;

        Ok(Arc::new(WebRtcSession { pc, track, events }))
    }
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    events: PeerEvents,
}

impl WebRtcSession {
    async fn apply_local(&self, description: RTCSessionDescription, kind: SdpType) -> Result<String, NegotiationError> {
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;

        let sdp = self
            .pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or(NegotiationError::NoPeerConnection)?;
        self.events.local_description(&sdp, kind);
        Ok(sdp)
    }
}

#[async_trait]
impl PeerSession for WebRtcSession {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(transport_err)?;
        self.apply_local(offer, SdpType::Offer).await
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;
        self.apply_local(answer, SdpType::Answer).await
    }

    async fn set_remote_description(&self, kind: SdpType, sdp: &str) -> Result<(), NegotiationError> {
        let description = match kind {
            SdpType::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpType::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))
    }

    async fn send_audio_frame(&self, data: &[u8], duration: Duration) -> Result<(), NegotiationError> {
        let sample = Sample {
            data: Bytes::copy_from_slice(data),
            duration,
            ..Default::default()
        };
        self.track.write_sample(&sample).await.map_err(transport_err)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error while closing peer connection: {}", e);
        }
    }
}
