//! webrtc-rs peer link

use super::link::{LinkEvent, LinkEventSink, LinkState, PeerLink, PeerLinkFactory, SignalingState};
use crate::config::CallConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Peer link backed by an `RTCPeerConnection`
pub struct RtcPeerLink {
    /// Unique identifier for this connection instance
    connection_id: String,

    peer_connection: Arc<RTCPeerConnection>,

    /// Set once a remote description was applied
    has_remote: AtomicBool,

    /// Cleared by `detach`; callbacks check it before publishing
    attached: Arc<AtomicBool>,
}

/// Map configured STUN/TURN servers to webrtc-rs ICE servers
pub fn ice_servers(config: &CallConfig) -> Vec<RTCIceServer> {
    config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        }))
        .collect()
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    };
    parsed.map_err(|e| Error::SdpError(format!("Failed to parse {:?}: {}", desc.sdp_type, e)))
}

impl RtcPeerLink {
    /// Create a new peer connection and wire its callbacks to `sink`
    #[instrument(skip(config, sink), fields(generation = sink.generation()))]
    pub async fn new(config: &CallConfig, sink: LinkEventSink) -> Result<Self> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        info!("Creating peer connection {}", connection_id);

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
            })?);

        let attached = Arc::new(AtomicBool::new(true));
        Self::wire_callbacks(&peer_connection, &attached, sink);

        Ok(Self {
            connection_id,
            peer_connection,
            has_remote: AtomicBool::new(false),
            attached,
        })
    }

    fn wire_callbacks(pc: &Arc<RTCPeerConnection>, attached: &Arc<AtomicBool>, sink: LinkEventSink) {
        let (state_sink, state_attached) = (sink.clone(), attached.clone());
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            let attached = state_attached.clone();
            Box::pin(async move {
                let state = match s {
                    RTCPeerConnectionState::New => LinkState::New,
                    RTCPeerConnectionState::Connecting => LinkState::Connecting,
                    RTCPeerConnectionState::Connected => LinkState::Connected,
                    RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                    RTCPeerConnectionState::Failed => LinkState::Failed,
                    RTCPeerConnectionState::Closed => LinkState::Closed,
                    _ => return,
                };
                if attached.load(Ordering::Acquire) {
                    sink.emit(LinkEvent::StateChanged(state));
                }
            })
        }));

        let (ice_sink, ice_attached) = (sink.clone(), attached.clone());
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = ice_sink.clone();
            let attached = ice_attached.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                if !attached.load(Ordering::Acquire) {
                    return;
                }
                match candidate.to_json() {
                    Ok(init) => sink.emit(LinkEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let (track_sink, track_attached) = (sink, attached.clone());
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = track_sink.clone();
                let attached = track_attached.clone();
                Box::pin(async move {
                    if !attached.load(Ordering::Acquire) {
                        return;
                    }
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    let stream_id = track.stream_id();
                    debug!("Remote {} track {} (stream {})", kind, track.id(), stream_id);
                    sink.emit(LinkEvent::RemoteTrack {
                        id: track.id(),
                        kind,
                        stream_id: (!stream_id.is_empty()).then_some(stream_id),
                    });
                })
            },
        ));
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    async fn local_sdp(&self) -> Result<String> {
        self.peer_connection
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| Error::SdpError("No local description after setting it".to_string()))
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn add_local_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        let rtp = track.rtp_track().ok_or_else(|| {
            Error::PeerConnectionError(format!("Track {} has no RTP sender", track.id()))
        })?;

        let sender = self
            .peer_connection
            .add_track(rtp as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to add track: {}", e)))?;

        // Drain RTCP so interceptors keep running
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        debug!("Local {} track {} attached", track.kind(), track.id());
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::offer(self.local_sdp().await?))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.peer_connection
            .set_remote_description(to_rtc(&offer)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;
        self.has_remote.store(true, Ordering::Release);

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::answer(self.local_sdp().await?))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc(&answer)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;
        self.has_remote.store(true, Ordering::Release);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        Err(Error::SdpError(
            "Local description rollback is not supported by this peer connection".to_string(),
        ))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    fn signaling_state(&self) -> SignalingState {
        match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn has_remote_description(&self) -> bool {
        self.has_remote.load(Ordering::Acquire)
    }

    fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection {}", self.connection_id);
        self.peer_connection.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close connection: {}", e))
        })
    }
}

/// Creates [`RtcPeerLink`]s
#[derive(Debug, Clone, Default)]
pub struct RtcPeerLinkFactory;

#[async_trait]
impl PeerLinkFactory for RtcPeerLinkFactory {
    async fn create(&self, config: &CallConfig, sink: LinkEventSink) -> Result<Arc<dyn PeerLink>> {
        Ok(Arc::new(RtcPeerLink::new(config, sink).await?))
    }
}
