//! Media acquisition
//!
//! [`acquire`] asks a [`MediaSource`] for camera and microphone, degrades to
//! microphone only, and fails only when neither is available.

use super::tracks::{LocalMedia, LocalTrack};
use super::{MediaConstraints, TrackKind};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Device access
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open devices matching `constraints`; all or nothing
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalMedia>;
}

/// Acquire local media, degrading to audio-only when video is unavailable
#[instrument(skip(source))]
pub async fn acquire(source: &dyn MediaSource, constraints: &MediaConstraints) -> Result<LocalMedia> {
    match source.open(constraints).await {
        Ok(media) => {
            info!(
                "Local media acquired (audio: {}, video: {})",
                media.track(TrackKind::Audio).is_some(),
                media.has_video()
            );
            return Ok(media);
        }
        Err(e) if constraints.video && constraints.audio => {
            warn!("Camera and microphone unavailable ({}), trying audio only", e);
        }
        Err(e) => {
            return Err(Error::MediaUnavailable(format!(
                "No usable capture device: {}",
                e
            )))
        }
    }

    let audio_only = MediaConstraints {
        video: false,
        ..constraints.clone()
    };
    source.open(&audio_only).await.map_err(|e| {
        Error::MediaUnavailable(format!("Neither camera nor microphone available: {}", e))
    })
}

/// Produces webrtc-rs sample tracks (VP8 video, Opus audio) without real devices
#[derive(Debug, Clone)]
pub struct SyntheticMediaSource {
    pub has_camera: bool,
    pub has_microphone: bool,
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self {
            has_camera: true,
            has_microphone: true,
        }
    }
}

impl SyntheticMediaSource {
    fn audio_track(stream_id: &str) -> Arc<LocalTrack> {
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", stream_id),
            stream_id.to_string(),
        ));
        Arc::new(LocalTrack::new(
            format!("audio-{}", stream_id),
            TrackKind::Audio,
            Some(rtp),
        ))
    }

    fn video_track(stream_id: &str) -> Arc<LocalTrack> {
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("video-{}", stream_id),
            stream_id.to_string(),
        ));
        Arc::new(LocalTrack::new(
            format!("video-{}", stream_id),
            TrackKind::Video,
            Some(rtp),
        ))
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalMedia> {
        if constraints.video && !self.has_camera {
            return Err(Error::MediaUnavailable("No camera".to_string()));
        }
        if constraints.audio && !self.has_microphone {
            return Err(Error::MediaUnavailable("No microphone".to_string()));
        }

        let stream_id = format!("local-{}", uuid::Uuid::new_v4());
        let audio = constraints.audio.then(|| Self::audio_track(&stream_id));
        let video = constraints.video.then(|| Self::video_track(&stream_id));
        Ok(LocalMedia::new(stream_id, audio, video))
    }
}
