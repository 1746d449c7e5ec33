//! Local and remote track containers

use super::TrackKind;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// One local capture track
///
/// Toggling only flips `enabled`; the track object and its RTP sender stay
/// attached to the peer connection.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,

    /// RTP track attached to peer connections (absent for test doubles)
    rtp: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalTrack {
    pub fn new(
        id: impl Into<String>,
        kind: TrackKind,
        rtp: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtp,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Set the enabled flag; returns true if it changed
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::AcqRel) != enabled
    }

    /// Release the device; a stopped track never produces samples again
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!("Stopped local {} track {}", self.kind, self.id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn rtp_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.rtp.clone()
    }

    /// Write one encoded sample; disabled or stopped tracks drop it
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }
        let Some(rtp) = &self.rtp else {
            return Ok(());
        };
        rtp.write_sample(sample)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to write {} sample: {}", self.kind, e)))
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The session's local tracks: zero or one of each kind
#[derive(Debug, Clone)]
pub struct LocalMedia {
    stream_id: String,
    audio: Option<Arc<LocalTrack>>,
    video: Option<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(
        stream_id: impl Into<String>,
        audio: Option<Arc<LocalTrack>>,
        video: Option<Arc<LocalTrack>>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            audio,
            video,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    /// All tracks, audio first
    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
        info!("Local media {} released", self.stream_id);
    }
}

/// One track contributed by the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Tracks contributed by the remote peer
///
/// A track that arrives with its bundled stream replaces the container when
/// the stream differs from the current one; tracks without a stream are
/// appended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMedia {
    stream_id: Option<String>,
    tracks: Vec<RemoteTrack>,
}

impl RemoteMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track, returning true if the container changed
    pub fn add(&mut self, track: RemoteTrack, stream_id: Option<&str>) -> bool {
        match stream_id {
            Some(stream) if self.stream_id.as_deref() != Some(stream) => {
                debug!("Remote stream {} replaces previous container", stream);
                self.stream_id = Some(stream.to_string());
                self.tracks = vec![track];
                true
            }
            _ => {
                if let Some(existing) = self.tracks.iter_mut().find(|t| t.id == track.id) {
                    if *existing == track {
                        return false;
                    }
                    *existing = track;
                } else {
                    self.tracks.push(track);
                }
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.stream_id = None;
        self.tracks.clear();
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}
