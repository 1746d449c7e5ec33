//! Local and remote media state
//!
//! Local tracks are acquired once per session and reused across reconnects;
//! only their `enabled` flag changes on toggle. Remote tracks are collected
//! into a container that always exists once a session starts.

pub mod source;
pub mod tracks;

pub use source::{MediaSource, SyntheticMediaSource};
pub use tracks::{LocalMedia, LocalTrack, RemoteMedia, RemoteTrack};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Capture constraints passed to the media source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    /// Request a camera (default: true)
    pub video: bool,

    /// Request a microphone (default: true)
    pub audio: bool,

    /// Ideal capture width (default: 1280)
    pub ideal_width: u32,

    /// Ideal capture height (default: 720)
    pub ideal_height: u32,

    /// Ideal frame rate (default: 30)
    pub ideal_frame_rate: u32,

    /// Echo-cancelled audio (default: true)
    pub echo_cancellation: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            ideal_width: 1280,
            ideal_height: 720,
            ideal_frame_rate: 30,
            echo_cancellation: true,
        }
    }
}

impl MediaConstraints {
    /// Microphone only
    pub fn audio_only() -> Self {
        Self {
            video: false,
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if !self.audio && !self.video {
            return Err(crate::Error::InvalidConfig(
                "media constraints request neither audio nor video".to_string(),
            ));
        }
        if self.video && (self.ideal_width == 0 || self.ideal_height == 0) {
            return Err(crate::Error::InvalidConfig(format!(
                "video resolution must be non-zero, got {}x{}",
                self.ideal_width, self.ideal_height
            )));
        }
        if self.video && !(1..=60).contains(&self.ideal_frame_rate) {
            return Err(crate::Error::InvalidConfig(format!(
                "ideal_frame_rate must be in range 1-60, got {}",
                self.ideal_frame_rate
            )));
        }
        Ok(())
    }
}
