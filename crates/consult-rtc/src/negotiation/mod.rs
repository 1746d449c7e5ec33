//! Negotiation engine
//!
//! One actor task per call owns the current [`NegotiationSession`]
//! (peer link plus its counters) and reacts to commands, transport events,
//! peer-link callbacks and timer expiries, one at a time, in arrival order.
//! Callers talk to it through an [`EngineHandle`] and observe it through
//! [`SessionEvent`]s and the [`EngineSnapshot`] watch channel.
//!
//! [`NegotiationSession`]: session::NegotiationSession

pub mod engine;
pub mod session;
mod timers;

pub use engine::{EngineContext, NegotiationEngine};

use crate::media::{LocalMedia, RemoteMedia, TrackKind};
use crate::signaling::{JoinAck, TransportKind};
use serde::Serialize;
use std::fmt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Call phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    Idle,
    GatheringMedia,
    Connecting,
    Connected,
    /// Link reported a drop; waiting out the grace period
    Disconnecting,
    Reconnecting,
    Ended,
    Failed,
}

impl EnginePhase {
    /// True once the call is over or cannot recover on its own
    pub fn is_terminal(self) -> bool {
        matches!(self, EnginePhase::Ended | EnginePhase::Failed)
    }
}

impl fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnginePhase::Idle => "idle",
            EnginePhase::GatheringMedia => "gathering_media",
            EnginePhase::Connecting => "connecting",
            EnginePhase::Connected => "connected",
            EnginePhase::Disconnecting => "disconnecting",
            EnginePhase::Reconnecting => "reconnecting",
            EnginePhase::Ended => "ended",
            EnginePhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the engine, published after every step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub phase: EnginePhase,

    /// Generation of the current negotiation session (0 before the first)
    pub generation: u64,

    /// Automatic reconnect attempts made in the current session
    pub reconnect_attempts: u32,

    /// Negotiation errors since the last successful connection
    pub negotiation_errors: u32,

    /// Signaling route in use
    #[serde(skip)]
    pub transport: TransportKind,

    /// Whether the other participant is believed to be in the room
    pub peer_present: bool,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            phase: EnginePhase::Idle,
            generation: 0,
            reconnect_attempts: 0,
            negotiation_errors: 0,
            transport: TransportKind::Fallback,
            peer_present: false,
        }
    }
}

/// Event published to the session's subscribers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Local tracks are ready
    LocalStream(LocalMedia),
    /// Remote tracks changed; may repeat for the same logical stream
    RemoteStream(RemoteMedia),
    /// Media path established (once per connection episode)
    PeerConnected,
    /// Media path lost; `permanent` once automatic recovery gave up
    PeerDisconnected { permanent: bool },
    /// A refresh or reconnect is under way
    Reconnecting,
    /// Advisory mute/unmute from the other participant
    RemoteMediaState { kind: TrackKind, enabled: bool },
    /// Unrecoverable condition
    Error(String),
}

/// Input to the engine actor
#[derive(Debug)]
pub enum Command {
    /// Room joined; begin negotiating
    Start(JoinAck),
    /// Flip a local track's enabled flag
    Toggle { kind: TrackKind, enabled: bool },
    /// Tear down the negotiation session and build a fresh one
    Refresh { reason: String, manual: bool },
    /// Stop recovering and report failure
    GiveUp { reason: String },
    /// Tear everything down; replies when done
    End(oneshot::Sender<()>),
}

/// Handle to a running engine
///
/// Every method is safe to call after the engine has stopped; commands are
/// then dropped.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<EngineSnapshot>,
}

impl EngineHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        snapshot: watch::Receiver<EngineSnapshot>,
    ) -> Self {
        Self { commands, snapshot }
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            debug!("Engine stopped, dropping {:?}", e.0);
        }
    }

    pub fn start(&self, ack: JoinAck) {
        self.send(Command::Start(ack));
    }

    pub fn toggle(&self, kind: TrackKind, enabled: bool) {
        self.send(Command::Toggle { kind, enabled });
    }

    pub fn refresh(&self, reason: impl Into<String>) {
        self.send(Command::Refresh {
            reason: reason.into(),
            manual: false,
        });
    }

    /// Caller-requested refresh; also clears the error count
    pub fn manual_refresh(&self) {
        self.send(Command::Refresh {
            reason: "manual reconnect".to_string(),
            manual: true,
        });
    }

    pub fn give_up(&self, reason: impl Into<String>) {
        self.send(Command::GiveUp {
            reason: reason.into(),
        });
    }

    /// Stop the engine and wait for teardown; returns at once if already stopped
    pub async fn end(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::End(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch receiver for snapshot changes
    pub fn watch(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(EnginePhase::Ended.is_terminal());
        assert!(EnginePhase::Failed.is_terminal());
        assert!(!EnginePhase::Reconnecting.is_terminal());
        assert_eq!(EnginePhase::GatheringMedia.to_string(), "gathering_media");
    }

    #[tokio::test]
    async fn test_handle_on_stopped_engine() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_snap_tx, snap_rx) = watch::channel(EngineSnapshot::default());
        let handle = EngineHandle::new(tx, snap_rx);
        drop(rx);

        assert!(handle.is_stopped());
        handle.refresh("ignored");
        handle.end().await;
        assert_eq!(handle.snapshot().phase, EnginePhase::Idle);
    }
}
