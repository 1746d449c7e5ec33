//! Peer-to-peer video consultation sessions
//!
//! This crate owns the lifecycle of one doctor/patient call: acquiring local
//! media, negotiating the peer link, exchanging signaling through a primary
//! channel with a poll-based fallback, and recovering from failure.
//!
//! # Features
//!
//! - **Transport fallback**: WebSocket channel, REST polling, then direct mode
//! - **Glare-safe negotiation**: politeness by user id, stale-answer discard
//! - **Bounded recovery**: grace period, ICE-restart backoff, supervised refreshes
//! - **Track toggling without renegotiation**
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  CallSession (initialize / toggle / reconnect / end) │
//! │  ├─ SignalHub                                        │
//! │  │   ├─ WebSocketTransport (primary)                 │
//! │  │   ├─ PollingTransport (fallback)                  │
//! │  │   └─ RelayBreaker → direct mode                   │
//! │  ├─ RoomMembership                                   │
//! │  ├─ NegotiationEngine (actor)                        │
//! │  │   └─ NegotiationSession → PeerLink (webrtc-rs)    │
//! │  └─ Supervisor ← HealthMonitor (process-wide)        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use consult_rtc::CallConfig;
//!
//! let config = CallConfig::low_latency("https://relay.example.com").with_token("secret");
//! assert!(config.validate().is_ok());
//! assert_eq!(config.channel_url, "wss://relay.example.com/ws");
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use consult_rtc::{CallConfig, CallSession, ParticipantContext, Role, RoomId, SessionEvent};
//!
//! # async fn example() -> consult_rtc::Result<()> {
//! let config = CallConfig::default().with_token("secret");
//! let session = CallSession::new(
//!     config,
//!     RoomId::new("room-42"),
//!     ParticipantContext {
//!         appointment_id: "appt-42".to_string(),
//!         role: Role::Patient,
//!     },
//! )?;
//!
//! let mut events = session.subscribe();
//! session.initialize().await?;
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::PeerConnected = event {
//!         break;
//!     }
//! }
//! session.end_call().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod health;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod room;
pub mod session;
pub mod signaling;
pub mod supervisor;

pub use config::{
    CallConfig, HealthOptions, NegotiationOptions, SupervisorOptions, TransportOptions,
    TurnServerConfig,
};
pub use error::{Error, Result};
pub use health::HealthMonitor;
pub use media::{LocalMedia, MediaConstraints, RemoteMedia, TrackKind};
pub use negotiation::{EnginePhase, EngineSnapshot, SessionEvent};
pub use session::{CallSession, SessionParts, SessionStats};
pub use signaling::{
    ConnectOutcome, ParticipantContext, ParticipantIdentity, Role, RoomId, SignalHub,
    TransportKind,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
