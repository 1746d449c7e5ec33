//! Signal transport
//!
//! Delivery of [`SignalingEnvelope`]s between the two participants. Two
//! interchangeable strategies implement [`SignalTransport`]: the persistent
//! WebSocket channel and the poll-based REST fallback. [`SignalHub`] chooses
//! between them, retries outbound envelopes, and degrades to direct mode when
//! the relay is exhausted.
//!
//! Inbound traffic from every strategy arrives as [`TransportEvent`]s on one
//! channel handed to each transport at construction.

pub mod hub;
pub mod memory;
pub mod polling;
pub mod protocol;
pub mod relay_api;
pub mod websocket;

pub use hub::{ConnectOutcome, SignalHub};
pub use protocol::{
    JoinAck, ParticipantContext, ParticipantIdentity, Role, RoomId, RoomStatus, SignalKind,
    SignalingEnvelope,
};

use crate::Result;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Which route signaling currently takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Persistent duplex channel
    Primary,
    /// Request/poll channel
    Fallback,
    /// No relay; offers are re-issued opportunistically
    Direct,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Primary => f.write_str("primary"),
            TransportKind::Fallback => f.write_str("fallback"),
            TransportKind::Direct => f.write_str("direct"),
        }
    }
}

/// Inbound transport event
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An envelope from the other participant
    Message(SignalingEnvelope),
    /// The other participant entered the room
    PeerJoined(ParticipantIdentity),
    /// The other participant left the room
    ///
    /// `role` is set when the transport knows which seat was vacated; the
    /// id may then be a role-name placeholder.
    PeerLeft { user_id: String, role: Option<Role> },
    /// Consecutive relay failures crossed the direct-mode threshold
    RelayExhausted,
    /// The relay answered again after direct mode was entered
    RelayRestored,
    /// The persistent channel closed and could not be re-opened
    PrimaryLost,
}

/// Sender half every transport publishes on
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half consumed by the negotiation engine
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// One signaling strategy
///
/// Implementations make a single attempt per call; retries and fallback are
/// the hub's job.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Establish the channel (handshake included)
    async fn connect(&self) -> Result<()>;

    /// Join a room; presence events start flowing afterwards
    async fn join(&self, room: &RoomId, ctx: &ParticipantContext) -> Result<JoinAck>;

    /// Leave a room
    async fn leave(&self, room: &RoomId) -> Result<()>;

    /// Deliver one envelope
    async fn send(&self, room: &RoomId, envelope: &SignalingEnvelope) -> Result<()>;

    /// Relay view of who is in the room
    async fn room_status(&self, room: &RoomId) -> Result<RoomStatus>;

    /// Close the channel and stop any background tasks
    async fn disconnect(&self);
}
