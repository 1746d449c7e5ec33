//! Peer connection layer
//!
//! [`PeerLink`] is what the negotiation engine drives; [`RtcPeerLink`] is the
//! webrtc-rs implementation. Retry timing and the relay circuit breaker live
//! in [`lifecycle`].

pub mod connection;
pub mod lifecycle;
pub mod link;

pub use connection::{RtcPeerLink, RtcPeerLinkFactory};
pub use lifecycle::{BackoffPolicy, CircuitState, ReconnectionTracker, RelayBreaker};
pub use link::{LinkEvent, LinkEventSink, LinkState, PeerLink, PeerLinkFactory, SignalingState};
