//! Peer link abstraction
//!
//! The negotiation engine drives one [`PeerLink`] at a time. Callbacks from
//! the link come back as [`LinkEvent`]s tagged with the generation of the
//! negotiation session that created it, so events from a replaced link are
//! recognisable and dropped.

use crate::config::CallConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::protocol::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Signaling state of the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Transport-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callback from a peer link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A locally gathered candidate to send to the peer
    LocalCandidate(IceCandidate),
    /// Connection state changed
    StateChanged(LinkState),
    /// A remote track arrived, with the stream it is bundled in (if any)
    RemoteTrack {
        id: String,
        kind: TrackKind,
        stream_id: Option<String>,
    },
}

/// Where a link publishes its callbacks
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

impl LinkEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, LinkEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Publish an event; silently dropped once the engine is gone
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send((self.generation, event));
    }
}

/// One peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach a local track before any negotiation
    async fn add_local_track(&self, track: Arc<LocalTrack>) -> Result<()>;

    /// Create an offer and set it as the local description
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    /// Set a remote offer, then create and set the answer
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    /// Set a remote answer
    async fn apply_answer(&self, answer: SessionDescription) -> Result<()>;

    /// Discard a pending local offer, returning to `Stable`
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    fn has_remote_description(&self) -> bool;

    /// Stop publishing events; must be called before `close`
    fn detach(&self);

    async fn close(&self) -> Result<()>;
}

/// Builds peer links
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(&self, config: &CallConfig, sink: LinkEventSink) -> Result<Arc<dyn PeerLink>>;
}
