//! One peer link and the state that belongs to it
//!
//! A [`NegotiationSession`] is never reset in place. Hard reconnects and
//! refreshes discard it and open a new one with the next generation.

use crate::config::CallConfig;
use crate::media::LocalMedia;
use crate::peer::lifecycle::{BackoffPolicy, ReconnectionTracker};
use crate::peer::link::{LinkEvent, LinkEventSink, LinkState, PeerLink, PeerLinkFactory};
use crate::signaling::protocol::IceCandidate;
use crate::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct NegotiationSession {
    generation: u64,
    link: Arc<dyn PeerLink>,
    tracker: ReconnectionTracker,
    link_state: LinkState,
    remote_track_received: bool,
    initial_offerer: bool,
    pending_candidates: VecDeque<IceCandidate>,
    candidate_cap: usize,

    /// True between `PeerConnected` and the matching disconnect report
    episode_open: bool,
}

impl NegotiationSession {
    /// Build a link and attach every local track before any signaling
    pub(crate) async fn open(
        generation: u64,
        factory: &dyn PeerLinkFactory,
        config: &CallConfig,
        local_media: &LocalMedia,
        link_events: mpsc::UnboundedSender<(u64, LinkEvent)>,
    ) -> Result<Self> {
        let link = factory
            .create(config, LinkEventSink::new(generation, link_events))
            .await?;

        for track in local_media.tracks() {
            if let Err(e) = link.add_local_track(track).await {
                link.detach();
                let _ = link.close().await;
                return Err(e);
            }
        }

        info!("Negotiation session {} opened", generation);
        Ok(Self::with_link(
            generation,
            link,
            config.negotiation.reconnect.clone(),
            config.negotiation.pending_candidate_cap,
        ))
    }

    pub(crate) fn with_link(
        generation: u64,
        link: Arc<dyn PeerLink>,
        reconnect: BackoffPolicy,
        candidate_cap: usize,
    ) -> Self {
        Self {
            generation,
            link,
            tracker: ReconnectionTracker::new(reconnect),
            link_state: LinkState::New,
            remote_track_received: false,
            initial_offerer: false,
            pending_candidates: VecDeque::new(),
            candidate_cap,
            episode_open: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    pub fn tracker(&self) -> &ReconnectionTracker {
        &self.tracker
    }

    pub(crate) fn tracker_mut(&mut self) -> &mut ReconnectionTracker {
        &mut self.tracker
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub(crate) fn set_link_state(&mut self, state: LinkState) {
        self.link_state = state;
    }

    pub fn remote_track_received(&self) -> bool {
        self.remote_track_received
    }

    pub(crate) fn mark_remote_track(&mut self) {
        self.remote_track_received = true;
    }

    pub fn is_initial_offerer(&self) -> bool {
        self.initial_offerer
    }

    pub(crate) fn mark_initial_offerer(&mut self) {
        self.initial_offerer = true;
    }

    pub fn episode_open(&self) -> bool {
        self.episode_open
    }

    /// Open a connection episode; false if one is already open
    pub(crate) fn open_episode(&mut self) -> bool {
        !std::mem::replace(&mut self.episode_open, true)
    }

    /// Close the current episode; false if none was open
    pub(crate) fn close_episode(&mut self) -> bool {
        std::mem::replace(&mut self.episode_open, false)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Hold a candidate until a remote description exists
    pub(crate) fn buffer_candidate(&mut self, candidate: IceCandidate) {
        if self.pending_candidates.len() >= self.candidate_cap {
            warn!(
                "Pending candidate buffer full ({}), dropping oldest",
                self.candidate_cap
            );
            self.pending_candidates.pop_front();
        }
        self.pending_candidates.push_back(candidate);
    }

    /// Apply buffered candidates; returns how many the link rejected
    pub(crate) async fn flush_candidates(&mut self) -> u32 {
        let mut rejected = 0;
        let pending: Vec<_> = self.pending_candidates.drain(..).collect();
        if !pending.is_empty() {
            debug!("Applying {} buffered candidates", pending.len());
        }
        for candidate in pending {
            if let Err(e) = self.link.add_ice_candidate(candidate).await {
                warn!("Buffered candidate rejected: {}", e);
                rejected += 1;
            }
        }
        rejected
    }

    /// Silence the link, then close it
    pub(crate) async fn close(self) {
        self.link.detach();
        if let Err(e) = self.link.close().await {
            warn!("Closing session {} link: {}", self.generation, e);
        }
        debug!("Negotiation session {} closed", self.generation);
    }
}

impl std::fmt::Debug for NegotiationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationSession")
            .field("generation", &self.generation)
            .field("link_state", &self.link_state)
            .field("signaling_state", &self.link.signaling_state())
            .field("reconnect_attempts", &self.tracker.attempts())
            .field("episode_open", &self.episode_open)
            .finish()
    }
}
