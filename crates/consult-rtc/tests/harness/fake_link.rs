//! In-process peer links
//!
//! Links created from one [`FakeNetwork`] pair up when an offer from one is
//! answered by the other: descriptions carry the creating link's id, so once
//! each side holds the other's description both report `Connected` and
//! exchange their local tracks as remote tracks. Closing a link reports
//! `Disconnected` to its partner. Rollback is unsupported, as in webrtc-rs.

use async_trait::async_trait;
use consult_rtc::media::{LocalTrack, TrackKind};
use consult_rtc::peer::{LinkEvent, LinkEventSink, LinkState, PeerLink, PeerLinkFactory, SignalingState};
use consult_rtc::signaling::protocol::{IceCandidate, SdpType, SessionDescription};
use consult_rtc::{CallConfig, Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct NetState {
    links: HashMap<u64, Arc<LinkCore>>,
    /// Links never connect while set
    blackhole: bool,
    /// Link creation fails while set
    refuse_links: bool,
    /// Offer creation fails while set
    fail_offers: bool,
    offers: HashMap<String, usize>,
    ice_restarts: HashMap<String, usize>,
}

/// Shared medium for fake links
#[derive(Clone, Default)]
pub struct FakeNetwork {
    state: Arc<Mutex<NetState>>,
    next_id: Arc<AtomicU64>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose links count their offers under `owner`
    pub fn factory(&self, owner: &str) -> Arc<FakeLinkFactory> {
        Arc::new(FakeLinkFactory {
            network: self.clone(),
            owner: owner.to_string(),
        })
    }

    /// Stop (or resume) connecting link pairs
    pub fn set_blackhole(&self, blackhole: bool) {
        self.state.lock().blackhole = blackhole;
    }

    pub fn set_refuse_links(&self, refuse: bool) {
        self.state.lock().refuse_links = refuse;
    }

    /// Make every `create_offer` fail, as a broken SDP stack would
    pub fn set_fail_offers(&self, fail: bool) {
        self.state.lock().fail_offers = fail;
    }

    /// Drop every established pair; both ends report `Failed`
    pub fn fail_all(&self) {
        let links: Vec<Arc<LinkCore>> = self.state.lock().links.values().cloned().collect();
        for link in links {
            let was_connected = {
                let mut inner = link.inner.lock();
                std::mem::replace(&mut inner.connected, false)
            };
            if was_connected {
                link.emit(LinkEvent::StateChanged(LinkState::Failed));
            }
        }
    }

    /// Offers created by `owner`'s links
    pub fn offers(&self, owner: &str) -> usize {
        self.state.lock().offers.get(owner).copied().unwrap_or(0)
    }

    /// ICE-restart offers created by `owner`'s links
    pub fn ice_restarts(&self, owner: &str) -> usize {
        self.state.lock().ice_restarts.get(owner).copied().unwrap_or(0)
    }

    /// Open links currently connected
    pub fn connected_links(&self) -> usize {
        self.state
            .lock()
            .links
            .values()
            .filter(|l| {
                let inner = l.inner.lock();
                inner.connected && !inner.closed
            })
            .count()
    }

    /// Remote candidates accepted by all links
    pub fn remote_candidates(&self) -> usize {
        self.state
            .lock()
            .links
            .values()
            .map(|l| l.inner.lock().remote_candidates)
            .sum()
    }

    /// Links not yet closed
    pub fn open_links(&self) -> usize {
        self.state
            .lock()
            .links
            .values()
            .filter(|l| !l.inner.lock().closed)
            .count()
    }

    fn link(&self, id: u64) -> Option<Arc<LinkCore>> {
        self.state.lock().links.get(&id).cloned()
    }

    /// Connect `core` with its partner if both hold each other's description
    fn try_connect(&self, core: &Arc<LinkCore>) {
        if self.state.lock().blackhole {
            return;
        }
        let partner_id = {
            let inner = core.inner.lock();
            if inner.closed || inner.connected {
                return;
            }
            match inner.partner {
                Some(id) => id,
                None => return,
            }
        };
        let Some(partner) = self.link(partner_id) else {
            return;
        };
        {
            let inner = partner.inner.lock();
            if inner.closed || inner.partner != Some(core.id) {
                return;
            }
        }

        for (link, other) in [(core, &partner), (&partner, core)] {
            let newly = {
                let mut inner = link.inner.lock();
                !std::mem::replace(&mut inner.connected, true)
            };
            if !newly {
                continue;
            }
            link.emit(LinkEvent::StateChanged(LinkState::Connecting));
            link.emit(LinkEvent::StateChanged(LinkState::Connected));
            let tracks = other.tracks.lock().clone();
            for (id, kind) in tracks {
                link.emit(LinkEvent::RemoteTrack {
                    id,
                    kind,
                    stream_id: Some(format!("stream-{}", other.id)),
                });
            }
        }
    }
}

struct LinkInner {
    signaling: SignalingState,
    has_remote: bool,
    partner: Option<u64>,
    connected: bool,
    closed: bool,
    offer_version: u32,
    remote_candidates: usize,
}

struct LinkCore {
    id: u64,
    sink: LinkEventSink,
    detached: AtomicBool,
    tracks: Mutex<Vec<(String, TrackKind)>>,
    inner: Mutex<LinkInner>,
}

impl LinkCore {
    fn emit(&self, event: LinkEvent) {
        if !self.detached.load(Ordering::SeqCst) {
            self.sink.emit(event);
        }
    }
}

fn link_id_in(sdp: &str, key: &str) -> Option<u64> {
    sdp.split_whitespace()
        .find_map(|part| part.strip_prefix(key))
        .and_then(|id| id.parse().ok())
}

/// One fake peer connection
pub struct FakeLink {
    network: FakeNetwork,
    owner: String,
    core: Arc<LinkCore>,
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn add_local_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        self.core
            .tracks
            .lock()
            .push((track.id().to_string(), track.kind()));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        if self.network.state.lock().fail_offers {
            return Err(Error::SdpError("offer generation failed".to_string()));
        }
        let version = {
            let mut inner = self.core.inner.lock();
            if inner.closed {
                return Err(Error::PeerConnectionError("link closed".to_string()));
            }
            inner.signaling = SignalingState::HaveLocalOffer;
            inner.offer_version += 1;
            inner.offer_version
        };
        {
            let mut net = self.network.state.lock();
            *net.offers.entry(self.owner.clone()).or_default() += 1;
            if ice_restart {
                *net.ice_restarts.entry(self.owner.clone()).or_default() += 1;
            }
        }
        self.core.emit(LinkEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 1 127.0.0.1 9 typ host", self.core.id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
        Ok(SessionDescription::offer(format!(
            "fake link={} v={} restart={}",
            self.core.id, version, ice_restart
        )))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::SdpError("not an offer".to_string()));
        }
        let Some(remote) = link_id_in(&offer.sdp, "link=") else {
            return Err(Error::SdpError(format!("malformed offer: {}", offer.sdp)));
        };
        {
            let mut inner = self.core.inner.lock();
            if inner.closed {
                return Err(Error::PeerConnectionError("link closed".to_string()));
            }
            if inner.signaling == SignalingState::HaveLocalOffer {
                return Err(Error::SdpError(
                    "remote offer in have-local-offer".to_string(),
                ));
            }
            if inner.partner.map_or(false, |p| p != remote) {
                return Err(Error::SdpError("offer from a different session".to_string()));
            }
            inner.partner = Some(remote);
            inner.has_remote = true;
            inner.signaling = SignalingState::Stable;
        }
        self.network.try_connect(&self.core);
        Ok(SessionDescription::answer(format!(
            "fake link={} for={}",
            self.core.id, remote
        )))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<()> {
        let Some(remote) = link_id_in(&answer.sdp, "link=") else {
            return Err(Error::SdpError(format!("malformed answer: {}", answer.sdp)));
        };
        if link_id_in(&answer.sdp, "for=") != Some(self.core.id) {
            return Err(Error::SdpError("answer for another link".to_string()));
        }
        {
            let mut inner = self.core.inner.lock();
            if inner.signaling != SignalingState::HaveLocalOffer {
                return Err(Error::SdpError("no local offer".to_string()));
            }
            inner.partner = Some(remote);
            inner.has_remote = true;
            inner.signaling = SignalingState::Stable;
        }
        self.network.try_connect(&self.core);
        Ok(())
    }

    /// Unsupported, like webrtc-rs
    async fn rollback(&self) -> Result<()> {
        Err(Error::SdpError("rollback not supported".to_string()))
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        let mut inner = self.core.inner.lock();
        if !inner.has_remote {
            return Err(Error::PeerConnectionError(
                "candidate before remote description".to_string(),
            ));
        }
        inner.remote_candidates += 1;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.core.inner.lock().signaling
    }

    fn has_remote_description(&self) -> bool {
        self.core.inner.lock().has_remote
    }

    fn detach(&self) {
        self.core.detached.store(true, Ordering::SeqCst);
    }

    async fn close(&self) -> Result<()> {
        let (partner, was_connected) = {
            let mut inner = self.core.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.signaling = SignalingState::Closed;
            (inner.partner, std::mem::replace(&mut inner.connected, false))
        };
        if !was_connected {
            return Ok(());
        }
        if let Some(partner) = partner.and_then(|id| self.network.link(id)) {
            let dropped = {
                let mut inner = partner.inner.lock();
                std::mem::replace(&mut inner.connected, false)
            };
            if dropped {
                partner.emit(LinkEvent::StateChanged(LinkState::Disconnected));
            }
        }
        Ok(())
    }
}

/// Builds [`FakeLink`]s on one network
pub struct FakeLinkFactory {
    network: FakeNetwork,
    owner: String,
}

#[async_trait]
impl PeerLinkFactory for FakeLinkFactory {
    async fn create(&self, _config: &CallConfig, sink: LinkEventSink) -> Result<Arc<dyn PeerLink>> {
        if self.network.state.lock().refuse_links {
            return Err(Error::PeerConnectionError("link creation refused".to_string()));
        }
        let id = self.network.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let core = Arc::new(LinkCore {
            id,
            sink,
            detached: AtomicBool::new(false),
            tracks: Mutex::new(Vec::new()),
            inner: Mutex::new(LinkInner {
                signaling: SignalingState::Stable,
                has_remote: false,
                partner: None,
                connected: false,
                closed: false,
                offer_version: 0,
                remote_candidates: 0,
            }),
        });
        self.network.state.lock().links.insert(id, core.clone());
        Ok(Arc::new(FakeLink {
            network: self.network.clone(),
            owner: self.owner.clone(),
            core,
        }))
    }
}
