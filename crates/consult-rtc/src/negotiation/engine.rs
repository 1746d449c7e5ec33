//! Negotiation engine actor
//!
//! Offer/answer, candidate exchange, glare handling, grace periods,
//! ICE-restart reconnection, refreshes and direct mode. Everything runs on
//! one task; the only concurrency is between this task and the timers and
//! link callbacks that post back into it.

use super::session::NegotiationSession;
use super::timers::{TimerFired, TimerKind, Timers};
use super::{Command, EngineHandle, EnginePhase, EngineSnapshot, SessionEvent};
use crate::config::CallConfig;
use crate::media::{LocalMedia, RemoteMedia, RemoteTrack};
use crate::peer::link::{LinkEvent, LinkState, PeerLinkFactory, SignalingState};
use crate::room::RoomMembership;
use crate::signaling::protocol::{SessionDescription, SignalKind, SignalingEnvelope};
use crate::signaling::{
    EventReceiver, JoinAck, ParticipantIdentity, RoomId, SignalHub, TransportEvent,
    TransportKind,
};
use crate::Error;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// What the engine needs from its session
pub struct EngineContext {
    pub config: Arc<CallConfig>,
    pub hub: Arc<SignalHub>,
    pub room: RoomId,
    /// Used to re-join over polling when the route changes under us
    pub membership: Arc<RoomMembership>,
    pub local_media: LocalMedia,
    pub factory: Arc<dyn PeerLinkFactory>,
    pub events: broadcast::Sender<SessionEvent>,
}

/// Timers that belong to one negotiation session
const SESSION_TIMERS: [TimerKind; 3] = [
    TimerKind::InitialOffer,
    TimerKind::DisconnectGrace,
    TimerKind::Reconnect,
];

pub struct NegotiationEngine {
    ctx: EngineContext,
    snapshot: watch::Sender<EngineSnapshot>,
    link_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    timers: Timers,

    identity: Option<ParticipantIdentity>,
    peer_id: Option<String>,
    peer_present: bool,

    session: Option<NegotiationSession>,
    next_generation: u64,
    remote_media: RemoteMedia,

    phase: EnginePhase,
    negotiation_errors: u32,
    relay_exhausted: bool,

    /// Transport events that arrived before `Start`
    backlog: Vec<TransportEvent>,
}

impl NegotiationEngine {
    /// Spawn the engine task
    ///
    /// # Arguments
    ///
    /// * `ctx` - Collaborators and local media
    /// * `transport_events` - Receiver the signal transports publish on
    /// * `snapshot` - Watch sender the engine publishes its state on
    pub fn spawn(
        ctx: EngineContext,
        transport_events: EventReceiver,
        snapshot: watch::Sender<EngineSnapshot>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let handle = EngineHandle::new(command_tx, snapshot.subscribe());
        let phase = snapshot.borrow().phase;
        let span = info_span!("engine", room = %ctx.room);

        let engine = Self {
            ctx,
            snapshot,
            link_tx,
            timers: Timers::new(timer_tx),
            identity: None,
            peer_id: None,
            peer_present: false,
            session: None,
            next_generation: 0,
            remote_media: RemoteMedia::new(),
            phase,
            negotiation_errors: 0,
            relay_exhausted: false,
            backlog: Vec::new(),
        };

        let task = tokio::spawn(
            engine
                .run(command_rx, transport_events, link_rx, timer_rx)
                .instrument(span),
        );
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport: EventReceiver,
        mut link_events: mpsc::UnboundedReceiver<(u64, LinkEvent)>,
        mut timer_events: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        debug!("Negotiation engine started");
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::End(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },

                Some((kind, token)) = timer_events.recv() => {
                    if self.timers.take_fired(kind, token) {
                        self.handle_timer(kind).await;
                    }
                }

                Some((generation, event)) = link_events.recv() => {
                    self.handle_link_event(generation, event).await;
                }

                Some(event) = transport.recv() => {
                    self.handle_transport_event(event).await;
                }
            }
            self.publish();
        }
        self.publish();
        info!("Negotiation engine stopped");
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn publish(&self) {
        let session = self.session.as_ref();
        self.snapshot.send_replace(EngineSnapshot {
            phase: self.phase,
            generation: session.map_or(0, |s| s.generation()),
            reconnect_attempts: session.map_or(0, |s| s.tracker().attempts()),
            negotiation_errors: self.negotiation_errors,
            transport: self.ctx.hub.route(),
            peer_present: self.peer_present,
        });
    }

    fn set_phase(&mut self, phase: EnginePhase) {
        if self.phase != phase {
            info!("Phase {} -> {}", self.phase, phase);
            self.phase = phase;
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.ctx.events.send(event);
    }

    fn negotiation_failed(&mut self, context: &str, err: &Error) {
        if !err.is_negotiation_error() {
            error!("Local failure during {}: {}", context, err);
            return;
        }
        self.negotiation_errors += 1;
        warn!(
            "Negotiation error ({} so far) during {}: {}",
            self.negotiation_errors, context, err
        );
    }

    fn my_id(&self) -> Option<String> {
        self.identity.as_ref().map(|i| i.user_id.clone())
    }

    /// Address an envelope to the peer (broadcast while the peer is unknown)
    fn send_envelope(&self, envelope: SignalingEnvelope) {
        self.ctx
            .hub
            .send(&self.ctx.room, envelope.with_target(self.peer_id.clone()));
    }

    /// Open a fresh negotiation session with the next generation
    async fn open_session(&mut self) -> bool {
        self.next_generation += 1;
        let generation = self.next_generation;
        let opened = NegotiationSession::open(
            generation,
            self.ctx.factory.as_ref(),
            &self.ctx.config,
            &self.ctx.local_media,
            self.link_tx.clone(),
        )
        .await;

        match opened {
            Ok(session) => {
                self.session = Some(session);
                true
            }
            Err(e) => {
                error!("Failed to build peer link: {}", e);
                self.timers.cancel_all();
                self.set_phase(EnginePhase::Failed);
                self.emit(SessionEvent::Error(format!(
                    "Failed to create peer connection: {}",
                    e
                )));
                false
            }
        }
    }

    /// Close the current session, reporting a drop if its episode was open
    async fn close_session(&mut self) {
        for kind in SESSION_TIMERS {
            self.timers.cancel(kind);
        }
        if let Some(mut old) = self.session.take() {
            if old.close_episode() {
                self.emit(SessionEvent::PeerDisconnected { permanent: false });
            }
            old.close().await;
        }
        self.remote_media.clear();
    }

    async fn replace_session(&mut self) -> bool {
        self.close_session().await;
        self.open_session().await
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(ack) => self.start(ack).await,
            Command::Toggle { kind, enabled } => {
                let Some(track) = self.ctx.local_media.track(kind) else {
                    debug!("No local {} track to toggle", kind);
                    return;
                };
                if !track.set_enabled(enabled) {
                    return;
                }
                info!("Local {} {}", kind, if enabled { "enabled" } else { "disabled" });
                if let Some(me) = self.my_id() {
                    self.send_envelope(SignalingEnvelope::media_state(&me, kind, enabled));
                }
            }
            Command::Refresh { reason, manual } => self.begin_refresh(&reason, manual).await,
            Command::GiveUp { reason } => {
                if self.phase.is_terminal() {
                    return;
                }
                error!("Giving up on call: {}", reason);
                self.timers.cancel_all();
                self.close_session().await;
                self.set_phase(EnginePhase::Failed);
                self.emit(SessionEvent::Error(reason));
            }
            Command::End(_) => {}
        }
    }

    async fn start(&mut self, ack: JoinAck) {
        if self.identity.is_some() {
            warn!("Engine already started, ignoring second start");
            return;
        }
        info!(
            "Starting negotiation as {} ({}), peer present: {}",
            ack.identity.user_id, ack.identity.role, ack.peer_present
        );
        self.identity = Some(ack.identity);
        self.peer_present = ack.peer_present;
        self.set_phase(EnginePhase::Connecting);
        self.timers.arm(
            TimerKind::Establishment,
            self.ctx.config.negotiation.establishment_timeout(),
        );

        if !self.open_session().await {
            return;
        }

        if self.peer_present {
            // The peer gets our join notice and offers; offer ourselves only if it never does
            self.timers.arm(
                TimerKind::InitialOffer,
                self.ctx.config.negotiation.initial_offer_wait(),
            );
        }

        for event in std::mem::take(&mut self.backlog) {
            self.handle_transport_event(event).await;
        }
        if self.ctx.hub.is_direct() {
            self.enter_direct_mode().await;
        }
    }

    async fn begin_refresh(&mut self, reason: &str, manual: bool) {
        if self.phase == EnginePhase::Ended || self.identity.is_none() {
            return;
        }
        if !manual && self.phase == EnginePhase::Failed {
            debug!("Call failed, ignoring refresh: {}", reason);
            return;
        }
        if self.timers.is_armed(TimerKind::RefreshCooldown) {
            debug!("Refresh already in progress, ignoring: {}", reason);
            return;
        }
        if manual {
            self.negotiation_errors = 0;
        }

        info!("Refreshing peer link: {}", reason);
        self.timers.cancel(TimerKind::Establishment);
        self.close_session().await;
        self.set_phase(EnginePhase::Reconnecting);
        self.emit(SessionEvent::Reconnecting);
        self.timers.arm(
            TimerKind::RefreshCooldown,
            self.ctx.config.supervisor.refresh_cooldown(),
        );
    }

    /// Re-read presence from the relay; keeps the last value if it can't answer
    async fn refresh_presence(&mut self) {
        if self.relay_exhausted {
            return;
        }
        if let Some(me) = &self.identity {
            let counterpart = me.role.counterpart();
            match self.ctx.hub.room_status(&self.ctx.room).await {
                Ok(status) => self.peer_present = status.is_present(counterpart),
                Err(e) => debug!("Room status unavailable: {}", e),
            }
        }
    }

    /// Rebuild after the refresh cooldown
    async fn finish_refresh(&mut self) {
        self.refresh_presence().await;

        if !self.open_session().await {
            return;
        }
        self.set_phase(EnginePhase::Connecting);
        self.timers.arm(
            TimerKind::Establishment,
            self.ctx.config.negotiation.establishment_timeout(),
        );
        if self.peer_present || self.relay_exhausted {
            self.send_offer(false).await;
        }
    }

    /// Stop everything; safe to call more than once
    async fn shutdown(&mut self) {
        if self.phase == EnginePhase::Ended {
            return;
        }
        info!("Ending negotiation");
        self.timers.cancel_all();
        if let Some(old) = self.session.take() {
            old.close().await;
        }
        self.remote_media.clear();
        self.backlog.clear();
        self.negotiation_errors = 0;
        self.set_phase(EnginePhase::Ended);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    async fn handle_timer(&mut self, kind: TimerKind) {
        trace!("{:?} timer fired", kind);
        match kind {
            TimerKind::InitialOffer => {
                let idle = self.session.as_ref().map_or(false, |s| {
                    s.link().signaling_state() == SignalingState::Stable
                        && !s.link().has_remote_description()
                });
                if idle {
                    info!("No offer from the peer already in the room, offering");
                    self.send_offer(false).await;
                }
            }
            TimerKind::DisconnectGrace => {
                let still_down = self
                    .session
                    .as_ref()
                    .map_or(false, |s| s.link_state() != LinkState::Connected);
                if still_down && self.phase == EnginePhase::Disconnecting {
                    warn!("Link still down after grace period");
                    self.connection_lost().await;
                }
            }
            TimerKind::Reconnect => self.reconnect_step().await,
            TimerKind::Establishment => {
                if self.phase == EnginePhase::Connected || self.phase.is_terminal() {
                    return;
                }
                self.refresh_presence().await;
                if !self.peer_present && !self.relay_exhausted {
                    // Waiting alone is not a failure
                    debug!("Peer not in the room yet, still waiting");
                    self.timers.arm(
                        TimerKind::Establishment,
                        self.ctx.config.negotiation.establishment_timeout(),
                    );
                    return;
                }
                warn!("Peer connection not established in time");
                self.begin_refresh("connection establishment timed out", false)
                    .await;
            }
            TimerKind::RefreshCooldown => self.finish_refresh().await,
            TimerKind::DirectOffer => {
                if self.phase == EnginePhase::Connected || self.phase.is_terminal() {
                    return;
                }
                let restart = self
                    .session
                    .as_ref()
                    .map_or(false, |s| s.link().has_remote_description());
                debug!("Direct mode: re-issuing offer");
                self.send_offer(restart).await;
                self.timers.arm(
                    TimerKind::DirectOffer,
                    self.ctx.config.transport.direct_offer_interval(),
                );
            }
            TimerKind::DirectGiveUp => {
                if self.phase == EnginePhase::Connected || self.phase.is_terminal() {
                    return;
                }
                error!("No relay and no direct connection, giving up");
                self.timers.cancel_all();
                self.close_session().await;
                self.set_phase(EnginePhase::Failed);
                self.emit(SessionEvent::Error(
                    "No signaling relay reachable and direct connection timed out".to_string(),
                ));
            }
        }
    }

    // ------------------------------------------------------------------
    // Offer / answer
    // ------------------------------------------------------------------

    async fn send_offer(&mut self, ice_restart: bool) {
        let Some(me) = self.my_id() else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let first = !session.link().has_remote_description();
        let created = session.link().create_offer(ice_restart).await;
        let result = created.and_then(|offer| SignalingEnvelope::offer(&me, &offer));
        match result {
            Ok(envelope) => {
                if first {
                    session.mark_initial_offerer();
                }
                debug!(
                    "Sending offer (generation {}, ice restart: {})",
                    session.generation(),
                    ice_restart
                );
                self.send_envelope(envelope);
            }
            Err(e) => self.negotiation_failed("offer creation", &e),
        }
    }

    async fn on_offer(&mut self, envelope: SignalingEnvelope) {
        let offer = match envelope.description() {
            Ok(offer) => offer,
            Err(e) => {
                self.negotiation_failed("offer decoding", &e);
                return;
            }
        };
        self.timers.cancel(TimerKind::InitialOffer);

        if self.session.is_none() {
            if !self.timers.is_armed(TimerKind::RefreshCooldown) {
                debug!("No peer link, ignoring offer");
                return;
            }
            // Peer is already renegotiating; rebuild now instead of after the cooldown
            self.timers.cancel(TimerKind::RefreshCooldown);
            if !self.open_session().await {
                return;
            }
            self.set_phase(EnginePhase::Connecting);
            self.timers.arm(
                TimerKind::Establishment,
                self.ctx.config.negotiation.establishment_timeout(),
            );
        }

        let Some(me) = self.my_id() else {
            return;
        };
        let polite = me < envelope.sender_id;

        let colliding = self
            .session
            .as_ref()
            .map_or(false, |s| s.link().signaling_state() == SignalingState::HaveLocalOffer);
        if colliding {
            if !polite {
                info!("Offer collision with {}, keeping our offer", envelope.sender_id);
                return;
            }
            info!("Offer collision with {}, yielding", envelope.sender_id);
            let rolled_back = match &self.session {
                Some(s) => s.link().rollback().await,
                None => return,
            };
            if let Err(e) = rolled_back {
                debug!("Rollback unavailable ({}), replacing peer link", e);
                if !self.replace_session().await {
                    return;
                }
            }
        }

        let had_remote = self
            .session
            .as_ref()
            .map_or(false, |s| s.link().has_remote_description());
        let answer = match self.accept_offer(offer.clone()).await {
            Some(Ok(answer)) => answer,
            Some(Err(e)) if had_remote => {
                warn!("Current link rejected offer ({}), retrying on a fresh link", e);
                if !self.replace_session().await {
                    return;
                }
                match self.accept_offer(offer).await {
                    Some(Ok(answer)) => answer,
                    Some(Err(e)) => {
                        self.negotiation_failed("offer handling", &e);
                        return;
                    }
                    None => return,
                }
            }
            Some(Err(e)) => {
                self.negotiation_failed("offer handling", &e);
                return;
            }
            None => return,
        };

        match SignalingEnvelope::answer(&me, &answer) {
            Ok(envelope) => self.send_envelope(envelope),
            Err(e) => {
                self.negotiation_failed("answer encoding", &e);
                return;
            }
        }
        self.flush_candidates().await;

        if self.phase == EnginePhase::Failed {
            self.set_phase(EnginePhase::Connecting);
        }
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Option<crate::Result<SessionDescription>> {
        let session = self.session.as_ref()?;
        Some(session.link().accept_offer(offer).await)
    }

    async fn on_answer(&mut self, envelope: SignalingEnvelope) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.link().signaling_state() != SignalingState::HaveLocalOffer {
            debug!("Discarding answer, no offer outstanding");
            return;
        }

        let applied = match envelope.description() {
            Ok(answer) => session.link().apply_answer(answer).await,
            Err(e) => Err(e),
        };
        match applied {
            Ok(()) => {
                debug!("Answer applied");
                self.flush_candidates().await;
            }
            Err(e) => self.negotiation_failed("answer handling", &e),
        }
    }

    async fn on_candidate(&mut self, envelope: SignalingEnvelope) {
        let candidate = match envelope.ice_candidate() {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Ignoring candidate: {}", e);
                return;
            }
        };
        let Some(session) = self.session.as_mut() else {
            trace!("No peer link, dropping candidate");
            return;
        };

        if session.link().has_remote_description() {
            if let Err(e) = session.link().add_ice_candidate(candidate).await {
                warn!("Remote candidate rejected: {}", e);
            }
        } else {
            session.buffer_candidate(candidate);
        }
    }

    async fn flush_candidates(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.flush_candidates().await;
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.identity.is_none() {
            self.backlog.push(event);
            return;
        }
        match event {
            TransportEvent::Message(envelope) => self.handle_envelope(envelope).await,
            TransportEvent::PeerJoined(peer) => self.on_peer_joined(peer).await,
            TransportEvent::PeerLeft { user_id, role } => {
                let counterpart = self.identity.as_ref().map(|me| me.role.counterpart());
                let is_peer = match self.peer_id.as_deref() {
                    None => true,
                    Some(peer) => peer == user_id || (role.is_some() && role == counterpart),
                };
                if is_peer {
                    info!("Peer {} left the room", user_id);
                    self.peer_present = false;
                    self.timers.cancel(TimerKind::InitialOffer);
                } else {
                    debug!("Ignoring departure of {}", user_id);
                }
            }
            TransportEvent::RelayExhausted => self.enter_direct_mode().await,
            TransportEvent::RelayRestored => self.leave_direct_mode().await,
            TransportEvent::PrimaryLost => {
                let route = self.ctx.hub.route();
                if route != TransportKind::Primary {
                    debug!("Persistent channel lost while routing via {}", route);
                    return;
                }
                warn!("Persistent channel lost for good, moving to polling");
                self.rejoin_via_fallback().await;
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        let Some(me) = self.my_id() else {
            return;
        };
        if !envelope.is_for(&me) {
            return;
        }
        if self.peer_id.as_deref() != Some(envelope.sender_id.as_str()) {
            debug!("Peer identified as {}", envelope.sender_id);
            self.peer_id = Some(envelope.sender_id.clone());
        }
        self.peer_present = true;

        match envelope.kind {
            SignalKind::Offer => self.on_offer(envelope).await,
            SignalKind::Answer => self.on_answer(envelope).await,
            SignalKind::Candidate => self.on_candidate(envelope).await,
            SignalKind::VideoState | SignalKind::AudioState => {
                if let Some((kind, enabled)) = envelope.media_state_payload() {
                    debug!("Peer {} {}", kind, if enabled { "on" } else { "off" });
                    self.emit(SessionEvent::RemoteMediaState { kind, enabled });
                }
            }
            SignalKind::Keepalive => trace!("Keepalive from {}", envelope.sender_id),
        }
    }

    async fn on_peer_joined(&mut self, peer: ParticipantIdentity) {
        if self.my_id().as_deref() == Some(peer.user_id.as_str()) {
            return;
        }
        let known = self.peer_id.as_deref() == Some(peer.user_id.as_str());
        let linked = self
            .session
            .as_ref()
            .map_or(false, |s| s.link_state() == LinkState::Connected);
        if known && linked {
            // Same peer switching signaling routes
            debug!("Peer {} announced again, link unaffected", peer.user_id);
            self.peer_present = true;
            return;
        }

        info!("Peer {} ({}) joined", peer.user_id, peer.role);
        self.peer_id = Some(peer.user_id);
        self.peer_present = true;
        self.timers.cancel(TimerKind::InitialOffer);

        if self.session.is_none() {
            return;
        }

        // A returning peer has a fresh link; ours must start over too
        let used = self.session.as_ref().map_or(false, |s| {
            s.link().has_remote_description()
                || s.link().signaling_state() != SignalingState::Stable
        });
        if used {
            if !self.replace_session().await {
                return;
            }
            if self.phase != EnginePhase::Connecting {
                self.set_phase(EnginePhase::Connecting);
                self.timers.arm(
                    TimerKind::Establishment,
                    self.ctx.config.negotiation.establishment_timeout(),
                );
            }
        }
        self.send_offer(false).await;
    }

    async fn enter_direct_mode(&mut self) {
        if self.relay_exhausted {
            return;
        }
        self.relay_exhausted = true;
        if self.phase == EnginePhase::Connected || self.phase.is_terminal() {
            warn!("Relay exhausted; keeping the established peer link");
            return;
        }

        warn!("Relay exhausted, negotiating directly");
        let transport = &self.ctx.config.transport;
        let (interval, give_up) = (transport.direct_offer_interval(), transport.direct_give_up());
        self.timers.arm(TimerKind::DirectOffer, interval);
        self.timers.arm(TimerKind::DirectGiveUp, give_up);
        self.send_offer(false).await;
    }

    async fn leave_direct_mode(&mut self) {
        if !self.relay_exhausted {
            return;
        }
        self.relay_exhausted = false;
        self.timers.cancel(TimerKind::DirectOffer);
        self.timers.cancel(TimerKind::DirectGiveUp);
        info!("Relay restored, re-joining the room");
        self.rejoin_via_fallback().await;
    }

    /// Join the room again over polling and continue under the relay's identity
    ///
    /// A retryable failure puts the hub back into direct mode, which arrives
    /// here as `RelayExhausted`.
    async fn rejoin_via_fallback(&mut self) {
        let ack = match self.ctx.membership.rejoin_via_fallback().await {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Could not re-join the room: {}", e);
                return;
            }
        };
        let renamed = self.my_id().as_deref() != Some(ack.identity.user_id.as_str());
        if renamed {
            info!("Now known to the relay as {}", ack.identity.user_id);
        }
        self.identity = Some(ack.identity);
        self.peer_present = ack.peer_present;

        if !renamed || self.phase == EnginePhase::Connected || self.phase.is_terminal() {
            return;
        }
        // A pending refresh rebuilds on its own
        let Some(session) = self.session.as_ref() else {
            return;
        };

        // Offers made under the old identity are void
        let used = session.link().has_remote_description()
            || session.link().signaling_state() != SignalingState::Stable;
        if used && !self.replace_session().await {
            return;
        }
        self.set_phase(EnginePhase::Connecting);
        self.timers.arm(
            TimerKind::Establishment,
            self.ctx.config.negotiation.establishment_timeout(),
        );
        if self.peer_present {
            self.timers.arm(
                TimerKind::InitialOffer,
                self.ctx.config.negotiation.initial_offer_wait(),
            );
        }
    }

    // ------------------------------------------------------------------
    // Link events
    // ------------------------------------------------------------------

    async fn handle_link_event(&mut self, generation: u64, event: LinkEvent) {
        let current = self.session.as_ref().map(|s| s.generation());
        if current != Some(generation) {
            trace!("Dropping event from retired link {}", generation);
            return;
        }

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let Some(me) = self.my_id() else {
                    return;
                };
                match SignalingEnvelope::candidate(&me, &candidate) {
                    Ok(envelope) => self.send_envelope(envelope),
                    Err(e) => warn!("Dropping local candidate: {}", e),
                }
            }
            LinkEvent::StateChanged(state) => self.on_link_state(state).await,
            LinkEvent::RemoteTrack {
                id,
                kind,
                stream_id,
            } => {
                if let Some(session) = self.session.as_mut() {
                    session.mark_remote_track();
                }
                debug!("Remote {} track {}", kind, id);
                self.remote_media
                    .add(RemoteTrack { id, kind }, stream_id.as_deref());
                self.emit(SessionEvent::RemoteStream(self.remote_media.clone()));
            }
        }
    }

    async fn on_link_state(&mut self, state: LinkState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.set_link_state(state);
        debug!("Link {} state {:?}", session.generation(), state);

        match state {
            LinkState::Connected => {
                for kind in [
                    TimerKind::InitialOffer,
                    TimerKind::DisconnectGrace,
                    TimerKind::Reconnect,
                    TimerKind::Establishment,
                    TimerKind::DirectOffer,
                    TimerKind::DirectGiveUp,
                ] {
                    self.timers.cancel(kind);
                }
                session.tracker_mut().reset();
                let new_episode = session.open_episode();
                self.negotiation_errors = 0;
                self.set_phase(EnginePhase::Connected);

                if new_episode {
                    info!("Peer connected");
                    self.emit(SessionEvent::PeerConnected);
                    // Tracks may have arrived before the state change
                    if !self.remote_media.is_empty() {
                        self.emit(SessionEvent::RemoteStream(self.remote_media.clone()));
                    }
                } else {
                    info!("Link recovered within grace period");
                }
            }
            LinkState::Disconnected => {
                if self.phase == EnginePhase::Connected {
                    self.set_phase(EnginePhase::Disconnecting);
                    self.timers.arm(
                        TimerKind::DisconnectGrace,
                        self.ctx.config.negotiation.disconnect_grace(),
                    );
                }
            }
            LinkState::Failed | LinkState::Closed => {
                self.timers.cancel(TimerKind::DisconnectGrace);
                self.connection_lost().await;
            }
            LinkState::New | LinkState::Connecting => {}
        }
    }

    /// Report the drop and start ICE-restart reconnection
    async fn connection_lost(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.close_episode() {
            warn!("Peer disconnected");
            self.emit(SessionEvent::PeerDisconnected { permanent: false });
        }
        if self.timers.is_armed(TimerKind::Reconnect) {
            return;
        }

        self.set_phase(EnginePhase::Reconnecting);
        self.emit(SessionEvent::Reconnecting);
        let first_delay = self
            .session
            .as_ref()
            .and_then(|s| s.tracker().next_delay());
        match first_delay {
            Some(delay) => self.timers.arm(TimerKind::Reconnect, delay),
            None => self.reconnect_exhausted(),
        }
    }

    async fn reconnect_step(&mut self) {
        if self.phase == EnginePhase::Connected {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.tracker().is_exhausted() {
            self.reconnect_exhausted();
            return;
        }

        let attempt = session.tracker_mut().record_attempt();
        info!(
            "Reconnect attempt {}/{}",
            attempt,
            session.tracker().max_attempts()
        );
        self.send_offer(true).await;

        // Give this attempt time to land before the next one
        let wait = self.ctx.config.negotiation.reconnect.delay(attempt);
        self.timers.arm(TimerKind::Reconnect, wait);
    }

    fn reconnect_exhausted(&mut self) {
        let max = self
            .session
            .as_mut()
            .map(|s| {
                s.close_episode();
                s.tracker().max_attempts()
            })
            .unwrap_or_default();
        warn!("Reconnection failed after {} attempts", max);
        self.timers.cancel_all();
        self.set_phase(EnginePhase::Failed);
        self.emit(SessionEvent::PeerDisconnected { permanent: true });
    }
}
