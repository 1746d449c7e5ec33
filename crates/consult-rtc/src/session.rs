//! Call session facade
//!
//! The only type a caller needs: `initialize`, toggles, `reconnect`,
//! `end_call`, and a broadcast stream of [`SessionEvent`]s.

use crate::config::CallConfig;
use crate::health::HealthMonitor;
use crate::media::source::acquire;
use crate::media::{LocalMedia, MediaSource, SyntheticMediaSource, TrackKind};
use crate::negotiation::{
    EngineContext, EngineHandle, EnginePhase, EngineSnapshot, NegotiationEngine, SessionEvent,
};
use crate::peer::{PeerLinkFactory, RtcPeerLinkFactory};
use crate::room::RoomMembership;
use crate::signaling::polling::PollingTransport;
use crate::signaling::websocket::WebSocketTransport;
use crate::signaling::{
    EventReceiver, ParticipantContext, RoomId, SignalHub, SignalTransport,
};
use crate::supervisor::Supervisor;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Diagnostics returned by [`CallSession::stats`]
pub type SessionStats = EngineSnapshot;

const EVENT_CAPACITY: usize = 128;

/// Collaborators a session runs on
pub struct SessionParts {
    pub hub: Arc<SignalHub>,
    /// Receiver for the channel every transport in `hub` publishes on
    pub transport_events: EventReceiver,
    pub health: Option<Arc<HealthMonitor>>,
    pub media_source: Arc<dyn MediaSource>,
    pub link_factory: Arc<dyn PeerLinkFactory>,
}

impl SessionParts {
    /// WebSocket + polling transports against the configured relay, webrtc-rs
    /// peer links and synthetic media
    pub fn from_config(config: &CallConfig) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let health = HealthMonitor::shared(&config.relay_url, &config.health)?;

        let primary: Option<Arc<dyn SignalTransport>> = if config.transport.primary_enabled {
            Some(Arc::new(WebSocketTransport::new(config, tx.clone())?))
        } else {
            None
        };
        let fallback: Arc<dyn SignalTransport> = Arc::new(PollingTransport::new(
            config,
            tx.clone(),
            Some(health.clone()),
        )?);
        let hub = SignalHub::new(
            primary,
            fallback,
            Some(health.clone()),
            &config.transport,
            tx,
        );

        Ok(Self {
            hub,
            transport_events: rx,
            health: Some(health),
            media_source: Arc::new(SyntheticMediaSource::default()),
            link_factory: Arc::new(RtcPeerLinkFactory),
        })
    }

    pub fn with_media_source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.media_source = source;
        self
    }
}

#[derive(Default)]
struct SessionState {
    initialized: bool,
    ended: bool,
    engine: Option<EngineHandle>,
    engine_task: Option<JoinHandle<()>>,
    supervisor: Option<Supervisor>,
    local_media: Option<LocalMedia>,
}

/// One consultation call
pub struct CallSession {
    config: Arc<CallConfig>,
    room: RoomId,
    participant: ParticipantContext,
    hub: Arc<SignalHub>,
    membership: Arc<RoomMembership>,
    health: Option<Arc<HealthMonitor>>,
    media_source: Arc<dyn MediaSource>,
    link_factory: Arc<dyn PeerLinkFactory>,
    events: broadcast::Sender<SessionEvent>,

    /// Held until the engine takes it over
    snapshot_tx: Mutex<Option<watch::Sender<EngineSnapshot>>>,
    snapshot_rx: watch::Receiver<EngineSnapshot>,
    transport_events: Mutex<Option<EventReceiver>>,
    state: Mutex<SessionState>,
}

impl CallSession {
    /// Create a session against the configured relay
    ///
    /// # Arguments
    ///
    /// * `config` - Call configuration; validated here
    /// * `room` - Room shared by both participants
    /// * `participant` - Appointment and role we join as
    pub fn new(config: CallConfig, room: RoomId, participant: ParticipantContext) -> Result<Self> {
        config.validate()?;
        let parts = SessionParts::from_config(&config)?;
        Ok(Self::with_parts(config, room, participant, parts))
    }

    /// Create a session on explicit collaborators
    pub fn with_parts(
        config: CallConfig,
        room: RoomId,
        participant: ParticipantContext,
        parts: SessionParts,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot {
            transport: parts.hub.route(),
            ..Default::default()
        });

        Self {
            config: Arc::new(config),
            room,
            participant,
            membership: Arc::new(RoomMembership::new(parts.hub.clone())),
            hub: parts.hub,
            health: parts.health,
            media_source: parts.media_source,
            link_factory: parts.link_factory,
            events,
            snapshot_tx: Mutex::new(Some(snapshot_tx)),
            snapshot_rx,
            transport_events: Mutex::new(Some(parts.transport_events)),
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Subscribe to session events; subscribe before `initialize` to see them all
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Set the phase while no engine owns the snapshot
    fn set_phase(&self, phase: EnginePhase) {
        if let Some(tx) = self.snapshot_tx.lock().as_ref() {
            tx.send_modify(|s| s.phase = phase);
        }
    }

    /// Start the call
    ///
    /// Connects signaling, acquires media, starts negotiation, joins the
    /// room and starts supervision. Fails only if no media device is usable,
    /// the relay rejects our credentials, or the session was already started.
    #[instrument(skip(self), fields(room = %self.room, role = %self.participant.role))]
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.ended {
                return Err(Error::SessionEnded("Call already ended".to_string()));
            }
            if state.initialized {
                return Err(Error::SessionEnded("Call already initialized".to_string()));
            }
            state.initialized = true;
        }

        let outcome = self.hub.connect().await;
        info!("Signaling ready: {:?}", outcome);

        self.set_phase(EnginePhase::GatheringMedia);
        let media = match acquire(self.media_source.as_ref(), &self.config.media).await {
            Ok(media) => media,
            Err(e) => {
                error!("Media acquisition failed: {}", e);
                self.set_phase(EnginePhase::Failed);
                self.emit(SessionEvent::Error(e.to_string()));
                self.hub.disconnect().await;
                return Err(e);
            }
        };
        self.emit(SessionEvent::LocalStream(media.clone()));

        let (transport_events, snapshot_tx) = (
            self.transport_events.lock().take(),
            self.snapshot_tx.lock().take(),
        );
        let (Some(transport_events), Some(snapshot_tx)) = (transport_events, snapshot_tx) else {
            return Err(Error::SessionEnded("Session already consumed".to_string()));
        };

        let (engine, engine_task) = NegotiationEngine::spawn(
            EngineContext {
                config: self.config.clone(),
                hub: self.hub.clone(),
                room: self.room.clone(),
                membership: self.membership.clone(),
                local_media: media.clone(),
                factory: self.link_factory.clone(),
                events: self.events.clone(),
            },
            transport_events,
            snapshot_tx,
        );

        let ack = match self.membership.join(&self.room, &self.participant).await {
            Ok(ack) => ack,
            Err(e) => {
                error!("Joining room failed: {}", e);
                engine.end().await;
                media.stop_all();
                self.hub.disconnect().await;
                self.emit(SessionEvent::Error(e.to_string()));
                return Err(e);
            }
        };
        info!("Joined as {} ({})", ack.identity.user_id, ack.identity.role);
        engine.start(ack);

        let supervisor = Supervisor::spawn(
            engine.clone(),
            self.membership.clone(),
            self.health.clone(),
            self.config.supervisor.clone(),
        );

        let ended_meanwhile = {
            let mut state = self.state.lock();
            state.engine = Some(engine.clone());
            state.engine_task = Some(engine_task);
            state.supervisor = Some(supervisor);
            state.local_media = Some(media);
            state.ended
        };
        if ended_meanwhile {
            debug!("Call ended during initialization");
            self.state.lock().ended = false;
            self.end_call().await;
        }
        Ok(())
    }

    fn engine(&self) -> Option<EngineHandle> {
        self.state.lock().engine.clone()
    }

    fn toggle(&self, kind: TrackKind, enabled: bool) {
        if let Some(engine) = self.engine() {
            engine.toggle(kind, enabled);
        } else if let Some(track) = self
            .state
            .lock()
            .local_media
            .as_ref()
            .and_then(|m| m.track(kind).cloned())
        {
            track.set_enabled(enabled);
        } else {
            debug!("No local {} track to toggle", kind);
        }
    }

    /// Enable or disable the camera without renegotiating
    pub fn toggle_video(&self, enabled: bool) {
        self.toggle(TrackKind::Video, enabled);
    }

    /// Enable or disable the microphone without renegotiating
    pub fn toggle_audio(&self, enabled: bool) {
        self.toggle(TrackKind::Audio, enabled);
    }

    /// Rebuild the peer link; no-op before `initialize` or after `end_call`
    pub fn reconnect(&self) {
        if self.state.lock().ended {
            return;
        }
        match self.engine() {
            Some(engine) => {
                info!("Manual reconnect requested");
                engine.manual_refresh();
            }
            None => debug!("Reconnect before initialize ignored"),
        }
    }

    /// End the call and release everything; safe to call repeatedly
    pub async fn end_call(&self) {
        let (engine, engine_task, supervisor, media) = {
            let mut state = self.state.lock();
            if state.ended {
                return;
            }
            state.ended = true;
            (
                state.engine.take(),
                state.engine_task.take(),
                state.supervisor.take(),
                state.local_media.take(),
            )
        };
        info!("Ending call in room {}", self.room);

        if let Some(supervisor) = supervisor {
            supervisor.stop();
        }
        if let Some(engine) = engine {
            engine.end().await;
        }
        if let Some(task) = engine_task {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }
        if let Some(media) = media {
            media.stop_all();
        }
        self.membership.leave().await;
        self.hub.disconnect().await;
        self.set_phase(EnginePhase::Ended);
        info!("Call ended");
    }

    pub fn phase(&self) -> EnginePhase {
        self.snapshot_rx.borrow().phase
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = self.snapshot_rx.borrow().clone();
        stats.transport = self.hub.route();
        stats
    }

    /// Watch receiver for phase and counter changes
    pub fn watch(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn local_media(&self) -> Option<LocalMedia> {
        self.state.lock().local_media.clone()
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }
}
