//! Call session test harness
//!
//! Provides infrastructure for integration testing of call sessions with:
//! - An in-process relay ([`MemoryRelay`]) or a mock REST relay on a random port
//! - Fake peer links that pair up through a shared [`FakeNetwork`]
//! - Event and phase wait helpers that work under paused time
//!
//! Basic usage pattern:
//!
//! 1. Create a `MemoryRelay` and a `FakeNetwork`
//! 2. Build one `TestPeer` per participant with `TestPeer::memory`
//! 3. `initialize` both sessions and wait for `PeerConnected`
//! 4. Drive the scenario and assert on events, phases and relay records

#![allow(dead_code)]

pub mod fake_link;
pub mod relay_server;

pub use fake_link::{FakeLinkFactory, FakeNetwork};
pub use relay_server::MockRelayServer;

use consult_rtc::media::SyntheticMediaSource;
use consult_rtc::peer::BackoffPolicy;
use consult_rtc::signaling::memory::MemoryRelay;
use consult_rtc::signaling::{EventSender, SignalTransport};
use consult_rtc::{
    CallConfig, CallSession, EnginePhase, ParticipantContext, ParticipantIdentity, Role, RoomId,
    SessionEvent, SessionParts, SignalHub, TransportKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::mpsc;

pub const ROOM: &str = "room-42";

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,consult_rtc=debug")
        .with_test_writer()
        .try_init();
}

/// Defaults with deterministic (jitter-free) backoff
pub fn test_config() -> CallConfig {
    let mut config = CallConfig::default().with_token("test-token");
    config.transport.send_retry = BackoffPolicy::fixed(3, 100, 1000, 2.0);
    config.negotiation.reconnect = BackoffPolicy::fixed(5, 1000, 10000, 1.5);
    config
}

pub fn participant(role: Role) -> ParticipantContext {
    ParticipantContext {
        appointment_id: "appt-42".to_string(),
        role,
    }
}

/// Options for building a memory-relay peer
#[derive(Clone)]
pub struct PeerOptions {
    pub config: CallConfig,
    pub primary: bool,
    pub media: SyntheticMediaSource,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            config: test_config(),
            primary: true,
            media: SyntheticMediaSource::default(),
        }
    }
}

/// One participant with its event stream
pub struct TestPeer {
    pub id: String,
    pub session: CallSession,
    pub events: broadcast::Receiver<SessionEvent>,
    /// Publishes straight onto the engine's transport channel (memory peers only)
    pub inject: Option<EventSender>,
}

impl TestPeer {
    /// A participant on the in-memory relay
    pub fn memory(
        relay: &MemoryRelay,
        network: &FakeNetwork,
        user_id: &str,
        role: Role,
        options: PeerOptions,
    ) -> Self {
        let identity = ParticipantIdentity {
            user_id: user_id.to_string(),
            role,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let primary: Option<Arc<dyn SignalTransport>> = if options.primary {
            Some(relay.transport(identity.clone(), TransportKind::Primary, tx.clone()))
        } else {
            None
        };
        let fallback: Arc<dyn SignalTransport> =
            relay.transport(identity, TransportKind::Fallback, tx.clone());
        let inject = tx.clone();
        let hub = SignalHub::new(primary, fallback, None, &options.config.transport, tx);

        let parts = SessionParts {
            hub,
            transport_events: rx,
            health: None,
            media_source: Arc::new(options.media),
            link_factory: network.factory(user_id),
        };
        let mut peer = Self::with_parts(user_id, role, options.config, parts);
        peer.inject = Some(inject);
        peer
    }

    /// A participant on explicit collaborators
    pub fn with_parts(user_id: &str, role: Role, config: CallConfig, parts: SessionParts) -> Self {
        let session =
            CallSession::with_parts(config, RoomId::new(ROOM), participant(role), parts);
        let events = session.subscribe();
        Self {
            id: user_id.to_string(),
            session,
            events,
            inject: None,
        }
    }

    pub async fn wait_for<F>(&mut self, within: Duration, what: &str, pred: F) -> SessionEvent
    where
        F: Fn(&SessionEvent) -> bool,
    {
        wait_for(&mut self.events, within, what, pred).await
    }

    pub async fn wait_connected(&mut self, within: Duration) {
        self.wait_for(within, "PeerConnected", |e| {
            matches!(e, SessionEvent::PeerConnected)
        })
        .await;
    }

    /// Events received so far, without waiting
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        drain(&mut self.events)
    }

    pub async fn wait_phase(&self, phase: EnginePhase, within: Duration) {
        wait_phase(&self.session, phase, within).await
    }
}

/// Wait for the first event matching `pred`, skipping others
pub async fn wait_for<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    within: Duration,
    what: &str,
    pred: F,
) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => panic!("event stream closed waiting for {}", what),
            Err(_) => panic!("timed out after {:?} waiting for {}", within, what),
        }
    }
}

pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

pub async fn wait_phase(session: &CallSession, phase: EnginePhase, within: Duration) {
    let mut watch = session.watch();
    let reached = tokio::time::timeout(within, watch.wait_for(|s| s.phase == phase)).await;
    match reached {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => assert_eq!(session.phase(), phase, "engine stopped before reaching {}", phase),
        Err(_) => panic!(
            "timed out after {:?} waiting for phase {} (now {})",
            within,
            phase,
            session.phase()
        ),
    }
}

pub fn count_disconnects(events: &[SessionEvent], permanent: bool) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::PeerDisconnected { permanent: p } if *p == permanent))
        .count()
}
