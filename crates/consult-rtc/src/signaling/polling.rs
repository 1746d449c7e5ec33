//! Poll-based fallback transport (REST)
//!
//! Outgoing envelopes are posted one request each. Incoming envelopes are
//! fetched on a fixed interval with `since` set to the relay clock of the
//! previous response. The relay's REST surface has no presence push, so
//! join/leave events are synthesized by diffing room status between polls.

use super::protocol::{
    JoinAck, ParticipantContext, ParticipantIdentity, Role, RoomId, RoomStatus,
    SignalingEnvelope, now_millis,
};
use super::relay_api::RelayApi;
use super::{EventSender, SignalTransport, TransportEvent, TransportKind};
use crate::config::CallConfig;
use crate::health::HealthMonitor;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Poll-based signaling transport
pub struct PollingTransport {
    inner: Arc<PollInner>,
}

struct PollInner {
    api: RelayApi,
    events: EventSender,
    poll_interval: Duration,
    keepalive_interval: Duration,

    /// Skips polls while the relay is known to be down
    health: Option<Arc<HealthMonitor>>,

    state: Mutex<PollState>,
}

#[derive(Default)]
struct PollState {
    identity: Option<ParticipantIdentity>,
    room: Option<RoomId>,

    /// Relay clock (seconds) of the last poll response
    since: f64,

    /// Status seen on the previous tick; the join-time snapshot is the baseline
    last_status: Option<RoomStatus>,

    /// User ids learned from relay records, by role
    known_peers: HashMap<Role, String>,

    tasks: Vec<JoinHandle<()>>,
}

impl PollingTransport {
    /// Create a new poll transport
    ///
    /// # Arguments
    ///
    /// * `config` - Call configuration (relay URL, token, poll/keepalive intervals)
    /// * `events` - Sink for inbound messages and presence events
    /// * `health` - Optional relay health gate for poll ticks
    pub fn new(
        config: &CallConfig,
        events: EventSender,
        health: Option<Arc<HealthMonitor>>,
    ) -> Result<Self> {
        let api = RelayApi::new(
            &config.relay_url,
            &config.token,
            config.transport.request_timeout(),
        )?;

        Ok(Self {
            inner: Arc::new(PollInner {
                api,
                events,
                poll_interval: config.transport.poll_interval(),
                keepalive_interval: config.transport.keepalive_interval(),
                health,
                state: Mutex::new(PollState::default()),
            }),
        })
    }

    /// Whether the poll and keepalive loops are running
    pub fn is_polling(&self) -> bool {
        self.inner
            .state
            .lock()
            .tasks
            .iter()
            .any(|task| !task.is_finished())
    }

    fn stop_loops(&self) {
        let mut state = self.inner.state.lock();
        for task in state.tasks.drain(..) {
            task.abort();
        }
    }
}

impl PollInner {
    async fn poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if let Some(health) = &self.health {
                if !health.is_responsive().await {
                    debug!("Skipping poll, relay unresponsive");
                    continue;
                }
            }

            if let Err(e) = self.poll_once().await {
                warn!("Poll failed: {}", e);
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let (room, me, since) = {
            let state = self.state.lock();
            match (&state.room, &state.identity) {
                (Some(room), Some(me)) => (room.clone(), me.clone(), state.since),
                _ => return Ok(()),
            }
        };

        let response = self.api.messages(&room, since).await?;
        {
            let mut state = self.state.lock();
            if response.server_time > state.since {
                state.since = response.server_time;
            }
            for record in &response.messages {
                if record.user_id == me.user_id {
                    continue;
                }
                if let Some(role) = record.user_role {
                    state.known_peers.insert(role, record.user_id.clone());
                }
            }
        }

        for record in response.messages {
            if record.user_id == me.user_id {
                continue;
            }
            let mut envelope = record.signal;
            if envelope.target_id.is_none() {
                envelope.target_id = record.target_id;
            }
            if envelope.is_for(&me.user_id) {
                let _ = self.events.send(TransportEvent::Message(envelope));
            }
        }

        let status = self.api.status(&room).await?;
        self.diff_presence(&me, status);
        Ok(())
    }

    fn diff_presence(&self, me: &ParticipantIdentity, status: RoomStatus) {
        let peer_role = me.role.counterpart();
        let mut state = self.state.lock();
        let was_present = state
            .last_status
            .map(|s| s.is_present(peer_role))
            .unwrap_or(false);
        let is_present = status.is_present(peer_role);
        state.last_status = Some(status);

        if was_present == is_present {
            return;
        }

        // The relay only reports roles; fall back to the role name until a
        // record reveals the peer's id.
        let user_id = state
            .known_peers
            .get(&peer_role)
            .cloned()
            .unwrap_or_else(|| peer_role.to_string());
        drop(state);

        if is_present {
            info!("Relay reports {} joined", peer_role);
            let _ = self.events.send(TransportEvent::PeerJoined(ParticipantIdentity {
                user_id,
                role: peer_role,
            }));
        } else {
            info!("Relay reports {} left", peer_role);
            let _ = self.events.send(TransportEvent::PeerLeft {
                user_id,
                role: Some(peer_role),
            });
        }
    }

    /// Replace a role-name placeholder target with the peer's learned id,
    /// or broadcast while the id is still unknown
    fn resolve_target(&self, envelope: &SignalingEnvelope) -> SignalingEnvelope {
        let mut envelope = envelope.clone();
        let state = self.state.lock();
        if let (Some(target), Some(me)) = (&envelope.target_id, &state.identity) {
            let peer_role = me.role.counterpart();
            if *target == peer_role.to_string() {
                envelope.target_id = state.known_peers.get(&peer_role).cloned();
            }
        }
        envelope
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.keepalive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let target = {
                let state = self.state.lock();
                match (&state.room, &state.identity) {
                    (Some(room), Some(me)) => Some((room.clone(), me.user_id.clone())),
                    _ => None,
                }
            };
            let Some((room, user_id)) = target else {
                continue;
            };

            if let Err(e) = self
                .api
                .signal(&room, &SignalingEnvelope::keepalive(&user_id))
                .await
            {
                warn!("Keepalive failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl SignalTransport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Fallback
    }

    async fn connect(&self) -> Result<()> {
        if let Some(health) = &self.inner.health {
            if !health.is_responsive().await {
                return Err(Error::RelayUnavailable(
                    "Relay failed its health probe".to_string(),
                ));
            }
        }
        debug!("Poll transport ready: {}", self.inner.api.base_url());
        Ok(())
    }

    async fn join(&self, room: &RoomId, ctx: &ParticipantContext) -> Result<JoinAck> {
        let response = self.inner.api.join(room, &ctx.appointment_id).await?;
        let identity = ParticipantIdentity {
            user_id: response.user_id,
            role: ctx.role,
        };

        let baseline = match self.inner.api.status(room).await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Room status unavailable after join: {}", e);
                None
            }
        };
        let peer_present = baseline
            .map(|s| s.is_present(ctx.role.counterpart()))
            .unwrap_or(false);

        self.stop_loops();
        {
            let mut state = self.inner.state.lock();
            state.identity = Some(identity.clone());
            state.room = Some(room.clone());
            state.since = now_millis() / 1000.0;
            state.last_status = baseline;
            state.tasks.push(tokio::spawn(self.inner.clone().poll_loop()));
            state
                .tasks
                .push(tokio::spawn(self.inner.clone().keepalive_loop()));
        }

        info!(
            "Joined room {} via poll transport as {} (peer present: {})",
            room, identity.user_id, peer_present
        );
        Ok(JoinAck {
            identity,
            peer_present,
        })
    }

    async fn leave(&self, room: &RoomId) -> Result<()> {
        self.stop_loops();
        self.inner.state.lock().room = None;
        self.inner.api.leave(room).await
    }

    async fn send(&self, room: &RoomId, envelope: &SignalingEnvelope) -> Result<()> {
        let envelope = self.inner.resolve_target(envelope);
        self.inner.api.signal(room, &envelope).await
    }

    async fn room_status(&self, room: &RoomId) -> Result<RoomStatus> {
        self.inner.api.status(room).await
    }

    async fn disconnect(&self) {
        self.stop_loops();
        let mut state = self.inner.state.lock();
        state.room = None;
        state.last_status = None;
        debug!("Poll transport stopped");
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.stop_loops();
    }
}
