//! In-process relay
//!
//! Rooms, presence and message fan-out kept in memory, with switches to make
//! the relay unavailable or to stall connects. Used for local loopback calls
//! and for exercising fallback paths without a network.

use super::protocol::{
    JoinAck, ParticipantContext, ParticipantIdentity, Role, RoomId, RoomStatus, SignalKind,
    SignalingEnvelope,
};
use super::{EventSender, SignalTransport, TransportEvent, TransportKind};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// An envelope accepted by the relay
#[derive(Debug, Clone)]
pub struct SentRecord {
    /// Transport it arrived on
    pub via: TransportKind,
    pub envelope: SignalingEnvelope,
}

struct Member {
    identity: ParticipantIdentity,
    kind: TransportKind,
    events: EventSender,
}

#[derive(Default)]
struct RelayState {
    rooms: HashMap<RoomId, Vec<Member>>,
    unavailable: HashSet<TransportKind>,
    /// Transports whose calls fail as if our credentials were revoked
    rejecting: HashSet<TransportKind>,
    stalled: HashSet<TransportKind>,
    sent: Vec<SentRecord>,
    /// Accepted but undelivered while delivery is held
    held: Option<Vec<(RoomId, SignalingEnvelope)>>,
}

impl RelayState {
    fn fan_out(&self, room: &RoomId, envelope: &SignalingEnvelope) {
        if let Some(members) = self.rooms.get(room) {
            for member in members {
                if envelope.is_for(&member.identity.user_id) {
                    let _ = member
                        .events
                        .send(TransportEvent::Message(envelope.clone()));
                }
            }
        }
    }
}

/// Shared in-memory relay
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport for one authenticated participant
    ///
    /// # Arguments
    ///
    /// * `identity` - Identity the relay assigns to this participant
    /// * `kind` - Which strategy this transport stands in for
    /// * `events` - Sink for inbound messages and presence events
    pub fn transport(
        &self,
        identity: ParticipantIdentity,
        kind: TransportKind,
        events: EventSender,
    ) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            relay: self.clone(),
            identity,
            kind,
            events,
        })
    }

    /// Make every call through `kind` transports fail (or succeed again)
    pub fn set_available(&self, kind: TransportKind, available: bool) {
        let mut state = self.state.lock();
        if available {
            state.unavailable.remove(&kind);
        } else {
            state.unavailable.insert(kind);
        }
    }

    /// Make every call through `kind` transports fail authentication
    pub fn set_rejecting(&self, kind: TransportKind, rejecting: bool) {
        let mut state = self.state.lock();
        if rejecting {
            state.rejecting.insert(kind);
        } else {
            state.rejecting.remove(&kind);
        }
    }

    /// Drop `user_id`'s persistent channel for good
    ///
    /// The member leaves every room it joined over a primary transport, the
    /// other members see it leave, and its transport reports the channel lost.
    pub fn drop_channel(&self, user_id: &str) {
        let mut state = self.state.lock();
        for members in state.rooms.values_mut() {
            let Some(pos) = members
                .iter()
                .position(|m| m.kind == TransportKind::Primary && m.identity.user_id == user_id)
            else {
                continue;
            };
            let dropped = members.remove(pos);
            for member in members.iter() {
                let _ = member.events.send(TransportEvent::PeerLeft {
                    user_id: dropped.identity.user_id.clone(),
                    role: Some(dropped.identity.role),
                });
            }
            debug!("Dropped persistent channel of {}", user_id);
            let _ = dropped.events.send(TransportEvent::PrimaryLost);
        }
    }

    /// Make `connect` on `kind` transports never resolve
    pub fn set_connect_stalled(&self, kind: TransportKind, stalled: bool) {
        let mut state = self.state.lock();
        if stalled {
            state.stalled.insert(kind);
        } else {
            state.stalled.remove(&kind);
        }
    }

    /// Hold message delivery; releasing delivers everything held, in order
    ///
    /// Sends still succeed while held, so both sides can put envelopes in
    /// flight that cross each other.
    pub fn hold_messages(&self, hold: bool) {
        let mut state = self.state.lock();
        if hold {
            state.held.get_or_insert_with(Vec::new);
            return;
        }
        if let Some(held) = state.held.take() {
            debug!("Releasing {} held envelopes", held.len());
            for (room, envelope) in held {
                state.fan_out(&room, &envelope);
            }
        }
    }

    /// Every envelope accepted so far
    pub fn sent(&self) -> Vec<SentRecord> {
        self.state.lock().sent.clone()
    }

    /// Number of accepted envelopes of one kind from one sender
    pub fn sent_count(&self, sender_id: &str, kind: SignalKind) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|r| r.envelope.sender_id == sender_id && r.envelope.kind == kind)
            .count()
    }

    /// Presence as the REST status endpoint would report it
    pub fn status(&self, room: &RoomId) -> RoomStatus {
        let state = self.state.lock();
        let members = state.rooms.get(room);
        let present =
            |role: Role| members.map_or(false, |m| m.iter().any(|m| m.identity.role == role));
        RoomStatus {
            has_active_call: members.map_or(false, |m| !m.is_empty()),
            doctor_joined: present(Role::Doctor),
            patient_joined: present(Role::Patient),
        }
    }

    fn check(&self, kind: TransportKind) -> Result<()> {
        let state = self.state.lock();
        if state.rejecting.contains(&kind) {
            return Err(Error::AuthenticationFailed(format!("{} relay rejected token", kind)));
        }
        if state.unavailable.contains(&kind) {
            return Err(Error::RelayUnavailable(format!("{} relay unavailable", kind)));
        }
        Ok(())
    }
}

/// One participant's view of a [`MemoryRelay`]
pub struct MemoryTransport {
    relay: MemoryRelay,
    identity: ParticipantIdentity,
    kind: TransportKind,
    events: EventSender,
}

#[async_trait]
impl SignalTransport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(&self) -> Result<()> {
        let stalled = self.relay.state.lock().stalled.contains(&self.kind);
        if stalled {
            debug!("{} connect stalled", self.kind);
            futures::future::pending::<()>().await;
        }
        self.relay.check(self.kind)
    }

    async fn join(&self, room: &RoomId, ctx: &ParticipantContext) -> Result<JoinAck> {
        self.relay.check(self.kind)?;
        let identity = ParticipantIdentity {
            user_id: self.identity.user_id.clone(),
            role: ctx.role,
        };

        let mut state = self.relay.state.lock();
        let members = state.rooms.entry(room.clone()).or_default();
        members.retain(|m| m.identity.user_id != identity.user_id);

        let peer_present = members
            .iter()
            .any(|m| m.identity.role == ctx.role.counterpart());
        for member in members.iter() {
            let _ = member
                .events
                .send(TransportEvent::PeerJoined(identity.clone()));
        }
        members.push(Member {
            identity: identity.clone(),
            kind: self.kind,
            events: self.events.clone(),
        });

        Ok(JoinAck {
            identity,
            peer_present,
        })
    }

    async fn leave(&self, room: &RoomId) -> Result<()> {
        self.relay.check(self.kind)?;
        let mut state = self.relay.state.lock();
        if let Some(members) = state.rooms.get_mut(room) {
            members.retain(|m| m.identity.user_id != self.identity.user_id);
            for member in members.iter() {
                let _ = member.events.send(TransportEvent::PeerLeft {
                    user_id: self.identity.user_id.clone(),
                    role: Some(self.identity.role),
                });
            }
        }
        Ok(())
    }

    async fn send(&self, room: &RoomId, envelope: &SignalingEnvelope) -> Result<()> {
        self.relay.check(self.kind)?;
        let mut state = self.relay.state.lock();
        state.sent.push(SentRecord {
            via: self.kind,
            envelope: envelope.clone(),
        });
        match state.held.as_mut() {
            Some(held) => held.push((room.clone(), envelope.clone())),
            None => state.fan_out(room, envelope),
        }
        Ok(())
    }

    async fn room_status(&self, room: &RoomId) -> Result<RoomStatus> {
        self.relay.check(self.kind)?;
        Ok(self.relay.status(room))
    }

    async fn disconnect(&self) {
        debug!("{} memory transport disconnected", self.kind);
    }
}
