//! Room membership
//!
//! Joins through the active transport and falls through to the next one on
//! failure. When every relay route is gone the join still succeeds locally in
//! direct mode, with an identity minted on this side.

use crate::signaling::{
    JoinAck, ParticipantContext, ParticipantIdentity, RoomId, SignalHub, TransportKind,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct RoomMembership {
    hub: Arc<SignalHub>,
    joined: Mutex<Option<Joined>>,
}

#[derive(Clone)]
struct Joined {
    room: RoomId,
    identity: ParticipantIdentity,
    ctx: ParticipantContext,
}

impl RoomMembership {
    pub fn new(hub: Arc<SignalHub>) -> Self {
        Self {
            hub,
            joined: Mutex::new(None),
        }
    }

    /// Join `room`, degrading primary -> fallback -> direct
    ///
    /// Fails only when the relay rejects our credentials.
    #[instrument(skip(self, ctx), fields(role = %ctx.role))]
    pub async fn join(&self, room: &RoomId, ctx: &ParticipantContext) -> Result<JoinAck> {
        let ack = self.join_via_routes(room, ctx).await?;
        *self.joined.lock() = Some(Joined {
            room: room.clone(),
            identity: ack.identity.clone(),
            ctx: ctx.clone(),
        });
        Ok(ack)
    }

    /// Join the current room again over the poll transport
    ///
    /// Used when the persistent channel is gone for good or the relay came
    /// back after direct mode. A retryable failure sends the hub back into
    /// direct mode.
    pub async fn rejoin_via_fallback(&self) -> Result<JoinAck> {
        let joined = self
            .joined
            .lock()
            .clone()
            .ok_or_else(|| Error::RoomError("Not joined to a room".to_string()))?;
        let fallback = self
            .hub
            .transport(TransportKind::Fallback)
            .ok_or_else(SignalHub::exhausted_error)?;

        match fallback.join(&joined.room, &joined.ctx).await {
            Ok(ack) => {
                self.hub.degrade_to_fallback();
                info!(
                    "Re-joined room {} via polling as {}",
                    joined.room, ack.identity.user_id
                );
                if let Some(current) = self.joined.lock().as_mut() {
                    current.identity = ack.identity.clone();
                }
                Ok(ack)
            }
            Err(e) => {
                warn!("Re-join via polling failed: {}", e);
                if e.is_retryable() {
                    self.hub.enter_direct();
                }
                Err(e)
            }
        }
    }

    async fn join_via_routes(&self, room: &RoomId, ctx: &ParticipantContext) -> Result<JoinAck> {
        if self.hub.route() == TransportKind::Primary {
            if let Some(primary) = self.hub.transport(TransportKind::Primary) {
                match primary.join(room, ctx).await {
                    Ok(ack) => return Ok(ack),
                    Err(e @ Error::AuthenticationFailed(_)) => return Err(e),
                    Err(e) => {
                        warn!("Join via persistent channel failed, retrying via polling: {}", e);
                        self.hub.degrade_to_fallback();
                    }
                }
            }
        }

        if self.hub.route() == TransportKind::Fallback {
            if let Some(fallback) = self.hub.transport(TransportKind::Fallback) {
                match fallback.join(room, ctx).await {
                    Ok(ack) => return Ok(ack),
                    Err(e @ Error::AuthenticationFailed(_)) => return Err(e),
                    Err(e) => {
                        warn!("Join via polling failed: {}", e);
                        self.hub.enter_direct();
                    }
                }
            }
        }

        let identity = ParticipantIdentity {
            user_id: format!("{}-{}", ctx.role, uuid::Uuid::new_v4().simple()),
            role: ctx.role,
        };
        info!("No relay for room {}, joined directly as {}", room, identity.user_id);
        Ok(JoinAck {
            identity,
            peer_present: false,
        })
    }

    /// Leave the joined room; no-op if not joined
    pub async fn leave(&self) {
        let joined = self.joined.lock().take();
        if let Some(Joined { room, identity, .. }) = joined {
            self.hub.leave(&room).await;
            info!("{} left room {}", identity.user_id, room);
        }
    }

    /// Whether the relay reports the other participant in the room
    pub async fn peer_present(&self) -> Result<bool> {
        let joined = self.joined.lock().clone();
        let joined =
            joined.ok_or_else(|| Error::RoomError("Not joined to a room".to_string()))?;
        if self.hub.is_direct() {
            return Err(SignalHub::exhausted_error());
        }
        let status = self.hub.room_status(&joined.room).await?;
        Ok(status.is_present(joined.identity.role.counterpart()))
    }

    pub fn identity(&self) -> Option<ParticipantIdentity> {
        self.joined.lock().as_ref().map(|j| j.identity.clone())
    }

    pub fn is_joined(&self) -> bool {
        self.joined.lock().is_some()
    }
}
