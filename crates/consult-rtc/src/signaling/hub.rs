//! Transport selection and best-effort delivery
//!
//! The hub owns both strategies and the current route. Outbound envelopes go
//! through one queue drained by a single worker, so delivery order matches
//! send order and callers never wait on the network.

use super::protocol::{RoomId, RoomStatus, SignalingEnvelope};
use super::{EventSender, SignalTransport, TransportEvent, TransportKind};
use crate::config::TransportOptions;
use crate::health::HealthMonitor;
use crate::peer::lifecycle::{BackoffPolicy, RelayBreaker};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Result of [`SignalHub::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Persistent channel is up
    Connected,
    /// Persistent channel unavailable; using the poll transport
    DegradedToFallback,
    /// No relay reachable; direct mode
    Direct,
}

struct Outbound {
    room: RoomId,
    envelope: SignalingEnvelope,
}

/// Routes signaling over the best available transport
pub struct SignalHub {
    primary: Option<Arc<dyn SignalTransport>>,
    fallback: Arc<dyn SignalTransport>,
    route: Mutex<TransportKind>,
    breaker: RelayBreaker,
    health: Option<Arc<HealthMonitor>>,
    events: EventSender,
    retry: BackoffPolicy,
    connect_timeout: Duration,
    queue_tx: mpsc::UnboundedSender<Outbound>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SignalHub {
    /// Create a hub
    ///
    /// # Arguments
    ///
    /// * `primary` - Persistent channel, if enabled
    /// * `fallback` - Poll transport
    /// * `health` - Relay health gate
    /// * `options` - Retry policy, timeouts and direct-mode threshold
    /// * `events` - Same sink the transports publish on; receives relay exhaustion notices
    pub fn new(
        primary: Option<Arc<dyn SignalTransport>>,
        fallback: Arc<dyn SignalTransport>,
        health: Option<Arc<HealthMonitor>>,
        options: &TransportOptions,
        events: EventSender,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let initial = if primary.is_some() {
            TransportKind::Primary
        } else {
            TransportKind::Fallback
        };

        Arc::new(Self {
            primary,
            fallback,
            route: Mutex::new(initial),
            breaker: RelayBreaker::new(
                "relay",
                options.direct_mode_threshold,
                options.relay_recovery(),
            ),
            health,
            events,
            retry: options.send_retry.clone(),
            connect_timeout: options.primary_connect_timeout(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            worker: Mutex::new(None),
        })
    }

    /// Establish signaling, degrading as needed; never fails
    #[instrument(skip(self))]
    pub async fn connect(self: &Arc<Self>) -> ConnectOutcome {
        self.start_worker();

        if let Some(primary) = &self.primary {
            match tokio::time::timeout(self.connect_timeout, primary.connect()).await {
                Ok(Ok(())) => {
                    info!("Signaling connected via persistent channel");
                    self.set_route(TransportKind::Primary);
                    return ConnectOutcome::Connected;
                }
                Ok(Err(e)) => {
                    warn!("Persistent channel failed, falling back to polling: {}", e);
                }
                Err(_) => {
                    warn!(
                        "Persistent channel did not connect within {:?}, falling back to polling",
                        self.connect_timeout
                    );
                }
            }
            primary.disconnect().await;
        }

        match self.fallback.connect().await {
            Ok(()) => {
                info!("Signaling using poll transport");
                self.set_route(TransportKind::Fallback);
                ConnectOutcome::DegradedToFallback
            }
            Err(e) => {
                warn!("Poll transport unavailable: {}", e);
                self.enter_direct();
                ConnectOutcome::Direct
            }
        }
    }

    fn start_worker(self: &Arc<Self>) {
        let Some(rx) = self.queue_rx.lock().take() else {
            return;
        };
        let hub = Arc::downgrade(self);
        *self.worker.lock() = Some(tokio::spawn(Self::delivery_worker(hub, rx)));
    }

    async fn delivery_worker(hub: Weak<Self>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(out) = rx.recv().await {
            let Some(hub) = hub.upgrade() else {
                break;
            };
            hub.deliver(out).await;
        }
        debug!("Delivery worker terminated");
    }

    /// Current route
    pub fn route(&self) -> TransportKind {
        *self.route.lock()
    }

    fn set_route(&self, kind: TransportKind) {
        let mut route = self.route.lock();
        if *route != kind {
            info!("Signaling route {} -> {}", *route, kind);
            *route = kind;
        }
    }

    /// Switch to the poll transport (after a failure on the persistent channel)
    pub fn degrade_to_fallback(&self) {
        self.set_route(TransportKind::Fallback);
    }

    /// Switch to direct mode and tell the engine
    pub fn enter_direct(&self) {
        self.breaker.trip();
        let was_direct = {
            let mut route = self.route.lock();
            let was = *route == TransportKind::Direct;
            *route = TransportKind::Direct;
            was
        };
        if !was_direct {
            warn!("Relay exhausted, entering direct mode");
            let _ = self.events.send(TransportEvent::RelayExhausted);
        }
    }

    fn relay_recovered(&self) {
        if self.breaker.record_success() && self.route() == TransportKind::Direct {
            self.set_route(TransportKind::Fallback);
            info!("Relay answered again, leaving direct mode");
            let _ = self.events.send(TransportEvent::RelayRestored);
        }
    }

    /// Record a relay failure; returns true if it exhausted the relay
    fn relay_failed(&self) -> bool {
        if self.breaker.record_failure() {
            self.enter_direct();
            return true;
        }
        false
    }

    /// The transport behind a route, if any
    pub fn transport(&self, kind: TransportKind) -> Option<Arc<dyn SignalTransport>> {
        match kind {
            TransportKind::Primary => self.primary.clone(),
            TransportKind::Fallback => Some(self.fallback.clone()),
            TransportKind::Direct => None,
        }
    }

    async fn relay_responsive(&self) -> bool {
        match &self.health {
            Some(health) => health.is_responsive().await,
            None => true,
        }
    }

    /// Queue an envelope for delivery; never fails
    pub fn send(&self, room: &RoomId, envelope: SignalingEnvelope) {
        debug!("Queueing {:?} envelope", envelope.kind);
        if self
            .queue_tx
            .send(Outbound {
                room: room.clone(),
                envelope,
            })
            .is_err()
        {
            debug!("Delivery queue closed, dropping envelope");
        }
    }

    async fn deliver(&self, out: Outbound) {
        let kind = out.envelope.kind;

        if self.route() == TransportKind::Direct {
            // One unretried attempt, so a recovered relay is noticed
            match self.fallback.send(&out.room, &out.envelope).await {
                Ok(()) => self.relay_recovered(),
                Err(e) => {
                    debug!("Direct mode: relay still unavailable ({})", e);
                    self.breaker.record_failure();
                }
            }
            return;
        }

        let mut use_fallback = self.route() == TransportKind::Fallback;
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay(attempt - 1)).await;
            }

            if use_fallback && !self.relay_responsive().await {
                debug!("Relay unresponsive, skipping attempt {}", attempt + 1);
                continue;
            }

            let transport = if use_fallback {
                &self.fallback
            } else {
                match &self.primary {
                    Some(primary) => primary,
                    None => &self.fallback,
                }
            };

            match transport.send(&out.room, &out.envelope).await {
                Ok(()) => {
                    if use_fallback {
                        self.relay_recovered();
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        "Send of {:?} via {} failed (attempt {}/{}): {}",
                        kind,
                        transport.kind(),
                        attempt + 1,
                        self.retry.max_attempts,
                        e
                    );
                    if !e.is_retryable() {
                        // The relay answered; retrying or degrading won't change its mind
                        error!("Dropping {:?} envelope: {}", kind, e);
                        return;
                    }
                    if use_fallback {
                        if self.relay_failed() {
                            return;
                        }
                    } else {
                        use_fallback = true;
                    }
                }
            }
        }

        warn!(
            "Giving up on {:?} envelope after {} attempts",
            kind, self.retry.max_attempts
        );
    }

    /// Relay view of the room, through the active transport
    pub async fn room_status(&self, room: &RoomId) -> Result<RoomStatus> {
        let route = self.route();
        let transport = match route {
            TransportKind::Primary => self.primary.as_ref().unwrap_or(&self.fallback),
            _ => &self.fallback,
        };

        match transport.room_status(room).await {
            Ok(status) => {
                if route != TransportKind::Primary {
                    self.relay_recovered();
                }
                Ok(status)
            }
            Err(e) => {
                if route == TransportKind::Fallback {
                    self.relay_failed();
                }
                Err(e)
            }
        }
    }

    /// Leave the room on the active transport
    pub async fn leave(&self, room: &RoomId) {
        let transport = match self.route() {
            TransportKind::Primary => self.primary.clone(),
            TransportKind::Fallback => Some(self.fallback.clone()),
            TransportKind::Direct => None,
        };
        if let Some(transport) = transport {
            if let Err(e) = transport.leave(room).await {
                warn!("Leave via {} failed: {}", transport.kind(), e);
            }
        }
    }

    /// Close every transport and stop delivery
    pub async fn disconnect(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        if let Some(primary) = &self.primary {
            primary.disconnect().await;
        }
        self.fallback.disconnect().await;
        debug!("Signal hub disconnected");
    }

    pub fn is_direct(&self) -> bool {
        self.route() == TransportKind::Direct
    }

    /// Error used when a room operation has no transport left
    pub fn exhausted_error() -> Error {
        Error::RelayUnavailable("All signaling transports exhausted".to_string())
    }
}

impl Drop for SignalHub {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}
