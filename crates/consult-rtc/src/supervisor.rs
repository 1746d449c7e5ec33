//! Resilience supervisor
//!
//! Reconciles the engine's view of the call with the relay's view of the
//! room, and turns accumulating negotiation errors into refreshes and,
//! past a ceiling, a permanent failure.

use crate::config::SupervisorOptions;
use crate::health::HealthMonitor;
use crate::negotiation::{EngineHandle, EnginePhase, EngineSnapshot};
use crate::room::RoomMembership;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Decision for one supervision tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Refresh(String),
    GiveUp(String),
}

/// Mismatch and error accounting, independent of timers and I/O
#[derive(Debug)]
pub struct SupervisorState {
    options: SupervisorOptions,
    mismatches: u32,
    /// Error count at the last error-triggered refresh
    errors_at_refresh: u32,
    gave_up: bool,
}

impl SupervisorState {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            options,
            mismatches: 0,
            errors_at_refresh: 0,
            gave_up: false,
        }
    }

    /// Evaluate one tick
    ///
    /// `peer_present` is `None` when the relay could not be asked.
    pub fn evaluate(&mut self, snapshot: &EngineSnapshot, peer_present: Option<bool>) -> Verdict {
        if snapshot.phase == EnginePhase::Ended {
            return Verdict::Healthy;
        }

        let errors = snapshot.negotiation_errors;
        if errors < self.errors_at_refresh {
            // Engine cleared its count (connected or manual reconnect)
            self.errors_at_refresh = 0;
            self.gave_up = false;
        }

        if !self.gave_up && errors >= self.options.error_ceiling {
            self.gave_up = true;
            return Verdict::GiveUp(format!(
                "{} negotiation errors, giving up on recovery",
                errors
            ));
        }
        if snapshot.phase == EnginePhase::Failed {
            self.mismatches = 0;
            return Verdict::Healthy;
        }
        if errors >= self.errors_at_refresh + self.options.error_refresh_threshold {
            self.errors_at_refresh = errors;
            self.mismatches = 0;
            return Verdict::Refresh(format!("{} negotiation errors", errors));
        }

        let Some(present) = peer_present else {
            return Verdict::Healthy;
        };
        let connected = snapshot.phase == EnginePhase::Connected;
        let mismatch = match snapshot.phase {
            EnginePhase::Connected => !present,
            // Connecting is covered by the establishment timeout
            EnginePhase::Disconnecting | EnginePhase::Reconnecting => present,
            _ => false,
        };

        if !mismatch {
            self.mismatches = 0;
            return Verdict::Healthy;
        }
        self.mismatches += 1;
        debug!(
            "Presence mismatch {}/{} (connected: {}, peer present: {})",
            self.mismatches, self.options.mismatch_threshold, connected, present
        );
        if self.mismatches >= self.options.mismatch_threshold {
            self.mismatches = 0;
            return Verdict::Refresh(format!(
                "relay says peer present={} while connected={}",
                present, connected
            ));
        }
        Verdict::Healthy
    }
}

/// Periodic supervision task
pub struct Supervisor {
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Start supervising an engine
    ///
    /// # Arguments
    ///
    /// * `engine` - Engine to observe and command
    /// * `room` - Membership used for presence checks
    /// * `health` - Relay health gate; presence checks are skipped while unresponsive
    /// * `options` - Thresholds and check interval
    pub fn spawn(
        engine: EngineHandle,
        room: Arc<RoomMembership>,
        health: Option<Arc<HealthMonitor>>,
        options: SupervisorOptions,
    ) -> Self {
        let interval = options.presence_check_interval();
        let task = tokio::spawn(Self::run(engine, room, health, options, interval));
        Self { task }
    }

    async fn run(
        engine: EngineHandle,
        room: Arc<RoomMembership>,
        health: Option<Arc<HealthMonitor>>,
        options: SupervisorOptions,
        interval: Duration,
    ) {
        let mut state = SupervisorState::new(options);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if engine.is_stopped() {
                break;
            }

            let responsive = match &health {
                Some(health) => health.is_responsive().await,
                None => true,
            };
            let presence = if responsive {
                match room.peer_present().await {
                    Ok(present) => Some(present),
                    Err(e) => {
                        debug!("Presence check skipped: {}", e);
                        None
                    }
                }
            } else {
                None
            };

            match state.evaluate(&engine.snapshot(), presence) {
                Verdict::Healthy => {}
                Verdict::Refresh(reason) => {
                    info!("Supervisor requesting refresh: {}", reason);
                    engine.refresh(reason);
                }
                Verdict::GiveUp(reason) => {
                    warn!("Supervisor giving up: {}", reason);
                    engine.give_up(reason);
                }
            }
        }
        debug!("Supervisor stopped");
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
