//! Cancellable one-shot timers for the engine actor
//!
//! Each armed timer is a spawned sleep that posts `(kind, token)` back to the
//! engine. Re-arming or cancelling a kind aborts its task, and an expiry is
//! only honoured if its token is still the one registered, so a timer that
//! already fired into the channel cannot act after cancellation.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    /// Peer was present at join; offer ourselves if no offer arrives
    InitialOffer,
    DisconnectGrace,
    Reconnect,
    Establishment,
    RefreshCooldown,
    DirectOffer,
    DirectGiveUp,
}

pub(crate) type TimerFired = (TimerKind, u64);

pub(crate) struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    armed: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    next_token: u64,
}

impl Timers {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            tx,
            armed: HashMap::new(),
            next_token: 0,
        }
    }

    /// Arm `kind`, replacing any pending timer of the same kind
    pub(crate) fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.cancel(kind);
        self.next_token += 1;
        let token = self.next_token;
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send((kind, token));
        });
        trace!("Armed {:?} timer for {:?}", kind, after);
        self.armed.insert(kind, (token, task));
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, task)) = self.armed.remove(&kind) {
            task.abort();
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, (_, task)) in self.armed.drain() {
            task.abort();
        }
    }

    pub(crate) fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Consume an expiry; false if it is stale
    pub(crate) fn take_fired(&mut self, kind: TimerKind, token: u64) -> bool {
        match self.armed.get(&kind) {
            Some((current, _)) if *current == token => {
                self.armed.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn armed_count(&self) -> usize {
        self.armed.len()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_with_current_token() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.arm(TimerKind::Reconnect, Duration::from_secs(1));

        let (kind, token) = rx.recv().await.unwrap();
        assert_eq!(kind, TimerKind::Reconnect);
        assert!(timers.take_fired(kind, token));
        assert!(!timers.take_fired(kind, token));
        assert_eq!(timers.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_makes_old_expiry_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.arm(TimerKind::DisconnectGrace, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Expired into the channel, then re-armed before being handled
        timers.arm(TimerKind::DisconnectGrace, Duration::from_secs(5));
        let (kind, token) = rx.recv().await.unwrap();
        assert!(!timers.take_fired(kind, token));
        assert!(timers.is_armed(TimerKind::DisconnectGrace));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_silences_everything() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.arm(TimerKind::Reconnect, Duration::from_secs(1));
        timers.arm(TimerKind::Establishment, Duration::from_secs(2));
        timers.cancel_all();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
