//! Cancellable election and heartbeat timers.
//!
//! Each timer is a spawned task that sleeps and then pushes a
//! [`TimerKind`] into the runtime's channel. Re-arming replaces the task;
//! the old one is aborted on drop so a stale timeout can never fire.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Election,
    Heartbeat,
}

struct TimerHandle(JoinHandle<()>);

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Timers {
    election: Option<TimerHandle>,
    heartbeat: Option<TimerHandle>,
    tx: mpsc::UnboundedSender<TimerKind>,
}

impl Timers {
    pub fn new(tx: mpsc::UnboundedSender<TimerKind>) -> Self {
        Self {
            election: None,
            heartbeat: None,
            tx,
        }
    }

    /// Arm (or re-arm) the election timeout with a fresh random delay in
    /// `[min_ms, max_ms)`. Randomization breaks repeated split votes.
    pub fn reset_election(&mut self, min_ms: u64, max_ms: u64) {
        let delay_ms = if max_ms > min_ms {
            rand::thread_rng().gen_range(min_ms..max_ms)
        } else {
            min_ms
        };
        trace!(delay_ms, "arming election timer");
        let tx = self.tx.clone();
        self.election = Some(TimerHandle(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = tx.send(TimerKind::Election);
        })));
    }

    pub fn cancel_election(&mut self) {
        self.election = None;
    }

    /// Fire [`TimerKind::Heartbeat`] every `interval_ms` until cancelled.
    pub fn start_heartbeat(&mut self, interval_ms: u64) {
        let tx = self.tx.clone();
        self.heartbeat = Some(TimerHandle(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await; // first tick is immediate, skip it
            loop {
                ticker.tick().await;
                if tx.send(TimerKind::Heartbeat).is_err() {
                    break;
                }
            }
        })));
    }

    pub fn cancel_heartbeat(&mut self) {
        self.heartbeat = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_election_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.reset_election(5, 10);
        assert_eq!(rx.recv().await, Some(TimerKind::Election));
    }

    #[tokio::test]
    async fn test_reset_replaces_pending_election() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.reset_election(5_000, 6_000);
        timers.reset_election(5, 10);
        // Only the re-armed short timer fires.
        assert_eq!(rx.recv().await, Some(TimerKind::Election));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_election_aborts_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.reset_election(5, 10);
        timers.cancel_election();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_repeats() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.start_heartbeat(5);
        assert_eq!(rx.recv().await, Some(TimerKind::Heartbeat));
        assert_eq!(rx.recv().await, Some(TimerKind::Heartbeat));
        timers.cancel_heartbeat();
    }
}
