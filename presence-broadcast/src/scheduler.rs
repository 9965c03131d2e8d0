//! Periodic snapshot refresh and fan-out.
//!
//! The scheduler stays dormant until the first client registers, then ticks
//! at a fixed period until shutdown. Missed ticks are skipped, not replayed.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::{registry::Registry, shutdown::Shutdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Dormant,
    Running,
    Stopped,
}

#[derive(Debug)]
pub struct Scheduler {
    registry: Arc<Registry>,
    period: Duration,
    shutdown: Shutdown,
    state: Arc<Mutex<SchedulerState>>,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, period: Duration, shutdown: Shutdown) -> Self {
        Self {
            registry,
            period,
            shutdown,
            state: Arc::new(Mutex::new(SchedulerState::Dormant)),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.state)
    }

    /// Starts ticking if still dormant. Returns `true` for the call that did.
    pub fn ensure_started(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if *state != SchedulerState::Dormant {
                return false;
            }
            *state = SchedulerState::Running;
        }

        info!(period = ?self.period, "starting broadcast scheduler");
        let registry = Arc::clone(&self.registry);
        let shutdown = self.shutdown.clone();
        let state = Arc::clone(&self.state);
        let period = self.period;
        self.shutdown.spawn(async move {
            run(&registry, period, &shutdown).await;
            *lock(&state) = SchedulerState::Stopped;
        });
        true
    }
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run(registry: &Registry, period: Duration, shutdown: &Shutdown) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("broadcast scheduler stopping");
                return;
            }
            _ = ticker.tick() => tick(registry),
        }
    }
}

fn tick(registry: &Registry) {
    if let Err(error) = registry.refresh(Utc::now()) {
        warn!(%error, "failed to refresh snapshot; skipping broadcast");
        return;
    }
    let woken = registry.notify_all();
    debug!(woken, clients = registry.len(), "broadcast tick");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mailbox;

    #[tokio::test(start_paused = true)]
    async fn starts_once_and_pulses_on_each_tick() {
        let registry = Arc::new(Registry::new());
        let shutdown = Shutdown::new();
        let period = Duration::from_secs(2);
        let scheduler = Scheduler::new(Arc::clone(&registry), period, shutdown.clone());
        assert_eq!(scheduler.state(), SchedulerState::Dormant);

        let (notify, mut mailbox) = mailbox();
        registry.add("alice".into(), "127.0.0.1:1".parse().expect("addr"), notify);

        assert!(scheduler.ensure_started());
        assert!(!scheduler.ensure_started());
        assert_eq!(scheduler.state(), SchedulerState::Running);

        // No tick fires before one full period has passed.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!mailbox.try_recv());
        assert!(registry.snapshot().is_empty());

        mailbox.recv().await.expect("first pulse");
        assert!(registry.snapshot_generated_at().is_some());

        shutdown.cancel();
        shutdown.wait().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!scheduler.ensure_started());
    }
}
