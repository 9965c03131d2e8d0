//! Process-wide shutdown coordination.
//!
//! [`Shutdown`] pairs a [`CancellationToken`] (the signal) with a
//! [`TaskTracker`] (the acknowledgment barrier). Tasks register interest by
//! being spawned through [`Shutdown::spawn`]; a task acknowledges
//! cancellation simply by returning. [`Shutdown::wait`] resolves once every
//! tracked task has returned.

use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFuture},
    task::TaskTracker,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a coordinator whose signal fires when `parent` is cancelled.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Flips the signal. Later calls are no-ops.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!("cancellation requested");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Spawns a task that must finish before [`Shutdown::wait`] resolves.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Number of tracked tasks that have not returned yet.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Waits until every tracked task has returned.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Like [`Shutdown::wait`] but gives up after `limit`.
    ///
    /// Returns `false` when tasks were still running at the deadline.
    pub async fn wait_timeout(&self, limit: Duration) -> bool {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(pending = self.pending(), "tasks still running at shutdown deadline");
                false
            }
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn interrupted() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(?error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_after_tasks_acknowledge() {
        let shutdown = Shutdown::new();
        for _ in 0..3 {
            let token = shutdown.token();
            shutdown.spawn(async move { token.cancelled().await });
        }
        assert_eq!(shutdown.pending(), 3);

        shutdown.cancel();
        shutdown.cancel();
        assert!(shutdown.wait_timeout(Duration::from_secs(1)).await);
        assert_eq!(shutdown.pending(), 0);
    }

    #[tokio::test]
    async fn wait_times_out_when_a_task_ignores_the_signal() {
        let shutdown = Shutdown::new();
        shutdown.spawn(tokio::time::sleep(Duration::from_secs(30)));
        shutdown.cancel();

        assert!(!shutdown.wait_timeout(Duration::from_millis(50)).await);
        assert_eq!(shutdown.pending(), 1);
    }

    #[tokio::test]
    async fn child_follows_parent_but_not_the_reverse() {
        let parent = CancellationToken::new();
        let first = Shutdown::child_of(&parent);
        let second = Shutdown::child_of(&parent);

        first.cancel();
        assert!(!parent.is_cancelled());
        assert!(!second.is_cancelled());

        parent.cancel();
        assert!(second.is_cancelled());
    }
}
