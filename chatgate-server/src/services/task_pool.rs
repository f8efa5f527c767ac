use std::{
    future::Future,
    sync::atomic::{AtomicU8, Ordering},
    time::Duration,
};

use metrics::{counter, gauge};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

/// Lifecycle of a [`TaskPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Running,
    ShuttingDown,
    Stopped,
}

/// Result of [`TaskPool::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every tracked task finished inside the grace period.
    Drained,
    /// The grace period elapsed with tasks still running.
    TimedOut,
}

const STATE_RUNNING: u8 = 0;
const STATE_SHUTTING_DOWN: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Runs fire-and-forget background work off the request path.
///
/// Every task gets a child of the pool's root [`CancellationToken`] and is
/// tracked so [`TaskPool::shutdown`] can cancel and then wait for all of them.
/// Tasks are cooperative: cancellation is a signal, never an abort.
#[derive(Debug)]
pub struct TaskPool {
    root: CancellationToken,
    tracker: TaskTracker,
    state: AtomicU8,
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPool {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            state: AtomicU8::new(STATE_RUNNING),
        }
    }

    pub fn state(&self) -> PoolState {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => PoolState::Running,
            STATE_SHUTTING_DOWN => PoolState::ShuttingDown,
            _ => PoolState::Stopped,
        }
    }

    /// Number of tracked tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Runs `task` concurrently. The task's token is cancelled only by shutdown.
    pub fn submit<F, Fut>(&self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = self.child_token(name);
        let work = task(token);
        self.track(name, work);
    }

    /// Runs `task` concurrently with a token that is also cancelled once
    /// `timeout` elapses. The task keeps running after cancellation until it
    /// observes the token and returns.
    pub fn submit_with_timeout<F, Fut>(&self, name: &'static str, timeout: Duration, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = self.child_token(name);
        let timer_token = token.clone();
        let work = task(token);

        self.track(name, async move {
            tokio::pin!(work);
            tokio::select! {
                result = &mut work => return result,
                () = tokio::time::sleep(timeout) => {
                    debug!(task = name, timeout_ms = timeout.as_millis(), "background task deadline reached");
                    timer_token.cancel();
                }
            }
            work.await
        });
    }

    /// Cancels every outstanding task and waits up to `timeout` for them to
    /// finish. Returns early with [`ShutdownOutcome::TimedOut`] if they do not.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_SHUTTING_DOWN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!("task pool shutdown requested more than once");
        }

        info!(pending = self.tracker.len(), "draining background tasks");
        self.root.cancel();
        self.tracker.close();

        let outcome = if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
        {
            info!("background tasks drained");
            ShutdownOutcome::Drained
        } else {
            warn!(
                pending = self.tracker.len(),
                timeout_ms = timeout.as_millis(),
                "task pool shutdown timed out; some background tasks may be incomplete"
            );
            ShutdownOutcome::TimedOut
        };

        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        outcome
    }

    fn child_token(&self, name: &'static str) -> CancellationToken {
        if self.state() != PoolState::Running {
            warn!(task = name, "task submitted after shutdown began");
        }
        self.root.child_token()
    }

    fn track<Fut>(&self, name: &'static str, work: Fut)
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        counter!("chatgate_tasks_submitted_total", "task" => name).increment(1);
        let tracker = self.tracker.clone();
        self.tracker.spawn(async move {
            if let Err(err) = work.await {
                counter!("chatgate_tasks_failed_total", "task" => name).increment(1);
                warn!(task = name, error = %err, "background task failed");
            }
            #[allow(clippy::cast_precision_loss)]
            gauge!("chatgate_tasks_in_flight").set(tracker.len().saturating_sub(1) as f64);
        });
        #[allow(clippy::cast_precision_loss)]
        gauge!("chatgate_tasks_in_flight").set(self.tracker.len() as f64);
    }
}
