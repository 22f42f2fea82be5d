//! Timer scheduling for batch flushes and retry backoff.

use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Handle to a scheduled task.
///
/// Dropping the handle detaches the task; only `cancel` stops it.
pub struct TimerHandle {
    cancel: Box<dyn FnOnce() + Send>,
}

impl TimerHandle {
    /// Create a handle that runs `cancel` when cancelled.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    /// Stop the task if it has not run yet.
    pub fn cancel(self) {
        (self.cancel)();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle").finish_non_exhaustive()
    }
}

/// Source of time and delayed execution.
///
/// Everything time-dependent in the store goes through this trait, so a
/// paused or simulated clock makes batching and backoff deterministic.
pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed.
    fn after(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle;

    /// Current time on this scheduler's clock.
    fn now(&self) -> Instant;
}

/// Scheduler backed by the tokio runtime and its clock.
///
/// Under `tokio::time::pause` (or `#[tokio::test(start_paused = true)]`)
/// delays elapse only as the test advances time.
///
/// # Panics
/// `after` must be called from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    /// Create a new scheduler.
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
        let join = tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            task.await;
        });
        let abort = join.abort_handle();
        TimerHandle::new(move || {
            debug!("Cancelling scheduled task");
            abort.abort();
        })
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}
