//! Retry strategy with exponential backoff for failed writes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::queue::Operation;
use crate::scheduler::TimerHandle;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first failed dispatch.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        let max_ms = self.max_delay.as_millis() as f64;
        let capped_delay = base_delay.min(max_ms);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            (capped_delay * jitter_factor).min(max_ms)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Decide what happens to an operation that just failed.
    pub fn decide(&self, op: &Operation) -> RetryDecision {
        let attempt = op.attempt + 1;
        if attempt > self.max_retries {
            RetryDecision::GiveUp {
                dispatches: attempt,
            }
        } else {
            RetryDecision::Retry {
                attempt,
                delay: self.delay_for_attempt(attempt),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Outcome of a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-submit after `delay` as retry number `attempt`.
    Retry { attempt: u32, delay: Duration },
    /// Budget exhausted after `dispatches` failed dispatches.
    GiveUp { dispatches: u32 },
}

struct ParkedRetry {
    op: Operation,
    timer: Option<TimerHandle>,
}

/// Tracks operations waiting out their backoff delay.
///
/// Each parked operation is identified by a ticket; the timer that wakes it
/// claims it back with `take`. `drain` cancels every timer and hands the
/// operations back, which is how shutdown gives them a final flush.
pub struct RetryManager {
    policy: RetryPolicy,
    parked: Mutex<HashMap<u64, ParkedRetry>>,
    next_ticket: AtomicU64,
}

impl RetryManager {
    /// Create a new retry manager.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            parked: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Park `op` under a fresh ticket until its timer claims it.
    pub fn park(&self, op: Operation) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        self.parked
            .lock()
            .insert(ticket, ParkedRetry { op, timer: None });
        ticket
    }

    /// Attach the wake-up timer to a parked ticket.
    ///
    /// If the ticket was already claimed the handle is simply dropped.
    pub fn attach(&self, ticket: u64, timer: TimerHandle) {
        if let Some(parked) = self.parked.lock().get_mut(&ticket) {
            parked.timer = Some(timer);
        }
    }

    /// Claim a parked operation; `None` if it was drained or already taken.
    pub fn take(&self, ticket: u64) -> Option<Operation> {
        self.parked.lock().remove(&ticket).map(|parked| parked.op)
    }

    /// Cancel every pending timer and return the parked operations in
    /// submission order.
    pub fn drain(&self) -> Vec<Operation> {
        let parked: Vec<ParkedRetry> = {
            let mut map = self.parked.lock();
            map.drain().map(|(_, parked)| parked).collect()
        };

        let mut ops: Vec<Operation> = parked
            .into_iter()
            .map(|parked| {
                if let Some(timer) = parked.timer {
                    timer.cancel();
                }
                parked.op
            })
            .collect();
        ops.sort_by_key(|op| op.seq);
        ops
    }

    /// Number of operations waiting out a backoff delay.
    pub fn pending(&self) -> usize {
        self.parked.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchline_common::{Collection, Record};
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn op_with_attempt(attempt: u32) -> Operation {
        let mut op = Operation::create(Collection::new("users").unwrap(), Record::new());
        op.attempt = attempt;
        op
    }

    #[test]
    fn test_retry_delay_calculation() {
        let policy = RetryPolicy::new(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0);

        // 1 * 10^5 = 100000 seconds, but should be capped at 10
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(3)
            .with_initial_delay(Duration::from_millis(1000))
            .with_max_delay(Duration::from_millis(1100))
            .with_jitter(true);

        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::new(3).with_initial_delay(Duration::from_millis(100));

        assert_eq!(
            policy.decide(&op_with_attempt(0)),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            policy.decide(&op_with_attempt(2)),
            RetryDecision::Retry {
                attempt: 3,
                delay: Duration::from_millis(400)
            }
        );
        assert_eq!(
            policy.decide(&op_with_attempt(3)),
            RetryDecision::GiveUp { dispatches: 4 }
        );
    }

    #[test]
    fn test_zero_retries_gives_up_immediately() {
        let policy = RetryPolicy::new(0);
        assert!(matches!(
            policy.decide(&op_with_attempt(0)),
            RetryDecision::GiveUp { dispatches: 1 }
        ));
    }

    #[test]
    fn test_park_and_take() {
        let manager = RetryManager::new(RetryPolicy::default());
        let ticket = manager.park(op_with_attempt(1));
        assert_eq!(manager.pending(), 1);

        let op = manager.take(ticket).unwrap();
        assert_eq!(op.attempt, 1);
        assert_eq!(manager.pending(), 0);
        assert!(manager.take(ticket).is_none());
    }

    #[test]
    fn test_drain_cancels_timers() {
        let manager = RetryManager::new(RetryPolicy::default());
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut first = op_with_attempt(1);
        first.seq = 5;
        let mut second = op_with_attempt(1);
        second.seq = 2;

        let ticket = manager.park(first);
        let flag = cancelled.clone();
        manager.attach(ticket, TimerHandle::new(move || flag.store(true, Ordering::SeqCst)));
        manager.park(second);

        let ops = manager.drain();
        assert!(cancelled.load(Ordering::SeqCst));
        assert_eq!(ops.iter().map(|op| op.seq).collect::<Vec<_>>(), vec![2, 5]);
        assert_eq!(manager.pending(), 0);
    }

    proptest! {
        #[test]
        fn prop_backoff_monotonic_and_capped(
            base_ms in 1u64..5_000,
            cap_ms in 5_000u64..120_000,
            attempt in 1u32..40,
        ) {
            let policy = RetryPolicy::new(50)
                .with_initial_delay(Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(cap_ms));

            let current = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= Duration::from_millis(cap_ms));
        }
    }
}
