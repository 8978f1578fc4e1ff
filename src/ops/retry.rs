//! Backoff for full-rebuild attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Delays between consecutive failed attempts, in seconds. The last entry
/// repeats once reached.
pub const RETRY_DELAYS_SECS: [u64; 13] = [1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377];

/// Escalating backoff timer.
///
/// Inactive until an attempt fails; each further failure schedules the next
/// attempt after the next delay in [`RETRY_DELAYS_SECS`]. A success resets
/// it. Only [`RetryTimer::is_active`] (and [`RetryHandle`]) may be used from
/// other threads; the rest is driven by the worker.
#[derive(Debug)]
pub struct RetryTimer {
    active: Arc<AtomicBool>,
    next_attempt: Option<Instant>,
    delay_index: usize,
    last_delay: Option<Duration>,
}

/// Read-only view of a timer's activity, shareable across threads.
#[derive(Clone, Debug)]
pub struct RetryHandle {
    active: Arc<AtomicBool>,
}

impl RetryHandle {
    /// True while the timer is waiting to retry.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Default for RetryTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryTimer {
    /// Inactive timer.
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            next_attempt: None,
            delay_index: 0,
            last_delay: None,
        }
    }

    /// Handle observing this timer.
    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            active: Arc::clone(&self.active),
        }
    }

    /// True after a failure and until the next success.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Back to inactive; the next failure waits the first delay again.
    pub fn successful_attempt(&mut self) {
        self.delay_index = 0;
        self.next_attempt = None;
        self.last_delay = None;
        self.active.store(false, Ordering::Release);
    }

    /// Schedules the next attempt relative to now and returns the delay.
    pub fn failed_attempt(&mut self) -> Duration {
        self.failed_attempt_at(Instant::now())
    }

    /// Schedules the next attempt relative to `now` and returns the delay.
    pub fn failed_attempt_at(&mut self, now: Instant) -> Duration {
        let delay = Duration::from_secs(RETRY_DELAYS_SECS[self.delay_index]);
        if self.delay_index + 1 < RETRY_DELAYS_SECS.len() {
            self.delay_index += 1;
        }
        self.next_attempt = Some(now + delay);
        self.last_delay = Some(delay);
        self.active.store(true, Ordering::Release);
        delay
    }

    /// When the next attempt is due, if the timer is active.
    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    /// Delay chosen by the most recent failure.
    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    /// Whether an attempt may run at `now`.
    pub fn ready_at(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |due| now >= due)
    }
}
