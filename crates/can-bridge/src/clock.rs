//! Retry timing: the backoff state machine and an injectable clock for blocking workers.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Granularity at which a sleeping worker notices cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Sleeping for blocking (non-async) workers.
pub trait Clock: Send + Sync {
    /// Sleep for `delay` unless `cancel` fires first. Returns `false` when cancelled.
    fn sleep(&self, delay: Duration, cancel: &CancellationToken) -> bool;
}

/// Wall-clock sleeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return true;
            };
            if left.is_zero() {
                return true;
            }
            std::thread::sleep(left.min(CANCEL_POLL));
        }
    }
}

/// Records requested delays instead of waiting them out.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Clock for ManualClock {
    fn sleep(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        self.sleeps.lock().push(delay);
        // Keep retry loops from spinning a core flat out
        std::thread::sleep(Duration::from_millis(1));
        !cancel.is_cancelled()
    }
}

/// Delay schedule for reconnect attempts: starts at `initial`, multiplies by `factor` after
/// every attempt and never exceeds `max`. A fixed schedule has `initial == max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: u32,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self::exponential(delay, delay)
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            factor: 2,
            current: initial,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts = self.attempts.saturating_add(1);
        self.current = self
            .current
            .checked_mul(self.factor)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let mut b = Backoff::fixed(Duration::from_secs(1));
        for _ in 0..5 {
            assert_eq!(b.next_delay(), Duration::from_secs(1));
        }
        assert_eq!(b.attempts(), 5);
    }

    #[test]
    fn test_exponential_backoff_caps_and_resets() {
        let mut b = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_manual_clock_records_and_honours_cancel() {
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        assert!(clock.sleep(Duration::from_secs(1), &cancel));
        cancel.cancel();
        assert!(!clock.sleep(Duration::from_secs(1), &cancel));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn test_system_clock_wakes_on_cancel() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let handle = std::thread::spawn(move || SystemClock.sleep(Duration::from_secs(30), &c));
        cancel.cancel();
        assert!(!handle.join().unwrap());
    }
}
