//! Reconnection backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffOpts;

/// Exponential backoff with multiplicative jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    opts: BackoffOpts,
    attempt: u32,
}

impl Backoff {
    pub fn new(opts: BackoffOpts) -> Self {
        Self { opts, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.opts.initial_ms as f64 * self.opts.factor.powi(self.attempt as i32);
        let capped = base.min(self.opts.max_ms as f64);

        let jittered = if self.opts.jitter > 0.0 {
            let spread = rand::rng().random_range(-self.opts.jitter..=self.opts.jitter);
            capped * (1.0 + spread)
        } else {
            capped
        };

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn opts(jitter: f64) -> BackoffOpts {
        BackoffOpts {
            initial_ms: 100,
            max_ms: 1_000,
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_schedule_grows_to_cap() {
        let mut backoff = Backoff::new(opts(0.0));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        // Capped.
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(opts(0.0));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff = Backoff::new(opts(0.3));
        for _ in 0..32 {
            let delay = backoff.next_delay().as_millis() as f64;
            assert!(delay <= 1_000.0 * 1.3);
        }
    }
}
