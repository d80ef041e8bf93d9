//! Exponential backoff with jitter.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

const DEFAULT_INITIAL: Duration = Duration::from_millis(200);
const DEFAULT_MAX: Duration = Duration::from_secs(10);
const DEFAULT_FACTOR: f64 = 2.0;

/// Produces retry intervals that grow geometrically up to a cap.
///
/// Interval `n` is `initial * factor^n`. With jitter enabled the interval is
/// drawn uniformly from `[initial, initial * factor^n]`. Every interval is
/// capped at `max`. There is no attempt limit.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    attempt: u32,
    jitter: bool,
}

impl Backoff {
    /// Creates a jittered backoff.
    ///
    /// Zero durations and non-positive factors fall back to 200ms, 10s and 2.
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial: if initial.is_zero() { DEFAULT_INITIAL } else { initial },
            max: if max.is_zero() { DEFAULT_MAX } else { max },
            factor: if factor > 0.0 && factor.is_finite() {
                factor
            } else {
                DEFAULT_FACTOR
            },
            attempt: 0,
            jitter: true,
        }
    }

    /// Creates a jittered backoff from configuration.
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.factor)
    }

    /// Disables jitter so intervals are exactly `initial * factor^n`.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the next interval and advances the attempt counter.
    pub fn next(&mut self) -> Duration {
        let interval = self.interval(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        interval
    }

    /// Returns to the first interval.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Intervals produced since the last reset.
    pub fn attempt_count(&self) -> u32 {
        self.attempt
    }

    fn interval(&self, attempt: u32) -> Duration {
        // Whole nanoseconds stay exact in f64 well past any sane max.
        let initial = self.initial.as_nanos() as f64;
        let max = self.max.as_nanos() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let computed = initial * self.factor.powi(exponent);
        if !computed.is_finite() || computed > u64::MAX as f64 {
            return self.max;
        }

        let nanos = if self.jitter && computed > initial {
            rand::thread_rng().gen_range(initial..=computed)
        } else {
            computed
        };
        if nanos >= max {
            return self.max;
        }
        Duration::from_nanos(nanos.round() as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL, DEFAULT_MAX, DEFAULT_FACTOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn defaults_for_non_positive_inputs() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO, 0.0).without_jitter();
        assert_eq!(backoff.next(), ms(200));
        assert_eq!(backoff.next(), ms(400));
        for _ in 0..20 {
            assert!(backoff.next() <= Duration::from_secs(10));
        }
        assert_eq!(backoff.next(), Duration::from_secs(10));
    }

    #[test]
    fn deterministic_sequence() {
        let mut backoff = Backoff::new(ms(200), Duration::from_secs(10), 2.0).without_jitter();
        assert_eq!(backoff.next(), ms(200));
        assert_eq!(backoff.next(), ms(400));
        assert_eq!(backoff.next(), ms(800));
        assert_eq!(backoff.next(), ms(1600));
        assert_eq!(backoff.attempt_count(), 4);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut backoff = Backoff::new(ms(200), Duration::from_secs(10), 2.0).without_jitter();
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.attempt_count(), 0);
        assert_eq!(backoff.next(), ms(200));
    }

    #[test]
    fn overflow_clamps_to_max() {
        let mut backoff = Backoff::new(ms(200), Duration::from_secs(30), 1e300);
        backoff.next();
        backoff.next();
        assert_eq!(backoff.next(), Duration::from_secs(30));

        let mut plain = Backoff::new(ms(200), Duration::from_secs(30), 1e300).without_jitter();
        plain.next();
        assert_eq!(plain.next(), Duration::from_secs(30));
    }

    #[test]
    fn first_jittered_interval_is_initial() {
        let mut backoff = Backoff::new(ms(250), Duration::from_secs(10), 2.0);
        assert_eq!(backoff.next(), ms(250));
    }

    proptest! {
        #[test]
        fn jittered_intervals_stay_in_bounds(
            initial_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            factor in 1.0f64..8.0,
            attempts in 1usize..40,
        ) {
            let initial = ms(initial_ms);
            let max = ms(max_ms);
            let mut backoff = Backoff::new(initial, max, factor);
            for _ in 0..attempts {
                let interval = backoff.next();
                prop_assert!(interval <= max);
                prop_assert!(interval >= initial.min(max));
            }
        }
    }
}
