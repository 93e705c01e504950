//! Bounded exponential backoff, shared by sink writes and offset commits.
//!
//! [RetryConfig] holds the bounds, [RetryConfig::backoff] hands out a fresh [Backoff] per
//! operation. The iterator ends once `max_retries` delays were yielded, which is when the
//! caller gives up.

use std::time::Duration;

use rand::Rng;

/// Bounds for retrying transient failures.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RetryConfig {
    /// Retries after the first attempt. Zero means a single attempt.
    pub(crate) max_retries: u16,
    pub(crate) initial_interval: Duration,
    pub(crate) max_interval: Duration,
    /// Growth per retry, at least 1.0.
    pub(crate) factor: f64,
    /// 0.0 to 1.0, each delay is scaled by a random factor in `1 +/- jitter`.
    pub(crate) jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// A fresh delay sequence, one per operation.
    pub(crate) fn backoff(&self) -> Backoff {
        Backoff {
            config: self.clone(),
            retry: 0,
        }
    }
}

/// Exponential delays between attempts: `initial_interval * factor^(retry - 1)`, jittered and
/// capped at `max_interval`. Yields `max_retries` delays and then `None`.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: RetryConfig,
    retry: u16,
}

impl Backoff {
    fn delay(&self, retry: u16) -> Duration {
        let exponent = i32::from(retry.max(1) - 1);
        let base_ms =
            self.config.initial_interval.as_millis() as f64 * self.config.factor.powi(exponent);

        let delay_ms = if self.config.jitter == 0.0 {
            base_ms
        } else {
            let jitter = self.config.jitter;
            base_ms * rand::rng().random_range(1.0 - jitter..=1.0 + jitter)
        };

        Duration::from_millis(delay_ms as u64).min(self.config.max_interval)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.retry >= self.config.max_retries {
            return None;
        }
        self.retry += 1;
        Some(self.delay(self.retry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_retries: u16, jitter: f64) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let delays: Vec<_> = config(6, 0.0).backoff().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn test_bounded_by_max_retries() {
        let retry = config(3, 0.0);
        assert_eq!(retry.backoff().count(), 3);
        assert_eq!(config(0, 0.0).backoff().next(), None);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        for delay in config(3, 0.5).backoff().take(1) {
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(150), "{delay:?}");
        }
        for _ in 0..50 {
            let mut backoff = config(2, 0.5).backoff();
            let _ = backoff.next();
            let second = backoff.next().unwrap();
            assert!(second >= Duration::from_millis(100), "{second:?}");
            assert!(second <= Duration::from_millis(300), "{second:?}");
        }
    }

    #[test]
    fn test_factor_one_is_constant() {
        let retry = RetryConfig {
            factor: 1.0,
            jitter: 0.0,
            ..config(4, 0.0)
        };
        assert!(
            retry
                .backoff()
                .all(|delay| delay == Duration::from_millis(100))
        );
    }
}
