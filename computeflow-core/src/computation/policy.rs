use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How a runner reacts to a failing `process_record`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComputationPolicy {
    pub retry: RetryPolicy,
    /// Skip the record once the retries are exhausted instead of terminating the runner.
    pub continue_on_failure: bool,
}

impl ComputationPolicy {
    pub fn new(retry: RetryPolicy, continue_on_failure: bool) -> Self {
        Self {
            retry,
            continue_on_failure,
        }
    }
}

/// Exponential backoff between retries, fixed when `factor` is 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub factor: f64,
    /// between 0 and 1, spreads each delay over `delay * (1 +/- jitter)`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// No retry.
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Retries `max_retries` times with a fixed delay.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            max_delay: delay,
            factor: 1.0,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_retries: u32, delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            max_retries,
            delay,
            max_delay,
            factor,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delays to wait before each retry.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// Iterator over the retry delays of a [RetryPolicy].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
        let base_ms = self.policy.delay.as_millis() as f64 * self.policy.factor.powi(exponent);
        let delay_ms = if self.policy.jitter > 0.0 {
            let jitter = self.policy.jitter;
            base_ms * rand::rng().random_range(1.0 - jitter..=1.0 + jitter)
        } else {
            base_ms
        };
        Duration::from_millis(delay_ms as u64).min(self.policy.max_delay.max(self.policy.delay))
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        self.attempt += 1;
        Some(self.delay(self.attempt))
    }
}

/// Serde of a [Duration] as a number of milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_no_retry() {
        let policy = ComputationPolicy::default();
        assert_eq!(policy.retry.backoff().count(), 0);
        assert!(!policy.continue_on_failure);
    }

    #[test]
    fn test_fixed_backoff() {
        let delays: Vec<Duration> = RetryPolicy::fixed(3, Duration::from_millis(50))
            .backoff()
            .collect();
        assert_eq!(delays, vec![Duration::from_millis(50); 3]);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(
            5,
            Duration::from_millis(100),
            Duration::from_millis(500),
            2.0,
        );
        let delays: Vec<u64> = policy.backoff().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::fixed(20, Duration::from_millis(100)).with_jitter(0.5);
        // capped by max_delay which equals the fixed delay
        for delay in policy.backoff() {
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_deserialize() {
        let policy: ComputationPolicy = serde_json::from_str(
            r#"{"retry": {"maxRetries": 2, "delay": 10, "factor": 1.0}, "continueOnFailure": true}"#,
        )
        .unwrap();
        assert!(policy.continue_on_failure);
        assert_eq!(policy.retry.max_retries, 2);
        assert_eq!(policy.retry.delay, Duration::from_millis(10));
        // missing fields keep their defaults
        assert_eq!(policy.retry.max_delay, Duration::from_secs(10));
        assert_eq!(policy.retry.backoff().count(), 2);
    }
}
