use std::collections::HashMap;
use std::env;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::computation::ComputationPolicy;
use crate::error::Error;

/// Base64 encoded JSON [Settings].
pub const ENV_SETTINGS: &str = "COMPUTEFLOW_SETTINGS";

const DEFAULT_CONCURRENCY: usize = 1;
const DEFAULT_PARTITIONS: u32 = 1;
const DEFAULT_READ_TIMEOUT_MILLIS: u64 = 25;
const DEFAULT_STARVATION_TIMEOUT_MILLIS: u64 = 1000;
const DEFAULT_REBALANCE_CAPACITY: usize = 16;

/// Grace period given to the runners on a forced stop or a shutdown.
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(1);

/// Timings of a runner loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    /// max wait of a read, also the sleep of a source between timers
    #[serde(with = "crate::computation::millis")]
    pub read_timeout: Duration,
    /// a draining runner stops after this duration without input (without timer for a source)
    #[serde(with = "crate::computation::millis")]
    pub starvation_timeout: Duration,
    /// capacity of the channel delivering the rebalance events
    pub rebalance_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MILLIS),
            starvation_timeout: Duration::from_millis(DEFAULT_STARVATION_TIMEOUT_MILLIS),
            rebalance_capacity: DEFAULT_REBALANCE_CAPACITY,
        }
    }
}

/// Concurrency, partitioning and policy of the computations of a topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// default number of runners per computation
    pub concurrency: usize,
    /// default number of partitions per stream
    pub partitions: u32,
    pub computation_concurrency: HashMap<String, usize>,
    pub stream_partitions: HashMap<String, u32>,
    /// default policy of the computations
    pub policy: ComputationPolicy,
    pub computation_policies: HashMap<String, ComputationPolicy>,
    pub runner: RunnerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY, DEFAULT_PARTITIONS)
    }
}

impl Settings {
    pub fn new(concurrency: usize, partitions: u32) -> Self {
        Self {
            concurrency,
            partitions,
            computation_concurrency: HashMap::new(),
            stream_partitions: HashMap::new(),
            policy: ComputationPolicy::default(),
            computation_policies: HashMap::new(),
            runner: RunnerConfig::default(),
        }
    }

    /// Loads the settings from [ENV_SETTINGS], defaults when the variable is not set.
    pub fn from_env() -> Result<Self> {
        match env::var(ENV_SETTINGS) {
            Ok(encoded) => Self::load(&encoded),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Decodes base64 encoded JSON settings.
    pub fn load(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Failed to decode settings: {e:?}")))?;
        let settings: Settings = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("Failed to parse settings: {e:?}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be positive".to_string()));
        }
        if self.partitions == 0 {
            return Err(Error::Config("partitions must be positive".to_string()));
        }
        if let Some((name, _)) = self.computation_concurrency.iter().find(|(_, c)| **c == 0) {
            return Err(Error::Config(format!("concurrency of {name} must be positive")));
        }
        if let Some((name, _)) = self.stream_partitions.iter().find(|(_, p)| **p == 0) {
            return Err(Error::Config(format!("partitions of {name} must be positive")));
        }
        if self.runner.rebalance_capacity == 0 {
            return Err(Error::Config("rebalance capacity must be positive".to_string()));
        }
        Ok(())
    }

    pub fn with_concurrency(mut self, computation: impl Into<String>, concurrency: usize) -> Self {
        self.computation_concurrency
            .insert(computation.into(), concurrency.max(1));
        self
    }

    pub fn with_partitions(mut self, stream: impl Into<String>, partitions: u32) -> Self {
        self.stream_partitions.insert(stream.into(), partitions.max(1));
        self
    }

    pub fn with_policy(mut self, computation: impl Into<String>, policy: ComputationPolicy) -> Self {
        self.computation_policies.insert(computation.into(), policy);
        self
    }

    pub fn with_default_policy(mut self, policy: ComputationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_runner_config(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    pub fn concurrency(&self, computation: &str) -> usize {
        self.computation_concurrency
            .get(computation)
            .copied()
            .unwrap_or(self.concurrency)
    }

    pub fn partitions(&self, stream: &str) -> u32 {
        self.stream_partitions
            .get(stream)
            .copied()
            .unwrap_or(self.partitions)
    }

    pub fn policy(&self, computation: &str) -> &ComputationPolicy {
        self.computation_policies
            .get(computation)
            .unwrap_or(&self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computation::RetryPolicy;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.concurrency("C1"), 1);
        assert_eq!(settings.partitions("s1"), 1);
        assert_eq!(settings.runner.read_timeout, Duration::from_millis(25));
        assert_eq!(settings.runner.starvation_timeout, Duration::from_secs(1));
        assert_eq!(settings.runner.rebalance_capacity, 16);
    }

    #[test]
    fn test_overrides() {
        let policy = ComputationPolicy::new(RetryPolicy::fixed(3, Duration::from_millis(5)), true);
        let settings = Settings::new(2, 4)
            .with_concurrency("C1", 3)
            .with_partitions("s1", 8)
            .with_policy("C1", policy.clone());
        assert_eq!(settings.concurrency("C1"), 3);
        assert_eq!(settings.concurrency("C2"), 2);
        assert_eq!(settings.partitions("s1"), 8);
        assert_eq!(settings.partitions("s2"), 4);
        assert_eq!(settings.policy("C1"), &policy);
        assert_eq!(settings.policy("C2"), &ComputationPolicy::default());
    }

    #[test]
    fn test_load() {
        let json = serde_json::json!({
            "concurrency": 2,
            "partitions": 4,
            "computationConcurrency": {"C1": 4},
            "streamPartitions": {"s1": 12},
            "policy": {"continueOnFailure": true},
            "runner": {"readTimeout": 10, "starvationTimeout": 500}
        });
        let encoded = BASE64_STANDARD.encode(json.to_string());
        let settings = Settings::load(&encoded).unwrap();
        assert_eq!(settings.concurrency("C1"), 4);
        assert_eq!(settings.concurrency("C2"), 2);
        assert_eq!(settings.partitions("s1"), 12);
        assert!(settings.policy("C1").continue_on_failure);
        assert_eq!(settings.runner.read_timeout, Duration::from_millis(10));
        assert_eq!(settings.runner.starvation_timeout, Duration::from_millis(500));
        assert_eq!(settings.runner.rebalance_capacity, 16);
    }

    #[test]
    fn test_load_invalid() {
        assert!(matches!(Settings::load("not base64!"), Err(Error::Config(_))));

        let encoded = BASE64_STANDARD.encode("{\"concurrency\": \"many\"}");
        assert!(matches!(Settings::load(&encoded), Err(Error::Config(_))));

        let encoded = BASE64_STANDARD.encode("{\"concurrency\": 0}");
        assert!(matches!(Settings::load(&encoded), Err(Error::Config(_))));

        let encoded = BASE64_STANDARD.encode("{\"runner\": {\"rebalanceCapacity\": 0}}");
        assert!(matches!(Settings::load(&encoded), Err(Error::Config(_))));
    }
}
