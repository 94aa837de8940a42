//! A pool runs one [ComputationRunner] task per assignment group of a computation and aggregates
//! their low watermarks.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::computation::{ComputationMetadataMapping, ComputationPolicy, ComputationSupplier};
use crate::config::{RunnerConfig, STOP_GRACE};
use crate::error::{Error, Result};
use crate::log::{LogManager, LogPartition};
use crate::runner::{ComputationRunner, RunnerHandle};
use crate::watermark::Watermark;

pub struct ComputationPool<L: LogManager> {
    log_manager: L,
    metadata: ComputationMetadataMapping,
    supplier: ComputationSupplier,
    assignments: Vec<Vec<LogPartition>>,
    policy: ComputationPolicy,
    config: RunnerConfig,
    runners: Vec<RunnerHandle>,
    tasks: JoinSet<Result<()>>,
    started: bool,
}

impl<L: LogManager> ComputationPool<L> {
    pub fn new(
        log_manager: L,
        metadata: ComputationMetadataMapping,
        assignments: Vec<Vec<LogPartition>>,
        supplier: ComputationSupplier,
        policy: ComputationPolicy,
        config: RunnerConfig,
    ) -> Self {
        Self {
            log_manager,
            metadata,
            supplier,
            assignments,
            policy,
            config,
            runners: Vec::new(),
            tasks: JoinSet::new(),
            started: false,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    /// Number of runners, one per assignment group.
    pub fn concurrency(&self) -> usize {
        self.assignments.len()
    }

    pub fn runners(&self) -> &[RunnerHandle] {
        &self.runners
    }

    /// Spawns one runner per assignment group. A pool can be started only once.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::Pool(format!("pool {} already started", self.name())));
        }
        self.started = true;
        info!(computation = self.name(), concurrency = self.concurrency(), "Starting pool");
        for (id, assignments) in self.assignments.iter().enumerate() {
            let (runner, handle) = ComputationRunner::new(
                id,
                self.log_manager.clone(),
                self.metadata.clone(),
                assignments.clone(),
                Arc::clone(&self.supplier),
                self.policy.clone(),
                self.config.clone(),
            )
            .await?;
            self.tasks.spawn(runner.run());
            self.runners.push(handle);
        }
        Ok(())
    }

    /// Waits until every runner got its partitions, returns false on timeout.
    pub async fn wait_for_assignments(&self, timeout: Duration) -> bool {
        let assignments = join_all(self.runners.iter().map(RunnerHandle::wait_for_assignment));
        match tokio::time::timeout(timeout, assignments).await {
            Ok(assigned) => assigned.into_iter().all(|assigned| assigned),
            Err(_) => {
                warn!(computation = self.name(), ?timeout, "Timeout waiting for assignments");
                false
            }
        }
    }

    /// Drains the runners, then stops them. Returns true if the drain completed within `timeout`.
    pub async fn drain_and_stop(&mut self, timeout: Duration) -> bool {
        if self.runners.is_empty() {
            return true;
        }
        info!(computation = self.name(), ?timeout, "Draining pool");
        self.runners.iter().for_each(RunnerHandle::drain);
        let drained = self.await_termination(timeout).await;
        if !drained {
            warn!(computation = self.name(), ?timeout, "Drain timeout, stopping");
        }
        self.stop(STOP_GRACE).await;
        drained
    }

    /// Stops the runners and shuts the pool down. Returns true if the runners ended within
    /// `timeout`.
    pub async fn stop(&mut self, timeout: Duration) -> bool {
        if self.runners.is_empty() {
            return true;
        }
        info!(computation = self.name(), ?timeout, "Stopping pool");
        self.runners.iter().for_each(RunnerHandle::stop);
        let stopped = self.await_termination(timeout).await;
        if !stopped {
            warn!(computation = self.name(), ?timeout, "Stop timeout");
        }
        self.shutdown().await;
        stopped
    }

    /// Interrupts the runners, aborts the ones still alive after a short grace period.
    pub async fn shutdown(&mut self) {
        self.runners.iter().for_each(RunnerHandle::shutdown);
        if !self.await_termination(STOP_GRACE).await {
            warn!(computation = self.name(), "Aborting runners");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
        self.runners.clear();
        info!(computation = self.name(), "Pool terminated");
    }

    async fn await_termination(&mut self, timeout: Duration) -> bool {
        let name = self.metadata.name().to_string();
        let tasks = &mut self.tasks;
        let terminated = async {
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(computation = %name, ?e, "Runner failed"),
                    Err(e) => error!(computation = %name, ?e, "Runner task failed"),
                }
            }
        };
        tokio::time::timeout(timeout, terminated).await.is_ok()
    }

    /// The slowest runner still in progress, or the most advanced checkpointed one when all are
    /// completed.
    pub fn low_watermark(&self) -> Watermark {
        aggregate_low_watermark(self.runners.iter().map(RunnerHandle::low_watermark))
    }
}

/// Minimum of the non trivial uncompleted watermarks if any, otherwise maximum of the non trivial
/// completed ones.
pub(crate) fn aggregate_low_watermark(watermarks: impl IntoIterator<Item = Watermark>) -> Watermark {
    let mut low_uncompleted: Option<Watermark> = None;
    let mut high_completed: Option<Watermark> = None;
    for watermark in watermarks.into_iter().filter(|w| !w.is_trivial()) {
        if watermark.is_completed() {
            high_completed = high_completed.max(Some(watermark));
        } else {
            low_uncompleted = Some(low_uncompleted.map_or(watermark, |low| low.min(watermark)));
        }
    }
    low_uncompleted
        .or(high_completed)
        .unwrap_or(Watermark::LOWEST)
}

/// Default assignment groups: group `i` reads partition `p` of every stream when
/// `p % concurrency == i`.
pub fn default_assignments(concurrency: usize, streams: &[(String, u32)]) -> Vec<Vec<LogPartition>> {
    let concurrency = concurrency.max(1);
    let mut groups = vec![Vec::new(); concurrency];
    for (stream, partitions) in streams {
        for partition in 0..*partitions {
            if let Some(group) = groups.get_mut(partition as usize % concurrency) {
                group.push(LogPartition::of(stream.as_str(), partition));
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::computation::builtin::{Forward, GeneratorSource};
    use crate::computation::ComputationMetadata;
    use crate::log::MemoryLogManager;
    use crate::record::Record;

    fn test_config() -> RunnerConfig {
        RunnerConfig {
            read_timeout: Duration::from_millis(10),
            starvation_timeout: Duration::from_millis(200),
            rebalance_capacity: 16,
        }
    }

    fn forward_mapping() -> ComputationMetadataMapping {
        ComputationMetadataMapping::new(
            ComputationMetadata::with_streams("fwd", 1, 1),
            HashMap::from([
                ("i1".to_string(), "s1".to_string()),
                ("o1".to_string(), "s2".to_string()),
            ]),
        )
    }

    async fn forward_pool(manager: &MemoryLogManager, concurrency: usize) -> ComputationPool<MemoryLogManager> {
        manager.create_if_not_exists("s1", 3).await.unwrap();
        manager.create_if_not_exists("s2", 1).await.unwrap();
        ComputationPool::new(
            manager.clone(),
            forward_mapping(),
            default_assignments(concurrency, &[("s1".to_string(), 3)]),
            Forward::supplier("fwd", 1),
            ComputationPolicy::default(),
            test_config(),
        )
    }

    #[test]
    fn test_default_assignments() {
        let groups = default_assignments(
            2,
            &[("s1".to_string(), 4), ("s2".to_string(), 3)],
        );
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[0],
            vec![
                LogPartition::of("s1", 0),
                LogPartition::of("s1", 2),
                LogPartition::of("s2", 0),
                LogPartition::of("s2", 2),
            ]
        );
        assert_eq!(
            groups[1],
            vec![
                LogPartition::of("s1", 1),
                LogPartition::of("s1", 3),
                LogPartition::of("s2", 1),
            ]
        );

        // a source has empty groups
        let groups = default_assignments(3, &[]);
        assert_eq!(groups, vec![Vec::<LogPartition>::new(); 3]);
    }

    #[test]
    fn test_aggregate_low_watermark() {
        let completed = |v| Watermark::completed_of(Watermark::of_value(v));
        assert_eq!(aggregate_low_watermark([]), Watermark::LOWEST);
        assert_eq!(
            aggregate_low_watermark([Watermark::LOWEST, completed(0)]),
            Watermark::LOWEST
        );
        // completed only: the most advanced
        assert_eq!(
            aggregate_low_watermark([completed(10), completed(30), completed(20)]),
            completed(30)
        );
        // in progress runners come first: the slowest
        assert_eq!(
            aggregate_low_watermark([
                completed(40),
                Watermark::of_value(25),
                Watermark::of_value(15),
                Watermark::LOWEST,
            ]),
            Watermark::of_value(15)
        );
    }

    #[test]
    fn test_low_watermark_does_not_regress() {
        // each runner marks a new watermark then checkpoints it, runner after runner
        let mut runners = vec![Watermark::LOWEST; 3];
        let mut previous = aggregate_low_watermark(runners.clone());
        for step in 1..=10u64 {
            for i in 0..runners.len() {
                let value = Watermark::of_value(step * 10 + i as u64);
                for watermark in [value, Watermark::completed_of(value)] {
                    if let Some(runner) = runners.get_mut(i) {
                        *runner = watermark;
                    }
                    let current = aggregate_low_watermark(runners.clone());
                    assert!(current >= previous, "{current} < {previous}");
                    previous = current;
                }
            }
        }
        assert_eq!(previous, Watermark::completed_of(Watermark::of_value(102)));
    }

    #[tokio::test]
    async fn test_start_twice() {
        let manager = MemoryLogManager::new();
        let mut pool = forward_pool(&manager, 1).await;
        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(Error::Pool(_))));
        assert!(pool.stop(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_stop_pool() {
        let manager = MemoryLogManager::new();
        let mut pool = forward_pool(&manager, 3).await;
        assert_eq!(pool.concurrency(), 3);
        pool.start().await.unwrap();
        assert!(pool.wait_for_assignments(Duration::from_secs(1)).await);
        assert_eq!(pool.runners().len(), 3);

        for i in 0..30 {
            manager
                .append("s1", &format!("k{i}"), Record::new(format!("k{i}"), "v").with_watermark(i + 1))
                .await
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.records("s2").len() < 30 || !pool.low_watermark().is_completed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(pool.stop(Duration::from_secs(5)).await);
        assert!(pool.runners().is_empty());
        assert_eq!(pool.low_watermark(), Watermark::LOWEST);
        assert_eq!(manager.lag("s1", "fwd").await.unwrap().lag(), 0);
        // stopping again is a noop
        assert!(pool.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_stop_timeout() {
        let manager = MemoryLogManager::new();
        manager.create_if_not_exists("s1", 3).await.unwrap();
        manager.create_if_not_exists("s2", 1).await.unwrap();
        // the runners stay blocked in a read, only the shutdown interrupts them
        let mut config = test_config();
        config.read_timeout = Duration::from_secs(30);
        let mut pool = ComputationPool::new(
            manager.clone(),
            forward_mapping(),
            default_assignments(3, &[("s1".to_string(), 3)]),
            Forward::supplier("fwd", 1),
            ComputationPolicy::default(),
            config,
        );
        pool.start().await.unwrap();
        assert!(pool.wait_for_assignments(Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = std::time::Instant::now();
        assert!(!pool.stop(Duration::from_millis(200)).await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(
            elapsed < Duration::from_millis(200) + STOP_GRACE + Duration::from_millis(500),
            "stopped in {elapsed:?}"
        );
        assert!(pool.runners().is_empty());
        assert_eq!(pool.low_watermark(), Watermark::LOWEST);
    }

    #[tokio::test]
    async fn test_drain_and_stop() {
        let manager = MemoryLogManager::new();
        manager.create_if_not_exists("o1", 2).await.unwrap();
        let mut pool = ComputationPool::new(
            manager.clone(),
            ComputationMetadataMapping::identity(ComputationMetadata::with_streams("gen", 0, 1)),
            default_assignments(2, &[]),
            GeneratorSource::supplier("gen", 10, 3, Duration::from_millis(10)),
            ComputationPolicy::default(),
            test_config(),
        );
        pool.start().await.unwrap();
        assert!(pool.wait_for_assignments(Duration::from_secs(1)).await);

        assert!(pool.drain_and_stop(Duration::from_secs(5)).await);
        // each runner hosts its own generator
        assert_eq!(manager.records("o1").len(), 20);
        assert!(pool.runners().is_empty());
    }

    #[tokio::test]
    async fn test_drain_timeout() {
        let manager = MemoryLogManager::new();
        let mut pool = forward_pool(&manager, 1).await;
        pool.start().await.unwrap();

        // keep the runner busy past the drain timeout
        let producer = {
            let manager = manager.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    let _ = manager.append("s1", "k", Record::new(format!("k{i}"), "v")).await;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };
        assert!(!pool.drain_and_stop(Duration::from_millis(300)).await);
        assert!(pool.runners().is_empty());
        producer.abort();
    }

    #[tokio::test]
    async fn test_shutdown_failing_runner() {
        let manager = MemoryLogManager::new();
        manager.create_if_not_exists("s1", 1).await.unwrap();
        // the output stream does not exist: every checkpoint fails but the runner goes on
        let mut pool = ComputationPool::new(
            manager.clone(),
            forward_mapping(),
            default_assignments(1, &[("s1".to_string(), 1)]),
            Forward::supplier("fwd", 1),
            ComputationPolicy::default(),
            test_config(),
        );
        pool.start().await.unwrap();
        manager.append("s1", "k", Record::new("k", "v")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.lag("s1", "fwd").await.unwrap().lag(), 1);

        pool.shutdown().await;
        assert!(pool.runners().is_empty());
    }

    #[tokio::test]
    async fn test_rebalance_between_pools() {
        let manager = MemoryLogManager::with_subscribe();
        manager.create_if_not_exists("s1", 4).await.unwrap();
        manager.create_if_not_exists("s2", 1).await.unwrap();
        let new_pool = || {
            ComputationPool::new(
                manager.clone(),
                forward_mapping(),
                default_assignments(1, &[("s1".to_string(), 4)]),
                Forward::supplier("fwd", 1),
                ComputationPolicy::default(),
                test_config(),
            )
        };

        let mut first = new_pool();
        first.start().await.unwrap();
        assert!(first.wait_for_assignments(Duration::from_secs(1)).await);
        for i in 0..8 {
            manager
                .append("s1", &format!("k{i}"), Record::new(format!("k{i}"), "v"))
                .await
                .unwrap();
        }

        // a second member joins the group, partitions are balanced
        let mut second = new_pool();
        second.start().await.unwrap();
        assert!(second.wait_for_assignments(Duration::from_secs(1)).await);
        for i in 8..16 {
            manager
                .append("s1", &format!("k{i}"), Record::new(format!("k{i}"), "v"))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.lag("s1", "fwd").await.unwrap().lag() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // at least once: every input key reached the output
        let mut keys: Vec<String> = manager.records("s2").into_iter().map(|r| r.key).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 16);

        assert!(first.stop(Duration::from_secs(5)).await);
        assert!(second.stop(Duration::from_secs(5)).await);
    }
}
