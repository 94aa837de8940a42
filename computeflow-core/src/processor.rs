//! The stream processor runs a [Topology]: it creates the streams and drives one
//! [ComputationPool] per computation.

use std::time::Duration;

use futures::future::join_all;
use tracing::info;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::log::{LogLag, LogManager};
use crate::pool::{ComputationPool, default_assignments};
use crate::topology::Topology;
use crate::watermark::Watermark;

pub struct StreamProcessor<L: LogManager> {
    log_manager: L,
    topology: Topology,
    pools: Vec<ComputationPool<L>>,
}

impl<L: LogManager> StreamProcessor<L> {
    /// Creates the streams of the topology and the pools of its computations.
    pub async fn init(log_manager: L, topology: Topology, settings: &Settings) -> Result<Self> {
        for stream in topology.streams() {
            let partitions = settings.partitions(&stream);
            if log_manager.create_if_not_exists(&stream, partitions).await? {
                info!(stream = %stream, partitions, "Stream created");
            }
        }

        let mut pools = Vec::new();
        for mapping in topology.computations() {
            let mut streams = Vec::new();
            for stream in mapping.input_streams() {
                let size = log_manager.size(&stream).await?;
                streams.push((stream, size));
            }
            let supplier = topology.supplier(mapping.name()).ok_or_else(|| {
                Error::Topology(format!("no supplier for computation {}", mapping.name()))
            })?;
            pools.push(ComputationPool::new(
                log_manager.clone(),
                mapping.clone(),
                default_assignments(settings.concurrency(mapping.name()), &streams),
                supplier,
                settings.policy(mapping.name()).clone(),
                settings.runner.clone(),
            ));
        }
        Ok(Self {
            log_manager,
            topology,
            pools,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn pools(&self) -> &[ComputationPool<L>] {
        &self.pools
    }

    pub async fn start(&mut self) -> Result<()> {
        info!(computations = self.pools.len(), "Starting processor");
        join_all(self.pools.iter_mut().map(ComputationPool::start))
            .await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Returns true once every runner of every pool got its partitions, false on timeout.
    pub async fn wait_for_assignments(&self, timeout: Duration) -> bool {
        join_all(self.pools.iter().map(|pool| pool.wait_for_assignments(timeout)))
            .await
            .into_iter()
            .all(|assigned| assigned)
    }

    /// Drains all the pools concurrently, true if they all drained within `timeout`.
    pub async fn drain_and_stop(&mut self, timeout: Duration) -> bool {
        info!(?timeout, "Draining processor");
        join_all(self.pools.iter_mut().map(|pool| pool.drain_and_stop(timeout)))
            .await
            .into_iter()
            .all(|drained| drained)
    }

    /// Stops all the pools concurrently, true if they all stopped within `timeout`.
    pub async fn stop(&mut self, timeout: Duration) -> bool {
        info!(?timeout, "Stopping processor");
        join_all(self.pools.iter_mut().map(|pool| pool.stop(timeout)))
            .await
            .into_iter()
            .all(|stopped| stopped)
    }

    pub async fn shutdown(&mut self) {
        join_all(self.pools.iter_mut().map(ComputationPool::shutdown)).await;
    }

    /// Low watermark of the processor: for each root the minimum over its descendant
    /// computations, then the minimum over the roots ignoring the trivial ones.
    pub fn low_watermark(&self) -> Watermark {
        self.topology
            .roots()
            .iter()
            .filter_map(|root| {
                self.topology
                    .descendants(root)
                    .iter()
                    .map(|computation| self.low_watermark_of(computation))
                    .min()
            })
            .filter(|watermark| !watermark.is_trivial())
            .min()
            .unwrap_or(Watermark::LOWEST)
    }

    pub fn low_watermark_of(&self, computation: &str) -> Watermark {
        self.pools
            .iter()
            .find(|pool| pool.name() == computation)
            .map_or(Watermark::LOWEST, ComputationPool::low_watermark)
    }

    /// True when all the records up to `timestamp` went through the whole topology.
    pub fn is_done(&self, timestamp: u64) -> bool {
        self.low_watermark().is_done(timestamp)
    }

    /// Lag of a computation on its input streams.
    pub async fn lag(&self, computation: &str) -> Result<LogLag> {
        let mapping = self
            .topology
            .metadata(computation)
            .ok_or_else(|| Error::Topology(format!("unknown computation {computation}")))?;
        let mut lags = Vec::new();
        for stream in mapping.input_streams() {
            lags.push(self.log_manager.lag(&stream, computation).await?);
        }
        Ok(LogLag::of(lags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computation::builtin::{Forward, GeneratorSource, RecordCounter, total_count};
    use crate::config::RunnerConfig;
    use crate::log::MemoryLogManager;
    use crate::metrics::encode_metrics;
    use crate::watermark::now_millis;

    fn topology(records: u64) -> Topology {
        Topology::builder()
            .add_computation(
                GeneratorSource::supplier("GENERATOR", records, 10, Duration::from_millis(5)),
                &["o1:s1"],
            )
            .add_computation(Forward::supplier("C1", 1), &["i1:s1", "o1:s2"])
            .add_computation(
                RecordCounter::supplier("COUNTER", 1, Duration::from_millis(20)),
                &["i1:s2", "o1:output"],
            )
            .build()
            .unwrap()
    }

    fn settings() -> Settings {
        Settings::new(2, 2)
            .with_concurrency("GENERATOR", 1)
            .with_partitions("output", 1)
            .with_runner_config(RunnerConfig {
                read_timeout: Duration::from_millis(10),
                starvation_timeout: Duration::from_millis(300),
                rebalance_capacity: 16,
            })
    }

    async fn wait_until(mut condition: impl AsyncFnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn test_init() {
        let manager = MemoryLogManager::new();
        let processor = StreamProcessor::init(manager.clone(), topology(10), &settings())
            .await
            .unwrap();
        assert_eq!(manager.size("s1").await.unwrap(), 2);
        assert_eq!(manager.size("output").await.unwrap(), 1);
        assert_eq!(processor.pools().len(), 3);
        let concurrency: Vec<usize> = processor
            .pools()
            .iter()
            .map(ComputationPool::concurrency)
            .collect();
        assert_eq!(concurrency, vec![1, 2, 2]);
        assert_eq!(processor.low_watermark(), Watermark::LOWEST);
        assert_eq!(processor.low_watermark_of("UNKNOWN"), Watermark::LOWEST);
        assert!(matches!(processor.lag("UNKNOWN").await, Err(Error::Topology(_))));
    }

    #[tokio::test]
    async fn test_process_topology() {
        let manager = MemoryLogManager::new();
        let mut processor = StreamProcessor::init(manager.clone(), topology(100), &settings())
            .await
            .unwrap();
        let start = now_millis();
        processor.start().await.unwrap();
        assert!(processor.wait_for_assignments(Duration::from_secs(5)).await);
        assert!(matches!(processor.start().await, Err(Error::Pool(_))));

        wait_until(async || total_count(&manager.records("output")) == 100).await;
        wait_until(async || processor.is_done(start - 1)).await;
        assert!(!processor.low_watermark().is_trivial());
        assert!(!processor.low_watermark_of("C1").is_trivial());
        wait_until(async || processor.lag("COUNTER").await.unwrap().lag() == 0).await;

        let metrics = encode_metrics().unwrap();
        assert!(metrics.contains(r#"computeflow_records_read_total{computation="C1"}"#));

        assert!(processor.drain_and_stop(Duration::from_secs(10)).await);
        assert_eq!(total_count(&manager.records("output")), 100);
        assert_eq!(manager.records("s2").len(), 100);
        assert_eq!(processor.lag("C1").await.unwrap().lag(), 0);
    }

    #[tokio::test]
    async fn test_stop() {
        let manager = MemoryLogManager::new();
        let mut processor = StreamProcessor::init(manager.clone(), topology(1_000_000), &settings())
            .await
            .unwrap();
        processor.start().await.unwrap();
        wait_until(async || !manager.records("s2").is_empty()).await;

        assert!(processor.stop(Duration::from_secs(5)).await);
        assert_eq!(processor.low_watermark(), Watermark::LOWEST);
        // nothing left to shut down
        processor.shutdown().await;
    }
}
