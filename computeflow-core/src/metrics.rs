//! Prometheus metrics of the computations, labelled by computation name and kept in a process wide
//! registry. [encode_metrics] renders the registry in the OpenMetrics text format.

use std::iter;
use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::{Error, Result};

const COMPUTATION_LABEL: &str = "computation";

// The top-level metric registry is created with the REGISTRY_PREFIX
const REGISTRY_PREFIX: &str = "computeflow";

// counters, the _total suffix is added by the client library
const RECORDS_READ: &str = "records_read";
const RECORDS_WRITTEN: &str = "records_written";
const TIMERS_FIRED: &str = "timers_fired";
const CHECKPOINTS: &str = "checkpoints";
const CHECKPOINT_FAILURES: &str = "checkpoint_failures";
const PROCESSING_FAILURES: &str = "processing_failures";

// gauges
const LOW_WATERMARK: &str = "low_watermark";

// histograms
const PROCESSING_TIME: &str = "processing_time";
const CHECKPOINT_TIME: &str = "checkpoint_time";

/// The global register of all metrics.
#[derive(Default)]
struct GlobalRegistry {
    // each metric is registered only once
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::default)
}

/// Metrics of the runners, each metric is a family labelled by [computation_metric_labels].
pub(crate) struct ComputationMetrics {
    pub(crate) records_read: Family<Vec<(String, String)>, Counter>,
    pub(crate) records_written: Family<Vec<(String, String)>, Counter>,
    pub(crate) timers_fired: Family<Vec<(String, String)>, Counter>,
    pub(crate) checkpoints: Family<Vec<(String, String)>, Counter>,
    pub(crate) checkpoint_failures: Family<Vec<(String, String)>, Counter>,
    pub(crate) processing_failures: Family<Vec<(String, String)>, Counter>,
    pub(crate) low_watermark: Family<Vec<(String, String)>, Gauge>,
    /// record processing time in microseconds
    pub(crate) processing_time: Family<Vec<(String, String)>, Histogram>,
    /// checkpoint time in microseconds
    pub(crate) checkpoint_time: Family<Vec<(String, String)>, Histogram>,
}

/// Exponential bucket distribution with `length` buckets from `min` to `max`, the +Inf bucket is
/// not included.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let length = length.max(2);
    let min = if min > 0.0 { min } else { 1.0 };
    let growth_factor = (max / min).powf(1.0 / (f64::from(length) - 1.0));
    iter::successors(Some(min), move |bucket| Some(bucket * growth_factor)).take(length.into())
}

fn time_histogram() -> Histogram {
    // 100 microseconds to 15 minutes
    Histogram::new(exponential_buckets_range(100.0, 60_000_000.0 * 15.0, 10))
}

impl ComputationMetrics {
    fn new() -> Self {
        let metrics = Self {
            records_read: Family::default(),
            records_written: Family::default(),
            timers_fired: Family::default(),
            checkpoints: Family::default(),
            checkpoint_failures: Family::default(),
            processing_failures: Family::default(),
            low_watermark: Family::default(),
            processing_time: Family::new_with_constructor(time_histogram),
            checkpoint_time: Family::new_with_constructor(time_histogram),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_PREFIX);
        registry.register(
            RECORDS_READ,
            "A Counter to keep track of the total number of records read by the computation",
            metrics.records_read.clone(),
        );
        registry.register(
            RECORDS_WRITTEN,
            "A Counter to keep track of the total number of records appended to the output streams",
            metrics.records_written.clone(),
        );
        registry.register(
            TIMERS_FIRED,
            "A Counter to keep track of the total number of timers fired",
            metrics.timers_fired.clone(),
        );
        registry.register(
            CHECKPOINTS,
            "A Counter to keep track of the successful checkpoints",
            metrics.checkpoints.clone(),
        );
        registry.register(
            CHECKPOINT_FAILURES,
            "A Counter to keep track of the failed checkpoints, resume may create duplicates",
            metrics.checkpoint_failures.clone(),
        );
        registry.register(
            PROCESSING_FAILURES,
            "A Counter to keep track of the failed record processing attempts",
            metrics.processing_failures.clone(),
        );
        registry.register(
            LOW_WATERMARK,
            "A Gauge with the last checkpointed low watermark of the computation",
            metrics.low_watermark.clone(),
        );
        registry.register(
            PROCESSING_TIME,
            "A Histogram to keep track of the record processing time in microseconds",
            metrics.processing_time.clone(),
        );
        registry.register(
            CHECKPOINT_TIME,
            "A Histogram to keep track of the checkpoint time in microseconds",
            metrics.checkpoint_time.clone(),
        );
        metrics
    }
}

static COMPUTATION_METRICS: OnceLock<ComputationMetrics> = OnceLock::new();

pub(crate) fn computation_metrics() -> &'static ComputationMetrics {
    COMPUTATION_METRICS.get_or_init(ComputationMetrics::new)
}

pub(crate) fn computation_metric_labels(computation: &str) -> Vec<(String, String)> {
    vec![(COMPUTATION_LABEL.to_string(), computation.to_string())]
}

/// Renders all the registered metrics in the OpenMetrics text format.
pub fn encode_metrics() -> Result<String> {
    // make sure the families are registered even before the first runner starts
    computation_metrics();
    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &registry).map_err(|e| Error::Metrics(e.to_string()))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets() {
        let buckets: Vec<f64> = exponential_buckets_range(1.0, 100.0, 3).collect();
        assert_eq!(buckets.len(), 3);
        assert!((buckets[0] - 1.0).abs() < 1e-9);
        assert!((buckets[1] - 10.0).abs() < 1e-9);
        assert!((buckets[2] - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_encode_metrics() {
        let labels = computation_metric_labels("metrics-test");
        let metrics = computation_metrics();
        metrics.records_read.get_or_create(&labels).inc();
        metrics.checkpoints.get_or_create(&labels).inc_by(2);
        metrics.low_watermark.get_or_create(&labels).set(42);

        let encoded = encode_metrics().unwrap();
        for expected in [
            r#"computeflow_records_read_total{computation="metrics-test"} 1"#,
            r#"computeflow_checkpoints_total{computation="metrics-test"} 2"#,
            r#"computeflow_low_watermark{computation="metrics-test"} 42"#,
        ] {
            assert!(encoded.contains(expected), "missing {expected} in {encoded}");
        }
    }
}
