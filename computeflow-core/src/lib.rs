//! Computeflow runs topologies of computations exchanging records through partitioned logs.
//!
//! A [Topology] links computations by the streams they read and write. The [StreamProcessor]
//! creates the streams, then starts a [ComputationPool] per computation. Each pool runs a
//! [ComputationRunner] task per assignment group, the runner reads its partitions, feeds the
//! records and the timers to the [Computation], and checkpoints: the produced records are appended
//! to the output streams before the input offsets are committed, so a record is processed at
//! least once.
//!
//! Progress is tracked with [Watermark]s, a processor is done with a timestamp once the low
//! watermark of every tree of computations is past it.

pub mod computation;
pub use computation::{
    Computation, ComputationContext, ComputationMetadata, ComputationMetadataMapping, ComputationPolicy,
    ComputationSupplier, RetryPolicy,
};

pub mod config;
pub use config::{RunnerConfig, Settings};

mod error;
pub use error::{Error, Result};

pub mod log;
pub use log::{LogManager, MemoryLogManager};

pub mod metrics;

pub mod pool;
pub use pool::ComputationPool;

pub mod processor;
pub use processor::StreamProcessor;

pub mod record;
pub use record::{Flag, Record};

pub mod runner;
pub use runner::{ComputationRunner, RunnerHandle, RunnerState};

pub mod topology;
pub use topology::Topology;

pub mod watermark;
pub use watermark::Watermark;
