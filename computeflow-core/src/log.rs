//! Partitioned append-only logs (streams) read by the runners.
//!
//! A stream is split into partitions, each one is an ordered sequence of [Record]s addressed by
//! an offset. Readers belong to a consumer group and commit the offset they have processed, a
//! group can either be given a static list of partitions ([LogManager::create_tailer]) or join a
//! subscription ([LogManager::subscribe]) where the partitions are balanced across members. In the
//! latter case the member is told about its assignment through [RebalanceEvent]s delivered on a
//! bounded channel.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::Result;
use crate::record::Record;

mod error_injector;
pub mod memory;

pub use error_injector::ErrorInjector;
pub use memory::{MemoryLogManager, MemoryTailer};

/// A partition of a stream.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogPartition {
    pub name: String,
    pub partition: u32,
}

impl LogPartition {
    pub fn of(name: impl Into<String>, partition: u32) -> Self {
        Self {
            name: name.into(),
            partition,
        }
    }
}

impl fmt::Display for LogPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.name, self.partition)
    }
}

/// Position of a record in a partition.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogOffset {
    pub partition: LogPartition,
    pub offset: u64,
}

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:+{}", self.partition, self.offset)
    }
}

/// A record read from a partition along with its offset.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub record: Record,
    pub offset: LogOffset,
}

/// Distance between the committed position of a group and the end of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogLag {
    /// number of records committed by the group
    pub committed: u64,
    /// number of records appended to the stream
    pub end: u64,
}

impl LogLag {
    pub fn lag(&self) -> u64 {
        self.end.saturating_sub(self.committed)
    }

    /// Sums the lag of several partitions.
    pub fn of(lags: impl IntoIterator<Item = LogLag>) -> Self {
        lags.into_iter().fold(LogLag::default(), |acc, lag| LogLag {
            committed: acc.committed + lag.committed,
            end: acc.end + lag.end,
        })
    }
}

impl fmt::Display for LogLag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LogLag(committed={}, end={}, lag={})",
            self.committed,
            self.end,
            self.lag()
        )
    }
}

/// Partition assignment changes of a subscribed group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Revoked(Vec<LogPartition>),
    Assigned(Vec<LogPartition>),
}

/// Reads records from a set of partitions on behalf of a consumer group.
#[trait_variant::make(LogTailer: Send)]
pub trait LocalLogTailer {
    /// Reads the next record, waiting at most `timeout`. Returns `None` when nothing is available.
    /// Returns [crate::Error::Rebalance] if the assignment changed since the previous read, the
    /// following read resumes on the new assignment from the committed offsets.
    async fn read(&mut self, timeout: Duration) -> Result<Option<LogRecord>>;

    /// Commits the offsets of all the records read so far.
    async fn commit(&mut self) -> Result<()>;

    /// Partitions currently read by this tailer.
    fn assignments(&self) -> Vec<LogPartition>;

    /// Releases the partitions, a subscribed tailer leaves its group.
    async fn close(&mut self);
}

/// Creates streams, appends records and creates the tailers used by the runners.
pub trait LogManager: Clone + Send + Sync + 'static {
    type Tailer: LogTailer + 'static;

    /// Creates the stream with the given number of partitions, returns false if it already exists.
    fn create_if_not_exists(
        &self,
        stream: &str,
        partitions: u32,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Number of partitions of a stream.
    fn size(&self, stream: &str) -> impl Future<Output = Result<u32>> + Send;

    /// Appends a record to the partition selected by hashing the key.
    fn append(
        &self,
        stream: &str,
        key: &str,
        record: Record,
    ) -> impl Future<Output = Result<LogOffset>> + Send;

    /// Appends a record to a specific partition.
    fn append_to(
        &self,
        partition: &LogPartition,
        record: Record,
    ) -> impl Future<Output = Result<LogOffset>> + Send;

    /// Creates a tailer reading a static list of partitions.
    fn create_tailer(
        &self,
        group: &str,
        partitions: Vec<LogPartition>,
    ) -> impl Future<Output = Result<Self::Tailer>> + Send;

    /// Whether the manager can balance partitions across the members of a group.
    fn supports_subscribe(&self) -> bool;

    /// Joins the group on the given streams, assignment changes are sent on `listener`.
    fn subscribe(
        &self,
        group: &str,
        streams: Vec<String>,
        listener: mpsc::Sender<RebalanceEvent>,
    ) -> impl Future<Output = Result<Self::Tailer>> + Send;

    /// Lag of a group on a stream, summed over the partitions.
    fn lag(&self, stream: &str, group: &str) -> impl Future<Output = Result<LogLag>> + Send;
}
