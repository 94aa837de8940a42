//! In-memory implementation of the [LogManager].
//!
//! Streams, committed offsets and group memberships live in a shared state guarded by a lock, all
//! the clones of a [MemoryLogManager] see the same logs. Group subscription is optional
//! ([MemoryLogManager::with_subscribe]); when enabled the partitions of the subscribed streams are
//! spread across the members (`partition % members`) and every join or leave rebalances the group.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    ErrorInjector, LogLag, LogManager, LogOffset, LogPartition, LogRecord, LogTailer,
    RebalanceEvent,
};
use crate::error::{Error, Result};
use crate::record::Record;

/// Interval between two polls of the partitions while waiting for a record.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Default)]
pub struct MemoryLogManager {
    state: Arc<RwLock<LogState>>,
    error_injector: Arc<ErrorInjector>,
    subscribe: bool,
}

#[derive(Debug, Default)]
struct LogState {
    /// stream -> partitions -> records, the offset of a record is its index
    streams: HashMap<String, Vec<Vec<Record>>>,
    /// (group, partition) -> next offset to read
    committed: HashMap<(String, LogPartition), u64>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    generation: u64,
    next_member_id: u64,
    members: BTreeMap<u64, Member>,
}

#[derive(Debug)]
struct Member {
    streams: Vec<String>,
    listener: mpsc::Sender<RebalanceEvent>,
    assignment: Vec<LogPartition>,
}

impl LogState {
    fn partition_records(&self, partition: &LogPartition) -> Option<&Vec<Record>> {
        self.streams
            .get(&partition.name)
            .and_then(|partitions| partitions.get(partition.partition as usize))
    }

    fn committed(&self, group: &str, partition: &LogPartition) -> u64 {
        self.committed
            .get(&(group.to_string(), partition.clone()))
            .copied()
            .unwrap_or_default()
    }

    /// Spreads the partitions across the members of the group and notifies every member of its
    /// revoked and assigned partitions.
    fn rebalance(&mut self, group: &str) {
        let Some(group_state) = self.groups.get_mut(group) else {
            return;
        };
        group_state.generation += 1;

        let members: Vec<u64> = group_state.members.keys().copied().collect();
        if members.is_empty() {
            return;
        }
        let streams: BTreeSet<String> = group_state
            .members
            .values()
            .flat_map(|member| member.streams.iter().cloned())
            .collect();

        let mut assignments: BTreeMap<u64, Vec<LogPartition>> =
            members.iter().map(|id| (*id, Vec::new())).collect();
        for stream in streams {
            let size = self.streams.get(&stream).map_or(0, Vec::len);
            for partition in 0..size {
                if let Some(assignment) = members
                    .get(partition % members.len())
                    .and_then(|id| assignments.get_mut(id))
                {
                    assignment.push(LogPartition::of(stream.as_str(), partition as u32));
                }
            }
        }

        for (id, member) in group_state.members.iter_mut() {
            let assignment = assignments.remove(id).unwrap_or_default();
            let previous = std::mem::replace(&mut member.assignment, assignment.clone());
            if !previous.is_empty() {
                notify(&member.listener, RebalanceEvent::Revoked(previous));
            }
            notify(&member.listener, RebalanceEvent::Assigned(assignment));
        }
        debug!(
            group,
            generation = group_state.generation,
            members = members.len(),
            "Group rebalanced"
        );
    }
}

fn notify(listener: &mpsc::Sender<RebalanceEvent>, event: RebalanceEvent) {
    if let Err(e) = listener.try_send(event) {
        warn!(?e, "Rebalance listener is not able to receive the event");
    }
}

fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions.max(1))) as u32
}

impl MemoryLogManager {
    /// A manager handing out static partition assignments only.
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager supporting group subscription with rebalancing.
    pub fn with_subscribe() -> Self {
        Self {
            subscribe: true,
            ..Self::default()
        }
    }

    pub fn error_injector(&self) -> &Arc<ErrorInjector> {
        &self.error_injector
    }

    /// All the records of a stream, partition after partition.
    pub fn records(&self, stream: &str) -> Vec<Record> {
        let state = self.state.read();
        state
            .streams
            .get(stream)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn partition_records(&self, partition: &LogPartition) -> Vec<Record> {
        let state = self.state.read();
        state
            .partition_records(partition)
            .cloned()
            .unwrap_or_default()
    }

    /// Next offset the group will read from the partition.
    pub fn committed(&self, group: &str, partition: &LogPartition) -> u64 {
        self.state.read().committed(group, partition)
    }

    fn do_append(&self, partition: &LogPartition, record: Record) -> Result<LogOffset> {
        if self.error_injector.should_fail_append() {
            return Err(Error::Append(format!(
                "injected append failure on {partition}"
            )));
        }
        let mut state = self.state.write();
        let records = state
            .streams
            .get_mut(&partition.name)
            .and_then(|partitions| partitions.get_mut(partition.partition as usize))
            .ok_or_else(|| Error::Append(format!("partition {partition} not found")))?;
        records.push(record);
        Ok(LogOffset {
            partition: partition.clone(),
            offset: records.len() as u64 - 1,
        })
    }

    fn stream_size(&self, stream: &str) -> Result<u32> {
        self.state
            .read()
            .streams
            .get(stream)
            .map(|partitions| partitions.len() as u32)
            .ok_or_else(|| Error::Log(format!("stream {stream} not found")))
    }
}

impl LogManager for MemoryLogManager {
    type Tailer = MemoryTailer;

    async fn create_if_not_exists(&self, stream: &str, partitions: u32) -> Result<bool> {
        if partitions == 0 {
            return Err(Error::Log(format!(
                "stream {stream} needs at least one partition"
            )));
        }
        let mut state = self.state.write();
        if state.streams.contains_key(stream) {
            return Ok(false);
        }
        state
            .streams
            .insert(stream.to_string(), vec![Vec::new(); partitions as usize]);
        info!(stream, partitions, "Stream created");
        Ok(true)
    }

    async fn size(&self, stream: &str) -> Result<u32> {
        self.stream_size(stream)
    }

    async fn append(&self, stream: &str, key: &str, record: Record) -> Result<LogOffset> {
        let size = self.stream_size(stream)?;
        let partition = LogPartition::of(stream, partition_for_key(key, size));
        self.do_append(&partition, record)
    }

    async fn append_to(&self, partition: &LogPartition, record: Record) -> Result<LogOffset> {
        self.do_append(partition, record)
    }

    async fn create_tailer(&self, group: &str, partitions: Vec<LogPartition>) -> Result<MemoryTailer> {
        let positions = {
            let state = self.state.read();
            let mut positions = BTreeMap::new();
            for partition in partitions {
                if state.partition_records(&partition).is_none() {
                    return Err(Error::Log(format!("partition {partition} not found")));
                }
                let position = state.committed(group, &partition);
                positions.insert(partition, position);
            }
            positions
        };
        Ok(MemoryTailer {
            manager: self.clone(),
            group: group.to_string(),
            member: None,
            generation: None,
            interrupted: false,
            positions,
            cursor: 0,
        })
    }

    fn supports_subscribe(&self) -> bool {
        self.subscribe
    }

    async fn subscribe(
        &self,
        group: &str,
        streams: Vec<String>,
        listener: mpsc::Sender<RebalanceEvent>,
    ) -> Result<MemoryTailer> {
        if !self.subscribe {
            return Err(Error::Log(
                "group subscription is not supported by this log manager".to_string(),
            ));
        }
        let member_id = {
            let mut state = self.state.write();
            if let Some(missing) = streams.iter().find(|s| !state.streams.contains_key(*s)) {
                return Err(Error::Log(format!("stream {missing} not found")));
            }
            let group_state = state.groups.entry(group.to_string()).or_default();
            let member_id = group_state.next_member_id;
            group_state.next_member_id += 1;
            group_state.members.insert(
                member_id,
                Member {
                    streams,
                    listener,
                    assignment: Vec::new(),
                },
            );
            state.rebalance(group);
            member_id
        };
        info!(group, member_id, "Joined group");
        Ok(MemoryTailer {
            manager: self.clone(),
            group: group.to_string(),
            member: Some(member_id),
            generation: None,
            interrupted: false,
            positions: BTreeMap::new(),
            cursor: 0,
        })
    }

    async fn lag(&self, stream: &str, group: &str) -> Result<LogLag> {
        let state = self.state.read();
        let partitions = state
            .streams
            .get(stream)
            .ok_or_else(|| Error::Log(format!("stream {stream} not found")))?;
        Ok(LogLag::of(partitions.iter().enumerate().map(
            |(partition, records)| LogLag {
                committed: state.committed(group, &LogPartition::of(stream, partition as u32)),
                end: records.len() as u64,
            },
        )))
    }
}

/// Tailer of a [MemoryLogManager], reads its partitions round-robin.
#[derive(Debug)]
pub struct MemoryTailer {
    manager: MemoryLogManager,
    group: String,
    /// member id when the tailer comes from a subscription
    member: Option<u64>,
    /// group generation of the current assignment
    generation: Option<u64>,
    /// the reader has been told about the pending rebalance
    interrupted: bool,
    /// partition -> next offset to read
    positions: BTreeMap<LogPartition, u64>,
    cursor: usize,
}

impl MemoryTailer {
    /// Follows the group assignment. The first read after a rebalance fails with
    /// [Error::Rebalance] so that the reader can commit its progress on the previous assignment.
    fn check_assignment(&mut self) -> Result<()> {
        let Some(member_id) = self.member else {
            return Ok(());
        };
        let state = self.manager.state.read();
        let Some(group) = state.groups.get(&self.group) else {
            return Ok(());
        };
        if self.generation == Some(group.generation) {
            return Ok(());
        }
        if self.generation.is_some() && !self.interrupted {
            self.interrupted = true;
            return Err(Error::Rebalance);
        }

        let assignment = group
            .members
            .get(&member_id)
            .map(|member| member.assignment.clone())
            .unwrap_or_default();
        self.positions = assignment
            .into_iter()
            .map(|partition| {
                let position = state.committed(&self.group, &partition);
                (partition, position)
            })
            .collect();
        self.generation = Some(group.generation);
        self.interrupted = false;
        self.cursor = 0;
        Ok(())
    }

    fn poll_record(&mut self) -> Option<LogRecord> {
        let count = self.positions.len();
        if count == 0 {
            return None;
        }
        let state = self.manager.state.read();
        for i in 0..count {
            let index = (self.cursor + i) % count;
            let Some((partition, position)) = self.positions.iter_mut().nth(index) else {
                continue;
            };
            let Some(record) = state
                .partition_records(partition)
                .and_then(|records| records.get(*position as usize))
            else {
                continue;
            };
            let log_record = LogRecord {
                record: record.clone(),
                offset: LogOffset {
                    partition: partition.clone(),
                    offset: *position,
                },
            };
            *position += 1;
            self.cursor = (index + 1) % count;
            return Some(log_record);
        }
        None
    }

    fn leave_group(&mut self) {
        let Some(member_id) = self.member.take() else {
            return;
        };
        let mut state = self.manager.state.write();
        if let Some(group) = state.groups.get_mut(&self.group) {
            group.members.remove(&member_id);
        }
        state.rebalance(&self.group);
        info!(group = %self.group, member_id, "Left group");
    }
}

impl LogTailer for MemoryTailer {
    async fn read(&mut self, timeout: Duration) -> Result<Option<LogRecord>> {
        self.manager.error_injector.apply_read_latency().await;
        if self.manager.error_injector.should_fail_read() {
            return Err(Error::Log("injected read failure".to_string()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            self.check_assignment()?;
            if let Some(record) = self.poll_record() {
                return Ok(Some(record));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn commit(&mut self) -> Result<()> {
        if self.manager.error_injector.should_fail_commit() {
            return Err(Error::Commit(format!(
                "injected commit failure for group {}",
                self.group
            )));
        }
        let mut state = self.manager.state.write();
        for (partition, position) in &self.positions {
            let committed = state
                .committed
                .entry((self.group.clone(), partition.clone()))
                .or_default();
            // a stale tailer must not move back the position of the new owner
            *committed = (*committed).max(*position);
        }
        Ok(())
    }

    fn assignments(&self) -> Vec<LogPartition> {
        self.positions.keys().cloned().collect()
    }

    async fn close(&mut self) {
        self.leave_group();
    }
}

impl Drop for MemoryTailer {
    fn drop(&mut self) {
        self.leave_group();
    }
}
