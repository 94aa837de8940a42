use std::collections::{HashMap, VecDeque};

use crate::computation::ComputationMetadataMapping;
use crate::error::{Error, Result};
use crate::record::Record;

/// Per runner scratch state between two checkpoints: staged output records, timers, the
/// checkpoint request and the low watermark declared by a source.
#[derive(Debug)]
pub struct ComputationContext {
    metadata: ComputationMetadataMapping,
    /// physical output stream -> records waiting for the next checkpoint
    records: HashMap<String, VecDeque<Record>>,
    /// timer key -> due time in milliseconds
    timers: HashMap<String, u64>,
    checkpoint: bool,
    source_low_watermark: u64,
}

/// State of a context taken before processing a record, see [ComputationContext::rollback].
#[derive(Debug, Clone)]
pub struct ContextMark {
    staged: HashMap<String, usize>,
    timers: HashMap<String, u64>,
    checkpoint: bool,
}

impl ComputationContext {
    pub fn new(metadata: ComputationMetadataMapping) -> Self {
        let records = metadata
            .output_streams()
            .into_iter()
            .map(|stream| (stream, VecDeque::new()))
            .collect();
        Self {
            metadata,
            records,
            timers: HashMap::new(),
            checkpoint: false,
            source_low_watermark: 0,
        }
    }

    pub fn metadata(&self) -> &ComputationMetadataMapping {
        &self.metadata
    }

    pub fn timers(&self) -> &HashMap<String, u64> {
        &self.timers
    }

    /// Registers (or moves) the timer `key` to fire at `due` milliseconds since epoch.
    pub fn set_timer(&mut self, key: impl Into<String>, due: u64) {
        self.timers.insert(key.into(), due);
    }

    pub fn remove_timer(&mut self, key: &str) -> Option<u64> {
        self.timers.remove(key)
    }

    /// Timers due at `now`, ordered by due time.
    pub(crate) fn due_timers(&self, now: u64) -> Vec<(String, u64)> {
        let mut due: Vec<(String, u64)> = self
            .timers
            .iter()
            .filter(|(_, due)| **due <= now)
            .map(|(key, due)| (key.clone(), *due))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        due
    }

    /// Due time of the next timer.
    pub(crate) fn next_timer(&self) -> Option<u64> {
        self.timers.values().min().copied()
    }

    /// Records staged for an output stream, accepts logical or physical names.
    pub fn records(&self, output_stream: &str) -> Option<&VecDeque<Record>> {
        self.records.get(&self.metadata.map(output_stream))
    }

    pub(crate) fn records_mut(&mut self, output_stream: &str) -> Option<&mut VecDeque<Record>> {
        let stream = self.metadata.map(output_stream);
        self.records.get_mut(&stream)
    }

    /// Number of records waiting for the next checkpoint.
    pub fn staged(&self) -> usize {
        self.records.values().map(VecDeque::len).sum()
    }

    /// Stages a record for the (logical) output stream, it is appended on the next checkpoint.
    pub fn produce_record(&mut self, output_stream: &str, record: Record) -> Result<()> {
        let stream = self.metadata.map(output_stream);
        let Some(records) = self.records.get_mut(&stream) else {
            return Err(Error::Computation(format!(
                "{} has no output stream {output_stream}",
                self.metadata.name()
            )));
        };
        records.push_back(record);
        Ok(())
    }

    pub fn ask_for_checkpoint(&mut self) {
        self.checkpoint = true;
    }

    pub fn require_checkpoint(&self) -> bool {
        self.checkpoint
    }

    pub fn remove_checkpoint_flag(&mut self) {
        self.checkpoint = false;
    }

    /// Low watermark of a source computation, it has no input record to derive it from.
    pub fn set_source_low_watermark(&mut self, watermark: u64) {
        self.source_low_watermark = watermark;
    }

    pub fn source_low_watermark(&self) -> u64 {
        self.source_low_watermark
    }

    pub fn mark(&self) -> ContextMark {
        ContextMark {
            staged: self
                .records
                .iter()
                .map(|(stream, records)| (stream.clone(), records.len()))
                .collect(),
            timers: self.timers.clone(),
            checkpoint: self.checkpoint,
        }
    }

    /// Discards what was staged since the `mark`, used before retrying a failed record.
    pub fn rollback(&mut self, mark: ContextMark) {
        for (stream, records) in self.records.iter_mut() {
            records.truncate(mark.staged.get(stream).copied().unwrap_or_default());
        }
        self.timers = mark.timers;
        self.checkpoint = mark.checkpoint;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computation::ComputationMetadata;

    fn context() -> ComputationContext {
        ComputationContext::new(ComputationMetadataMapping::new(
            ComputationMetadata::with_streams("C1", 1, 1),
            HashMap::from([
                ("i1".to_string(), "s1".to_string()),
                ("o1".to_string(), "s2".to_string()),
            ]),
        ))
    }

    #[test]
    fn test_produce_record() {
        let mut ctx = context();
        ctx.produce_record("o1", Record::new("k1", "v1")).unwrap();
        ctx.produce_record("o1", Record::new("k2", "v2")).unwrap();
        assert_eq!(ctx.staged(), 2);

        // logical and physical names point to the same records
        let keys: Vec<&str> = ctx.records("s2").unwrap().iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k2"]);
        assert_eq!(ctx.records("o1").unwrap().len(), 2);

        assert!(matches!(
            ctx.produce_record("o2", Record::new("k", "v")),
            Err(Error::Computation(_))
        ));
    }

    #[test]
    fn test_timers() {
        let mut ctx = context();
        ctx.set_timer("b", 20);
        ctx.set_timer("a", 30);
        ctx.set_timer("c", 10);
        assert_eq!(ctx.next_timer(), Some(10));

        let due = ctx.due_timers(20);
        assert_eq!(due, vec![("c".to_string(), 10), ("b".to_string(), 20)]);

        assert_eq!(ctx.remove_timer("c"), Some(10));
        assert_eq!(ctx.remove_timer("c"), None);
        assert_eq!(ctx.timers().len(), 2);
    }

    #[test]
    fn test_checkpoint_flag() {
        let mut ctx = context();
        assert!(!ctx.require_checkpoint());
        ctx.ask_for_checkpoint();
        assert!(ctx.require_checkpoint());
        ctx.remove_checkpoint_flag();
        assert!(!ctx.require_checkpoint());
    }

    #[test]
    fn test_rollback() {
        let mut ctx = context();
        ctx.produce_record("o1", Record::new("k1", "v1")).unwrap();
        let mark = ctx.mark();

        ctx.produce_record("o1", Record::new("k2", "v2")).unwrap();
        ctx.set_timer("t", 10);
        ctx.ask_for_checkpoint();

        ctx.rollback(mark);
        assert_eq!(ctx.staged(), 1);
        assert!(ctx.timers().is_empty());
        assert!(!ctx.require_checkpoint());
    }
}
