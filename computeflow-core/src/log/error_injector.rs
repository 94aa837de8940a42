//! Error injection controller for the in-memory log.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Forces failures on the next operations of a [super::MemoryLogManager], this is how the
/// checkpoint failure paths are exercised.
#[derive(Debug, Default)]
pub struct ErrorInjector {
    /// Fail the next N appends.
    fail_next_appends: AtomicUsize,
    /// Skip the first N appends before starting to fail.
    skip_appends_before_fail: AtomicUsize,
    /// Fail the next N commits.
    fail_next_commits: AtomicUsize,
    /// Fail the next N reads.
    fail_next_reads: AtomicUsize,
    /// Artificial read latency in milliseconds.
    read_latency_ms: AtomicU64,
}

impl ErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&self, count: usize) {
        self.fail_next_appends.store(count, Ordering::Relaxed);
    }

    /// Lets `skip` appends go through, then fails the next `fail` ones. Useful to break a flush
    /// in the middle.
    pub fn skip_appends_then_fail(&self, skip: usize, fail: usize) {
        self.skip_appends_before_fail.store(skip, Ordering::Relaxed);
        self.fail_next_appends.store(fail, Ordering::Relaxed);
    }

    pub fn fail_commits(&self, count: usize) {
        self.fail_next_commits.store(count, Ordering::Relaxed);
    }

    pub fn fail_reads(&self, count: usize) {
        self.fail_next_reads.store(count, Ordering::Relaxed);
    }

    pub fn set_read_latency(&self, ms: u64) {
        self.read_latency_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn should_fail_append(&self) -> bool {
        let skip = Self::decrement_counter(&self.skip_appends_before_fail);
        if skip {
            return false;
        }
        Self::decrement_counter(&self.fail_next_appends)
    }

    pub(crate) fn should_fail_commit(&self) -> bool {
        Self::decrement_counter(&self.fail_next_commits)
    }

    pub(crate) fn should_fail_read(&self) -> bool {
        Self::decrement_counter(&self.fail_next_reads)
    }

    pub(crate) async fn apply_read_latency(&self) {
        let ms = self.read_latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Decrements the counter if positive, returns whether it was.
    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }
}
