//! Watermark is a monotonically increasing logical timestamp telling that all the records up to
//! this point have been processed. A watermark is "completed" once the records it covers have been
//! checkpointed (output flushed and input offsets committed).
//!
//! Each runner tracks its own low watermark with a [WatermarkInterval]; the pool and the processor
//! aggregate them.

use std::fmt;

use chrono::Utc;

/// Ordered by value first, then by completion: for the same value the completed watermark is
/// greater than the uncompleted one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark {
    value: u64,
    completed: bool,
}

impl Watermark {
    pub const LOWEST: Watermark = Watermark {
        value: 0,
        completed: false,
    };

    pub fn of_value(value: u64) -> Self {
        Self {
            value,
            completed: false,
        }
    }

    /// Watermark of the current wall clock in milliseconds.
    pub fn of_now() -> Self {
        Self::of_value(now_millis())
    }

    pub fn completed_of(watermark: Watermark) -> Self {
        Self {
            value: watermark.value,
            completed: true,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// A watermark without value carries no progress information.
    pub fn is_trivial(&self) -> bool {
        self.value == 0
    }

    /// Returns true if all the records up to `timestamp` are processed.
    pub fn is_done(&self, timestamp: u64) -> bool {
        Watermark::of_value(timestamp) < *self
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            self.value,
            if self.completed { " (completed)" } else { "" }
        )
    }
}

/// Wall clock in milliseconds since epoch, the unit of timers and generated watermarks.
pub(crate) fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Low/high watermarks seen by a runner since its last checkpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct WatermarkInterval {
    low: Watermark,
    high: Watermark,
}

impl WatermarkInterval {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn mark(&mut self, watermark: Watermark) {
        if watermark.is_trivial() {
            return;
        }
        if self.low.is_trivial() {
            self.low = watermark;
            self.high = watermark;
            return;
        }
        if watermark < self.low {
            self.low = watermark;
        }
        if watermark > self.high {
            self.high = watermark;
        }
    }

    /// Everything marked so far is checkpointed, the low watermark becomes the completed high.
    pub(crate) fn checkpoint(&mut self) -> Watermark {
        if self.high.is_trivial() {
            return self.low;
        }
        self.low = Watermark::completed_of(self.high);
        self.low
    }

    pub(crate) fn low(&self) -> Watermark {
        self.low
    }
}
