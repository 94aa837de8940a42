//! [Record] is the unit of data flowing between computations. It is appended to a partition of a
//! stream by the producing runner and read back by the consuming runners.

use std::fmt;

use bytes::Bytes;

/// Flags carried by a [Record] to drive the consuming runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Default,
    /// Ask the consuming runner for a checkpoint.
    Commit,
    /// Ask the consuming runner for a checkpoint and then to stop.
    PoisonPill,
    External,
    Trace,
}

impl Flag {
    fn bit(self) -> u8 {
        match self {
            Flag::Default => 1,
            Flag::Commit => 1 << 1,
            Flag::PoisonPill => 1 << 2,
            Flag::External => 1 << 3,
            Flag::Trace => 1 << 4,
        }
    }
}

/// Compact set of [Flag]s.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn of(flag: Flag) -> Self {
        Self(flag.bit())
    }

    pub fn contains(&self, flag: Flag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn insert(&mut self, flag: Flag) {
        self.0 |= flag.bit();
    }

    pub fn remove(&mut self, flag: Flag) {
        self.0 &= !flag.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<Flag> = [
            Flag::Default,
            Flag::Commit,
            Flag::PoisonPill,
            Flag::External,
            Flag::Trace,
        ]
        .into_iter()
        .filter(|flag| self.contains(*flag))
        .collect();
        f.debug_set().entries(set).finish()
    }
}

/// A keyed payload with a watermark.
/// NOTE: It is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// key used to pick the partition on append
    pub key: String,
    /// opaque payload
    pub data: Bytes,
    /// watermark value of the record, 0 means not set
    pub watermark: u64,
    pub flags: Flags,
}

impl Record {
    pub fn new(key: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
            watermark: 0,
            flags: Flags::of(Flag::Default),
        }
    }

    /// A record that makes the consuming runner checkpoint and terminate.
    pub fn poison_pill() -> Self {
        Self::new("_POISON_PILL_", Bytes::new()).with_flag(Flag::PoisonPill)
    }

    /// A record that makes the consuming runner checkpoint.
    pub fn commit() -> Self {
        Self::new("_COMMIT_", Bytes::new()).with_flag(Flag::Commit)
    }

    pub fn with_watermark(mut self, watermark: u64) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flags.insert(flag);
        self
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(flag)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Record(key={}, watermark={}, flags={:?}, data.len={})",
            self.key,
            self.watermark,
            self.flags,
            self.data.len()
        )
    }
}
