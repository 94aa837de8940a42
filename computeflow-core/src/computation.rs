//! A [Computation] is the user logic hosted by a runner. It consumes records from its input
//! streams, produces records to its output streams through the [ComputationContext] and can set
//! wall clock timers.
//!
//! Computations declare their streams with logical names (`i1`, `o1`, ...), the topology maps them
//! to the physical streams with a [ComputationMetadataMapping].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::Result;
use crate::record::Record;

pub mod builtin;
mod context;
mod policy;

pub use context::{ComputationContext, ContextMark};
pub use policy::{Backoff, ComputationPolicy, RetryPolicy};
pub(crate) use policy::millis;

/// Contract of the user logic hosted by a runner. A computation instance is driven by a single
/// runner, hence the `&mut self` on every callback.
pub trait Computation: Send {
    fn metadata(&self) -> &ComputationMetadata;

    /// Called once the runner got its partitions assigned, and again after every reassignment with
    /// a fresh context.
    fn init(&mut self, ctx: &mut ComputationContext) -> Result<()>;

    /// Processes a record read from the (logical) `input_stream`.
    fn process_record(
        &mut self,
        ctx: &mut ComputationContext,
        input_stream: &str,
        record: Record,
    ) -> Result<()>;

    /// Called when the timer `key` is due, the timer is already removed from the context.
    fn process_timer(&mut self, ctx: &mut ComputationContext, key: &str, timestamp: u64) -> Result<()> {
        let _ = (ctx, key, timestamp);
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Creates a new computation instance for each runner of a pool.
pub type ComputationSupplier = Arc<dyn Fn() -> Box<dyn Computation> + Send + Sync>;

/// Name and logical streams of a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationMetadata {
    pub name: String,
    pub input_streams: Vec<String>,
    pub output_streams: Vec<String>,
}

impl ComputationMetadata {
    pub fn new(name: impl Into<String>, input_streams: Vec<String>, output_streams: Vec<String>) -> Self {
        Self {
            name: name.into(),
            input_streams,
            output_streams,
        }
    }

    /// Metadata with the conventional stream names `i1..iN` and `o1..oN`.
    pub fn with_streams(name: impl Into<String>, inputs: usize, outputs: usize) -> Self {
        Self::new(
            name,
            (1..=inputs).map(|i| format!("i{i}")).collect(),
            (1..=outputs).map(|i| format!("o{i}")).collect(),
        )
    }
}

/// [ComputationMetadata] bound to physical stream names. Logical names without mapping are
/// physical names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationMetadataMapping {
    metadata: ComputationMetadata,
    mapping: HashMap<String, String>,
    reverse_mapping: HashMap<String, String>,
}

impl ComputationMetadataMapping {
    pub fn new(metadata: ComputationMetadata, mapping: HashMap<String, String>) -> Self {
        let reverse_mapping = mapping
            .iter()
            .map(|(logical, physical)| (physical.clone(), logical.clone()))
            .collect();
        Self {
            metadata,
            mapping,
            reverse_mapping,
        }
    }

    /// Mapping where every stream keeps its logical name.
    pub fn identity(metadata: ComputationMetadata) -> Self {
        Self::new(metadata, HashMap::new())
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn metadata(&self) -> &ComputationMetadata {
        &self.metadata
    }

    /// Physical name of a logical stream.
    pub fn map(&self, logical: &str) -> String {
        self.mapping
            .get(logical)
            .cloned()
            .unwrap_or_else(|| logical.to_string())
    }

    /// Logical name of a physical stream.
    pub fn reverse_map(&self, physical: &str) -> String {
        self.reverse_mapping
            .get(physical)
            .cloned()
            .unwrap_or_else(|| physical.to_string())
    }

    pub fn input_streams(&self) -> Vec<String> {
        self.metadata
            .input_streams
            .iter()
            .map(|s| self.map(s))
            .collect()
    }

    pub fn output_streams(&self) -> Vec<String> {
        self.metadata
            .output_streams
            .iter()
            .map(|s| self.map(s))
            .collect()
    }

    /// A computation without input stream produces records from its timers.
    pub fn is_source(&self) -> bool {
        self.metadata.input_streams.is_empty()
    }
}

impl fmt::Display for ComputationMetadataMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(inputs={:?}, outputs={:?})",
            self.metadata.name,
            self.input_streams(),
            self.output_streams()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> ComputationMetadataMapping {
        ComputationMetadataMapping::new(
            ComputationMetadata::with_streams("C1", 1, 2),
            HashMap::from([
                ("i1".to_string(), "s1".to_string()),
                ("o1".to_string(), "s2".to_string()),
            ]),
        )
    }

    #[test]
    fn test_with_streams() {
        let metadata = ComputationMetadata::with_streams("C1", 2, 1);
        assert_eq!(metadata.input_streams, vec!["i1", "i2"]);
        assert_eq!(metadata.output_streams, vec!["o1"]);
    }

    #[test]
    fn test_mapping() {
        let mapping = mapping();
        assert_eq!(mapping.name(), "C1");
        assert_eq!(mapping.map("i1"), "s1");
        assert_eq!(mapping.reverse_map("s1"), "i1");
        // unmapped names are kept as is
        assert_eq!(mapping.map("o2"), "o2");
        assert_eq!(mapping.reverse_map("o2"), "o2");
        assert_eq!(mapping.input_streams(), vec!["s1"]);
        assert_eq!(mapping.output_streams(), vec!["s2", "o2"]);
        assert!(!mapping.is_source());
        assert_eq!(
            mapping.to_string(),
            r#"C1(inputs=["s1"], outputs=["s2", "o2"])"#
        );
    }

    #[test]
    fn test_source() {
        let mapping = ComputationMetadataMapping::identity(ComputationMetadata::with_streams("G", 0, 1));
        assert!(mapping.is_source());
        assert_eq!(mapping.output_streams(), vec!["o1"]);
    }
}
