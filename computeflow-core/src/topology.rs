//! A topology is the graph of the computations linked by the streams they read and write.
//!
//! ```text
//! GENERATOR --(s1)--> C1 --(s2)--> COUNTER --(output)
//! ```
//!
//! Computations are added with the mapping of their logical streams to physical streams, e.g.
//! `["i1:s1", "o1:s2"]`.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::computation::{ComputationMetadataMapping, ComputationSupplier};
use crate::error::{Error, Result};

#[derive(Clone)]
struct TopologyEntry {
    mapping: ComputationMetadataMapping,
    supplier: ComputationSupplier,
}

#[derive(Clone, Default)]
pub struct Topology {
    entries: Vec<TopologyEntry>,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| &entry.mapping))
            .finish()
    }
}

/// Builds a [Topology], errors are reported by [TopologyBuilder::build].
#[derive(Default)]
pub struct TopologyBuilder {
    entries: Vec<TopologyEntry>,
    errors: Vec<String>,
}

impl TopologyBuilder {
    /// Adds the computation created by `supplier` with its `logical:physical` stream mappings.
    pub fn add_computation(mut self, supplier: ComputationSupplier, mappings: &[&str]) -> Self {
        let metadata = supplier().metadata().clone();
        let name = metadata.name.clone();
        if self.entries.iter().any(|entry| entry.mapping.name() == name) {
            self.errors.push(format!("duplicate computation {name}"));
            return self;
        }

        let mut mapping = HashMap::new();
        for entry in mappings {
            let Some((logical, physical)) = entry
                .split_once(':')
                .filter(|(logical, physical)| !logical.is_empty() && !physical.is_empty())
            else {
                self.errors
                    .push(format!("{name}: invalid stream mapping {entry:?}, expecting logical:physical"));
                continue;
            };
            if !metadata.input_streams.iter().any(|s| s == logical)
                && !metadata.output_streams.iter().any(|s| s == logical)
            {
                self.errors
                    .push(format!("{name}: unknown stream {logical} in mapping {entry:?}"));
                continue;
            }
            if mapping
                .insert(logical.to_string(), physical.to_string())
                .is_some()
            {
                self.errors
                    .push(format!("{name}: stream {logical} mapped twice"));
            }
        }

        self.entries.push(TopologyEntry {
            mapping: ComputationMetadataMapping::new(metadata, mapping),
            supplier,
        });
        self
    }

    pub fn build(self) -> Result<Topology> {
        if !self.errors.is_empty() {
            return Err(Error::Topology(self.errors.join(", ")));
        }
        if self.entries.is_empty() {
            return Err(Error::Topology("no computation".to_string()));
        }
        Ok(Topology {
            entries: self.entries,
        })
    }
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Physical streams read or written by the computations, sorted.
    pub fn streams(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|entry| {
                entry
                    .mapping
                    .input_streams()
                    .into_iter()
                    .chain(entry.mapping.output_streams())
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Computations in insertion order.
    pub fn computations(&self) -> Vec<&ComputationMetadataMapping> {
        self.entries.iter().map(|entry| &entry.mapping).collect()
    }

    pub fn metadata(&self, computation: &str) -> Option<&ComputationMetadataMapping> {
        self.entry(computation).map(|entry| &entry.mapping)
    }

    pub fn supplier(&self, computation: &str) -> Option<ComputationSupplier> {
        self.entry(computation).map(|entry| Arc::clone(&entry.supplier))
    }

    fn entry(&self, computation: &str) -> Option<&TopologyEntry> {
        self.entries
            .iter()
            .find(|entry| entry.mapping.name() == computation)
    }

    /// Computations writing to the stream.
    pub fn producers(&self, stream: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.mapping.output_streams().iter().any(|s| s == stream))
            .map(|entry| entry.mapping.name().to_string())
            .collect()
    }

    /// Computations reading the stream.
    pub fn consumers(&self, stream: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.mapping.input_streams().iter().any(|s| s == stream))
            .map(|entry| entry.mapping.name().to_string())
            .collect()
    }

    /// Computations producing the inputs of `computation`, sorted.
    pub fn parents(&self, computation: &str) -> Vec<String> {
        let Some(mapping) = self.metadata(computation) else {
            return Vec::new();
        };
        mapping
            .input_streams()
            .iter()
            .flat_map(|stream| self.producers(stream))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Computations consuming the outputs of `computation`, sorted.
    pub fn children(&self, computation: &str) -> Vec<String> {
        let Some(mapping) = self.metadata(computation) else {
            return Vec::new();
        };
        mapping
            .output_streams()
            .iter()
            .flat_map(|stream| self.consumers(stream))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// `computation` and all the computations reachable from it through the streams, sorted.
    pub fn descendants(&self, computation: &str) -> Vec<String> {
        if self.entry(computation).is_none() {
            return Vec::new();
        }
        let mut visited = BTreeSet::from([computation.to_string()]);
        let mut queue = VecDeque::from([computation.to_string()]);
        while let Some(current) = queue.pop_front() {
            for child in self.children(&current) {
                if visited.insert(child.clone()) {
                    queue.push_back(child);
                }
            }
        }
        visited.into_iter().collect()
    }

    /// Computations without parent: the sources and the readers of streams produced outside of
    /// the topology.
    pub fn roots(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.mapping.name())
            .filter(|name| self.parents(name).is_empty())
            .map(ToString::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::computation::builtin::{Forward, GeneratorSource, RecordCounter};

    fn topology() -> Topology {
        Topology::builder()
            .add_computation(
                GeneratorSource::supplier("GENERATOR", 10, 2, Duration::from_millis(1)),
                &["o1:s1"],
            )
            .add_computation(Forward::supplier("C1", 2), &["i1:s1", "o1:s2", "o2:s3"])
            .add_computation(Forward::supplier("C2", 1), &["i1:s2", "o1:s4"])
            .add_computation(RecordCounter::supplier("COUNTER", 2, Duration::from_millis(10)), &[
                "i1:s3",
                "i2:s4",
                "o1:output",
            ])
            .add_computation(Forward::supplier("EXTERNAL", 1), &["i1:input", "o1:s4"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_streams() {
        let topology = topology();
        assert_eq!(
            topology.streams(),
            vec!["input", "output", "s1", "s2", "s3", "s4"]
        );
        assert_eq!(topology.computations().len(), 5);
        assert_eq!(topology.producers("s4"), vec!["C2", "EXTERNAL"]);
        assert_eq!(topology.consumers("s1"), vec!["C1"]);
        assert!(topology.metadata("C1").is_some());
        assert!(topology.supplier("UNKNOWN").is_none());
    }

    #[test]
    fn test_graph() {
        let topology = topology();
        assert_eq!(topology.roots(), vec!["GENERATOR", "EXTERNAL"]);
        assert_eq!(topology.parents("COUNTER"), vec!["C1", "C2", "EXTERNAL"]);
        assert_eq!(topology.children("C1"), vec!["C2", "COUNTER"]);
        assert_eq!(
            topology.descendants("GENERATOR"),
            vec!["C1", "C2", "COUNTER", "GENERATOR"]
        );
        assert_eq!(topology.descendants("EXTERNAL"), vec!["COUNTER", "EXTERNAL"]);
        assert!(topology.descendants("UNKNOWN").is_empty());
    }

    #[test]
    fn test_invalid_mapping() {
        let result = Topology::builder()
            .add_computation(Forward::supplier("C1", 1), &["i1-s1"])
            .build();
        assert!(matches!(result, Err(Error::Topology(_))));

        let result = Topology::builder()
            .add_computation(Forward::supplier("C1", 1), &["i2:s1"])
            .build();
        assert!(matches!(result, Err(Error::Topology(_))));

        let result = Topology::builder()
            .add_computation(Forward::supplier("C1", 1), &["i1:s1", "i1:s2"])
            .build();
        assert!(matches!(result, Err(Error::Topology(_))));
    }

    #[test]
    fn test_duplicate_computation() {
        let result = Topology::builder()
            .add_computation(Forward::supplier("C1", 1), &["i1:s1", "o1:s2"])
            .add_computation(Forward::supplier("C1", 1), &["i1:s2", "o1:s3"])
            .build();
        match result {
            Err(Error::Topology(msg)) => assert!(msg.contains("duplicate computation C1")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(Topology::builder().build(), Err(Error::Topology(_))));
    }
}
