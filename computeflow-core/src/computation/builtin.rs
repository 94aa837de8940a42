//! Ready to use computations, they are handy to build demo topologies and tests.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::Result;
use crate::computation::{Computation, ComputationContext, ComputationMetadata, ComputationSupplier};
use crate::record::Record;
use crate::watermark::now_millis;

const GENERATE_TIMER: &str = "generate";
const COUNT_TIMER: &str = "count";

/// Source emitting `records` records on its `o1` stream, by batches on each timer. Every batch
/// carries the watermark of its generation time which becomes the source low watermark.
#[derive(Debug, Clone)]
pub struct GeneratorSource {
    metadata: ComputationMetadata,
    records: u64,
    batch_size: u64,
    interval: Duration,
    generated: u64,
}

impl GeneratorSource {
    pub fn new(name: impl Into<String>, records: u64, batch_size: u64, interval: Duration) -> Self {
        Self {
            metadata: ComputationMetadata::with_streams(name, 0, 1),
            records,
            batch_size: batch_size.max(1),
            interval,
            generated: 0,
        }
    }

    pub fn supplier(name: &str, records: u64, batch_size: u64, interval: Duration) -> ComputationSupplier {
        let name = name.to_string();
        Arc::new(move || -> Box<dyn Computation> {
            Box::new(GeneratorSource::new(name.as_str(), records, batch_size, interval))
        })
    }
}

impl Computation for GeneratorSource {
    fn metadata(&self) -> &ComputationMetadata {
        &self.metadata
    }

    fn init(&mut self, ctx: &mut ComputationContext) -> Result<()> {
        if self.generated < self.records {
            ctx.set_timer(GENERATE_TIMER, now_millis());
        }
        Ok(())
    }

    fn process_record(&mut self, _ctx: &mut ComputationContext, _input_stream: &str, _record: Record) -> Result<()> {
        Ok(())
    }

    fn process_timer(&mut self, ctx: &mut ComputationContext, _key: &str, _timestamp: u64) -> Result<()> {
        let end = (self.generated + self.batch_size).min(self.records);
        let watermark = now_millis();
        for i in self.generated..end {
            ctx.produce_record(
                "o1",
                Record::new(format!("key{i}"), format!("value{i}")).with_watermark(watermark),
            )?;
        }
        self.generated = end;
        ctx.set_source_low_watermark(watermark);
        ctx.ask_for_checkpoint();

        if self.generated < self.records {
            ctx.set_timer(GENERATE_TIMER, now_millis() + self.interval.as_millis() as u64);
        } else {
            debug!(name = %self.metadata.name, records = self.records, "Generation done");
        }
        Ok(())
    }
}

/// Copies every input record to each of its outputs.
#[derive(Debug, Clone)]
pub struct Forward {
    metadata: ComputationMetadata,
}

impl Forward {
    pub fn new(name: impl Into<String>, outputs: usize) -> Self {
        Self {
            metadata: ComputationMetadata::with_streams(name, 1, outputs),
        }
    }

    pub fn supplier(name: &str, outputs: usize) -> ComputationSupplier {
        let name = name.to_string();
        Arc::new(move || -> Box<dyn Computation> { Box::new(Forward::new(name.as_str(), outputs)) })
    }
}

impl Computation for Forward {
    fn metadata(&self) -> &ComputationMetadata {
        &self.metadata
    }

    fn init(&mut self, _ctx: &mut ComputationContext) -> Result<()> {
        Ok(())
    }

    fn process_record(&mut self, ctx: &mut ComputationContext, _input_stream: &str, record: Record) -> Result<()> {
        for output in &self.metadata.output_streams {
            ctx.produce_record(output, record.clone())?;
        }
        ctx.ask_for_checkpoint();
        Ok(())
    }
}

/// Counts the records of its inputs and emits the count on `o1` at each interval. The key of
/// the emitted record is the name of the computation, the payload the decimal count.
#[derive(Debug, Clone)]
pub struct RecordCounter {
    metadata: ComputationMetadata,
    interval: Duration,
    count: u64,
}

impl RecordCounter {
    pub fn new(name: impl Into<String>, inputs: usize, interval: Duration) -> Self {
        Self {
            metadata: ComputationMetadata::with_streams(name, inputs, 1),
            interval,
            count: 0,
        }
    }

    pub fn supplier(name: &str, inputs: usize, interval: Duration) -> ComputationSupplier {
        let name = name.to_string();
        Arc::new(move || -> Box<dyn Computation> {
            Box::new(RecordCounter::new(name.as_str(), inputs, interval))
        })
    }

    fn next_timer(&self) -> u64 {
        now_millis() + self.interval.as_millis() as u64
    }
}

impl Computation for RecordCounter {
    fn metadata(&self) -> &ComputationMetadata {
        &self.metadata
    }

    // the pending count survives a reassignment, it is emitted on the next timer
    fn init(&mut self, ctx: &mut ComputationContext) -> Result<()> {
        ctx.set_timer(COUNT_TIMER, self.next_timer());
        Ok(())
    }

    fn process_record(&mut self, _ctx: &mut ComputationContext, _input_stream: &str, _record: Record) -> Result<()> {
        self.count += 1;
        Ok(())
    }

    fn process_timer(&mut self, ctx: &mut ComputationContext, _key: &str, _timestamp: u64) -> Result<()> {
        if self.count > 0 {
            ctx.produce_record(
                "o1",
                Record::new(self.metadata.name.as_str(), self.count.to_string()),
            )?;
            self.count = 0;
        }
        ctx.ask_for_checkpoint();
        ctx.set_timer(COUNT_TIMER, self.next_timer());
        Ok(())
    }
}

/// Sums the counts emitted by a [RecordCounter].
pub fn total_count(records: &[Record]) -> u64 {
    records
        .iter()
        .filter_map(|record| std::str::from_utf8(&record.data).ok()?.parse::<u64>().ok())
        .sum()
}
