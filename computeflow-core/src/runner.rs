//! The runner drives one computation instance over one partition assignment group.
//!
//! ```text
//!                  +--> timers due? --> process_timer ---+
//!                  |                                      |
//! (rebalance) --> loop --> read(timeout) --> process_record --> checkpoint if asked
//!                  ^                                      |
//!                  +--------------------------------------+
//! ```
//!
//! A runner is owned by its task, the pool controls it through a [RunnerHandle]: `stop` and
//! `drain` are flags read once per iteration, `shutdown` cancels a token that also aborts the
//! pending read or sleep. Partition assignment changes of a subscribed runner are delivered as
//! [RebalanceEvent]s on a bounded channel and consumed at the top of the loop.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::computation::{
    Computation, ComputationContext, ComputationMetadataMapping, ComputationPolicy,
    ComputationSupplier,
};
use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::log::{LogManager, LogPartition, LogTailer, RebalanceEvent};
use crate::metrics::{computation_metric_labels, computation_metrics};
use crate::record::{Flag, Record};
use crate::watermark::{Watermark, WatermarkInterval, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerState::Created => write!(f, "created"),
            RunnerState::Running => write!(f, "running"),
            RunnerState::Draining => write!(f, "draining"),
            RunnerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Controls a running [ComputationRunner] and observes its progress.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    id: usize,
    stop: Arc<AtomicBool>,
    drain: Arc<AtomicBool>,
    interrupt: CancellationToken,
    state: watch::Receiver<RunnerState>,
    low_watermark: watch::Receiver<Watermark>,
    assigned: watch::Receiver<bool>,
}

impl RunnerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// The runner exits at the top of its next iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// The runner exits once it starves.
    pub fn drain(&self) {
        self.drain.store(true, Ordering::SeqCst);
    }

    /// Interrupts the pending read or sleep of the runner, it exits without error.
    pub fn shutdown(&self) {
        self.interrupt.cancel();
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    /// Current low watermark of the runner, completed once checkpointed.
    pub fn low_watermark(&self) -> Watermark {
        *self.low_watermark.borrow()
    }

    pub fn is_assigned(&self) -> bool {
        *self.assigned.borrow()
    }

    /// Waits for the runner to get its partitions, returns false if the runner ended before.
    pub async fn wait_for_assignment(&self) -> bool {
        let mut assigned = self.assigned.clone();
        assigned.wait_for(|assigned| *assigned).await.is_ok()
    }
}

/// Drives a [Computation] over an assignment group of partitions.
pub struct ComputationRunner<L: LogManager> {
    id: usize,
    metadata: ComputationMetadataMapping,
    computation: Box<dyn Computation>,
    context: ComputationContext,
    policy: ComputationPolicy,
    config: RunnerConfig,
    log_manager: L,
    tailer: Option<L::Tailer>,
    rebalance_rx: Option<mpsc::Receiver<RebalanceEvent>>,
    low_watermark: WatermarkInterval,
    last_read: Instant,
    last_timer_execution: Option<Instant>,
    stop: Arc<AtomicBool>,
    drain: Arc<AtomicBool>,
    interrupt: CancellationToken,
    state_tx: watch::Sender<RunnerState>,
    low_watermark_tx: watch::Sender<Watermark>,
    assigned_tx: watch::Sender<bool>,
    span: Span,
    metric_labels: Vec<(String, String)>,
}

impl<L: LogManager> ComputationRunner<L> {
    /// Creates the runner of the `id`th assignment group. A source needs no tailer, when the log
    /// manager supports it the runner subscribes to its input streams and waits for an assignment,
    /// otherwise it reads the given `assignments`.
    pub async fn new(
        id: usize,
        log_manager: L,
        metadata: ComputationMetadataMapping,
        assignments: Vec<LogPartition>,
        supplier: ComputationSupplier,
        policy: ComputationPolicy,
        config: RunnerConfig,
    ) -> Result<(Self, RunnerHandle)> {
        let span = info_span!(
            "runner",
            computation = metadata.name(),
            id,
            label = tracing::field::Empty
        );

        let (tailer, rebalance_rx, assigned) = if metadata.is_source() {
            (None, None, true)
        } else if log_manager.supports_subscribe() {
            let (tx, rx) = mpsc::channel(config.rebalance_capacity.max(1));
            let tailer = log_manager
                .subscribe(metadata.name(), metadata.input_streams(), tx)
                .await?;
            (Some(tailer), Some(rx), false)
        } else {
            let tailer = log_manager
                .create_tailer(metadata.name(), assignments.clone())
                .await?;
            (Some(tailer), None, true)
        };

        let (state_tx, state_rx) = watch::channel(RunnerState::Created);
        let (low_watermark_tx, low_watermark_rx) = watch::channel(Watermark::LOWEST);
        let (assigned_tx, assigned_rx) = watch::channel(assigned);
        let stop = Arc::new(AtomicBool::new(false));
        let drain = Arc::new(AtomicBool::new(false));
        let interrupt = CancellationToken::new();

        let handle = RunnerHandle {
            id,
            stop: Arc::clone(&stop),
            drain: Arc::clone(&drain),
            interrupt: interrupt.clone(),
            state: state_rx,
            low_watermark: low_watermark_rx,
            assigned: assigned_rx,
        };

        let runner = Self {
            id,
            computation: supplier(),
            context: ComputationContext::new(metadata.clone()),
            metric_labels: computation_metric_labels(metadata.name()),
            metadata,
            policy,
            config,
            log_manager,
            tailer,
            rebalance_rx,
            low_watermark: WatermarkInterval::new(),
            last_read: Instant::now(),
            last_timer_execution: None,
            stop,
            drain,
            interrupt,
            state_tx,
            low_watermark_tx,
            assigned_tx,
            span,
        };
        if assigned {
            runner.relabel(&assignments);
        }
        Ok((runner, handle))
    }

    /// Runs the loop until the runner is stopped, drained or interrupted. Errors other than an
    /// interruption are returned after the computation is destroyed and the tailer closed.
    pub async fn run(mut self) -> Result<()> {
        let span = self.span.clone();
        async move {
            self.state_tx.send_replace(RunnerState::Running);
            info!("Runner started");

            let result = self.process_loop().await;
            let interrupted = self.interrupt.is_cancelled();
            self.cleanup().await;
            self.state_tx.send_replace(RunnerState::Stopped);

            match result {
                Ok(()) | Err(Error::Interrupted) => {
                    info!(low_watermark = %self.low_watermark.low(), "Runner terminated");
                    Ok(())
                }
                Err(e) if interrupted => {
                    warn!(?e, "Runner interrupted while failing");
                    Ok(())
                }
                Err(e) => {
                    error!(?e, "Runner terminated on failure");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn process_loop(&mut self) -> Result<()> {
        if self.is_assigned() {
            self.computation.init(&mut self.context)?;
        }
        self.last_read = Instant::now();

        while self.continue_loop() {
            self.process_rebalance_events().await?;
            if !self.is_assigned() {
                self.wait_for_rebalance_event().await?;
                continue;
            }
            self.process_timers().await?;
            self.process_record().await?;
        }
        Ok(())
    }

    fn is_assigned(&self) -> bool {
        *self.assigned_tx.borrow()
    }

    fn continue_loop(&mut self) -> bool {
        if self.stop.load(Ordering::SeqCst) || self.interrupt.is_cancelled() {
            debug!("Stop requested");
            return false;
        }
        if !self.drain.load(Ordering::SeqCst) {
            return true;
        }
        if *self.state_tx.borrow() != RunnerState::Draining {
            info!("Draining");
            self.state_tx.send_replace(RunnerState::Draining);
        }
        let starvation = self.config.starvation_timeout;
        let starving = if self.metadata.is_source() {
            self.last_timer_execution
                .is_some_and(|last| last.elapsed() > starvation)
        } else {
            self.last_read.elapsed() > starvation
        };
        if starving {
            info!(?starvation, "No more activity, drain done");
        }
        !starving
    }

    async fn process_rebalance_events(&mut self) -> Result<()> {
        let Some(rx) = self.rebalance_rx.as_mut() else {
            return Ok(());
        };
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        for event in events {
            self.on_rebalance(event).await?;
        }
        Ok(())
    }

    async fn wait_for_rebalance_event(&mut self) -> Result<()> {
        let event = {
            let Some(rx) = self.rebalance_rx.as_mut() else {
                return Ok(());
            };
            tokio::select! {
                _ = self.interrupt.cancelled() => return Err(Error::Interrupted),
                event = rx.recv() => event,
                _ = tokio::time::sleep(self.config.read_timeout) => return Ok(()),
            }
        };
        match event {
            Some(event) => self.on_rebalance(event).await,
            None => Err(Error::Log("rebalance channel closed".to_string())),
        }
    }

    async fn on_rebalance(&mut self, event: RebalanceEvent) -> Result<()> {
        match event {
            RebalanceEvent::Revoked(partitions) => {
                info!(?partitions, "Partitions revoked");
                // the context is about to be replaced, its staged output must not be lost
                if self.is_assigned() {
                    self.checkpoint().await;
                }
                let label = format!("{}-{:02}:revoked", self.metadata.name(), self.id);
                self.span.record("label", label.as_str());
                Ok(())
            }
            RebalanceEvent::Assigned(partitions) => {
                info!(?partitions, "Partitions assigned");
                self.relabel(&partitions);
                self.context = ComputationContext::new(self.metadata.clone());
                self.computation.init(&mut self.context)?;
                self.last_read = Instant::now();
                self.last_timer_execution = None;
                self.assigned_tx.send_replace(true);
                Ok(())
            }
        }
    }

    fn relabel(&self, partitions: &[LogPartition]) {
        let label = if self.metadata.is_source() {
            format!("{}-{:02}:source", self.metadata.name(), self.id)
        } else {
            let partitions: Vec<String> = partitions.iter().map(ToString::to_string).collect();
            format!("{}-{:02}:{}", self.metadata.name(), self.id, partitions.join(","))
        };
        self.span.record("label", label.as_str());
    }

    async fn process_timers(&mut self) -> Result<()> {
        let due = self.context.due_timers(now_millis());
        if due.is_empty() {
            return Ok(());
        }
        for (key, timestamp) in due {
            self.context.remove_timer(&key);
            self.computation
                .process_timer(&mut self.context, &key, timestamp)?;
            computation_metrics()
                .timers_fired
                .get_or_create(&self.metric_labels)
                .inc();
        }
        self.check_source_low_watermark();
        self.last_timer_execution = Some(Instant::now());
        self.checkpoint_if_necessary().await;
        Ok(())
    }

    /// Read timeout capped by the due time of the next timer.
    fn read_timeout(&self) -> Duration {
        match self.context.next_timer() {
            Some(due) => Duration::from_millis(due.saturating_sub(now_millis()))
                .min(self.config.read_timeout),
            None => self.config.read_timeout,
        }
    }

    async fn process_record(&mut self) -> Result<()> {
        let timeout = self.read_timeout();
        let Some(tailer) = self.tailer.as_mut() else {
            return wait_for_timer(&self.interrupt, timeout).await;
        };

        let read = tokio::select! {
            _ = self.interrupt.cancelled() => return Err(Error::Interrupted),
            read = tailer.read(timeout) => read,
        };
        let log_record = match read {
            Ok(Some(log_record)) => log_record,
            Ok(None) => return Ok(()),
            Err(Error::Rebalance) => {
                info!("Read interrupted by a rebalance");
                self.checkpoint().await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.last_read = Instant::now();
        computation_metrics()
            .records_read
            .get_or_create(&self.metric_labels)
            .inc();

        let input_stream = self.metadata.reverse_map(&log_record.offset.partition.name);
        let record = log_record.record;
        let watermark = record.watermark;
        let poison_pill = record.has_flag(Flag::PoisonPill);
        let commit = record.has_flag(Flag::Commit);

        self.process_record_with_policy(&input_stream, record).await?;

        if poison_pill {
            info!(offset = %log_record.offset, "Poison pill received, stopping");
            self.context.ask_for_checkpoint();
            self.stop.store(true, Ordering::SeqCst);
        } else if commit {
            self.context.ask_for_checkpoint();
        }
        self.check_source_low_watermark();
        self.mark_low_watermark(watermark);
        self.checkpoint_if_necessary().await;
        Ok(())
    }

    /// Processes the record, retrying on failure as long as the policy allows. The output staged
    /// by a failed attempt is discarded.
    async fn process_record_with_policy(&mut self, input_stream: &str, record: Record) -> Result<()> {
        let mut backoff = self.policy.retry.backoff();
        loop {
            let mark = self.context.mark();
            let start = Instant::now();
            let result = self
                .computation
                .process_record(&mut self.context, input_stream, record.clone());
            computation_metrics()
                .processing_time
                .get_or_create(&self.metric_labels)
                .observe(start.elapsed().as_micros() as f64);

            let Err(err) = result else {
                return Ok(());
            };
            self.context.rollback(mark);
            computation_metrics()
                .processing_failures
                .get_or_create(&self.metric_labels)
                .inc();

            match backoff.next() {
                Some(delay) => {
                    warn!(?err, ?delay, %record, "Failed to process record, retrying");
                    tokio::select! {
                        _ = self.interrupt.cancelled() => return Err(Error::Interrupted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None if self.policy.continue_on_failure => {
                    error!(?err, %record, "Failed to process record, skipping it");
                    self.context.ask_for_checkpoint();
                    return Ok(());
                }
                None => {
                    error!(?err, %record, "Failed to process record, terminating");
                    return Err(err);
                }
            }
        }
    }

    fn check_source_low_watermark(&mut self) {
        let watermark = self.context.source_low_watermark();
        if watermark > 0 {
            self.mark_low_watermark(watermark);
            self.context.set_source_low_watermark(0);
        }
    }

    fn mark_low_watermark(&mut self, watermark: u64) {
        self.low_watermark.mark(Watermark::of_value(watermark));
        self.low_watermark_tx.send_replace(self.low_watermark.low());
    }

    async fn checkpoint_if_necessary(&mut self) {
        if self.context.require_checkpoint() {
            self.checkpoint().await;
        }
    }

    /// Flushes the staged records, commits the input offsets and publishes the new low
    /// watermark. A failure leaves the checkpoint flag set and the watermark where it was.
    async fn checkpoint(&mut self) -> bool {
        let start = Instant::now();
        match self.try_checkpoint().await {
            Ok(watermark) => {
                self.context.remove_checkpoint_flag();
                let metrics = computation_metrics();
                metrics.checkpoints.get_or_create(&self.metric_labels).inc();
                metrics
                    .checkpoint_time
                    .get_or_create(&self.metric_labels)
                    .observe(start.elapsed().as_micros() as f64);
                metrics
                    .low_watermark
                    .get_or_create(&self.metric_labels)
                    .set(i64::try_from(watermark.value()).unwrap_or(i64::MAX));
                debug!(%watermark, "Checkpoint done");
                true
            }
            Err(e) => {
                computation_metrics()
                    .checkpoint_failures
                    .get_or_create(&self.metric_labels)
                    .inc();
                error!(?e, "CHECKPOINT FAILURE: resume may create duplicates");
                false
            }
        }
    }

    async fn try_checkpoint(&mut self) -> Result<Watermark> {
        self.flush_records().await?;
        let mut low_watermark = self.low_watermark;
        let watermark = low_watermark.checkpoint();
        if let Some(tailer) = self.tailer.as_mut() {
            tailer.commit().await?;
        }
        self.low_watermark = low_watermark;
        self.low_watermark_tx.send_replace(watermark);
        Ok(watermark)
    }

    /// Appends the staged records in order, a record leaves the context once appended.
    async fn flush_records(&mut self) -> Result<()> {
        let low = self.low_watermark.low().value();
        for stream in self.metadata.output_streams() {
            loop {
                let Some(mut record) = self
                    .context
                    .records(&stream)
                    .and_then(|records| records.front())
                    .cloned()
                else {
                    break;
                };
                if record.watermark == 0 {
                    record.watermark = low;
                }
                let key = record.key.clone();
                self.log_manager.append(&stream, &key, record).await?;
                if let Some(records) = self.context.records_mut(&stream) {
                    records.pop_front();
                }
                computation_metrics()
                    .records_written
                    .get_or_create(&self.metric_labels)
                    .inc();
            }
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Err(e) = self.computation.destroy() {
            warn!(?e, "Failed to destroy the computation");
        }
        if let Some(mut tailer) = self.tailer.take() {
            tailer.close().await;
        }
        self.rebalance_rx = None;
    }
}

/// A source has nothing to read, it waits for its next timer.
async fn wait_for_timer(interrupt: &CancellationToken, timeout: Duration) -> Result<()> {
    tokio::select! {
        _ = interrupt.cancelled() => Err(Error::Interrupted),
        _ = tokio::time::sleep(timeout) => Ok(()),
    }
}
