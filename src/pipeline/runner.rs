use super::metrics::StreamMetrics;
use crate::config::types::{Config, DataLossStrategy, StreamConfig};
use crate::config::version::stream_fingerprint;
use crate::dedup::{DedupOutcome, DedupStore};
use crate::retry::Backoff;
use crate::sink::{RawRows, SinkError, SinkWriter, WindowCountRow};
use crate::source::{DataLossGap, PartitionReader, PartitionedLog, PolledRecord, ReaderError};
use crate::storage::{
    BatchPlan, BatchStats, CheckpointError, CheckpointManager, CheckpointRecord, CheckpointStore,
};
use crate::storage::checkpoint::CURRENT_VERSION;
use crate::watermark::WatermarkTracker;
use crate::window::{AddOutcome, WindowSnapshot, WindowedAggregator};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that stop a stream's loop
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown stream '{0}'")]
    UnknownStream(String),

    #[error("reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("stream '{stream}' task failed: {reason}")]
    Task { stream: String, reason: String },
}

impl PipelineError {
    /// Log outages that outlasted the reader's retries; the batch is only delayed
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Reader(ReaderError::Log(e)) if e.is_transient())
    }
}

/// What one call to [`StreamRunner::run_batch`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// No new input; nothing was committed
    Idle,
    Committed { batch_id: u64, stats: BatchStats },
    /// Output could not be staged; state rolled back and the batch will be retried
    Aborted { batch_id: u64 },
}

/// Input of one batch, with the plan that describes it
struct BatchInput {
    plan: BatchPlan,
    records: Vec<PolledRecord>,
    malformed: u64,
}

/// In-memory state at batch start, restored if the batch aborts
struct Rollback {
    tracker: WatermarkTracker,
    dedup: DedupStore,
    aggregator: Option<WindowedAggregator>,
}

struct Aggregation {
    table: String,
    group_by: String,
    windows: WindowedAggregator,
}

/// The micro-batch loop of a single stream.
///
/// Each batch: read (or replay a recorded plan), deduplicate and observe
/// watermarks, aggregate, stage Parquet, publish, then append the checkpoint
/// record. All state lives here and is passed to nothing else.
pub struct StreamRunner {
    stream_id: String,
    config: StreamConfig,
    fingerprint: String,
    reader: PartitionReader,
    tracker: WatermarkTracker,
    dedup: DedupStore,
    aggregation: Option<Aggregation>,
    sink: SinkWriter,
    checkpoints: CheckpointManager,
    metrics: Arc<StreamMetrics>,
    on_data_loss: DataLossStrategy,
    stage_backoff: Backoff,
    pending_gaps: Vec<DataLossGap>,
    pending_plan: Option<BatchPlan>,
    recovered: bool,
}

impl StreamRunner {
    pub fn new(
        config: &Config,
        stream_id: &str,
        log: Arc<dyn PartitionedLog>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, PipelineError> {
        let stream = config
            .streams
            .get(stream_id)
            .ok_or_else(|| PipelineError::UnknownStream(stream_id.to_string()))?;

        let aggregation = stream.aggregation.as_ref().map(|agg| Aggregation {
            table: agg.table.clone(),
            group_by: agg.group_by.clone(),
            windows: WindowedAggregator::new(stream_id, agg.window),
        });

        let mut stage_backoff = Backoff::from(&config.reader.retry);
        stage_backoff.max_attempts = config.sink.max_stage_attempts.max(1);

        Ok(Self {
            stream_id: stream_id.to_string(),
            config: stream.clone(),
            fingerprint: stream_fingerprint(stream),
            reader: PartitionReader::new(stream, &config.reader, log),
            tracker: WatermarkTracker::new(stream.watermark.lateness),
            dedup: DedupStore::new(stream.dedup.retention),
            aggregation,
            sink: SinkWriter::new(&config.sink)?,
            checkpoints: CheckpointManager::new(store, stream_id, config.checkpoint.retain),
            metrics: Arc::new(StreamMetrics::new()),
            on_data_loss: config.reader.on_data_loss,
            stage_backoff,
            pending_gaps: Vec::new(),
            pending_plan: None,
            recovered: false,
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn metrics(&self) -> Arc<StreamMetrics> {
        self.metrics.clone()
    }

    /// Current low watermark of the stream
    pub fn watermark(&self) -> Option<chrono::DateTime<Utc>> {
        self.tracker.watermark(&self.stream_id)
    }

    fn tables(&self) -> Vec<String> {
        let mut tables = vec![self.config.table.clone()];
        if let Some(agg) = &self.aggregation {
            tables.push(agg.table.clone());
        }
        tables
    }

    /// Restore state from the last committed checkpoint and clean up staged output
    pub async fn recover(&mut self) -> Result<(), PipelineError> {
        let recovery = self.checkpoints.recover().await?;

        let tables = self.tables();
        let purged = self.sink.purge_staged(&tables)?;
        if purged > 0 {
            info!(stream = %self.stream_id, files = purged, "Purged staged output of an uncommitted batch");
        }

        if let Some(record) = &recovery.last {
            if record.config_fingerprint != self.fingerprint {
                warn!(
                    stream = %self.stream_id,
                    batch_id = record.batch_id,
                    "Stream config changed since the last checkpoint"
                );
            }
            self.reader.restore(&record.offsets);
            self.tracker.restore(&record.watermark);
            self.dedup.restore(&record.dedup);
            if let Some(agg) = &mut self.aggregation {
                agg.windows.restore(&record.windows);
            }
            self.metrics.set_last_batch_id(record.batch_id);
            self.metrics.set_watermark(self.watermark());
            info!(
                stream = %self.stream_id,
                batch_id = record.batch_id,
                partitions = record.offsets.len(),
                dedup_entries = self.dedup.len(),
                "Resumed from checkpoint"
            );
        }

        self.pending_plan = recovery.pending_plan;
        self.recovered = true;
        Ok(())
    }

    /// Run one micro-batch
    pub async fn run_batch(&mut self) -> Result<BatchOutcome, PipelineError> {
        if !self.recovered {
            self.recover().await?;
        }

        let batch_id = self.checkpoints.begin_batch();
        let cursors = self.reader.cursors().clone();
        let gaps = self.pending_gaps.clone();
        let pending = self.pending_plan.clone();
        let input = match self.plan_input(batch_id).await {
            Ok(input) => input,
            Err(e) => {
                // Nothing was recorded, so the next attempt plans from the same place.
                self.reader.restore(&cursors);
                self.pending_gaps = gaps;
                self.pending_plan = pending;
                return Err(e);
            }
        };

        if input.plan.is_empty() {
            return Ok(BatchOutcome::Idle);
        }

        self.checkpoints.record_plan(&input.plan).await?;
        self.process(input).await
    }

    /// Run batches on the trigger interval until `shutdown` is cancelled.
    ///
    /// Cancellation is only observed between batches. A log outage delays the
    /// batch to the next trigger; any other error stops the loop.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        self.recover().await?;
        info!(stream = %self.stream_id, topic = %self.config.topic, "Stream started");

        let mut ticker = tokio::time::interval(self.config.trigger.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Drain backlog without waiting for the next tick
            loop {
                match self.run_batch().await {
                    Ok(BatchOutcome::Committed { .. }) if !shutdown.is_cancelled() => continue,
                    Ok(_) => break,
                    Err(e) if e.is_transient() => {
                        warn!(stream = %self.stream_id, error = %e, "Log unavailable, batch delayed to the next trigger");
                        self.metrics.record_error(&e.to_string());
                        break;
                    }
                    Err(e) => {
                        error!(stream = %self.stream_id, error = %e, "Stream loop halted");
                        self.metrics.record_error(&e.to_string());
                        return Err(e);
                    }
                }
            }
        }

        info!(stream = %self.stream_id, "Stream stopped");
        Ok(())
    }

    async fn plan_input(&mut self, batch_id: u64) -> Result<BatchInput, PipelineError> {
        match self.pending_plan.take() {
            Some(plan) if plan.batch_id == batch_id => self.replay(plan).await,
            Some(plan) => {
                warn!(
                    stream = %self.stream_id,
                    plan_batch = plan.batch_id,
                    batch_id = batch_id,
                    "Ignoring batch plan that does not follow the last checkpoint"
                );
                self.carry_gaps(plan.data_loss);
                self.poll_fresh(batch_id).await
            }
            None => self.poll_fresh(batch_id).await,
        }
    }

    /// Put gaps of an abandoned plan ahead of any acknowledged since
    fn carry_gaps(&mut self, mut gaps: Vec<DataLossGap>) {
        gaps.append(&mut self.pending_gaps);
        self.pending_gaps = gaps;
    }

    async fn poll_fresh(&mut self, batch_id: u64) -> Result<BatchInput, PipelineError> {
        self.reader.discover().await?;
        let mut start = self.reader.cursors().clone();
        let max = self.config.trigger.max_records_per_partition;

        let mut records = Vec::new();
        let mut malformed = 0;
        let partitions: Vec<u32> = start.keys().copied().collect();
        for partition in partitions {
            let polled = match self.reader.poll_next(partition, max).await {
                Err(e @ ReaderError::DataLossDetected { .. }) => {
                    self.handle_data_loss(partition, e)?;
                    if let Some(offset) = self.reader.cursors().get(&partition) {
                        start.insert(partition, *offset);
                    }
                    self.reader.poll_next(partition, max).await?
                }
                other => other?,
            };
            records.extend(polled.records);
            malformed += polled.malformed;
        }

        Ok(BatchInput {
            plan: BatchPlan {
                stream_id: self.stream_id.clone(),
                batch_id,
                start,
                end: self.reader.cursors().clone(),
                data_loss: std::mem::take(&mut self.pending_gaps),
            },
            records,
            malformed,
        })
    }

    /// Re-read exactly the input recorded for an uncommitted batch
    async fn replay(&mut self, plan: BatchPlan) -> Result<BatchInput, PipelineError> {
        info!(stream = %self.stream_id, batch_id = plan.batch_id, "Replaying recorded batch");
        self.reader.restore(&plan.start);

        let mut records = Vec::new();
        let mut malformed = 0;
        let ranges: Vec<(u32, u64, u64)> = plan.ranges().collect();
        for (partition, start, end) in ranges {
            match self.reader.read_range(partition, start, end).await {
                Ok(polled) => {
                    records.extend(polled.records);
                    malformed += polled.malformed;
                }
                Err(e @ ReaderError::DataLossDetected { .. }) => {
                    // The recorded input is gone; plan the batch again from what remains.
                    self.handle_data_loss(partition, e)?;
                    let earliest = self.reader.cursors().get(&partition).copied();
                    self.reader.restore(&plan.start);
                    if let Some(offset) = earliest {
                        self.reader.seek(partition, offset);
                    }
                    let tables = self.tables();
                    let removed = self.sink.remove_published(plan.batch_id, &tables)?;
                    if removed > 0 {
                        info!(
                            stream = %self.stream_id,
                            batch_id = plan.batch_id,
                            files = removed,
                            "Removed output of the earlier attempt before re-planning"
                        );
                    }
                    self.carry_gaps(plan.data_loss);
                    return self.poll_fresh(plan.batch_id).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        for (partition, end) in &plan.end {
            self.reader.seek(*partition, *end);
        }

        Ok(BatchInput {
            plan,
            records,
            malformed,
        })
    }

    /// Accept a detected gap, or turn it into a fatal error under `on_data_loss: fail`
    fn handle_data_loss(&mut self, partition: u32, err: ReaderError) -> Result<(), PipelineError> {
        if self.on_data_loss == DataLossStrategy::Fail {
            return Err(err.into());
        }
        if let Some(gap) = self.reader.acknowledge_data_loss(partition) {
            warn!(
                stream = %self.stream_id,
                partition = gap.partition,
                from = gap.from,
                to = gap.to,
                "Offsets expired before they were read, recording gap"
            );
            self.pending_gaps.push(gap);
        }
        Ok(())
    }

    async fn process(&mut self, input: BatchInput) -> Result<BatchOutcome, PipelineError> {
        let BatchInput {
            plan,
            records,
            malformed,
        } = input;
        let batch_id = plan.batch_id;

        let rollback = Rollback {
            tracker: self.tracker.clone(),
            dedup: self.dedup.clone(),
            aggregator: self.aggregation.as_ref().map(|a| a.windows.clone()),
        };

        // Every decision in this batch uses the watermark as of batch start.
        let watermark = self.tracker.watermark(&self.stream_id);
        let mut stats = BatchStats {
            events_read: records.len() as u64,
            malformed,
            ..Default::default()
        };
        let mut raw = RawRows::default();

        for record in &records {
            let event_time = record.event.event_time();
            match self.dedup.check(&record.event.dedup_key(), event_time, watermark) {
                DedupOutcome::First => {}
                DedupOutcome::Duplicate => {
                    stats.duplicates += 1;
                    continue;
                }
                DedupOutcome::TooLate => {
                    stats.late_dedup += 1;
                    continue;
                }
            }

            self.tracker.observe(&self.stream_id, event_time);
            if let Some(agg) = &mut self.aggregation {
                let key = record.event.field(&agg.group_by).unwrap_or_default();
                if agg.windows.add(key, event_time, watermark) == AddOutcome::Late {
                    stats.late_window += 1;
                }
            }
            raw.push(record);
            stats.events_processed += 1;
        }

        let advanced = self.tracker.watermark(&self.stream_id);
        let evicted = self.dedup.evict(advanced);
        let finalized: Vec<WindowCountRow> = match &mut self.aggregation {
            Some(agg) => agg.windows.advance(advanced).iter().map(WindowCountRow::from).collect(),
            None => Vec::new(),
        };
        stats.windows_finalized = finalized.len() as u64;
        stats.rows_written = raw.len() as u64 + finalized.len() as u64;

        debug!(
            stream = %self.stream_id,
            batch_id = batch_id,
            events = stats.events_read,
            duplicates = stats.duplicates,
            evicted = evicted,
            windows = finalized.len(),
            "Batch processed"
        );

        let outputs = match self.stage_and_publish(batch_id, &raw, &finalized).await {
            Ok(outputs) => outputs,
            Err(e) => {
                error!(stream = %self.stream_id, batch_id = batch_id, error = %e, "Aborting batch");
                if let Err(discard_err) = self.sink.discard(batch_id) {
                    warn!(stream = %self.stream_id, error = %discard_err, "Failed to discard staged output");
                }
                self.tracker = rollback.tracker;
                self.dedup = rollback.dedup;
                if let (Some(agg), Some(windows)) = (&mut self.aggregation, rollback.aggregator) {
                    agg.windows = windows;
                }
                self.reader.restore(&plan.start);
                self.pending_plan = Some(plan);
                self.metrics.record_abort(&e.to_string());
                return Ok(BatchOutcome::Aborted { batch_id });
            }
        };

        let record = CheckpointRecord {
            version: CURRENT_VERSION,
            stream_id: self.stream_id.clone(),
            batch_id,
            offsets: plan.end.clone(),
            watermark: self.tracker.snapshot(),
            dedup: self.dedup.snapshot(),
            windows: self
                .aggregation
                .as_ref()
                .map(|a| a.windows.snapshot())
                .unwrap_or_else(WindowSnapshot::default),
            data_loss: plan.data_loss.clone(),
            stats: stats.clone(),
            outputs,
            config_fingerprint: self.fingerprint.clone(),
            committed_at: Utc::now(),
        };

        // A failed checkpoint write is fatal for this loop.
        self.checkpoints.commit(&record).await?;
        self.metrics.record_commit(batch_id, &stats, advanced);
        for _ in &record.data_loss {
            self.metrics.record_data_loss();
        }

        info!(
            stream = %self.stream_id,
            batch_id = batch_id,
            events = stats.events_processed,
            duplicates = stats.duplicates,
            late = stats.late_dedup + stats.late_window,
            rows = stats.rows_written,
            "Batch committed"
        );

        Ok(BatchOutcome::Committed { batch_id, stats })
    }

    async fn stage_and_publish(
        &mut self,
        batch_id: u64,
        raw: &RawRows,
        finalized: &[WindowCountRow],
    ) -> Result<Vec<crate::sink::PublishedFile>, SinkError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.stage(batch_id, raw, finalized).await {
                Ok(()) => break,
                Err(e) if attempt < self.stage_backoff.max_attempts => {
                    let delay = self.stage_backoff.delay_for(attempt);
                    warn!(
                        stream = %self.stream_id,
                        batch_id = batch_id,
                        attempt = attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Staging failed, retrying"
                    );
                    self.sink.discard(batch_id)?;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.sink.commit(batch_id).await
    }

    async fn stage(
        &mut self,
        batch_id: u64,
        raw: &RawRows,
        finalized: &[WindowCountRow],
    ) -> Result<(), SinkError> {
        let table = self.config.table.clone();
        if !raw.clicks.is_empty() {
            self.sink.stage(batch_id, &table, raw.clicks.clone()).await?;
        }
        if !raw.telemetry.is_empty() {
            self.sink.stage(batch_id, &table, raw.telemetry.clone()).await?;
        }
        if let Some(agg) = &self.aggregation {
            if !finalized.is_empty() {
                let agg_table = agg.table.clone();
                self.sink.stage(batch_id, &agg_table, finalized.to_vec()).await?;
            }
        }
        Ok(())
    }
}

/// Metrics handles of every stream, keyed by stream id
pub type MetricsRegistry = BTreeMap<String, Arc<StreamMetrics>>;

/// Build one runner per configured stream
pub fn build_runners(
    config: &Config,
    log: Arc<dyn PartitionedLog>,
    store: Arc<dyn CheckpointStore>,
) -> Result<Vec<StreamRunner>, PipelineError> {
    config
        .streams
        .keys()
        .map(|stream_id| StreamRunner::new(config, stream_id, log.clone(), store.clone()))
        .collect()
}

/// Run every stream as its own task until `shutdown` is cancelled.
///
/// A stream whose loop fails stops on its own; the others keep running.
/// Returns the first failure once all streams have stopped.
pub async fn run_streams(
    runners: Vec<StreamRunner>,
    shutdown: CancellationToken,
) -> Result<(), PipelineError> {
    let mut handles = Vec::with_capacity(runners.len());
    for runner in runners {
        let stream_id = runner.stream_id().to_string();
        let token = shutdown.clone();
        handles.push((stream_id, tokio::spawn(runner.run(token))));
    }

    let mut first_error = None;
    for (stream_id, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::Task {
                stream: stream_id.clone(),
                reason: e.to_string(),
            }),
        };
        match result {
            Ok(()) => info!(stream = %stream_id, "Stream task completed"),
            Err(e) => {
                error!(stream = %stream_id, error = %e, "Stream task failed");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
