//! Dependency-ordered processing of one period
//!
//! For each requested file type, in the order labels, artists, masters,
//! releases, the orchestrator:
//!
//! 1. loads the stored hash index once,
//! 2. streams the dump through the decoder on a blocking thread,
//! 3. groups records into batches, classifies each batch against the index
//!    and hands it to the [`BatchWriter`].
//!
//! A failing file type does not stop independent ones. Dependents of a failed
//! type still run but are flagged `at_risk` and produce a dependency warning.
//! Only a lost store connection or cancellation ends the run early.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::classifier::{classify, ExistingHashIndex};
use crate::config::Limits;
use crate::decoder::{open_dump, DecodeError, DecodeStats};
use crate::error::{IngestError, Result};
use crate::layout::ArtifactLayout;
use crate::models::{
    CatalogRecord, FileType, PeriodKey, ProcessingStats, StepState, StepStatus,
};
use crate::progress::{ProgressEvent, ProgressPublisher, Stage};
use crate::state::StateTracker;
use crate::store::CatalogStore;
use crate::writer::{BatchWriter, RecordBatcher};
use discogs_common::io::{ByteCounter, GzipSource};

/// Decoded items buffered between the decoder thread and the writer
const DECODE_CHANNEL_CAPACITY: usize = 1024;

/// Validated description of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub period: PeriodKey,
    pub run_id: Uuid,
    /// Deduplicated, in dependency order
    pub file_types: Vec<FileType>,
    pub limits: Limits,
}

impl RunPlan {
    /// Order the file types and validate the limits before any I/O
    pub fn new(period: PeriodKey, file_types: &[FileType], limits: Limits) -> Result<Self> {
        limits.validate()?;
        Ok(Self {
            period,
            run_id: Uuid::new_v4(),
            file_types: FileType::ordered(file_types)?,
            limits,
        })
    }
}

/// Result of a run
#[derive(Debug)]
pub struct RunOutcome {
    pub stats: ProcessingStats,
    /// Dependency warnings for operator attention
    pub warnings: Vec<String>,
    /// Error that ended the run early
    pub fatal: Option<IngestError>,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn failed_file_types(&self) -> Vec<FileType> {
        self.stats
            .steps
            .values()
            .filter(|s| s.is_failed())
            .map(|s| s.file_type)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && !self.cancelled && self.failed_file_types().is_empty()
    }

    /// Reason recorded on the period when the run did not succeed
    pub fn failure_reason(&self) -> Option<String> {
        if self.cancelled {
            return Some("cancelled".to_string());
        }
        if let Some(fatal) = &self.fatal {
            return Some(fatal.to_string());
        }
        let failed = self.failed_file_types();
        if failed.is_empty() {
            return None;
        }
        let names: Vec<_> = failed.iter().map(|ft| ft.as_str()).collect();
        Some(format!("file types failed: {}", names.join(", ")))
    }
}

/// How a single file type ended
enum StepEnd {
    Finished,
    Cancelled,
    Fatal(IngestError),
}

/// Runs the per-file-type pipeline for a period
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn CatalogStore>,
    writer: BatchWriter,
    layout: ArtifactLayout,
    progress: Arc<dyn ProgressPublisher>,
    max_error_samples: usize,
    count_unprocessed: bool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        writer: BatchWriter,
        layout: ArtifactLayout,
        progress: Arc<dyn ProgressPublisher>,
        max_error_samples: usize,
    ) -> Self {
        Self {
            store,
            writer,
            layout,
            progress,
            max_error_samples,
            count_unprocessed: true,
        }
    }

    /// Scan past the record limit to count what was left unprocessed
    pub fn count_unprocessed(mut self, enabled: bool) -> Self {
        self.count_unprocessed = enabled;
        self
    }

    /// Process every file type of the plan
    ///
    /// With a tracker, each step's status is persisted when it starts and
    /// when it ends. Without one (dry runs) nothing outside the store is
    /// touched.
    #[instrument(skip_all, fields(period = %plan.period, run_id = %plan.run_id))]
    pub async fn run(
        &self,
        plan: &RunPlan,
        cancel: &CancellationToken,
        tracker: Option<&StateTracker>,
    ) -> RunOutcome {
        let mut stats = ProcessingStats::new(plan.run_id, &plan.file_types);
        let mut warnings = Vec::new();
        let mut failed: BTreeSet<FileType> = BTreeSet::new();
        let mut fatal = None;
        let mut cancelled = false;

        info!(
            file_types = ?plan.file_types,
            max_records = ?plan.limits.max_records,
            max_batch_size = plan.limits.max_batch_size,
            dry_run = self.writer.is_dry_run(),
            "Starting run"
        );
        for file_type in &plan.file_types {
            self.publish(ProgressEvent::new(plan.period, Some(*file_type), Stage::Pending));
        }

        for &file_type in &plan.file_types {
            let mut step = StepStatus::new(file_type);

            let broken: Vec<_> = file_type
                .dependencies()
                .iter()
                .filter(|d| failed.contains(d))
                .map(|d| d.as_str())
                .collect();
            if !broken.is_empty() {
                let warning = IngestError::Dependency(format!(
                    "{} processed although {} failed in this run; references may be dangling",
                    file_type,
                    broken.join(", ")
                ))
                .to_string();
                warn!(file_type = %file_type, "{}", warning);
                step.at_risk = true;
                warnings.push(warning);
            }

            if cancel.is_cancelled() {
                step.state = StepState::Cancelled;
                cancelled = true;
                stats.record_step(step.clone());
                self.persist_step(tracker, plan, step).await;
                continue;
            }

            step.state = StepState::Running;
            step.started_at = Some(Utc::now());
            if let Err(e) = self.persist_step_checked(tracker, plan, step.clone()).await {
                fatal = Some(e);
                break;
            }

            let end = self.process_file(plan, &mut step, cancel).await;
            step.completed_at = Some(Utc::now());
            match &end {
                StepEnd::Finished if step.state == StepState::Running => {
                    step.state = StepState::Done;
                },
                StepEnd::Finished => {},
                StepEnd::Cancelled => {
                    step.state = StepState::Cancelled;
                    cancelled = true;
                },
                StepEnd::Fatal(_) => step.state = StepState::Errored,
            }
            if step.is_failed() {
                failed.insert(file_type);
            }

            let stage = if step.state == StepState::Done {
                Stage::Done
            } else {
                Stage::Errored
            };
            let mut event = ProgressEvent::new(plan.period, Some(file_type), stage)
                .records(step.counters.records_seen, None)
                .percentage(100.0);
            if let Some(last) = step.errors.last() {
                event = event.error(last.clone());
            }
            self.publish(event);

            info!(
                file_type = %file_type,
                state = ?step.state,
                seen = step.counters.records_seen,
                inserted = step.counters.inserted,
                updated = step.counters.updated,
                skipped = step.counters.skipped,
                errored = step.counters.errored,
                unprocessed = step.counters.unprocessed,
                malformed = step.malformed,
                at_risk = step.at_risk,
                "File type finished"
            );

            stats.record_step(step.clone());
            let persisted = self.persist_step_checked(tracker, plan, step).await;

            if let StepEnd::Fatal(e) = end {
                fatal = Some(e);
                break;
            }
            if let Err(e) = persisted {
                fatal = Some(e);
                break;
            }
        }

        stats.complete();
        let mut event = ProgressEvent::new(plan.period, None, Stage::Aggregated)
            .records(stats.totals.records_seen, Some(stats.totals.records_seen))
            .percentage(100.0);
        if let Some(e) = &fatal {
            event = event.error(e.to_string());
        } else if cancelled {
            event = event.error("cancelled");
        }
        self.publish(event);

        info!(
            inserted = stats.totals.inserted,
            updated = stats.totals.updated,
            skipped = stats.totals.skipped,
            errored = stats.totals.errored,
            unprocessed = stats.totals.unprocessed,
            duration_secs = stats.duration_secs,
            cancelled,
            fatal = fatal.is_some(),
            "Run finished"
        );

        RunOutcome {
            stats,
            warnings,
            fatal,
            cancelled,
        }
    }

    #[instrument(skip_all, fields(file_type = %step.file_type))]
    async fn process_file(
        &self,
        plan: &RunPlan,
        step: &mut StepStatus,
        cancel: &CancellationToken,
    ) -> StepEnd {
        let file_type = step.file_type;
        let cap = self.max_error_samples;

        let path = self.layout.file_path(plan.period, file_type);
        let dump = match open_dump(&path, file_type, plan.limits.max_records) {
            Ok(dump) => dump,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Cannot open dump");
                step.state = StepState::Errored;
                step.push_error(format!("cannot open {}: {}", path.display(), e), cap);
                return StepEnd::Finished;
            },
        };

        self.publish(ProgressEvent::new(plan.period, Some(file_type), Stage::Classifying));
        let existing = match self.store.load_hashes(file_type).await {
            Ok(index) => index,
            Err(e) if e.is_unavailable() => return StepEnd::Fatal(e.into()),
            Err(e) => {
                step.state = StepState::Errored;
                step.push_error(format!("cannot load stored hashes: {}", e), cap);
                return StepEnd::Finished;
            },
        };
        debug!(existing = existing.len(), "Loaded hash baseline");

        let progress = dump.progress.clone();
        let compressed_size = dump.compressed_size;
        let (tx, mut rx) = mpsc::channel(DECODE_CHANNEL_CAPACITY);
        let mut decoder = dump.decoder.count_remainder(self.count_unprocessed);
        let decode_task = tokio::task::spawn_blocking(move || {
            for item in decoder.by_ref() {
                if tx.blocking_send(item).is_err() {
                    break;
                }
            }
            decoder.stats()
        });

        self.publish(ProgressEvent::new(plan.period, Some(file_type), Stage::Parsing));

        let mut batcher = RecordBatcher::new(plan.limits);
        let mut end = StepEnd::Finished;

        while let Some(item) = rx.recv().await {
            step.counters.records_seen += 1;
            match item {
                Ok(record) => {
                    if let Some(batch) = batcher.push(record) {
                        if let Some(stop) = self
                            .flush(plan, step, &existing, batch, cancel, &progress, compressed_size)
                            .await
                        {
                            end = stop;
                            break;
                        }
                    }
                },
                Err(e @ DecodeError::Malformed { .. }) => {
                    step.malformed += 1;
                    step.counters.errored += 1;
                    step.push_error(format!("{}: {}", file_type, e), cap);
                },
                Err(DecodeError::Io(msg)) => {
                    warn!(error = %msg, "Dump read failed");
                    step.state = StepState::Errored;
                    step.push_error(format!("{}: read failed: {}", file_type, msg), cap);
                    break;
                },
            }
        }

        if matches!(end, StepEnd::Finished) {
            if let Some(batch) = batcher.finish() {
                if let Some(stop) = self
                    .flush(plan, step, &existing, batch, cancel, &progress, compressed_size)
                    .await
                {
                    end = stop;
                }
            }
        }

        // Unblocks the decoder thread if we stopped early
        drop(rx);
        let decoded: DecodeStats = match decode_task.await {
            Ok(stats) => stats,
            Err(e) => {
                step.state = StepState::Errored;
                step.push_error(format!("{}: decoder task failed: {}", file_type, e), cap);
                DecodeStats::default()
            },
        };
        step.counters.unprocessed += decoded.unprocessed + batcher.overflow();

        end
    }

    /// Classify and write one batch
    ///
    /// Returns `Some` when the file type must stop.
    #[allow(clippy::too_many_arguments)]
    async fn flush(
        &self,
        plan: &RunPlan,
        step: &mut StepStatus,
        existing: &ExistingHashIndex,
        batch: Vec<CatalogRecord>,
        cancel: &CancellationToken,
        progress: &ByteCounter,
        compressed_size: u64,
    ) -> Option<StepEnd> {
        let file_type = step.file_type;
        if cancel.is_cancelled() {
            info!(pending = batch.len(), "Cancellation observed between batches");
            step.counters.unprocessed += batch.len() as u64;
            return Some(StepEnd::Cancelled);
        }

        let size = batch.len() as u64;
        let classified = classify(batch, existing);
        self.publish(
            ProgressEvent::new(plan.period, Some(file_type), Stage::Writing)
                .records(step.counters.records_seen, None)
                .percentage(GzipSource::percentage(progress, compressed_size)),
        );

        match self.writer.write(file_type, classified).await {
            Ok(report) => {
                step.counters.inserted += report.inserted;
                step.counters.updated += report.updated;
                step.counters.skipped += report.skipped;
                if let Some(error) = report.error {
                    step.counters.errored += report.failed;
                    step.batches_failed += 1;
                    step.state = StepState::Errored;
                    step.push_error(error, self.max_error_samples);
                } else if report.committed() {
                    step.batches_committed += 1;
                }
                None
            },
            Err(e) => {
                error!(error = %e, "Store unavailable; aborting run");
                step.counters.errored += size;
                step.push_error(format!("{}: {}", file_type, e), self.max_error_samples);
                Some(StepEnd::Fatal(e))
            },
        }
    }

    fn publish(&self, event: ProgressEvent) {
        self.progress.publish(event);
    }

    async fn persist_step_checked(
        &self,
        tracker: Option<&StateTracker>,
        plan: &RunPlan,
        step: StepStatus,
    ) -> Result<()> {
        match tracker {
            Some(tracker) => tracker.record_step(plan.period, plan.run_id, step).await,
            None => Ok(()),
        }
    }

    async fn persist_step(&self, tracker: Option<&StateTracker>, plan: &RunPlan, step: StepStatus) {
        if let Err(e) = self.persist_step_checked(tracker, plan, step).await {
            warn!(error = %e, "Could not persist step status");
        }
    }
}
