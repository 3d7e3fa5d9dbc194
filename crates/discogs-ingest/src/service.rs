//! Trigger surface
//!
//! [`IngestService`] is what schedulers, admin actions and the CLI call. Every
//! trigger validates its input and the period state before any I/O and
//! returns a [`RunSummary`]; rejected triggers return an error instead of
//! being queued.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{IngestConfig, Limits};
use crate::download::DumpDownloader;
use crate::error::{IngestError, Result};
use crate::jobs::{JobInfo, JobKind, JobRegistry, JobTicket};
use crate::layout::ArtifactLayout;
use crate::models::{
    Counters, FileType, PeriodKey, PeriodStatus, ProcessingPeriod, StepStatus,
};
use crate::orchestrator::{Orchestrator, RunOutcome, RunPlan};
use crate::progress::ProgressPublisher;
use crate::state::{PgPeriodRepository, StateTracker};
use crate::store::{connect_pool, CatalogStore, PgCatalogStore};
use crate::writer::BatchWriter;
use discogs_common::checksum::{compute_file_checksum, ChecksumAlgorithm};

/// Structured result of every trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub success: bool,
    pub message: String,
    pub period_key: Option<PeriodKey>,
    /// Background job started by the trigger
    pub job_id: Option<Uuid>,
    pub file_results: Vec<StepStatus>,
    pub totals: Counters,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl RunSummary {
    fn ok(period_key: PeriodKey, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            period_key: Some(period_key),
            job_id: None,
            file_results: Vec::new(),
            totals: Counters::default(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn started(ticket: &JobTicket, message: impl Into<String>) -> Self {
        Self {
            job_id: Some(ticket.id()),
            ..Self::ok(ticket.period_key(), message)
        }
    }

    fn from_outcome(period_key: PeriodKey, outcome: &RunOutcome, dry_run: bool) -> Self {
        let file_results: Vec<StepStatus> = outcome.stats.steps.values().cloned().collect();
        let mut errors: Vec<String> = file_results.iter().flat_map(|s| s.errors.clone()).collect();
        if let Some(fatal) = &outcome.fatal {
            errors.push(fatal.to_string());
        }

        let totals = outcome.stats.totals;
        let verb = if dry_run { "parsed" } else { "processed" };
        let message = match outcome.failure_reason() {
            None => format!(
                "{} {} file types: {} inserted, {} updated, {} skipped, {} errored, {} unprocessed",
                verb,
                file_results.len(),
                totals.inserted,
                totals.updated,
                totals.skipped,
                totals.errored,
                totals.unprocessed
            ),
            Some(reason) => format!("run failed: {}", reason),
        };

        Self {
            success: outcome.is_success(),
            message,
            period_key: Some(period_key),
            job_id: None,
            file_results,
            totals,
            warnings: outcome.warnings.clone(),
            errors,
        }
    }
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub period: ProcessingPeriod,
    /// Job currently holding the period in this process
    pub active_job: Option<JobInfo>,
    /// Finished dump files present on disk
    pub available_files: Vec<FileType>,
}

/// Ingestion service: state tracker, store, artifacts and running jobs
#[derive(Clone)]
pub struct IngestService {
    config: IngestConfig,
    tracker: StateTracker,
    store: Arc<dyn CatalogStore>,
    layout: ArtifactLayout,
    downloader: DumpDownloader,
    jobs: JobRegistry,
    progress: Arc<dyn ProgressPublisher>,
}

impl IngestService {
    pub fn new(
        config: IngestConfig,
        tracker: StateTracker,
        store: Arc<dyn CatalogStore>,
        progress: Arc<dyn ProgressPublisher>,
    ) -> Result<Self> {
        config.validate()?;
        let downloader = DumpDownloader::new(&config)?;
        Ok(Self {
            layout: ArtifactLayout::new(&config.data_dir),
            config,
            tracker,
            store,
            downloader,
            jobs: JobRegistry::new(),
            progress,
        })
    }

    /// Service over Postgres-backed state and catalog
    pub async fn connect(config: IngestConfig, progress: Arc<dyn ProgressPublisher>) -> Result<Self> {
        let pool = connect_pool(&config.database).await?;
        let tracker = StateTracker::new(Arc::new(PgPeriodRepository::new(pool.clone())));
        let store = Arc::new(PgCatalogStore::new(pool));
        Self::new(config, tracker, store, progress)
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    fn orchestrator(&self, dry_run: bool) -> Orchestrator {
        let writer = BatchWriter::new(self.store.clone(), self.config.batch_timeout()).dry_run(dry_run);
        Orchestrator::new(
            self.store.clone(),
            writer,
            self.layout.clone(),
            self.progress.clone(),
            self.config.max_error_samples,
        )
        .count_unprocessed(self.config.count_unprocessed)
    }

    /// Start downloading a period in the background
    ///
    /// Rejected while the period is downloading or processing.
    pub async fn trigger_download(&self, key: PeriodKey, file_types: &[FileType]) -> Result<RunSummary> {
        let file_types = FileType::ordered(file_types)?;
        let ticket = self.jobs.reserve(key, JobKind::Download)?;
        self.tracker.start_download(key).await?;

        let summary = RunSummary::started(&ticket, format!("download of {} started", key));
        let (job_id, service) = (ticket.id(), self.clone());
        let handle = tokio::spawn(async move {
            service.run_download(ticket, file_types).await;
        });
        self.jobs.attach(key, job_id, handle);
        Ok(summary)
    }

    async fn run_download(&self, ticket: JobTicket, file_types: Vec<FileType>) {
        let key = ticket.period_key();
        let token = ticket.token();
        let result = self
            .downloader
            .download(key, &file_types, &token, self.progress.as_ref())
            .await;

        let recorded = match result {
            Ok(checksums) => self.tracker.complete_download(key, checksums).await.map(|_| ()),
            Err(e) => {
                let reason = if token.is_cancelled() {
                    "cancelled".to_string()
                } else {
                    e.to_string()
                };
                error!(period = %key, error = %e, "Download failed");
                self.tracker.fail(key, reason, None).await.map(|_| ())
            },
        };
        if let Err(e) = recorded {
            error!(period = %key, error = %e, "Could not record download outcome");
        }
    }

    /// Start reprocessing already-downloaded files in the background
    ///
    /// Allowed from ReadyForProcessing, Completed, Failed, or Processing when
    /// no job in this process owns the period.
    pub async fn trigger_reprocess(
        &self,
        key: PeriodKey,
        file_types: &[FileType],
        limits: Limits,
    ) -> Result<RunSummary> {
        let plan = RunPlan::new(key, file_types, limits)?;
        let ticket = self.jobs.reserve(key, JobKind::Process)?;
        self.tracker
            .start_processing(key, plan.run_id, &plan.file_types, true)
            .await?;

        let summary = RunSummary::started(&ticket, format!("processing of {} started", key));
        let (job_id, service) = (ticket.id(), self.clone());
        let handle = tokio::spawn(async move {
            let summary = service.run_processing(&ticket, &plan).await;
            info!(period = %key, success = summary.success, message = %summary.message, "Background run finished");
        });
        self.jobs.attach(key, job_id, handle);
        Ok(summary)
    }

    /// Process a period inline and return its full summary
    ///
    /// Without a period the newest one with files on disk is used. Files
    /// placed on disk without a download are registered first.
    pub async fn process(
        &self,
        key: Option<PeriodKey>,
        file_types: &[FileType],
        limits: Limits,
    ) -> Result<RunSummary> {
        let key = self.resolve_period(key)?;
        let plan = RunPlan::new(key, file_types, limits)?;
        let ticket = self.jobs.reserve(key, JobKind::Process)?;

        let current = self.tracker.find(key).await?;
        if current.map(|p| p.status).unwrap_or_default() == PeriodStatus::NotStarted {
            let checksums = self.local_checksums(key).await?;
            if checksums.is_empty() {
                return Err(IngestError::NotFound(format!("no dump files on disk for {}", key)));
            }
            self.tracker.register_artifacts(key, checksums).await?;
        }

        self.tracker
            .start_processing(key, plan.run_id, &plan.file_types, true)
            .await?;
        Ok(self.run_processing(&ticket, &plan).await)
    }

    async fn run_processing(&self, ticket: &JobTicket, plan: &RunPlan) -> RunSummary {
        let key = plan.period;
        let outcome = self
            .orchestrator(false)
            .run(plan, &ticket.token(), Some(&self.tracker))
            .await;
        let mut summary = RunSummary::from_outcome(key, &outcome, false);

        let recorded = match outcome.failure_reason() {
            None => self
                .tracker
                .complete_processing(key, plan.run_id, outcome.stats.clone())
                .await
                .map(|_| ()),
            Some(reason) => self
                .tracker
                .fail(key, reason, Some(outcome.stats.clone()))
                .await
                .map(|_| ()),
        };
        if let Err(e) = recorded {
            error!(period = %key, error = %e, "Could not record run outcome");
            summary.success = false;
            summary.errors.push(e.to_string());
        }
        summary
    }

    /// Decode, hash and classify without writing or touching period state
    pub async fn parse(
        &self,
        key: Option<PeriodKey>,
        file_types: &[FileType],
        limits: Limits,
    ) -> Result<RunSummary> {
        let key = self.resolve_period(key)?;
        let plan = RunPlan::new(key, file_types, limits)?;
        let outcome = self
            .orchestrator(true)
            .run(&plan, &CancellationToken::new(), None)
            .await;
        Ok(RunSummary::from_outcome(key, &outcome, true))
    }

    /// Recover a period stuck in Downloading or Processing
    ///
    /// Clears the period and deletes its partial downloads; verified dumps
    /// stay on disk. Refused while a job of this process still holds it.
    pub async fn reset_stuck_download(&self, key: PeriodKey) -> Result<RunSummary> {
        if let Some(job) = self.jobs.get(key) {
            return Err(IngestError::state_conflict(
                key,
                format!("{} job {} is still running; cancel it first", job.kind, job.id),
            ));
        }
        self.tracker.reset_stuck(key).await?;
        let removed = self.layout.remove_partial_files(key)?;
        Ok(RunSummary::ok(
            key,
            format!("period reset; {} partial downloads deleted", removed.len()),
        ))
    }

    /// Return a finished or failed period to NotStarted
    pub async fn reset(&self, key: PeriodKey) -> Result<RunSummary> {
        if self.jobs.is_active(key) {
            return Err(IngestError::state_conflict(key, "a job is still running"));
        }
        self.tracker.reset(key).await?;
        Ok(RunSummary::ok(key, "period reset"))
    }

    /// Ask the job holding a period to stop at its next checkpoint
    pub fn cancel(&self, key: PeriodKey) -> Result<RunSummary> {
        if self.jobs.cancel(key) {
            Ok(RunSummary::ok(key, "cancellation requested"))
        } else {
            Err(IngestError::NotFound(format!("no running job for {}", key)))
        }
    }

    pub async fn get_status(&self, key: PeriodKey) -> Result<StatusReport> {
        let period = self.tracker.get(key).await?;
        Ok(StatusReport {
            period,
            active_job: self.jobs.get(key),
            available_files: self.layout.available_file_types(key),
        })
    }

    pub async fn list_periods(&self) -> Result<Vec<ProcessingPeriod>> {
        self.tracker.list().await
    }

    /// Wait for the background job of a period to finish
    pub async fn wait(&self, key: PeriodKey) -> Result<()> {
        self.jobs.wait(key).await
    }

    /// Cancel and await every running job
    pub async fn shutdown(&self) {
        self.jobs.shutdown().await;
    }

    /// The given period, or the newest one with dump files on disk
    pub fn resolve_period(&self, key: Option<PeriodKey>) -> Result<PeriodKey> {
        if let Some(key) = key {
            return Ok(key);
        }
        self.layout
            .periods()?
            .into_iter()
            .find(|k| !self.layout.available_file_types(*k).is_empty())
            .ok_or_else(|| {
                IngestError::NotFound(format!(
                    "no dump files under {}",
                    self.layout.root().display()
                ))
            })
    }

    async fn local_checksums(&self, key: PeriodKey) -> Result<BTreeMap<FileType, String>> {
        let files: Vec<_> = self
            .layout
            .available_file_types(key)
            .into_iter()
            .map(|ft| (ft, self.layout.file_path(key, ft)))
            .collect();

        let checksums = tokio::task::spawn_blocking(move || {
            files
                .into_iter()
                .map(|(ft, path)| Ok((ft, compute_file_checksum(&path, ChecksumAlgorithm::Sha256)?)))
                .collect::<Result<BTreeMap<_, _>>>()
        })
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e)))??;
        Ok(checksums)
    }
}
