//! Processing period lifecycle model
//!
//! A period is one calendar month of dump data. All lifecycle rules live on
//! [`ProcessingPeriod`] so every repository backend enforces the same guards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::records::FileType;
use crate::error::{IngestError, Result};

/// Year-month key of a dump period, formatted `YYYY-MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodKey {
    year: u16,
    month: u8,
}

impl PeriodKey {
    pub fn new(year: u16, month: u8) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(IngestError::InvalidPeriod(format!(
                "month {} out of range in {}-{:02}",
                month, year, month
            )));
        }
        if !(2000..=9999).contains(&year) {
            return Err(IngestError::InvalidPeriod(format!("year {} out of range", year)));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    /// `YYYYMM`, as used in dump file names
    pub fn compact(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for PeriodKey {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || IngestError::InvalidPeriod(format!("expected YYYY-MM, got '{}'", s));
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse::<u16>().map_err(|_| invalid())?;
        let month = month.parse::<u8>().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PeriodKey> for String {
    fn from(key: PeriodKey) -> Self {
        key.to_string()
    }
}

/// Lifecycle status of a period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeriodStatus {
    #[default]
    NotStarted,
    Downloading,
    ReadyForProcessing,
    Processing,
    Completed,
    Failed,
}

impl PeriodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodStatus::NotStarted => "not_started",
            PeriodStatus::Downloading => "downloading",
            PeriodStatus::ReadyForProcessing => "ready_for_processing",
            PeriodStatus::Processing => "processing",
            PeriodStatus::Completed => "completed",
            PeriodStatus::Failed => "failed",
        }
    }

    /// A run currently owns the period
    pub fn is_active(&self) -> bool {
        matches!(self, PeriodStatus::Downloading | PeriodStatus::Processing)
    }

    /// States from which a reprocess may be requested
    pub fn allows_reprocess(&self) -> bool {
        matches!(
            self,
            PeriodStatus::ReadyForProcessing
                | PeriodStatus::Processing
                | PeriodStatus::Completed
                | PeriodStatus::Failed
        )
    }
}

impl fmt::Display for PeriodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not_started" => Ok(PeriodStatus::NotStarted),
            "downloading" => Ok(PeriodStatus::Downloading),
            "ready_for_processing" => Ok(PeriodStatus::ReadyForProcessing),
            "processing" => Ok(PeriodStatus::Processing),
            "completed" => Ok(PeriodStatus::Completed),
            "failed" => Ok(PeriodStatus::Failed),
            other => Err(IngestError::InvalidConfig(format!("unknown period status '{}'", other))),
        }
    }
}

/// Record counters shared by steps, runs and summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Counters {
    /// Records pulled from the dump, including malformed ones
    pub records_seen: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    /// Malformed records plus records in failed batches
    pub errored: u64,
    /// Records left behind by a record limit or cancellation
    pub unprocessed: u64,
}

impl Counters {
    pub fn merge(&mut self, other: &Counters) {
        self.records_seen += other.records_seen;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errored += other.errored;
        self.unprocessed += other.unprocessed;
    }
}

/// Outcome state of one file type within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    Running,
    Done,
    Errored,
    Cancelled,
}

/// Per-file-type progress and outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub file_type: FileType,
    pub state: StepState,
    #[serde(flatten)]
    pub counters: Counters,
    pub malformed: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    /// A prerequisite file type failed earlier in the same run
    pub at_risk: bool,
    pub errors: Vec<String>,
    /// Errors beyond the sample cap
    pub errors_dropped: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepStatus {
    pub fn new(file_type: FileType) -> Self {
        Self {
            file_type,
            state: StepState::Pending,
            counters: Counters::default(),
            malformed: 0,
            batches_committed: 0,
            batches_failed: 0,
            at_risk: false,
            errors: Vec::new(),
            errors_dropped: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Keep at most `cap` human-readable errors
    pub fn push_error(&mut self, message: impl Into<String>, cap: usize) {
        if self.errors.len() < cap {
            self.errors.push(message.into());
        } else {
            self.errors_dropped += 1;
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, StepState::Errored | StepState::Cancelled)
    }
}

/// Statistics of the latest processing run of a period
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingStats {
    pub run_id: Option<Uuid>,
    pub steps: BTreeMap<FileType, StepStatus>,
    pub totals: Counters,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
}

impl ProcessingStats {
    pub fn new(run_id: Uuid, file_types: &[FileType]) -> Self {
        Self {
            run_id: Some(run_id),
            steps: file_types.iter().map(|ft| (*ft, StepStatus::new(*ft))).collect(),
            totals: Counters::default(),
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_secs: 0.0,
        }
    }

    /// Replace a step and recompute the totals
    pub fn record_step(&mut self, step: StepStatus) {
        self.steps.insert(step.file_type, step);
        self.totals = Counters::default();
        for step in self.steps.values() {
            self.totals.merge(&step.counters);
        }
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
        if let (Some(start), Some(end)) = (self.started_at, self.completed_at) {
            self.duration_secs = (end - start).num_milliseconds() as f64 / 1000.0;
        }
    }
}

/// Persistent lifecycle record of one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingPeriod {
    pub key: PeriodKey,
    pub status: PeriodStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub download_completed_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub file_checksums: BTreeMap<FileType, String>,
    pub processing_stats: ProcessingStats,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingPeriod {
    pub fn new(key: PeriodKey) -> Self {
        Self {
            key,
            status: PeriodStatus::NotStarted,
            started_at: None,
            download_completed_at: None,
            processing_completed_at: None,
            retry_count: 0,
            error_message: None,
            file_checksums: BTreeMap::new(),
            processing_stats: ProcessingStats::default(),
            updated_at: Utc::now(),
        }
    }

    fn conflict(&self, action: &str) -> IngestError {
        IngestError::state_conflict(
            self.key,
            format!("cannot {} while period is {}", action, self.status),
        )
    }

    /// NotStarted/ReadyForProcessing/Completed/Failed -> Downloading
    pub fn start_download(&mut self) -> Result<()> {
        if self.status.is_active() {
            return Err(self.conflict("start a download"));
        }
        let now = Utc::now();
        self.status = PeriodStatus::Downloading;
        self.started_at = Some(now);
        self.download_completed_at = None;
        self.error_message = None;
        self.file_checksums.clear();
        self.updated_at = now;
        Ok(())
    }

    /// Downloading -> ReadyForProcessing
    pub fn complete_download(&mut self, checksums: BTreeMap<FileType, String>) -> Result<()> {
        if self.status != PeriodStatus::Downloading {
            return Err(self.conflict("complete a download"));
        }
        let now = Utc::now();
        self.status = PeriodStatus::ReadyForProcessing;
        self.download_completed_at = Some(now);
        self.file_checksums = checksums;
        self.updated_at = now;
        Ok(())
    }

    /// NotStarted -> ReadyForProcessing for artifacts placed on disk by hand
    pub fn register_artifacts(&mut self, checksums: BTreeMap<FileType, String>) -> Result<()> {
        if self.status != PeriodStatus::NotStarted {
            return Err(self.conflict("register local artifacts"));
        }
        let now = Utc::now();
        self.status = PeriodStatus::ReadyForProcessing;
        self.download_completed_at = Some(now);
        self.file_checksums = checksums;
        self.updated_at = now;
        Ok(())
    }

    /// ReadyForProcessing/Completed/Failed -> Processing
    ///
    /// `Processing` is only accepted as a source when `allow_abandoned` is set,
    /// i.e. the caller has established that no live job owns the period.
    pub fn start_processing(
        &mut self,
        run_id: Uuid,
        file_types: &[FileType],
        allow_abandoned: bool,
    ) -> Result<()> {
        let allowed = match self.status {
            PeriodStatus::Processing => allow_abandoned,
            status => status.allows_reprocess(),
        };
        if !allowed {
            return Err(self.conflict("start processing"));
        }
        let now = Utc::now();
        self.status = PeriodStatus::Processing;
        self.processing_completed_at = None;
        self.error_message = None;
        self.processing_stats = ProcessingStats::new(run_id, file_types);
        self.updated_at = now;
        Ok(())
    }

    /// Store the progress of one step of the current run
    pub fn record_step(&mut self, run_id: Uuid, step: StepStatus) -> Result<()> {
        self.ensure_run(run_id, "record step progress")?;
        self.processing_stats.record_step(step);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Processing -> Completed
    pub fn complete_processing(&mut self, run_id: Uuid, stats: ProcessingStats) -> Result<()> {
        self.ensure_run(run_id, "complete processing")?;
        let now = Utc::now();
        self.status = PeriodStatus::Completed;
        self.processing_completed_at = Some(now);
        self.processing_stats = stats;
        self.updated_at = now;
        Ok(())
    }

    /// Downloading/Processing -> Failed, incrementing the retry count
    pub fn fail(&mut self, reason: impl Into<String>, stats: Option<ProcessingStats>) -> Result<()> {
        if !self.status.is_active() {
            return Err(self.conflict("mark as failed"));
        }
        self.status = PeriodStatus::Failed;
        self.retry_count += 1;
        self.error_message = Some(reason.into());
        if let Some(stats) = stats {
            self.processing_stats = stats;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Any non-active state -> NotStarted with all derived fields cleared
    pub fn reset(&mut self) -> Result<()> {
        if self.status.is_active() {
            return Err(self.conflict("reset"));
        }
        self.clear();
        Ok(())
    }

    /// Downloading/Processing -> NotStarted with all derived fields cleared
    pub fn reset_stuck(&mut self) -> Result<()> {
        if !self.status.is_active() {
            return Err(self.conflict("reset a stuck run"));
        }
        self.clear();
        Ok(())
    }

    fn ensure_run(&self, run_id: Uuid, action: &str) -> Result<()> {
        if self.status != PeriodStatus::Processing {
            return Err(self.conflict(action));
        }
        if self.processing_stats.run_id != Some(run_id) {
            return Err(IngestError::state_conflict(
                self.key,
                format!("run {} no longer owns the period", run_id),
            ));
        }
        Ok(())
    }

    fn clear(&mut self) {
        let key = self.key;
        *self = ProcessingPeriod::new(key);
    }
}
