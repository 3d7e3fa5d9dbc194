use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::PeriodRepository;
use crate::error::{IngestError, Result};
use crate::models::{FileType, PeriodKey, ProcessingPeriod, ProcessingStats, StepStatus};

/// Named lifecycle operations over a [`PeriodRepository`]
#[derive(Clone)]
pub struct StateTracker {
    repo: Arc<dyn PeriodRepository>,
}

impl StateTracker {
    pub fn new(repo: Arc<dyn PeriodRepository>) -> Self {
        Self { repo }
    }

    /// Current state of a period
    pub async fn get(&self, key: PeriodKey) -> Result<ProcessingPeriod> {
        self.repo
            .get(key)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("period {}", key)))
    }

    pub async fn find(&self, key: PeriodKey) -> Result<Option<ProcessingPeriod>> {
        self.repo.get(key).await
    }

    pub async fn list(&self) -> Result<Vec<ProcessingPeriod>> {
        self.repo.list().await
    }

    pub async fn start_download(&self, key: PeriodKey) -> Result<ProcessingPeriod> {
        let period = self
            .repo
            .transition(key, true, Box::new(|p| p.start_download()))
            .await?;
        info!(period = %key, "Download started");
        Ok(period)
    }

    pub async fn complete_download(
        &self,
        key: PeriodKey,
        checksums: BTreeMap<FileType, String>,
    ) -> Result<ProcessingPeriod> {
        let files = checksums.len();
        let period = self
            .repo
            .transition(key, false, Box::new(move |p| p.complete_download(checksums)))
            .await?;
        info!(period = %key, files, "Download completed");
        Ok(period)
    }

    pub async fn register_artifacts(
        &self,
        key: PeriodKey,
        checksums: BTreeMap<FileType, String>,
    ) -> Result<ProcessingPeriod> {
        let files = checksums.len();
        let period = self
            .repo
            .transition(key, true, Box::new(move |p| p.register_artifacts(checksums)))
            .await?;
        info!(period = %key, files, "Registered local artifacts");
        Ok(period)
    }

    pub async fn start_processing(
        &self,
        key: PeriodKey,
        run_id: Uuid,
        file_types: &[FileType],
        allow_abandoned: bool,
    ) -> Result<ProcessingPeriod> {
        let file_types = file_types.to_vec();
        let period = self
            .repo
            .transition(
                key,
                true,
                Box::new(move |p| p.start_processing(run_id, &file_types, allow_abandoned)),
            )
            .await?;
        info!(period = %key, run_id = %run_id, "Processing started");
        Ok(period)
    }

    /// Persist the progress of one file type of the current run
    pub async fn record_step(&self, key: PeriodKey, run_id: Uuid, step: StepStatus) -> Result<()> {
        self.repo
            .transition(key, false, Box::new(move |p| p.record_step(run_id, step)))
            .await?;
        Ok(())
    }

    pub async fn complete_processing(
        &self,
        key: PeriodKey,
        run_id: Uuid,
        stats: ProcessingStats,
    ) -> Result<ProcessingPeriod> {
        let period = self
            .repo
            .transition(key, false, Box::new(move |p| p.complete_processing(run_id, stats)))
            .await?;
        info!(
            period = %key,
            run_id = %run_id,
            inserted = period.processing_stats.totals.inserted,
            updated = period.processing_stats.totals.updated,
            skipped = period.processing_stats.totals.skipped,
            "Processing completed"
        );
        Ok(period)
    }

    /// Move an active period to `Failed`, keeping partial stats
    pub async fn fail(
        &self,
        key: PeriodKey,
        reason: impl Into<String>,
        stats: Option<ProcessingStats>,
    ) -> Result<ProcessingPeriod> {
        let reason = reason.into();
        let logged = reason.clone();
        let period = self
            .repo
            .transition(key, false, Box::new(move |p| p.fail(reason, stats)))
            .await?;
        warn!(
            period = %key,
            retry_count = period.retry_count,
            reason = %logged,
            "Period failed"
        );
        Ok(period)
    }

    /// Completed/Failed (or any idle state) -> NotStarted
    pub async fn reset(&self, key: PeriodKey) -> Result<ProcessingPeriod> {
        let period = self
            .repo
            .transition(key, false, Box::new(|p| p.reset()))
            .await?;
        info!(period = %key, "Period reset");
        Ok(period)
    }

    /// Downloading/Processing -> NotStarted
    pub async fn reset_stuck(&self, key: PeriodKey) -> Result<ProcessingPeriod> {
        let period = self
            .repo
            .transition(key, false, Box::new(|p| p.reset_stuck()))
            .await?;
        warn!(period = %key, "Stuck period reset");
        Ok(period)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::PeriodStatus;
    use crate::state::MemoryPeriodRepository;

    fn tracker() -> StateTracker {
        StateTracker::new(Arc::new(MemoryPeriodRepository::new()))
    }

    #[tokio::test]
    async fn test_duplicate_download_rejected_without_side_effects() {
        let tracker = tracker();
        let key: PeriodKey = "2024-05".parse().unwrap();
        let started = tracker.start_download(key).await.unwrap();

        let err = tracker.start_download(key).await.unwrap_err();
        assert!(matches!(err, IngestError::StateConflict { .. }));
        assert_eq!(tracker.get(key).await.unwrap(), started);
    }

    #[tokio::test]
    async fn test_unknown_period_operations() {
        let tracker = tracker();
        let key: PeriodKey = "2024-06".parse().unwrap();
        assert!(matches!(tracker.get(key).await, Err(IngestError::NotFound(_))));
        assert!(matches!(tracker.reset(key).await, Err(IngestError::NotFound(_))));
        assert!(tracker.find(key).await.unwrap().is_none());

        let err = tracker
            .start_processing(key, Uuid::new_v4(), &FileType::ALL, false)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::StateConflict { .. }));
        assert!(tracker.find(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_processing_failure_keeps_partial_stats() {
        let tracker = tracker();
        let key: PeriodKey = "2024-07".parse().unwrap();
        tracker.register_artifacts(key, BTreeMap::new()).await.unwrap();

        let run = Uuid::new_v4();
        tracker
            .start_processing(key, run, &[FileType::Labels], false)
            .await
            .unwrap();
        let mut step = StepStatus::new(FileType::Labels);
        step.counters.inserted = 7;
        tracker.record_step(key, run, step).await.unwrap();

        let current = tracker.get(key).await.unwrap().processing_stats;
        let period = tracker.fail(key, "cancelled", Some(current)).await.unwrap();
        assert_eq!(period.status, PeriodStatus::Failed);
        assert_eq!(period.retry_count, 1);
        assert_eq!(period.processing_stats.totals.inserted, 7);
    }
}
