//! Batch writer
//!
//! [`RecordBatcher`] groups decoded records into batches of at most
//! `max_batch_size` and stops accepting once `max_records` is reached.
//! [`BatchWriter`] applies one classified batch to the store inside a single
//! transaction with a timeout. A rejected or timed-out batch is reported in
//! its [`BatchReport`]; only a lost store connection is returned as an error.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::classifier::Classification;
use crate::config::Limits;
use crate::error::{IngestError, Result, StoreError};
use crate::models::{CatalogRecord, FileType};
use crate::store::CatalogStore;

/// Groups records into write batches while enforcing the record limit
#[derive(Debug)]
pub struct RecordBatcher {
    max_batch_size: usize,
    max_records: Option<u64>,
    current: Vec<CatalogRecord>,
    accepted: u64,
    overflow: u64,
}

impl RecordBatcher {
    pub fn new(limits: Limits) -> Self {
        Self {
            max_batch_size: limits.max_batch_size.max(1),
            max_records: limits.max_records,
            current: Vec::with_capacity(limits.max_batch_size.clamp(1, 1024)),
            accepted: 0,
            overflow: 0,
        }
    }

    /// Add a record, returning a full batch when one is ready
    ///
    /// Records offered after the limit is reached are counted as overflow and
    /// dropped.
    pub fn push(&mut self, record: CatalogRecord) -> Option<Vec<CatalogRecord>> {
        if self.is_exhausted() {
            self.overflow += 1;
            return None;
        }
        self.accepted += 1;
        self.current.push(record);
        if self.current.len() >= self.max_batch_size {
            return Some(self.take());
        }
        None
    }

    /// Remaining partial batch, if any
    pub fn finish(&mut self) -> Option<Vec<CatalogRecord>> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    /// No further records will be accepted
    pub fn is_exhausted(&self) -> bool {
        self.max_records.is_some_and(|max| self.accepted >= max)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Records refused because of the record limit
    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    fn take(&mut self) -> Vec<CatalogRecord> {
        std::mem::replace(
            &mut self.current,
            Vec::with_capacity(self.max_batch_size.min(1024)),
        )
    }
}

/// Outcome of one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    /// Records of a rolled-back batch
    pub failed: u64,
    pub error: Option<String>,
}

impl BatchReport {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the batch reached the store at all
    pub fn committed(&self) -> bool {
        !self.is_failed() && self.inserted + self.updated > 0
    }
}

/// Applies classified batches to a [`CatalogStore`]
#[derive(Clone)]
pub struct BatchWriter {
    store: Arc<dyn CatalogStore>,
    timeout: Duration,
    dry_run: bool,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn CatalogStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            dry_run: false,
        }
    }

    /// Classify and count without writing anything
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Write the insert and update sets of a batch in one transaction
    ///
    /// The skip set needs no I/O. A batch rejected by the store or exceeding
    /// the timeout is rolled back and reported as failed; the caller carries
    /// on with the next batch. `StoreUnavailable` is returned when the store
    /// connection is gone.
    pub async fn write(
        &self,
        file_type: FileType,
        batch: Classification<CatalogRecord>,
    ) -> Result<BatchReport> {
        let Classification {
            insert,
            update,
            skip,
        } = batch;

        let mut report = BatchReport {
            skipped: skip.len() as u64,
            ..Default::default()
        };
        let (inserted, updated) = (insert.len() as u64, update.len() as u64);
        if inserted + updated == 0 {
            return Ok(report);
        }

        if self.dry_run {
            report.inserted = inserted;
            report.updated = updated;
            return Ok(report);
        }

        let mut records = insert;
        records.extend(update);

        let outcome = tokio::time::timeout(self.timeout, self.store.upsert_batch(file_type, &records))
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Batch(format!(
                    "timed out after {}s",
                    self.timeout.as_secs_f64()
                )))
            });

        match outcome {
            Ok(()) => {
                debug!(
                    file_type = %file_type,
                    inserted,
                    updated,
                    skipped = report.skipped,
                    "Committed batch"
                );
                report.inserted = inserted;
                report.updated = updated;
                Ok(report)
            },
            Err(StoreError::Unavailable(msg)) => Err(IngestError::StoreUnavailable(msg)),
            Err(StoreError::Batch(msg)) => {
                let first = records.first().map(|r| r.id()).unwrap_or_default();
                let last = records.last().map(|r| r.id()).unwrap_or_default();
                warn!(
                    file_type = %file_type,
                    records = records.len(),
                    first_id = %first,
                    last_id = %last,
                    error = %msg,
                    "Batch rolled back"
                );
                report.failed = inserted + updated;
                report.error = Some(format!(
                    "{} batch of {} records (ids {}..{}) rolled back: {}",
                    file_type,
                    records.len(),
                    first,
                    last,
                    msg
                ));
                Ok(report)
            },
        }
    }
}
