//! Catalog store abstraction
//!
//! The pipeline only needs two things from the store: the hash baseline of a
//! file type and an all-or-nothing batch upsert keyed by natural key.

mod memory;
mod postgres;

pub use memory::MemoryCatalogStore;
pub use postgres::{connect_pool, run_migrations, PgCatalogStore};

use async_trait::async_trait;

use crate::classifier::ExistingHashIndex;
use crate::error::StoreError;
use crate::hash::{compute_hash, ContentHashed};
use crate::models::{CatalogRecord, FileType};

/// Persistence target for decoded records
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Natural key -> stored content hash for every row of a file type
    async fn load_hashes(&self, file_type: FileType) -> Result<ExistingHashIndex, StoreError>;

    /// Upsert a batch inside one transaction
    ///
    /// Either every record is written or none is.
    async fn upsert_batch(
        &self,
        file_type: FileType,
        records: &[CatalogRecord],
    ) -> Result<(), StoreError>;

    /// Number of stored rows of a file type
    async fn count(&self, file_type: FileType) -> Result<u64, StoreError>;
}

/// Hash carried by a record, or computed if absent
pub(crate) fn record_hash(record: &CatalogRecord) -> String {
    record
        .content_hash()
        .map(str::to_string)
        .unwrap_or_else(|| compute_hash(record))
}

/// Reject records that do not belong to the batch's file type
pub(crate) fn check_batch(file_type: FileType, records: &[CatalogRecord]) -> Result<(), StoreError> {
    match records.iter().find(|r| r.file_type() != file_type) {
        Some(stray) => Err(StoreError::Batch(format!(
            "{} record {} in a {} batch",
            stray.file_type(),
            stray.id(),
            file_type
        ))),
        None => Ok(()),
    }
}
