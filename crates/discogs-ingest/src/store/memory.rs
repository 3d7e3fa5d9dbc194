//! In-memory catalog store for dry runs and tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{check_batch, record_hash, CatalogStore};
use crate::classifier::ExistingHashIndex;
use crate::error::StoreError;
use crate::hash::ContentHashed;
use crate::models::{CatalogRecord, FileType, NaturalKey};

#[derive(Debug, Clone)]
struct StoredRecord {
    hash: String,
    record: CatalogRecord,
}

type Tables = HashMap<FileType, BTreeMap<NaturalKey, StoredRecord>>;

/// Catalog store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    tables: Mutex<Tables>,
    batches: AtomicU64,
    rows_written: AtomicU64,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Stored record and its hash
    pub fn get(&self, file_type: FileType, key: &NaturalKey) -> Option<(CatalogRecord, String)> {
        let tables = self.tables().ok()?;
        tables
            .get(&file_type)
            .and_then(|t| t.get(key))
            .map(|s| (s.record.clone(), s.hash.clone()))
    }

    /// Committed batches so far
    pub fn batches_committed(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Rows written across all committed batches
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn load_hashes(&self, file_type: FileType) -> Result<ExistingHashIndex, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .get(&file_type)
            .map(|t| t.iter().map(|(k, s)| (k.clone(), s.hash.clone())).collect())
            .unwrap_or_default())
    }

    async fn upsert_batch(
        &self,
        file_type: FileType,
        records: &[CatalogRecord],
    ) -> Result<(), StoreError> {
        check_batch(file_type, records)?;

        let mut tables = self.tables()?;
        let table = tables.entry(file_type).or_default();
        for record in records {
            table.insert(
                record.natural_key(),
                StoredRecord {
                    hash: record_hash(record),
                    record: record.clone(),
                },
            );
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows_written
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn count(&self, file_type: FileType) -> Result<u64, StoreError> {
        let tables = self.tables()?;
        Ok(tables.get(&file_type).map(|t| t.len() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::hash::compute_hash;
    use crate::models::{Artist, Label};

    fn artist(id: i64, name: &str) -> CatalogRecord {
        CatalogRecord::Artist(Artist {
            id,
            name: name.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_upsert_and_load_hashes() {
        let store = MemoryCatalogStore::new();
        store
            .upsert_batch(FileType::Artists, &[artist(1, "A"), artist(2, "B")])
            .await
            .unwrap();
        store
            .upsert_batch(FileType::Artists, &[artist(2, "B2")])
            .await
            .unwrap();

        let hashes = store.load_hashes(FileType::Artists).await.unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[&NaturalKey::Id(2)], compute_hash(&artist(2, "B2")));
        assert_eq!(store.count(FileType::Artists).await.unwrap(), 2);
        assert_eq!(store.count(FileType::Labels).await.unwrap(), 0);
        assert_eq!(store.batches_committed(), 2);
        assert_eq!(store.rows_written(), 3);
    }

    #[tokio::test]
    async fn test_mixed_batch_rejected_atomically() {
        let store = MemoryCatalogStore::new();
        let label = CatalogRecord::Label(Label {
            id: 9,
            name: "L".to_string(),
            ..Default::default()
        });
        let err = store
            .upsert_batch(FileType::Artists, &[artist(1, "A"), label])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Batch(_)));
        assert_eq!(store.count(FileType::Artists).await.unwrap(), 0);
    }
}
