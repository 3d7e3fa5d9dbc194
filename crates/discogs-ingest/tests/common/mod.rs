//! Shared fixtures for the ingestion integration tests
//!
//! Dumps are written as real gzip files into a temporary artifact tree so
//! the tests exercise the same decoder, layout and store paths as production.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use discogs_ingest::classifier::ExistingHashIndex;
use discogs_ingest::config::IngestConfig;
use discogs_ingest::error::StoreError;
use discogs_ingest::layout::ArtifactLayout;
use discogs_ingest::models::{CatalogRecord, FileType, PeriodKey};
use discogs_ingest::progress::{ProgressEvent, ProgressPublisher};
use discogs_ingest::service::IngestService;
use discogs_ingest::state::{MemoryPeriodRepository, StateTracker};
use discogs_ingest::store::{CatalogStore, MemoryCatalogStore};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub fn period(key: &str) -> PeriodKey {
    key.parse().unwrap()
}

/// Write `<root>body</root>` gzip-compressed to `path`
pub fn write_gz(path: &Path, root: &str, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = std::fs::File::create(path).unwrap();
    let mut gz = GzEncoder::new(file, Compression::fast());
    write!(gz, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<{root}>{body}</{root}>").unwrap();
    gz.finish().unwrap();
}

/// Write a dump into the artifact layout
pub fn write_dump(layout: &ArtifactLayout, key: PeriodKey, file_type: FileType, body: &str) {
    write_gz(&layout.file_path(key, file_type), file_type.root_element(), body);
}

pub fn artist_xml(id: u64, profile: &str) -> String {
    format!(
        "<artist><id>{id}</id><name>Artist {id}</name><profile>{profile}</profile>\
         <namevariations><name>A{id}</name></namevariations></artist>"
    )
}

pub fn artists_xml(ids: std::ops::RangeInclusive<u64>) -> String {
    ids.map(|id| artist_xml(id, "profile")).collect()
}

pub fn label_xml(id: u64) -> String {
    format!("<label><id>{id}</id><name>Label {id}</name><profile>Label profile</profile></label>")
}

pub fn master_xml(id: u64, artist_id: u64) -> String {
    format!(
        "<master id=\"{id}\"><main_release>{id}00</main_release>\
         <artists><artist><id>{artist_id}</id><name>Artist {artist_id}</name></artist></artists>\
         <genres><genre>Electronic</genre></genres><year>1999</year><title>Master {id}</title></master>"
    )
}

pub fn release_xml(id: u64, artist_id: u64, label_id: u64, master_id: u64) -> String {
    format!(
        "<release id=\"{id}\" status=\"Accepted\">\
         <artists><artist><id>{artist_id}</id><name>Artist {artist_id}</name></artist></artists>\
         <title>Release {id}</title>\
         <labels><label catno=\"CAT{id}\" id=\"{label_id}\" name=\"Label {label_id}\"/></labels>\
         <country>UK</country><master_id is_main_release=\"true\">{master_id}</master_id>\
         <tracklist><track><position>A1</position><title>Intro</title><duration>3:01</duration></track>\
         <track><position>A2</position><title>Outro</title></track></tracklist></release>"
    )
}

/// Progress publisher that keeps every event
#[derive(Default)]
pub struct CollectingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressPublisher for CollectingProgress {
    fn publish(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Store wrapper that can reject chosen batches or lose its connection
pub struct FlakyStore {
    pub inner: MemoryCatalogStore,
    batches: AtomicU64,
    /// 1-based batch number to reject
    fail_batch: Option<u64>,
    pub unavailable: AtomicBool,
}

impl FlakyStore {
    pub fn new(fail_batch: Option<u64>) -> Self {
        Self {
            inner: MemoryCatalogStore::new(),
            batches: AtomicU64::new(0),
            fail_batch,
            unavailable: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl CatalogStore for FlakyStore {
    async fn load_hashes(&self, file_type: FileType) -> Result<ExistingHashIndex, StoreError> {
        self.inner.load_hashes(file_type).await
    }

    async fn upsert_batch(&self, file_type: FileType, records: &[CatalogRecord]) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        let n = self.batches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_batch == Some(n) {
            return Err(StoreError::Batch("duplicate key value violates constraint".to_string()));
        }
        self.inner.upsert_batch(file_type, records).await
    }

    async fn count(&self, file_type: FileType) -> Result<u64, StoreError> {
        self.inner.count(file_type).await
    }
}

/// A service over memory backends rooted in a temporary directory
pub struct Harness {
    pub tmp: TempDir,
    pub service: IngestService,
    pub tracker: StateTracker,
    pub progress: Arc<CollectingProgress>,
    pub layout: ArtifactLayout,
}

impl Harness {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self::with_config(store, |_| {})
    }

    pub fn with_config(store: Arc<dyn CatalogStore>, adjust: impl FnOnce(&mut IngestConfig)) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = IngestConfig {
            data_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        adjust(&mut config);

        let tracker = StateTracker::new(Arc::new(MemoryPeriodRepository::new()));
        let progress = Arc::new(CollectingProgress::default());
        let service = IngestService::new(config, tracker.clone(), store, progress.clone()).unwrap();
        let layout = ArtifactLayout::new(tmp.path());

        Self {
            tmp,
            service,
            tracker,
            progress,
            layout,
        }
    }
}
