//! Downloader tests against a mock dump bucket

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::*;
use discogs_ingest::config::{IngestConfig, Limits};
use discogs_ingest::download::DumpDownloader;
use discogs_ingest::error::IngestError;
use discogs_ingest::layout::ArtifactLayout;
use discogs_ingest::models::{FileType, PeriodStatus};
use discogs_ingest::progress::{NoopProgress, Stage};
use discogs_ingest::store::MemoryCatalogStore;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gz_bytes(root: &str, body: &str) -> Vec<u8> {
    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    write!(gz, "<{root}>{body}</{root}>").unwrap();
    gz.finish().unwrap()
}

fn sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn listing(objects: &[(&str, usize)], truncated: Option<&str>) -> String {
    let contents: String = objects
        .iter()
        .map(|(key, size)| {
            format!(
                "<Contents><Key>{key}</Key><LastModified>2024-01-02T00:00:00.000Z</LastModified>\
                 <Size>{size}</Size><StorageClass>STANDARD</StorageClass></Contents>"
            )
        })
        .collect();
    let (is_truncated, marker) = match truncated {
        Some(marker) => ("true", format!("<NextMarker>{marker}</NextMarker>")),
        None => ("false", String::new()),
    };
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
         <Name>discogs-data-dumps</Name><Prefix>data/2024/</Prefix><MaxKeys>1000</MaxKeys>\
         <IsTruncated>{is_truncated}</IsTruncated>{marker}{contents}</ListBucketResult>"
    )
}

/// Mount a listing with one artists dump and a matching CHECKSUM file
async fn mount_artists_dump(server: &MockServer, checksum_override: Option<&str>) -> Vec<u8> {
    let artists = gz_bytes("artists", &artists_xml(1..=5));
    let digest = checksum_override
        .map(str::to_string)
        .unwrap_or_else(|| sha256(&artists));
    let manifest = format!("{digest}  discogs_20240101_artists.xml.gz\n");

    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("prefix", "data/2024/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(
            &[
                ("data/2024/discogs_20240101_CHECKSUM.txt", manifest.len()),
                ("data/2024/discogs_20240101_artists.xml.gz", artists.len()),
            ],
            None,
        )))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/2024/discogs_20240101_CHECKSUM.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(manifest))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/2024/discogs_20240101_artists.xml.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(artists.clone()))
        .mount(server)
        .await;

    artists
}

fn downloader(server: &MockServer, tmp: &TempDir) -> DumpDownloader {
    DumpDownloader::with_client(
        reqwest::Client::new(),
        &server.uri(),
        ArtifactLayout::new(tmp.path()),
        true,
    )
}

#[tokio::test]
async fn test_download_verifies_and_stores_file() {
    let server = MockServer::start().await;
    let artists = mount_artists_dump(&server, None).await;
    let tmp = TempDir::new().unwrap();
    let downloader = downloader(&server, &tmp);
    let key = period("2024-01");
    let progress = CollectingProgress::default();

    let checksums = downloader
        .download(key, &[FileType::Artists], &CancellationToken::new(), &progress)
        .await
        .unwrap();

    assert_eq!(checksums[&FileType::Artists], sha256(&artists));
    let layout = downloader.layout();
    assert_eq!(std::fs::read(layout.file_path(key, FileType::Artists)).unwrap(), artists);
    assert!(!layout.partial_path(key, FileType::Artists).exists());

    let events = progress.events();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.stage == Stage::Downloading));
    assert_eq!(events.last().unwrap().percentage, 100.0);
}

#[tokio::test]
async fn test_checksum_mismatch_leaves_nothing_behind() {
    let server = MockServer::start().await;
    mount_artists_dump(&server, Some(&"0".repeat(64))).await;
    let tmp = TempDir::new().unwrap();
    let downloader = downloader(&server, &tmp);
    let key = period("2024-01");

    let err = downloader
        .download(key, &[FileType::Artists], &CancellationToken::new(), &NoopProgress)
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::ChecksumMismatch { .. }));
    assert!(!downloader.layout().file_path(key, FileType::Artists).exists());
    assert!(!downloader.layout().partial_path(key, FileType::Artists).exists());
}

#[tokio::test]
async fn test_unpublished_file_type_is_not_found() {
    let server = MockServer::start().await;
    mount_artists_dump(&server, None).await;
    let tmp = TempDir::new().unwrap();
    let downloader = downloader(&server, &tmp);

    let err = downloader
        .download(
            period("2024-01"),
            &[FileType::Artists, FileType::Releases],
            &CancellationToken::new(),
            &NoopProgress,
        )
        .await
        .unwrap_err();

    match err {
        IngestError::NotFound(msg) => assert!(msg.contains("releases")),
        other => panic!("unexpected error {:?}", other),
    }
    // Nothing is fetched before every requested type is known to exist
    assert!(!downloader.layout().file_path(period("2024-01"), FileType::Artists).exists());
}

#[tokio::test]
async fn test_cancelled_download_removes_partial_file() {
    let server = MockServer::start().await;
    mount_artists_dump(&server, None).await;
    let tmp = TempDir::new().unwrap();
    let downloader = downloader(&server, &tmp);
    let key = period("2024-01");
    let token = CancellationToken::new();
    token.cancel();

    let err = downloader
        .download(key, &[FileType::Artists], &token, &NoopProgress)
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Cancelled(_)));
    assert!(!downloader.layout().partial_path(key, FileType::Artists).exists());
    assert!(!downloader.layout().file_path(key, FileType::Artists).exists());
}

#[tokio::test]
async fn test_discover_follows_pages_and_prefers_latest_dump() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("marker", "data/2024/discogs_20240101_labels.xml.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(
            &[
                ("data/2024/discogs_20240115_artists.xml.gz", 10),
                ("data/2024/discogs_20240115_labels.xml.gz", 10),
                ("data/2024/discogs_20240201_artists.xml.gz", 10),
            ],
            None,
        )))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("prefix", "data/2024/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(
            &[
                ("data/2024/discogs_20240101_artists.xml.gz", 10),
                ("data/2024/discogs_20240101_labels.xml.gz", 10),
            ],
            Some("data/2024/discogs_20240101_labels.xml.gz"),
        )))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let listing = downloader(&server, &tmp).discover(period("2024-01")).await.unwrap();

    assert_eq!(listing.date.as_deref(), Some("20240115"));
    assert_eq!(
        listing.files.keys().copied().collect::<Vec<_>>(),
        vec![FileType::Labels, FileType::Artists]
    );
    assert!(listing.checksum_file.is_none());
}

#[tokio::test]
async fn test_listing_error_status_is_download_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let err = downloader(&server, &tmp).discover(period("2024-01")).await.unwrap_err();
    assert!(matches!(err, IngestError::Download(_)));
}

#[tokio::test]
async fn test_triggered_download_then_process() {
    let server = MockServer::start().await;
    mount_artists_dump(&server, None).await;
    let uri = server.uri();
    let store = Arc::new(MemoryCatalogStore::new());
    let h = Harness::with_config(store.clone(), |config| config.dump_base_url = uri);
    let key = period("2024-01");

    let started = h.service.trigger_download(key, &[FileType::Artists]).await.unwrap();
    assert!(started.success);
    assert!(started.job_id.is_some());
    h.service.wait(key).await.unwrap();

    let status = h.service.get_status(key).await.unwrap();
    assert_eq!(status.period.status, PeriodStatus::ReadyForProcessing);
    assert_eq!(status.available_files, vec![FileType::Artists]);
    assert!(status.period.download_completed_at.is_some());
    assert!(status.period.file_checksums.contains_key(&FileType::Artists));

    let summary = h
        .service
        .process(Some(key), &[FileType::Artists], Limits::default())
        .await
        .unwrap();
    assert!(summary.success, "{}", summary.message);
    assert_eq!(summary.totals.inserted, 5);
    assert_eq!(h.tracker.get(key).await.unwrap().status, PeriodStatus::Completed);
}

#[tokio::test]
async fn test_failed_download_marks_period_failed() {
    let server = MockServer::start().await;
    mount_artists_dump(&server, Some(&"f".repeat(64))).await;
    let uri = server.uri();
    let h = Harness::with_config(Arc::new(MemoryCatalogStore::new()), |config| {
        config.dump_base_url = uri
    });
    let key = period("2024-01");

    h.service.trigger_download(key, &[FileType::Artists]).await.unwrap();
    h.service.wait(key).await.unwrap();

    let period_state = h.tracker.get(key).await.unwrap();
    assert_eq!(period_state.status, PeriodStatus::Failed);
    assert_eq!(period_state.retry_count, 1);
    assert!(period_state.error_message.unwrap().contains("Checksum mismatch"));
}

/// How the raw bucket below sends the dump body
#[derive(Clone, Copy)]
struct BodyPacing {
    slices: usize,
    pause: Duration,
    /// Extra bytes announced in `Content-Length` but never sent
    missing: usize,
}

/// Bucket over a bare socket, for bodies that arrive slowly or not at all
///
/// Answers listings at once and sends the artists dump in `slices` pieces
/// with `pause` before each one. Every response closes its connection.
async fn spawn_paced_bucket(body: Vec<u8>, pacing: BodyPacing) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let listing = listing(&[("data/2024/discogs_20240101_artists.xml.gz", body.len())], None);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let (body, listing) = (body.clone(), listing.clone());
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = |len: usize| {
                    format!("HTTP/1.1 200 OK\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n")
                };

                if !request.starts_with(b"GET /data/") {
                    let response = format!("{}{}", head(listing.len()), listing);
                    let _ = socket.write_all(response.as_bytes()).await;
                    return;
                }
                if socket.write_all(head(body.len() + pacing.missing).as_bytes()).await.is_err() {
                    return;
                }
                for slice in body.chunks(body.len().div_ceil(pacing.slices)) {
                    tokio::time::sleep(pacing.pause).await;
                    if socket.write_all(slice).await.is_err() || socket.flush().await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    format!("http://{addr}")
}

fn paced_downloader(base_url: String, tmp: &TempDir, read_timeout_secs: u64) -> DumpDownloader {
    let config = IngestConfig {
        data_dir: tmp.path().to_path_buf(),
        dump_base_url: base_url,
        http_read_timeout_secs: read_timeout_secs,
        ..Default::default()
    };
    DumpDownloader::new(&config).unwrap()
}

#[tokio::test]
async fn test_slow_transfer_outlasting_read_timeout_completes() {
    let artists = gz_bytes("artists", &artists_xml(1..=20));
    let url = spawn_paced_bucket(
        artists.clone(),
        BodyPacing {
            slices: 8,
            pause: Duration::from_millis(250),
            missing: 0,
        },
    )
    .await;
    let tmp = TempDir::new().unwrap();
    let downloader = paced_downloader(url, &tmp, 1);
    let key = period("2024-01");

    let started = Instant::now();
    let checksums = downloader
        .download(key, &[FileType::Artists], &CancellationToken::new(), &NoopProgress)
        .await
        .unwrap();

    // Longer than the read timeout overall, never idle that long
    assert!(started.elapsed() > Duration::from_millis(1500));
    assert_eq!(checksums[&FileType::Artists], sha256(&artists));
    assert_eq!(std::fs::read(downloader.layout().file_path(key, FileType::Artists)).unwrap(), artists);
}

#[tokio::test]
async fn test_stalled_transfer_fails_and_cleans_up() {
    let artists = gz_bytes("artists", &artists_xml(1..=20));
    let url = spawn_paced_bucket(
        artists,
        BodyPacing {
            slices: 2,
            pause: Duration::from_millis(2500),
            missing: 0,
        },
    )
    .await;
    let tmp = TempDir::new().unwrap();
    let downloader = paced_downloader(url, &tmp, 1);
    let key = period("2024-01");

    let err = downloader
        .download(key, &[FileType::Artists], &CancellationToken::new(), &NoopProgress)
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Download(_)), "{err:?}");
    assert!(!downloader.layout().partial_path(key, FileType::Artists).exists());
    assert!(!downloader.layout().file_path(key, FileType::Artists).exists());
}

#[tokio::test]
async fn test_truncated_body_leaves_no_partial_file() {
    let artists = gz_bytes("artists", &artists_xml(1..=20));
    let url = spawn_paced_bucket(
        artists,
        BodyPacing {
            slices: 1,
            pause: Duration::ZERO,
            missing: 4096,
        },
    )
    .await;
    let tmp = TempDir::new().unwrap();
    let downloader = paced_downloader(url, &tmp, 5);
    let key = period("2024-01");

    let err = downloader
        .download(key, &[FileType::Artists], &CancellationToken::new(), &NoopProgress)
        .await
        .unwrap_err();

    match err {
        IngestError::Download(msg) => assert!(msg.contains("discogs_20240101_artists.xml.gz"), "{msg}"),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!downloader.layout().partial_path(key, FileType::Artists).exists());
    assert!(!downloader.layout().file_path(key, FileType::Artists).exists());
}
