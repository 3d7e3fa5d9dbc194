//! Dump downloader
//!
//! Discovers the files of a period by listing the public dump bucket, streams
//! each requested file into a `.part` file while hashing it, verifies the
//! SHA-256 digest against the period's CHECKSUM file, and renames the result
//! into the artifact layout.

use futures::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::layout::ArtifactLayout;
use crate::models::{FileType, PeriodKey};
use crate::progress::{ProgressEvent, ProgressPublisher, Stage};

const USER_AGENT: &str = concat!("discogs-ingest/", env!("CARGO_PKG_VERSION"));

/// Bucket listing, as returned by `GET /?prefix=...`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_marker: Option<String>,
    #[serde(default)]
    contents: Vec<BucketObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BucketObject {
    key: String,
    #[serde(default)]
    size: u64,
}

/// One object published in the bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Object key, e.g. `data/2024/discogs_20240101_artists.xml.gz`
    pub key: String,
    pub size: u64,
}

impl RemoteFile {
    /// Last path segment of the object key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Files published for one period
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpListing {
    /// Dump date, `YYYYMMDD`
    pub date: Option<String>,
    pub files: BTreeMap<FileType, RemoteFile>,
    pub checksum_file: Option<RemoteFile>,
}

/// What a bucket object name says about itself
#[derive(Debug, PartialEq, Eq)]
enum DumpObject {
    Data(FileType),
    Checksum,
}

/// Parse `discogs_YYYYMMDD_<type>.xml.gz` / `discogs_YYYYMMDD_CHECKSUM.txt`
fn classify_object(name: &str, key: PeriodKey) -> Option<(String, DumpObject)> {
    let rest = name.strip_prefix("discogs_")?;
    let (date, tail) = rest.split_once('_')?;
    if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !date.starts_with(&key.compact()) {
        return None;
    }
    let object = if tail == "CHECKSUM.txt" {
        DumpObject::Checksum
    } else {
        let file_type = tail.strip_suffix(".xml.gz")?.parse().ok()?;
        DumpObject::Data(file_type)
    };
    Some((date.to_string(), object))
}

/// Downloads dump files into an [`ArtifactLayout`]
#[derive(Clone)]
pub struct DumpDownloader {
    client: reqwest::Client,
    base_url: String,
    layout: ArtifactLayout,
    verify_checksums: bool,
}

impl DumpDownloader {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(config.http_connect_timeout())
            .read_timeout(config.http_read_timeout())
            .build()?;
        Ok(Self::with_client(
            client,
            &config.dump_base_url,
            ArtifactLayout::new(&config.data_dir),
            config.verify_checksums,
        ))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        layout: ArtifactLayout,
        verify_checksums: bool,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            layout,
            verify_checksums,
        }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// List the files published for a period
    ///
    /// When a month has more than one dump date the latest one wins.
    pub async fn discover(&self, key: PeriodKey) -> Result<DumpListing> {
        let prefix = format!("data/{}/", key.year());
        let mut marker: Option<String> = None;
        let mut by_date: BTreeMap<String, DumpListing> = BTreeMap::new();

        loop {
            let mut query = vec![("prefix", prefix.clone())];
            if let Some(m) = &marker {
                query.push(("marker", m.clone()));
            }
            let response = self
                .client
                .get(format!("{}/", self.base_url))
                .query(&query)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(IngestError::Download(format!(
                    "listing {} failed with status {}",
                    prefix,
                    response.status()
                )));
            }
            let body = response.text().await?;
            let page: ListBucketResult = quick_xml::de::from_str(&body)
                .map_err(|e| IngestError::Download(format!("invalid bucket listing: {}", e)))?;

            let last_key = page.contents.last().map(|o| o.key.clone());
            for object in page.contents {
                let remote = RemoteFile {
                    key: object.key,
                    size: object.size,
                };
                let Some((date, kind)) = classify_object(remote.file_name(), key) else {
                    continue;
                };
                let listing = by_date.entry(date.clone()).or_insert_with(|| DumpListing {
                    date: Some(date),
                    ..Default::default()
                });
                match kind {
                    DumpObject::Data(file_type) => {
                        listing.files.insert(file_type, remote);
                    },
                    DumpObject::Checksum => listing.checksum_file = Some(remote),
                }
            }

            if !page.is_truncated {
                break;
            }
            marker = page.next_marker.or(last_key);
            if marker.is_none() {
                break;
            }
        }

        let listing = by_date.into_values().next_back().unwrap_or_default();
        debug!(
            period = %key,
            date = listing.date.as_deref().unwrap_or("-"),
            files = listing.files.len(),
            "Discovered dump files"
        );
        Ok(listing)
    }

    /// Fetch and parse the CHECKSUM file of a listing
    pub async fn fetch_checksums(&self, listing: &DumpListing) -> Result<HashMap<String, String>> {
        let Some(file) = &listing.checksum_file else {
            return Ok(HashMap::new());
        };
        let response = self.client.get(self.object_url(file)).send().await?;
        if !response.status().is_success() {
            return Err(IngestError::Download(format!(
                "fetching {} failed with status {}",
                file.key,
                response.status()
            )));
        }
        let body = response.text().await?;
        Ok(discogs_common::checksum::parse_checksum_manifest(&body)?)
    }

    fn object_url(&self, file: &RemoteFile) -> String {
        format!("{}/{}", self.base_url, file.key)
    }

    /// Download the requested file types of a period
    ///
    /// Returns file type -> SHA-256 digest of the stored artifact.
    pub async fn download(
        &self,
        key: PeriodKey,
        file_types: &[FileType],
        cancel: &CancellationToken,
        progress: &dyn ProgressPublisher,
    ) -> Result<BTreeMap<FileType, String>> {
        let file_types = FileType::ordered(file_types)?;
        let listing = self.discover(key).await?;

        let missing: Vec<_> = file_types
            .iter()
            .filter(|ft| !listing.files.contains_key(ft))
            .map(|ft| ft.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(IngestError::NotFound(format!(
                "no {} dump published for {}",
                missing.join(", "),
                key
            )));
        }

        let manifest = if self.verify_checksums {
            let manifest = self.fetch_checksums(&listing).await?;
            if manifest.is_empty() {
                warn!(period = %key, "No CHECKSUM file published; skipping verification");
            }
            manifest
        } else {
            HashMap::new()
        };

        tokio::fs::create_dir_all(self.layout.period_dir(key)).await?;

        let mut checksums = BTreeMap::new();
        for file_type in file_types {
            let Some(remote) = listing.files.get(&file_type) else {
                continue;
            };
            let expected = manifest.get(remote.file_name()).map(String::as_str);
            let digest = self
                .download_file(key, file_type, remote, expected, cancel, progress)
                .await?;
            checksums.insert(file_type, digest);
        }
        Ok(checksums)
    }

    async fn download_file(
        &self,
        key: PeriodKey,
        file_type: FileType,
        remote: &RemoteFile,
        expected: Option<&str>,
        cancel: &CancellationToken,
        progress: &dyn ProgressPublisher,
    ) -> Result<String> {
        let partial = self.layout.partial_path(key, file_type);
        let target = self.layout.file_path(key, file_type);

        let fetched = self
            .fetch_verified(key, file_type, remote, expected, &partial, cancel, progress)
            .await;
        let committed = match fetched {
            Ok((digest, bytes)) => tokio::fs::rename(&partial, &target)
                .await
                .map(|()| (digest, bytes))
                .map_err(IngestError::from),
            Err(e) => Err(e),
        };
        let (digest, bytes) = match committed {
            Ok(done) => done,
            Err(e) => {
                discard_partial(&partial).await;
                return Err(e);
            },
        };

        info!(
            period = %key,
            file_type = %file_type,
            bytes,
            sha256 = %digest,
            verified = expected.is_some(),
            "Downloaded dump"
        );
        Ok(digest)
    }

    /// Stream one object into `partial` and check its digest
    ///
    /// Returns the SHA-256 digest and the number of bytes written. The caller
    /// owns cleanup of `partial` on error.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_verified(
        &self,
        key: PeriodKey,
        file_type: FileType,
        remote: &RemoteFile,
        expected: Option<&str>,
        partial: &Path,
        cancel: &CancellationToken,
        progress: &dyn ProgressPublisher,
    ) -> Result<(String, u64)> {
        let url = self.object_url(remote);
        info!(period = %key, file_type = %file_type, url = %url, "Downloading dump");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(IngestError::Download(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }
        let total = response.content_length().or(Some(remote.size).filter(|s| *s > 0));

        let mut file = tokio::fs::File::create(partial).await?;
        let mut hasher = Sha256::new();
        let mut downloaded = 0u64;
        let mut last_percent = -1i64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled(format!("download of {} cancelled", file_type)));
            }
            let chunk = chunk.map_err(|e| {
                IngestError::Download(format!(
                    "reading {} failed after {} bytes: {}",
                    remote.file_name(),
                    downloaded,
                    e
                ))
            })?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let percent = total
                .map(|t| downloaded as f64 / t as f64 * 100.0)
                .unwrap_or(0.0);
            if percent as i64 != last_percent {
                last_percent = percent as i64;
                progress.publish(
                    ProgressEvent::new(key, Some(file_type), Stage::Downloading)
                        .records(downloaded, total)
                        .percentage(percent),
                );
            }
        }
        file.flush().await?;

        let digest = hex::encode(hasher.finalize());
        if let Some(expected) = expected {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(IngestError::ChecksumMismatch {
                    file: remote.file_name().to_string(),
                    expected: expected.to_string(),
                    actual: digest,
                });
            }
        }
        Ok((digest, downloaded))
    }
}

/// Remove a `.part` file left by a failed download
async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial download"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn key(s: &str) -> PeriodKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_classify_object_names() {
        let k = key("2024-01");
        assert_eq!(
            classify_object("discogs_20240101_artists.xml.gz", k),
            Some(("20240101".to_string(), DumpObject::Data(FileType::Artists)))
        );
        assert_eq!(
            classify_object("discogs_20240101_CHECKSUM.txt", k),
            Some(("20240101".to_string(), DumpObject::Checksum))
        );
        assert!(classify_object("discogs_20240201_artists.xml.gz", k).is_none());
        assert!(classify_object("discogs_20240101_genres.xml.gz", k).is_none());
        assert!(classify_object("discogs_2024011_labels.xml.gz", k).is_none());
        assert!(classify_object("README.txt", k).is_none());
    }

    #[test]
    fn test_listing_xml_parses() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>discogs-data-dumps</Name>
  <Prefix>data/2024/</Prefix>
  <Marker></Marker>
  <MaxKeys>1000</MaxKeys>
  <IsTruncated>false</IsTruncated>
  <Contents>
    <Key>data/2024/discogs_20240101_CHECKSUM.txt</Key>
    <LastModified>2024-01-01T00:00:00.000Z</LastModified>
    <Size>420</Size>
  </Contents>
  <Contents>
    <Key>data/2024/discogs_20240101_labels.xml.gz</Key>
    <LastModified>2024-01-01T00:00:00.000Z</LastModified>
    <Size>81234567</Size>
  </Contents>
</ListBucketResult>"#;
        let result: ListBucketResult = quick_xml::de::from_str(xml).unwrap();
        assert!(!result.is_truncated);
        assert_eq!(result.contents.len(), 2);
        assert_eq!(result.contents[1].size, 81_234_567);
    }

    #[test]
    fn test_remote_file_name() {
        let file = RemoteFile {
            key: "data/2024/discogs_20240101_labels.xml.gz".to_string(),
            size: 1,
        };
        assert_eq!(file.file_name(), "discogs_20240101_labels.xml.gz");
    }
}
