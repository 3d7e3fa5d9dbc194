//! Ingestion configuration
//!
//! Everything is read from environment variables. The binary loads `.env`
//! with `dotenvy` before calling [`IngestConfig::from_env`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IngestError, Result};

pub const DEFAULT_DATA_DIR: &str = "/tmp/discogs-data";
pub const DEFAULT_DUMP_BASE_URL: &str = "https://discogs-data-dumps.s3.us-west-2.amazonaws.com";
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
pub const MAX_BATCH_SIZE_LIMIT: usize = 10_000;
pub const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 30;
/// Longest pause between two reads of a response body
pub const DEFAULT_HTTP_READ_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_ERROR_SAMPLES: usize = 100;
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Record and batch limits applied to one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Stop after this many decoded records per file type
    pub max_records: Option<u64>,
    /// Records grouped into one transaction
    pub max_batch_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_records: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl Limits {
    pub fn new(max_records: Option<u64>, max_batch_size: usize) -> Result<Self> {
        let limits = Self {
            max_records,
            max_batch_size,
        };
        limits.validate()?;
        Ok(limits)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE_LIMIT {
            return Err(IngestError::InvalidConfig(format!(
                "max_batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE_LIMIT, self.max_batch_size
            )));
        }
        if self.max_records == Some(0) {
            return Err(IngestError::InvalidConfig(
                "max_records must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    /// Root of the downloaded artifact tree
    pub data_dir: PathBuf,
    /// Base URL of the dump bucket
    pub dump_base_url: String,
    /// Default limits for triggered runs
    pub limits: Limits,
    pub batch_timeout_secs: u64,
    pub http_connect_timeout_secs: u64,
    /// Idle limit per read; a transfer that keeps making progress never hits it
    pub http_read_timeout_secs: u64,
    /// Cap on human-readable error strings kept per file type
    pub max_error_samples: usize,
    pub verify_checksums: bool,
    /// Read past the record limit to count unprocessed records exactly
    pub count_unprocessed: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: None,
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            dump_base_url: DEFAULT_DUMP_BASE_URL.to_string(),
            limits: Limits::default(),
            batch_timeout_secs: DEFAULT_BATCH_TIMEOUT_SECS,
            http_connect_timeout_secs: DEFAULT_HTTP_CONNECT_TIMEOUT_SECS,
            http_read_timeout_secs: DEFAULT_HTTP_READ_TIMEOUT_SECS,
            max_error_samples: DEFAULT_MAX_ERROR_SAMPLES,
            verify_checksums: true,
            count_unprocessed: true,
        }
    }
}

/// Parse an optional environment variable, rejecting unparsable values
fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IngestError::InvalidConfig(format!("{} has invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}

impl IngestConfig {
    /// Load configuration from environment variables and validate it
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").ok(),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS")?
                    .unwrap_or(defaults.database.max_connections),
                connect_timeout_secs: env_parse("DATABASE_CONNECT_TIMEOUT")?
                    .unwrap_or(defaults.database.connect_timeout_secs),
            },
            data_dir: std::env::var("INGEST_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            dump_base_url: std::env::var("INGEST_DUMP_BASE_URL")
                .unwrap_or(defaults.dump_base_url),
            limits: Limits {
                max_records: env_parse("INGEST_MAX_RECORDS")?,
                max_batch_size: env_parse("INGEST_MAX_BATCH_SIZE")?
                    .unwrap_or(defaults.limits.max_batch_size),
            },
            batch_timeout_secs: env_parse("INGEST_BATCH_TIMEOUT_SECS")?
                .unwrap_or(defaults.batch_timeout_secs),
            http_connect_timeout_secs: env_parse("INGEST_HTTP_CONNECT_TIMEOUT_SECS")?
                .unwrap_or(defaults.http_connect_timeout_secs),
            http_read_timeout_secs: env_parse("INGEST_HTTP_READ_TIMEOUT_SECS")?
                .unwrap_or(defaults.http_read_timeout_secs),
            max_error_samples: env_parse("INGEST_MAX_ERROR_SAMPLES")?
                .unwrap_or(defaults.max_error_samples),
            verify_checksums: env_parse("INGEST_VERIFY_CHECKSUMS")?
                .unwrap_or(defaults.verify_checksums),
            count_unprocessed: env_parse("INGEST_COUNT_UNPROCESSED")?
                .unwrap_or(defaults.count_unprocessed),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        if self.batch_timeout_secs == 0 {
            return Err(IngestError::InvalidConfig(
                "INGEST_BATCH_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        if self.http_connect_timeout_secs == 0 {
            return Err(IngestError::InvalidConfig(
                "INGEST_HTTP_CONNECT_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        if self.http_read_timeout_secs == 0 {
            return Err(IngestError::InvalidConfig(
                "INGEST_HTTP_READ_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(IngestError::InvalidConfig(
                "DATABASE_MAX_CONNECTIONS must be greater than 0".to_string(),
            ));
        }
        if !self.dump_base_url.starts_with("http://") && !self.dump_base_url.starts_with("https://")
        {
            return Err(IngestError::InvalidConfig(format!(
                "INGEST_DUMP_BASE_URL must be an http(s) URL, got '{}'",
                self.dump_base_url
            )));
        }
        Ok(())
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn http_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.http_connect_timeout_secs)
    }

    pub fn http_read_timeout(&self) -> Duration {
        Duration::from_secs(self.http_read_timeout_secs)
    }

    /// Database URL, required by every command that touches the store
    pub fn database_url(&self) -> Result<&str> {
        self.database
            .url
            .as_deref()
            .ok_or_else(|| IngestError::InvalidConfig("DATABASE_URL is not set".to_string()))
    }
}
