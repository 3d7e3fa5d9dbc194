//! Discogs catalog ingestion
//!
//! Synchronises the monthly Discogs XML dumps into PostgreSQL without
//! rewriting records that did not change.
//!
//! # Pipeline
//!
//! - [`download`]: fetch and verify a period's dump files
//! - [`decoder`]: stream one record at a time out of a gzip dump
//! - [`hash`]: content hash over each record's canonical fields
//! - [`classifier`]: split batches into insert, update and skip sets
//! - [`writer`]: transactional batch upserts with per-batch isolation
//! - [`orchestrator`]: dependency-ordered processing of the file types
//! - [`state`]: persistent lifecycle of each period
//! - [`service`]: the trigger surface used by schedulers and the CLI
//!
//! # Example
//!
//! ```no_run
//! use discogs_ingest::config::IngestConfig;
//! use discogs_ingest::models::FileType;
//! use discogs_ingest::progress::LoggingProgress;
//! use discogs_ingest::service::IngestService;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let limits = config.limits;
//!     let service = IngestService::connect(config, Arc::new(LoggingProgress)).await?;
//!     let summary = service
//!         .process(Some("2024-01".parse()?), &FileType::ALL, limits)
//!         .await?;
//!     println!("{}", summary.message);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod classifier;
pub mod config;
pub mod decoder;
pub mod download;
pub mod error;
pub mod hash;
pub mod jobs;
pub mod layout;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod service;
pub mod state;
pub mod store;
pub mod writer;

pub use error::{IngestError, Result};
