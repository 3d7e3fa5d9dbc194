//! Discogs Common Library
//!
//! Shared types, utilities, and error handling for the Discogs catalog sync.
//!
//! # Overview
//!
//! This crate provides common functionality used across the workspace:
//!
//! - **Error Handling**: Custom error types and result types
//! - **Checksums**: Streaming SHA-256/SHA-512 digests for downloaded artifacts
//! - **IO**: Byte-counting readers and gzip helpers for streaming dumps
//! - **Logging**: Centralised `tracing` subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use discogs_common::checksum::{compute_file_checksum, ChecksumAlgorithm};
//!
//! fn verify(path: &str) -> discogs_common::Result<()> {
//!     let checksum = compute_file_checksum(path, ChecksumAlgorithm::Sha256)?;
//!     tracing::info!(%checksum, "computed checksum");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod io;
pub mod logging;

// Re-export commonly used types
pub use error::{DiscogsError, Result};
