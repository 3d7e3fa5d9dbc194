//! Errors of the shared artifact and logging helpers

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscogsError>;

#[derive(Error, Debug)]
pub enum DiscogsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line of a `CHECKSUM.txt` file could not be understood
    #[error("Invalid checksum manifest line {line}: {message}")]
    Manifest { line: usize, message: String },
}
