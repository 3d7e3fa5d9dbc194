//! Streaming IO helpers for compressed dumps
//!
//! Dumps are multi-gigabyte gzip files, so nothing in here ever reads a whole
//! file into memory. [`open_gzip`] wraps the compressed file in a
//! [`CountingReader`] so callers can report progress as a fraction of the
//! compressed size while consuming the decompressed stream.

use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;

/// Read buffer used for the decompressed stream
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Shared handle onto the number of bytes a [`CountingReader`] has consumed
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
}

/// Reader adapter that counts bytes passing through it
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    counter: ByteCounter,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            counter: ByteCounter::default(),
        }
    }

    pub fn counter(&self) -> ByteCounter {
        self.counter.clone()
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.add(n as u64);
        Ok(n)
    }
}

/// Buffered, decompressed stream over a gzip file on disk
pub type GzipReader = BufReader<MultiGzDecoder<CountingReader<File>>>;

/// Decompressed view over a gzip file plus progress information
pub struct GzipSource {
    pub reader: GzipReader,
    /// Compressed bytes consumed so far
    pub compressed_read: ByteCounter,
    /// Size of the compressed file on disk
    pub compressed_size: u64,
}

impl GzipSource {
    /// Percentage of the compressed file consumed, in `0.0..=100.0`
    pub fn percentage(counter: &ByteCounter, compressed_size: u64) -> f64 {
        if compressed_size == 0 {
            return 0.0;
        }
        (counter.get() as f64 / compressed_size as f64 * 100.0).min(100.0)
    }
}

/// Open a gzip file for streaming decompression
pub fn open_gzip(path: impl AsRef<Path>) -> Result<GzipSource> {
    let file = File::open(path.as_ref())?;
    let compressed_size = file.metadata()?.len();
    let counting = CountingReader::new(file);
    let compressed_read = counting.counter();
    let decoder = MultiGzDecoder::new(counting);

    tracing::debug!(
        path = %path.as_ref().display(),
        compressed_size,
        "Opened gzip source"
    );

    Ok(GzipSource {
        reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, decoder),
        compressed_read,
        compressed_size,
    })
}
