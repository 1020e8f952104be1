//! Gzip compression for snapshot payloads, with a reusable buffer pool.
//!
//! Snapshot payloads can run to megabytes; compressing each one through a
//! fresh allocation churns the allocator and leaves large buffers for the
//! collector of the day. [`BufferPool`] keeps a bounded stack of scratch
//! buffers whose capacity survives between rentals, and [`Compressor`]
//! encodes through them, handing the caller an exact-sized copy.

use std::io::{Read, Write};
use std::sync::Mutex;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Result, StoreError};

/// Default cap on pooled buffers.
const DEFAULT_MAX_POOLED: usize = 8;

/// A bounded stack of reusable scratch buffers.
///
/// Rented buffers come back empty but with their capacity intact, so a
/// workload of similar-sized payloads stops allocating after warm-up.
/// Returns beyond the cap are simply dropped.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    /// A pool holding at most `max_pooled` idle buffers.
    #[must_use]
    pub fn new(max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    /// Take a buffer from the pool, or allocate a fresh one.
    #[must_use]
    pub fn rent(&self) -> Vec<u8> {
        self.lock().pop().unwrap_or_default()
    }

    /// Return a buffer; contents are cleared, capacity is kept.
    pub fn give_back(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut buffers = self.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buffer);
        }
    }

    /// Number of idle buffers currently pooled.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        // A poisoned pool only ever holds empty buffers; recover it.
        match self.buffers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POOLED)
    }
}

/// Gzip at the fast level, through pooled scratch buffers.
///
/// Snapshots are compressed once and read many times; the fast level trades
/// a few percent of ratio for a large encode-speed win, which is the right
/// side of that trade for write-path latency.
#[derive(Debug, Default)]
pub struct Compressor {
    pool: BufferPool,
}

impl Compressor {
    /// A compressor with a pool capped at `max_pooled` idle buffers.
    #[must_use]
    pub fn new(max_pooled: usize) -> Self {
        Self {
            pool: BufferPool::new(max_pooled),
        }
    }

    /// Gzip `input`. Empty input yields a valid (header-only) stream.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if encoding fails.
    pub fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let scratch = self.pool.rent();
        let mut encoder = GzEncoder::new(scratch, Compression::fast());
        encoder
            .write_all(input)
            .map_err(StoreError::serialization)?;
        let scratch = encoder.finish().map_err(StoreError::serialization)?;
        let output = scratch.as_slice().to_vec();
        self.pool.give_back(scratch);
        Ok(output)
    }

    /// Inverse of [`compress`](Self::compress).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] for truncated or non-gzip
    /// input.
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut scratch = self.pool.rent();
        let mut decoder = GzDecoder::new(input);
        decoder
            .read_to_end(&mut scratch)
            .map_err(StoreError::serialization)?;
        let output = scratch.as_slice().to_vec();
        self.pool.give_back(scratch);
        Ok(output)
    }
}
