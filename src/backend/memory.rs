//! In-memory blob backend, for tests and embedding

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::common::{Error, Result};

use super::{BlobBackend, EnumerateSink};

/// HashMap-backed blob store behind a `RwLock`. Blobs are cloned on
/// read; `done` is a no-op since there is nothing to make durable.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::BackendClosed);
        }
        Ok(())
    }
}

impl BlobBackend for MemoryBackend {
    fn put(&self, hash: &str, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut blobs = self.blobs.write().expect("lock poisoned");
        // Idempotent by hash: a repeat write of existing content is a no-op.
        blobs.entry(hash.to_string()).or_insert_with(|| data.to_vec());
        Ok(())
    }

    fn get(&self, hash: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let blobs = self.blobs.read().expect("lock poisoned");
        blobs
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::BlobNotFound(hash.to_string()))
    }

    fn exists(&self, hash: &str) -> Result<bool> {
        self.ensure_open()?;
        let blobs = self.blobs.read().expect("lock poisoned");
        Ok(blobs.contains_key(hash))
    }

    fn enumerate(&self, sink: &mut EnumerateSink<'_>) -> Result<()> {
        self.ensure_open()?;
        let hashes: Vec<String> = {
            let blobs = self.blobs.read().expect("lock poisoned");
            blobs.keys().cloned().collect()
        };
        for hash in hashes {
            sink(&hash)?;
        }
        Ok(())
    }

    fn done(&self) -> Result<()> {
        self.ensure_open()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::BackendClosed);
        }
        Ok(())
    }
}
