//! Filesystem blob backend
//!
//! One file per blob under a two-level fan-out directory derived from
//! the hash: `<root>/aa/bb/<hash>.blob`. Blobs are immutable, so a file
//! that already exists is never rewritten.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::{blob_prefix, is_valid_hash, Error, Result};

use super::{BlobBackend, EnumerateSink};

const BLOB_EXT: &str = "blob";

pub struct FsBackend {
    root: PathBuf,
    closed: AtomicBool,
}

impl FsBackend {
    /// Open or create a blob directory at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        tracing::debug!(root = %root.display(), "fs backend opened");
        Ok(Self {
            root,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::BackendClosed);
        }
        Ok(())
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        if !is_valid_hash(hash) {
            return Err(Error::Corrupted(format!("malformed blob hash {:?}", hash)));
        }
        let (aa, bb) = blob_prefix(hash);
        Ok(self
            .root
            .join(aa)
            .join(bb)
            .join(format!("{}.{}", hash, BLOB_EXT)))
    }

    fn walk(&self, dir: &Path, sink: &mut EnumerateSink<'_>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.walk(&path, sink)?;
            } else if path.extension().and_then(|e| e.to_str()) == Some(BLOB_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if is_valid_hash(stem) {
                        sink(stem)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl BlobBackend for FsBackend {
    fn put(&self, hash: &str, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let path = self.blob_path(hash)?;
        if path.exists() {
            // Content-addressed: same hash, same bytes.
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write to a temp name then rename, so a crash never leaves a
        // half-written blob under its final hash.
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, hash: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let path = self.blob_path(hash)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::BlobNotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, hash: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.blob_path(hash)?.exists())
    }

    fn enumerate(&self, sink: &mut EnumerateSink<'_>) -> Result<()> {
        self.ensure_open()?;
        self.walk(&self.root, sink)
    }

    fn done(&self) -> Result<()> {
        self.ensure_open()?;
        // Individual puts already fsync their file; sync the root so the
        // directory entries themselves are durable.
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::BackendClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::content_hash_hex;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let backend = FsBackend::open(dir.path().join("blobs")).unwrap();
        let hash = content_hash_hex(b"on disk");
        backend.put(&hash, b"on disk").unwrap();
        assert_eq!(backend.get(&hash).unwrap(), b"on disk");
        assert!(backend.exists(&hash).unwrap());
        backend.done().unwrap();
    }

    #[test]
    fn test_get_missing_blob() {
        let dir = tempdir().unwrap();
        let backend = FsBackend::open(dir.path().join("blobs")).unwrap();
        let hash = content_hash_hex(b"never written");
        assert!(matches!(backend.get(&hash), Err(Error::BlobNotFound(_))));
        assert!(!backend.exists(&hash).unwrap());
    }

    #[test]
    fn test_rejects_malformed_hash() {
        let dir = tempdir().unwrap();
        let backend = FsBackend::open(dir.path().join("blobs")).unwrap();
        assert!(matches!(
            backend.put("../../escape", b"x"),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_enumerate_after_reopen() {
        let dir = tempdir().unwrap();
        let mut expected = Vec::new();
        {
            let backend = FsBackend::open(dir.path().join("blobs")).unwrap();
            for i in 0..20 {
                let data = format!("blob-{}", i);
                let hash = content_hash_hex(data.as_bytes());
                backend.put(&hash, data.as_bytes()).unwrap();
                expected.push(hash);
            }
            backend.close().unwrap();
        }
        let backend = FsBackend::open(dir.path().join("blobs")).unwrap();
        let mut seen = Vec::new();
        backend
            .enumerate(&mut |hash| {
                seen.push(hash.to_string());
                Ok(())
            })
            .unwrap();
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    }
}
