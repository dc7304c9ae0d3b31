//! Versioned key-value store
//!
//! Every key holds a totally ordered set of versions; writes add
//! versions and never remove them, so historical reads stay available.
//! Backed by one `sled` database with two trees: the key-space (records,
//! newest version first) and the meta-space (meta-blob bindings). All
//! scans are prefix-bounded lexical iteration over composite keys; see
//! [`codec`] for the layout.
//!
//! Writers on the same key serialize through a [`SlottedMutex`]; writers
//! on different keys proceed in parallel. Readers only ever observe
//! fully applied writes.

pub mod codec;
pub mod lock;

use std::borrow::Cow;
use std::path::Path;

use crate::common::{now_nanos, Error, Result};

pub use lock::{SlottedMutex, DEFAULT_SLOTS};

const KV_TREE: &str = "kv";
const META_TREE: &str = "meta";

/// One versioned record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Key bytes. The public [`crate::KvStore`] layer restricts keys to
    /// UTF-8 text; the sort-index stores binary composite keys.
    pub key: Vec<u8>,
    /// Caller-supplied monotonic stamp (UTC nanoseconds by convention).
    pub version: i64,
    pub data: Vec<u8>,
    /// Optional pointer to an associated data blob (hex content hash).
    pub ref_hash: Option<String>,
}

impl KeyValue {
    pub fn new(key: Vec<u8>, version: i64, data: Vec<u8>, ref_hash: Option<String>) -> Self {
        KeyValue {
            key,
            version,
            data,
            ref_hash,
        }
    }

    /// Key as text, for logs and error messages.
    pub fn key_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}

/// The versioned KV handle. Safe for concurrent use; clones of the
/// internal trees share one pagecache.
pub struct VkvStore {
    _db: sled::Db,
    kv: sled::Tree,
    meta: sled::Tree,
    locks: SlottedMutex,
}

impl VkvStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let kv = db.open_tree(KV_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        tracing::debug!(path = %path.as_ref().display(), "vkv opened");
        Ok(VkvStore {
            _db: db,
            kv,
            meta,
            locks: SlottedMutex::new(),
        })
    }

    /// Persist a record. A `version <= 0` is replaced with the current
    /// UTC time in nanoseconds. Re-writing an existing `(key, version)`
    /// with an identical payload is a no-op; with a different payload it
    /// is a version conflict. Returns the record with its assigned
    /// version.
    pub fn put(&self, kv: &KeyValue) -> Result<KeyValue> {
        let version = if kv.version <= 0 {
            now_nanos()
        } else {
            kv.version
        };
        let composite = codec::kv_key(&kv.key, version);
        let value = codec::encode_value(&kv.data, kv.ref_hash.as_deref())?;

        let _guard = self.locks.lock(&kv.key);
        if let Some(existing) = self.kv.get(&composite)? {
            if existing.as_ref() == value.as_slice() {
                return Ok(KeyValue { version, ..kv.clone() });
            }
            return Err(Error::VersionConflict {
                key: kv.key_lossy().into_owned(),
                version,
            });
        }
        self.kv.insert(composite, value)?;
        Ok(KeyValue { version, ..kv.clone() })
    }

    /// Fetch a record. `version <= 0` returns the latest; otherwise the
    /// greatest stored version `v <= version`.
    pub fn get(&self, key: &[u8], version: i64) -> Result<KeyValue> {
        let start = if version <= 0 {
            codec::key_prefix(key)
        } else {
            codec::kv_key(key, version)
        };
        let end = codec::key_prefix_end(key);
        for item in self.kv.range(start..end) {
            let (composite, value) = item?;
            let (k, v) = codec::split_kv_key(&composite)?;
            if k != key {
                continue;
            }
            let (data, ref_hash) = codec::decode_value(&value)?;
            return Ok(KeyValue {
                key: key.to_vec(),
                version: v,
                data,
                ref_hash,
            });
        }
        Err(Error::NotFound(
            String::from_utf8_lossy(key).into_owned(),
        ))
    }

    /// Forward scan of keys in `[start, end)`, returning the latest
    /// version of each key. `limit = 0` returns all. The continuation
    /// cursor is the next key to resume at, or `None` when exhausted.
    pub fn keys(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<(Vec<KeyValue>, Option<Vec<u8>>)> {
        let mut out = Vec::new();
        if start >= end {
            return Ok((out, None));
        }
        let mut last_key: Option<Vec<u8>> = None;
        for item in self.kv.range(start.to_vec()..end.to_vec()) {
            let (composite, value) = item?;
            let (k, v) = codec::split_kv_key(&composite)?;
            if k < start || k >= end {
                continue;
            }
            if last_key.as_deref() == Some(k) {
                // older version of a key already emitted
                continue;
            }
            last_key = Some(k.to_vec());
            let (data, ref_hash) = codec::decode_value(&value)?;
            out.push(KeyValue {
                key: k.to_vec(),
                version: v,
                data,
                ref_hash,
            });
            if limit > 0 && out.len() >= limit {
                let cursor = codec::next_key(k);
                return Ok((out, Some(cursor)));
            }
        }
        Ok((out, None))
    }

    /// Reverse scan of keys: `start` is the exclusive upper bound,
    /// `end` the inclusive lower bound. Returns the latest version of
    /// each key, largest key first. The continuation cursor is the last
    /// key returned; passing it back as `start` resumes strictly below
    /// it.
    pub fn reverse_keys(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<(Vec<KeyValue>, Option<Vec<u8>>)> {
        let mut out = Vec::new();
        if end >= start {
            return Ok((out, None));
        }
        let mut last_key: Option<Vec<u8>> = None;
        for item in self.kv.range(end.to_vec()..start.to_vec()).rev() {
            let (composite, _) = item?;
            let (k, _) = codec::split_kv_key(&composite)?;
            if k < end || k >= start {
                continue;
            }
            if last_key.as_deref() == Some(k) {
                continue;
            }
            last_key = Some(k.to_vec());
            // Reverse iteration reaches a key's oldest version first;
            // point-read the latest instead.
            let latest = self.get(k, 0)?;
            out.push(latest);
            if limit > 0 && out.len() >= limit {
                return Ok((out, Some(k.to_vec())));
            }
        }
        Ok((out, None))
    }

    /// Versions of `key` with `from <= version <= to`, descending.
    /// `to <= 0` means unbounded above; `limit = 0` returns all. The
    /// continuation cursor is the next upper bound to resume with.
    pub fn versions(
        &self,
        key: &[u8],
        from: i64,
        to: i64,
        limit: usize,
    ) -> Result<(Vec<KeyValue>, Option<i64>)> {
        let to = if to <= 0 { i64::MAX } else { to };
        let start = codec::kv_key(key, to);
        let end = codec::key_prefix_end(key);
        let mut out = Vec::new();
        for item in self.kv.range(start..end) {
            let (composite, value) = item?;
            let (k, v) = codec::split_kv_key(&composite)?;
            if k != key {
                continue;
            }
            if v < from {
                break;
            }
            let (data, ref_hash) = codec::decode_value(&value)?;
            out.push(KeyValue {
                key: key.to_vec(),
                version: v,
                data,
                ref_hash,
            });
            if limit > 0 && out.len() >= limit {
                let cursor = v - 1;
                return Ok((out, if cursor >= from { Some(cursor) } else { None }));
            }
        }
        Ok((out, None))
    }

    /// Bind a meta-blob hash to `(key, version)`. Rebinding the same
    /// hash is a no-op; a different hash is an error.
    pub fn set_meta_blob(&self, key: &[u8], version: i64, hash: &str) -> Result<()> {
        let composite = codec::meta_key(key, version);
        let _guard = self.locks.lock(key);
        if let Some(existing) = self.meta.get(&composite)? {
            if existing.as_ref() == hash.as_bytes() {
                return Ok(());
            }
            return Err(Error::MetaBlobRebind {
                key: String::from_utf8_lossy(key).into_owned(),
                version,
            });
        }
        self.meta.insert(composite, hash.as_bytes())?;
        Ok(())
    }

    /// The meta-blob hash bound to `(key, version)`, if any.
    pub fn get_meta_blob(&self, key: &[u8], version: i64) -> Result<Option<String>> {
        let composite = codec::meta_key(key, version);
        Ok(self
            .meta
            .get(&composite)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Drop every record and binding. Exists for recovery testing; the
    /// write path never deletes.
    pub fn clear(&self) -> Result<()> {
        self.kv.clear()?;
        self.meta.clear()?;
        Ok(())
    }

    /// Flush both trees to disk.
    pub fn flush(&self) -> Result<()> {
        self.kv.flush()?;
        self.meta.flush()?;
        Ok(())
    }

    /// Flush and release. The handle must not be used afterwards.
    pub fn close(&self) -> Result<()> {
        self.flush()
    }
}
