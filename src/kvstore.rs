//! Public key-value API over the versioned store
//!
//! Keys here are UTF-8 text without `/` (and without NUL, which the
//! composite-key encoding reserves). Every successful write is also
//! pushed on the KV-update channel so the bridge can turn it into a
//! meta blob; reads are answered locally by the versioned store.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::common::{Error, Result};
use crate::vkv::{KeyValue, VkvStore};

/// Bounded capacity of the KV-update channel.
pub const UPDATE_CHANNEL_CAPACITY: usize = 128;

fn validate_key(key: &str) -> Result<()> {
    if key.contains('/') {
        return Err(Error::InvalidKey(format!(
            "/ is a forbidden character: {:?}",
            key
        )));
    }
    if key.contains('\0') {
        return Err(Error::InvalidKey(format!(
            "NUL is a forbidden character: {:?}",
            key
        )));
    }
    Ok(())
}

/// Text-keyed KV store with meta-blob propagation.
#[derive(Clone)]
pub struct KvStore {
    vkv: Arc<VkvStore>,
    updates: mpsc::Sender<KeyValue>,
}

impl KvStore {
    pub fn new(vkv: Arc<VkvStore>, updates: mpsc::Sender<KeyValue>) -> Self {
        KvStore { vkv, updates }
    }

    /// Persist `(key, version, data, ref)` and hand the record to the
    /// bridge. `version <= 0` assigns the current time in nanoseconds.
    pub async fn put(
        &self,
        key: &str,
        data: &[u8],
        version: i64,
        ref_hash: Option<&str>,
    ) -> Result<KeyValue> {
        validate_key(key)?;
        let record = KeyValue::new(
            key.as_bytes().to_vec(),
            version,
            data.to_vec(),
            ref_hash.map(str::to_string),
        );
        let stored = self.vkv.put(&record)?;
        tracing::debug!(key, version = stored.version, "op put");

        // The record is durable either way; a closed channel only means
        // shutdown already started and the blob ships on the next scan.
        if self.updates.send(stored.clone()).await.is_err() {
            tracing::warn!(key, version = stored.version,
                "kv update channel closed, meta blob deferred to next scan");
        }
        Ok(stored)
    }

    /// Fetch a record; `version <= 0` means latest, otherwise the
    /// greatest stored version `<= version`.
    pub fn get(&self, key: &str, version: i64) -> Result<KeyValue> {
        tracing::debug!(key, version, "op get");
        self.vkv.get(key.as_bytes(), version)
    }

    /// Forward scan of `[start, end)`: latest version per key plus a
    /// continuation cursor (empty when exhausted).
    pub fn keys(&self, start: &str, end: &str, limit: usize) -> Result<(Vec<KeyValue>, String)> {
        tracing::debug!(start, end, limit, "op keys");
        let (kvs, cursor) = self.vkv.keys(start.as_bytes(), end.as_bytes(), limit)?;
        Ok((kvs, cursor_to_string(cursor)?))
    }

    /// Reverse scan: `start` is the exclusive upper bound, `end` the
    /// inclusive lower bound.
    pub fn reverse_keys(
        &self,
        start: &str,
        end: &str,
        limit: usize,
    ) -> Result<(Vec<KeyValue>, String)> {
        tracing::debug!(start, end, limit, "op reverse_keys");
        let (kvs, cursor) = self
            .vkv
            .reverse_keys(start.as_bytes(), end.as_bytes(), limit)?;
        Ok((kvs, cursor_to_string(cursor)?))
    }

    /// Versions of `key` within `[from, to]`, descending; `to <= 0`
    /// means unbounded above. The cursor is the next upper bound, as
    /// text, empty when exhausted.
    pub fn versions(
        &self,
        key: &str,
        from: i64,
        to: i64,
        limit: usize,
    ) -> Result<(Vec<KeyValue>, String)> {
        tracing::debug!(key, from, to, limit, "op versions");
        let (kvs, cursor) = self.vkv.versions(key.as_bytes(), from, to, limit)?;
        Ok((kvs, cursor.map(|c| c.to_string()).unwrap_or_default()))
    }

    /// The meta-blob hash bound to `(key, version)`, or empty.
    pub fn get_meta_blob(&self, key: &str, version: i64) -> Result<Option<String>> {
        self.vkv.get_meta_blob(key.as_bytes(), version)
    }
}

fn cursor_to_string(cursor: Option<Vec<u8>>) -> Result<String> {
    match cursor {
        None => Ok(String::new()),
        Some(bytes) => String::from_utf8(bytes)
            .map_err(|_| Error::Corrupted("scan cursor is not UTF-8".into())),
    }
}
