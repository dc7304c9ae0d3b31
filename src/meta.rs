//! Meta blobs: VKV mutations as self-describing, replayable blobs
//!
//! Every KV write is encoded into a tagged, length-prefixed blob and
//! shipped through the router to whichever backend the `if-meta` rules
//! select. Replaying those blobs against an empty store reproduces the
//! KV state exactly once: the `(key, version) → hash` binding recorded
//! before shipping makes the apply step idempotent, and the encoding is
//! deterministic so the hash of a record never drifts.
//!
//! Wire format:
//!
//! ```text
//! taglen(varint) ‖ tag ‖ version(be64) ‖ keylen(varint) ‖ key ‖
//! datalen(varint) ‖ data ‖ reflen(varint) ‖ ref-hex
//! ```
//!
//! The tag for KV records is the ASCII string `kv`; a zero `reflen` is
//! the empty-ref marker. Readers reject unknown tags.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::common::{content_hash_hex, Error, Result};
use crate::router::{Request, Router};
use crate::vkv::{KeyValue, VkvStore};

/// Type tag for VKV records.
pub const KV_TYPE: &str = "kv";

/// Initial backoff delay for background backend retries.
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Backoff ceiling.
const RETRY_MAX: Duration = Duration::from_secs(30);

// --- varints (unsigned LEB128) ---

fn write_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn read_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut x = 0u64;
    let mut shift = 0u32;
    loop {
        let b = *buf
            .get(*pos)
            .ok_or_else(|| Error::Corrupted("truncated varint".into()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(Error::Corrupted("varint overflow".into()));
        }
        x |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(x);
        }
        shift += 7;
    }
}

fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| Error::Corrupted("truncated meta blob".into()))?;
    let out = &buf[*pos..end];
    *pos = end;
    Ok(out)
}

/// A decoded meta blob. The leading tag permits future record kinds
/// without breaking old replays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaRecord {
    Kv(KeyValue),
}

/// Encode a KV record. Field order is fixed, so the encoding (and
/// therefore the blob hash) depends only on `(key, version, data, ref)`.
pub fn encode_kv(kv: &KeyValue) -> Vec<u8> {
    let ref_bytes = kv.ref_hash.as_deref().unwrap_or("").as_bytes();
    let mut buf =
        Vec::with_capacity(3 + 8 + 10 + kv.key.len() + 10 + kv.data.len() + ref_bytes.len());
    write_uvarint(&mut buf, KV_TYPE.len() as u64);
    buf.extend_from_slice(KV_TYPE.as_bytes());
    buf.extend_from_slice(&(kv.version as u64).to_be_bytes());
    write_uvarint(&mut buf, kv.key.len() as u64);
    buf.extend_from_slice(&kv.key);
    write_uvarint(&mut buf, kv.data.len() as u64);
    buf.extend_from_slice(&kv.data);
    write_uvarint(&mut buf, ref_bytes.len() as u64);
    buf.extend_from_slice(ref_bytes);
    buf
}

/// Decode a meta blob by its type tag.
pub fn decode(blob: &[u8]) -> Result<MetaRecord> {
    let mut pos = 0usize;
    let taglen = read_uvarint(blob, &mut pos)? as usize;
    let tag = read_bytes(blob, &mut pos, taglen)?;
    match tag {
        b"kv" => {
            let version = u64::from_be_bytes(
                read_bytes(blob, &mut pos, 8)?
                    .try_into()
                    .expect("fixed width"),
            ) as i64;
            let keylen = read_uvarint(blob, &mut pos)? as usize;
            let key = read_bytes(blob, &mut pos, keylen)?.to_vec();
            let datalen = read_uvarint(blob, &mut pos)? as usize;
            let data = read_bytes(blob, &mut pos, datalen)?.to_vec();
            let reflen = read_uvarint(blob, &mut pos)? as usize;
            let ref_hash = if reflen == 0 {
                None
            } else {
                let raw = read_bytes(blob, &mut pos, reflen)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| Error::Corrupted("meta blob ref is not UTF-8".into()))?;
                Some(s.to_string())
            };
            if pos != blob.len() {
                return Err(Error::Corrupted("trailing bytes in meta blob".into()));
            }
            Ok(MetaRecord::Kv(KeyValue {
                key,
                version,
                data,
                ref_hash,
            }))
        }
        other => Err(Error::BadMetaType(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

/// Outcome counters of one replay scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Records replayed into the KV.
    pub applied: u64,
    /// Records already bound (no-op).
    pub skipped: u64,
    /// Blobs set aside: integrity mismatch, unknown tag, or conflicting
    /// payload.
    pub quarantined: u64,
}

/// The bridge between VKV mutations and meta blobs.
pub struct MetaBridge {
    vkv: Arc<VkvStore>,
    router: Arc<Router>,
    host: String,
}

impl MetaBridge {
    pub fn new(vkv: Arc<VkvStore>, router: Arc<Router>, host: String) -> Self {
        MetaBridge { vkv, router, host }
    }

    /// Consume KV updates until the channel closes, shipping a meta blob
    /// for each. Runs as a background task.
    pub async fn watch(self: Arc<Self>, mut rx: mpsc::Receiver<KeyValue>) {
        while let Some(kv) = rx.recv().await {
            if let Err(e) = self.ship(&kv).await {
                tracing::error!(key = %kv.key_lossy(), version = kv.version, error = %e,
                    "failed to ship meta blob");
            }
        }
        tracing::debug!("kv update channel closed, bridge watcher done");
    }

    /// The write path: encode, bind, then route the blob to a backend.
    /// The binding happens before the backend write so a crash in
    /// between leaves a bound-but-not-shipped record, which replay
    /// treats as already applied.
    async fn ship(&self, kv: &KeyValue) -> Result<()> {
        let encoded = encode_kv(kv);
        let hash = content_hash_hex(&encoded);
        self.vkv.set_meta_blob(&kv.key, kv.version, &hash)?;

        let req = Request::write(true, &self.host);
        let mut delay = RETRY_BASE;
        loop {
            match self.router.put(&req, &hash, &encoded) {
                Ok(()) => {
                    tracing::debug!(key = %kv.key_lossy(), version = kv.version, %hash,
                        "meta blob shipped");
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(%hash, error = %e, delay_ms = delay.as_millis() as u64,
                        "backend put failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The replay path: enumerate the meta-routed backend and apply
    /// every blob not yet bound. Safe to restart at any point; damaged
    /// blobs are quarantined (logged and skipped) and the scan
    /// continues.
    pub fn scan(&self) -> Result<ScanStats> {
        let req = Request::read(true, &self.host);
        let mut hashes = Vec::new();
        self.router.enumerate(&req, &mut |hash| {
            hashes.push(hash.to_string());
            Ok(())
        })?;
        tracing::info!(blobs = hashes.len(), "meta scan started");

        let mut stats = ScanStats::default();
        for hash in &hashes {
            let mut delay = RETRY_BASE;
            loop {
                match self.apply(&req, hash) {
                    Ok(true) => {
                        stats.applied += 1;
                        break;
                    }
                    Ok(false) => {
                        stats.skipped += 1;
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(%hash, error = %e, delay_ms = delay.as_millis() as u64,
                            "backend read failed during scan, retrying");
                        std::thread::sleep(delay);
                        delay = (delay * 2).min(RETRY_MAX);
                    }
                    Err(e) => {
                        tracing::warn!(%hash, error = %e, "quarantined meta blob");
                        stats.quarantined += 1;
                        break;
                    }
                }
            }
        }
        tracing::info!(applied = stats.applied, skipped = stats.skipped,
            quarantined = stats.quarantined, "meta scan finished");
        Ok(stats)
    }

    /// Apply one meta blob. Returns `Ok(true)` if the record was
    /// replayed, `Ok(false)` if it was already bound.
    pub fn apply(&self, req: &Request, hash: &str) -> Result<bool> {
        let blob = self.router.get(req, hash)?;
        let MetaRecord::Kv(kv) = decode(&blob)?;

        // The hash must survive a re-encode; anything else means the
        // blob or its name is damaged.
        let computed = content_hash_hex(&encode_kv(&kv));
        if computed != hash {
            return Err(Error::IntegrityMismatch {
                hash: hash.to_string(),
                computed,
            });
        }

        if let Some(bound) = self.vkv.get_meta_blob(&kv.key, kv.version)? {
            if bound == hash {
                return Ok(false);
            }
            return Err(Error::MetaBlobRebind {
                key: kv.key_lossy().into_owned(),
                version: kv.version,
            });
        }

        self.vkv.put(&kv)?;
        self.vkv.set_meta_blob(&kv.key, kv.version, hash)?;
        tracing::debug!(key = %kv.key_lossy(), version = kv.version, "meta blob applied");
        Ok(true)
    }
}
