//! Sort-index engine
//!
//! Maintains an ordered secondary index over documents, keyed on one
//! extracted field, on top of a dedicated versioned KV store. Two key
//! spaces coexist:
//!
//! - forward keys `"k:" ‖ encoded-field ‖ 6 random bytes` →
//!   `be64(start-version) ‖ raw-id`, versioned: the entry is
//!   authoritative while its start version equals its stored version;
//!   a later write rewrites it at the newer version, turning it into a
//!   tombstone for as-of reads;
//! - last-version pointers `"v:" ‖ raw-id` → current forward key.
//!
//! Iteration walks forward keys in reverse (descending field order) and
//! filters by the requested point in time.

use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde_json::Value;

use crate::common::{Error, Result};
use crate::vkv::{KeyValue, VkvStore};

use super::id::{DocId, FLAG_DELETED, RAW_LEN};

/// Sentinel field name indexing documents by their update time.
pub const UPDATED_FIELD: &str = "_updated";

const FORWARD_PREFIX: &[u8] = b"k:";
const POINTER_PREFIX: &[u8] = b"v:";

/// Random suffix width on forward keys, avoiding collisions between
/// documents with equal field values.
const SUFFIX_LEN: usize = 6;

/// The seam a document store drives: every mutation goes through
/// `index`, pagination through `iter`.
pub trait Indexer: Send + Sync {
    fn index(&self, id: &DocId, doc: &serde_json::Map<String, Value>) -> Result<()>;

    fn iter(
        &self,
        collection: &str,
        cursor: &str,
        fetch_limit: usize,
        as_of: i64,
    ) -> Result<(Vec<DocId>, String)>;

    fn close(&self) -> Result<()>;
}

/// Single-field sort index backed by its own VKV store.
pub struct SortIndex {
    db: VkvStore,
    name: String,
    fields: Vec<String>,
}

fn build_val(start: i64, id: &DocId) -> Vec<u8> {
    let mut v = Vec::with_capacity(8 + RAW_LEN);
    v.extend_from_slice(&(start as u64).to_be_bytes());
    v.extend_from_slice(id.raw());
    v
}

fn parse_val(d: &[u8]) -> Result<(i64, DocId)> {
    if d.len() != 8 + RAW_LEN {
        return Err(Error::Corrupted(format!(
            "index entry is {} bytes, want {}",
            d.len(),
            8 + RAW_LEN
        )));
    }
    let start = u64::from_be_bytes(d[0..8].try_into().unwrap()) as i64;
    Ok((start, DocId::from_raw(&d[8..])?))
}

/// Order-preserving big-endian encoding of an integer sort value.
/// Flipping the sign bit maps `i64::MIN..=i64::MAX` onto
/// `0..=u64::MAX`, so negatives sort before non-negatives.
fn int_sort_bits(v: i64) -> u64 {
    (v as u64) ^ (1 << 63)
}

/// IEEE-754 total-order transform: negatives flip entirely, others flip
/// the sign bit.
fn float_sort_bits(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits ^ (1 << 63)
    }
}

fn build_u64_key(bits: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(2 + 8 + SUFFIX_LEN);
    k.extend_from_slice(FORWARD_PREFIX);
    k.extend_from_slice(&bits.to_be_bytes());
    k
}

/// Build a forward key for a document's sort value. The caller-visible
/// order of the index is the byte order of these keys.
fn build_key(v: &Value) -> Result<Vec<u8>> {
    let mut k = match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                build_u64_key(int_sort_bits(i))
            } else if let Some(u) = n.as_u64() {
                build_u64_key(int_sort_bits(i64::try_from(u).map_err(|_| {
                    Error::UnsupportedSortValue(format!("integer out of range: {}", u))
                })?))
            } else {
                // as_f64 on a JSON number never fails
                build_u64_key(float_sort_bits(n.as_f64().unwrap()))
            }
        }
        Value::String(s) => {
            let mut k = Vec::with_capacity(2 + s.len() + 1 + SUFFIX_LEN);
            k.extend_from_slice(FORWARD_PREFIX);
            k.extend_from_slice(s.as_bytes());
            k.push(b':');
            k
        }
        other => {
            return Err(Error::UnsupportedSortValue(format!(
                "cannot index a {} value",
                json_type(other)
            )))
        }
    };
    let mut suffix = [0u8; SUFFIX_LEN];
    rand::thread_rng().fill_bytes(&mut suffix);
    k.extend_from_slice(&suffix);
    Ok(k)
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn last_version_key(id: &DocId) -> Vec<u8> {
    let mut k = Vec::with_capacity(2 + RAW_LEN);
    k.extend_from_slice(POINTER_PREFIX);
    k.extend_from_slice(id.raw());
    k
}

impl SortIndex {
    /// Open or create the index `name` over `fields` under `dir`. The
    /// store lives at `dir/docstore_<name>.index`.
    pub fn open(dir: impl AsRef<Path>, name: &str, fields: &[&str]) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::InvalidConfig("sort index needs a field".into()));
        }
        let db = VkvStore::open(dir.as_ref().join(format!("docstore_{}.index", name)))?;
        Ok(SortIndex {
            db,
            name: name.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn sort_value(&self, id: &DocId, doc: &serde_json::Map<String, Value>) -> Result<Value> {
        let field = &self.fields[0];
        if field == UPDATED_FIELD {
            return Ok(Value::from(id.version()));
        }
        doc.get(field).cloned().ok_or_else(|| {
            Error::UnsupportedSortValue(format!("document has no {:?} field", field))
        })
    }
}

impl Indexer for SortIndex {
    /// Apply one document mutation to the index.
    fn index(&self, id: &DocId, doc: &serde_json::Map<String, Value>) -> Result<()> {
        let pointer_key = last_version_key(id);
        match self.db.get(&pointer_key, -1) {
            Ok(pointer) => {
                // A previous entry exists: rewrite it at the new version
                // so it stops being authoritative (tombstone).
                let old = self.db.get(&pointer.data, -1)?;
                if !old.data.is_empty() {
                    let (_, old_id) = parse_val(&old.data)?;
                    if old_id.raw() != id.raw() {
                        return Err(Error::Corrupted(format!(
                            "index pointer for {} resolves to {}",
                            id, old_id
                        )));
                    }
                    self.db.put(&KeyValue::new(
                        pointer.data.clone(),
                        id.version(),
                        old.data.clone(),
                        None,
                    ))?;
                }
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if id.flag() == FLAG_DELETED {
            return Ok(());
        }

        let sort_key = build_key(&self.sort_value(id, doc)?)?;
        self.db.put(&KeyValue::new(
            sort_key.clone(),
            id.version(),
            build_val(id.version(), id),
            None,
        ))?;
        self.db
            .put(&KeyValue::new(pointer_key, 0, sort_key, None))?;
        Ok(())
    }

    /// Walk the index in descending field order, returning ids visible
    /// at `as_of` (`0` = latest) plus a continuation cursor.
    fn iter(
        &self,
        _collection: &str,
        cursor: &str,
        fetch_limit: usize,
        as_of: i64,
    ) -> Result<(Vec<DocId>, String)> {
        let start: Vec<u8> = if cursor.is_empty() {
            // Above any real forward key.
            let mut s = FORWARD_PREFIX.to_vec();
            s.push(0xff);
            s
        } else {
            URL_SAFE_NO_PAD
                .decode(cursor)
                .map_err(|_| Error::Corrupted("malformed index cursor".into()))?
        };

        let (entries, next) = self.db.reverse_keys(&start, FORWARD_PREFIX, fetch_limit)?;

        let mut ids = Vec::new();
        for entry in entries {
            if entry.data.is_empty() {
                continue;
            }
            let (start_version, mut id) = parse_val(&entry.data)?;

            if as_of == 0 && start_version != entry.version {
                // Superseded entry; only the authoritative one counts.
                continue;
            }
            if as_of > 0 {
                let live_now = start_version == entry.version && as_of >= start_version;
                let live_then = entry.version > start_version
                    && as_of >= start_version
                    && as_of < entry.version;
                if !live_now && !live_then {
                    continue;
                }
            }

            id.set_version(start_version);
            id.set_cursor(URL_SAFE_NO_PAD.encode(&entry.key));
            ids.push(id);
        }

        let next_cursor = next
            .map(|c| URL_SAFE_NO_PAD.encode(c))
            .unwrap_or_default();
        Ok((ids, next_cursor))
    }

    fn close(&self) -> Result<()> {
        self.db.close()
    }
}
