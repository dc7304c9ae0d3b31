//! Document identifiers
//!
//! A `DocId` is 12 opaque bytes minted once per document: a big-endian
//! creation timestamp (seconds) followed by 8 random bytes. The raw
//! bytes never change across mutations — the sort-index keys its
//! last-version pointers on them. The mutation version, the flag byte
//! (with a distinguished "deleted" value) and an optional pagination
//! cursor ride alongside the raw bytes and are set per event.

use rand::RngCore;

use crate::common::{Error, Result};

/// Plain document write.
pub const FLAG_NOOP: u8 = 0;

/// The document was deleted at this version.
pub const FLAG_DELETED: u8 = 1;

/// Raw width in bytes.
pub const RAW_LEN: usize = 12;

/// A document identity plus the metadata of one mutation of it.
#[derive(Debug, Clone)]
pub struct DocId {
    raw: [u8; RAW_LEN],
    version: i64,
    flag: u8,
    cursor: Option<String>,
}

impl DocId {
    /// Mint a fresh id for a document created at `created_secs` (unix
    /// seconds).
    pub fn new(created_secs: u32) -> Self {
        let mut raw = [0u8; RAW_LEN];
        raw[0..4].copy_from_slice(&created_secs.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut raw[4..]);
        DocId {
            raw,
            version: 0,
            flag: FLAG_NOOP,
            cursor: None,
        }
    }

    /// Rebuild an id from its raw bytes.
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        let raw: [u8; RAW_LEN] = raw.try_into().map_err(|_| {
            Error::Corrupted(format!("doc id is {} bytes, want {}", raw.len(), RAW_LEN))
        })?;
        Ok(DocId {
            raw,
            version: 0,
            flag: FLAG_NOOP,
            cursor: None,
        })
    }

    pub fn raw(&self) -> &[u8; RAW_LEN] {
        &self.raw
    }

    /// Creation time embedded in the raw bytes (unix seconds).
    pub fn created_secs(&self) -> u32 {
        u32::from_be_bytes(self.raw[0..4].try_into().unwrap())
    }

    /// The version of the mutation this id describes.
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn flag(&self) -> u8 {
        self.flag
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flag = flag;
    }

    pub fn with_flag(mut self, flag: u8) -> Self {
        self.flag = flag;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.flag == FLAG_DELETED
    }

    /// Attach a pagination cursor for page-by-page hand-off.
    pub fn set_cursor(&mut self, cursor: String) {
        self.cursor = Some(cursor);
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.raw)
    }
}

// Identity is the raw bytes alone; version, flag and cursor are
// per-mutation attachments.
impl PartialEq for DocId {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for DocId {}

impl std::hash::Hash for DocId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_embeds_creation_time() {
        let id = DocId::new(1_465_000_000);
        assert_eq!(id.created_secs(), 1_465_000_000);
        assert_eq!(id.flag(), FLAG_NOOP);
        assert!(!id.is_deleted());
        assert_eq!(id.version(), 0);
    }

    #[test]
    fn test_raw_is_stable_across_mutations() {
        let created = DocId::new(100).with_version(1);
        let updated = created.clone().with_version(2);
        let deleted = created.clone().with_version(3).with_flag(FLAG_DELETED);
        assert_eq!(created.raw(), updated.raw());
        assert_eq!(created.raw(), deleted.raw());
        assert_eq!(created, deleted);
        assert!(deleted.is_deleted());
        assert_eq!(deleted.version(), 3);
    }

    #[test]
    fn test_raw_roundtrip() {
        let id = DocId::new(42).with_version(7);
        let back = DocId::from_raw(id.raw()).unwrap();
        assert_eq!(back.raw(), id.raw());
        assert_eq!(back.created_secs(), 42);
        // version is a transient attachment, not part of the raw bytes
        assert_eq!(back.version(), 0);
    }

    #[test]
    fn test_from_raw_rejects_wrong_width() {
        assert!(DocId::from_raw(&[0u8; 11]).is_err());
        assert!(DocId::from_raw(&[0u8; 13]).is_err());
    }

    #[test]
    fn test_same_second_ids_are_distinct() {
        let a = DocId::new(1);
        let b = DocId::new(1);
        // 8 random bytes; a collision here means a broken RNG.
        assert_ne!(a.raw(), b.raw());
    }
}
