//! Content addressing for blobkv
//!
//! Every blob is identified by the lowercase hex of its SHA-1 digest
//! (20 bytes, 40 hex chars). The same digest drives slot selection for
//! the versioned KV's slotted mutex and the fan-out directory layout of
//! the filesystem backend.

use sha1::{Digest, Sha1};

/// Digest width in bytes.
pub const HASH_LEN: usize = 20;

/// Digest width in hex characters.
pub const HASH_HEX_LEN: usize = 40;

/// Compute the content hash of `data`.
pub fn content_hash(data: &[u8]) -> [u8; HASH_LEN] {
    let digest = Sha1::digest(data);
    digest.into()
}

/// Compute the content hash of `data`, as lowercase hex.
pub fn content_hash_hex(data: &[u8]) -> String {
    hex::encode(content_hash(data))
}

/// Check that `s` is a well-formed blob hash (40 lowercase hex chars).
pub fn is_valid_hash(s: &str) -> bool {
    s.len() == HASH_HEX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Map a key to a mutex slot index in `[0, slots)`.
///
/// `slots` must be a power of two.
pub fn lock_slot(key: &[u8], slots: usize) -> usize {
    debug_assert!(slots.is_power_of_two());
    let digest = content_hash(key);
    let word = u64::from_be_bytes(digest[0..8].try_into().unwrap());
    (word as usize) & (slots - 1)
}

/// Two-level directory prefix for filesystem blob storage.
///
/// Returns the first two hex pairs of the hash, giving a balanced tree:
/// `<root>/aa/bb/<hash>.blob`.
pub fn blob_prefix(hash: &str) -> (&str, &str) {
    (&hash[0..2], &hash[2..4])
}
