//! Composite-key and value encoding for the versioned KV
//!
//! Key-space layout: `key ‖ 0x00 ‖ be64(!version)`. The bitwise
//! complement makes the newest version of a key sort first, so a
//! forward prefix scan yields versions newest-to-oldest and the first
//! entry is the latest. Meta-space keys use the plain version:
//! `key ‖ 0x00 ‖ be64(version)`.
//!
//! Values carry the record payload: `flag(1) ‖ ref(20, if flag) ‖ data`.

use crate::common::{hash::HASH_LEN, Error, Result};

/// Separator between key bytes and the version suffix.
pub const KEY_SEP: u8 = 0x00;

/// Suffix width: separator + big-endian u64.
const SUFFIX_LEN: usize = 9;

/// Key-space composite key for `(key, version)`.
pub fn kv_key(key: &[u8], version: i64) -> Vec<u8> {
    let mut k = Vec::with_capacity(key.len() + SUFFIX_LEN);
    k.extend_from_slice(key);
    k.push(KEY_SEP);
    k.extend_from_slice(&(!(version as u64)).to_be_bytes());
    k
}

/// Meta-space composite key for `(key, version)`.
pub fn meta_key(key: &[u8], version: i64) -> Vec<u8> {
    let mut k = Vec::with_capacity(key.len() + SUFFIX_LEN);
    k.extend_from_slice(key);
    k.push(KEY_SEP);
    k.extend_from_slice(&(version as u64).to_be_bytes());
    k
}

/// Prefix covering every version of `key` in the key-space.
pub fn key_prefix(key: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(key.len() + 1);
    k.extend_from_slice(key);
    k.push(KEY_SEP);
    k
}

/// Exclusive upper bound of [`key_prefix`] for range scans.
pub fn key_prefix_end(key: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(key.len() + 1);
    k.extend_from_slice(key);
    k.push(KEY_SEP + 1);
    k
}

/// Split a key-space composite back into `(key, version)`.
pub fn split_kv_key(composite: &[u8]) -> Result<(&[u8], i64)> {
    let (key, raw) = split_suffix(composite)?;
    Ok((key, !raw as i64))
}

/// Split a meta-space composite back into `(key, version)`.
pub fn split_meta_key(composite: &[u8]) -> Result<(&[u8], i64)> {
    let (key, raw) = split_suffix(composite)?;
    Ok((key, raw as i64))
}

fn split_suffix(composite: &[u8]) -> Result<(&[u8], u64)> {
    if composite.len() < SUFFIX_LEN {
        return Err(Error::Corrupted("composite key too short".into()));
    }
    let (head, tail) = composite.split_at(composite.len() - 8);
    let (key, sep) = head.split_at(head.len() - 1);
    if sep[0] != KEY_SEP {
        return Err(Error::Corrupted("composite key missing separator".into()));
    }
    Ok((key, u64::from_be_bytes(tail.try_into().unwrap())))
}

/// The smallest key strictly greater than `key`; used as the forward
/// continuation cursor.
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(key.len() + 1);
    k.extend_from_slice(key);
    k.push(0x00);
    k
}

/// Encode a record value.
pub fn encode_value(data: &[u8], ref_hash: Option<&str>) -> Result<Vec<u8>> {
    let mut v = Vec::with_capacity(1 + HASH_LEN + data.len());
    match ref_hash {
        Some(r) => {
            let raw = hex::decode(r)
                .map_err(|_| Error::Corrupted(format!("ref is not hex: {:?}", r)))?;
            if raw.len() != HASH_LEN {
                return Err(Error::Corrupted(format!(
                    "ref digest is {} bytes, want {}",
                    raw.len(),
                    HASH_LEN
                )));
            }
            v.push(1);
            v.extend_from_slice(&raw);
        }
        None => v.push(0),
    }
    v.extend_from_slice(data);
    Ok(v)
}

/// Decode a record value into `(data, ref)`.
pub fn decode_value(raw: &[u8]) -> Result<(Vec<u8>, Option<String>)> {
    match raw.split_first() {
        Some((0, data)) => Ok((data.to_vec(), None)),
        Some((1, rest)) => {
            if rest.len() < HASH_LEN {
                return Err(Error::Corrupted("value too short for ref digest".into()));
            }
            let (digest, data) = rest.split_at(HASH_LEN);
            Ok((data.to_vec(), Some(hex::encode(digest))))
        }
        Some((flag, _)) => Err(Error::Corrupted(format!("unknown value flag {}", flag))),
        None => Err(Error::Corrupted("empty record value".into())),
    }
}
