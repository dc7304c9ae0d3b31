//! Common utilities and types shared across blobkv

pub mod config;
pub mod error;
pub mod hash;

pub use config::{BackendConfig, Config, PredicateConfig, RuleConfig};
pub use error::{Error, Result};
pub use hash::{blob_prefix, content_hash, content_hash_hex, is_valid_hash, lock_slot};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current UTC time in nanoseconds, the native resolution of VKV
/// versions.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_nanos() as i64
}
