//! Pluggable blob backends
//!
//! A backend is an opaque hash → bytes store. It never interprets blob
//! contents and never deletes; the only polymorphic surface of the crate
//! is this trait. Backends must be safe for concurrent use.

pub mod fs;
pub mod memory;

use std::path::Path;
use std::sync::Arc;

use crate::common::{BackendConfig, Error, Result};

pub use fs::FsBackend;
pub use memory::MemoryBackend;

/// Sink for [`BlobBackend::enumerate`]. Called once per stored hash;
/// returning an error aborts the enumeration.
pub type EnumerateSink<'a> = dyn FnMut(&str) -> Result<()> + 'a;

/// Capability set of a blob backend.
pub trait BlobBackend: Send + Sync {
    /// Store `data` under `hash`. Idempotent: repeat writes of the same
    /// hash succeed silently.
    fn put(&self, hash: &str, data: &[u8]) -> Result<()>;

    /// Fetch the blob for `hash`, or [`Error::BlobNotFound`].
    fn get(&self, hash: &str) -> Result<Vec<u8>>;

    /// Does a blob with this hash exist?
    fn exists(&self, hash: &str) -> Result<bool>;

    /// Stream every stored hash exactly once to `sink`, in any order.
    /// Completion is the call returning.
    fn enumerate(&self, sink: &mut EnumerateSink<'_>) -> Result<()>;

    /// Checkpoint barrier: upon successful return, every prior
    /// successful `put` is durable.
    fn done(&self) -> Result<()>;

    /// Release handles. Any later call on this backend is
    /// [`Error::BackendClosed`].
    fn close(&self) -> Result<()>;
}

/// Build a backend from its configuration entry.
///
/// `filesystem` backends live in a subdirectory of `data_dir` named by
/// the `path` argument (defaulting to the backend's own name).
pub fn from_config(
    name: &str,
    conf: &BackendConfig,
    data_dir: &Path,
) -> Result<Arc<dyn BlobBackend>> {
    match conf.backend_type.as_str() {
        "in-memory" => Ok(Arc::new(MemoryBackend::new())),
        "filesystem" => {
            let sub = conf
                .backend_args
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or(name);
            Ok(Arc::new(FsBackend::open(data_dir.join(sub))?))
        }
        other => Err(Error::InvalidConfig(format!(
            "unknown backend-type {:?} for backend {:?}",
            other, name
        ))),
    }
}
