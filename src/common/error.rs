//! Error types for blobkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O and storage engine ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Db(#[from] sled::Error),

    // === Versioned KV ===
    #[error("key or version not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("version conflict: {key}@{version} already holds a different payload")]
    VersionConflict { key: String, version: i64 },

    #[error("meta blob for {key}@{version} is already bound to a different hash")]
    MetaBlobRebind { key: String, version: i64 },

    // === Blobs and backends ===
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("backend I/O error: {0}")]
    BackendIo(String),

    #[error("backend is closed")]
    BackendClosed,

    #[error("backend {0} is not registered")]
    UnknownBackend(String),

    // === Routing and configuration ===
    #[error("bad routing rule: {0}")]
    BadRule(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === Meta blobs ===
    #[error("unknown meta blob type: {0}")]
    BadMetaType(String),

    #[error("meta blob integrity mismatch: stored {hash}, computed {computed}")]
    IntegrityMismatch { hash: String, computed: String },

    // === Encoding ===
    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("unsupported sort value: {0}")]
    UnsupportedSortValue(String),
}

impl Error {
    /// Is this error worth retrying on the background replay path?
    ///
    /// `NotFound` is never retryable; neither are configuration or
    /// encoding errors, which deterministically recur.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::BackendIo(_))
    }

    /// True for both flavors of absence (KV record or blob).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::BlobNotFound(_))
    }
}
