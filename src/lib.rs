//! # blobkv
//!
//! A content-addressed blob store with a versioned key-value overlay:
//! - Immutable blobs addressed by the hex of their content hash, stored
//!   on pluggable backends behind a rule-driven router
//! - A versioned KV store: per-key monotonic versions, as-of reads,
//!   forward/reverse range scans with opaque cursors
//! - A meta-blob bridge that encodes every KV mutation as a
//!   self-describing blob, so the KV state can be rebuilt by replaying
//!   blobs after a crash or on a fresh machine
//! - A sort-index engine maintaining versioned secondary indexes over
//!   documents, with point-in-time queries
//!
//! ## Architecture
//!
//! ```text
//!             ┌────────────┐   updates    ┌─────────────┐
//!  caller ───▶│  KvStore   │─────────────▶│ MetaBridge  │
//!             └─────┬──────┘  (channel)   └──────┬──────┘
//!                   │                            │ meta blobs
//!             ┌─────▼──────┐               ┌─────▼──────┐
//!             │  VkvStore  │               │   Router   │
//!             │   (sled)   │               └─────┬──────┘
//!             └────────────┘          ┌──────────┴─────────┐
//!                                ┌────▼─────┐        ┌─────▼────┐
//!                                │ FsBackend│        │ Memory…  │
//!                                └──────────┘        └──────────┘
//! ```
//!
//! On startup the [`Server`] replays every meta blob the router can
//! enumerate; replay is idempotent, so restarting it mid-way is safe.

pub mod backend;
pub mod common;
pub mod docstore;
pub mod filetree;
pub mod kvstore;
pub mod meta;
pub mod router;
pub mod server;
pub mod vkv;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use kvstore::KvStore;
pub use server::Server;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
