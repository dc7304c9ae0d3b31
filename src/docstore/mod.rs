//! Versioned document indexing
//!
//! The document store itself (JSON bodies, collections, HTTP surface)
//! is an external collaborator; what lives here is the part it drives:
//! opaque document ids and the sort-index engine that keeps secondary
//! indexes consistent across versioned updates, deletions, and
//! point-in-time reads.

pub mod id;
pub mod index;

pub use id::{DocId, FLAG_DELETED, FLAG_NOOP};
pub use index::{Indexer, SortIndex, UPDATED_FIELD};
