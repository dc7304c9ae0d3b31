//! Filetree extension
//!
//! Files and directories are represented as blobs whose contents are
//! small JSON metadata records ([`Node`]) referencing further blobs:
//! a dir node lists the hashes of its children, a file node references
//! its content chunks. Named roots live in the KV store under
//! `filetree:fs:<name>` keys, so moving a root is one versioned KV
//! write. Assembling file content from chunk references is the
//! file-reader's job, an external collaborator.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};
use crate::kvstore::KvStore;
use crate::router::{Request, Router};

/// KV key prefix for named filesystem roots.
pub const FS_KEY_PREFIX: &str = "filetree:fs:";

/// Default recursion depth for directory resolution.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Node type markers stored in the metadata record.
pub const TYPE_FILE: &str = "file";
pub const TYPE_DIR: &str = "dir";

/// One file or directory metadata record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mode: u32,
    #[serde(rename = "mtime", default)]
    pub mod_time: String,
    /// Hash of the blob holding this record; filled on load, not stored.
    #[serde(rename = "ref", default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    /// Child node hashes (dirs only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<String>,
    /// Resolved children, populated by [`FileTree::fetch_dir`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub xattrs: std::collections::HashMap<String, String>,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.node_type == TYPE_DIR
    }
}

/// A named filesystem root: a mutable name for an immutable tree hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsRoot {
    pub name: String,
    #[serde(rename = "ref")]
    pub hash: String,
}

/// Read-side view of the tree plus root management.
pub struct FileTree {
    kv: KvStore,
    router: Arc<Router>,
    host: String,
    max_depth: usize,
}

impl FileTree {
    pub fn new(kv: KvStore, router: Arc<Router>, host: String) -> Self {
        FileTree {
            kv,
            router,
            host,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Fetch the blob for `hash` and decode it as a node record.
    pub fn node_by_ref(&self, hash: &str) -> Result<Node> {
        let blob = self.router.get(&Request::read(false, &self.host), hash)?;
        let mut node: Node = serde_json::from_slice(&blob)
            .map_err(|e| Error::Corrupted(format!("node record {}: {}", hash, e)))?;
        node.hash = hash.to_string();
        Ok(node)
    }

    /// Resolve a dir node's children, recursively up to the configured
    /// depth. A hash seen twice within one traversal is refused rather
    /// than followed.
    pub fn fetch_dir(&self, node: &mut Node) -> Result<()> {
        let mut visited = HashSet::new();
        if !node.hash.is_empty() {
            visited.insert(node.hash.clone());
        }
        self.fetch_children(node, 1, &mut visited)
    }

    fn fetch_children(
        &self,
        node: &mut Node,
        depth: usize,
        visited: &mut HashSet<String>,
    ) -> Result<()> {
        if depth > self.max_depth || !node.is_dir() {
            return Ok(());
        }
        node.children = Vec::with_capacity(node.refs.len());
        for child_ref in node.refs.clone() {
            if !visited.insert(child_ref.clone()) {
                tracing::warn!(hash = %child_ref, "refusing to revisit node in traversal");
                continue;
            }
            let mut child = self.node_by_ref(&child_ref)?;
            self.fetch_children(&mut child, depth + 1, visited)?;
            node.children.push(child);
        }
        node.children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }

    /// Load a named root.
    pub fn load_fs(&self, name: &str) -> Result<FsRoot> {
        let kv = self.kv.get(&format!("{}{}", FS_KEY_PREFIX, name), -1)?;
        serde_json::from_slice(&kv.data)
            .map_err(|e| Error::Corrupted(format!("fs root {}: {}", name, e)))
    }

    /// List every named root.
    pub fn list_fs(&self) -> Result<Vec<FsRoot>> {
        let (kvs, _) = self
            .kv
            .keys(FS_KEY_PREFIX, &format!("{}\u{ffff}", FS_KEY_PREFIX), 0)?;
        kvs.iter()
            .map(|kv| {
                serde_json::from_slice(&kv.data)
                    .map_err(|e| Error::Corrupted(format!("fs root record: {}", e)))
            })
            .collect()
    }

    /// Point a named root at a new tree hash. Past roots stay readable
    /// through KV version history.
    pub async fn mutate_fs(&self, name: &str, hash: &str) -> Result<FsRoot> {
        let root = FsRoot {
            name: name.to_string(),
            hash: hash.to_string(),
        };
        let data = serde_json::to_vec(&root)
            .map_err(|e| Error::Corrupted(format!("fs root encode: {}", e)))?;
        self.kv
            .put(
                &format!("{}{}", FS_KEY_PREFIX, name),
                &data,
                0,
                Some(hash),
            )
            .await?;
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_record_roundtrip() {
        let node = Node {
            name: "docs".into(),
            node_type: TYPE_DIR.into(),
            size: 0,
            mode: 0o755,
            mod_time: "2016-06-01T10:00:00Z".into(),
            refs: vec!["ab".repeat(20), "cd".repeat(20)],
            ..Default::default()
        };
        let encoded = serde_json::to_vec(&node).unwrap();
        let decoded: Node = serde_json::from_slice(&encoded).unwrap();
        assert!(decoded.is_dir());
        assert_eq!(decoded.refs.len(), 2);
        assert_eq!(decoded.name, "docs");
        // The blob hash is attached on load, never serialized.
        assert!(decoded.hash.is_empty());
    }

    #[test]
    fn test_fs_root_record_shape() {
        let root = FsRoot {
            name: "home".into(),
            hash: "ab".repeat(20),
        };
        let v: serde_json::Value = serde_json::to_value(&root).unwrap();
        assert_eq!(v["name"], "home");
        assert_eq!(v["ref"], serde_json::Value::String("ab".repeat(20)));
    }
}
