//! Integration tests for blobkv

use std::sync::Arc;

use blobkv::common::{BackendConfig, Config, PredicateConfig, RuleConfig};
use blobkv::vkv::{KeyValue, VkvStore};
use blobkv::{Error, Server};
use tempfile::TempDir;

fn fs_backend(path: &str) -> BackendConfig {
    let mut args = serde_json::Map::new();
    args.insert("path".to_string(), serde_json::Value::String(path.into()));
    BackendConfig {
        backend_type: "filesystem".to_string(),
        backend_args: args,
    }
}

/// Meta blobs on one filesystem backend, everything else on another.
fn routed_config() -> Config {
    let mut config = Config::single_memory_backend();
    config.backends.clear();
    config
        .backends
        .insert("blobs".to_string(), fs_backend("blobs"));
    config
        .backends
        .insert("metadb".to_string(), fs_backend("metadb"));
    config.router = vec![
        RuleConfig(
            PredicateConfig::One("if-meta".to_string()),
            "metadb".to_string(),
        ),
        RuleConfig(
            PredicateConfig::One("default".to_string()),
            "blobs".to_string(),
        ),
    ];
    config
}

fn count_blob_files(dir: &std::path::Path) -> usize {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("blob") {
                count += 1;
            }
        }
    }
    count
}

#[tokio::test]
async fn test_single_key_versioning() {
    let dir = TempDir::new().unwrap();
    let server = Server::open(Config::single_memory_backend(), dir.path())
        .await
        .unwrap();
    let kv = server.kv();

    kv.put("a", b"x", 1, None).await.unwrap();
    kv.put("a", b"y", 2, None).await.unwrap();

    let latest = kv.get("a", 0).unwrap();
    assert_eq!((latest.version, latest.data.as_slice()), (2, &b"y"[..]));
    let v1 = kv.get("a", 1).unwrap();
    assert_eq!((v1.version, v1.data.as_slice()), (1, &b"x"[..]));
    let v3 = kv.get("a", 3).unwrap();
    assert_eq!((v3.version, v3.data.as_slice()), (2, &b"y"[..]));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_boundary_behaviors() {
    let dir = TempDir::new().unwrap();
    let server = Server::open(Config::single_memory_backend(), dir.path())
        .await
        .unwrap();
    let kv = server.kv();

    // Never-written key.
    assert!(matches!(kv.get("ghost", 0), Err(Error::NotFound(_))));

    // Idempotent re-put of the same (key, version, data, ref).
    kv.put("a", b"x", 1, None).await.unwrap();
    kv.put("a", b"x", 1, None).await.unwrap();
    let (versions, _) = kv.versions("a", 0, 0, 0).unwrap();
    assert_eq!(versions.len(), 1);

    // Same version, different payload.
    assert!(matches!(
        kv.put("a", b"other", 1, None).await,
        Err(Error::VersionConflict { .. })
    ));

    // Empty range scans come back empty with empty cursors.
    let (kvs, cursor) = kv.keys("zzz", "aaa", 0).unwrap();
    assert!(kvs.is_empty());
    assert!(cursor.is_empty());

    // limit = 0 returns all.
    kv.put("b", b"y", 1, None).await.unwrap();
    let (kvs, cursor) = kv.keys("", "\u{10FFFF}", 0).unwrap();
    assert_eq!(kvs.len(), 2);
    assert!(cursor.is_empty());

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_cursor_completeness_forward_and_reverse() {
    let dir = TempDir::new().unwrap();
    let server = Server::open(Config::single_memory_backend(), dir.path())
        .await
        .unwrap();
    let kv = server.kv();

    for i in 0..37 {
        kv.put(&format!("key-{:02}", i), b"v", 1, None).await.unwrap();
    }

    for limit in [1, 2, 5, 36, 37, 100] {
        // Forward.
        let mut seen = Vec::new();
        let mut start = String::new();
        loop {
            let (kvs, cursor) = kv.keys(&start, "\u{10FFFF}", limit).unwrap();
            seen.extend(kvs.into_iter().map(|kv| kv.key));
            if cursor.is_empty() {
                break;
            }
            start = cursor;
        }
        assert_eq!(seen.len(), 37, "forward, limit {}", limit);
        let mut dedup = seen.clone();
        dedup.dedup();
        assert_eq!(dedup.len(), 37, "forward repeats, limit {}", limit);

        // Reverse.
        let mut seen = Vec::new();
        let mut start = "\u{10FFFF}".to_string();
        loop {
            let (kvs, cursor) = kv.reverse_keys(&start, "", limit).unwrap();
            seen.extend(kvs.into_iter().map(|kv| kv.key));
            if cursor.is_empty() {
                break;
            }
            start = cursor;
        }
        assert_eq!(seen.len(), 37, "reverse, limit {}", limit);
        for pair in seen.windows(2) {
            assert!(pair[0] > pair[1], "reverse order, limit {}", limit);
        }
    }

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_meta_and_data_blobs_route_to_distinct_backends() {
    let dir = TempDir::new().unwrap();
    let mut server = Server::open(routed_config(), dir.path()).await.unwrap();
    server.wait_replay().await.unwrap();

    let data_hash = server.put_blob(b"file content").unwrap();
    assert!(server.blob_exists(&data_hash).unwrap());
    server.kv().put("doc", b"meta", 1, None).await.unwrap();
    server.close().await.unwrap();

    // The data blob landed on the default backend, the meta blob on the
    // if-meta backend.
    assert_eq!(count_blob_files(&dir.path().join("blobs")), 1);
    assert_eq!(count_blob_files(&dir.path().join("metadb")), 1);
}

#[tokio::test]
async fn test_kv_put_binds_meta_blob_hash() {
    let dir = TempDir::new().unwrap();
    let server = Server::open(Config::single_memory_backend(), dir.path())
        .await
        .unwrap();
    let stored = server.kv().put("bound", b"x", 7, None).await.unwrap();

    // The binding is written by the bridge watcher; closing drains it.
    server.close().await.unwrap();

    let vkv = VkvStore::open(dir.path().join("vkv")).unwrap();
    let bound = vkv.get_meta_blob(b"bound", stored.version).unwrap();
    assert!(bound.is_some());
    assert_eq!(bound.unwrap().len(), 40);
}

#[test]
fn test_slot_lock_concurrent_writers_same_key() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(VkvStore::open(dir.path().join("vkv")).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|writer| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..1000i64 {
                    let version = (writer as i64) * 1000 + i + 1;
                    store
                        .put(&KeyValue::new(
                            b"hot".to_vec(),
                            version,
                            version.to_string().into_bytes(),
                            None,
                        ))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Exactly 8,000 versions: no duplicates, no gaps.
    let (versions, cursor) = store.versions(b"hot", 1, 8000, 0).unwrap();
    assert!(cursor.is_none());
    assert_eq!(versions.len(), 8000);
    for (i, kv) in versions.iter().enumerate() {
        assert_eq!(kv.version, 8000 - i as i64);
        assert_eq!(kv.data, kv.version.to_string().into_bytes());
    }
}
