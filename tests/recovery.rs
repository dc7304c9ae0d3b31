//! Crash-recovery and replay tests
//!
//! The bridge must be able to rebuild a wiped KV store from nothing but
//! the meta blobs sitting on a backend, in any order, any number of
//! times.

use std::sync::Arc;

use blobkv::backend::MemoryBackend;
use blobkv::common::{content_hash_hex, BackendConfig, Config, PredicateConfig, RuleConfig};
use blobkv::meta::{self, MetaBridge};
use blobkv::router::{Request, Router};
use blobkv::vkv::{KeyValue, VkvStore};
use blobkv::Server;
use tempfile::TempDir;

fn default_rules() -> Vec<RuleConfig> {
    vec![RuleConfig(
        PredicateConfig::One("default".to_string()),
        "blobs".to_string(),
    )]
}

/// A bridge over a fresh vkv and a single in-memory backend.
fn bridge_fixture(dir: &TempDir) -> (Arc<VkvStore>, Arc<Router>, MetaBridge) {
    let vkv = Arc::new(VkvStore::open(dir.path().join("vkv")).unwrap());
    let mut router = Router::from_config(&default_rules()).unwrap();
    router.register("blobs", Arc::new(MemoryBackend::new()));
    let router = Arc::new(router);
    let bridge = MetaBridge::new(vkv.clone(), router.clone(), String::new());
    (vkv, router, bridge)
}

/// Write `(key_i, version=i, data=str(i))` for i in 1..=n and ship the
/// meta blob for each, the way the bridge's write path does.
fn seed_records(vkv: &VkvStore, router: &Router, n: usize) -> Vec<String> {
    let mut hashes = Vec::with_capacity(n);
    for i in 1..=n {
        let record = KeyValue::new(
            format!("key_{:03}", i).into_bytes(),
            i as i64,
            i.to_string().into_bytes(),
            None,
        );
        let stored = vkv.put(&record).unwrap();
        let encoded = meta::encode_kv(&stored);
        let hash = content_hash_hex(&encoded);
        vkv.set_meta_blob(&stored.key, stored.version, &hash)
            .unwrap();
        router
            .put(&Request::write(true, ""), &hash, &encoded)
            .unwrap();
        hashes.push(hash);
    }
    hashes
}

fn assert_seeded_state(vkv: &VkvStore, n: usize) {
    let (kvs, cursor) = vkv.keys(b"", b"\xff", 0).unwrap();
    assert!(cursor.is_none());
    assert_eq!(kvs.len(), n);
    for (i, kv) in kvs.iter().enumerate() {
        let expected = i + 1;
        assert_eq!(kv.key, format!("key_{:03}", expected).into_bytes());
        assert_eq!(kv.version, expected as i64);
        assert_eq!(kv.data, expected.to_string().into_bytes());
    }
}

#[test]
fn test_replay_in_reverse_order_rebuilds_state() {
    let dir = TempDir::new().unwrap();
    let (vkv, router, bridge) = bridge_fixture(&dir);
    seed_records(&vkv, &router, 100);

    // Enumerate what the backend actually holds, then wipe the KV.
    let req = Request::read(true, "");
    let mut hashes = Vec::new();
    router
        .enumerate(&req, &mut |h| {
            hashes.push(h.to_string());
            Ok(())
        })
        .unwrap();
    assert_eq!(hashes.len(), 100);
    vkv.clear().unwrap();

    hashes.sort();
    hashes.reverse();
    for hash in &hashes {
        assert!(bridge.apply(&req, hash).unwrap());
    }
    assert_seeded_state(&vkv, 100);
}

#[test]
fn test_replay_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (vkv, router, bridge) = bridge_fixture(&dir);
    let hashes = seed_records(&vkv, &router, 20);

    // Every record is already bound: replaying any subset, in any
    // order, any number of times, changes nothing.
    let req = Request::read(true, "");
    for hash in hashes.iter().rev().step_by(3) {
        assert!(!bridge.apply(&req, hash).unwrap());
        assert!(!bridge.apply(&req, hash).unwrap());
    }
    assert_seeded_state(&vkv, 20);

    let stats = bridge.scan().unwrap();
    assert_eq!(stats.applied, 0);
    assert_eq!(stats.skipped, 20);
    assert_eq!(stats.quarantined, 0);
    assert_seeded_state(&vkv, 20);
}

#[test]
fn test_scan_quarantines_damaged_blobs() {
    let dir = TempDir::new().unwrap();
    let (vkv, router, bridge) = bridge_fixture(&dir);
    seed_records(&vkv, &router, 3);
    vkv.clear().unwrap();

    let write = Request::write(true, "");
    // A meta blob stored under the wrong name: integrity mismatch.
    let stray = meta::encode_kv(&KeyValue::new(b"stray".to_vec(), 9, b"x".to_vec(), None));
    router
        .put(&write, &content_hash_hex(b"not the encoding"), &stray)
        .unwrap();
    // A blob with an unknown type tag.
    let unknown = b"\x04node{}".to_vec();
    router
        .put(&write, &content_hash_hex(&unknown), &unknown)
        .unwrap();

    let stats = bridge.scan().unwrap();
    assert_eq!(stats.applied, 3);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.quarantined, 2);
    assert_seeded_state(&vkv, 3);
}

fn fs_backend(path: &str) -> BackendConfig {
    let mut args = serde_json::Map::new();
    args.insert("path".to_string(), serde_json::Value::String(path.into()));
    BackendConfig {
        backend_type: "filesystem".to_string(),
        backend_args: args,
    }
}

fn persistent_config() -> Config {
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

#[tokio::test]
async fn test_server_rebuilds_wiped_kv_from_meta_blobs() {
    let dir = TempDir::new().unwrap();

    {
        let mut server = Server::open(persistent_config(), dir.path()).await.unwrap();
        server.wait_replay().await.unwrap();
        for i in 1..=100usize {
            server
                .kv()
                .put(&format!("key_{:03}", i), i.to_string().as_bytes(), i as i64, None)
                .await
                .unwrap();
        }
        server.close().await.unwrap();
    }

    // Simulate losing the KV store entirely.
    std::fs::remove_dir_all(dir.path().join("vkv")).unwrap();

    {
        let mut server = Server::open(persistent_config(), dir.path()).await.unwrap();
        let stats = server.wait_replay().await.unwrap();
        assert_eq!(stats.applied, 100);
        assert_eq!(stats.quarantined, 0);

        let (kvs, _) = server.kv().keys("", "\u{10FFFF}", 0).unwrap();
        assert_eq!(kvs.len(), 100);
        let sample = server.kv().get("key_042", 0).unwrap();
        assert_eq!(sample.version, 42);
        assert_eq!(sample.data, b"42");
        // The replay re-binds every record to its meta blob.
        assert!(server.kv().get_meta_blob("key_042", 42).unwrap().is_some());
        server.close().await.unwrap();
    }

    // A third start replays nothing: everything is already bound.
    {
        let mut server = Server::open(persistent_config(), dir.path()).await.unwrap();
        let stats = server.wait_replay().await.unwrap();
        assert_eq!(stats.applied, 0);
        assert_eq!(stats.skipped, 100);
        server.close().await.unwrap();
    }
}
