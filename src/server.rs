//! Orchestrator
//!
//! Owns the only long-lived handles: the versioned KV, the router with
//! its backends, and the bridge tasks. Startup instantiates exactly the
//! backends the rules reference, opens the KV, spawns the bridge
//! watcher on the KV-update channel and a one-shot replay scan.
//! Shutdown closes the channel, drains the watcher, flushes the KV and
//! closes every backend. Tests build a fresh server per test; there is
//! no process-wide state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend;
use crate::common::{content_hash_hex, Config, Error, Result};
use crate::filetree::FileTree;
use crate::kvstore::{KvStore, UPDATE_CHANNEL_CAPACITY};
use crate::meta::{MetaBridge, ScanStats};
use crate::router::{Request, Router};
use crate::vkv::VkvStore;

pub struct Server {
    host: String,
    router: Arc<Router>,
    vkv: Arc<VkvStore>,
    kv: KvStore,
    watcher: JoinHandle<()>,
    scan: Option<JoinHandle<Result<ScanStats>>>,
    data_dir: PathBuf,
}

impl Server {
    /// Wire everything together and start the background tasks.
    pub async fn open(config: Config, data_dir: impl AsRef<Path>) -> Result<Server> {
        config.validate()?;
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let mut router = Router::from_config(&config.router)?;
        for name in router.resolve_backends() {
            let conf = config.backends.get(&name).ok_or_else(|| {
                Error::InvalidConfig(format!("rule references unknown backend {:?}", name))
            })?;
            let handle = backend::from_config(&name, conf, &data_dir)?;
            tracing::info!(backend = %name, backend_type = %conf.backend_type, "backend ready");
            router.register(&name, handle);
        }
        let router = Arc::new(router);

        let vkv = Arc::new(VkvStore::open(data_dir.join("vkv"))?);
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let kv = KvStore::new(vkv.clone(), tx);

        let bridge = Arc::new(MetaBridge::new(
            vkv.clone(),
            router.clone(),
            config.host.clone(),
        ));
        let watcher = tokio::spawn(bridge.clone().watch(rx));
        let scan = tokio::task::spawn_blocking(move || bridge.scan());

        tracing::info!(data_dir = %data_dir.display(), "server started");
        Ok(Server {
            host: config.host,
            router,
            vkv,
            kv,
            watcher,
            scan: Some(scan),
            data_dir,
        })
    }

    /// The public key-value surface.
    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// A filetree view over this server's blobs and KV.
    pub fn filetree(&self) -> FileTree {
        FileTree::new(self.kv.clone(), self.router.clone(), self.host.clone())
    }

    /// Store a data blob; returns its content hash.
    pub fn put_blob(&self, data: &[u8]) -> Result<String> {
        let hash = content_hash_hex(data);
        self.router
            .put(&Request::write(false, &self.host), &hash, data)?;
        Ok(hash)
    }

    /// Fetch a data blob, verifying its content hash.
    pub fn get_blob(&self, hash: &str) -> Result<Vec<u8>> {
        let data = self.router.get(&Request::read(false, &self.host), hash)?;
        let computed = content_hash_hex(&data);
        if computed != hash {
            return Err(Error::IntegrityMismatch {
                hash: hash.to_string(),
                computed,
            });
        }
        Ok(data)
    }

    pub fn blob_exists(&self, hash: &str) -> Result<bool> {
        self.router.exists(&Request::read(false, &self.host), hash)
    }

    /// Wait for the startup replay scan. Callable once; later calls
    /// return empty stats.
    pub async fn wait_replay(&mut self) -> Result<ScanStats> {
        match self.scan.take() {
            Some(handle) => handle
                .await
                .map_err(|e| Error::BackendIo(format!("replay scan panicked: {}", e)))?,
            None => Ok(ScanStats::default()),
        }
    }

    /// Drain the bridge, flush the KV and close every backend. Clones of
    /// the [`KvStore`] handed out earlier must be dropped first, or the
    /// update channel never closes.
    pub async fn close(mut self) -> Result<()> {
        if let Some(handle) = self.scan.take() {
            match handle.await {
                Ok(Ok(stats)) => tracing::debug!(?stats, "startup scan finished"),
                Ok(Err(e)) => tracing::error!(error = %e, "startup scan failed"),
                Err(e) => tracing::error!(error = %e, "startup scan panicked"),
            }
        }
        let Server {
            kv, watcher, vkv, router, ..
        } = self;
        drop(kv);
        watcher
            .await
            .map_err(|e| Error::BackendIo(format!("bridge watcher panicked: {}", e)))?;
        vkv.close()?;
        router.done()?;
        router.close()?;
        tracing::info!("server closed");
        Ok(())
    }
}
