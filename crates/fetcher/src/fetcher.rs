use crate::config::FetchConfig;
use crate::error::{FetchError, Result};
use crate::handle::{ContentHandle, HandleOptions, WeakContentHandle};
use crate::peer::{PeerLink, PeerRegistry};
use crate::transport::PeerTransport;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Application context for block fetching.
///
/// Owns the peer registry, the fetch concurrency limit and the shutdown token
/// shared by every handle it opens.
pub struct Fetcher {
    config: FetchConfig,
    cache_bytes: u64,
    registry: Arc<PeerRegistry>,
    fetch_permits: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
    shared: Mutex<HashMap<String, WeakContentHandle>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        config.validate()?;
        let cache_bytes = config.local_cache_bytes()?;
        let fetch_permits = match config.max_concurrent_fetches {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        let registry = Arc::new(PeerRegistry::new(transport, config.connect_timeout()));
        info!(
            block_size = config.block_size(),
            prefetch_blocks = config.prefetch_blocks,
            max_concurrent_fetches = config.max_concurrent_fetches,
            "Fetcher ready"
        );
        Ok(Self {
            config,
            cache_bytes,
            registry,
            fetch_permits,
            shutdown: CancellationToken::new(),
            shared: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size()
    }

    pub fn local_cache_dir(&self) -> &Path {
        &self.config.local_cache_dir
    }

    pub fn local_cache_bytes(&self) -> u64 {
        self.cache_bytes
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Resolves a single peer through the registry.
    pub async fn connect(&self, ident: &str) -> Result<Arc<PeerLink>> {
        self.registry.get_or_create(ident).await
    }

    /// Opens a fresh handle for `hash`. Unreachable candidates are skipped;
    /// at least one must connect.
    pub async fn new_handle(&self, hash: &str, size: u64, peers: &[String]) -> Result<ContentHandle> {
        let attempts = join_all(peers.iter().map(|ident| self.registry.get_or_create(ident))).await;
        let mut usable = 0usize;
        for (ident, attempt) in peers.iter().zip(attempts) {
            match attempt {
                Ok(_) => usable += 1,
                Err(err) => warn!(peer = %ident, hash, error = %err, "Skipping unreachable peer"),
            }
        }
        if usable == 0 {
            return Err(FetchError::NoUsablePeer {
                hash: hash.to_string(),
            });
        }
        info!(hash, size, peers = usable, "Opened content handle");

        Ok(ContentHandle::new(
            hash.to_string(),
            size,
            peers.to_vec(),
            Arc::clone(&self.registry),
            HandleOptions {
                block_size: self.config.block_size(),
                prefetch_blocks: self.config.prefetch_blocks,
                rank_peers_by_latency: self.config.rank_peers_by_latency,
                fetch_permits: self.fetch_permits.clone(),
                shutdown: self.shutdown.clone(),
            },
        ))
    }

    /// Like [`Fetcher::new_handle`], but returns the handle already open for
    /// `hash` while anyone still holds it.
    pub async fn open_shared(&self, hash: &str, size: u64, peers: &[String]) -> Result<ContentHandle> {
        if let Some(handle) = self.live_shared(hash) {
            return Ok(handle);
        }
        let handle = self.new_handle(hash, size, peers).await?;

        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have opened the same hash while we were connecting.
        if let Some(existing) = shared.get(hash).and_then(WeakContentHandle::upgrade) {
            return Ok(existing);
        }
        shared.retain(|_, weak| weak.is_live());
        shared.insert(hash.to_string(), handle.downgrade());
        Ok(handle)
    }

    /// Interrupts every pending read on handles opened through this fetcher
    /// and refuses fetches still queued for a permit.
    pub fn shutdown(&self) {
        info!("Shutting down fetcher");
        self.shutdown.cancel();
        if let Some(permits) = &self.fetch_permits {
            permits.close();
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn live_shared(&self, hash: &str) -> Option<ContentHandle> {
        let shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.get(hash).and_then(WeakContentHandle::upgrade)
    }
}
