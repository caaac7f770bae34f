use super::{AuthConfig, PeerConnection, PeerTransport};
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// In-process transport serving content from memory.
///
/// Peers are keyed by address. Faults can be injected per peer, and reads can
/// be paused globally so tests can observe requests while they are in flight.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<MemoryState>,
}

struct MemoryState {
    peers: Mutex<HashMap<String, MemoryPeer>>,
    reads: Mutex<HashMap<(String, String, u64), usize>>,
    connects: AtomicUsize,
    gate: watch::Sender<bool>,
}

#[derive(Default)]
struct MemoryPeer {
    name: String,
    content: HashMap<String, Bytes>,
    refuse_connect: bool,
    fail_ping: bool,
    fail_reads: bool,
    ping_delay: Duration,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Arc::new(MemoryState {
                peers: Mutex::new(HashMap::new()),
                reads: Mutex::new(HashMap::new()),
                connects: AtomicUsize::new(0),
                gate,
            }),
        }
    }

    pub fn add_peer(&self, address: &str, name: &str) {
        self.state.peers().insert(
            address.to_string(),
            MemoryPeer {
                name: name.to_string(),
                ..MemoryPeer::default()
            },
        );
    }

    pub fn publish(&self, address: &str, hash: &str, data: impl Into<Bytes>) {
        if let Some(peer) = self.state.peers().get_mut(address) {
            peer.content.insert(hash.to_string(), data.into());
        }
    }

    pub fn set_refuse_connect(&self, address: &str, refuse: bool) {
        self.update_peer(address, |peer| peer.refuse_connect = refuse);
    }

    pub fn set_fail_ping(&self, address: &str, fail: bool) {
        self.update_peer(address, |peer| peer.fail_ping = fail);
    }

    pub fn set_fail_reads(&self, address: &str, fail: bool) {
        self.update_peer(address, |peer| peer.fail_reads = fail);
    }

    pub fn set_ping_delay(&self, address: &str, delay: Duration) {
        self.update_peer(address, |peer| peer.ping_delay = delay);
    }

    /// Holds every block read until [`MemoryTransport::resume_reads`].
    pub fn pause_reads(&self) {
        self.state.gate.send_replace(false);
    }

    pub fn resume_reads(&self) {
        self.state.gate.send_replace(true);
    }

    /// Reads of `hash` at `offset` received by the peer at `address`.
    pub fn read_count(&self, address: &str, hash: &str, offset: u64) -> usize {
        self.state
            .reads()
            .get(&(address.to_string(), hash.to_string(), offset))
            .copied()
            .unwrap_or(0)
    }

    /// Reads of `hash` at `offset` across all peers.
    pub fn total_reads_at(&self, hash: &str, offset: u64) -> usize {
        self.state
            .reads()
            .iter()
            .filter(|((_, h, o), _)| h == hash && *o == offset)
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn total_reads(&self) -> usize {
        self.state.reads().values().sum()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::Relaxed)
    }

    fn update_peer(&self, address: &str, f: impl FnOnce(&mut MemoryPeer)) {
        if let Some(peer) = self.state.peers().get_mut(address) {
            f(peer);
        }
    }
}

impl MemoryState {
    fn peers(&self) -> MutexGuard<'_, HashMap<String, MemoryPeer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reads(&self) -> MutexGuard<'_, HashMap<(String, String, u64), usize>> {
        self.reads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn connect(&self, address: &str, auth: &AuthConfig) -> Result<Arc<dyn PeerConnection>> {
        self.state.connects.fetch_add(1, Ordering::Relaxed);
        let peers = self.state.peers();
        let Some(peer) = peers.get(address) else {
            return Err(FetchError::connection(address, "no such peer"));
        };
        if peer.refuse_connect {
            return Err(FetchError::connection(address, "connection refused"));
        }
        if !auth.expected_name.is_empty() && auth.expected_name != peer.name {
            return Err(FetchError::connection(
                address,
                format!(
                    "peer authenticated as {:?}, expected {:?}",
                    peer.name, auth.expected_name
                ),
            ));
        }
        Ok(Arc::new(MemoryConnection {
            address: address.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    address: String,
    state: Arc<MemoryState>,
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    async fn ping(&self) -> Result<()> {
        let (fail, delay) = match self.state.peers().get(&self.address) {
            Some(peer) => (peer.fail_ping, peer.ping_delay),
            None => (true, Duration::ZERO),
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(FetchError::connection(&self.address, "ping failed"));
        }
        Ok(())
    }

    async fn read_block(&self, hash: &str, offset: u64, len: usize) -> Result<Bytes> {
        *self
            .state
            .reads()
            .entry((self.address.clone(), hash.to_string(), offset))
            .or_insert(0) += 1;

        let mut gate = self.state.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(FetchError::connection(&self.address, "transport closed"));
        }

        let peers = self.state.peers();
        let Some(peer) = peers.get(&self.address) else {
            return Err(FetchError::connection(&self.address, "peer went away"));
        };
        if peer.fail_reads {
            return Err(FetchError::Protocol(format!(
                "{} failed to read {hash}@{offset}",
                self.address
            )));
        }
        let Some(data) = peer.content.get(hash) else {
            return Err(FetchError::Protocol(format!("{} has no {hash}", self.address)));
        };
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data.slice(start..end))
    }
}
