use crate::error::{FetchError, Result};
use crate::transport::{AuthConfig, PeerConnection, PeerTransport};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// A peer identity of the form `name@address`.
///
/// `name` is what the remote must authenticate as; `address` is handed to the
/// transport untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub name: String,
    pub address: String,
}

impl PeerIdentity {
    pub fn parse(ident: &str) -> Result<Self> {
        let Some((name, address)) = ident.trim().split_once('@') else {
            return Err(FetchError::InvalidIdentity(ident.to_string()));
        };
        if name.is_empty() || address.is_empty() {
            return Err(FetchError::InvalidIdentity(ident.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            address: address.to_string(),
        })
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

pub struct PeerLink {
    ident: String,
    connection: Arc<dyn PeerConnection>,
    latency: Option<Duration>,
}

impl PeerLink {
    pub fn new(ident: impl Into<String>, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            ident: ident.into(),
            connection,
            latency: None,
        }
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Pings twice: the first ping warms the remote up, the second is timed.
    pub async fn measure_latency(&mut self) -> Result<Duration> {
        if let Err(err) = self.connection.ping().await {
            self.latency = None;
            return Err(err);
        }
        let started = Instant::now();
        if let Err(err) = self.connection.ping().await {
            self.latency = None;
            return Err(err);
        }
        let elapsed = started.elapsed();
        info!(peer = %self.ident, latency_us = elapsed.as_micros() as u64, "Measured peer latency");
        self.latency = Some(elapsed);
        Ok(elapsed)
    }

    pub async fn read_block(&self, hash: &str, offset: u64, len: usize) -> Result<Bytes> {
        self.connection.read_block(hash, offset, len).await
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("ident", &self.ident)
            .field("latency", &self.latency)
            .finish()
    }
}

/// Known peer links, keyed by identity.
///
/// Links are created on first lookup and kept for the registry's lifetime. A
/// peer that cannot be connected or pinged gets no entry, so the next lookup
/// tries again.
pub struct PeerRegistry {
    transport: Arc<dyn PeerTransport>,
    connect_timeout: Duration,
    peers: Mutex<HashMap<String, Arc<OnceCell<Arc<PeerLink>>>>>,
}

impl PeerRegistry {
    pub fn new(transport: Arc<dyn PeerTransport>, connect_timeout: Duration) -> Self {
        Self {
            transport,
            connect_timeout,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, ident: &str) -> Result<Arc<PeerLink>> {
        let cell = {
            let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(peers.entry(ident.to_string()).or_default())
        };
        cell.get_or_try_init(|| self.establish(ident))
            .await
            .map(Arc::clone)
    }

    /// Returns the link for `ident` if one has been established.
    pub fn lookup(&self, ident: &str) -> Option<Arc<PeerLink>> {
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers.get(ident).and_then(|cell| cell.get().cloned())
    }

    pub fn len(&self) -> usize {
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn establish(&self, ident: &str) -> Result<Arc<PeerLink>> {
        let identity = PeerIdentity::parse(ident)?;
        let auth = AuthConfig {
            expected_name: identity.name.clone(),
        };
        debug!(peer = %ident, "Connecting to peer");
        let connection = tokio::time::timeout(
            self.connect_timeout,
            self.transport.connect(&identity.address, &auth),
        )
        .await
        .map_err(|_| FetchError::connection(ident, "connect timed out"))??;

        let mut link = PeerLink::new(ident, connection);
        if let Err(err) = link.measure_latency().await {
            warn!(peer = %ident, error = %err, "Peer failed liveness ping");
            return Err(FetchError::connection(ident, format!("liveness ping failed: {err}")));
        }
        Ok(Arc::new(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn registry(transport: &MemoryTransport) -> PeerRegistry {
        PeerRegistry::new(Arc::new(transport.clone()), Duration::from_secs(5))
    }

    #[test]
    fn identity_splits_on_first_at() {
        let id = PeerIdentity::parse("alice@/ip4/10.0.0.1/tcp/9000").unwrap();
        assert_eq!(id.name, "alice");
        assert_eq!(id.address, "/ip4/10.0.0.1/tcp/9000");
        assert_eq!(id.to_string(), "alice@/ip4/10.0.0.1/tcp/9000");

        let id = PeerIdentity::parse("bob@host@odd:1667").unwrap();
        assert_eq!(id.name, "bob");
        assert_eq!(id.address, "host@odd:1667");
    }

    #[test]
    fn identity_requires_both_parts() {
        for bad in ["", "host:1667", "@host:1667", "alice@"] {
            assert!(
                matches!(PeerIdentity::parse(bad), Err(FetchError::InvalidIdentity(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn links_are_created_once_and_reused() {
        let transport = MemoryTransport::new();
        transport.add_peer("mem:1", "alice");
        let registry = registry(&transport);

        let first = registry.get_or_create("alice@mem:1").await.expect("connect");
        let second = registry.get_or_create("alice@mem:1").await.expect("reuse");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.connect_count(), 1);
        assert!(first.latency().is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn failed_ping_leaves_no_entry_and_is_retried() {
        let transport = MemoryTransport::new();
        transport.add_peer("mem:1", "alice");
        transport.set_fail_ping("mem:1", true);
        let registry = registry(&transport);

        let err = registry.get_or_create("alice@mem:1").await.unwrap_err();
        assert!(matches!(err, FetchError::Connection { .. }));
        assert!(registry.lookup("alice@mem:1").is_none());
        assert!(registry.is_empty());

        transport.set_fail_ping("mem:1", false);
        registry
            .get_or_create("alice@mem:1")
            .await
            .expect("second attempt should connect");
        assert_eq!(transport.connect_count(), 2);
        assert!(registry.lookup("alice@mem:1").is_some());
    }

    #[tokio::test]
    async fn wrong_name_is_an_auth_failure() {
        let transport = MemoryTransport::new();
        transport.add_peer("mem:1", "alice");
        let registry = registry(&transport);

        let err = registry.get_or_create("mallory@mem:1").await.unwrap_err();
        assert!(matches!(err, FetchError::Connection { .. }));
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_connection_error() {
        let transport = MemoryTransport::new();
        transport.add_peer("mem:1", "alice");
        transport.set_refuse_connect("mem:1", true);
        let registry = registry(&transport);

        assert!(matches!(
            registry.get_or_create("alice@mem:1").await,
            Err(FetchError::Connection { .. })
        ));
        assert!(matches!(
            registry.get_or_create("nobody").await,
            Err(FetchError::InvalidIdentity(_))
        ));
    }
}
