use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

mod memory;
pub use self::memory::MemoryTransport;

mod swarm;
pub use self::swarm::{BlockCodec, SwarmTransport};

/// Credentials used when opening a connection to a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    /// Name the remote must authenticate as. Empty disables the check.
    pub expected_name: String,
}

/// Opens authenticated connections to content providers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn connect(&self, address: &str, auth: &AuthConfig) -> Result<Arc<dyn PeerConnection>>;
}

/// An open connection to one content provider.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Reads up to `len` bytes of `hash` starting at `offset`. Short or empty
    /// data means the content ends inside the requested range.
    async fn read_block(&self, hash: &str, offset: u64, len: usize) -> Result<Bytes>;
}
