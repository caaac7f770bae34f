pub mod config;
pub mod error;
mod fetcher;
mod handle;
pub mod peer;
mod stream;
pub mod transport;

pub use config::{parse_byte_size, FetchConfig};
pub use error::{FetchError, Result};
pub use fetcher::Fetcher;
pub use handle::{ContentHandle, HandleStatsSnapshot};
pub use peer::{PeerIdentity, PeerLink, PeerRegistry};
pub use stream::ReadStream;
pub use transport::{AuthConfig, MemoryTransport, PeerConnection, PeerTransport, SwarmTransport};
pub use tokio_util::sync::CancellationToken;
