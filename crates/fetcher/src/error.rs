use thiserror::Error;

/// Errors surfaced by the block fetcher.
///
/// Cloneable because a single block outcome is handed to every reader that
/// was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("connection to peer {peer} failed: {reason}")]
    Connection { peer: String, reason: String },

    #[error("no usable peer for content {hash}")]
    NoUsablePeer { hash: String },

    #[error("block {block} of {hash} unavailable: {reason}")]
    Fetch {
        hash: String,
        block: u64,
        reason: String,
    },

    #[error("read interrupted")]
    Interrupted,

    #[error("invalid peer identity {0:?}, expected name@address")]
    InvalidIdentity(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl FetchError {
    pub(crate) fn connection(peer: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
