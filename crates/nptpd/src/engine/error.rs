use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the bridging engine.
///
/// Most variants are scoped to a single mapping and must never escape to
/// abort the daemon as a whole; see the propagation policy in the crate
/// docs for `engine::supervisor`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("failed to bind {what} at {addr}: {source}")]
    BindFailed {
        what: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create socket for {what}: {source}")]
    SocketFailed {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("no such endpoint: {0}")]
    NoSuchEndpoint(PathBuf),

    #[error("peer gone")]
    PeerGone,

    #[error("connection refused: {source}")]
    Refused {
        #[source]
        source: std::io::Error,
    },

    #[error("filesystem watcher failed: {0}")]
    WatcherFailed(String),

    #[error("not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, EngineError>;
