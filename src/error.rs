//! Error types shared by the client pool and both run modes

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration, detected before any client is constructed
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("QoS should be any of [0, 1, 2], got {0}")]
    InvalidQos(u8),

    #[error("TLS needs all of --ca, --cert and --key")]
    IncompleteTls,

    #[error("failed to read TLS file {path}: {source}")]
    TlsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TLS material: {0}")]
    InvalidTls(String),

    #[error("number of clients must be at least 1")]
    InvalidClientCount,
}

/// Failure of a single client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("client '{client_id}' failed to connect: {reason}")]
    Connect { client_id: String, reason: String },

    #[error("client '{client_id}' did not connect within {timeout:?}")]
    ConnectTimeout { client_id: String, timeout: Duration },

    #[error("connection lost for client '{client_id}': {reason}")]
    ConnectionLost { client_id: String, reason: String },

    #[error("client '{client_id}' got no acknowledgment within {timeout:?}")]
    AckTimeout { client_id: String, timeout: Duration },

    #[error("client '{client_id}' failed to publish: {reason}")]
    Publish { client_id: String, reason: String },

    #[error("client '{client_id}' failed to subscribe: {reason}")]
    Subscribe { client_id: String, reason: String },

    #[error("client '{0}' is not connected")]
    NotConnected(String),
}

impl ClientError {
    /// True when the session is gone and further publishes cannot succeed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionLost { .. } | ClientError::NotConnected(_)
        )
    }
}

/// Failure of the pool as a whole
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("{failed} of {total} clients failed to connect, first error: {first}")]
    ConnectFailed {
        failed: usize,
        total: usize,
        first: ClientError,
    },

    #[error("no client could connect")]
    NoClientsConnected,

    #[error("cancelled before all clients connected")]
    Cancelled,
}
