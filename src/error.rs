//! Error taxonomy for DHT operations.
//!
//! Transport failures are absorbed by the network layer (the failing contact
//! is penalized in the routing table) and reach queries as path failures, not
//! as caller-visible errors. Only whole-operation outcomes surface here.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KadError>;

#[derive(Error, Debug)]
pub enum KadError {
    /// The routing table produced no seed peers for a lookup.
    #[error("lookup failed: no known peers to query")]
    LookupFailed,

    /// The query ran to completion without finding the requested peer or record.
    #[error("not found")]
    NotFound,

    /// The overall operation deadline or a per-request deadline fired.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A validator rejected the record payload.
    #[error("invalid record for key {key}: {reason}")]
    InvalidRecord { key: String, reason: String },

    /// A public-key record does not hash to the peer id it claims.
    #[error("public key does not match peer id")]
    InvalidPublicKey,

    /// Stream open, read, or write failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The caller cancelled the operation.
    #[error("cancelled")]
    Cancelled,

    /// A put reached fewer remote acknowledgements than the configured quorum.
    #[error("put quorum not met: needed {needed}, got {got}")]
    QuorumFailed { needed: usize, got: usize },

    /// This node runs in client mode and does not serve inbound queries.
    #[error("node is in client mode and does not serve queries")]
    NotServing,
}

impl KadError {
    pub fn invalid_record(key: impl AsRef<[u8]>, reason: impl Into<String>) -> Self {
        KadError::InvalidRecord {
            key: String::from_utf8_lossy(key.as_ref()).into_owned(),
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for KadError {
    fn from(err: bincode::Error) -> Self {
        KadError::Transport(format!("codec: {err}"))
    }
}
