//! Crate-wide error type.
//!
//! Covers configuration, upstream transport, upstream protocol, downstream
//! execution, and checkpoint-invariant failures as distinct variants so
//! callers can match on failure class rather than parsing strings.

use thiserror::Error;

pub type PlayerResult<T> = std::result::Result<T, PlayerError>;

#[derive(Debug, Error)]
pub enum PlayerError {
    /// Fatal at construction: empty addr, invalid start coordinates, bad config.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Dial failure against the upstream binlog server.
    #[error("failed to dial upstream: {0}")]
    Dial(#[from] tonic::transport::Error),

    /// A streaming RPC call returned an error status.
    #[error("upstream transport error: {0}")]
    Transport(#[from] tonic::Status),

    /// Upstream protocol violation: unknown sqlType, nested BEGIN, orphan
    /// COMMIT/DML. Indicates a corrupt stream.
    #[error("upstream protocol violation: {0}")]
    Protocol(String),

    /// A bare upstream-reported error string (non-EOF `BinlogResponse.error`).
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Arbitrary downstream SQL execution failure (not a deadlock).
    #[error("database error: {0}")]
    Database(#[from] mysql_async::Error),

    /// Checkpoint invariant violation: an UPDATE affected other than one row.
    #[error("checkpoint invariant violation: {0}")]
    Checkpoint(String),

    /// The deadlock-retry backoff policy was exhausted.
    #[error("gave up retrying a flush after {0} deadlock retries")]
    RetryExhausted(u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlayerError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        PlayerError::Protocol(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        PlayerError::Checkpoint(msg.into())
    }
}
