//! Error types for topology planning and execution.

use crate::types::ShardId;
use std::io;
use thiserror::Error;

/// Result type alias for shardshift operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Template text or construction arguments are invalid.
    #[error("malformed template: {0}")]
    MalformedTemplate(String),

    /// A copy is required but the source tree has no readable concrete shard.
    #[error("copy required without a valid copy source: {from} => {to}")]
    InvalidCopySource { from: String, to: String },

    /// The requested copy wrapper is not a usable virtual shard type.
    #[error("invalid copy wrapper type: {0}")]
    InvalidWrapper(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Errors returned by the nameserver client.
    #[error("nameserver error: {0}")]
    Nameserver(#[from] NameserverError),

    /// The observed topology is not safe to modify.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The operator declined a confirmation prompt.
    #[error("operation declined by operator")]
    Declined,

    /// Repeated interrupts forced the scheduler to stop mid-flight.
    #[error("forced exit after repeated interrupts; nameserver state may be inconsistent")]
    ForcedExit,

    /// Rollback log failures.
    #[error("rollback log error: {0}")]
    RollbackLog(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by a [`Nameserver`](crate::nameserver::Nameserver) implementation.
#[derive(Error, Debug)]
pub enum NameserverError {
    /// Shard not found.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// Shard already exists.
    #[error("shard already exists: {0}")]
    ShardAlreadyExists(ShardId),

    /// Link not found.
    #[error("link not found: {up} -> {down}")]
    LinkNotFound { up: ShardId, down: ShardId },

    /// No forwarding at the given position.
    #[error("forwarding not found: table {table_id} base {base_id}")]
    ForwardingNotFound { table_id: i32, base_id: i64 },

    /// The shard graph contains a cycle reachable from a forwarding.
    #[error("link cycle detected at {0}")]
    Cycle(ShardId),

    /// Transport-level failure reported by the remote service.
    #[error("rpc failed: {0}")]
    Rpc(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::RollbackLog(e.to_string())
    }
}
