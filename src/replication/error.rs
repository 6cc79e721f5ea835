//! Error taxonomy for the replication engine.
//!
//! Adapter-level failures are classified into kinds so workers can decide
//! between retry, reconnect and drop without inspecting engine-specific
//! error types.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("syntax error: {0}")]
    SyntaxError(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("database error: {0}")]
    Other(String),
}

impl AdapterError {
    /// Transient failures are worth retrying; everything else is dropped.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Timeout(_))
    }

    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("replication timed out: {acked} of {expected} replicas acknowledged")]
    ReplicationTimeout { acked: usize, expected: usize },

    #[error("insufficient replicas acknowledged: {acked} of {required} required")]
    InsufficientReplicasAcked { acked: usize, required: usize },

    #[error("no such replica: {0}")]
    NoSuchReplica(String),

    #[error("replica {name} is not ready: {reason}")]
    ReplicaNotReady { name: String, reason: String },

    #[error("replica {0} did not drain within the promotion deadline")]
    DrainTimeout(String),

    #[error("replica {0} queue is full")]
    QueueFull(String),

    #[error("replica {replica} needs events from {missing_from} onward which are no longer in the log")]
    UnrecoverableGap { replica: String, missing_from: u64 },

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error("coordinator is not running")]
    NotRunning,

    #[error("invalid replication configuration: {0}")]
    InvalidConfig(String),
}
