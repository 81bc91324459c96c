//! Error types exposed by this crate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::membership::NodeId;
use crate::raft_types::SnapshotSegmentId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internal Raft protocol.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// A fatal error coming from the storage layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),

    /// An error coming from the network layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),

    /// An internal message delivery failure; the node is shutting down.
    #[error("raft stopped")]
    ShuttingDown,

    /// Received an out-of-order snapshot segment.
    #[error("snapshot segment id mismatch, expect: {expect}, got: {got}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },
}

impl From<tokio::io::Error> for RaftError {
    fn from(err: tokio::io::Error) -> Self {
        RaftError::RaftStorage(err.into())
    }
}

/// An error related to a client write request.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client write request must be forwarded to the cluster leader.
    #[error("the client write request must be forwarded to the cluster leader: {0:?}")]
    ForwardToLeader(Option<NodeId>),
}

/// An error related to a client read request.
#[derive(Debug, thiserror::Error)]
pub enum ClientReadError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client read request must be forwarded to the cluster leader.
    #[error("the client read request must be forwarded to the cluster leader: {0:?}")]
    ForwardToLeader(Option<NodeId>),
}

/// An error related to initializing a pristine node.
#[derive(Debug, thiserror::Error)]
pub enum InitializeError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The requested action is not allowed due to the node's current state.
    #[error("the requested action is not allowed due to the node's current state")]
    NotAllowed,
}

/// An error related to a membership change request.
#[derive(Debug, thiserror::Error)]
pub enum ChangeConfigError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),

    /// The proposed cluster would be left without any members.
    #[error("the proposed config would leave the cluster in an inoperable state")]
    InoperableConfig,

    /// The node received a change-config request but is not the leader.
    #[error("this node is not the raft leader, the last known leader is {0:?}")]
    NodeNotLeader(Option<NodeId>),

    /// A reconfiguration is already in flight; only one may be proposed at a time.
    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,

    /// The change request is a no-op against the active configuration.
    #[error("the given config change is a no-op")]
    Noop,
}

/// The set of errors a public admin response may carry.
#[derive(Debug, thiserror::Error, derive_more::From)]
pub enum ResponseError {
    #[error("{0}")]
    ChangeConfig(ChangeConfigError),
    #[error("{0}")]
    Raft(RaftError),
}

/// Errors produced by the asynchronous synchronization primitives.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
    /// The wait expired before the lock could be granted.
    #[error("timed out waiting for lock")]
    Timeout,

    /// The caller's cancellation token fired at a suspension point.
    #[error("lock acquisition was cancelled")]
    Cancelled,

    /// A competing caller stole the lock and failed every queued waiter.
    #[error("lock wait interrupted: {0}")]
    Interrupted(Arc<str>),

    /// A release was attempted without a matching acquisition.
    #[error("the caller does not hold the lock")]
    NotInLock,

    /// The primitive has been disposed and accepts no further acquirers.
    #[error("synchronization primitive has been disposed")]
    Disposed,
}

/// Errors produced by the write-ahead log store.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// An underlying storage failure.
    #[error("I/O failure in log store: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk state failed an integrity or format check. Fatal for the store.
    #[error("log store corruption: {0}")]
    Corruption(String),

    /// An append did not line up with the end of the log.
    #[error("out-of-order append, expected index {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    /// The operation would modify an entry at or below the commit index.
    #[error("index {0} is already committed")]
    AlreadyCommitted(u64),

    /// The append queue is at capacity.
    #[error("log store append queue is full")]
    Busy,

    /// The store has been closed or drained and no longer serves this operation.
    #[error("log store is closed")]
    Closed,

    /// A lock-layer failure while coordinating access to the store.
    #[error("log store lock failure: {0}")]
    Lock(#[from] SyncError),
}

impl WalError {
    /// True for failures that poison the store instance rather than the single call.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WalError::Corruption(_))
    }
}

/// A timeout error carrying the waited condition, produced by metrics waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitTimeout {
    pub timeout: Duration,
    pub msg: String,
}

impl fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "timeout after {:?} when {}", self.timeout, self.msg)
    }
}

impl std::error::Error for WaitTimeout {}
