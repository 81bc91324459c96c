//! The Raft storage interface and data types.

use std::error::Error;
use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;

use crate::membership::Membership;
use crate::membership::NodeId;
use crate::raft::Entry;
use crate::raft_types::LogId;
use crate::raft_types::SnapshotId;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SnapshotMeta {
    // Log entries upto which this snapshot includes, inclusive.
    pub last_log_id: LogId,

    /// The latest membership covered by the snapshot.
    pub membership: Membership,

    /// To identify a snapshot when transferring.
    /// Caveat: even when two snapshot is built with the same `last_log_id`, they still could be different in bytes.
    pub snapshot_id: SnapshotId,
}

/// The data associated with the current snapshot.
pub struct Snapshot<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// metadata of a snapshot
    pub meta: SnapshotMeta,

    /// A read handle to the associated snapshot.
    pub snapshot: Box<S>,
}

/// A record holding the hard state of a Raft node.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The last entry.
    pub last_log_id: LogId,

    /// The LogId of the last log applied to the state machine.
    pub last_applied_log: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The latest cluster membership found in the log, else a new initial
    /// membership consisting only of this node's ID.
    pub membership: Membership,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    ///
    /// ### `id`
    /// The ID of the Raft node.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            last_log_id: LogId { term: 0, index: 0 },
            last_applied_log: LogId { term: 0, index: 0 },
            hard_state: HardState {
                current_term: 0,
                voted_for: None,
            },
            membership: Membership::new_initial(id),
        }
    }
}

/// The application state machine entries are applied to once committed.
///
/// Entry payloads are opaque bytes to this crate; the application dispatches
/// on `command_id` and decodes `data` with whatever codec it registered for
/// that command. Re-applying an already-applied entry must be a no-op, which
/// is usually achieved by tracking the last applied log index inside the
/// machine's own state.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// The application specific response produced by applying an entry.
    type Response: Send + Sync + Debug + 'static;

    /// Apply a committed entry, returning the application response.
    async fn apply(&self, entry: &Entry) -> Result<Self::Response>;

    /// Serialize the machine's current state for a snapshot.
    async fn snapshot(&self) -> Result<Bytes>;

    /// Replace the machine's state from a snapshot payload.
    async fn restore(&self, snapshot: Bytes) -> Result<()>;
}

/// A trait defining the interface for a Raft storage system.
///
/// The crate ships a production implementation, the partitioned on-disk
/// store in [`crate::wal`]; the trait remains the seam the consensus core
/// runs against so tests and embedders can substitute their own.
#[async_trait]
pub trait RaftStorage: Send + Sync + 'static {
    /// The storage engine's associated type used for exposing a snapshot for reading & writing.
    type SnapshotData: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static;

    /// The application specific response type produced by applying entries.
    type Response: Send + Sync + Debug + 'static;

    /// The error type used to indicate to Raft that shutdown is needed when calling the
    /// `apply_to_state_machine` method.
    ///
    /// This error type is only considered for the `apply_to_state_machine` method as it is
    /// the only method which is allowed to return errors normally as part of application logic.
    ///
    /// For all other methods of this trait, returning an error will cause Raft to shutdown.
    type ShutdownError: Error + Send + Sync + 'static;

    /// Get the latest membership found in the log or the current snapshot.
    ///
    /// If the system is pristine, this should return a membership consisting
    /// only of this node's ID.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_membership(&self) -> Result<Membership>;

    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface on the storage system to
    /// fetch the last known state from stable storage. If no such entry exists due to being the
    /// first time the node has come online, then `InitialState::new_initial` should be used.
    ///
    /// **Pro tip:** the storage impl may need to look in a few different places to accurately
    /// respond to this request: the last entry in the log for `last_log_id`; the node's hard
    /// state record; and the index of the last log applied to the state machine.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save Raft's hard-state.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Get a series of log entries from storage.
    ///
    /// The start value is inclusive in the search and the stop value is non-inclusive: `[start, stop)`.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry>>;

    /// Try to get an log entry. Returns `None` when the entry does not exist,
    /// e.g. after it was compacted into a snapshot.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry>>;

    /// Returns the last known log id.
    /// It could be the id of the last entry in log, or the last applied id that is saved in state machine.
    ///
    /// When there is no log or state machine, it returns (0,0)
    async fn get_last_log_id(&self) -> Result<LogId>;

    /// Delete all logs in a `range`.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()>;

    /// Append a payload of entries to the log.
    ///
    /// Though the entries will always be presented in order, each entry's index should be used to
    /// determine its location to be written in the log.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn append_to_log(&self, entries: &[&Entry]) -> Result<()>;

    /// Apply the given payload of entries to the state machine.
    ///
    /// The Raft protocol guarantees that only logs which have been _committed_, that is, logs which
    /// have been replicated to a majority of the cluster, will be applied to the state machine.
    ///
    /// An impl should do:
    /// - Deal with the `EntryPayload::Normal` log, dispatching to the application state machine.
    /// - Deal with `EntryPayload::ConfigChange`, recording the new membership.
    /// - A `EntryPayload::PurgedMarker` log should never be seen here.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown unless they downcast
    /// to `Self::ShutdownError`, in which case they shut the node down explicitly.
    async fn apply_to_state_machine(&self, entries: &[&Entry]) -> Result<Vec<Self::Response>>;

    /// Perform log compaction, returning a handle to the generated snapshot.
    ///
    /// ### implementation guide
    /// When performing log compaction, the compaction can only cover the breadth of the log up to
    /// the last applied log and under write load this value may change quickly. As such, the
    /// storage implementation should export/checkpoint/snapshot its state machine, and then use
    /// the value of that export's last applied log as the metadata indicating the breadth of the
    /// log covered by the snapshot.
    ///
    /// Errors returned from this method will be logged and retried.
    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>>;

    /// Create a new blank snapshot, returning a writable handle to the snapshot object.
    ///
    /// Raft will use this handle to receive snapshot data.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>>;

    /// Finalize the installation of a snapshot which has finished streaming from the cluster leader.
    ///
    /// Delete all entries in the log through `meta.last_log_id.index`.
    ///
    /// All other snapshots should be deleted at this point.
    ///
    /// ### snapshot
    /// A snapshot created from an earlier call to `begin_receiving_snapshot` which provided the
    /// snapshot. By the time ownership of the snapshot object is returned here, its
    /// `AsyncWriteExt.shutdown()` method will have been called, so no additional writes should be
    /// made to the snapshot.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()>;

    /// Get a readable handle to the current snapshot, along with its metadata.
    ///
    /// ### implementation algorithm
    /// Implementing this method should be straightforward. Check the configured snapshot
    /// directory for any snapshot files. A proper implementation will only ever have one
    /// active snapshot, though another may exist while it is being created. As such, it is
    /// recommended to use a file naming pattern which will allow for easily distinguishing between
    /// the current live snapshot, and any new snapshot which is being created.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>>;
}
