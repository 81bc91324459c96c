//! Public Raft interface and data types.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeConfigError;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::membership::Membership;
use crate::membership::NodeId;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::network::RaftNetwork;
use crate::raft_types::LogId;
use crate::raft_types::MessageSummary;
use crate::storage::RaftStorage;
use crate::storage::SnapshotMeta;

struct RaftInner<N: RaftNetwork, S: RaftStorage> {
    tx_api: mpsc::UnboundedSender<(RaftMsg<S::Response>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
}

/// The Raft API.
///
/// This type implements the full Raft spec, and is the interface to a running Raft node.
/// Applications building on top of Raft will use this to spawn a Raft task and interact with
/// the spawned task.
///
/// For more information on the Raft protocol, see
/// [the specification here](https://raft.github.io/raft.pdf) (**pdf warning**).
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very cheap
/// and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns a `RaftError::ShuttingDown`, this indicates that the Raft node
/// is shutting down (potentially for data safety reasons due to a storage error), and the `shutdown`
/// method should be called on this type to await the shutdown of the node. If the parent
/// application needs to shutdown the Raft node for any reason, calling `shutdown` will do the trick.
pub struct Raft<N: RaftNetwork, S: RaftStorage> {
    inner: Arc<RaftInner<N, S>>,
}

impl<N: RaftNetwork, S: RaftStorage> Raft<N, S> {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within the cluster.
    /// Applications must guarantee that the ID provided to this function is stable, and should be
    /// persisted in a well known location, probably alongside the Raft log and the application's
    /// state machine. This ensures that restarts of the node will yield the same ID every time.
    ///
    /// ### `config`
    /// Raft's runtime config. See the docs on the `Config` object for more details.
    ///
    /// ### `network`
    /// An implementation of the `RaftNetwork` trait which will be used by Raft for sending RPCs to
    /// peer nodes within the cluster. See the docs on the `RaftNetwork` trait for more details.
    ///
    /// ### `storage`
    /// An implementation of the `RaftStorage` trait which will be used by Raft for data storage.
    /// The crate ships the partitioned log store in [`crate::wal`] for this seam.
    #[tracing::instrument(level="trace", skip(config, network, storage), fields(cluster=%config.cluster_name))]
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    async fn call<T>(&self, msg: RaftMsg<S::Response>, rx: oneshot::Receiver<T>) -> Result<T, RaftError> {
        let span = tracing::debug_span!("CH");
        self.inner.tx_api.send((msg, span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries (§5.3), and are also
    /// used as heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::AppendEntries { rpc, tx }, rx).await?
    }

    /// Submit a VoteRequest (RequestVote in the spec) RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state attempting to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::RequestVote { rpc, tx }, rx).await?
    }

    /// Submit a PreVote probe to this Raft node.
    ///
    /// Pre-votes are issued by would-be candidates before they increment their term, so a
    /// partitioned node rejoining the cluster cannot disrupt a stable leader. Handling a
    /// pre-vote never mutates the receiver's state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn pre_vote(&self, rpc: PreVoteRequest) -> Result<PreVoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::PreVote { rpc, tx }, rx).await?
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader in order to bring a new node or a slow node up-to-speed
    /// with the leader (§7).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot_id=%rpc.meta.last_log_id))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::InstallSnapshot { rpc, tx }, rx).await?
    }

    /// Ask this node to relinquish leadership.
    ///
    /// Returns `true` when the node was leader and has begun stepping down. A node that is not
    /// leader responds `false` without changing state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn resign(&self) -> Result<bool, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::Resign { tx }, rx).await
    }

    /// Request this node's log position, for synchronizing an observer with the cluster.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn synchronize(&self) -> Result<SynchronizeResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::Synchronize { tx }, rx).await
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This method is based on the Raft metrics system which does a good job at staying
    /// up-to-date; however, the `client_read` method must still be used to guard against stale
    /// reads. This method is perfect for making decisions on where to route client requests.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Check to ensure this node is still the cluster leader, in order to guard against stale reads (§8).
    ///
    /// The actual read operation itself is up to the application, this method just ensures that
    /// the read will not be stale.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_read(&self) -> Result<(), ClientReadError> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::ClientReadRequest { tx }, rx)
            .await
            .map_err(ClientReadError::RaftError)
            .and_then(|res| res)
    }

    /// Submit a mutating client request to Raft to update the state of the system (§5.1).
    ///
    /// It will be appended to the log, committed to the cluster, and then applied to the
    /// application state machine. The result of applying the request to the state machine will
    /// be returned as the response from this method.
    ///
    /// Our goal for Raft is to implement linearizable semantics. If the leader crashes after committing
    /// a log entry but before responding to the client, the client may retry the command with a new
    /// leader, causing it to be executed a second time. As such, clients should assign unique serial
    /// numbers to every command. Then, the state machine should track the latest serial number
    /// processed for each client, along with the associated response. If it receives a command whose
    /// serial number has already been executed, it responds immediately without reexecuting the
    /// request (§8). The `command_id` field of each entry and the `StateMachine::apply` seam are
    /// the intended places for this deduplication.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(
        &self,
        rpc: ClientWriteRequest,
    ) -> Result<ClientWriteResponse<S::Response>, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::ClientWriteRequest { rpc, tx }, rx)
            .await
            .map_err(ClientWriteError::RaftError)
            .and_then(|res| res)
    }

    /// Initialize a pristine Raft node with the given members.
    ///
    /// This command should be called on pristine nodes — where the log index is 0 and the node is
    /// in Standby state — as if either of those constraints are false, it indicates that the
    /// cluster is already formed and in motion. If `InitializeError::NotAllowed` is returned
    /// from this function, it is safe to ignore, as it simply indicates that the cluster is
    /// already up and running, which is ultimately the goal of this function.
    ///
    /// This command will work for single-node or multi-node cluster formation. This command
    /// should be called with all discovered nodes which need to be part of cluster, and as such
    /// it is recommended that applications be configured with an initial cluster formation delay
    /// which will allow time for the initial members of the cluster to be discovered (by the
    /// parent application) for this call.
    ///
    /// Once a node becomes leader and detects that its index is 0, it will commit a new config
    /// entry (instead of the normal blank entry created by new leaders).
    ///
    /// Every member of the cluster should perform these actions. This routine is race-condition
    /// free, and Raft guarantees that the first node to become the cluster leader will propagate
    /// only its own config.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: BTreeMap<NodeId, String>) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.call(RaftMsg::Initialize { members, tx }, rx)
            .await
            .map_err(InitializeError::RaftError)
            .and_then(|res| res)
    }

    /// Synchronize a new Raft node, bringing it up-to-speed (§6).
    ///
    /// Applications built on top of Raft will typically have some peer discovery mechanism for
    /// detecting when new nodes come online and need to be added to the cluster. This API
    /// facilitates the ability to request that a new node be synchronized with the leader, so
    /// that it is up-to-date and ready to be added to the cluster.
    ///
    /// Calling this API will add the target node as a standby, starting the syncing process.
    /// Once the node is up-to-speed, this function will return. It is the responsibility of the
    /// application to then call `change_membership` once all of the new nodes are synced.
    ///
    /// If this Raft node is not the cluster leader, then this call will fail.
    #[tracing::instrument(level = "debug", skip(self), fields(target=id))]
    pub async fn add_standby(&self, id: NodeId, address: String) -> Result<(), ResponseError> {
        let (tx, rx) = oneshot::channel();
        let res = self
            .call(RaftMsg::AddStandby { id, address, tx }, rx)
            .await
            .map_err(|err| ResponseError::from(ChangeConfigError::RaftError(err)))?;
        res?;
        Ok(())
    }

    /// Propose a cluster configuration change (§6).
    ///
    /// This will cause the leader to append a single configuration-change entry carrying the
    /// proposed member set. Until that entry commits, quorum is computed against the union of
    /// the old and new member sets; the entry itself only takes effect once a majority of the
    /// NEW member set has replicated it. New nodes which are not yet registered as standbys —
    /// from an earlier call to `add_standby` — will first be synced before the proposal is
    /// appended.
    ///
    /// If this Raft node is not the cluster leader, then the proposed configuration change will be
    /// rejected.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_membership(&self, members: BTreeMap<NodeId, String>) -> Result<(), ResponseError> {
        let (tx, rx) = oneshot::channel();
        let res = self
            .call(RaftMsg::ChangeMembership { members, tx }, rx)
            .await
            .map_err(|err| ResponseError::from(ChangeConfigError::RaftError(err)))?;
        res?;
        Ok(())
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use raftwal::{State, Raft};
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3).await?;
    ///
    /// // wait for ever for raft node's current leader to become 3:
    /// r.wait(None).current_leader(2).await?;
    ///
    /// // wait for raft state to become a follower
    /// r.wait(None).state(State::Follower).await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<N: RaftNetwork, S: RaftStorage> Clone for Raft<N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ClientWriteResponseTx<R> = oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError>>;
pub(crate) type ClientReadResponseTx = oneshot::Sender<Result<(), ClientReadError>>;
pub(crate) type ResponseTx = oneshot::Sender<Result<u64, ResponseError>>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg<R> {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse, RaftError>>,
    },
    PreVote {
        rpc: PreVoteRequest,
        tx: oneshot::Sender<Result<PreVoteResponse, RaftError>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<Result<InstallSnapshotResponse, RaftError>>,
    },
    ClientWriteRequest {
        rpc: ClientWriteRequest,
        tx: ClientWriteResponseTx<R>,
    },
    ClientReadRequest {
        tx: ClientReadResponseTx,
    },
    Initialize {
        members: BTreeMap<NodeId, String>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    AddStandby {
        id: NodeId,
        address: String,
        tx: ResponseTx,
    },
    ChangeMembership {
        members: BTreeMap<NodeId, String>,
        tx: ResponseTx,
    },
    Resign {
        tx: oneshot::Sender<bool>,
    },
    Synchronize {
        tx: oneshot::Sender<SynchronizeResponse>,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,

    /// Creation time, in milliseconds since the Unix epoch.
    pub timestamp: i64,

    /// This entry's payload.
    pub payload: EntryPayload,
}

impl Entry {
    /// Create a blank entry, committed by new leaders.
    pub fn new_blank(log_id: LogId) -> Self {
        Entry {
            log_id,
            timestamp: now_millis(),
            payload: EntryPayload::Blank,
        }
    }

    /// Create a normal entry holding an opaque application command.
    pub fn new_normal(log_id: LogId, command_id: Option<u32>, data: Bytes) -> Self {
        Entry {
            log_id,
            timestamp: now_millis(),
            payload: EntryPayload::Normal(EntryNormal { command_id, data }),
        }
    }

    /// Create a configuration-change entry.
    pub fn new_config(log_id: LogId, membership: Membership) -> Self {
        Entry {
            log_id,
            timestamp: now_millis(),
            payload: EntryPayload::ConfigChange(EntryConfigChange { membership }),
        }
    }

    /// Create a new purged marker standing in for the compacted prefix.
    pub fn new_purged_marker(log_id: LogId) -> Self {
        Entry {
            log_id,
            timestamp: now_millis(),
            payload: EntryPayload::PurgedMarker,
        }
    }
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl MessageSummary for &[Entry] {
    fn summary(&self) -> String {
        let mut res = Vec::with_capacity(self.len());
        for x in self.iter() {
            let e = format!("{}:{}", x.log_id, x.payload.summary());
            res.push(e);
        }

        res.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A normal log entry.
    Normal(EntryNormal),
    /// A config change log entry.
    ConfigChange(EntryConfigChange),
    /// An entry before which all logs are removed.
    PurgedMarker,
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(n) => format!("normal(cmd={:?},{}B)", n.command_id, n.data.len()),
            EntryPayload::ConfigChange(c) => {
                format!("config-change: {:?}", c.membership.all_nodes())
            }
            EntryPayload::PurgedMarker => "purged-marker".to_string(),
        }
    }
}

/// A normal log entry: an opaque application command.
///
/// The core never interprets the bytes; decoding is delegated to the decoder
/// the application registered for `command_id` in its state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal {
    /// The application command identifier.
    pub command_id: Option<u32>,
    /// The opaque command bytes.
    pub data: Bytes,
}

/// A log entry holding a config change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryConfigChange {
    /// The membership as of this entry: the previous active configuration
    /// plus the proposed one this entry carries.
    pub membership: Membership,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,

    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: u64,
    /// Fingerprint of the leader's active configuration.
    pub config_fingerprint: u64,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, cfg={:#x}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.config_fingerprint,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    ///
    /// This never exceeds the responder's known term.
    pub term: u64,
    /// Will be true if follower contained entry matching `prev_log_index` and `prev_log_term`.
    pub success: bool,
    /// A value used to implement the _conflicting term_ optimization outlined in §5.3.
    ///
    /// This value will only be present, and should only be considered, when `success` is `false`.
    pub conflict_opt: Option<ConflictOpt>,
}

/// A struct used to implement the _conflicting term_ optimization outlined in §5.3 for log replication.
///
/// This value will only be present, and should only be considered, when an `AppendEntriesResponse`
/// object has a `success` value of `false`.
///
/// This implementation of Raft uses this value to more quickly synchronize a leader with its
/// followers which may be some distance behind in replication, may have conflicting entries, or
/// which may be new to the cluster.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ConflictOpt {
    /// The most recent entry which does not conflict with the received request.
    pub log_id: LogId,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: u64,
    /// The index of the candidate’s last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate’s last log entry (§5.4).
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

/// A probe sent before a candidate increments its term.
///
/// Receivers answer from their current state without mutating anything: no
/// term bump, no `voted_for` record, no election timer reset.
#[derive(Debug, Serialize, Deserialize)]
pub struct PreVoteRequest {
    /// The term the probing node would campaign in, its current term + 1.
    pub next_term: u64,
    /// The probing node's ID.
    pub candidate_id: u64,
    /// The index of the probing node's last log entry.
    pub last_log_index: u64,
    /// The term of the probing node's last log entry.
    pub last_log_term: u64,
}

impl MessageSummary for PreVoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// The verdict carried in a pre-vote response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreVoteOutcome {
    /// The receiver would vote for the probing node in a real election.
    Accepted,
    /// The receiver would refuse: stale log, newer term, or a live leader.
    Rejected,
}

/// The response to a `PreVoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PreVoteResponse {
    /// The current term of the responding node.
    pub term: u64,
    /// The responder's verdict.
    pub outcome: PreVoteOutcome,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the Raft leader to send chunks of a snapshot to a follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,

    /// Metadata of a snapshot: snapshot_id, last_log_id, membership etc.
    pub meta: SnapshotMeta,

    /// The byte offset where this chunk of data is positioned in the snapshot file.
    pub offset: u64,
    /// The raw bytes of the snapshot chunk, starting at `offset`.
    pub data: Vec<u8>,

    /// Will be `true` if this is the last chunk in the snapshot.
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, meta={:?}, offset={}, len={}, done={}",
            self.term,
            self.leader_id,
            self.meta,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for leader to update itself.
    pub term: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The response to a `Synchronize` request: the node's current log position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SynchronizeResponse {
    /// The responding node's current term.
    pub term: u64,
    /// The responding node's commit index.
    pub commit_index: u64,
    /// The responding node's last log id.
    pub last_log_id: LogId,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An application specific client request to update the state of the system (§5.1).
///
/// The entry of this payload will be appended to the Raft log and then applied to the Raft state
/// machine according to the Raft protocol.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest {
    /// The application specific contents of this client request.
    pub(crate) entry: EntryPayload,
}

impl MessageSummary for ClientWriteRequest {
    fn summary(&self) -> String {
        self.entry.summary()
    }
}

impl ClientWriteRequest {
    /// Create a new client payload instance carrying opaque command bytes.
    pub fn new(data: Bytes) -> Self {
        Self::new_base(EntryPayload::Normal(EntryNormal { command_id: None, data }))
    }

    /// Create a new client payload instance with an application command ID.
    pub fn with_command(command_id: u32, data: Bytes) -> Self {
        Self::new_base(EntryPayload::Normal(EntryNormal {
            command_id: Some(command_id),
            data,
        }))
    }

    /// Create a new instance.
    pub(crate) fn new_base(entry: EntryPayload) -> Self {
        Self { entry }
    }

    /// Generate a new payload holding a config change.
    pub(crate) fn new_config(membership: Membership) -> Self {
        Self::new_base(EntryPayload::ConfigChange(EntryConfigChange { membership }))
    }

    /// Generate a new blank payload.
    ///
    /// This is used by new leaders when first coming to power.
    pub(crate) fn new_blank_payload() -> Self {
        Self::new_base(EntryPayload::Blank)
    }
}

/// The response to a `ClientWriteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse<R> {
    /// The log index of the successfully processed client request.
    pub index: u64,
    /// Application specific response data.
    pub data: R,
}
