//! Leader-side replication streams: one task per peer.
//!
//! A stream owns the leader's view of a single peer: the next index to
//! send, the highest acknowledged entry, and the peer's pacing mode. In
//! sync, entries arrive hot off the leader's channel and are forwarded as
//! they come, with heartbeats filling the quiet periods. A peer that falls
//! behind is caught up with batches read back from the log. When the
//! peer's next entry has been compacted away, the snapshot file is
//! streamed instead, chunked along the file's own header. Exchanges with
//! an unreachable peer are retried on the configured backoff schedule.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::Mutex;

use futures::future::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;
use tracing::Span;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::core::term_cache::TermCache;
use crate::membership::NodeId;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::InstallSnapshotRequest;
use crate::raft_types::LogId;
use crate::raft_types::MessageSummary;
use crate::storage::RaftStorage;
use crate::storage::Snapshot;
use crate::wal::SnapshotHeader;

/// Consecutive failed exchanges before a snapshot transfer is abandoned and
/// restarted from the beginning.
const SNAPSHOT_TRANSFER_GIVE_UP: u32 = 5;

#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub matched: LogId,
}

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<(RaftEvent, Span)>,
}

impl ReplicationStream {
    /// Spawn a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<N: RaftNetwork, S: RaftStorage>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        config_fingerprint: u64,
        network: Arc<N>,
        storage: Arc<S>,
        term_cache: Arc<Mutex<TermCache>>,
        replication_tx: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, Span)>,
    ) -> Self {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let install_snapshot_timeout = Duration::from_millis(config.install_snapshot_timeout);

        let core = ReplicationCore {
            id,
            target,
            term,
            network,
            storage,
            term_cache,
            raft_core_tx: replication_tx,
            repl_rx,
            mode: Mode::CatchingUp,
            next_index: last_log.index + 1,
            matched: last_log,
            last_log_index: last_log.index,
            commit_index,
            config_fingerprint,
            hot: VecDeque::new(),
            inflight: Vec::new(),
            heartbeat: interval(heartbeat_timeout),
            heartbeat_timeout,
            install_snapshot_timeout,
            backoff_ms: None,
            config,
        };
        let _handle = tokio::spawn(core.main().instrument(tracing::debug_span!("spawn")));

        ReplicationStream { repl_tx }
    }
}

/// The peer's pacing mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// The peer acknowledges as fast as the leader appends; entries are
    /// forwarded hot off the leader's channel.
    InSync,
    /// The peer is behind; batches are read back from the log until it
    /// reaches the commit index.
    CatchingUp,
    /// The peer's next entry has been compacted away; ship the snapshot.
    Snapshot,
    /// The stream is finished.
    Closed,
}

/// The per-peer replication task.
///
/// Batches are never stacked: a batch stays in `inflight` and is
/// retransmitted verbatim until the peer acknowledges it, so entries can
/// never arrive out of order.
struct ReplicationCore<N: RaftNetwork, S: RaftStorage> {
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the peer this stream replicates to.
    target: NodeId,
    /// The term of the leadership this stream belongs to; a new term spawns
    /// new streams.
    term: u64,

    network: Arc<N>,
    storage: Arc<S>,
    /// The leader's term cache, answering `prev_log_term` without a log
    /// read in the common case.
    term_cache: Arc<Mutex<TermCache>>,
    config: Arc<Config>,

    /// Events up to the Raft core.
    raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent<S::SnapshotData>, Span)>,
    /// Events down from the Raft core.
    repl_rx: mpsc::UnboundedReceiver<(RaftEvent, Span)>,

    mode: Mode,
    /// The index of the next entry to send.
    ///
    /// Rewound on rejection, guided by the peer's conflict hint, until the
    /// logs agree; from then on it tracks acknowledgements.
    next_index: u64,
    /// The highest entry known to be replicated on the peer.
    matched: LogId,
    /// The leader's last appended index, kept fresh by replication events.
    last_log_index: u64,
    /// The highest index known to be committed cluster-wide.
    commit_index: u64,
    /// Fingerprint of the leader's active configuration, advanced when a
    /// configuration entry flows through.
    config_fingerprint: u64,

    /// Entries delivered hot off the leader's channel, awaiting batching.
    /// Only populated while in sync; cleared on any mode change.
    hot: VecDeque<Arc<Entry>>,
    /// The batch awaiting acknowledgement, retransmitted as-is on failure.
    inflight: Vec<Entry>,

    heartbeat: Interval,
    heartbeat_timeout: Duration,
    install_snapshot_timeout: Duration,
    /// The current retry delay towards an unreachable peer. `None` while
    /// the peer is responding.
    backoff_ms: Option<u64>,
}

impl<N: RaftNetwork, S: RaftStorage> ReplicationCore<N, S> {
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        // Probe immediately so the peer learns of this leadership without
        // waiting out a heartbeat interval.
        self.send_batch().await;

        loop {
            match self.mode {
                Mode::InSync => self.run_in_sync().await,
                Mode::CatchingUp => self.run_catch_up().await,
                Mode::Snapshot => self.run_snapshot().await,
                Mode::Closed => return,
            }
        }
    }

    fn announce_rate(&self, in_sync: bool) {
        let _ = self.raft_core_tx.send((
            ReplicaEvent::RateUpdate {
                target: self.target,
                is_line_rate: in_sync,
            },
            tracing::debug_span!("CH"),
        ));
    }

    fn notify_matched(&self) {
        let _ = self.raft_core_tx.send((
            ReplicaEvent::UpdateMatchIndex {
                target: self.target,
                matched: self.matched,
            },
            tracing::debug_span!("CH"),
        ));
    }

    fn revert_to_follower(&mut self, term: u64) {
        let _ = self.raft_core_tx.send((
            ReplicaEvent::RevertToFollower {
                target: self.target,
                term,
            },
            tracing::debug_span!("CH"),
        ));
        self.mode = Mode::Closed;
    }

    fn report_storage_failure(&mut self) {
        let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
        self.mode = Mode::Closed;
    }

    /// Apply one event from the Raft core.
    fn on_event(&mut self, event: RaftEvent) {
        match event {
            RaftEvent::Replicate { entry, commit_index } => {
                self.commit_index = commit_index;
                self.last_log_index = entry.log_id.index;
                if let EntryPayload::ConfigChange(change) = &entry.payload {
                    self.config_fingerprint = change.membership.to_final().active.fingerprint;
                }
                if self.mode == Mode::InSync {
                    self.hot.push_back(entry);
                }
            }
            RaftEvent::UpdateCommitIndex { commit_index } => {
                self.commit_index = commit_index;
            }
            RaftEvent::Terminate => {
                self.mode = Mode::Closed;
            }
        }
    }

    /// Absorb whatever the core has queued without waiting. Bounded so a
    /// hot feed cannot starve the send path.
    fn drain_events(&mut self) {
        for _ in 0..=self.config.max_payload_entries {
            match self.repl_rx.recv().now_or_never() {
                Some(Some((event, _span))) => self.on_event(event),
                Some(None) => {
                    self.mode = Mode::Closed;
                    return;
                }
                None => return,
            }
        }
    }

    /// The term of the entry at `index`: the acknowledged position, then
    /// the leader's term cache, then the log itself. `Ok(None)` means the
    /// entry has been compacted away.
    async fn resolve_term(&mut self, index: u64) -> Result<Option<u64>, ()> {
        if index == self.matched.index {
            return Ok(Some(self.matched.term));
        }
        let cached = { self.term_cache.lock().unwrap().lookup(index) };
        if cached.is_some() {
            return Ok(cached);
        }
        match self.storage.try_get_log_entry(index).await {
            Ok(Some(entry)) => Ok(Some(entry.log_id.term)),
            Ok(None) => Ok(None),
            Err(err) => {
                tracing::error!(error=%err, index, "error resolving entry term from storage");
                Err(())
            }
        }
    }

    /// Stage the next run of entries starting exactly at `next_index` into
    /// the retransmission buffer. An empty buffer afterwards means there is
    /// nothing to send but a heartbeat. Returns false when the mode changed
    /// underneath (compacted prefix, storage failure, termination).
    async fn fill_inflight(&mut self) -> bool {
        // Entries the peer has already acknowledged are dead weight.
        while matches!(self.hot.front(), Some(entry) if entry.log_id.index < self.next_index) {
            self.hot.pop_front();
        }

        let max = self.config.max_payload_entries as usize;
        if matches!(self.hot.front(), Some(entry) if entry.log_id.index == self.next_index) {
            // The hot queue lines up; entries in it are consecutive.
            while self.inflight.len() < max {
                match self.hot.pop_front() {
                    Some(entry) => self.inflight.push(entry.as_ref().clone()),
                    None => break,
                }
            }
            return true;
        }

        if self.next_index > self.last_log_index {
            // Fully caught up: heartbeat only.
            return true;
        }

        // The hot queue does not line up (a mode change dropped entries, or
        // the peer rewound); read the gap back from the log.
        let stop = (self.next_index + self.config.max_payload_entries).min(self.last_log_index) + 1;
        let entries = match self.storage.get_log_entries(self.next_index..stop).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error reading replication batch from storage");
                self.report_storage_failure();
                return false;
            }
        };
        if entries.iter().any(|entry| matches!(entry.payload, EntryPayload::PurgedMarker)) {
            // The range reaches into the compacted prefix.
            self.mode = Mode::Snapshot;
            return false;
        }
        if entries.is_empty() {
            tracing::error!(
                next_index = self.next_index,
                last_log_index = self.last_log_index,
                "log returned no entries inside its own extent"
            );
            self.report_storage_failure();
            return false;
        }
        self.inflight = entries;
        true
    }

    /// Send the in-flight batch, or a bare heartbeat when there is none,
    /// and fold the peer's answer back into the stream state.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_batch(&mut self) {
        if self.inflight.is_empty() && !self.fill_inflight().await {
            return;
        }

        let prev_log_id = match self.resolve_term(self.next_index.saturating_sub(1)).await {
            Ok(Some(term)) => LogId::new(term, self.next_index.saturating_sub(1)),
            Ok(None) => {
                // The previous entry lives inside the compacted prefix.
                self.mode = Mode::Snapshot;
                return;
            }
            Err(()) => {
                self.report_storage_failure();
                return;
            }
        };

        let request = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id,
            entries: self.inflight.clone(),
            leader_commit: self.commit_index,
            config_fingerprint: self.config_fingerprint,
        };

        let response =
            match timeout(self.heartbeat_timeout, self.network.send_append_entries(self.target, request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    tracing::warn!(error=%err, "error sending AppendEntries RPC to target");
                    self.pause_after_failure().await;
                    return;
                }
                Err(_) => {
                    tracing::warn!("timeout while sending AppendEntries RPC to target");
                    self.pause_after_failure().await;
                    return;
                }
            };
        self.backoff_ms = None;

        if response.success {
            self.on_acknowledged();
            return;
        }
        if response.term > self.term {
            tracing::debug!(peer_term = response.term, "peer is in a newer term, stepping down");
            self.revert_to_follower(response.term);
            return;
        }
        self.on_rejected(response).await;
    }

    /// The peer stored the in-flight batch.
    fn on_acknowledged(&mut self) {
        let last = match self.inflight.last() {
            Some(entry) => entry.log_id,
            // A bare heartbeat moves nothing.
            None => return,
        };
        self.matched = last;
        self.next_index = last.index + 1;
        self.inflight.clear();
        self.notify_matched();

        // An in-sync peer that drifts too far behind the head of the log is
        // better served by batched reads.
        let lag = self.last_log_index.saturating_sub(self.matched.index);
        if self.mode == Mode::InSync && lag > self.config.replication_lag_threshold {
            self.mode = Mode::CatchingUp;
        }
    }

    /// The peer refused the batch over a log mismatch: rewind to its
    /// conflict hint and decide between batching forward and snapshotting.
    async fn on_rejected(&mut self, response: AppendEntriesResponse) {
        // The batch is void either way; it is rebuilt at the new position.
        self.inflight.clear();
        self.hot.clear();

        let hint = match response.conflict_opt {
            Some(conflict) => conflict.log_id.index,
            // Without a hint, probe one entry further back.
            None => self.next_index.saturating_sub(2),
        };
        let hint = hint.min(self.last_log_index);
        self.next_index = hint + 1;

        if hint == 0 {
            // Nothing matches; rebuild the peer from the log head.
            self.matched = LogId::new(0, 0);
            self.notify_matched();
            self.mode = Mode::CatchingUp;
            return;
        }

        match self.resolve_term(hint).await {
            Ok(Some(term)) => {
                self.matched = LogId::new(term, hint);
                self.notify_matched();
                let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
                if self.last_log_index - hint >= *threshold {
                    // Replaying this much log is worse than shipping the
                    // snapshot.
                    self.mode = Mode::Snapshot;
                } else {
                    self.mode = Mode::CatchingUp;
                }
            }
            Ok(None) => {
                // The hinted entry is gone, compacted into the snapshot.
                self.mode = Mode::Snapshot;
            }
            Err(()) => self.report_storage_failure(),
        }
    }

    /// Back off after a failed exchange. The delay grows per consecutive
    /// failure up to the configured cap, so an unreachable peer keeps being
    /// probed at a steady cadence instead of a tight loop.
    async fn pause_after_failure(&mut self) {
        let schedule = &self.config.replication_backoff;
        let delay = match self.backoff_ms {
            None => schedule.initial,
            Some(ms) => ((ms as f64 * schedule.multiplier) as u64).min(schedule.max),
        };
        self.backoff_ms = Some(delay);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    /// Whether the peer is so far behind the commit index that batching it
    /// forward would replay more log than the snapshot policy tolerates.
    fn snapshot_required(&self) -> bool {
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        self.commit_index.saturating_sub(self.matched.index) >= *threshold
    }

    #[tracing::instrument(level = "trace", skip(self), fields(mode = "in-sync"))]
    async fn run_in_sync(&mut self) {
        self.announce_rate(true);
        loop {
            if self.mode != Mode::InSync {
                return;
            }

            // Un-acknowledged or backlogged entries take precedence over
            // waiting out a heartbeat.
            if !self.inflight.is_empty() || self.next_index <= self.last_log_index {
                self.send_batch().await;
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_batch().await,
                incoming = self.repl_rx.recv() => match incoming {
                    Some((event, _span)) => {
                        self.on_event(event);
                        self.drain_events();
                    }
                    None => self.mode = Mode::Closed,
                }
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(mode = "catching-up"))]
    async fn run_catch_up(&mut self) {
        self.announce_rate(false);
        self.hot.clear();
        self.inflight.clear();
        loop {
            if self.mode != Mode::CatchingUp {
                return;
            }
            if self.snapshot_required() {
                self.mode = Mode::Snapshot;
                return;
            }
            if self.next_index > self.commit_index {
                // The uncommitted suffix flows through the in-sync path.
                self.mode = Mode::InSync;
                return;
            }
            self.send_batch().await;
            self.drain_events();
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(mode = "snapshot"))]
    async fn run_snapshot(&mut self) {
        self.announce_rate(false);
        self.hot.clear();
        self.inflight.clear();

        while self.mode == Mode::Snapshot {
            let snapshot = match self.obtain_snapshot().await {
                Some(snapshot) => snapshot,
                // A snapshot is still being prepared; ask again.
                None => continue,
            };
            if let Err(err) = self.stream_snapshot(snapshot).await {
                tracing::warn!(error=%err, "error streaming snapshot to target");
                self.pause_after_failure().await;
            }
        }
    }

    /// Ask the core for the current snapshot, keeping the peer warm while
    /// one is prepared. `None` means ask again, or the mode changed.
    async fn obtain_snapshot(&mut self) -> Option<Snapshot<S::SnapshotData>> {
        let (tx, mut rx) = oneshot::channel();
        let _ = self.raft_core_tx.send((
            ReplicaEvent::NeedsSnapshot {
                target: self.target,
                tx,
            },
            tracing::debug_span!("CH"),
        ));

        loop {
            if self.mode != Mode::Snapshot {
                return None;
            }
            tokio::select! {
                _ = self.heartbeat.tick() => self.send_heartbeat().await,
                incoming = self.repl_rx.recv() => match incoming {
                    Some((event, _span)) => {
                        self.on_event(event);
                        self.drain_events();
                    }
                    None => self.mode = Mode::Closed,
                },
                // The core drops the sender while a snapshot build is in
                // progress; the error is the signal to come back for it.
                result = &mut rx => return result.ok(),
            }
        }
    }

    /// An empty frame asserting leadership and carrying the commit index,
    /// anchored at the peer's acknowledged position.
    async fn send_heartbeat(&mut self) {
        let request = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.matched,
            entries: Vec::new(),
            leader_commit: self.commit_index,
            config_fingerprint: self.config_fingerprint,
        };
        match timeout(self.heartbeat_timeout, self.network.send_append_entries(self.target, request)).await {
            Ok(Ok(response)) if response.term > self.term => self.revert_to_follower(response.term),
            Ok(Ok(_)) => self.backoff_ms = None,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, "error sending heartbeat to target");
                self.pause_after_failure().await;
            }
            Err(_) => {
                tracing::warn!("timeout while sending heartbeat to target");
                self.pause_after_failure().await;
            }
        }
    }

    /// Stream the snapshot file to the peer, chunked along its own header.
    ///
    /// The preamble declares exactly how many bytes the file holds, so the
    /// transfer stops at that boundary rather than wherever the reader runs
    /// dry, and the receiver can hold the stream to the same framing. Too
    /// many consecutive failures abandon the attempt so a stale transfer
    /// restarts from a fresh snapshot handle.
    #[tracing::instrument(level = "trace", skip(self, snapshot), fields(snapshot_id=%snapshot.meta.snapshot_id))]
    async fn stream_snapshot(&mut self, mut snapshot: Snapshot<S::SnapshotData>) -> anyhow::Result<()> {
        let mut preamble = vec![0u8; SnapshotHeader::SIZE];
        snapshot.snapshot.seek(SeekFrom::Start(0)).await?;
        snapshot.snapshot.read_exact(&mut preamble).await?;
        let header = SnapshotHeader::decode(&preamble)
            .map_err(|err| anyhow::anyhow!("local snapshot file rejected its own framing: {}", err))?;
        anyhow::ensure!(
            header.index == snapshot.meta.last_log_id.index && header.term == snapshot.meta.last_log_id.term,
            "snapshot file covers {}-{} but its metadata names {}",
            header.term,
            header.index,
            snapshot.meta.last_log_id,
        );
        let total = SnapshotHeader::SIZE as u64 + header.payload_len;

        // Once installed, the peer resumes right past the snapshot.
        self.next_index = snapshot.meta.last_log_id.index + 1;
        self.matched = snapshot.meta.last_log_id;

        let chunk_size = self.config.snapshot_max_chunk_size.max(1);
        let mut buf = vec![0u8; chunk_size as usize];
        let mut offset = 0u64;
        let mut failures = 0u32;

        loop {
            let take = (total - offset).min(chunk_size) as usize;
            snapshot.snapshot.seek(SeekFrom::Start(offset)).await?;
            snapshot.snapshot.read_exact(&mut buf[..take]).await?;
            let done = offset + take as u64 == total;

            let request = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                meta: snapshot.meta.clone(),
                offset,
                data: buf[..take].to_vec(),
                done,
            };
            tracing::debug!(offset, len = take, total, done, "sending snapshot chunk");

            let response = match timeout(
                self.install_snapshot_timeout,
                self.network.send_install_snapshot(self.target, request),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    tracing::warn!(error=%err, "error sending InstallSnapshot RPC to target");
                    failures += 1;
                    if failures >= SNAPSHOT_TRANSFER_GIVE_UP {
                        anyhow::bail!("no acknowledged chunk after {} attempts", failures);
                    }
                    self.pause_after_failure().await;
                    continue;
                }
                Err(_) => {
                    tracing::warn!("timeout while sending InstallSnapshot RPC to target");
                    failures += 1;
                    if failures >= SNAPSHOT_TRANSFER_GIVE_UP {
                        anyhow::bail!("no acknowledged chunk after {} attempts", failures);
                    }
                    self.pause_after_failure().await;
                    continue;
                }
            };
            self.backoff_ms = None;
            failures = 0;

            if response.term > self.term {
                self.revert_to_follower(response.term);
                return Ok(());
            }
            if done {
                self.mode = Mode::CatchingUp;
                return Ok(());
            }
            offset += take as u64;

            self.drain_events();
            if self.mode != Mode::Snapshot {
                return Ok(());
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An event from the Raft node down to a replication stream.
pub(crate) enum RaftEvent {
    Replicate {
        /// The new entry which needs to be replicated.
        ///
        /// This entry will always be the most recent entry to have been appended to the log, so its
        /// index is the new last_log_index value.
        entry: Arc<Entry>,
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    /// A message from Raft indicating a new commit index value.
    UpdateCommitIndex {
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    Terminate,
}

/// An event coming up from a replication stream.
pub(crate) enum ReplicaEvent<S>
where S: tokio::io::AsyncRead + tokio::io::AsyncSeek + Send + Unpin + 'static
{
    /// An event representing an update to the replication rate of a replication stream.
    RateUpdate {
        /// The ID of the Raft node to which this event relates.
        target: NodeId,
        /// A flag indicating if the corresponding target node is replicating at line rate.
        ///
        /// When replicating at line rate, the replication stream will receive log entries to
        /// replicate as soon as they are ready. When not running at line rate, the Raft node will
        /// only send over metadata without entries to replicate.
        is_line_rate: bool,
    },
    /// An event from a replication stream which updates the target node's match index.
    UpdateMatchIndex {
        /// The ID of the target node for which the match index is to be updated.
        target: NodeId,
        /// The log of the most recent log known to have been successfully replicated on the target.
        matched: LogId,
    },
    /// An event indicating that the Raft node needs to revert to follower state.
    RevertToFollower {
        /// The ID of the target node from which the new term was observed.
        target: NodeId,
        /// The new term observed.
        term: u64,
    },
    /// An event from a replication stream requesting snapshot info.
    NeedsSnapshot {
        /// The ID of the target node from which the event was sent.
        target: NodeId,
        /// The response channel for delivering the snapshot data.
        tx: oneshot::Sender<Snapshot<S>>,
    },
    /// Some critical error has taken place, and Raft needs to shutdown.
    Shutdown,
}

impl<S: tokio::io::AsyncRead + tokio::io::AsyncSeek + Send + Unpin + 'static> MessageSummary for ReplicaEvent<S> {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::RateUpdate {
                ref target,
                is_line_rate,
            } => {
                format!("RateUpdate: target: {}, is_line_rate: {}", target, is_line_rate)
            }
            ReplicaEvent::UpdateMatchIndex {
                ref target,
                ref matched,
            } => {
                format!("UpdateMatchIndex: target: {}, matched: {}", target, matched)
            }
            ReplicaEvent::RevertToFollower { ref target, ref term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            ReplicaEvent::NeedsSnapshot { ref target, .. } => {
                format!("NeedsSnapshot: target: {}", target)
            }
            ReplicaEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}
