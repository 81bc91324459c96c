//! The partitioned on-disk write-ahead log store.
//!
//! The store persists Raft log entries in fixed-range partition files with
//! an always-resident metadata table per partition, keeps a crash-consistent
//! state record, compacts the log prefix into a snapshot file, and applies
//! committed entries to the user's [`StateMachine`]. It is the crate's
//! shipped implementation of [`RaftStorage`].
//!
//! Concurrency: readers take a weak grant on `sync_root`; appends, commits,
//! truncations and snapshot installs take the strong grant. The in-memory
//! state record is additionally guarded by a reader-writer lock whose
//! optimistic stamps give readers a lock-free fast path.

mod backup;
mod cache;
mod partition;
mod snapshot;
mod state;

pub use backup::restore_backup;
pub use cache::EvictionPolicy;
pub use snapshot::SnapshotHeader;
pub use state::StateRecord;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::sync::Semaphore;

use crate::error::WalError;
use crate::membership::ClusterConfiguration;
use crate::membership::ConfigurationStorage;
use crate::membership::Membership;
use crate::membership::NodeId;
use crate::membership::PersistentConfigurationStorage;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft_types::LogId;
use crate::storage::HardState;
use crate::storage::InitialState;
use crate::storage::RaftStorage;
use crate::storage::Snapshot;
use crate::storage::SnapshotMeta;
use crate::storage::StateMachine;
use crate::sync::rwlock::AsyncReaderWriterLock;
use crate::sync::shared::AsyncSharedLock;
use crate::wal::cache::PayloadCache;
use crate::wal::partition::Partition;
use crate::wal::state::StateFile;

/// Intermediate-buffer policy for entry and state writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Leave flushing to the OS.
    NoFlush,
    /// Flush internal buffers to the OS after every write batch.
    AutoFlush,
    /// fsync after every write batch.
    WriteThrough,
}

/// Compression applied to backup archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupCompression {
    None,
    Fast,
    Optimal,
}

/// Tunables of the log store.
#[derive(Debug, Clone)]
pub struct LogStoreOptions {
    /// Number of entries per partition file.
    pub records_per_partition: u64,
    /// Pre-allocated partition file size, in bytes.
    pub initial_partition_size: u64,
    /// I/O buffer size for table scans, in bytes. At least 128.
    pub buffer_size: usize,
    /// Flush policy.
    pub write_mode: WriteMode,
    /// Keep a bounded in-memory cache of entry payloads.
    pub use_caching: bool,
    /// Capacity of the payload cache, in entries.
    pub cache_capacity: usize,
    /// Eviction policy of the payload cache.
    pub eviction_policy: EvictionPolicy,
    /// Enforce checksums on the state record; a mismatch is then fatal.
    pub integrity_check: bool,
    /// Open a fresh read handle per payload read instead of sharing one.
    pub parallel_io: bool,
    /// Concurrency level of the shared read lock. At least 2.
    pub max_concurrent_reads: u32,
    /// Compression for `create_backup`.
    pub backup_compression: BackupCompression,
    /// Bound on queued appends; excess appends wait or fail with `Busy`.
    pub queue_capacity: usize,
    /// When set, `commit` compacts the log once `commit_index -
    /// snapshot_index` exceeds this threshold. The consensus layer drives
    /// compaction through its own snapshot policy; standalone embedders set
    /// this instead.
    pub snapshot_threshold: Option<u64>,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        Self {
            records_per_partition: 128,
            initial_partition_size: 0,
            buffer_size: 4096,
            write_mode: WriteMode::AutoFlush,
            use_caching: true,
            cache_capacity: 1024,
            eviction_policy: EvictionPolicy::Lru,
            integrity_check: false,
            parallel_io: false,
            max_concurrent_reads: 10,
            backup_compression: BackupCompression::None,
            queue_capacity: 64,
            snapshot_threshold: None,
        }
    }
}

impl LogStoreOptions {
    fn normalized(mut self) -> Self {
        self.records_per_partition = self.records_per_partition.max(1);
        self.buffer_size = self.buffer_size.max(128);
        self.max_concurrent_reads = self.max_concurrent_reads.max(2);
        self.queue_capacity = self.queue_capacity.max(1);
        self
    }
}

/// Per-call append flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendOptions {
    /// Permit `start_index <= commit_index + 1`: entries overlapping the
    /// committed region must match the existing terms and are skipped, the
    /// uncommitted tail past them is overwritten.
    pub skip_committed: bool,
    /// Fail with `Busy` instead of waiting when the append queue is full.
    pub fail_fast: bool,
}

/// Descriptor of the snapshot prefix returned by reads that start at or
/// below the snapshot index.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub index: u64,
    pub term: u64,
    pub config_fingerprint: u64,
    pub payload: Bytes,
}

/// The result of a ranged read: the snapshot, when the range starts inside
/// it, followed by the entries in `(snapshot_index, to)`.
#[derive(Debug, Clone, Default)]
pub struct ReadView {
    pub snapshot: Option<SnapshotInfo>,
    pub entries: Vec<Entry>,
}

pub const STATE_FILENAME: &str = "state.bin";
pub const SNAPSHOT_FILENAME: &str = "snapshot.bin";
pub const SNAPSHOT_PARTIAL_FILENAME: &str = "snapshot.partial";
pub const PARTITIONS_DIRNAME: &str = "partitions";

/// The partitioned log store.
pub struct LogStore<M: StateMachine> {
    dir: PathBuf,
    partitions_dir: PathBuf,
    options: LogStoreOptions,
    machine: M,
    configs: Arc<PersistentConfigurationStorage>,

    /// Weak for reads, strong for appends/commits/truncations/snapshots.
    sync_root: AsyncSharedLock,
    /// Guards the state record; optimistic stamps serve lock-free reads.
    state_lock: AsyncReaderWriterLock,
    state_file: StateFile,
    state: RwLock<StateRecord>,

    snapshot_info: RwLock<Option<SnapshotHeader>>,
    partitions: RwLock<BTreeMap<u64, Arc<Partition>>>,
    cache: Option<PayloadCache>,
    membership: RwLock<Membership>,
    /// Index of an appended-but-uncommitted configuration entry, if any.
    pending_config: RwLock<Option<u64>>,

    append_gate: Semaphore,
    closed: AtomicBool,
    /// Set on fatal corruption: the store refuses appends but serves reads.
    drained: AtomicBool,
    snapshot_seq: AtomicU64,
}

impl<M: StateMachine> LogStore<M> {
    /// Open or create a store under `dir`, recovering from whatever state a
    /// previous process left behind.
    #[tracing::instrument(level = "debug", skip(machine, options), fields(dir=%dir.as_ref().display()))]
    pub async fn open<P: AsRef<Path>>(
        dir: P,
        node_id: NodeId,
        options: LogStoreOptions,
        machine: M,
    ) -> Result<Self, WalError> {
        let options = options.normalized();
        let dir = dir.as_ref().to_path_buf();
        let partitions_dir = dir.join(PARTITIONS_DIRNAME);
        tokio::fs::create_dir_all(&partitions_dir).await?;

        let (state_file, mut record, fresh) =
            StateFile::open(&dir.join(STATE_FILENAME), node_id, options.integrity_check).await?;
        if record.node_id != node_id {
            return Err(WalError::Corruption(format!(
                "state record belongs to node {}, not {}",
                record.node_id, node_id
            )));
        }

        let snapshot_header = snapshot::read_header(&dir.join(SNAPSHOT_FILENAME)).await?;

        let configs = Arc::new(PersistentConfigurationStorage::new(
            &dir,
            ClusterConfiguration::new_initial(node_id, String::new()),
        ));
        configs.load().await.map_err(|e| WalError::Corruption(e.to_string()))?;

        // Open every existing partition.
        let mut partitions = BTreeMap::new();
        let mut names = tokio::fs::read_dir(&partitions_dir).await?;
        while let Some(dirent) = names.next_entry().await? {
            let name = dirent.file_name();
            let name = name.to_string_lossy();
            if let Some(number) = name.strip_suffix(".dat").and_then(|n| n.parse::<u64>().ok()) {
                let partition = Partition::open(
                    &partitions_dir,
                    number,
                    options.records_per_partition,
                    options.buffer_size,
                    options.parallel_io,
                )
                .await?;
                partitions.insert(number, Arc::new(partition));
            }
        }

        // A brand-new store gets partition 0 with the zero-term sentinel in
        // slot 0, which answers prev_log queries at the log head.
        if fresh && partitions.is_empty() {
            let p0 = Partition::create(
                &partitions_dir,
                0,
                options.records_per_partition,
                options.initial_partition_size,
                options.parallel_io,
            )
            .await?;
            let sentinel = Entry {
                log_id: LogId::new(0, 0),
                timestamp: 0,
                payload: EntryPayload::Blank,
            };
            p0.append_entry(&sentinel).await?;
            p0.flush(WriteMode::WriteThrough).await?;
            partitions.insert(0, Arc::new(p0));
        }

        // Reconcile the state record against the partitions on disk.
        let scanned_last = partitions
            .values()
            .rev()
            .find_map(|p| p.highest_present_index())
            .filter(|index| *index > 0);
        let snapshot_index = snapshot_header.map(|h| h.index).unwrap_or(0);
        match scanned_last {
            Some(scanned) if scanned > record.last_index && record.last_index >= snapshot_index => {
                // Entries were written but the state record never made it to
                // disk; drop the orphaned suffix.
                tracing::warn!(scanned, recorded = record.last_index, "truncating entries past the state record");
                if let Some(p) = partitions.values().find(|p| p.holds(record.last_index + 1)) {
                    p.truncate_from(record.last_index + 1).await?;
                }
                let doomed: Vec<u64> =
                    partitions.range(record.last_index / options.records_per_partition + 1..).map(|(n, _)| *n).collect();
                for number in doomed {
                    if let Some(p) = partitions.remove(&number) {
                        p.delete().await?;
                    }
                }
            }
            Some(scanned) if scanned < record.last_index && scanned >= snapshot_index => {
                // The tail never reached disk; fall back to what survived.
                tracing::warn!(scanned, recorded = record.last_index, "state record ahead of log, rolling back");
                record.last_index = scanned;
                record.last_term = partitions
                    .values()
                    .find(|p| p.holds(scanned))
                    .and_then(|p| p.metadata(scanned))
                    .map(|m| m.term as u64)
                    .unwrap_or(0);
            }
            _ => {}
        }
        if let Some(h) = snapshot_header {
            if record.last_index < h.index {
                record.last_index = h.index;
                record.last_term = h.term;
            }
            record.commit_index = record.commit_index.max(h.index);
        }
        record.commit_index = record.commit_index.min(record.last_index);

        let membership = Membership {
            active: configs.active(),
            proposed: configs.proposed(),
        };

        let cache = if options.use_caching {
            Some(PayloadCache::new(options.cache_capacity, options.eviction_policy))
        } else {
            None
        };

        let store = Self {
            dir,
            partitions_dir,
            sync_root: AsyncSharedLock::new(options.max_concurrent_reads),
            state_lock: AsyncReaderWriterLock::new(),
            append_gate: Semaphore::new(options.queue_capacity),
            options,
            machine,
            configs,
            state_file,
            state: RwLock::new(record),
            snapshot_info: RwLock::new(snapshot_header),
            partitions: RwLock::new(partitions),
            cache,
            membership: RwLock::new(membership),
            pending_config: RwLock::new(None),
            closed: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            snapshot_seq: AtomicU64::new(0),
        };
        store.persist_state(WriteMode::WriteThrough).await?;
        Ok(store)
    }

    /// The configuration storage backing this store.
    pub fn configuration_storage(&self) -> Arc<PersistentConfigurationStorage> {
        self.configs.clone()
    }

    /// The state machine this store applies committed entries to.
    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// A consistent copy of the state record. Optimistic fast path, shared
    /// lock on contention with a writer.
    pub async fn state_snapshot(&self) -> StateRecord {
        let stamp = self.state_lock.try_optimistic_read();
        let record = *self.state.read().unwrap();
        if self.state_lock.validate(&stamp) {
            return record;
        }
        let _guard = self.state_lock.read().await;
        *self.state.read().unwrap()
    }

    pub async fn last_index(&self) -> u64 {
        self.state_snapshot().await.last_index
    }

    pub async fn commit_index(&self) -> u64 {
        self.state_snapshot().await.commit_index
    }

    pub async fn snapshot_index(&self) -> u64 {
        self.snapshot_info.read().unwrap().map(|h| h.index).unwrap_or(0)
    }

    pub async fn hard_state(&self) -> HardState {
        let record = self.state_snapshot().await;
        HardState {
            current_term: record.current_term,
            voted_for: record.voted_for,
        }
    }

    fn ensure_open(&self) -> Result<(), WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), WalError> {
        self.ensure_open()?;
        if self.drained.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }
        Ok(())
    }

    /// Mutate and persist the state record under the state write lock.
    async fn mutate_state<F>(&self, mode: WriteMode, f: F) -> Result<StateRecord, WalError>
    where F: FnOnce(&mut StateRecord) {
        let _guard = self.state_lock.write().await?;
        let record = {
            let mut state = self.state.write().unwrap();
            f(&mut state);
            *state
        };
        self.state_file.save(&record, mode).await?;
        Ok(record)
    }

    async fn persist_state(&self, mode: WriteMode) -> Result<(), WalError> {
        let record = *self.state.read().unwrap();
        self.state_file.save(&record, mode).await
    }

    fn partition_of(&self, index: u64) -> Option<Arc<Partition>> {
        let number = index / self.options.records_per_partition;
        self.partitions.read().unwrap().get(&number).cloned()
    }

    /// The term of the entry at `index`, consulting the snapshot boundary.
    async fn term_of(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if let Some(h) = *self.snapshot_info.read().unwrap() {
            if index == h.index {
                return Some(h.term);
            }
            if index < h.index {
                return None;
            }
        }
        self.partition_of(index).and_then(|p| p.metadata(index)).map(|m| m.term as u64)
    }

    /// Fetch the entry at `index` through the cache.
    async fn entry_at(&self, index: u64) -> Result<Option<Entry>, WalError> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(index) {
                return Ok(Some(hit));
            }
        }
        let partition = match self.partition_of(index) {
            Some(p) => p,
            None => return Ok(None),
        };
        let entry = partition.read_entry(index).await?;
        if let (Some(cache), Some(entry)) = (&self.cache, &entry) {
            cache.put(entry.clone());
        }
        Ok(entry)
    }

    /// Append contiguous entries beginning at `start_index`.
    ///
    /// `start_index` must equal `last_index + 1`, unless `skip_committed` is
    /// set and `start_index <= commit_index + 1`: entries overlapping the
    /// committed region must then match the existing terms and are skipped,
    /// while the uncommitted tail is truncated and overwritten.
    ///
    /// Returns the new last index.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    pub async fn append(&self, entries: &[Entry], opts: AppendOptions) -> Result<u64, WalError> {
        self.ensure_writable()?;

        let _permit = if opts.fail_fast {
            self.append_gate.try_acquire().map_err(|_| WalError::Busy)?
        } else {
            self.append_gate.acquire().await.map_err(|_| WalError::Closed)?
        };
        let _strong = self.sync_root.acquire_strong().await?;
        self.ensure_writable()?;

        let record = *self.state.read().unwrap();
        if entries.is_empty() {
            return Ok(record.last_index);
        }

        let start_index = entries[0].log_id.index;
        for (n, entry) in entries.iter().enumerate() {
            if entry.log_id.index != start_index + n as u64 {
                return Err(WalError::OutOfOrder {
                    expected: start_index + n as u64,
                    got: entry.log_id.index,
                });
            }
        }

        let batch_end = entries.last().expect("entries checked non-empty").log_id.index;
        let mut write_from = start_index;
        if start_index != record.last_index + 1 {
            if !(opts.skip_committed && start_index <= record.commit_index + 1) {
                return Err(WalError::OutOfOrder {
                    expected: record.last_index + 1,
                    got: start_index,
                });
            }
            // Entries at or below the commit index must agree with what is
            // already durable.
            for entry in entries.iter().take_while(|e| e.log_id.index <= record.commit_index) {
                match self.term_of(entry.log_id.index).await {
                    Some(term) if term == entry.log_id.term => {}
                    _ => return Err(WalError::AlreadyCommitted(entry.log_id.index)),
                }
            }
            write_from = record.commit_index + 1;
            if batch_end < write_from {
                // The whole batch lies inside the committed region: a
                // duplicate delivery, nothing to write.
                return Ok(record.last_index);
            }
            if record.last_index >= write_from {
                self.truncate_tail(write_from).await?;
            }
        }

        let mut touched: Vec<Arc<Partition>> = Vec::new();
        for entry in entries.iter().skip_while(|e| e.log_id.index < write_from) {
            let index = entry.log_id.index;
            let number = index / self.options.records_per_partition;
            let existing = { self.partitions.read().unwrap().get(&number).cloned() };
            let partition = match existing {
                Some(p) => p,
                None => {
                    let created = Arc::new(
                        Partition::create(
                            &self.partitions_dir,
                            number,
                            self.options.records_per_partition,
                            self.options.initial_partition_size,
                            self.options.parallel_io,
                        )
                        .await?,
                    );
                    self.partitions.write().unwrap().insert(number, created.clone());
                    created
                }
            };
            partition.append_entry(entry).await?;
            if let Some(cache) = &self.cache {
                cache.put(entry.clone());
            }
            if !touched.iter().any(|p| p.number == partition.number) {
                touched.push(partition);
            }
            if let EntryPayload::ConfigChange(change) = &entry.payload {
                self.record_proposed_config(index, &change.membership).await;
            }
        }
        for partition in &touched {
            partition.flush(self.options.write_mode).await?;
        }

        let last = entries.last().expect("entries checked non-empty");
        let new_last = self
            .mutate_state(self.options.write_mode, |s| {
                s.last_index = last.log_id.index;
                s.last_term = last.log_id.term;
            })
            .await?;
        Ok(new_last.last_index)
    }

    /// Track an appended configuration entry: it becomes the proposed
    /// configuration until its commit applies it.
    async fn record_proposed_config(&self, index: u64, membership: &Membership) {
        if let Some(proposed) = &membership.proposed {
            let _ = self.configs.propose(proposed.clone()).await;
            *self.pending_config.write().unwrap() = Some(index);
        }
        *self.membership.write().unwrap() = membership.clone();
    }

    /// Drop the uncommitted tail starting at `index`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn drop_entries_starting_at(&self, index: u64) -> Result<(), WalError> {
        self.ensure_writable()?;
        let _strong = self.sync_root.acquire_strong().await?;

        let record = *self.state.read().unwrap();
        if index <= record.commit_index {
            return Err(WalError::AlreadyCommitted(index));
        }
        if index > record.last_index {
            return Ok(());
        }
        self.truncate_tail(index).await?;
        Ok(())
    }

    /// Remove entries at and above `from`, assuming the caller holds the
    /// strong grant and has validated commit-index safety.
    async fn truncate_tail(&self, from: u64) -> Result<(), WalError> {
        let record = *self.state.read().unwrap();
        let old_last = record.last_index;
        if from > old_last {
            return Ok(());
        }

        let keep_partition = from / self.options.records_per_partition;
        let survivor = { self.partitions.read().unwrap().get(&keep_partition).cloned() };
        if let Some(p) = survivor {
            p.truncate_from(from).await?;
            p.flush(self.options.write_mode).await?;
        }
        let doomed: Vec<u64> = self.partitions.read().unwrap().range(keep_partition + 1..).map(|(n, _)| *n).collect();
        for number in doomed {
            let removed = self.partitions.write().unwrap().remove(&number);
            if let Some(p) = removed {
                p.delete().await?;
            }
        }
        if let Some(cache) = &self.cache {
            cache.remove_range(from, old_last);
        }

        // A dropped configuration entry takes its proposal with it.
        let dropped_config = {
            let pending = self.pending_config.read().unwrap();
            matches!(*pending, Some(at) if at >= from)
        };
        if dropped_config {
            *self.pending_config.write().unwrap() = None;
            let mut membership = self.membership.write().unwrap();
            membership.proposed = None;
        }

        let new_last = from - 1;
        let new_term = self.term_of(new_last).await.unwrap_or(0);
        self.mutate_state(self.options.write_mode, |s| {
            s.last_index = new_last;
            s.last_term = new_term;
        })
        .await?;
        Ok(())
    }

    /// Read `[from, to)`. When `from` lies at or below the snapshot index
    /// the view opens with the snapshot, followed by the entries in
    /// `(snapshot_index, to)`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn read(&self, from: u64, to: u64) -> Result<ReadView, WalError> {
        self.ensure_open()?;
        let _weak = self.sync_root.acquire_weak().await?;

        let mut view = ReadView::default();
        if from >= to {
            return Ok(view);
        }
        let record = *self.state.read().unwrap();
        let to = to.min(record.last_index + 1);

        let mut start = from;
        let snapshot_boundary = { *self.snapshot_info.read().unwrap() };
        if let Some(h) = snapshot_boundary {
            if from <= h.index {
                let payload = snapshot::read_payload(&self.dir.join(SNAPSHOT_FILENAME)).await?;
                view.snapshot = Some(SnapshotInfo {
                    index: h.index,
                    term: h.term,
                    config_fingerprint: h.config_fingerprint,
                    payload,
                });
                start = h.index + 1;
            }
        }
        for index in start..to {
            match self.entry_at(index).await? {
                Some(entry) => view.entries.push(entry),
                None => {
                    return Err(WalError::Corruption(format!("log entry {} missing from partition files", index)))
                }
            }
        }
        Ok(view)
    }

    /// Advance the commit index to `min(up_to, last_index)`, applying every
    /// newly committed entry to the state machine in order. Returns the
    /// number of entries applied.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn commit(&self, up_to: u64) -> Result<u64, WalError> {
        self.ensure_writable()?;
        let _strong = self.sync_root.acquire_strong().await?;
        let applied = self.commit_locked(up_to).await?.len() as u64;

        if let Some(threshold) = self.options.snapshot_threshold {
            let record = *self.state.read().unwrap();
            let snapshot_index = self.snapshot_index().await;
            if record.commit_index.saturating_sub(snapshot_index) > threshold {
                self.compact_locked().await?;
            }
        }
        Ok(applied)
    }

    /// Commit + apply while already holding the strong grant.
    async fn commit_locked(&self, up_to: u64) -> Result<Vec<M::Response>, WalError> {
        let record = *self.state.read().unwrap();
        let new_commit = up_to.min(record.last_index);
        if new_commit <= record.commit_index {
            return Ok(Vec::new());
        }

        let mut responses = Vec::new();
        for index in record.commit_index + 1..=new_commit {
            let entry = self
                .entry_at(index)
                .await?
                .ok_or_else(|| WalError::Corruption(format!("committed entry {} missing", index)))?;
            if let Some(response) = self.apply_one(&entry).await? {
                responses.push(response);
            }
            self.mutate_state(self.options.write_mode, |s| s.commit_index = index).await?;
        }
        Ok(responses)
    }

    async fn apply_one(&self, entry: &Entry) -> Result<Option<M::Response>, WalError> {
        match &entry.payload {
            EntryPayload::Normal(_) => {
                let response = self
                    .machine
                    .apply(entry)
                    .await
                    .map_err(|e| WalError::Corruption(format!("state machine apply failed: {}", e)))?;
                Ok(Some(response))
            }
            EntryPayload::ConfigChange(change) => {
                self.apply_config_entry(entry.log_id.index, &change.membership).await?;
                Ok(None)
            }
            EntryPayload::Blank | EntryPayload::PurgedMarker => Ok(None),
        }
    }

    /// A committed configuration entry promotes the configuration it
    /// carried, persists it as the active configuration and notifies
    /// observers and `wait_for_apply` futures.
    async fn apply_config_entry(&self, index: u64, membership: &Membership) -> Result<(), WalError> {
        let done = membership.to_final();
        self.configs
            .propose(done.active.clone())
            .await
            .map_err(|e| WalError::Corruption(format!("persisting configuration failed: {}", e)))?;
        self.configs
            .apply()
            .await
            .map_err(|e| WalError::Corruption(format!("applying configuration failed: {}", e)))?;

        let fingerprint = done.active.fingerprint;
        *self.membership.write().unwrap() = done;
        {
            let mut pending = self.pending_config.write().unwrap();
            if matches!(*pending, Some(at) if at <= index) {
                *pending = None;
            }
        }
        self.mutate_state(self.options.write_mode, |s| s.config_fingerprint = fingerprint).await?;
        Ok(())
    }

    /// Compact the log: snapshot the state machine at the commit index and
    /// delete every partition the snapshot fully covers.
    pub async fn compact(&self) -> Result<SnapshotHeader, WalError> {
        self.ensure_writable()?;
        let _strong = self.sync_root.acquire_strong().await?;
        self.compact_locked().await
    }

    async fn compact_locked(&self) -> Result<SnapshotHeader, WalError> {
        let record = *self.state.read().unwrap();
        if record.commit_index == 0 {
            return Err(WalError::Corruption("nothing to compact: commit index is 0".into()));
        }
        let term = self
            .term_of(record.commit_index)
            .await
            .ok_or_else(|| WalError::Corruption("commit index has no resolvable term".into()))?;

        let payload = self
            .machine
            .snapshot()
            .await
            .map_err(|e| WalError::Corruption(format!("state machine snapshot failed: {}", e)))?;
        let header = SnapshotHeader {
            index: record.commit_index,
            term,
            config_fingerprint: record.config_fingerprint,
            payload_len: payload.len() as u64,
        };
        snapshot::write_snapshot(&self.dir.join(SNAPSHOT_FILENAME), &header, &payload).await?;
        *self.snapshot_info.write().unwrap() = Some(header);

        self.delete_covered_partitions(header.index).await?;
        Ok(header)
    }

    /// Delete partitions whose full range lies at or below `index`.
    async fn delete_covered_partitions(&self, index: u64) -> Result<(), WalError> {
        let doomed: Vec<u64> = self
            .partitions
            .read()
            .unwrap()
            .values()
            .filter(|p| p.last_index() <= index)
            .map(|p| p.number)
            .collect();
        for number in doomed {
            let removed = self.partitions.write().unwrap().remove(&number);
            if let Some(p) = removed {
                p.delete().await?;
            }
        }
        if let Some(cache) = &self.cache {
            cache.remove_range(0, index);
        }
        Ok(())
    }

    /// Install a complete snapshot at `(index, term)`, replacing the covered
    /// log prefix and restoring the state machine from `payload`.
    #[tracing::instrument(level = "debug", skip(self, payload))]
    pub async fn install_snapshot(
        &self,
        index: u64,
        term: u64,
        config_fingerprint: u64,
        payload: Bytes,
    ) -> Result<(), WalError> {
        self.ensure_writable()?;
        let _strong = self.sync_root.acquire_strong().await?;
        self.install_snapshot_locked(index, term, config_fingerprint, payload, None).await
    }

    async fn install_snapshot_locked(
        &self,
        index: u64,
        term: u64,
        config_fingerprint: u64,
        payload: Bytes,
        membership: Option<Membership>,
    ) -> Result<(), WalError> {
        let header = SnapshotHeader {
            index,
            term,
            config_fingerprint,
            payload_len: payload.len() as u64,
        };
        snapshot::write_snapshot(&self.dir.join(SNAPSHOT_FILENAME), &header, &payload).await?;
        *self.snapshot_info.write().unwrap() = Some(header);

        self.machine
            .restore(payload)
            .await
            .map_err(|e| WalError::Corruption(format!("state machine restore failed: {}", e)))?;

        if let Some(membership) = membership {
            let final_membership = membership.to_final();
            let _ = self.configs.propose(final_membership.active.clone()).await;
            let _ = self.configs.apply().await;
            *self.membership.write().unwrap() = final_membership;
            *self.pending_config.write().unwrap() = None;
        }

        self.delete_covered_partitions(index).await?;
        self.mutate_state(WriteMode::WriteThrough, |s| {
            if s.last_index < index {
                s.last_index = index;
                s.last_term = term;
            }
            s.commit_index = s.commit_index.max(index);
            s.config_fingerprint = config_fingerprint;
        })
        .await?;
        Ok(())
    }

    /// Serialize the store's files into a backup archive at `dest`.
    pub async fn create_backup<P: AsRef<Path>>(&self, dest: P) -> Result<(), WalError> {
        self.ensure_open()?;
        // Hold the strong grant so the archive sees a consistent store.
        let _strong = self.sync_root.acquire_strong().await?;
        backup::create_backup(&self.dir, dest.as_ref(), self.options.backup_compression).await
    }

    /// Mark the store drained: reads keep working, appends are refused.
    fn drain(&self) {
        self.drained.store(true, Ordering::Release);
    }

    /// Close the store. Every subsequent operation fails with `Closed`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn fatal(&self, err: WalError) -> WalError {
        if err.is_fatal() {
            tracing::error!(error=%err, "fatal log store failure, draining");
            self.drain();
        }
        err
    }

    fn current_membership(&self) -> Membership {
        self.membership.read().unwrap().clone()
    }

    fn next_snapshot_id(&self, log_id: LogId) -> String {
        let seq = self.snapshot_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", log_id.term, log_id.index, seq)
    }

    fn resolve_range<RNG: RangeBounds<u64>>(&self, range: RNG, last_index: u64) -> (u64, u64) {
        let start = match range.start_bound() {
            Bound::Included(v) => *v,
            Bound::Excluded(v) => *v + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(v) => *v + 1,
            Bound::Excluded(v) => *v,
            Bound::Unbounded => last_index + 1,
        };
        (start, end)
    }
}

#[async_trait]
impl<M: StateMachine> RaftStorage for LogStore<M> {
    type SnapshotData = tokio::fs::File;
    type Response = M::Response;
    type ShutdownError = WalError;

    async fn get_membership(&self) -> anyhow::Result<Membership> {
        Ok(self.current_membership())
    }

    async fn get_initial_state(&self) -> anyhow::Result<InitialState> {
        let record = self.state_snapshot().await;
        let membership = self.current_membership();
        let last_applied_term = self.term_of(record.commit_index).await.unwrap_or(0);
        Ok(InitialState {
            last_log_id: LogId::new(record.last_term, record.last_index),
            last_applied_log: LogId::new(last_applied_term, record.commit_index),
            hard_state: HardState {
                current_term: record.current_term,
                voted_for: record.voted_for,
            },
            membership,
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> anyhow::Result<()> {
        // A vote must be durable before the node answers the candidate.
        self.mutate_state(WriteMode::WriteThrough, |s| {
            s.current_term = hs.current_term;
            s.voted_for = hs.voted_for;
        })
        .await?;
        Ok(())
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> anyhow::Result<Vec<Entry>> {
        let record = self.state_snapshot().await;
        let (start, end) = self.resolve_range(range, record.last_index);
        if start >= end {
            return Ok(Vec::new());
        }

        let snapshot_boundary = {
            let info = self.snapshot_info.read().unwrap();
            *info
        };
        let mut out = Vec::new();
        let mut from = start;
        if let Some(h) = snapshot_boundary {
            if start <= h.index {
                // Mirror the compacted prefix as a purged marker so callers
                // can detect that a snapshot transfer is required.
                out.push(Entry::new_purged_marker(LogId::new(h.term, h.index)));
                from = h.index + 1;
            }
        }
        let view = self.read(from.max(1), end).await.map_err(|e| anyhow::Error::new(self.fatal(e)))?;
        out.extend(view.entries);
        Ok(out)
    }

    async fn try_get_log_entry(&self, log_index: u64) -> anyhow::Result<Option<Entry>> {
        if let Some(h) = *self.snapshot_info.read().unwrap() {
            if log_index == h.index {
                return Ok(Some(Entry::new_purged_marker(LogId::new(h.term, h.index))));
            }
            if log_index < h.index {
                return Ok(None);
            }
        }
        if log_index == 0 {
            return Ok(Some(Entry {
                log_id: LogId::new(0, 0),
                timestamp: 0,
                payload: EntryPayload::Blank,
            }));
        }
        Ok(self.entry_at(log_index).await?)
    }

    async fn get_last_log_id(&self) -> anyhow::Result<LogId> {
        let record = self.state_snapshot().await;
        Ok(LogId::new(record.last_term, record.last_index))
    }

    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> anyhow::Result<()> {
        let record = self.state_snapshot().await;
        let (start, end) = self.resolve_range(range.clone(), record.last_index);
        if end > record.last_index {
            // Tail truncation for leader-enforced reconciliation.
            self.drop_entries_starting_at(start).await.map_err(|e| anyhow::Error::new(self.fatal(e)))?;
        } else {
            anyhow::bail!("unsupported log deletion range {:?}", range);
        }
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry]) -> anyhow::Result<()> {
        let owned: Vec<Entry> = entries.iter().map(|e| (*e).clone()).collect();
        self.append(&owned, AppendOptions {
            skip_committed: true,
            fail_fast: false,
        })
        .await
        .map_err(|e| anyhow::Error::new(self.fatal(e)))?;
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[&Entry]) -> anyhow::Result<Vec<Self::Response>> {
        let up_to = match entries.last() {
            Some(entry) => entry.log_id.index,
            None => return Ok(Vec::new()),
        };
        let _strong = self.sync_root.acquire_strong().await.map_err(WalError::from)?;
        let responses = self.commit_locked(up_to).await.map_err(|e| anyhow::Error::new(self.fatal(e)))?;
        Ok(responses)
    }

    async fn do_log_compaction(&self) -> anyhow::Result<Snapshot<Self::SnapshotData>> {
        let header = self.compact().await.map_err(|e| anyhow::Error::new(self.fatal(e)))?;
        let log_id = LogId::new(header.term, header.index);
        let file = tokio::fs::File::open(self.dir.join(SNAPSHOT_FILENAME)).await?;
        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: log_id,
                membership: self.current_membership(),
                snapshot_id: self.next_snapshot_id(log_id),
            },
            snapshot: Box::new(file),
        })
    }

    async fn begin_receiving_snapshot(&self) -> anyhow::Result<Box<Self::SnapshotData>> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.dir.join(SNAPSHOT_PARTIAL_FILENAME))
            .await?;
        Ok(Box::new(file))
    }

    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        mut snapshot: Box<Self::SnapshotData>,
    ) -> anyhow::Result<()> {
        // The streamed bytes are a complete snapshot file; pull the payload
        // back out of the sender's header framing.
        snapshot.seek(std::io::SeekFrom::Start(0)).await?;
        let mut raw = Vec::new();
        snapshot.read_to_end(&mut raw).await?;
        drop(snapshot);
        anyhow::ensure!(raw.len() >= SnapshotHeader::SIZE, "received snapshot is shorter than its header");
        let payload = Bytes::from(raw.split_off(SnapshotHeader::SIZE));

        let _strong = self.sync_root.acquire_strong().await.map_err(WalError::from)?;
        self.install_snapshot_locked(
            meta.last_log_id.index,
            meta.last_log_id.term,
            meta.membership.active.fingerprint,
            payload,
            Some(meta.membership.clone()),
        )
        .await
        .map_err(|e| anyhow::Error::new(self.fatal(e)))?;
        let _ = tokio::fs::remove_file(self.dir.join(SNAPSHOT_PARTIAL_FILENAME)).await;
        Ok(())
    }

    async fn get_current_snapshot(&self) -> anyhow::Result<Option<Snapshot<Self::SnapshotData>>> {
        let header = match *self.snapshot_info.read().unwrap() {
            Some(h) => h,
            None => return Ok(None),
        };
        let file = tokio::fs::File::open(self.dir.join(SNAPSHOT_FILENAME))
            .await
            .context("opening current snapshot")?;
        let log_id = LogId::new(header.term, header.index);
        Ok(Some(Snapshot {
            meta: SnapshotMeta {
                last_log_id: log_id,
                membership: self.current_membership(),
                snapshot_id: self.next_snapshot_id(log_id),
            },
            snapshot: Box::new(file),
        }))
    }
}
