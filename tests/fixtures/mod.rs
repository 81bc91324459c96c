//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use maplit::btreemap;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use raftwal::membership::NodeId;
use raftwal::metrics::RaftMetrics;
use raftwal::raft::AppendEntriesRequest;
use raftwal::raft::AppendEntriesResponse;
use raftwal::raft::ClientWriteRequest;
use raftwal::raft::Entry;
use raftwal::raft::EntryPayload;
use raftwal::raft::InstallSnapshotRequest;
use raftwal::raft::InstallSnapshotResponse;
use raftwal::raft::PreVoteRequest;
use raftwal::raft::PreVoteResponse;
use raftwal::raft::SynchronizeResponse;
use raftwal::raft::VoteRequest;
use raftwal::raft::VoteResponse;
use raftwal::storage::StateMachine;
use raftwal::wal::LogStore;
use raftwal::wal::LogStoreOptions;
use raftwal::Config;
use raftwal::Raft;
use raftwal::RaftNetwork;
use raftwal::State;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<Arc<RaftRouter>, LogStore<TestStateMachine>>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A simple state machine recording every applied command in order.
#[derive(Default)]
pub struct TestStateMachine {
    inner: StdMutex<TestStateMachineInner>,
}

#[derive(Default, Clone)]
struct TestStateMachineInner {
    last_applied: u64,
    applied: Vec<(u64, Bytes)>,
}

impl TestStateMachine {
    /// The index of the last applied entry.
    pub fn last_applied(&self) -> u64 {
        self.inner.lock().unwrap().last_applied
    }

    /// All applied commands in application order.
    pub fn applied(&self) -> Vec<(u64, Bytes)> {
        self.inner.lock().unwrap().applied.clone()
    }
}

#[async_trait]
impl StateMachine for TestStateMachine {
    type Response = u64;

    async fn apply(&self, entry: &Entry) -> Result<Self::Response> {
        let mut inner = self.inner.lock().unwrap();
        let index = entry.log_id.index;
        // Re-applying an already-applied entry is a no-op.
        if index <= inner.last_applied {
            return Ok(index);
        }
        if let EntryPayload::Normal(normal) = &entry.payload {
            inner.applied.push((index, normal.data.clone()));
        }
        inner.last_applied = index;
        Ok(index)
    }

    async fn snapshot(&self) -> Result<Bytes> {
        let inner = self.inner.lock().unwrap().clone();
        let mut buf = BytesMut::new();
        buf.put_u64_le(inner.last_applied);
        buf.put_u32_le(inner.applied.len() as u32);
        for (index, data) in &inner.applied {
            buf.put_u64_le(*index);
            buf.put_u32_le(data.len() as u32);
            buf.put_slice(data);
        }
        Ok(buf.freeze())
    }

    async fn restore(&self, snapshot: Bytes) -> Result<()> {
        let mut buf = snapshot;
        let last_applied = buf.get_u64_le();
        let count = buf.get_u32_le();
        let mut applied = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let index = buf.get_u64_le();
            let len = buf.get_u32_le() as usize;
            applied.push((index, buf.copy_to_bytes(len)));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.last_applied = last_applied;
        inner.applied = applied;
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A type which emulates a network transport and implements the `RaftNetwork` trait.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The log store options applied to every node.
    store_options: LogStoreOptions,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, (MemRaft, Arc<LogStore<TestStateMachine>>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
    /// The data directory of every node, kept alive (and reusable) across
    /// simulated crashes.
    dirs: StdMutex<BTreeMap<NodeId, tempfile::TempDir>>,

    /// To emulate network delay for sending, in milliseconds. 0 means no delay.
    send_delay: u64,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_store_options(config, LogStoreOptions::default())
    }

    pub fn with_store_options(config: Arc<Config>, store_options: LogStoreOptions) -> Self {
        Self {
            config,
            store_options,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
            dirs: Default::default(),
            send_delay: 0,
        }
    }

    /// Create and register a new Raft node bearing the given ID.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) {
        let dir = tempfile::tempdir().expect("creating node data dir");
        let store = LogStore::open(dir.path(), id, self.store_options.clone(), TestStateMachine::default())
            .await
            .expect("opening log store");
        self.dirs.lock().unwrap().insert(id, dir);
        self.register_node(id, Arc::new(store)).await;
    }

    async fn register_node(self: &Arc<Self>, id: NodeId, store: Arc<LogStore<TestStateMachine>>) {
        let node = Raft::new(id, self.config.clone(), Arc::new(self.clone()), store.clone());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (node, store));
    }

    /// Shut a node down and drop it from the routing table, keeping its data
    /// directory for a later restart.
    pub async fn kill_node(&self, id: NodeId) -> Result<()> {
        let entry = {
            let mut rt = self.routing_table.write().await;
            rt.remove(&id)
        };
        if let Some((node, store)) = entry {
            node.shutdown().await?;
            store.close().await;
        }
        Ok(())
    }

    /// Restart a previously killed node from its surviving data directory.
    pub async fn restart_node(self: &Arc<Self>, id: NodeId) -> Result<()> {
        let path = {
            let dirs = self.dirs.lock().unwrap();
            dirs.get(&id).ok_or_else(|| anyhow!("no data dir for node {}", id))?.path().to_path_buf()
        };
        let store = LogStore::open(&path, id, self.store_options.clone(), TestStateMachine::default()).await?;
        self.register_node(id, Arc::new(store)).await;
        Ok(())
    }

    /// Initialize the target node with the given members.
    pub async fn initialize_with(&self, node: NodeId, members: BTreeMap<NodeId, String>) -> Result<()> {
        let handle = self.get_raft_handle(&node).await?;
        handle.initialize(members).await?;
        Ok(())
    }

    /// Initialize a cluster of the given members, seeded from the first.
    pub async fn initialize_cluster(&self, members: &[NodeId]) -> Result<()> {
        let map: BTreeMap<NodeId, String> = members.iter().map(|id| (*id, format!("node-{}", id))).collect();
        let seed = *members.first().ok_or_else(|| anyhow!("empty member list"))?;
        self.initialize_with(seed, map).await
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    /// Get a handle to the target node.
    pub async fn get_raft_handle(&self, id: &NodeId) -> Result<MemRaft> {
        let rt = self.routing_table.read().await;
        let (node, _) = rt.get(id).ok_or_else(|| anyhow!("node {} not found in routing table", id))?;
        Ok(node.clone())
    }

    /// Get a handle to the target node's storage.
    pub async fn get_storage_handle(&self, id: &NodeId) -> Result<Arc<LogStore<TestStateMachine>>> {
        let rt = self.routing_table.read().await;
        let (_, store) = rt.get(id).ok_or_else(|| anyhow!("node {} not found in routing table", id))?;
        Ok(store.clone())
    }

    /// Wait for metrics of the target node to satisfy the given condition.
    pub async fn wait_for_metrics<T: Fn(&RaftMetrics) -> bool>(
        &self,
        node: &NodeId,
        func: T,
        timeout: Duration,
        msg: &str,
    ) -> Result<RaftMetrics> {
        let handle = self.get_raft_handle(node).await?;
        let wait = handle.wait(Some(timeout));
        Ok(wait.metrics(func, msg).await?)
    }

    /// Wait for the target node to reach the given state.
    pub async fn wait_for_state(&self, node: &NodeId, want: State, timeout: Duration, msg: &str) -> Result<()> {
        self.wait_for_metrics(node, |m| m.state == want, timeout, msg).await?;
        Ok(())
    }

    /// Wait for all given nodes to append & apply up to the given log index.
    pub async fn wait_for_log(&self, nodes: &BTreeSet<NodeId>, want: u64, timeout: Duration, msg: &str) -> Result<()> {
        for node in nodes {
            self.wait_for_metrics(
                node,
                |m| m.last_log_index >= want && m.last_applied >= want,
                timeout,
                &format!("{} on node {}", msg, node),
            )
            .await?;
        }
        Ok(())
    }

    /// Wait until some node considers itself leader and return its ID.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("no leader elected within {:?}", timeout));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// The node currently believing itself leader, if exactly one exists.
    pub async fn leader(&self) -> Option<NodeId> {
        let rt = self.routing_table.read().await;
        let mut leaders = Vec::new();
        for (id, (node, _)) in rt.iter() {
            if node.metrics().borrow().state == State::Leader {
                leaders.push(*id);
            }
        }
        if leaders.len() == 1 {
            leaders.pop()
        } else {
            None
        }
    }

    /// All nodes currently in leader state, with their terms.
    pub async fn leaders_with_terms(&self) -> Vec<(NodeId, u64)> {
        let rt = self.routing_table.read().await;
        let mut leaders = Vec::new();
        for (id, (node, _)) in rt.iter() {
            let metrics = node.metrics().borrow().clone();
            if metrics.state == State::Leader {
                leaders.push((*id, metrics.current_term));
            }
        }
        leaders
    }

    /// Latest metrics of every registered node.
    pub async fn all_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|(node, _)| node.metrics().borrow().clone()).collect()
    }

    /// Send `count` client write requests to the target node.
    pub async fn client_request_many(&self, target: NodeId, prefix: &str, count: usize) -> Result<()> {
        let node = self.get_raft_handle(&target).await?;
        for n in 0..count {
            let data = Bytes::from(format!("{}-{}", prefix, n));
            node.client_write(ClientWriteRequest::new(data)).await.map_err(|e| anyhow!("client write: {}", e))?;
        }
        Ok(())
    }

    async fn check_reachable(&self, id: NodeId, target: NodeId) -> Result<()> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&id) {
            return Err(anyhow!("target node is isolated: {}", target));
        }
        Ok(())
    }

    async fn target(&self, target: NodeId) -> Result<MemRaft> {
        if self.send_delay > 0 {
            tokio::time::sleep(Duration::from_millis(self.send_delay)).await;
        }
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) {
            return Err(anyhow!("target node is isolated: {}", target));
        }
        drop(isolated);
        let rt = self.routing_table.read().await;
        let (node, _) = rt.get(&target).ok_or_else(|| anyhow!("target node {} not found in routing table", target))?;
        Ok(node.clone())
    }
}

#[async_trait]
impl RaftNetwork for RaftRouter {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.check_reachable(rpc.leader_id, target).await?;
        let node = self.target(target).await?;
        Ok(node.append_entries(rpc).await?)
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.check_reachable(rpc.candidate_id, target).await?;
        let node = self.target(target).await?;
        Ok(node.vote(rpc).await?)
    }

    async fn send_pre_vote(&self, target: NodeId, rpc: PreVoteRequest) -> Result<PreVoteResponse> {
        self.check_reachable(rpc.candidate_id, target).await?;
        let node = self.target(target).await?;
        Ok(node.pre_vote(rpc).await?)
    }

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.check_reachable(rpc.leader_id, target).await?;
        let node = self.target(target).await?;
        Ok(node.install_snapshot(rpc).await?)
    }

    async fn send_resign(&self, target: NodeId) -> Result<bool> {
        let node = self.target(target).await?;
        Ok(node.resign().await?)
    }

    async fn send_synchronize(&self, target: NodeId) -> Result<SynchronizeResponse> {
        let node = self.target(target).await?;
        Ok(node.synchronize().await?)
    }
}

/// A member map for initialization.
pub fn members_of(ids: &[NodeId]) -> BTreeMap<NodeId, String> {
    ids.iter().map(|id| (*id, format!("node-{}", id))).collect()
}

/// The default member map used by most tests.
pub fn default_members() -> BTreeMap<NodeId, String> {
    btreemap! {
        0 => "node-0".to_string(),
        1 => "node-1".to_string(),
        2 => "node-2".to_string(),
    }
}
