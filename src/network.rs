//! The Raft network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::membership::NodeId;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::PreVoteRequest;
use crate::raft::PreVoteResponse;
use crate::raft::SynchronizeResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;

/// A trait defining the interface for a Raft network between cluster members.
///
/// Typically, the network implementation as such will be hidden behind a `Box<T>` or `Arc<T>`
/// and this interface implemented on the `Box<T>` or `Arc<T>`.
///
/// The transport owns framing, deadlines and encryption; the core only
/// requires request/response unicast of these six messages. When a binary
/// wire format is wanted, the codec in [`crate::wire`] produces the exact
/// frames.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send a PreVote probe to the target Raft node.
    async fn send_pre_vote(&self, target: NodeId, rpc: PreVoteRequest) -> Result<PreVoteResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    /// Ask the target node to relinquish leadership. Returns whether it
    /// accepted.
    async fn send_resign(&self, target: NodeId) -> Result<bool>;

    /// Request the target node's log position.
    async fn send_synchronize(&self, target: NodeId) -> Result<SynchronizeResponse>;
}

#[async_trait]
impl<T: RaftNetwork + ?Sized> RaftNetwork for std::sync::Arc<T> {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        T::send_append_entries(self, target, rpc).await
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        T::send_vote(self, target, rpc).await
    }

    async fn send_pre_vote(&self, target: NodeId, rpc: PreVoteRequest) -> Result<PreVoteResponse> {
        T::send_pre_vote(self, target, rpc).await
    }

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        T::send_install_snapshot(self, target, rpc).await
    }

    async fn send_resign(&self, target: NodeId) -> Result<bool> {
        T::send_resign(self, target).await
    }

    async fn send_synchronize(&self, target: NodeId) -> Result<SynchronizeResponse> {
        T::send_synchronize(self, target).await
    }
}
