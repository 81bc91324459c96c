//! A Raft-based replicated state machine with a partitioned on-disk
//! write-ahead log.
//!
//! The crate is organized in three layers:
//!
//! - [`sync`]: asynchronous synchronization primitives — a queued
//!   synchronizer base, a reader-writer lock with optimistic stamps, a
//!   shared lock with an exclusive mode, reset events.
//! - [`wal`]: the partitioned log store, the crate's production
//!   [`RaftStorage`] implementation, with snapshotting, caching, crash
//!   recovery and backups. [`membership`] holds the cluster configuration
//!   model and its two-slot storage.
//! - [`raft`]/[`core`]: the consensus state machine — leader election with
//!   pre-vote, log replication, commit advancement and single-step
//!   membership reconfiguration — behind the cloneable [`Raft`] handle.
//!
//! Applications plug in a [`StateMachine`] for command application and a
//! [`RaftNetwork`] for transport; everything else ships in the box.

pub mod config;
mod core;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod network;
mod quorum;
pub mod raft;
mod raft_types;
mod replication;
pub mod storage;
pub mod sync;
pub mod wal;
pub mod wire;

pub use async_trait;

pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::config::ReplicationBackoff;
pub use crate::config::SnapshotPolicy;
pub use crate::core::State;
pub use crate::error::ClientReadError;
pub use crate::error::ClientWriteError;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::error::SyncError;
pub use crate::error::WalError;
pub use crate::membership::ClusterConfiguration;
pub use crate::membership::Membership;
pub use crate::membership::NodeId;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::Raft;
pub use crate::raft_types::LogId;
pub use crate::replication::ReplicationMetrics;
pub use crate::raft_types::MessageSummary;
pub use crate::raft_types::SnapshotId;
pub use crate::raft_types::SnapshotSegmentId;
pub use crate::raft_types::Update;
pub use crate::storage::RaftStorage;
pub use crate::storage::SnapshotMeta;
pub use crate::storage::StateMachine;
pub use crate::wal::LogStore;
pub use crate::wal::LogStoreOptions;
