//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The use cases
//! range from being logged for debugging purposes, to being used for
//! driving readiness checks, to being consumed by the `Wait` helpers in
//! tests to observe cluster convergence.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;

use crate::core::State;
use crate::error::WaitTimeout;
use crate::membership::Membership;
use crate::membership::NodeId;
use crate::raft_types::LogId;
use crate::replication::ReplicationMetrics;

/// Leader-specific metrics: the replication state of every target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderMetrics {
    /// Replication metrics of all known replication streams.
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
}

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to be appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log to be applied to the state machine.
    pub last_applied: u64,
    /// The current cluster leader.
    pub current_leader: Option<NodeId>,
    /// The current membership in use by the cluster.
    pub membership_config: Membership,
    /// The log id of the last entry the current snapshot covers.
    pub snapshot: LogId,
    /// The metrics about the leader. It is `None` if this node is not leader.
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: Membership::new_initial(id),
            snapshot: LogId::default(),
            leader_metrics: None,
        }
    }
}

/// A wait handle on a node's metrics stream: resolves once the metrics
/// satisfy a condition, or fails with `WaitTimeout`.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy `func`.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitTimeout>
    where T: Fn(&RaftMetrics) -> bool {
        let timeout_at = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("done wait for {:?}", latest);
                return Ok(latest);
            }

            let now = Instant::now();
            if now >= timeout_at {
                return Err(WaitTimeout {
                    timeout: self.timeout,
                    msg: msg.to_string(),
                });
            }

            let delay = tokio::time::sleep(timeout_at - now);
            tokio::select! {
                _ = delay => {
                    return Err(WaitTimeout {
                        timeout: self.timeout,
                        msg: msg.to_string(),
                    });
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitTimeout {
                            timeout: self.timeout,
                            msg: format!("{} (metrics stream closed)", msg.to_string()),
                        });
                    }
                }
            }
        }
    }

    /// Wait for `last_log_index` and `last_applied` to become `want_log`.
    pub async fn log(&self, want_log: u64, msg: impl ToString) -> Result<RaftMetrics, WaitTimeout> {
        self.metrics(
            |m| m.last_log_index >= want_log && m.last_applied >= want_log,
            format!("{} .last_log_index+applied >= {}", msg.to_string(), want_log),
        )
        .await
    }

    /// Wait for the node to reach the given state.
    pub async fn state(&self, want_state: State, msg: impl ToString) -> Result<RaftMetrics, WaitTimeout> {
        self.metrics(
            |m| m.state == want_state,
            format!("{} .state == {:?}", msg.to_string(), want_state),
        )
        .await
    }

    /// Wait for the node to observe the given current leader.
    pub async fn current_leader(&self, leader_id: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitTimeout> {
        self.metrics(
            |m| m.current_leader == Some(leader_id),
            format!("{} .current_leader == {}", msg.to_string(), leader_id),
        )
        .await
    }

    /// Wait for the node's active member set to become `want_members`.
    pub async fn members(
        &self,
        want_members: BTreeSet<NodeId>,
        msg: impl ToString,
    ) -> Result<RaftMetrics, WaitTimeout> {
        self.metrics(
            |m| m.membership_config.active.members.keys().cloned().collect::<BTreeSet<_>>() == want_members,
            format!("{} .members == {:?}", msg.to_string(), want_members),
        )
        .await
    }

    /// Wait for the node's active configuration fingerprint.
    pub async fn fingerprint(&self, want: u64, msg: impl ToString) -> Result<RaftMetrics, WaitTimeout> {
        self.metrics(
            |m| m.membership_config.active.fingerprint == want,
            format!("{} .fingerprint == {:#x}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the node's snapshot to cover `want_log`.
    pub async fn snapshot(&self, want_log: LogId, msg: impl ToString) -> Result<RaftMetrics, WaitTimeout> {
        self.metrics(
            |m| m.snapshot == want_log,
            format!("{} .snapshot == {}", msg.to_string(), want_log),
        )
        .await
    }
}
