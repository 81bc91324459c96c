use tokio::sync::oneshot;

use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::membership::NodeId;
use crate::network::RaftNetwork;
use crate::raft_types::LogId;
use crate::raft_types::Update;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationMetrics;
use crate::replication::ReplicationStream;
use crate::storage::RaftStorage;
use crate::storage::Snapshot;

impl<'a, N: RaftNetwork, S: RaftStorage> LeaderState<'a, N, S> {
    /// Spawn a new replication stream returning its replication state handle.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.membership.active.fingerprint,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.term_cache.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId { term: 0, index: 0 },
            remove_after_commit: None,
            replstream,
        }
    }

    /// Handle a replication event coming from one of the replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent<S::SnapshotData>) {
        let res = match event {
            ReplicaEvent::RateUpdate { target, is_line_rate } => self.handle_rate_update(target, is_line_rate).await,
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::UpdateMatchIndex { target, matched } => self.handle_update_match_index(target, matched).await,
            ReplicaEvent::NeedsSnapshot { target, tx } => self.handle_needs_snapshot(target, tx).await,
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
                return;
            }
        };

        if let Err(err) = res {
            tracing::error!({error=%err}, "error while processing event from replication stream");
        }
    }

    /// Handle events from replication streams updating their replication rate status.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_rate_update(&mut self, target: NodeId, is_line_rate: bool) -> RaftResult<()> {
        if !is_line_rate {
            return Ok(());
        }
        // A standby which has caught up to line rate is ready to join the
        // cluster; respond to the admin request that registered it and
        // continue any reconfiguration waiting on its sync.
        let became_ready = match self.standbys.get_mut(&target) {
            Some(standby) => {
                let newly = !standby.is_ready_to_join;
                standby.is_ready_to_join = true;
                if let Some(tx) = standby.tx.take() {
                    let _ = tx.send(Ok(standby.state.matched.index));
                }
                newly
            }
            None => false,
        };
        if became_ready {
            self.continue_pending_membership_change(target).await;
        }
        Ok(())
    }

    /// Handle events from a replication stream which updates the target node's match index.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_match_index(&mut self, target: NodeId, matched: LogId) -> RaftResult<()> {
        let mut found = false;

        if let Some(state) = self.standbys.get_mut(&target) {
            state.state.matched = matched;
            found = true;
        }

        // Update target's match index & check if it is awaiting removal.
        let mut remove_target = None;
        if let Some(state) = self.nodes.get_mut(&target) {
            state.matched = matched;
            found = true;
            if let Some(threshold) = &state.remove_after_commit {
                if &matched.index >= threshold {
                    remove_target = Some(target);
                }
            }
        }

        if !found {
            return Ok(());
        }

        if let Some(target) = remove_target {
            tracing::debug!(target, "removing replication stream which has replicated the config removing it");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                self.leader_metrics.replication.remove(&target);
            }
        }

        self.update_leader_metrics(target, matched);
        self.calc_and_advance_commit_index().await
    }

    fn update_leader_metrics(&mut self, target: NodeId, matched: LogId) {
        self.leader_metrics.replication.insert(target, ReplicationMetrics { matched });
    }

    /// Advance the commit index when a quorum of the relevant configuration
    /// has replicated new entries.
    ///
    /// Two interlocks apply while a configuration entry is in flight: quorum
    /// is computed over the union of old and new member sets, and the commit
    /// index does not pass the configuration entry until a majority of the
    /// NEW member set has replicated it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn calc_and_advance_commit_index(&mut self) -> RaftResult<()> {
        let mut new_commit = self.calc_commit_index();

        if let super::ConsensusState::Reconfiguring { index } = self.consensus_state {
            if new_commit >= index && !self.proposal_has_new_majority(index) {
                // Hold the line just below the configuration entry until the
                // new member set catches up.
                new_commit = index.saturating_sub(1);
            }
        }

        if new_commit <= self.core.commit_index {
            return Ok(());
        }

        // The leader may only commit entries from its own term (§5.4.2).
        let entry_term = {
            let mut cache = self.term_cache.lock().unwrap();
            cache.lookup(new_commit)
        };
        let entry_term = match entry_term {
            Some(term) => Some(term),
            None => self
                .core
                .storage
                .try_get_log_entry(new_commit)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?
                .map(|entry| entry.log_id.term),
        };
        if entry_term != Some(self.core.current_term) {
            tracing::debug!(
                new_commit,
                ?entry_term,
                "holding commit index, entry is not from the current term"
            );
            return Ok(());
        }

        self.core.commit_index = new_commit;

        // Update all replication streams based on new commit index.
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::UpdateCommitIndex {
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }
        for node in self.standbys.values() {
            let _ = node.state.replstream.repl_tx.send((
                RaftEvent::UpdateCommitIndex {
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }

        // Check if there are any pending requests which need to be processed.
        let filter = self
            .awaiting_committed
            .iter()
            .take_while(|req| req.entry.log_id.index <= self.core.commit_index)
            .count();
        if filter > 0 {
            // Build a new ApplyLogsTask from each of the given client requests.
            let iter = self.awaiting_committed.drain(0..filter).collect::<Vec<_>>();
            for request in iter {
                self.client_request_post_commit(request).await;
            }
        }

        // The term cache only serves indices at or above the commit index;
        // everything below can no longer be asked for as a prev_log_term of a
        // divergent follower.
        self.term_cache.lock().unwrap().remove_prior_to(self.core.commit_index);

        self.leader_report_metrics();
        Ok(())
    }

    /// The greatest index replicated on a quorum of the relevant membership,
    /// counting this node's own log.
    fn calc_commit_index(&self) -> u64 {
        let membership = &self.core.membership;
        let mut indices: Vec<u64> = membership
            .all_nodes()
            .iter()
            .map(|id| {
                if *id == self.core.id {
                    self.core.last_log_id.index
                } else {
                    self.nodes.get(id).map(|n| n.matched.index).unwrap_or(0)
                }
            })
            .collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = crate::quorum::majority_of(indices.len());
        indices[quorum - 1]
    }

    /// Whether the configuration entry at `index` has replicated to a
    /// majority of the NEW (proposed) member set.
    fn proposal_has_new_majority(&self, index: u64) -> bool {
        self.core.membership.proposal_committed(|id| {
            if *id == self.core.id {
                self.core.last_log_id.index >= index
            } else {
                self.nodes.get(id).map(|n| n.matched.index >= index).unwrap_or(false)
            }
        })
    }

    /// Handle events from replication streams for when this node needs to revert to follower state.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_revert_to_follower(&mut self, _: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// Handle events from replication streams requesting for snapshot info.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn handle_needs_snapshot(
        &mut self,
        _: NodeId,
        tx: oneshot::Sender<Snapshot<S::SnapshotData>>,
    ) -> RaftResult<()> {
        // Ensure snapshotting is configured, else do nothing.
        let threshold = match &self.core.config.snapshot_policy {
            crate::config::SnapshotPolicy::LogsSinceLast(threshold) => *threshold,
        };

        // Check for existence of current snapshot.
        let current_snapshot_opt =
            self.core.storage.get_current_snapshot().await.map_err(|err| self.core.map_fatal_storage_error(err))?;

        if let Some(snapshot) = current_snapshot_opt {
            // If snapshot exists, ensure its distance from the leader's last log index is <= half
            // of the configured snapshot threshold, else create a new snapshot.
            let distance = self.core.last_log_id.index.saturating_sub(snapshot.meta.last_log_id.index);
            if distance <= threshold / 2 {
                let _ = tx.send(snapshot);
                return Ok(());
            }
        }

        // Check if snapshot creation is already in progress. If so, we spawn a task to await its
        // completion (or cancellation), and respond to the replication stream. The repl stream
        // will wait for the completion and will then send another request to fetch the finished snapshot.
        // Else we just drop any other state and continue. Leaders never enter `Streaming` state.
        if let Some(SnapshotState::Snapshotting { handle, sender }) = self.core.snapshot_state.take() {
            let mut chan = sender.subscribe();
            tokio::spawn(async move {
                let _ = chan.recv().await;
                drop(tx);
            });
            self.core.snapshot_state = Some(SnapshotState::Snapshotting { handle, sender });
            return Ok(());
        }

        // At this point, we just attempt to request a snapshot. Under normal circumstances, the
        // leader will always be keeping up-to-date with its snapshotting, and the latest snapshot
        // will always be found and this block will never even be executed.
        //
        // If this block is executed, and a snapshot is needed, the repl stream will submit another
        // request here shortly, and will hit the above logic where it will await the snapshot completion.
        self.core.trigger_log_compaction_if_needed(true);
        self.core.report_metrics(Update::Ignore);
        Ok(())
    }
}
