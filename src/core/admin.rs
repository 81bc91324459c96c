use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::core::client::ClientRequestEntry;
use crate::core::ConsensusState;
use crate::core::LeaderState;
use crate::core::StandbyState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::ChangeConfigError;
use crate::error::InitializeError;
use crate::membership::ClusterConfiguration;
use crate::membership::Membership;
use crate::membership::NodeId;
use crate::network::RaftNetwork;
use crate::raft::ClientWriteRequest;
use crate::raft::ResponseTx;
use crate::replication::RaftEvent;
use crate::storage::RaftStorage;

impl<'a, N: RaftNetwork, S: RaftStorage> StandbyState<'a, N, S> {
    /// Handle the admin `init_with_config` command.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn handle_init_with_config(
        &mut self,
        mut members: BTreeMap<NodeId, String>,
    ) -> Result<(), InitializeError> {
        if self.core.last_log_id.index != 0 || self.core.current_term != 0 {
            tracing::error!({self.core.last_log_id.index, self.core.current_term}, "rejecting init_with_config request as last_log_index or current_term is not 0");
            return Err(InitializeError::NotAllowed);
        }

        // Ensure given config contains this node's ID as well.
        members.entry(self.core.id).or_insert_with(String::new);

        // Build a new membership from given init data & assign it as the new cluster
        // membership config in memory only.
        let single = members.len() == 1;
        self.core.membership = Membership::uniform(ClusterConfiguration::bootstrap(members));

        // Become a candidate and start campaigning for leadership. If this node is the only node
        // in the cluster, then become leader without holding an election. If members len == 1, we
        // know it is our ID due to the above code where we ensure our own ID is present.
        if single {
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.set_target_state(State::Leader);
            self.core.save_hard_state().await?;
        } else {
            self.core.set_target_state(State::Candidate);
        }

        Ok(())
    }
}

impl<'a, N: RaftNetwork, S: RaftStorage> LeaderState<'a, N, S> {
    /// Add a new node to the cluster as a standby, bringing it up-to-speed, and then responding
    /// on the given channel once it is running at line rate.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) fn add_standby_member(&mut self, target: NodeId, address: String, tx: ResponseTx) {
        // Ensure the node doesn't already exist in the current config, in the set of new nodes
        // already being synced, or in the nodes being removed.
        if self.core.membership.contains(&target) || self.standbys.contains_key(&target) {
            tracing::debug!("target node is already a cluster member or is being synced");
            let _ = tx.send(Err(ChangeConfigError::Noop.into()));
            return;
        }

        // Spawn a replication stream for the new member. Track state as a standby so that it
        // can be updated to be added to the cluster config once it has been brought up-to-date.
        let state = self.spawn_replication_stream(target);
        self.standbys.insert(target, super::StandbyReplicationState {
            state,
            is_ready_to_join: false,
            address,
            tx: Some(tx),
        });
    }

    /// Propose a single-step configuration change.
    ///
    /// One configuration entry carrying the proposed member set is appended.
    /// Until it commits, quorum is computed over the union of the old and new
    /// member sets, and the entry only takes effect once a majority of the
    /// NEW set has replicated it.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn change_membership(&mut self, members: BTreeMap<NodeId, String>, tx: ResponseTx) {
        // Ensure cluster will have at least one node.
        if members.is_empty() {
            let _ = tx.send(Err(ChangeConfigError::InoperableConfig.into()));
            return;
        }

        // Only one reconfiguration may be in flight at a time.
        match &self.consensus_state {
            ConsensusState::Uniform => (),
            ConsensusState::StandbySync { .. } | ConsensusState::Reconfiguring { .. } => {
                let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress.into()));
                return;
            }
        }
        if self.core.membership.is_reconfiguring() {
            let _ = tx.send(Err(ChangeConfigError::ConfigChangeInProgress.into()));
            return;
        }
        if members == self.core.membership.active.members {
            let _ = tx.send(Err(ChangeConfigError::Noop.into()));
            return;
        }

        // Prefer the address a joining node advertised while syncing when the
        // caller did not provide one.
        let mut members = members;
        for (id, address) in members.iter_mut() {
            if address.is_empty() {
                if let Some(standby) = self.standbys.get(id) {
                    *address = standby.address.clone();
                }
            }
        }

        // Check the proposed config for any new nodes. If ALL new nodes already have replication
        // streams AND are ready to join, then we can immediately proceed with the proposal. Else,
        // new nodes need to first be brought up-to-speed.
        let mut awaiting = HashSet::new();
        for (new_node, address) in members.iter() {
            if self.core.membership.active.contains(new_node) || *new_node == self.core.id {
                continue;
            }
            match self.standbys.get(new_node) {
                // Node is ready to join.
                Some(node) if node.is_ready_to_join => continue,
                // Node has a repl stream, but is not yet ready to join.
                Some(_) => (),
                // Node does not yet have a repl stream, spawn one.
                None => {
                    let state = self.spawn_replication_stream(*new_node);
                    self.standbys.insert(*new_node, super::StandbyReplicationState {
                        state,
                        is_ready_to_join: false,
                        address: address.clone(),
                        tx: None,
                    });
                }
            }
            awaiting.insert(*new_node);
        }
        // If there are new nodes which need to sync, then we need to wait until they are synced.
        // Once they've finished, this routine will be called again to progress further.
        if !awaiting.is_empty() {
            self.consensus_state = ConsensusState::StandbySync { awaiting, members, tx };
            return;
        }

        // All new nodes are synced. Promote their streams to voting targets:
        // during the interim they count toward the union quorum and toward
        // the new-set majority gating the proposal.
        let new_ids: Vec<NodeId> = members
            .keys()
            .filter(|id| !self.core.membership.active.contains(id) && **id != self.core.id)
            .cloned()
            .collect();
        for id in new_ids {
            if let Some(standby) = self.standbys.remove(&id) {
                self.nodes.insert(id, standby.state);
            }
        }

        if !members.contains_key(&self.core.id) {
            self.is_stepping_down = true;
        }

        let proposed = self.core.membership.active.successor(members);
        let membership = Membership {
            active: self.core.membership.active.clone(),
            proposed: Some(proposed),
        };
        if let Err(err) = self.core.update_membership(membership.clone()) {
            let _ = tx.send(Err(ChangeConfigError::RaftError(err).into()));
            return;
        }

        let payload = ClientWriteRequest::new_config(membership);
        let entry = match self.append_payload_to_log(payload.entry).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!("append config change log error: {:?}", err);
                let _ = tx.send(Err(ChangeConfigError::RaftError(err).into()));
                return;
            }
        };
        self.consensus_state = ConsensusState::Reconfiguring {
            index: entry.log_id.index,
        };

        let cr_entry = ClientRequestEntry::from_entry(entry, Some(tx));
        self.replicate_client_request(cr_entry).await;
    }

    /// Continue a reconfiguration that was waiting on standbys to sync.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn continue_pending_membership_change(&mut self, synced: NodeId) {
        let done = match &mut self.consensus_state {
            ConsensusState::StandbySync { awaiting, .. } => {
                awaiting.remove(&synced);
                awaiting.is_empty()
            }
            _ => false,
        };
        if !done {
            return;
        }
        let state = std::mem::replace(&mut self.consensus_state, ConsensusState::Uniform);
        if let ConsensusState::StandbySync { members, tx, .. } = state {
            tracing::debug!("all new nodes synced, proceeding with configuration change");
            self.change_membership(members, tx).await;
        }
    }

    /// Handle the commitment of a configuration entry: the proposed
    /// configuration becomes active, per-peer streams are reconciled, and a
    /// removed leader steps down.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn handle_config_entry_committed(&mut self, index: u64) {
        if let ConsensusState::Reconfiguring { index: at } = self.consensus_state {
            if at == index {
                self.consensus_state = ConsensusState::Uniform;
            }
        }
        self.core.membership = self.core.membership.to_final();

        // Step down if needed.
        if self.is_stepping_down {
            tracing::debug!("raft node is stepping down");
            self.core.set_target_state(State::Standby);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            return;
        }

        // Remove any replication streams which have replicated this config & which are no longer
        // cluster members. All other replication streams which are no longer cluster members, but
        // which have not yet replicated this config will be marked for removal.
        let membership = &self.core.membership;
        let nodes_to_remove: Vec<_> = self
            .nodes
            .iter_mut()
            .filter(|(id, _)| !membership.contains(id))
            .filter_map(|(idx, replstate)| {
                if replstate.matched.index >= index {
                    Some(*idx)
                } else {
                    replstate.remove_after_commit = Some(index);
                    None
                }
            })
            .collect();

        tracing::debug!("nodes: {:?}", self.nodes.keys().collect::<Vec<_>>());
        tracing::debug!("membership: {:?}", self.core.membership);
        tracing::debug!("nodes_to_remove: {:?}", nodes_to_remove);

        for target in nodes_to_remove {
            tracing::debug!(target, "removing target node from replication pool");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));

                // remove metrics entry
                self.leader_metrics.replication.remove(&target);
            }
        }
        self.leader_report_metrics();
    }

}
