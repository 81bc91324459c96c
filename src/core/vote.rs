use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::membership::NodeId;
use crate::network::RaftNetwork;
use crate::raft::PreVoteOutcome;
use crate::raft::PreVoteRequest;
use crate::raft::PreVoteResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::raft_types::MessageSummary;
use crate::storage::RaftStorage;

impl<N: RaftNetwork, S: RaftStorage> RaftCore<N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    ///
    /// Receiver implementation:
    /// 1. Reply false if `term` is less than receiver's current `term` (§5.1).
    /// 2. If receiver has not voted for another candidate, and candidate's log is at
    ///    least as up-to-date as receiver's log, grant vote (§5.2, §5.4).
    #[tracing::instrument(level = "trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        // If candidate's current term is less than this nodes current term, reject.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Do not respond to the request if we've received a heartbeat within the election timeout minimum.
        if self.leader_is_live() {
            tracing::debug!(
                { term = msg.term },
                "rejecting vote request received within election timeout minimum"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Per spec, if we observe a term greater than our own outside of the election timeout
        // minimum, then we must update term & immediately become follower. We still need to
        // do vote checking after this.
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.update_next_election_timeout(false);
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
        }

        // Check if candidate's log is at least as up-to-date as this node's.
        // If candidate's log is not at least as up-to-date as this node, then reject.
        let client_is_uptodate = msg.last_log_term > self.last_log_id.term
            || (msg.last_log_term == self.last_log_id.term && msg.last_log_index >= self.last_log_id.index);
        if !client_is_uptodate {
            tracing::debug!(
                { candidate = msg.candidate_id },
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Candidate's log is up-to-date so handle voting conditions.
        match &self.voted_for {
            // This node has already voted for the candidate.
            Some(candidate_id) if candidate_id == &msg.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            }),
            // This node has already voted for a different candidate.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            // This node has not yet voted for the current term, so vote for the candidate.
            None => {
                self.voted_for = Some(msg.candidate_id);
                // A pristine node that was never initialized has only itself
                // in its membership; it grants the vote but must stay passive
                // until the leader's entries deliver a real configuration,
                // lest its election timer spin up a one-node cluster.
                let pristine = self.last_log_id.index == 0 && self.membership.all_nodes().len() == 1;
                if !pristine {
                    self.set_target_state(State::Follower);
                }
                self.update_next_election_timeout(false);
                self.save_hard_state().await?;
                tracing::debug!({candidate=msg.candidate_id, msg.term}, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }

    /// A probe invoked by would-be candidates before incrementing their term.
    ///
    /// The receiver answers exactly as it would a real RequestVote for
    /// `next_term`, but mutates nothing: no term bump, no vote record, no
    /// election timer reset.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_pre_vote_request(&mut self, msg: PreVoteRequest) -> RaftResult<PreVoteResponse> {
        let rejected = PreVoteResponse {
            term: self.current_term,
            outcome: PreVoteOutcome::Rejected,
        };

        // A probe for a term we have already passed cannot win.
        if msg.next_term <= self.current_term {
            return Ok(rejected);
        }

        // A sticky follower refuses to endorse a challenger while its
        // current leader is demonstrably alive.
        if self.config.aggressive_leader_stickiness && self.leader_is_live() {
            tracing::debug!({ candidate = msg.candidate_id }, "rejecting pre-vote, current leader is live");
            return Ok(rejected);
        }

        let candidate_is_uptodate = msg.last_log_term > self.last_log_id.term
            || (msg.last_log_term == self.last_log_id.term && msg.last_log_index >= self.last_log_id.index);
        if !candidate_is_uptodate {
            return Ok(rejected);
        }

        Ok(PreVoteResponse {
            term: self.current_term,
            outcome: PreVoteOutcome::Accepted,
        })
    }
}

impl<'a, N: RaftNetwork, S: RaftStorage> CandidateState<'a, N, S> {
    /// Run a pre-vote round, returning whether a majority endorsed a real
    /// election. The round lasts at most one election timeout.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn pre_vote_round(&mut self) -> RaftResult<bool> {
        self.pre_votes_granted.clear();
        self.pre_votes_granted.insert(self.core.id);
        if self.has_pre_vote_quorum() {
            // Single-voter cluster: nothing to probe.
            return Ok(true);
        }

        let mut pending = self.spawn_parallel_pre_vote_requests();

        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(false);
            }
            let timeout_fut = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                _ = timeout_fut => return Ok(false),
                Some((res, peer)) = pending.recv() => {
                    if res.term > self.core.current_term {
                        // A peer is ahead of us; fall back to follower and
                        // let the normal flow catch us up.
                        self.core.update_current_term(res.term, None);
                        self.core.set_target_state(State::Follower);
                        self.core.save_hard_state().await?;
                        return Ok(false);
                    }
                    if res.outcome == PreVoteOutcome::Accepted {
                        self.pre_votes_granted.insert(peer);
                        if self.has_pre_vote_quorum() {
                            return Ok(true);
                        }
                    }
                }
                Some((msg, _span)) = self.core.rx_api.recv() => {
                    self.handle_api_msg(msg).await;
                }
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }

    fn has_pre_vote_quorum(&self) -> bool {
        let granted = &self.pre_votes_granted;
        self.core.membership.quorum_achieved(|id| granted.contains(id))
    }

    /// Spawn parallel pre-vote probes to all cluster members.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_pre_vote_requests(&self) -> mpsc::Receiver<(PreVoteResponse, NodeId)> {
        let all_members = self.core.membership.all_nodes();
        let (tx, rx) = mpsc::channel(all_members.len().max(1));
        for member in all_members.into_iter().filter(|member| member != &self.core.id) {
            let rpc = PreVoteRequest {
                next_term: self.core.current_term + 1,
                candidate_id: self.core.id,
                last_log_index: self.core.last_log_id.index,
                last_log_term: self.core.last_log_id.term,
            };
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.send_pre_vote(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => tracing::warn!({error=%err, target=member}, "error sending PreVote RPC to target"),
                    }
                }
                .instrument(tracing::debug_span!("spawn")),
            );
        }
        rx
    }

    /// Spawn parallel vote requests to all cluster members.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let all_members = self.core.membership.all_nodes();
        let (tx, rx) = mpsc::channel(all_members.len().max(1));
        for member in all_members.into_iter().filter(|member| member != &self.core.id) {
            let rpc = VoteRequest::new(
                self.core.current_term,
                self.core.id,
                self.core.last_log_id.index,
                self.core.last_log_id.term,
            );
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.send_vote(member, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Err(err) => tracing::warn!({error=%err, target=member}, "error sending VoteRequest RPC to target"),
                    }
                }
                .instrument(tracing::debug_span!("spawn")),
            );
        }
        rx
    }

    /// Handle a response from a vote request sent to a peer.
    #[tracing::instrument(level = "trace", skip(self, res), fields(res=?res))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        // If peer's term is greater than current term, revert to follower state.
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            tracing::debug!("reverting to follower state due to greater term observed in RequestVote RPC response");
            return Ok(());
        }

        if res.vote_granted {
            self.votes_granted.insert(target);
            if self.has_vote_quorum() {
                // If the campaign was successful, go into leader state.
                tracing::debug!("transitioning to leader state as minimum number of votes have been received");
                self.core.set_target_state(State::Leader);
                self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
            }
        }

        Ok(())
    }
}
