use crate::actor::WeakActorClient;
use crate::replica::log_entry::EntryPayload;
use crate::replica::peers::{ReplicaId, ReplicaMetadata};
use crate::replica::replica::Replica;
use crate::replica::replica_api::{
    ElectionTimeout, RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer,
    RequestVoteResult, Role, TermOutOfDateInfo, TimeoutNowError, TimeoutNowInput, TimeoutNowOutput,
};
use crate::replica::term_store::Term;
use crate::transport::PeerTransport;
use std::io;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

impl Replica {
    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        let logger = self
            .logger
            .new(slog::o!("Candidate" => format!("{:?}", input.candidate_id)));

        // Removed servers don't hear about their removal and keep starting elections. Their terms
        // must not disturb the cluster, so they are turned away before we look at the term.
        if !self.peers.is_voting_member(&input.candidate_id) {
            slog::info!(logger, "Not granting vote. Candidate isn't a voting member.");
            return Ok(RequestVoteOutput {
                vote_granted: false,
                term: self.term_store.current_term(),
            });
        }

        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.term_store.current_term();
        if input.candidate_term < current_term {
            slog::info!(logger, "Not granting vote. Candidate term is out of date.");
            return Ok(RequestVoteOutput {
                vote_granted: false,
                term: current_term,
            });
        }

        self.observe_term(input.candidate_term, None)
            .map_err(RequestVoteError::PersistenceFailure)?;

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).
        let (current_term, opt_voted_for) = self.term_store.voted_for_current_term();
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(RequestVoteOutput {
                    vote_granted: false,
                    term: current_term,
                });
            }

            // Candidate retried.
            self.election_state.reset_election_timer_if_follower();
            return Ok(RequestVoteOutput {
                vote_granted: true,
                term: current_term,
            });
        }

        let my_last_entry = self.log.last_position();
        if input.candidate_last_log_entry < my_last_entry {
            slog::info!(
                logger,
                "Not granting vote. Candidate log {:?} is behind mine {:?}.",
                input.candidate_last_log_entry,
                my_last_entry
            );
            return Ok(RequestVoteOutput {
                vote_granted: false,
                term: current_term,
            });
        }

        let granted = self
            .term_store
            .store_vote_for_term_if_unvoted(&mut self.entry_store, current_term, input.candidate_id.clone())
            .map_err(RequestVoteError::PersistenceFailure)?;
        if granted {
            slog::info!(logger, "Voting for {:?} in term {:?}.", input.candidate_id, current_term);
            self.election_state.reset_election_timer_if_follower();
        }

        Ok(RequestVoteOutput {
            vote_granted: granted,
            term: current_term,
        })
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.term_store.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                if !self.peers.is_voting_member(&reply.peer_id) {
                    slog::warn!(self.logger, "Ignoring vote from non-voting {:?}", reply.peer_id);
                    return;
                }
                self.peers.record_activity(&reply.peer_id, Instant::now());

                let peers = &self.peers;
                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(votes) => votes.iter().filter(|id| peers.is_voting_member(id)).count(),
                    None => {
                        slog::info!(
                            self.logger,
                            "Received vote for term {:?} after transitioning to election state: {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                let majority = self.peers.majority();
                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    self.peers.num_voting_members(),
                    reply.term,
                );
                if num_votes_received >= majority {
                    self.become_leader();
                }
            }
            RequestVoteResult::VoteNotGranted { peer_term } => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {:?} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
                self.peers.record_activity(&reply.peer_id, Instant::now());
                if let Err(e) = self.observe_term(peer_term, None) {
                    slog::error!(self.logger, "Failed to persist term {:?}: {:?}", peer_term, e);
                }
            }
            RequestVoteResult::RetryableFailure(message) => {
                if self.election_state.role() != Role::Candidate {
                    return;
                }
                slog::debug!(
                    self.logger,
                    "RequestVote to {:?} failed: {}. Retrying.",
                    reply.peer_id,
                    message
                );
                // Unreachable peers fail fast. Don't spin on them.
                let backoff = self.options.leader_heartbeat_duration;
                self.send_request_vote(&reply.peer_id, reply.term, Some(backoff));
            }
        }
    }

    pub(crate) fn handle_follower_timeout(&mut self, timeout: ElectionTimeout) {
        if !self.election_state.is_current_timeout(&timeout) {
            slog::debug!(self.logger, "Dropping stale election timeout {:?}", timeout);
            return;
        }
        if !self.peers.i_am_voting() {
            slog::debug!(self.logger, "Not a voting member. Not starting an election.");
            return;
        }

        slog::info!(
            self.logger,
            "Timed out as {:?}. Starting election.",
            self.election_state
        );
        if let Err(e) = self.start_election() {
            slog::error!(self.logger, "Failed to persist vote for self. Not starting election: {:?}", e);
        }
    }

    /// The leader asks us to start an election right away, as part of a leadership transfer.
    pub(crate) fn server_handle_timeout_now(&mut self, input: TimeoutNowInput) -> Result<TimeoutNowOutput, TimeoutNowError> {
        let current_term = self.term_store.current_term();
        if input.leader_term < current_term {
            return Err(TimeoutNowError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }
        if !self.peers.i_am_voting() {
            return Err(TimeoutNowError::NotVoting);
        }

        let leader = self.redirect_info(&input.leader_id);
        self.observe_term(input.leader_term, leader)
            .map_err(TimeoutNowError::PersistenceFailure)?;

        slog::info!(
            self.logger,
            "Leader {:?} handed leadership to us. Starting election.",
            input.leader_id
        );
        // The old leader steps down on our reply, so we must really be a candidate by then.
        if !self.election_state.is_leader() {
            self.start_election().map_err(TimeoutNowError::PersistenceFailure)?;
        }

        Ok(TimeoutNowOutput {
            term: self.term_store.current_term(),
        })
    }

    pub(super) fn start_election(&mut self) -> io::Result<()> {
        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = self.term_store.increment_term_and_vote_for_self(&mut self.entry_store)?;
        self.election_state.transition_to_candidate_and_vote_for_self(new_term);
        slog::info!(
            self.logger,
            "Changed to candidate for term {:?}. Election state: {:?}",
            new_term,
            self.election_state,
        );

        if self.peers.majority() <= 1 {
            self.become_leader();
            return Ok(());
        }

        for peer_id in self.peers.voting_peer_ids() {
            self.send_request_vote(&peer_id, new_term, None);
        }
        Ok(())
    }

    fn become_leader(&mut self) {
        let term = self.term_store.current_term();
        // > for each server, index of the next log entry
        // > to send to that server (initialized to leader
        // > last log index + 1)
        self.peers.reset_progress(self.log.last_index().plus(1));
        self.election_state.transition_to_leader(term, self.peers.peer_ids());
        slog::info!(self.logger, "Won election for term {:?}. Election state: {:?}", term, self.election_state);

        // > Raft handles this by having each leader commit a blank no-op entry
        // > into the log at the start of its term.
        if let Err(e) = self.append_as_leader(EntryPayload::Noop) {
            slog::error!(self.logger, "Failed to append no-op as new leader: {:?}", e);
            self.step_down(None);
            return;
        }

        self.replicate_to_all_idle_peers();
    }

    fn send_request_vote(&self, peer_id: &ReplicaId, term: Term, delay: Option<Duration>) {
        let target = match self.peers.metadata(peer_id) {
            Some(metadata) => metadata,
            None => {
                slog::warn!(self.logger, "Peer {:?} not found while requesting vote", peer_id);
                return;
            }
        };

        let input = RequestVoteInput {
            candidate_term: term,
            candidate_id: self.peers.my_replica_id().clone(),
            candidate_last_log_entry: self.log.last_position(),
        };
        tokio::task::spawn(Self::call_peer_request_vote(
            self.logger.new(slog::o!("Peer" => format!("{:?}", peer_id))),
            self.transport.clone(),
            target,
            input,
            self.options.rpc_timeout,
            delay,
            self.actor_client.clone(),
        ));
    }

    async fn call_peer_request_vote(
        logger: slog::Logger,
        transport: Arc<dyn PeerTransport>,
        target: ReplicaMetadata,
        input: RequestVoteInput,
        rpc_timeout: Duration,
        delay: Option<Duration>,
        callback: WeakActorClient,
    ) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let term = input.candidate_term;
        let result = match tokio::time::timeout(rpc_timeout, transport.request_vote(&target, input)).await {
            Ok(result) => result,
            Err(_) => RequestVoteResult::RetryableFailure("Timed out calling RequestVote".into()),
        };
        slog::debug!(logger, "RequestVote reply: {:?}", result);

        let reply = RequestVoteReplyFromPeer {
            peer_id: target.replica_id().clone(),
            term,
            result,
        };
        let _ = callback.notify_request_vote_reply_from_peer(reply).await;
    }
}

#[cfg(test)]
mod tests {
    use crate::replica::log_entry::Index;
    use crate::replica::peers::ReplicaId;
    use crate::journal::InMemoryJournal;
    use crate::replica::replica::tests::{member, new_replica, new_replica_over};
    use crate::replica::replica_api::{
        LogPosition, RequestVoteInput, RequestVoteReplyFromPeer, RequestVoteResult, Role, TimeoutNowError,
        TimeoutNowInput,
    };
    use crate::replica::term_store::Term;

    fn vote_request(candidate: &str, term: u64, last_term: u64, last_index: u64) -> RequestVoteInput {
        RequestVoteInput {
            candidate_term: Term::new(term),
            candidate_id: ReplicaId::new(candidate),
            candidate_last_log_entry: if last_index == 0 {
                LogPosition::default()
            } else {
                LogPosition::new(Term::new(last_term), Index::new(last_index))
            },
        }
    }

    #[tokio::test]
    async fn one_vote_per_term() {
        let (mut replica, _client, _rx) = new_replica(vec![member("me", 1), member("a", 2), member("b", 3)]);

        let first = replica.server_handle_request_vote(vote_request("a", 1, 0, 0)).unwrap();
        assert!(first.vote_granted);
        // Retries of the same request are granted again.
        assert!(replica.server_handle_request_vote(vote_request("a", 1, 0, 0)).unwrap().vote_granted);

        let second = replica.server_handle_request_vote(vote_request("b", 1, 0, 0)).unwrap();
        assert!(!second.vote_granted);
        assert_eq!(second.term, Term::new(1));

        // A new term means a new vote.
        assert!(replica.server_handle_request_vote(vote_request("b", 2, 0, 0)).unwrap().vote_granted);
    }

    #[tokio::test]
    async fn stale_and_outdated_candidates_are_denied() {
        let (mut replica, _client, _rx) = new_replica(vec![member("me", 1), member("a", 2), member("b", 3)]);
        replica.start_election().unwrap();
        replica.handle_request_vote_reply_from_peer(RequestVoteReplyFromPeer {
            peer_id: ReplicaId::new("a"),
            term: Term::new(1),
            result: RequestVoteResult::VoteGranted,
        });
        // Leader of term 1 with a no-op at index 1.
        assert_eq!(replica.election_state.role(), Role::Leader);

        let stale = replica.server_handle_request_vote(vote_request("b", 1, 0, 0)).unwrap();
        assert!(!stale.vote_granted);

        // Newer term, but log behind ours. We step down without voting.
        let behind = replica.server_handle_request_vote(vote_request("b", 2, 0, 0)).unwrap();
        assert!(!behind.vote_granted);
        assert_eq!(behind.term, Term::new(2));
        assert_eq!(replica.election_state.role(), Role::Follower);

        let up_to_date = replica.server_handle_request_vote(vote_request("a", 2, 1, 1)).unwrap();
        assert!(up_to_date.vote_granted);
    }

    #[tokio::test]
    async fn non_members_are_denied_without_adopting_their_term() {
        let (mut replica, _client, _rx) = new_replica(vec![member("me", 1), member("a", 2)]);

        let result = replica.server_handle_request_vote(vote_request("stranger", 9, 9, 9)).unwrap();
        assert!(!result.vote_granted);
        assert_eq!(replica.term_store.current_term(), Term::new(0));
    }

    #[tokio::test]
    async fn votes_from_a_majority_elect_a_leader() {
        let (mut replica, _client, _rx) = new_replica(vec![
            member("me", 1),
            member("a", 2),
            member("b", 3),
            member("c", 4),
            member("d", 5),
        ]);
        replica.start_election().unwrap();
        assert_eq!(replica.election_state.role(), Role::Candidate);

        for (peer, term, result) in vec![
            ("a", 1, RequestVoteResult::VoteGranted),
            // Outdated reply.
            ("b", 0, RequestVoteResult::VoteGranted),
            ("c", 1, RequestVoteResult::VoteNotGranted { peer_term: Term::new(1) }),
        ] {
            replica.handle_request_vote_reply_from_peer(RequestVoteReplyFromPeer {
                peer_id: ReplicaId::new(peer),
                term: Term::new(term),
                result,
            });
        }
        assert_eq!(replica.election_state.role(), Role::Candidate);

        replica.handle_request_vote_reply_from_peer(RequestVoteReplyFromPeer {
            peer_id: ReplicaId::new("d"),
            term: Term::new(1),
            result: RequestVoteResult::VoteGranted,
        });
        assert_eq!(replica.election_state.role(), Role::Leader);
        assert_eq!(replica.log.last_index(), Index::new(1));
    }

    #[tokio::test]
    async fn timeout_now_becomes_candidate_before_replying() {
        let (mut replica, _client, _rx) = new_replica(vec![member("me", 1), member("a", 2), member("b", 3)]);

        let output = replica
            .server_handle_timeout_now(TimeoutNowInput {
                leader_term: Term::new(0),
                leader_id: ReplicaId::new("a"),
            })
            .unwrap();
        assert_eq!(replica.election_state.role(), Role::Candidate);
        assert_eq!(output.term, Term::new(1));
    }

    #[tokio::test]
    async fn timeout_now_fails_when_vote_for_self_is_not_persisted() {
        let journal = InMemoryJournal::new();
        let (mut replica, _client, _rx) =
            new_replica_over(vec![member("me", 1), member("a", 2), member("b", 3)], journal.clone());
        journal.fail_writes(true);

        let result = replica.server_handle_timeout_now(TimeoutNowInput {
            leader_term: Term::new(0),
            leader_id: ReplicaId::new("a"),
        });
        assert!(matches!(result, Err(TimeoutNowError::PersistenceFailure(_))));
        assert_eq!(replica.election_state.role(), Role::Follower);
        assert_eq!(replica.term_store.current_term(), Term::new(0));

        journal.fail_writes(false);
        assert!(replica
            .server_handle_timeout_now(TimeoutNowInput {
                leader_term: Term::new(0),
                leader_id: ReplicaId::new("a"),
            })
            .is_ok());
        assert_eq!(replica.election_state.role(), Role::Candidate);
    }
}
