use crate::actor::{Callback, WeakActorClient};
use crate::replica::leadership_transfer::LeadershipTransfer;
use crate::replica::peers::{ReplicaId, ReplicaMetadata};
use crate::replica::replica::Replica;
use crate::replica::replica_api::{
    PeerCallError, TimeoutNowInput, TimeoutNowReplyFromPeer, TransferDeadline, TransferLeadershipError,
    TransferLeadershipOutput,
};
use crate::transport::PeerTransport;
use std::sync::Arc;
use tokio::time::Duration;

impl Replica {
    pub(crate) fn handle_transfer_leadership(
        &mut self,
        callback: Callback<TransferLeadershipOutput, TransferLeadershipError>,
    ) {
        if !self.election_state.is_leader() {
            callback.send(Err(TransferLeadershipError::NotLeader));
            return;
        }
        if self.transfer.is_some() || self.membership.is_in_progress() {
            callback.send(Err(TransferLeadershipError::InProgress));
            return;
        }
        let target = match LeadershipTransfer::pick_target(&self.peers) {
            Some(target) => target,
            None => {
                callback.send(Err(TransferLeadershipError::NoEligibleTarget));
                return;
            }
        };

        self.last_transfer_id += 1;
        let transfer_id = self.last_transfer_id;
        slog::info!(self.logger, "Transferring leadership to {:?}", target);
        self.transfer = Some(LeadershipTransfer::new(transfer_id, target.clone(), callback));

        let actor_client = self.actor_client.clone();
        let transfer_timeout = self.options.leadership_transfer_timeout;
        tokio::task::spawn(async move {
            tokio::time::sleep(transfer_timeout).await;
            let _ = actor_client
                .notify_transfer_deadline(TransferDeadline { transfer_id })
                .await;
        });

        // Bring the target up to date first, unless it already is.
        self.maybe_send_timeout_now(&target);
        if matches!(&self.transfer, Some(t) if !t.timeout_now_sent()) {
            self.send_append_entries(&target);
        }
    }

    /// Tell the transfer target to start an election, once it has our whole log.
    pub(super) fn maybe_send_timeout_now(&mut self, peer_id: &ReplicaId) {
        let match_index = match self.peers.peer(peer_id) {
            Some(peer) => peer.match_index(),
            None => return,
        };
        let last_index = self.log.last_index();
        match self.transfer.as_mut() {
            Some(transfer) if transfer.target() == peer_id => {
                if !transfer.should_send_timeout_now(match_index, last_index) {
                    return;
                }
            }
            _ => return,
        }

        let target = match self.peers.metadata(peer_id) {
            Some(metadata) => metadata,
            None => return,
        };
        slog::info!(self.logger, "{:?} is caught up through {:?}. Sending TimeoutNow.", peer_id, match_index);
        let input = TimeoutNowInput {
            leader_term: self.term_store.current_term(),
            leader_id: self.peers.my_replica_id().clone(),
        };
        tokio::task::spawn(Self::call_peer_timeout_now(
            self.logger.new(slog::o!("Peer" => format!("{:?}", peer_id))),
            self.transport.clone(),
            target,
            input,
            self.options.rpc_timeout,
            self.actor_client.clone(),
        ));
    }

    async fn call_peer_timeout_now(
        logger: slog::Logger,
        transport: Arc<dyn PeerTransport>,
        target: ReplicaMetadata,
        input: TimeoutNowInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
    ) {
        let term = input.leader_term;
        let result = match tokio::time::timeout(rpc_timeout, transport.timeout_now(&target, input)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(PeerCallError::RetryableFailure("Timed out calling TimeoutNow".into())),
        };
        slog::debug!(logger, "TimeoutNow reply: {:?}", result);

        let reply = TimeoutNowReplyFromPeer {
            peer_id: target.replica_id().clone(),
            term,
            result,
        };
        let _ = callback.notify_timeout_now_reply_from_peer(reply).await;
    }

    pub(crate) fn handle_timeout_now_reply_from_peer(&mut self, reply: TimeoutNowReplyFromPeer) {
        let current_term = self.term_store.current_term();
        if reply.term != current_term || !self.election_state.is_leader() {
            slog::debug!(self.logger, "Dropping TimeoutNow reply for term {:?}", reply.term);
            return;
        }

        match reply.result {
            Ok(()) => {
                let target = self.redirect_info(&reply.peer_id);
                // Succeeds the transfer.
                self.step_down(target);
            }
            Err(PeerCallError::StaleTerm { new_term }) => {
                if let Some(transfer) = self.transfer.as_mut() {
                    transfer.timeout_now_failed();
                }
                if let Err(e) = self.observe_term(new_term, None) {
                    slog::error!(self.logger, "Failed to persist term {:?}: {:?}", new_term, e);
                }
            }
            Err(PeerCallError::RetryableFailure(err_msg)) => {
                // The target's next AppendEntries reply triggers another attempt.
                slog::warn!(self.logger, "TimeoutNow to {:?} failed: {:?}", reply.peer_id, err_msg);
                if let Some(transfer) = self.transfer.as_mut() {
                    transfer.timeout_now_failed();
                }
            }
        }
    }

    pub(crate) fn handle_transfer_deadline(&mut self, event: TransferDeadline) {
        match self.transfer.take() {
            Some(transfer) if transfer.transfer_id() == event.transfer_id => {
                slog::warn!(
                    self.logger,
                    "Leadership transfer to {:?} timed out. Resuming as leader.",
                    transfer.target()
                );
                transfer.fail(TransferLeadershipError::TimedOut);
            }
            other => self.transfer = other,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::actor::Callback;
    use crate::replica::log_entry::Index;
    use crate::replica::peers::ReplicaId;
    use crate::replica::replica::tests::{member, new_replica};
    use crate::replica::replica_api::{
        AppendEntriesReplyFromPeer, AppendEntriesReplyFromPeerDescriptor, RequestVoteReplyFromPeer,
        RequestVoteResult, Role, SubmitError, SubmitInput, TimeoutNowReplyFromPeer, TransferDeadline,
        TransferLeadershipError,
    };
    use crate::replica::replica::Replica;
    use crate::replica::term_store::Term;
    use bytes::Bytes;
    use tokio::sync::oneshot;

    fn elect(replica: &mut Replica) {
        replica.start_election().unwrap();
        replica.handle_request_vote_reply_from_peer(RequestVoteReplyFromPeer {
            peer_id: ReplicaId::new("b"),
            term: Term::new(1),
            result: RequestVoteResult::VoteGranted,
        });
        assert_eq!(replica.election_state.role(), Role::Leader);
    }

    fn submit(replica: &mut Replica) -> oneshot::Receiver<Result<crate::replica::replica_api::SubmitOutput, SubmitError>> {
        let (tx, rx) = oneshot::channel();
        replica.handle_submit(
            SubmitInput {
                data: Bytes::from_static(b"x"),
                request_id: "r".into(),
            },
            Callback::new(tx),
        );
        rx
    }

    #[tokio::test]
    async fn transfer_to_caught_up_peer() {
        let (mut replica, _client, _rx) = new_replica(vec![member("me", 1), member("a", 2), member("b", 3)]);
        elect(&mut replica);

        // "a" has the no-op, "b" has nothing.
        replica.handle_append_entries_reply_from_peer(AppendEntriesReplyFromPeer {
            descriptor: AppendEntriesReplyFromPeerDescriptor {
                peer_id: ReplicaId::new("a"),
                term: Term::new(1),
                seq_no: 1,
                previous_log_entry_index: Index::ZERO,
                num_log_entries: 1,
            },
            result: Ok(Index::new(1)),
        });

        let (tx, rx) = oneshot::channel();
        replica.handle_transfer_leadership(Callback::new(tx));
        assert!(replica.transfer.as_ref().unwrap().timeout_now_sent());

        // Writes are held off during the transfer.
        assert!(matches!(
            submit(&mut replica).await.unwrap(),
            Err(SubmitError::LeadershipTransferInProgress)
        ));

        let (tx2, rx2) = oneshot::channel();
        replica.handle_transfer_leadership(Callback::new(tx2));
        assert!(matches!(rx2.await.unwrap(), Err(TransferLeadershipError::InProgress)));

        replica.handle_timeout_now_reply_from_peer(TimeoutNowReplyFromPeer {
            peer_id: ReplicaId::new("a"),
            term: Term::new(1),
            result: Ok(()),
        });

        assert_eq!(rx.await.unwrap().unwrap().target, ReplicaId::new("a"));
        assert_eq!(replica.election_state.role(), Role::Follower);
        assert!(replica.transfer.is_none());
    }

    #[tokio::test]
    async fn transfer_times_out_and_leader_resumes() {
        let (mut replica, _client, _rx) = new_replica(vec![member("me", 1), member("a", 2), member("b", 3)]);

        let (tx, rx) = oneshot::channel();
        replica.handle_transfer_leadership(Callback::new(tx));
        assert!(matches!(rx.await.unwrap(), Err(TransferLeadershipError::NotLeader)));

        elect(&mut replica);
        let (tx, rx) = oneshot::channel();
        replica.handle_transfer_leadership(Callback::new(tx));
        // Nobody has caught up yet.
        assert!(!replica.transfer.as_ref().unwrap().timeout_now_sent());

        // Deadline of some earlier transfer is ignored.
        replica.handle_transfer_deadline(TransferDeadline { transfer_id: 7 });
        assert!(replica.transfer.is_some());

        replica.handle_transfer_deadline(TransferDeadline { transfer_id: 1 });
        assert!(matches!(rx.await.unwrap(), Err(TransferLeadershipError::TimedOut)));
        assert_eq!(replica.election_state.role(), Role::Leader);

        let mut rx = submit(&mut replica);
        assert!(rx.try_recv().is_err());
        assert_eq!(replica.log.last_index(), Index::new(2));
    }
}
