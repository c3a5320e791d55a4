use crate::actor::WeakActorClient;
use crate::replica::log_entry::{Index, LogEntry};
use crate::replica::peers::{ReplicaId, ReplicaMetadata};
use crate::replica::replica::Replica;
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    AppendEntriesReplyFromPeerDescriptor, AppendEntriesReplyFromPeerError, LeaderTimerTick, LogPosition, Role,
    TermOutOfDateInfo,
};
use crate::replica::term_store::Term;
use crate::transport::PeerTransport;
use std::sync::Arc;
use std::{cmp, io};
use tokio::time::{Duration, Instant};

impl Replica {
    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.term_store.current_term();
        if input.leader_term < current_term {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        self.accept_leader(input.leader_term, &input.leader_id)
            .map_err(AppendEntriesError::ServerIoError)?;
        let current_term = self.term_store.current_term();

        if self.pending_install.is_some() {
            return Err(AppendEntriesError::ServerIoError(io::Error::new(
                io::ErrorKind::Other,
                "Snapshot install in progress",
            )));
        }

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        let previous = input.previous_log_entry;
        if !self.log.is_in_sync(previous.index, previous.term) {
            // Hint where the leader should back up to.
            let last_log_index = cmp::min(self.log.last_index(), previous.index.saturating_minus(1));
            slog::debug!(
                self.logger,
                "Missing previous entry {:?}. Hinting {:?}.",
                previous,
                last_log_index
            );
            return Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index });
        }

        let num_new_entries = input.new_entries.len() as u64;
        self.reconcile_new_entries(input.new_entries)
            .map_err(AppendEntriesError::ServerIoError)?;
        let match_index = previous.index.plus(num_new_entries);

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        let new_commit_index = cmp::min(input.leader_commit_index, match_index);
        if self.log.ratchet_commit_index(new_commit_index) {
            self.apply_committed_entries();
        }

        Ok(AppendEntriesOutput {
            term: current_term,
            match_index,
        })
    }

    /// A leader for `term` (at least ours) has contacted us. Adopt the term and follow it.
    pub(super) fn accept_leader(&mut self, term: Term, leader_id: &ReplicaId) -> io::Result<()> {
        let leader = self.redirect_info(leader_id);
        let increased = self.observe_term(term, leader.clone())?;
        if !increased {
            if self.election_state.role() != Role::Follower {
                // Another candidate of our term won.
                self.step_down(leader);
            } else if let Some(leader) = leader {
                self.election_state.set_leader_if_unknown(&leader);
            }
        }

        self.election_state.reset_election_timer_if_follower();
        Ok(())
    }

    // 3. If [my] existing entry conflicts with [leader's new entries]
    // (same index but different terms), delete [my] existing entry and
    // all that follow it (§5.3)
    // 4. Append any new entries not already in the log
    //
    // Everything is durable before we return, since the leader counts our reply towards a
    // majority.
    fn reconcile_new_entries(&mut self, new_entries: Vec<LogEntry>) -> io::Result<()> {
        let mut to_append = Vec::new();
        for new_entry in new_entries {
            // Compacted entries are committed, so they match.
            if new_entry.index <= self.log.snapshot_index() {
                continue;
            }

            match self.log.term_at(new_entry.index) {
                // 4. (no-op)
                Some(existing_term) if existing_term == new_entry.term && to_append.is_empty() => continue,
                Some(_) if to_append.is_empty() => {
                    // 3. (delete)
                    slog::info!(
                        self.logger,
                        "Conflicting entry at {:?}. Truncating log from there.",
                        new_entry.index
                    );
                    self.log.remove_from_and_persist(new_entry.index, &mut self.entry_store)?;
                    to_append.push(new_entry);
                }
                _ => to_append.push(new_entry),
            }
        }

        if to_append.is_empty() {
            return Ok(());
        }

        // 4. (append)
        self.entry_store.persist_all_and_sync(&to_append)?;
        for entry in to_append {
            let index = entry.index;
            if !self.log.append(entry) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Entry {:?} doesn't follow our last entry {:?}", index, self.log.last_index()),
                ));
            }
        }

        Ok(())
    }

    pub(crate) fn handle_leader_timer(&mut self, tick: LeaderTimerTick) {
        let current_term = self.term_store.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }

        self.send_append_entries(&tick.peer_id);
    }

    /// Leader only. Send the peer whatever it's missing, or a heartbeat if it's up to date. Peers
    /// that fell behind our snapshot get the snapshot instead.
    pub(super) fn send_append_entries(&mut self, peer_id: &ReplicaId) {
        if !self.election_state.is_leader() {
            slog::debug!(self.logger, "Received leader timer event but no longer leader.");
            return;
        }
        let (target, next_index) = match self.peers.peer(peer_id) {
            Some(peer) => (peer.metadata().clone(), peer.next_index()),
            None => {
                slog::warn!(self.logger, "Missing Peer {:?} in PeerTable", peer_id);
                return;
            }
        };
        if self.log.needs_snapshot(next_index) {
            self.send_install_snapshot(peer_id);
            return;
        }

        let current_term = self.term_store.current_term();
        let previous_index = next_index.saturating_minus(1);
        let previous_term = match self.log.term_at(previous_index) {
            Some(term) => term,
            None => {
                // Peer's progress points past the end of our log.
                slog::warn!(
                    self.logger,
                    "Peer {:?} next index {:?} is past our last index {:?}",
                    peer_id,
                    next_index,
                    self.log.last_index()
                );
                if let Some(peer) = self.peers.peer_mut(peer_id) {
                    peer.record_mismatch(self.log.last_index());
                }
                return;
            }
        };

        let leader_state = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state,
            None => {
                slog::debug!(self.logger, "Received leader timer event but no longer leader.");
                return;
            }
        };
        let peer_state = match leader_state.peer_state_mut(peer_id) {
            Some(peer_state) => peer_state,
            None => {
                slog::warn!(
                    self.logger,
                    "Peer {:?} is present in PeerTable but missing in LeaderStateTracker. Tracker peers: {:?}",
                    peer_id,
                    leader_state.peer_ids()
                );
                return;
            }
        };
        if peer_state.has_outstanding_request() {
            slog::debug!(self.logger, "Request to peer {:?} already in flight", peer_id);
            return;
        }

        let new_entries = self.log.entries_from(next_index, self.options.max_entries_per_request);
        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id: peer_id.clone(),
            term: current_term,
            seq_no: peer_state.next_seq_no(),
            previous_log_entry_index: previous_index,
            num_log_entries: new_entries.len(),
        };
        let input = AppendEntriesInput {
            leader_term: current_term,
            leader_id: self.peers.my_replica_id().clone(),
            previous_log_entry: LogPosition::new(previous_term, previous_index),
            leader_commit_index: self.log.commit_index(),
            new_entries,
        };

        tokio::task::spawn(Self::call_peer_append_entries(
            self.logger.clone(),
            self.transport.clone(),
            target,
            input,
            self.options.rpc_timeout,
            self.actor_client.clone(),
            descriptor,
        ));

        peer_state.postpone_heartbeat();
    }

    async fn call_peer_append_entries(
        logger: slog::Logger,
        transport: Arc<dyn PeerTransport>,
        target: ReplicaMetadata,
        input: AppendEntriesInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
    ) {
        let result = match tokio::time::timeout(rpc_timeout, transport.append_entries(&target, input)).await {
            Ok(result) => result.map(|output| output.match_index),
            Err(_) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Timed out calling AppendEntries".into(),
            )),
        };

        let reply = AppendEntriesReplyFromPeer { descriptor, result };
        if callback.notify_append_entries_reply_from_peer(reply).await.is_err() {
            slog::debug!(logger, "Replica exited before AppendEntries reply from {:?}", target.replica_id());
        }
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let descriptor = reply.descriptor;
        let logger = self.logger.new(slog::o!(
            "Peer" => format!("{:?}", descriptor.peer_id),
            "SeqNo" => descriptor.seq_no,
        ));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        // 1. Drop replies that are outdated or out of order.
        if !self.accept_peer_reply(&logger, &descriptor.peer_id, descriptor.term, descriptor.seq_no) {
            return;
        }

        // 2. Update peer progress.
        let now = Instant::now();
        match reply.result {
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                if let Err(e) = self.observe_term(new_term, None) {
                    slog::error!(logger, "Failed to persist term {:?}: {:?}", new_term, e);
                }
                return;
            }
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_index }) => {
                slog::info!(logger, "Peer is missing previous log entry. Peer's last index: {:?}", last_log_index);
                self.peers.record_activity(&descriptor.peer_id, now);
                if let Some(peer) = self.peers.peer_mut(&descriptor.peer_id) {
                    peer.record_mismatch(last_log_index);
                }
            }
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::warn!(logger, "AE failure: {:?}", err_msg);
                // Consider adding exponential backoff w jitter here.
                return;
            }
            Ok(match_index) => {
                let acknowledged = cmp::min(
                    match_index,
                    descriptor
                        .previous_log_entry_index
                        .plus(descriptor.num_log_entries as u64),
                );
                self.peers.record_activity(&descriptor.peer_id, now);
                if let Some(peer) = self.peers.peer_mut(&descriptor.peer_id) {
                    peer.record_match(acknowledged);
                }

                // 3. Check for majority replication and apply new commits.
                self.advance_commit_index();
                self.on_peer_caught_up(&descriptor.peer_id);
                if !self.election_state.is_leader() {
                    return;
                }
            }
        }

        // 4. Send the next batch right away.
        self.send_append_entries_if_behind(&descriptor.peer_id);
    }

    /// True if a reply for a request sent in `term` with `seq_no` should be processed: we are
    /// still leader of that term and no newer reply from the peer was seen.
    pub(super) fn accept_peer_reply(&mut self, logger: &slog::Logger, peer_id: &ReplicaId, term: Term, seq_no: u64) -> bool {
        let current_term = self.term_store.current_term();
        if current_term != term {
            slog::info!(
                logger,
                "Received reply for outdated term {:?}, but we're on term {:?}",
                term,
                current_term
            );
            return false;
        }

        match self.election_state.leader_state_mut() {
            None => {
                slog::info!(logger, "No longer leader");
                false
            }
            Some(leader_state) => match leader_state.peer_state_mut(peer_id) {
                None => {
                    slog::info!(logger, "Peer is no longer replicated to");
                    false
                }
                Some(peer_state) => {
                    if peer_state.accept_reply_seq_no(seq_no) {
                        true
                    } else {
                        slog::warn!(logger, "Dropping stale reply");
                        false
                    }
                }
            },
        }
    }

    /// > If last log index ≥ nextIndex for a follower: send
    /// > AppendEntries RPC with log entries starting at nextIndex
    pub(super) fn send_append_entries_if_behind(&mut self, peer_id: &ReplicaId) {
        let behind = self
            .peers
            .peer(peer_id)
            .map(|p| self.log.last_index() >= p.next_index())
            .unwrap_or(false);
        if behind {
            self.send_append_entries(peer_id);
        }
    }

    /// The peer's match index moved forward. Membership changes and leadership transfers may be
    /// waiting on that.
    pub(super) fn on_peer_caught_up(&mut self, peer_id: &ReplicaId) {
        let match_index = match self.peers.peer(peer_id) {
            Some(peer) => peer.match_index(),
            None => return,
        };

        if let Some(next) = self.membership.on_peer_progress(
            peer_id,
            match_index,
            self.log.commit_index(),
            self.peers.committed_configuration(),
        ) {
            slog::info!(self.logger, "{:?} caught up. Promoting it to voting.", peer_id);
            self.propose_configuration(next);
        }

        self.maybe_send_timeout_now(peer_id);
    }

    // Only used by tests to inspect how far behind a peer is.
    #[cfg(test)]
    pub(super) fn peer_next_index(&self, peer_id: &ReplicaId) -> Option<Index> {
        self.peers.peer(peer_id).map(|p| p.next_index())
    }
}
