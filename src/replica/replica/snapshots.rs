use crate::actor::{Callback, WeakActorClient};
use crate::replica::log_entry::Index;
use crate::replica::peers::{ReplicaId, ReplicaMetadata};
use crate::replica::replica::Replica;
use crate::replica::replica_api::{
    GetSnapshotError, InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput,
    InstallSnapshotReplyFromPeer, PeerCallError, SnapshotCaptured, SnapshotRestored, TermOutOfDateInfo,
};
use crate::replica::snapshot::Snapshot;
use crate::transport::PeerTransport;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

// Snapshots can be large and the follower answers only after its state machine restored it.
const INSTALL_SNAPSHOT_TIMEOUT_FACTOR: u32 = 10;

/// A snapshot received from the leader that the state machine is restoring.
pub(super) struct PendingInstall {
    snapshot: Snapshot,
    callback: Callback<InstallSnapshotOutput, InstallSnapshotError>,
}

impl Replica {
    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
        callback: Callback<InstallSnapshotOutput, InstallSnapshotError>,
    ) {
        // 1. Reply immediately if term < currentTerm
        let current_term = self.term_store.current_term();
        if input.leader_term < current_term {
            callback.send(Err(InstallSnapshotError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            })));
            return;
        }

        if let Err(e) = self.accept_leader(input.leader_term, &input.leader_id) {
            callback.send(Err(InstallSnapshotError::InstallFailed(format!(
                "Failed to persist term: {:?}",
                e
            ))));
            return;
        }
        let current_term = self.term_store.current_term();

        let snapshot = input.snapshot;
        let index = snapshot.last_included_index;
        if index <= self.log.commit_index() {
            slog::info!(
                self.logger,
                "Already committed through {:?}. Ignoring snapshot at {:?}.",
                self.log.commit_index(),
                index
            );
            callback.send(Ok(InstallSnapshotOutput { term: current_term }));
            return;
        }
        if self.pending_install.is_some() {
            callback.send(Err(InstallSnapshotError::InstallFailed(
                "Another snapshot install is in progress".into(),
            )));
            return;
        }

        slog::info!(
            self.logger,
            "Installing snapshot from {:?} at {:?} (term {:?})",
            input.leader_id,
            index,
            snapshot.last_included_term
        );
        self.state_machine.restore(index, snapshot.state.clone());
        self.pending_install = Some(PendingInstall { snapshot, callback });
    }

    pub(crate) fn handle_snapshot_restored(&mut self, event: SnapshotRestored) {
        let PendingInstall { snapshot, callback } = match self.pending_install.take() {
            Some(p) if p.snapshot.last_included_index == event.index => p,
            other => {
                slog::warn!(self.logger, "Unexpected snapshot restore at {:?}", event.index);
                self.pending_install = other;
                return;
            }
        };

        if let Err(msg) = event.result {
            slog::error!(self.logger, "State machine failed to restore snapshot: {}", msg);
            callback.send(Err(InstallSnapshotError::InstallFailed(msg)));
            // The state machine kept its previous state. Carry on from where it was.
            self.apply_committed_entries();
            return;
        }

        let index = snapshot.last_included_index;
        let term = snapshot.last_included_term;

        // 6. If existing log entry has same index and term as snapshot's
        // last included entry, retain log entries following it and reply
        // 7. Discard the entire log
        let retained = if self.log.term_at(index) == Some(term) {
            self.log.entries_after(index)
        } else {
            Vec::new()
        };
        if let Err(e) = self.term_store.adopt_if_newer(&mut self.entry_store, &snapshot.term_info) {
            slog::warn!(self.logger, "Failed to persist term from snapshot: {:?}", e);
        }
        let installed = Snapshot {
            last_applied_index: index,
            last_applied_term: term,
            unapplied_entries: retained,
            ..snapshot
        };

        // The state machine already holds the snapshot, so memory follows it even if the journal
        // write fails. The leader resends and finds us committed.
        let saved = self
            .entry_store
            .save_snapshot(&installed, self.term_store.term_info(), index);
        self.log.install_snapshot(index, term);
        // 8. Reset state machine using snapshot contents (and load
        // snapshot's cluster configuration)
        self.peers.apply_configuration(&installed.server_configuration);
        self.snapshots.set_latest(installed.without_unapplied());

        match saved {
            Ok(()) => {
                slog::info!(self.logger, "Installed snapshot at {:?}", index);
                callback.send(Ok(InstallSnapshotOutput {
                    term: self.term_store.current_term(),
                }));
            }
            Err(e) => {
                slog::error!(self.logger, "Failed to persist installed snapshot: {:?}", e);
                callback.send(Err(InstallSnapshotError::InstallFailed(format!(
                    "Failed to persist snapshot: {:?}",
                    e
                ))));
            }
        }

        self.apply_committed_entries();
    }

    /// Leader only. The peer needs entries we compacted, so it gets our latest snapshot.
    pub(super) fn send_install_snapshot(&mut self, peer_id: &ReplicaId) {
        let target = match self.peers.metadata(peer_id) {
            Some(metadata) => metadata,
            None => return,
        };
        let snapshot = match self.snapshots.latest() {
            Some(snapshot) => snapshot.without_unapplied(),
            None => {
                slog::error!(self.logger, "Log is compacted but there's no snapshot to send {:?}", peer_id);
                return;
            }
        };

        let current_term = self.term_store.current_term();
        let peer_state = match self
            .election_state
            .leader_state_mut()
            .and_then(|leader_state| leader_state.peer_state_mut(peer_id))
        {
            Some(peer_state) => peer_state,
            None => return,
        };
        if peer_state.has_outstanding_request() {
            return;
        }

        let seq_no = peer_state.next_seq_no();
        let last_included_index = snapshot.last_included_index;
        let input = InstallSnapshotInput {
            leader_term: current_term,
            leader_id: self.peers.my_replica_id().clone(),
            snapshot,
        };
        tokio::task::spawn(Self::call_peer_install_snapshot(
            self.logger.new(slog::o!(
                "Peer" => format!("{:?}", peer_id),
                "SeqNo" => seq_no,
            )),
            self.transport.clone(),
            target,
            input,
            self.options.rpc_timeout * INSTALL_SNAPSHOT_TIMEOUT_FACTOR,
            self.actor_client.clone(),
            seq_no,
            last_included_index,
        ));
        peer_state.postpone_heartbeat();
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_peer_install_snapshot(
        logger: slog::Logger,
        transport: Arc<dyn PeerTransport>,
        target: ReplicaMetadata,
        input: InstallSnapshotInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        seq_no: u64,
        last_included_index: Index,
    ) {
        slog::info!(logger, "Sending snapshot at {:?}", last_included_index);
        let term = input.leader_term;
        let result = match tokio::time::timeout(rpc_timeout, transport.install_snapshot(&target, input)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(PeerCallError::RetryableFailure("Timed out calling InstallSnapshot".into())),
        };

        let reply = InstallSnapshotReplyFromPeer {
            peer_id: target.replica_id().clone(),
            term,
            seq_no,
            last_included_index,
            result,
        };
        let _ = callback.notify_install_snapshot_reply_from_peer(reply).await;
    }

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let logger = self.logger.new(slog::o!(
            "Peer" => format!("{:?}", reply.peer_id),
            "SeqNo" => reply.seq_no,
        ));
        slog::debug!(logger, "InstallSnapshot reply from peer result: {:?}", reply.result);

        if !self.accept_peer_reply(&logger, &reply.peer_id, reply.term, reply.seq_no) {
            return;
        }

        match reply.result {
            Ok(()) => {
                slog::info!(logger, "Peer installed snapshot at {:?}", reply.last_included_index);
                self.peers.record_activity(&reply.peer_id, Instant::now());
                if let Some(peer) = self.peers.peer_mut(&reply.peer_id) {
                    peer.record_match(reply.last_included_index);
                }
                self.advance_commit_index();
                self.on_peer_caught_up(&reply.peer_id);
                self.send_append_entries_if_behind(&reply.peer_id);
            }
            Err(PeerCallError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                if let Err(e) = self.observe_term(new_term, None) {
                    slog::error!(logger, "Failed to persist term {:?}: {:?}", new_term, e);
                }
            }
            Err(PeerCallError::RetryableFailure(err_msg)) => {
                // Next heartbeat tries again.
                slog::warn!(logger, "InstallSnapshot failure: {:?}", err_msg);
            }
        }
    }

    /// Capture and compact once enough has been applied since the last snapshot.
    pub(super) fn maybe_capture_snapshot(&mut self) {
        if self.snapshots.is_capturing() || self.pending_install.is_some() {
            return;
        }
        if !self.log.should_capture_snapshot(self.peers.has_followers()) {
            return;
        }

        self.begin_capture(true);
    }

    // Returns false if nothing was started.
    fn begin_capture(&mut self, compact: bool) -> bool {
        let index = self.log.last_applied();
        let term = match self.log.term_at(index) {
            Some(term) => term,
            None => {
                slog::error!(self.logger, "No term for last applied index {:?}", index);
                return false;
            }
        };
        let configuration = self.peers.committed_configuration().clone();
        if !self.snapshots.begin(index, term, compact, configuration) {
            return false;
        }

        slog::info!(self.logger, "Capturing snapshot at {:?} (term {:?})", index, term);
        self.state_machine.capture(index, term);
        true
    }

    pub(crate) fn handle_snapshot_captured(&mut self, event: SnapshotCaptured) {
        let pending = match self.snapshots.complete(event.index, event.term) {
            Some(pending) => pending,
            None => {
                slog::warn!(self.logger, "Unexpected snapshot capture at {:?}", event.index);
                return;
            }
        };
        let state = match event.result {
            Ok(state) => state,
            Err(msg) => {
                slog::error!(self.logger, "Snapshot capture at {:?} failed: {}", event.index, msg);
                pending.fail(&msg);
                return;
            }
        };

        let index = pending.index;
        let term = pending.term;
        let snapshot = Snapshot {
            state,
            last_included_index: index,
            last_included_term: term,
            last_applied_index: index,
            last_applied_term: term,
            unapplied_entries: self.log.entries_after(index),
            term_info: self.term_store.term_info().clone(),
            server_configuration: pending.configuration.clone(),
        };

        if pending.compact {
            if index <= self.log.snapshot_index() {
                slog::info!(self.logger, "Snapshot at {:?} was superseded", index);
                pending.fail("Superseded by a newer snapshot");
                return;
            }
            if let Err(e) =
                self.entry_store
                    .save_snapshot(&snapshot, self.term_store.term_info(), self.log.last_applied())
            {
                slog::error!(self.logger, "Failed to persist snapshot at {:?}: {:?}", index, e);
                pending.fail(&format!("Failed to persist snapshot: {:?}", e));
                return;
            }
            self.log.compact_through(index, term);
            self.snapshots.set_latest(snapshot.without_unapplied());
            slog::info!(
                self.logger,
                "Compacted log through {:?}. {} entries remain.",
                index,
                snapshot.unapplied_entries.len()
            );
        }

        pending.succeed(&snapshot);
    }

    pub(crate) fn handle_get_snapshot(&mut self, callback: Callback<Snapshot, GetSnapshotError>) {
        if self.pending_install.is_some() {
            callback.send(Err(GetSnapshotError::CaptureFailed(
                "Snapshot install in progress".into(),
            )));
            return;
        }

        // Join the capture in flight, if any.
        let callback = match self.snapshots.add_waiter(callback) {
            Some(callback) => callback,
            None => return,
        };
        if !self.begin_capture(false) {
            callback.send(Err(GetSnapshotError::CaptureFailed(
                "Failed to start capture".into(),
            )));
            return;
        }
        if let Some(callback) = self.snapshots.add_waiter(callback) {
            callback.send(Err(GetSnapshotError::CaptureFailed(
                "Capture finished unexpectedly".into(),
            )));
        }
    }
}
