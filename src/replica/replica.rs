mod leadership;
mod membership_changes;
mod replication;
mod snapshots;
mod voting;

use crate::actor::{Callback, WeakActorClient};
use crate::journal::{Journal, RecoveredState};
use crate::replica::applier::StateMachineHandle;
use crate::replica::client_requests::ClientRequestTracker;
use crate::replica::election::{ElectionConfig, ElectionState, ElectionStateChangeListener};
use crate::replica::entry_store::EntryStore;
use crate::replica::leadership_transfer::LeadershipTransfer;
use crate::replica::log_entry::{EntryPayload, Index, LogEntry};
use crate::replica::membership::{MembershipManager, ServerConfiguration};
use crate::replica::peers::{PeerTable, ReplicaId, ReplicaMetadata};
use crate::replica::replica_api::{
    EntryPersisted, LeaderRedirectInfo, LogPosition, OnDemandState, PeerProgress, SubmitError, SubmitInput,
    SubmitOutput, TransferLeadershipError,
};
use crate::replica::replicated_log::{ReplicatedLog, SnapshotPolicy};
use crate::replica::snapshot::SnapshotTracker;
use crate::replica::term_store::{Term, TermStore};
use crate::server::RpcServerShutdownHandle;
use crate::transport::PeerTransport;
use std::io;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub(crate) struct ReplicaOptions {
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) rpc_timeout: Duration,
    pub(crate) max_entries_per_request: usize,
    pub(crate) snapshot_policy: SnapshotPolicy,
    pub(crate) catch_up_timeout: Duration,
    pub(crate) leadership_transfer_timeout: Duration,
}

pub(crate) struct ReplicaConfig {
    pub(crate) logger: slog::Logger,
    pub(crate) my_metadata: ReplicaMetadata,
    // Used when neither the snapshot nor the log holds a configuration.
    pub(crate) bootstrap_configuration: ServerConfiguration,
    pub(crate) journal: Box<dyn Journal>,
    pub(crate) recovered: RecoveredState,
    pub(crate) state_machine: StateMachineHandle,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) server_shutdown_handle: Option<RpcServerShutdownHandle>,
    pub(crate) options: ReplicaOptions,
}

/// Replica is the Raft state of one cluster member. Every method runs on the replica's actor
/// task, one event at a time; anything slow (peer calls, journal flushes, the application's state
/// machine) runs elsewhere and reports back as another event.
pub(crate) struct Replica {
    logger: slog::Logger,
    peers: PeerTable,
    term_store: TermStore,
    entry_store: EntryStore,
    log: ReplicatedLog,
    election_state: ElectionState,
    client_requests: ClientRequestTracker,
    membership: MembershipManager,
    transfer: Option<LeadershipTransfer>,
    last_transfer_id: u64,
    snapshots: SnapshotTracker,
    pending_install: Option<snapshots::PendingInstall>,
    state_machine: StateMachineHandle,
    transport: Arc<dyn PeerTransport>,
    actor_client: WeakActorClient,
    options: ReplicaOptions,
    // Dropped along with the replica, which stops the RPC server.
    _server_shutdown_handle: Option<RpcServerShutdownHandle>,
}

impl Replica {
    pub(crate) fn new(config: ReplicaConfig) -> (Self, ElectionStateChangeListener) {
        let ReplicaConfig {
            logger,
            my_metadata,
            bootstrap_configuration,
            journal,
            recovered,
            state_machine,
            transport,
            actor_client,
            server_shutdown_handle,
            options,
        } = config;
        let RecoveredState {
            term_info,
            snapshot,
            entries,
            applied_index,
        } = recovered;

        let snapshot_position = snapshot
            .as_ref()
            .map(|s| LogPosition::new(s.last_included_term, s.last_included_index))
            .unwrap_or_default();
        let log = ReplicatedLog::recover(options.snapshot_policy.clone(), snapshot_position, entries, applied_index);

        let mut entry_store = EntryStore::new(logger.clone(), journal, actor_client.clone());
        entry_store.recovered(log.last_index());

        // The newest configuration we know to be committed: the snapshot's, overridden by any
        // configuration entry that was applied before we went down.
        let starting_configuration = snapshot
            .as_ref()
            .map(|s| s.server_configuration.clone())
            .unwrap_or(bootstrap_configuration);
        let peers = PeerTable::new(my_metadata.clone(), starting_configuration);

        let (election_state, listener) = ElectionState::new_follower(
            ElectionConfig {
                my_replica_id: my_metadata.replica_id().clone(),
                leader_heartbeat_duration: options.leader_heartbeat_duration,
                follower_min_timeout: options.follower_min_timeout,
                follower_max_timeout: options.follower_max_timeout,
            },
            actor_client.clone(),
        );

        let mut replica = Replica {
            logger,
            peers,
            term_store: TermStore::new(my_metadata.replica_id().clone(), term_info),
            entry_store,
            log,
            election_state,
            client_requests: ClientRequestTracker::new(),
            membership: MembershipManager::new(),
            transfer: None,
            last_transfer_id: 0,
            snapshots: SnapshotTracker::new(snapshot.map(|s| s.without_unapplied())),
            pending_install: None,
            state_machine,
            transport,
            actor_client,
            options,
            _server_shutdown_handle: server_shutdown_handle,
        };
        replica.replay_applied_entries();

        (replica, listener)
    }

    // The state machine was restored from the snapshot; everything after it that we had applied
    // before going down is applied again.
    fn replay_applied_entries(&mut self) {
        let first = self.log.snapshot_index().plus(1);
        let last = self.log.last_applied();
        let mut replayed = 0u64;

        let mut index = first;
        while index <= last {
            if let Some(entry) = self.log.entry_at(index).cloned() {
                match entry.payload {
                    EntryPayload::Client(data) => self.state_machine.apply(entry.index, entry.term, data, None),
                    EntryPayload::Noop => {}
                    EntryPayload::ServerConfiguration(config) => {
                        self.peers.apply_configuration(&config);
                    }
                }
                replayed += 1;
            }
            index = index.plus(1);
        }

        slog::info!(
            self.logger,
            "Recovered log [{:?}, {:?}] at term {:?}. Replayed {} applied entries. Configuration: {:?}",
            self.log.snapshot_index(),
            self.log.last_index(),
            self.term_store.current_term(),
            replayed,
            self.peers.committed_configuration()
        );
    }

    pub(crate) fn handle_submit(&mut self, input: SubmitInput, callback: Callback<SubmitOutput, SubmitError>) {
        if !self.election_state.is_leader() {
            let error = match self.known_leader() {
                Some(leader) => SubmitError::LeaderRedirect(leader),
                None => SubmitError::NoLeader,
            };
            callback.send(Err(error));
            return;
        }
        if self.transfer.is_some() {
            callback.send(Err(SubmitError::LeadershipTransferInProgress));
            return;
        }
        if !self
            .peers
            .has_quorum_contact(Instant::now(), self.options.follower_max_timeout)
        {
            slog::warn!(self.logger, "Rejecting submit. Haven't heard from a majority recently.");
            callback.send(Err(SubmitError::QuorumUnavailable));
            return;
        }

        let term = self.term_store.current_term();
        let index = match self.append_as_leader(EntryPayload::Client(input.data)) {
            Ok(index) => index,
            Err(e) => {
                callback.send(Err(SubmitError::PersistenceFailure(e)));
                return;
            }
        };
        self.client_requests.track(index, term, input.request_id, callback);

        self.replicate_to_all_idle_peers();
    }

    pub(crate) fn handle_entry_persisted(&mut self, event: EntryPersisted) {
        match self.entry_store.on_entry_persisted() {
            Ok(durable_index) => {
                slog::debug!(
                    self.logger,
                    "Journal flushed through {:?} (requested at {:?})",
                    durable_index,
                    event.index
                );
                if self.election_state.is_leader() {
                    self.advance_commit_index();
                }
            }
            Err(e) => {
                slog::error!(self.logger, "Failed to flush journal: {:?}", e);
                if self.election_state.is_leader() {
                    // Our own copy of the entries can't be counted towards a majority.
                    self.step_down(None);
                }
            }
        }
    }

    pub(crate) fn on_demand_state(&self) -> OnDemandState {
        let (current_term, voted_for) = self.term_store.voted_for_current_term();
        let leader = if self.election_state.is_leader() {
            Some(self.peers.my_replica_id().clone())
        } else {
            self.election_state.known_leader().map(|l| l.replica_id.clone())
        };

        OnDemandState {
            replica_id: self.peers.my_replica_id().clone(),
            role: self.election_state.role(),
            current_term,
            voted_for: voted_for.cloned(),
            leader,
            voting: self.peers.i_am_voting(),
            commit_index: self.log.commit_index(),
            last_applied: self.log.last_applied(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            snapshot_index: self.log.snapshot_index(),
            snapshot_term: self.log.snapshot_term(),
            in_memory_journal_data_size: self.log.data_size(),
            membership_change_in_progress: self.membership.is_in_progress(),
            leadership_transfer_in_progress: self.transfer.is_some(),
            peers: self
                .peers
                .iter_peers()
                .map(|p| PeerProgress {
                    replica_id: p.metadata().replica_id().clone(),
                    address: p.metadata().address(),
                    voting: p.voting_state().is_voting(),
                    next_index: p.next_index(),
                    match_index: p.match_index(),
                })
                .collect(),
        }
    }

    // ------- Shared by the handlers -------

    fn known_leader(&self) -> Option<LeaderRedirectInfo> {
        self.election_state.known_leader().cloned()
    }

    fn redirect_info(&self, replica_id: &ReplicaId) -> Option<LeaderRedirectInfo> {
        self.peers.metadata(replica_id).map(|m| LeaderRedirectInfo {
            replica_id: m.replica_id().clone(),
            address: m.address(),
        })
    }

    /// > If RPC request or response contains term T > currentTerm:
    /// > set currentTerm = T, convert to follower (§5.1)
    ///
    /// Returns true if the term increased.
    fn observe_term(&mut self, term: Term, new_leader: Option<LeaderRedirectInfo>) -> io::Result<bool> {
        let increased = self.term_store.store_term_if_increased(&mut self.entry_store, term)?;
        if increased {
            self.step_down(new_leader);
            slog::info!(
                self.logger,
                "Observed term {:?}. Transitioned to follower. Election state: {:?}",
                term,
                self.election_state
            );
        }

        Ok(increased)
    }

    /// Become follower. Anything that only made sense while leading is resolved.
    fn step_down(&mut self, new_leader: Option<LeaderRedirectInfo>) {
        if self.election_state.is_leader() {
            let failed = self.client_requests.fail_all();
            if failed > 0 {
                slog::info!(self.logger, "Lost leadership. Failed {} uncommitted client requests.", failed);
            }
            self.membership.abort();
            self.peers.revert_to_committed();

            if let Some(transfer) = self.transfer.take() {
                if transfer.timeout_now_sent() {
                    slog::info!(self.logger, "Leadership transferred to {:?}", transfer.target());
                    transfer.succeed();
                } else {
                    transfer.fail(TransferLeadershipError::NotLeader);
                }
            }
        }

        self.election_state.transition_to_follower(new_leader);
    }

    /// Leader only. Appends an entry in the current term. Configuration entries are flushed right
    /// away, everything else is flushed in batches.
    fn append_as_leader(&mut self, payload: EntryPayload) -> io::Result<Index> {
        let entry = LogEntry::new(self.log.last_index().plus(1), self.term_store.current_term(), payload);
        if entry.requires_sync() {
            self.entry_store.persist_and_sync(&entry)?;
        } else {
            self.entry_store.persist(&entry)?;
        }

        let index = entry.index;
        if !self.log.append(entry) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Log rejected leader entry at {:?}", index),
            ));
        }

        // A single voting member commits by itself.
        self.advance_commit_index();
        Ok(index)
    }

    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    fn advance_commit_index(&mut self) {
        let quorum_index = self.peers.quorum_match_index(self.entry_store.durable_index());
        if quorum_index <= self.log.commit_index() {
            return;
        }

        // > Figure 8: A time sequence showing why a leader cannot determine
        // > commitment using log entries from older terms.
        if self.log.term_at(quorum_index) != Some(self.term_store.current_term()) {
            return;
        }

        if self.log.ratchet_commit_index(quorum_index) {
            slog::debug!(self.logger, "Commit index advanced to {:?}", quorum_index);
            self.apply_committed_entries();
        }
    }

    /// > If commitIndex > lastApplied: increment lastApplied, apply
    /// > log[lastApplied] to state machine (§5.3)
    fn apply_committed_entries(&mut self) {
        // The state machine is being replaced. Entries resume from the snapshot once it's done.
        if self.pending_install.is_some() {
            return;
        }

        let applied_before = self.log.last_applied();
        while let Some(entry) = self.log.next_to_apply().cloned() {
            // Marked first: a configuration entry may append and commit more entries, which
            // re-enters this loop.
            self.log.mark_applied(entry.index);
            match entry.payload {
                EntryPayload::Client(data) => {
                    let reply = self.client_requests.take(entry.index, entry.term);
                    self.state_machine.apply(entry.index, entry.term, data, reply);
                }
                EntryPayload::Noop => {}
                EntryPayload::ServerConfiguration(config) => {
                    self.apply_committed_configuration(entry.index, config);
                }
            }
        }

        if self.log.last_applied() > applied_before {
            if let Err(e) = self.entry_store.apply_to(self.log.last_applied()) {
                // Only costs extra re-applies after a restart.
                slog::warn!(self.logger, "Failed to record applied index: {:?}", e);
            }
            self.maybe_capture_snapshot();
        }
    }

    // Leader: start replicating to peers that have nothing in flight, instead of waiting for their
    // next heartbeat.
    fn replicate_to_all_idle_peers(&mut self) {
        let peer_ids = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state.peer_ids(),
            None => return,
        };
        for peer_id in peer_ids {
            self.send_append_entries(&peer_id);
        }
    }
}
