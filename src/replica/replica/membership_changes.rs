use crate::actor::Callback;
use crate::replica::log_entry::{EntryPayload, Index};
use crate::replica::membership::{ServerConfiguration, ServerInfo};
use crate::replica::peers::ReplicaMetadata;
use crate::replica::replica::Replica;
use crate::replica::replica_api::{
    AddServerError, AddServerInput, AddServerOutput, MembershipDeadline, RemoveServerError, RemoveServerInput,
    RemoveServerOutput,
};

impl Replica {
    /// A configuration entry was committed. It is now the authoritative member set.
    pub(super) fn apply_committed_configuration(&mut self, index: Index, configuration: ServerConfiguration) {
        let delta = self.peers.apply_configuration(&configuration);
        slog::info!(
            self.logger,
            "Configuration at {:?} committed: {:?}. Delta: {:?}",
            index,
            configuration,
            delta
        );

        let leader_state = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state,
            None => return,
        };
        for peer_id in delta.added {
            leader_state.add_peer(peer_id);
        }
        for peer_id in delta.removed.iter() {
            leader_state.remove_peer(peer_id);
        }

        if let Some(next) = self.membership.on_configuration_committed(index, &configuration) {
            slog::warn!(self.logger, "Catch-up deadline passed. Removing the new server again.");
            self.propose_configuration(next);
        }
        // The new server may have caught up before its entry committed.
        if let Some(subject) = self.membership.subject().cloned() {
            self.on_peer_caught_up(&subject);
        }
    }

    pub(crate) fn handle_add_server(
        &mut self,
        input: AddServerInput,
        callback: Callback<AddServerOutput, AddServerError>,
    ) {
        if !self.election_state.is_leader() {
            let error = match self.known_leader() {
                Some(leader) => AddServerError::LeaderRedirect(leader),
                None => AddServerError::NoLeader,
            };
            callback.send(Err(error));
            return;
        }
        if self.membership.is_in_progress() || self.transfer.is_some() {
            callback.send(Err(AddServerError::ChangeInProgress));
            return;
        }
        if self.peers.contains_member(&input.replica_id) {
            callback.send(Err(AddServerError::AlreadyMember));
            return;
        }

        // Replicate to the new server right away, so it can catch up while its entry commits.
        let metadata = ReplicaMetadata::new(input.replica_id.clone(), input.address);
        let index = self.log.last_index().plus(1);
        self.peers.add_tentative_peer(metadata.clone(), index);
        if let Some(leader_state) = self.election_state.leader_state_mut() {
            leader_state.add_peer(input.replica_id.clone());
        }

        let server = ServerInfo::new(metadata, false);
        let configuration = self.peers.committed_configuration().with_server(server.clone());
        let change_id = self.membership.start_add(server, index, callback);
        slog::info!(
            self.logger,
            "Adding {:?} at {:?} as non-voting. Change {}.",
            input.replica_id,
            input.address,
            change_id
        );
        if let Err(e) = self.append_as_leader(EntryPayload::ServerConfiguration(configuration)) {
            slog::error!(self.logger, "Failed to persist configuration: {:?}", e);
            self.membership.proposal_failed(e);
            self.revert_tentative_peers();
            return;
        }

        let actor_client = self.actor_client.clone();
        let catch_up_timeout = self.options.catch_up_timeout;
        tokio::task::spawn(async move {
            tokio::time::sleep(catch_up_timeout).await;
            let _ = actor_client
                .notify_membership_deadline(MembershipDeadline { change_id })
                .await;
        });
    }

    pub(crate) fn handle_remove_server(
        &mut self,
        input: RemoveServerInput,
        callback: Callback<RemoveServerOutput, RemoveServerError>,
    ) {
        if !self.election_state.is_leader() {
            let error = match self.known_leader() {
                Some(leader) => RemoveServerError::LeaderRedirect(leader),
                None => RemoveServerError::NoLeader,
            };
            callback.send(Err(error));
            return;
        }
        if self.membership.is_in_progress() || self.transfer.is_some() {
            callback.send(Err(RemoveServerError::ChangeInProgress));
            return;
        }
        let server = match self.peers.committed_configuration().server(&input.replica_id) {
            Some(server) => server.clone(),
            None => {
                callback.send(Err(RemoveServerError::NotMember));
                return;
            }
        };
        if &input.replica_id == self.peers.my_replica_id() {
            callback.send(Err(RemoveServerError::RequiresLeadershipTransfer));
            return;
        }

        let configuration = self.peers.committed_configuration().without_server(&input.replica_id);
        let index = self.log.last_index().plus(1);
        let change_id = self.membership.start_remove(server, index, callback);
        slog::info!(self.logger, "Removing {:?}. Change {}.", input.replica_id, change_id);
        if let Err(e) = self.append_as_leader(EntryPayload::ServerConfiguration(configuration)) {
            slog::error!(self.logger, "Failed to persist configuration: {:?}", e);
            self.membership.proposal_failed(e);
        }
    }

    pub(crate) fn handle_membership_deadline(&mut self, event: MembershipDeadline) {
        if !self.election_state.is_leader() {
            return;
        }

        if let Some(next) = self
            .membership
            .on_deadline(event.change_id, self.peers.committed_configuration())
        {
            slog::warn!(self.logger, "New server didn't catch up in time. Removing it again.");
            self.propose_configuration(next);
        }
    }

    /// Leader only. Append a configuration the MembershipManager asked for.
    pub(super) fn propose_configuration(&mut self, configuration: ServerConfiguration) {
        // Reported before appending, since a lone voter commits the entry right away.
        let index = self.log.last_index().plus(1);
        self.membership.proposal_appended(index);
        if let Err(e) = self.append_as_leader(EntryPayload::ServerConfiguration(configuration)) {
            slog::error!(self.logger, "Failed to persist configuration: {:?}", e);
            self.membership.proposal_failed(e);
            self.revert_tentative_peers();
        }
    }

    fn revert_tentative_peers(&mut self) {
        let delta = self.peers.revert_to_committed();
        if let Some(leader_state) = self.election_state.leader_state_mut() {
            for peer_id in delta.removed.iter() {
                leader_state.remove_peer(peer_id);
            }
        }
    }
}
