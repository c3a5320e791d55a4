use crate::actor::Callback;
use crate::replica::log_entry::Index;
use crate::replica::peers::{ReplicaId, ReplicaMetadata};
use crate::replica::replica_api::{AddServerError, AddServerOutput, RemoveServerError, RemoveServerOutput};
use std::io;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ServerInfo {
    metadata: ReplicaMetadata,
    voting: bool,
}

impl ServerInfo {
    pub(crate) fn new(metadata: ReplicaMetadata, voting: bool) -> Self {
        ServerInfo { metadata, voting }
    }

    pub(crate) fn replica_id(&self) -> &ReplicaId {
        self.metadata.replica_id()
    }

    pub(crate) fn metadata(&self) -> ReplicaMetadata {
        self.metadata.clone()
    }

    pub(crate) fn is_voting(&self) -> bool {
        self.voting
    }
}

/// ServerConfiguration is the ordered member set carried by a configuration log entry. Once the
/// entry commits it replaces the previous configuration wholesale.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ServerConfiguration {
    servers: Vec<ServerInfo>,
}

impl ServerConfiguration {
    pub(crate) fn new(servers: Vec<ServerInfo>) -> Self {
        ServerConfiguration { servers }
    }

    pub(crate) fn servers(&self) -> &[ServerInfo] {
        &self.servers
    }

    pub(crate) fn server(&self, replica_id: &ReplicaId) -> Option<&ServerInfo> {
        self.servers.iter().find(|s| s.replica_id() == replica_id)
    }

    pub(crate) fn contains(&self, replica_id: &ReplicaId) -> bool {
        self.server(replica_id).is_some()
    }

    pub(crate) fn is_voting(&self, replica_id: &ReplicaId) -> bool {
        matches!(self.server(replica_id), Some(s) if s.voting)
    }

    /// Add `server`, or replace the existing row with the same id (used for promotion).
    pub(crate) fn with_server(&self, server: ServerInfo) -> Self {
        let mut servers = self.servers.clone();
        match servers.iter_mut().find(|s| s.replica_id() == server.replica_id()) {
            Some(existing) => *existing = server,
            None => servers.push(server),
        }

        ServerConfiguration { servers }
    }

    pub(crate) fn without_server(&self, replica_id: &ReplicaId) -> Self {
        ServerConfiguration {
            servers: self
                .servers
                .iter()
                .filter(|s| s.replica_id() != replica_id)
                .cloned()
                .collect(),
        }
    }

    pub(crate) fn approx_size(&self) -> usize {
        self.servers
            .iter()
            .map(|s| s.replica_id().as_str().len() + 32)
            .sum()
    }
}

pub(crate) enum ChangeReply {
    Add(Callback<AddServerOutput, AddServerError>),
    Remove(Callback<RemoveServerOutput, RemoveServerError>),
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum Phase {
    // The entry adding the server as non-voting has been appended but not committed.
    AddAwaitingNonVotingCommit { index: Index, timed_out: bool },
    // Replicating to the non-voting server until it reaches the commit index.
    AddCatchingUp,
    AddAwaitingPromotionCommit { index: Index },
    // Catch-up took too long. The entry removing the server again is in flight.
    AddRollingBack { index: Index },
    RemoveAwaitingCommit { index: Index },
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum Proposal {
    Promotion,
    Rollback,
}

struct PendingChange {
    change_id: u64,
    subject: ServerInfo,
    phase: Phase,
    // Set while the caller is appending a configuration we handed out.
    proposing: Option<Proposal>,
    reply: ChangeReply,
}

/// MembershipManager drives one membership change at a time on the leader.
///
/// Adding a server is a two step protocol: the server is first added as non-voting, and once it
/// has caught up to the commit index a second configuration entry promotes it to voting. If it
/// doesn't catch up before the deadline, a third entry removes it again.
///
/// The manager never touches the log itself. Methods that need a new configuration entry return
/// the configuration to propose, and the caller reports the appended index back via
/// `proposal_appended()`.
pub(crate) struct MembershipManager {
    pending: Option<PendingChange>,
    last_change_id: u64,
}

impl MembershipManager {
    pub(crate) fn new() -> Self {
        MembershipManager {
            pending: None,
            last_change_id: 0,
        }
    }

    pub(crate) fn is_in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// The server being added or removed, if any.
    pub(crate) fn subject(&self) -> Option<&ReplicaId> {
        self.pending.as_ref().map(|p| p.subject.replica_id())
    }

    /// Returns the change id, which deadline events must echo back.
    pub(crate) fn start_add(
        &mut self,
        server: ServerInfo,
        index: Index,
        callback: Callback<AddServerOutput, AddServerError>,
    ) -> u64 {
        self.start(
            server,
            Phase::AddAwaitingNonVotingCommit {
                index,
                timed_out: false,
            },
            ChangeReply::Add(callback),
        )
    }

    pub(crate) fn start_remove(
        &mut self,
        server: ServerInfo,
        index: Index,
        callback: Callback<RemoveServerOutput, RemoveServerError>,
    ) -> u64 {
        self.start(server, Phase::RemoveAwaitingCommit { index }, ChangeReply::Remove(callback))
    }

    fn start(&mut self, subject: ServerInfo, phase: Phase, reply: ChangeReply) -> u64 {
        self.last_change_id += 1;
        self.pending = Some(PendingChange {
            change_id: self.last_change_id,
            subject,
            phase,
            proposing: None,
            reply,
        });

        self.last_change_id
    }

    /// A configuration entry was committed at `index`. `committed` is the configuration that is
    /// now in effect.
    pub(crate) fn on_configuration_committed(
        &mut self,
        index: Index,
        committed: &ServerConfiguration,
    ) -> Option<ServerConfiguration> {
        let pending = self.pending.as_mut()?;

        match pending.phase {
            Phase::AddAwaitingNonVotingCommit { index: i, timed_out } if i == index => {
                if timed_out {
                    pending.proposing = Some(Proposal::Rollback);
                    return Some(committed.without_server(pending.subject.replica_id()));
                }
                pending.phase = Phase::AddCatchingUp;
                None
            }
            Phase::AddAwaitingPromotionCommit { index: i } if i == index => {
                self.finish(index);
                None
            }
            Phase::AddRollingBack { index: i } if i == index => {
                self.fail_add(AddServerError::CatchUpTimedOut);
                None
            }
            Phase::RemoveAwaitingCommit { index: i } if i == index => {
                self.finish(index);
                None
            }
            _ => None,
        }
    }

    /// Leader learned `peer_id` has replicated up to `match_index`.
    pub(crate) fn on_peer_progress(
        &mut self,
        peer_id: &ReplicaId,
        match_index: Index,
        commit_index: Index,
        committed: &ServerConfiguration,
    ) -> Option<ServerConfiguration> {
        let pending = self.pending.as_mut()?;
        if pending.phase != Phase::AddCatchingUp || pending.subject.replica_id() != peer_id {
            return None;
        }
        if pending.proposing.is_some() || match_index < commit_index {
            return None;
        }

        pending.proposing = Some(Proposal::Promotion);
        Some(committed.with_server(ServerInfo::new(pending.subject.metadata(), true)))
    }

    pub(crate) fn on_deadline(&mut self, change_id: u64, committed: &ServerConfiguration) -> Option<ServerConfiguration> {
        let pending = self.pending.as_mut()?;
        if pending.change_id != change_id {
            return None;
        }

        match pending.phase {
            Phase::AddAwaitingNonVotingCommit { index, .. } => {
                // Can't propose the rollback until the first entry commits.
                pending.phase = Phase::AddAwaitingNonVotingCommit { index, timed_out: true };
                None
            }
            Phase::AddCatchingUp if pending.proposing.is_none() => {
                pending.proposing = Some(Proposal::Rollback);
                Some(committed.without_server(pending.subject.replica_id()))
            }
            _ => None,
        }
    }

    /// The configuration returned by one of the `on_*` methods was appended at `index`.
    pub(crate) fn proposal_appended(&mut self, index: Index) {
        if let Some(pending) = self.pending.as_mut() {
            match pending.proposing.take() {
                Some(Proposal::Promotion) => pending.phase = Phase::AddAwaitingPromotionCommit { index },
                Some(Proposal::Rollback) => pending.phase = Phase::AddRollingBack { index },
                None => {}
            }
        }
    }

    pub(crate) fn proposal_failed(&mut self, error: io::Error) {
        let pending = match self.pending.take() {
            Some(p) => p,
            None => return,
        };

        match pending.reply {
            ChangeReply::Add(cb) => cb.send(Err(AddServerError::PersistenceFailure(error))),
            ChangeReply::Remove(cb) => cb.send(Err(RemoveServerError::PersistenceFailure(error))),
        }
    }

    /// Leadership was lost. The caller may retry against the new leader.
    pub(crate) fn abort(&mut self) {
        let pending = match self.pending.take() {
            Some(p) => p,
            None => return,
        };

        match pending.reply {
            ChangeReply::Add(cb) => cb.send(Err(AddServerError::NotCommitted)),
            ChangeReply::Remove(cb) => cb.send(Err(RemoveServerError::NotCommitted)),
        }
    }

    fn finish(&mut self, index: Index) {
        if let Some(pending) = self.pending.take() {
            match pending.reply {
                ChangeReply::Add(cb) => cb.send(Ok(AddServerOutput {
                    configuration_index: index,
                })),
                ChangeReply::Remove(cb) => cb.send(Ok(RemoveServerOutput {
                    configuration_index: index,
                })),
            }
        }
    }

    fn fail_add(&mut self, error: AddServerError) {
        if let Some(pending) = self.pending.take() {
            if let ChangeReply::Add(cb) = pending.reply {
                cb.send(Err(error));
            }
        }
    }
}
