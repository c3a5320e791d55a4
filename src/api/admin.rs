use crate::actor::ActorClient;
use crate::api::types::{RaftLeaderInfo, RaftServerInfo};
use crate::replica;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;

/// RaftAdmin manages the cluster through the local replica. Membership changes and leadership
/// transfers must be sent to the leader; followers reply with a redirect.
#[derive(Clone)]
pub struct RaftAdmin {
    actor_client: ActorClient,
}

impl RaftAdmin {
    pub(crate) fn new(actor_client: ActorClient) -> Self {
        RaftAdmin { actor_client }
    }

    /// Add a server to the cluster. It joins as a non-voting member and is promoted to voting once
    /// it has caught up with the leader's log. Resolves when the promotion is committed.
    pub async fn add_server(&self, input: AddServerInput) -> Result<AddServerOutput, AddServerError> {
        let replica_input = replica::AddServerInput {
            replica_id: replica::ReplicaId::new(input.replica_id),
            address: input.address,
        };

        self.actor_client
            .add_server(replica_input)
            .await
            .map(|o| AddServerOutput {
                configuration_index: o.configuration_index.as_u64(),
            })
            .map_err(|e| e.into())
    }

    /// Remove a server from the cluster. Resolves when the new configuration is committed. The
    /// leader can't remove itself; transfer leadership first.
    pub async fn remove_server(&self, input: RemoveServerInput) -> Result<RemoveServerOutput, RemoveServerError> {
        let replica_input = replica::RemoveServerInput {
            replica_id: replica::ReplicaId::new(input.replica_id),
        };

        self.actor_client
            .remove_server(replica_input)
            .await
            .map(|o| RemoveServerOutput {
                configuration_index: o.configuration_index.as_u64(),
            })
            .map_err(|e| e.into())
    }

    /// Hand leadership to the most up to date voting peer. Client submissions are rejected until
    /// the transfer completes or times out.
    pub async fn transfer_leadership(&self) -> Result<TransferLeadershipOutput, TransferLeadershipError> {
        self.actor_client
            .transfer_leadership()
            .await
            .map(|o| TransferLeadershipOutput {
                new_leader_id: o.target.into_inner(),
            })
            .map_err(|e| e.into())
    }

    pub async fn get_on_demand_state(&self) -> Result<RaftOnDemandState, GetOnDemandStateError> {
        self.actor_client
            .get_on_demand_state()
            .await
            .map(|o| o.into())
            .map_err(|e| match e {
                replica::GetOnDemandStateError::ActorExited => GetOnDemandStateError::ReplicaExited,
            })
    }

    /// Capture a point-in-time snapshot of the state machine. The log isn't compacted.
    pub async fn get_snapshot(&self) -> Result<RaftSnapshot, GetSnapshotError> {
        self.actor_client
            .get_snapshot()
            .await
            .map(|o| o.into())
            .map_err(|e| match e {
                replica::GetSnapshotError::CaptureFailed(message) => GetSnapshotError::CaptureFailed(message),
                replica::GetSnapshotError::ActorExited => GetSnapshotError::ReplicaExited,
            })
    }
}

// ------- AddServer -------

#[derive(Debug)]
pub struct AddServerInput {
    pub replica_id: String,
    pub address: SocketAddr,
}

#[derive(Debug)]
pub struct AddServerOutput {
    /// Log index of the configuration entry that made the new server voting.
    pub configuration_index: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AddServerError {
    #[error("Not leader")]
    NotLeader(RaftLeaderInfo),
    #[error("No known leader. An election is likely in progress.")]
    NoLeader,
    #[error("Server is already a member")]
    AlreadyMember,
    #[error("Another membership change or leadership transfer is in progress")]
    ChangeInProgress,
    #[error("New server didn't catch up in time")]
    CatchUpTimedOut,
    #[error("Lost leadership before the change was committed")]
    NotCommitted,
    #[error("Failed to persist configuration")]
    LocalIoError(io::Error),
    #[error("Replica task has exited")]
    ReplicaExited,
}

// ------- RemoveServer -------

#[derive(Debug)]
pub struct RemoveServerInput {
    pub replica_id: String,
}

#[derive(Debug)]
pub struct RemoveServerOutput {
    pub configuration_index: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RemoveServerError {
    #[error("Not leader")]
    NotLeader(RaftLeaderInfo),
    #[error("No known leader. An election is likely in progress.")]
    NoLeader,
    #[error("Server is not a member")]
    NotMember,
    #[error("Removing the leader requires transferring leadership first")]
    RequiresLeadershipTransfer,
    #[error("Another membership change or leadership transfer is in progress")]
    ChangeInProgress,
    #[error("Lost leadership before the change was committed")]
    NotCommitted,
    #[error("Failed to persist configuration")]
    LocalIoError(io::Error),
    #[error("Replica task has exited")]
    ReplicaExited,
}

// ------- TransferLeadership -------

#[derive(Debug)]
pub struct TransferLeadershipOutput {
    pub new_leader_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferLeadershipError {
    #[error("Not leader")]
    NotLeader,
    #[error("No voting peer to transfer leadership to")]
    NoEligibleTarget,
    #[error("Leadership transfer or membership change already in progress")]
    InProgress,
    // Leader remains leader.
    #[error("Target didn't start an election in time")]
    TimedOut,
    #[error("Replica task has exited")]
    ReplicaExited,
}

// ------- GetOnDemandState -------

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RaftRole {
    Leader,
    Candidate,
    Follower,
}

#[derive(Clone, Debug)]
pub struct RaftPeerState {
    pub replica_id: String,
    pub address: SocketAddr,
    pub voting: bool,
    pub next_index: u64,
    pub match_index: u64,
}

/// Read-only view of the local replica, for observability.
#[derive(Clone, Debug)]
pub struct RaftOnDemandState {
    pub replica_id: String,
    pub role: RaftRole,
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub leader_id: Option<String>,
    pub voting: bool,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub snapshot_index: u64,
    pub snapshot_term: u64,
    pub in_memory_journal_data_size: usize,
    pub membership_change_in_progress: bool,
    pub leadership_transfer_in_progress: bool,
    /// Every other member. Replication progress is only meaningful on the leader.
    pub peers: Vec<RaftPeerState>,
}

#[derive(Debug, thiserror::Error)]
pub enum GetOnDemandStateError {
    #[error("Replica task has exited")]
    ReplicaExited,
}

// ------- GetSnapshot -------

#[derive(Clone, Debug)]
pub struct RaftSnapshot {
    /// What `StateMachine::create_snapshot()` returned.
    pub state: Bytes,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub last_applied_index: u64,
    /// Entries that were in the log past `last_included_index` when the snapshot was taken.
    pub unapplied_entry_count: usize,
    pub servers: Vec<RaftServerInfo>,
}

#[derive(Debug, thiserror::Error)]
pub enum GetSnapshotError {
    #[error("State machine failed to capture snapshot: {0}")]
    CaptureFailed(String),
    #[error("Replica task has exited")]
    ReplicaExited,
}

// ------- Conversions --------

impl From<replica::AddServerError> for AddServerError {
    fn from(internal_error: replica::AddServerError) -> Self {
        match internal_error {
            replica::AddServerError::LeaderRedirect(leader) => AddServerError::NotLeader(leader.into()),
            replica::AddServerError::NoLeader => AddServerError::NoLeader,
            replica::AddServerError::AlreadyMember => AddServerError::AlreadyMember,
            replica::AddServerError::ChangeInProgress => AddServerError::ChangeInProgress,
            replica::AddServerError::CatchUpTimedOut => AddServerError::CatchUpTimedOut,
            replica::AddServerError::NotCommitted => AddServerError::NotCommitted,
            replica::AddServerError::PersistenceFailure(e) => AddServerError::LocalIoError(e),
            replica::AddServerError::ActorExited => AddServerError::ReplicaExited,
        }
    }
}

impl From<replica::RemoveServerError> for RemoveServerError {
    fn from(internal_error: replica::RemoveServerError) -> Self {
        match internal_error {
            replica::RemoveServerError::LeaderRedirect(leader) => RemoveServerError::NotLeader(leader.into()),
            replica::RemoveServerError::NoLeader => RemoveServerError::NoLeader,
            replica::RemoveServerError::NotMember => RemoveServerError::NotMember,
            replica::RemoveServerError::RequiresLeadershipTransfer => RemoveServerError::RequiresLeadershipTransfer,
            replica::RemoveServerError::ChangeInProgress => RemoveServerError::ChangeInProgress,
            replica::RemoveServerError::NotCommitted => RemoveServerError::NotCommitted,
            replica::RemoveServerError::PersistenceFailure(e) => RemoveServerError::LocalIoError(e),
            replica::RemoveServerError::ActorExited => RemoveServerError::ReplicaExited,
        }
    }
}

impl From<replica::TransferLeadershipError> for TransferLeadershipError {
    fn from(internal_error: replica::TransferLeadershipError) -> Self {
        match internal_error {
            replica::TransferLeadershipError::NotLeader => TransferLeadershipError::NotLeader,
            replica::TransferLeadershipError::NoEligibleTarget => TransferLeadershipError::NoEligibleTarget,
            replica::TransferLeadershipError::InProgress => TransferLeadershipError::InProgress,
            replica::TransferLeadershipError::TimedOut => TransferLeadershipError::TimedOut,
            replica::TransferLeadershipError::ActorExited => TransferLeadershipError::ReplicaExited,
        }
    }
}

impl From<replica::Role> for RaftRole {
    fn from(role: replica::Role) -> Self {
        match role {
            replica::Role::Leader => RaftRole::Leader,
            replica::Role::Candidate => RaftRole::Candidate,
            replica::Role::Follower => RaftRole::Follower,
        }
    }
}

impl From<replica::OnDemandState> for RaftOnDemandState {
    fn from(state: replica::OnDemandState) -> Self {
        RaftOnDemandState {
            replica_id: state.replica_id.into_inner(),
            role: state.role.into(),
            current_term: state.current_term.as_u64(),
            voted_for: state.voted_for.map(|id| id.into_inner()),
            leader_id: state.leader.map(|id| id.into_inner()),
            voting: state.voting,
            commit_index: state.commit_index.as_u64(),
            last_applied: state.last_applied.as_u64(),
            last_log_index: state.last_log_index.as_u64(),
            last_log_term: state.last_log_term.as_u64(),
            snapshot_index: state.snapshot_index.as_u64(),
            snapshot_term: state.snapshot_term.as_u64(),
            in_memory_journal_data_size: state.in_memory_journal_data_size,
            membership_change_in_progress: state.membership_change_in_progress,
            leadership_transfer_in_progress: state.leadership_transfer_in_progress,
            peers: state
                .peers
                .into_iter()
                .map(|peer| RaftPeerState {
                    replica_id: peer.replica_id.into_inner(),
                    address: peer.address,
                    voting: peer.voting,
                    next_index: peer.next_index.as_u64(),
                    match_index: peer.match_index.as_u64(),
                })
                .collect(),
        }
    }
}

impl From<replica::Snapshot> for RaftSnapshot {
    fn from(snapshot: replica::Snapshot) -> Self {
        RaftSnapshot {
            last_included_index: snapshot.last_included_index.as_u64(),
            last_included_term: snapshot.last_included_term.as_u64(),
            last_applied_index: snapshot.last_applied_index.as_u64(),
            unapplied_entry_count: snapshot.unapplied_entries.len(),
            servers: snapshot
                .server_configuration
                .servers()
                .iter()
                .map(RaftServerInfo::from)
                .collect(),
            state: snapshot.state,
        }
    }
}
