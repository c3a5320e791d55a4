use crate::replica::log_entry::{Index, LogEntry};
use crate::replica::peers::ReplicaId;
use crate::replica::snapshot::Snapshot;
use crate::replica::term_store::Term;
use bytes::Bytes;
use std::cmp::Ordering;
use std::io;
use std::net::SocketAddr;

/// LogPosition identifies an entry by (term, index). (0, 0) means "no entry".
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub(crate) struct LogPosition {
    pub(crate) term: Term,
    pub(crate) index: Index,
}

impl LogPosition {
    pub(crate) fn new(term: Term, index: Index) -> Self {
        LogPosition { term, index }
    }
}

impl PartialOrd for LogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogPosition {
    // Later last term wins. Same last term, longer log wins.
    fn cmp(&self, other: &Self) -> Ordering {
        self.term.cmp(&other.term).then(self.index.cmp(&other.index))
    }
}

// ------- Submit -------

#[derive(Debug)]
pub(crate) struct SubmitInput {
    pub(crate) data: Bytes,
    pub(crate) request_id: String,
}

#[derive(Debug)]
pub(crate) struct SubmitOutput {
    pub(crate) index: Index,
    pub(crate) term: Term,
    pub(crate) output: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SubmitError {
    #[error("Not leader")]
    LeaderRedirect(LeaderRedirectInfo),

    // Retryable once an election settles.
    #[error("No known leader. An election is likely in progress.")]
    NoLeader,

    #[error("Leader hasn't heard from a majority recently")]
    QuorumUnavailable,

    #[error("Leadership transfer in progress")]
    LeadershipTransferInProgress,

    #[error("Lost leadership before the entry was committed")]
    NotCommitted,

    #[error("Failed to persist log")]
    PersistenceFailure(io::Error),

    #[error("Replica task has exited")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub(crate) struct LeaderRedirectInfo {
    pub(crate) replica_id: ReplicaId,
    pub(crate) address: SocketAddr,
}

// ------- RequestVote -------

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: LogPosition,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
    pub(crate) term: Term,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Failed to persist vote: {0:?}")]
    PersistenceFailure(io::Error),
    #[error("Replica task has exited")]
    ActorExited,
}

// ------- AppendEntries -------

#[derive(Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) previous_log_entry: LogPosition,
    pub(crate) leader_commit_index: Index,
    pub(crate) new_entries: Vec<LogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    pub(crate) term: Term,
    pub(crate) match_index: Index,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Caller's term is stale")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Log has no entry matching the previous position")]
    ServerMissingPreviousLogEntry { last_log_index: Index },
    #[error("Local IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("Replica task has exited")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

// ------- InstallSnapshot -------

#[derive(Debug)]
pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) snapshot: Snapshot,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotOutput {
    pub(crate) term: Term,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum InstallSnapshotError {
    #[error("Caller's term is stale")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Snapshot install failed: {0}")]
    InstallFailed(String),
    #[error("Replica task has exited")]
    ActorExited,
}

// ------- TimeoutNow -------

#[derive(Debug)]
pub(crate) struct TimeoutNowInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
}

#[derive(Debug)]
pub(crate) struct TimeoutNowOutput {
    pub(crate) term: Term,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum TimeoutNowError {
    #[error("Caller's term is stale")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("This replica are not a voting member")]
    NotVoting,
    #[error("Failed to persist new term: {0:?}")]
    PersistenceFailure(io::Error),
    #[error("Replica task has exited")]
    ActorExited,
}

// ------- Replies from peers -------

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted { peer_term: Term },
    RetryableFailure(String),
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<Index, AppendEntriesReplyFromPeerError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Index,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug)]
pub(crate) enum AppendEntriesReplyFromPeerError {
    PeerMissingPreviousLogEntry { last_log_index: Index },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) last_included_index: Index,
    pub(crate) result: Result<(), PeerCallError>,
}

#[derive(Debug)]
pub(crate) struct TimeoutNowReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: Result<(), PeerCallError>,
}

#[derive(Debug)]
pub(crate) enum PeerCallError {
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

// ------- Timers and internal notifications -------

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

/// ElectionTimeout fires when a follower or candidate hasn't heard from a leader. Each timer
/// instance gets a new generation so a timeout queued before a role change can be discarded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ElectionTimeout {
    pub(crate) generation: u64,
}

/// Buffered journal writes are waiting to be flushed.
#[derive(Debug)]
pub(crate) struct EntryPersisted {
    pub(crate) index: Index,
}

#[derive(Debug)]
pub(crate) struct MembershipDeadline {
    pub(crate) change_id: u64,
}

#[derive(Debug)]
pub(crate) struct TransferDeadline {
    pub(crate) transfer_id: u64,
}

#[derive(Debug)]
pub(crate) struct SnapshotCaptured {
    pub(crate) index: Index,
    pub(crate) term: Term,
    pub(crate) result: Result<Bytes, String>,
}

#[derive(Debug)]
pub(crate) struct SnapshotRestored {
    pub(crate) index: Index,
    pub(crate) result: Result<(), String>,
}

// ------- Management -------

#[derive(Debug)]
pub(crate) struct AddServerInput {
    pub(crate) replica_id: ReplicaId,
    pub(crate) address: SocketAddr,
}

#[derive(Debug)]
pub(crate) struct AddServerOutput {
    pub(crate) configuration_index: Index,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum AddServerError {
    #[error("Not leader")]
    LeaderRedirect(LeaderRedirectInfo),
    #[error("No one is leader")]
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
    PersistenceFailure(io::Error),
    #[error("Replica task has exited")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct RemoveServerInput {
    pub(crate) replica_id: ReplicaId,
}

#[derive(Debug)]
pub(crate) struct RemoveServerOutput {
    pub(crate) configuration_index: Index,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RemoveServerError {
    #[error("Not leader")]
    LeaderRedirect(LeaderRedirectInfo),
    #[error("No one is leader")]
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
    PersistenceFailure(io::Error),
    #[error("Replica task has exited")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TransferLeadershipOutput {
    pub(crate) target: ReplicaId,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransferLeadershipError {
    #[error("Not leader")]
    NotLeader,
    #[error("No voting peer to transfer leadership to")]
    NoEligibleTarget,
    #[error("Leadership transfer or membership change already in progress")]
    InProgress,
    #[error("Target didn't start an election in time")]
    TimedOut,
    #[error("Replica task has exited")]
    ActorExited,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Role {
    Leader,
    Candidate,
    Follower,
}

#[derive(Debug, Clone)]
pub(crate) struct PeerProgress {
    pub(crate) replica_id: ReplicaId,
    pub(crate) address: SocketAddr,
    pub(crate) voting: bool,
    pub(crate) next_index: Index,
    pub(crate) match_index: Index,
}

/// Read-only view of a replica for observability.
#[derive(Debug, Clone)]
pub(crate) struct OnDemandState {
    pub(crate) replica_id: ReplicaId,
    pub(crate) role: Role,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<ReplicaId>,
    pub(crate) leader: Option<ReplicaId>,
    pub(crate) voting: bool,
    pub(crate) commit_index: Index,
    pub(crate) last_applied: Index,
    pub(crate) last_log_index: Index,
    pub(crate) last_log_term: Term,
    pub(crate) snapshot_index: Index,
    pub(crate) snapshot_term: Term,
    pub(crate) in_memory_journal_data_size: usize,
    pub(crate) membership_change_in_progress: bool,
    pub(crate) leadership_transfer_in_progress: bool,
    pub(crate) peers: Vec<PeerProgress>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum GetOnDemandStateError {
    #[error("Replica task has exited")]
    ActorExited,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum GetSnapshotError {
    #[error("State machine failed to capture snapshot: {0}")]
    CaptureFailed(String),
    #[error("Replica task has exited")]
    ActorExited,
}
