mod grpc;
mod in_memory;

pub(crate) use grpc::GrpcPeerTransport;
pub use in_memory::InMemoryNetwork;
pub(crate) use in_memory::InMemoryPeerTransport;

use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeerError,
    InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput, PeerCallError, ReplicaMetadata,
    RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteResult, TimeoutNowError, TimeoutNowInput,
    TimeoutNowOutput,
};

/// PeerTransport carries a replica's outbound RPCs to one peer. Failures the caller can't do
/// anything about except retry are folded into a `RetryableFailure`.
///
/// Implementations don't time out calls themselves; the replica bounds every call.
#[async_trait::async_trait]
pub(crate) trait PeerTransport: Send + Sync + 'static {
    async fn request_vote(&self, target: &ReplicaMetadata, input: RequestVoteInput) -> RequestVoteResult;

    async fn append_entries(
        &self,
        target: &ReplicaMetadata,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesReplyFromPeerError>;

    async fn install_snapshot(
        &self,
        target: &ReplicaMetadata,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, PeerCallError>;

    async fn timeout_now(
        &self,
        target: &ReplicaMetadata,
        input: TimeoutNowInput,
    ) -> Result<TimeoutNowOutput, PeerCallError>;
}

// The peer's own result, as seen from the calling side.

fn request_vote_reply(result: Result<RequestVoteOutput, RequestVoteError>) -> RequestVoteResult {
    match result {
        Ok(RequestVoteOutput {
            vote_granted: true, ..
        }) => RequestVoteResult::VoteGranted,
        Ok(RequestVoteOutput {
            vote_granted: false,
            term,
        }) => RequestVoteResult::VoteNotGranted { peer_term: term },
        Err(e) => RequestVoteResult::RetryableFailure(format!("Peer failed RequestVote: {}", e)),
    }
}

fn append_entries_reply(
    result: Result<AppendEntriesOutput, AppendEntriesError>,
) -> Result<AppendEntriesOutput, AppendEntriesReplyFromPeerError> {
    result.map_err(|e| match e {
        AppendEntriesError::ClientTermOutOfDate(info) => AppendEntriesReplyFromPeerError::StaleTerm {
            new_term: info.current_term,
        },
        AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index } => {
            AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_index }
        }
        other => AppendEntriesReplyFromPeerError::RetryableFailure(format!("Peer failed AppendEntries: {}", other)),
    })
}

fn install_snapshot_reply(
    result: Result<InstallSnapshotOutput, InstallSnapshotError>,
) -> Result<InstallSnapshotOutput, PeerCallError> {
    result.map_err(|e| match e {
        InstallSnapshotError::ClientTermOutOfDate(info) => PeerCallError::StaleTerm {
            new_term: info.current_term,
        },
        other => PeerCallError::RetryableFailure(format!("Peer failed InstallSnapshot: {}", other)),
    })
}

fn timeout_now_reply(result: Result<TimeoutNowOutput, TimeoutNowError>) -> Result<TimeoutNowOutput, PeerCallError> {
    result.map_err(|e| match e {
        TimeoutNowError::ClientTermOutOfDate(info) => PeerCallError::StaleTerm {
            new_term: info.current_term,
        },
        other => PeerCallError::RetryableFailure(format!("Peer failed TimeoutNow: {}", other)),
    })
}
