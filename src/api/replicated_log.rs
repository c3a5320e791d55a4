use crate::actor::ActorClient;
use crate::api::types::RaftLeaderInfo;
use crate::replica;
use bytes::Bytes;
use std::io;

/// ReplicatedLog is the replicated log for external application to append to.
#[derive(Clone)]
pub struct ReplicatedLog {
    actor_client: ActorClient,
}

impl ReplicatedLog {
    pub(crate) fn new(actor_client: ActorClient) -> Self {
        ReplicatedLog { actor_client }
    }

    /// Append `input.data` to the log. Resolves once the entry is committed and applied to the
    /// leader's state machine, with whatever the state machine returned for it.
    ///
    /// A failure doesn't mean the entry was dropped. It may still commit later (e.g. after a
    /// `NotCommitted`), so retried submissions must be idempotent for your state machine.
    pub async fn submit(&self, input: SubmitInput) -> Result<SubmitOutput, SubmitError> {
        let replica_input = replica::SubmitInput {
            data: input.data,
            request_id: input.request_id,
        };

        self.actor_client
            .submit(replica_input)
            .await
            .map(|o| o.into())
            .map_err(|e| e.into())
    }
}

#[derive(Debug)]
pub struct SubmitInput {
    pub data: Bytes,
    /// Opaque to raft, it shows up in logs next to the entry.
    pub request_id: String,
}

#[derive(Debug)]
pub struct SubmitOutput {
    pub index: u64,
    pub term: u64,
    /// The state machine's reply to this entry.
    pub output: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Not leader")]
    NotLeader(RaftLeaderInfo),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("No known leader. An election is likely in progress.")]
    NoLeader,

    // Retryable. Likely a partition, or most of the cluster is down.
    #[error("Leader hasn't heard from a majority recently")]
    QuorumUnavailable,

    #[error("Leadership transfer in progress")]
    LeadershipTransferInProgress,

    // Retryable, but the entry may commit anyway.
    #[error("Lost leadership before the entry was committed")]
    NotCommitted,

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    // Replica logic runs on a background task. This error is returned if the task has exited.
    #[error("Replica task has exited")]
    ReplicaExited,
}

// ------- Conversions --------

impl From<replica::SubmitOutput> for SubmitOutput {
    fn from(internal_output: replica::SubmitOutput) -> Self {
        SubmitOutput {
            index: internal_output.index.as_u64(),
            term: internal_output.term.as_u64(),
            output: internal_output.output,
        }
    }
}

impl From<replica::SubmitError> for SubmitError {
    fn from(internal_error: replica::SubmitError) -> Self {
        match internal_error {
            replica::SubmitError::LeaderRedirect(leader_info) => {
                SubmitError::NotLeader(RaftLeaderInfo::from(leader_info))
            }
            replica::SubmitError::NoLeader => SubmitError::NoLeader,
            replica::SubmitError::QuorumUnavailable => SubmitError::QuorumUnavailable,
            replica::SubmitError::LeadershipTransferInProgress => SubmitError::LeadershipTransferInProgress,
            replica::SubmitError::NotCommitted => SubmitError::NotCommitted,
            replica::SubmitError::PersistenceFailure(e) => SubmitError::LocalIoError(e),
            replica::SubmitError::ActorExited => SubmitError::ReplicaExited,
        }
    }
}
