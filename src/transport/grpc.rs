use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, proto_timeout_now_error,
    proto_timeout_now_result, ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotReq,
    ProtoInstallSnapshotResult, ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoTimeoutNowReq,
    ProtoTimeoutNowResult,
};
use crate::replica::{
    AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeerError, Index, InstallSnapshotInput,
    InstallSnapshotOutput, PeerCallError, ReplicaMetadata, RequestVoteInput, RequestVoteResult, Term,
    TimeoutNowInput, TimeoutNowOutput,
};
use crate::transport::PeerTransport;
use crate::wire;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

/// GrpcPeerTransport talks to peers over the `GrpcRaft` service. One lazily connected channel is
/// kept per peer address; tonic reconnects it in the background when the peer comes back.
pub(crate) struct GrpcPeerTransport {
    logger: slog::Logger,
    clients: Mutex<HashMap<SocketAddr, GrpcRaftClient<Channel>>>,
}

impl GrpcPeerTransport {
    pub(crate) fn new(logger: slog::Logger) -> Self {
        GrpcPeerTransport {
            logger,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, target: &ReplicaMetadata) -> Result<GrpcRaftClient<Channel>, String> {
        let address = target.address();
        let mut clients = self.lock();
        if let Some(client) = clients.get(&address) {
            return Ok(client.clone());
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(|e| format!("Invalid peer address {:?}: {:?}", address, e))?;
        let channel = endpoint
            .connect_lazy()
            .map_err(|e| format!("Failed to create channel to {:?}: {:?}", address, e))?;
        slog::info!(self.logger, "Created channel to peer {:?} at {:?}", target.replica_id(), address);

        let client = GrpcRaftClient::new(channel);
        clients.insert(address, client.clone());
        Ok(client)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, GrpcRaftClient<Channel>>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn convert_request_vote_reply(rpc_reply: Result<ProtoRequestVoteResult, Status>) -> RequestVoteResult {
        match rpc_reply {
            Ok(rpc_result) => match rpc_result.result {
                Some(proto_request_vote_result::Result::Ok(ok)) => {
                    if ok.vote_granted {
                        RequestVoteResult::VoteGranted
                    } else {
                        RequestVoteResult::VoteNotGranted {
                            peer_term: Term::new(ok.term),
                        }
                    }
                }
                Some(proto_request_vote_result::Result::Err(err)) => match err.err {
                    Some(proto_request_vote_error::Err::ServerFault(fault)) => {
                        RequestVoteResult::RetryableFailure(format!("Explicit server fault: {:?}", fault.message))
                    }
                    None => RequestVoteResult::RetryableFailure("Malformed RequestVote Err".into()),
                },
                None => RequestVoteResult::RetryableFailure("Malformed RequestVote Result".into()),
            },
            Err(rpc_status) => RequestVoteResult::RetryableFailure(format!(
                "Un-modeled failure from RequestVote RPC call: {:?}",
                rpc_status
            )),
        }
    }

    fn convert_append_entries_reply(
        rpc_reply: Result<ProtoAppendEntriesResult, Status>,
    ) -> Result<AppendEntriesOutput, AppendEntriesReplyFromPeerError> {
        let rpc_result = rpc_reply.map_err(|rpc_status| {
            AppendEntriesReplyFromPeerError::RetryableFailure(format!(
                "Un-modeled failure from AppendEntries RPC call: {:?}",
                rpc_status
            ))
        })?;

        match rpc_result.result {
            Some(proto_append_entries_result::Result::Ok(ok)) => Ok(AppendEntriesOutput {
                term: Term::new(ok.term),
                match_index: Index::new(ok.match_index),
            }),
            Some(proto_append_entries_result::Result::Err(err)) => match err.err {
                Some(proto_append_entries_error::Err::ServerFault(fault)) => Err(
                    AppendEntriesReplyFromPeerError::RetryableFailure(format!("Explicit server fault: {:?}", fault.message)),
                ),
                Some(proto_append_entries_error::Err::StaleTerm(payload)) => {
                    Err(AppendEntriesReplyFromPeerError::StaleTerm {
                        new_term: Term::new(payload.current_term),
                    })
                }
                Some(proto_append_entries_error::Err::MissingLog(payload)) => {
                    Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                        last_log_index: Index::new(payload.last_log_index),
                    })
                }
                None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                    "Malformed AppendEntries Err".into(),
                )),
            },
            None => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Malformed AppendEntries Result".into(),
            )),
        }
    }

    fn convert_install_snapshot_reply(
        rpc_reply: Result<ProtoInstallSnapshotResult, Status>,
    ) -> Result<InstallSnapshotOutput, PeerCallError> {
        let rpc_result = rpc_reply.map_err(|rpc_status| {
            PeerCallError::RetryableFailure(format!(
                "Un-modeled failure from InstallSnapshot RPC call: {:?}",
                rpc_status
            ))
        })?;

        match rpc_result.result {
            Some(proto_install_snapshot_result::Result::Ok(ok)) => Ok(InstallSnapshotOutput {
                term: Term::new(ok.term),
            }),
            Some(proto_install_snapshot_result::Result::Err(err)) => match err.err {
                Some(proto_install_snapshot_error::Err::ServerFault(fault)) => Err(PeerCallError::RetryableFailure(
                    format!("Explicit server fault: {:?}", fault.message),
                )),
                Some(proto_install_snapshot_error::Err::StaleTerm(payload)) => Err(PeerCallError::StaleTerm {
                    new_term: Term::new(payload.current_term),
                }),
                None => Err(PeerCallError::RetryableFailure("Malformed InstallSnapshot Err".into())),
            },
            None => Err(PeerCallError::RetryableFailure("Malformed InstallSnapshot Result".into())),
        }
    }

    fn convert_timeout_now_reply(
        rpc_reply: Result<ProtoTimeoutNowResult, Status>,
    ) -> Result<TimeoutNowOutput, PeerCallError> {
        let rpc_result = rpc_reply.map_err(|rpc_status| {
            PeerCallError::RetryableFailure(format!("Un-modeled failure from TimeoutNow RPC call: {:?}", rpc_status))
        })?;

        match rpc_result.result {
            Some(proto_timeout_now_result::Result::Ok(ok)) => Ok(TimeoutNowOutput {
                term: Term::new(ok.term),
            }),
            Some(proto_timeout_now_result::Result::Err(err)) => match err.err {
                Some(proto_timeout_now_error::Err::ServerFault(fault)) => Err(PeerCallError::RetryableFailure(
                    format!("Explicit server fault: {:?}", fault.message),
                )),
                Some(proto_timeout_now_error::Err::StaleTerm(payload)) => Err(PeerCallError::StaleTerm {
                    new_term: Term::new(payload.current_term),
                }),
                Some(proto_timeout_now_error::Err::NotVoting(_)) => {
                    Err(PeerCallError::RetryableFailure("Peer is not a voting member".into()))
                }
                None => Err(PeerCallError::RetryableFailure("Malformed TimeoutNow Err".into())),
            },
            None => Err(PeerCallError::RetryableFailure("Malformed TimeoutNow Result".into())),
        }
    }
}

#[async_trait::async_trait]
impl PeerTransport for GrpcPeerTransport {
    async fn request_vote(&self, target: &ReplicaMetadata, input: RequestVoteInput) -> RequestVoteResult {
        let mut client = match self.client(target) {
            Ok(client) => client,
            Err(message) => return RequestVoteResult::RetryableFailure(message),
        };

        let rpc_request = ProtoRequestVoteReq {
            candidate_id: input.candidate_id.into_inner(),
            term: input.candidate_term.as_u64(),
            last_log_entry_index: input.candidate_last_log_entry.index.as_u64(),
            last_log_entry_term: input.candidate_last_log_entry.term.as_u64(),
        };
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = client.request_vote(rpc_request).await.map(|r| r.into_inner());
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_reply);

        Self::convert_request_vote_reply(rpc_reply)
    }

    async fn append_entries(
        &self,
        target: &ReplicaMetadata,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesReplyFromPeerError> {
        let mut client = self
            .client(target)
            .map_err(AppendEntriesReplyFromPeerError::RetryableFailure)?;

        let rpc_request = ProtoAppendEntriesReq {
            leader_id: input.leader_id.into_inner(),
            term: input.leader_term.as_u64(),
            previous_log_entry_index: input.previous_log_entry.index.as_u64(),
            previous_log_entry_term: input.previous_log_entry.term.as_u64(),
            commit_index: input.leader_commit_index.as_u64(),
            new_entries: input.new_entries.iter().map(wire::log_entry_to_proto).collect(),
        };
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = client.append_entries(rpc_request).await.map(|r| r.into_inner());
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_reply);

        Self::convert_append_entries_reply(rpc_reply)
    }

    async fn install_snapshot(
        &self,
        target: &ReplicaMetadata,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, PeerCallError> {
        let mut client = self.client(target).map_err(PeerCallError::RetryableFailure)?;

        let rpc_request = ProtoInstallSnapshotReq {
            leader_id: input.leader_id.into_inner(),
            term: input.leader_term.as_u64(),
            snapshot: Some(wire::snapshot_to_proto(&input.snapshot)),
        };
        slog::debug!(
            self.logger,
            "ClientWire - InstallSnapshot(term={}, last_included_index={})",
            rpc_request.term,
            input.snapshot.last_included_index.as_u64()
        );
        let rpc_reply = client.install_snapshot(rpc_request).await.map(|r| r.into_inner());
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_reply);

        Self::convert_install_snapshot_reply(rpc_reply)
    }

    async fn timeout_now(
        &self,
        target: &ReplicaMetadata,
        input: TimeoutNowInput,
    ) -> Result<TimeoutNowOutput, PeerCallError> {
        let mut client = self.client(target).map_err(PeerCallError::RetryableFailure)?;

        let rpc_request = ProtoTimeoutNowReq {
            leader_id: input.leader_id.into_inner(),
            term: input.leader_term.as_u64(),
        };
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = client.timeout_now(rpc_request).await.map(|r| r.into_inner());
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_reply);

        Self::convert_timeout_now_reply(rpc_reply)
    }
}
