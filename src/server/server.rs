use crate::actor::WeakActorClient;
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, proto_timeout_now_error,
    proto_timeout_now_result, ProtoAppendEntriesError, ProtoAppendEntriesReq, ProtoAppendEntriesResult,
    ProtoAppendEntriesSuccess, ProtoClientStaleTerm, ProtoInstallSnapshotError, ProtoInstallSnapshotReq,
    ProtoInstallSnapshotResult, ProtoInstallSnapshotSuccess, ProtoNotVoting, ProtoRequestVoteError,
    ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoRequestVoteSuccess, ProtoServerFault,
    ProtoServerMissingPreviousLog, ProtoTimeoutNowError, ProtoTimeoutNowReq, ProtoTimeoutNowResult,
    ProtoTimeoutNowSuccess,
};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, Index, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, ReplicaId, RequestVoteError, RequestVoteInput, RequestVoteOutput, Term, TimeoutNowError,
    TimeoutNowInput, TimeoutNowOutput,
};
use crate::server::RpcServerShutdownSignal;
use crate::wire::{self, WireError};
use std::net::SocketAddr;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

const ACTOR_EXITED_MESSAGE: &str = "Server internal replica task has exited";

/// RpcServer is the type that implements the Raft gRPC interface.
pub(crate) struct RpcServer {
    logger: slog::Logger,
    local_replica: WeakActorClient,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, local_replica: WeakActorClient) -> Self {
        RpcServer { logger, local_replica }
    }

    pub(crate) async fn run(self, socket_addr: SocketAddr, shutdown_signal: RpcServerShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal.dropped())
            .await;

        slog::info!(logger, "Server run() has exited: {:?}", result);
    }

    fn invalid_argument(err: WireError) -> Status {
        Status::invalid_argument(err.to_string())
    }

    fn server_fault(message: impl Into<String>) -> ProtoServerFault {
        ProtoServerFault {
            message: message.into(),
        }
    }

    // ------- RequestVote -------

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let app_input = Self::convert_request_vote_input(rpc_request)?;
        let app_result = self.local_replica.request_vote(app_input).await;
        Ok(Self::convert_request_vote_result(app_result))
    }

    fn convert_request_vote_input(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, Status> {
        if rpc_request.candidate_id.is_empty() {
            return Err(Self::invalid_argument(WireError::MissingField("candidate_id")));
        }
        let candidate_last_log_entry =
            wire::log_position(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)
                .map_err(Self::invalid_argument)?;

        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: ReplicaId::new(rpc_request.candidate_id),
            candidate_last_log_entry,
        })
    }

    fn convert_request_vote_result(app_result: Result<RequestVoteOutput, RequestVoteError>) -> ProtoRequestVoteResult {
        let fault = match app_result {
            Ok(ok) => {
                return ProtoRequestVoteResult {
                    result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                        vote_granted: ok.vote_granted,
                        term: ok.term.as_u64(),
                    })),
                }
            }
            Err(RequestVoteError::PersistenceFailure(e)) => Self::server_fault(format!("Local IO failure: {:?}", e)),
            Err(RequestVoteError::ActorExited) => Self::server_fault(ACTOR_EXITED_MESSAGE),
        };

        ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError {
                err: Some(proto_request_vote_error::Err::ServerFault(fault)),
            })),
        }
    }

    // ------- AppendEntries -------

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let app_input = Self::convert_append_entries_input(rpc_request)?;
        let app_result = self.local_replica.append_entries(app_input).await;
        Ok(Self::convert_append_entries_result(app_result))
    }

    fn convert_append_entries_input(rpc_request: ProtoAppendEntriesReq) -> Result<AppendEntriesInput, Status> {
        if rpc_request.leader_id.is_empty() {
            return Err(Self::invalid_argument(WireError::MissingField("leader_id")));
        }
        let previous_log_entry =
            wire::log_position(rpc_request.previous_log_entry_term, rpc_request.previous_log_entry_index)
                .map_err(Self::invalid_argument)?;
        let new_entries = wire::log_entries_from_proto(rpc_request.new_entries).map_err(Self::invalid_argument)?;

        // New entries have to continue right after the previous entry, one index at a time.
        let mut previous = previous_log_entry.index;
        for entry in new_entries.iter() {
            if entry.index != previous.plus(1) {
                return Err(Status::invalid_argument(format!(
                    "Entry index {:?} doesn't follow {:?}",
                    entry.index, previous
                )));
            }
            previous = entry.index;
        }

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.leader_id),
            previous_log_entry,
            leader_commit_index: Index::new(rpc_request.commit_index),
            new_entries,
        })
    }

    fn convert_append_entries_result(
        app_result: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> ProtoAppendEntriesResult {
        let err = match app_result {
            Ok(ok) => {
                return ProtoAppendEntriesResult {
                    result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
                        term: ok.term.as_u64(),
                        match_index: ok.match_index.as_u64(),
                    })),
                }
            }
            Err(AppendEntriesError::ClientTermOutOfDate(term_info)) => {
                proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_index: last_log_index.as_u64(),
                })
            }
            Err(AppendEntriesError::ServerIoError(e)) => {
                proto_append_entries_error::Err::ServerFault(Self::server_fault(format!("Local IO failure: {:?}", e)))
            }
            Err(AppendEntriesError::ActorExited) => {
                proto_append_entries_error::Err::ServerFault(Self::server_fault(ACTOR_EXITED_MESSAGE))
            }
        };

        ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(err),
            })),
        }
    }

    // ------- InstallSnapshot -------

    async fn handle_install_snapshot(
        &self,
        rpc_request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let app_input = Self::convert_install_snapshot_input(rpc_request)?;
        let app_result = self.local_replica.install_snapshot(app_input).await;
        Ok(Self::convert_install_snapshot_result(app_result))
    }

    fn convert_install_snapshot_input(rpc_request: ProtoInstallSnapshotReq) -> Result<InstallSnapshotInput, Status> {
        if rpc_request.leader_id.is_empty() {
            return Err(Self::invalid_argument(WireError::MissingField("leader_id")));
        }
        let snapshot = match rpc_request.snapshot {
            Some(snapshot) => wire::snapshot_from_proto(snapshot).map_err(Self::invalid_argument)?,
            None => return Err(Self::invalid_argument(WireError::MissingField("snapshot"))),
        };
        if snapshot.last_included_index == Index::ZERO {
            return Err(Status::invalid_argument("Snapshot must cover at least one entry"));
        }

        Ok(InstallSnapshotInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.leader_id),
            snapshot,
        })
    }

    fn convert_install_snapshot_result(
        app_result: Result<InstallSnapshotOutput, InstallSnapshotError>,
    ) -> ProtoInstallSnapshotResult {
        let err = match app_result {
            Ok(ok) => {
                return ProtoInstallSnapshotResult {
                    result: Some(proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {
                        term: ok.term.as_u64(),
                    })),
                }
            }
            Err(InstallSnapshotError::ClientTermOutOfDate(term_info)) => {
                proto_install_snapshot_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(InstallSnapshotError::InstallFailed(message)) => {
                proto_install_snapshot_error::Err::ServerFault(Self::server_fault(message))
            }
            Err(InstallSnapshotError::ActorExited) => {
                proto_install_snapshot_error::Err::ServerFault(Self::server_fault(ACTOR_EXITED_MESSAGE))
            }
        };

        ProtoInstallSnapshotResult {
            result: Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
                err: Some(err),
            })),
        }
    }

    // ------- TimeoutNow -------

    async fn handle_timeout_now(&self, rpc_request: ProtoTimeoutNowReq) -> Result<ProtoTimeoutNowResult, Status> {
        if rpc_request.leader_id.is_empty() {
            return Err(Self::invalid_argument(WireError::MissingField("leader_id")));
        }
        let app_input = TimeoutNowInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.leader_id),
        };
        let app_result = self.local_replica.timeout_now(app_input).await;
        Ok(Self::convert_timeout_now_result(app_result))
    }

    fn convert_timeout_now_result(app_result: Result<TimeoutNowOutput, TimeoutNowError>) -> ProtoTimeoutNowResult {
        let err = match app_result {
            Ok(ok) => {
                return ProtoTimeoutNowResult {
                    result: Some(proto_timeout_now_result::Result::Ok(ProtoTimeoutNowSuccess {
                        term: ok.term.as_u64(),
                    })),
                }
            }
            Err(TimeoutNowError::ClientTermOutOfDate(term_info)) => {
                proto_timeout_now_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(TimeoutNowError::NotVoting) => proto_timeout_now_error::Err::NotVoting(ProtoNotVoting {}),
            Err(TimeoutNowError::PersistenceFailure(e)) => {
                proto_timeout_now_error::Err::ServerFault(Self::server_fault(format!("Local IO failure: {:?}", e)))
            }
            Err(TimeoutNowError::ActorExited) => {
                proto_timeout_now_error::Err::ServerFault(Self::server_fault(ACTOR_EXITED_MESSAGE))
            }
        };

        ProtoTimeoutNowResult {
            result: Some(proto_timeout_now_result::Result::Err(ProtoTimeoutNowError { err: Some(err) })),
        }
    }
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<ProtoInstallSnapshotReq>,
    ) -> Result<Response<ProtoInstallSnapshotResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        // Snapshots can be big, so only the header is logged.
        slog::debug!(
            self.logger,
            "ServerWire - InstallSnapshot(leader_id={}, term={})",
            rpc_request.leader_id,
            rpc_request.term
        );
        let rpc_result = self.handle_install_snapshot(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn timeout_now(
        &self,
        rpc_request_wrapped: Request<ProtoTimeoutNowReq>,
    ) -> Result<Response<ProtoTimeoutNowResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_timeout_now(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}
