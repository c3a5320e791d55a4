mod actor;
mod api;
mod journal;
mod replica;
mod server;
mod transport;
mod wire;
mod grpc {
    tonic::include_proto!("raft");
}

pub use api::try_create_raft_client;
pub use api::AddServerError;
pub use api::AddServerInput;
pub use api::AddServerOutput;
pub use api::GetOnDemandStateError;
pub use api::GetSnapshotError;
pub use api::JournalConfig;
pub use api::RaftAdmin;
pub use api::RaftClient;
pub use api::RaftClientConfig;
pub use api::RaftClientCreationError;
pub use api::RaftElectionState;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftLeaderInfo;
pub use api::RaftMemberInfo;
pub use api::RaftOnDemandState;
pub use api::RaftOptions;
pub use api::RaftPeerState;
pub use api::RaftRole;
pub use api::RaftServerInfo;
pub use api::RaftSnapshot;
pub use api::RemoveServerError;
pub use api::RemoveServerInput;
pub use api::RemoveServerOutput;
pub use api::ReplicatedLog;
pub use api::StateMachine;
pub use api::StateMachineError;
pub use api::SubmitError;
pub use api::SubmitInput;
pub use api::SubmitOutput;
pub use api::TransferLeadershipError;
pub use api::TransferLeadershipOutput;
pub use api::TransportConfig;
pub use journal::InMemoryJournal;
pub use transport::InMemoryNetwork;
