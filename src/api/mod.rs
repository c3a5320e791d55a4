//! This mod is meant to hold most of the code for the library's client-facing API.
mod admin;
mod client;
mod event_bus;
mod options;
mod replicated_log;
mod state_machine;
mod types;
mod wiring;

pub use admin::AddServerError;
pub use admin::AddServerInput;
pub use admin::AddServerOutput;
pub use admin::GetOnDemandStateError;
pub use admin::GetSnapshotError;
pub use admin::RaftAdmin;
pub use admin::RaftOnDemandState;
pub use admin::RaftPeerState;
pub use admin::RaftRole;
pub use admin::RaftSnapshot;
pub use admin::RemoveServerError;
pub use admin::RemoveServerInput;
pub use admin::RemoveServerOutput;
pub use admin::TransferLeadershipError;
pub use admin::TransferLeadershipOutput;
pub use client::RaftClient;
pub use event_bus::RaftElectionState;
pub use event_bus::RaftEvent;
pub use event_bus::RaftEventListener;
pub use options::RaftOptions;
pub use replicated_log::ReplicatedLog;
pub use replicated_log::SubmitError;
pub use replicated_log::SubmitInput;
pub use replicated_log::SubmitOutput;
pub use state_machine::StateMachine;
pub use state_machine::StateMachineError;
pub use types::RaftLeaderInfo;
pub use types::RaftMemberInfo;
pub use types::RaftServerInfo;
pub use wiring::try_create_raft_client;
pub use wiring::JournalConfig;
pub use wiring::RaftClientConfig;
pub use wiring::RaftClientCreationError;
pub use wiring::TransportConfig;
