mod applier;
mod client_requests;
mod election;
mod entry_store;
mod leadership_transfer;
mod log_entry;
mod membership;
mod peers;
mod replica;
mod replica_api;
mod replica_wiring;
mod replicated_log;
mod snapshot;
mod term_store;

pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use log_entry::EntryPayload;
pub(crate) use log_entry::Index;
pub(crate) use log_entry::LogEntry;
pub(crate) use membership::ServerConfiguration;
pub(crate) use membership::ServerInfo;
pub(crate) use peers::ReplicaId;
pub(crate) use peers::ReplicaMetadata;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaOptions;
pub(crate) use replica_api::*;
pub(crate) use replica_wiring::create_replica;
pub(crate) use replica_wiring::ReplicaWiring;
pub(crate) use replicated_log::SnapshotPolicy;
pub(crate) use snapshot::Snapshot;
pub(crate) use term_store::Term;
pub(crate) use term_store::TermInfo;
