use crate::actor::{ActorClient, ReplicaActor};
use crate::api::admin::RaftAdmin;
use crate::api::client::RaftClient;
use crate::api::event_bus::RaftEventListener;
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::replicated_log::ReplicatedLog;
use crate::api::state_machine::StateMachine;
use crate::api::types::RaftMemberInfo;
use crate::journal::{FileJournal, InMemoryJournal, Journal};
use crate::replica::{self, ReplicaId, ReplicaMetadata, ReplicaWiring, ServerConfiguration, ServerInfo};
use crate::server::{self, RpcServer};
use crate::transport::{GrpcPeerTransport, InMemoryNetwork, PeerTransport};
use std::collections::HashSet;
use std::convert::TryFrom;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

const ACTOR_QUEUE_SIZE: usize = 100;

/// Where the replica keeps its term, vote, log and snapshots.
pub enum JournalConfig {
    /// Lost with the process. Pass a clone of the same journal to a new client to simulate a
    /// restart.
    InMemory(InMemoryJournal),
    /// A directory where we can create files to support the journal. One file per replica id.
    File { directory: PathBuf },
}

/// How the replica talks to its peers.
pub enum TransportConfig {
    /// Serve and call the `GrpcRaft` service. The RPC server listens on `my_address`.
    Grpc,
    /// In-process, for replicas living in the same binary.
    InMemory(InMemoryNetwork),
}

pub struct RaftClientConfig {
    pub my_replica_id: String,
    pub my_address: SocketAddr,
    /// The initial cluster, all voting. A replica that isn't listed starts out as a non-voting
    /// member waiting for a leader to add it with `RaftAdmin::add_server()`.
    pub cluster_members: Vec<RaftMemberInfo>,
    pub journal: JournalConfig,
    pub transport: TransportConfig,
    pub state_machine: Box<dyn StateMachine>,
    pub info_logger: slog::Logger,
    pub options: RaftOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum RaftClientCreationError {
    #[error("Invalid cluster info: {0}")]
    InvalidClusterInfo(String),
    #[error("Illegal options for configuring client: {0}")]
    IllegalClientOptions(String),
    #[error("Log initialization failure")]
    LogInitialization(io::Error),
}

/// Start a raft replica in the background and return the handle to it. Must be called from within
/// a tokio runtime.
pub async fn try_create_raft_client(config: RaftClientConfig) -> Result<RaftClient, RaftClientCreationError> {
    let root_logger = config
        .info_logger
        .new(slog::o!("ReplicaId" => config.my_replica_id.clone()));

    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| RaftClientCreationError::IllegalClientOptions(e.to_string()))?;

    let my_metadata = ReplicaMetadata::new(ReplicaId::new(config.my_replica_id.clone()), config.my_address);
    let bootstrap_configuration = bootstrap_configuration(&my_metadata, config.cluster_members)?;

    let journal: Box<dyn Journal> = match config.journal {
        JournalConfig::InMemory(journal) => Box::new(journal),
        JournalConfig::File { directory } => Box::new(
            FileJournal::open(root_logger.clone(), &directory, &config.my_replica_id)
                .map_err(RaftClientCreationError::LogInitialization)?,
        ),
    };

    let (actor_client, actor_queue_rx) = ActorClient::new(ACTOR_QUEUE_SIZE);

    let mut rpc_server = None;
    let mut server_shutdown_handle = None;
    let transport: Arc<dyn PeerTransport> = match config.transport {
        TransportConfig::Grpc => {
            let (shutdown_handle, shutdown_signal) = server::shutdown_signal();
            server_shutdown_handle = Some(shutdown_handle);
            rpc_server = Some((RpcServer::new(root_logger.clone(), actor_client.weak()), shutdown_signal));
            Arc::new(GrpcPeerTransport::new(root_logger.clone()))
        }
        TransportConfig::InMemory(network) => {
            network.register(my_metadata.replica_id().clone(), actor_client.weak());
            Arc::new(network.transport_for(my_metadata.replica_id().clone()))
        }
    };

    let (replica, election_state_change_listener) = replica::create_replica(ReplicaWiring {
        logger: root_logger.clone(),
        my_metadata,
        bootstrap_configuration,
        journal,
        state_machine: config.state_machine,
        transport,
        actor_client: actor_client.weak(),
        server_shutdown_handle,
        options: options.into(),
    })
    .map_err(RaftClientCreationError::LogInitialization)?;

    let replica_actor = ReplicaActor::new(root_logger.clone(), actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    // The journal has been replayed by now, so it's safe to accept RPCs.
    if let Some((rpc_server, server_shutdown_signal)) = rpc_server {
        tokio::spawn(rpc_server.run(config.my_address, server_shutdown_signal));
    }

    Ok(RaftClient {
        replicated_log: ReplicatedLog::new(actor_client.clone()),
        admin: RaftAdmin::new(actor_client),
        event_listener: RaftEventListener::new(election_state_change_listener),
    })
}

fn bootstrap_configuration(
    me: &ReplicaMetadata,
    cluster_members: Vec<RaftMemberInfo>,
) -> Result<ServerConfiguration, RaftClientCreationError> {
    if cluster_members.is_empty() {
        return Err(RaftClientCreationError::InvalidClusterInfo(
            "Cluster must have at least one member".into(),
        ));
    }

    let mut seen_ids = HashSet::new();
    let mut seen_addresses = HashSet::new();
    let mut servers = Vec::with_capacity(cluster_members.len());
    for member_info in cluster_members {
        if member_info.replica_id.is_empty() {
            return Err(RaftClientCreationError::InvalidClusterInfo("Empty replica id".into()));
        }
        if !seen_ids.insert(member_info.replica_id.clone()) {
            return Err(RaftClientCreationError::InvalidClusterInfo(format!(
                "Duplicate replica id '{}'",
                member_info.replica_id
            )));
        }
        if !seen_addresses.insert(member_info.address) {
            return Err(RaftClientCreationError::InvalidClusterInfo(format!(
                "Duplicate address {:?}",
                member_info.address
            )));
        }
        if member_info.replica_id == me.replica_id().as_str() && member_info.address != me.address() {
            return Err(RaftClientCreationError::InvalidClusterInfo(format!(
                "My address is {:?} but cluster info says {:?}",
                me.address(),
                member_info.address
            )));
        }

        servers.push(ServerInfo::new(ReplicaMetadata::from(member_info), true));
    }

    Ok(ServerConfiguration::new(servers))
}
