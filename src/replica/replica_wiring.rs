use crate::actor::WeakActorClient;
use crate::api::StateMachine;
use crate::journal::{Journal, RecoveredState};
use crate::replica::applier;
use crate::replica::election::ElectionStateChangeListener;
use crate::replica::membership::ServerConfiguration;
use crate::replica::peers::ReplicaMetadata;
use crate::replica::replica::{Replica, ReplicaConfig, ReplicaOptions};
use crate::server::RpcServerShutdownHandle;
use crate::transport::PeerTransport;
use std::io;
use std::sync::Arc;

pub(crate) struct ReplicaWiring {
    pub(crate) logger: slog::Logger,
    pub(crate) my_metadata: ReplicaMetadata,
    pub(crate) bootstrap_configuration: ServerConfiguration,
    pub(crate) journal: Box<dyn Journal>,
    pub(crate) state_machine: Box<dyn StateMachine>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) server_shutdown_handle: Option<RpcServerShutdownHandle>,
    pub(crate) options: ReplicaOptions,
}

/// Replay the journal, bring the state machine back to the latest snapshot and hand it to its own
/// task, then build the replica on top. Nothing is served before this returns.
pub(crate) fn create_replica(wiring: ReplicaWiring) -> io::Result<(Replica, ElectionStateChangeListener)> {
    let ReplicaWiring {
        logger,
        my_metadata,
        bootstrap_configuration,
        mut journal,
        mut state_machine,
        transport,
        actor_client,
        server_shutdown_handle,
        options,
    } = wiring;

    let recovered = RecoveredState::replay(journal.load()?);
    if let Some(snapshot) = recovered.snapshot.as_ref() {
        slog::info!(logger, "Restoring state machine from snapshot at {:?}", snapshot.last_included_index);
        state_machine
            .apply_snapshot(snapshot.state.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }
    let state_machine = applier::spawn(logger.clone(), state_machine, actor_client.clone());

    Ok(Replica::new(ReplicaConfig {
        logger,
        my_metadata,
        bootstrap_configuration,
        journal,
        recovered,
        state_machine,
        transport,
        actor_client,
        server_shutdown_handle,
        options,
    }))
}
