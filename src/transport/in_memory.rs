use crate::actor::WeakActorClient;
use crate::replica::{
    AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeerError, InstallSnapshotInput,
    InstallSnapshotOutput, PeerCallError, ReplicaId, ReplicaMetadata, RequestVoteInput, RequestVoteResult,
    TimeoutNowInput, TimeoutNowOutput,
};
use crate::transport::{append_entries_reply, install_snapshot_reply, request_vote_reply, timeout_now_reply, PeerTransport};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    replicas: HashMap<ReplicaId, WeakActorClient>,
    isolated: HashSet<ReplicaId>,
    cut_links: HashSet<(ReplicaId, ReplicaId)>,
}

/// InMemoryNetwork connects replicas running in the same process without sockets. Calls are
/// routed by replica id straight into the target's event loop.
///
/// Partitions are simulated by isolating a replica or cutting the link between two replicas.
/// Requests over a broken link fail the same way an unreachable gRPC peer does.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        InMemoryNetwork::default()
    }

    /// Cut `replica_id` off from every other replica.
    pub fn isolate(&self, replica_id: &str) {
        self.lock().isolated.insert(ReplicaId::new(replica_id));
    }

    /// Undo `isolate()`.
    pub fn rejoin(&self, replica_id: &str) {
        self.lock().isolated.remove(&ReplicaId::new(replica_id));
    }

    /// Cut the link between two replicas, in both directions.
    pub fn disconnect(&self, a: &str, b: &str) {
        self.lock().cut_links.insert(Self::link(&ReplicaId::new(a), &ReplicaId::new(b)));
    }

    /// Restore every isolated replica and cut link.
    pub fn heal(&self) {
        let mut inner = self.lock();
        inner.isolated.clear();
        inner.cut_links.clear();
    }

    /// A restarted replica registers again and replaces its previous incarnation.
    pub(crate) fn register(&self, replica_id: ReplicaId, replica: WeakActorClient) {
        self.lock().replicas.insert(replica_id, replica);
    }

    pub(crate) fn transport_for(&self, my_replica_id: ReplicaId) -> InMemoryPeerTransport {
        InMemoryPeerTransport {
            network: self.clone(),
            my_replica_id,
        }
    }

    fn route(&self, from: &ReplicaId, to: &ReplicaId) -> Result<WeakActorClient, String> {
        let inner = self.lock();
        if inner.isolated.contains(from) || inner.isolated.contains(to) {
            return Err(format!("{:?} is unreachable from {:?}", to, from));
        }
        if inner.cut_links.contains(&Self::link(from, to)) {
            return Err(format!("Link {:?} <-> {:?} is down", from, to));
        }

        inner
            .replicas
            .get(to)
            .cloned()
            .ok_or_else(|| format!("{:?} is not on the network", to))
    }

    fn link(a: &ReplicaId, b: &ReplicaId) -> (ReplicaId, ReplicaId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Inner is only ever mutated by single insert/remove calls, so a poisoned guard is whole.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) struct InMemoryPeerTransport {
    network: InMemoryNetwork,
    my_replica_id: ReplicaId,
}

#[async_trait::async_trait]
impl PeerTransport for InMemoryPeerTransport {
    async fn request_vote(&self, target: &ReplicaMetadata, input: RequestVoteInput) -> RequestVoteResult {
        match self.network.route(&self.my_replica_id, target.replica_id()) {
            Ok(peer) => request_vote_reply(peer.request_vote(input).await),
            Err(message) => RequestVoteResult::RetryableFailure(message),
        }
    }

    async fn append_entries(
        &self,
        target: &ReplicaMetadata,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesReplyFromPeerError> {
        let peer = self
            .network
            .route(&self.my_replica_id, target.replica_id())
            .map_err(AppendEntriesReplyFromPeerError::RetryableFailure)?;

        append_entries_reply(peer.append_entries(input).await)
    }

    async fn install_snapshot(
        &self,
        target: &ReplicaMetadata,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, PeerCallError> {
        let peer = self
            .network
            .route(&self.my_replica_id, target.replica_id())
            .map_err(PeerCallError::RetryableFailure)?;

        install_snapshot_reply(peer.install_snapshot(input).await)
    }

    async fn timeout_now(
        &self,
        target: &ReplicaMetadata,
        input: TimeoutNowInput,
    ) -> Result<TimeoutNowOutput, PeerCallError> {
        let peer = self
            .network
            .route(&self.my_replica_id, target.replica_id())
            .map_err(PeerCallError::RetryableFailure)?;

        timeout_now_reply(peer.timeout_now(input).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::replica::{LogPosition, RequestVoteOutput, Term};
    use std::net::SocketAddr;

    fn metadata(id: &str) -> ReplicaMetadata {
        ReplicaMetadata::new(ReplicaId::new(id), SocketAddr::from(([127, 0, 0, 1], 1)))
    }

    fn vote_request() -> RequestVoteInput {
        RequestVoteInput {
            candidate_term: Term::new(2),
            candidate_id: ReplicaId::new("a"),
            candidate_last_log_entry: LogPosition::default(),
        }
    }

    #[tokio::test]
    async fn routes_calls_until_partitioned() {
        let network = InMemoryNetwork::new();
        let (b_client, mut b_events) = ActorClient::new(10);
        network.register(ReplicaId::new("b"), b_client.weak());

        // Grant every vote b is asked for.
        tokio::spawn(async move {
            while let Some(event) = b_events.recv().await {
                if let Event::RequestVote(input, callback) = event {
                    callback.send(Ok(RequestVoteOutput {
                        vote_granted: true,
                        term: input.candidate_term,
                    }));
                }
            }
        });

        let transport = network.transport_for(ReplicaId::new("a"));
        assert!(matches!(
            transport.request_vote(&metadata("b"), vote_request()).await,
            RequestVoteResult::VoteGranted
        ));

        network.disconnect("b", "a");
        assert!(matches!(
            transport.request_vote(&metadata("b"), vote_request()).await,
            RequestVoteResult::RetryableFailure(_)
        ));

        network.heal();
        network.isolate("a");
        assert!(matches!(
            transport.request_vote(&metadata("b"), vote_request()).await,
            RequestVoteResult::RetryableFailure(_)
        ));

        network.rejoin("a");
        assert!(matches!(
            transport.request_vote(&metadata("b"), vote_request()).await,
            RequestVoteResult::VoteGranted
        ));

        // Unknown replicas and replicas that have shut down are unreachable too.
        assert!(matches!(
            transport.request_vote(&metadata("c"), vote_request()).await,
            RequestVoteResult::RetryableFailure(_)
        ));
        drop(b_client);
        assert!(matches!(
            transport.request_vote(&metadata("b"), vote_request()).await,
            RequestVoteResult::RetryableFailure(_)
        ));
    }
}
