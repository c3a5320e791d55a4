use crate::replica::log_entry::Index;
use crate::replica::membership::ServerConfiguration;
use std::cmp;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::time::{Duration, Instant};

/// ReplicaId...or maybe it should be NodeId or ServerId. Idk.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct ReplicaId(String);

impl ReplicaId {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ReplicaMetadata {
    replica_id: ReplicaId,
    address: SocketAddr,
}

impl ReplicaMetadata {
    pub(crate) fn new(replica_id: ReplicaId, address: SocketAddr) -> Self {
        ReplicaMetadata { replica_id, address }
    }

    pub(crate) fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum VotingState {
    Voting,
    NonVoting,
}

impl VotingState {
    pub(crate) fn from_bool(voting: bool) -> Self {
        if voting {
            VotingState::Voting
        } else {
            VotingState::NonVoting
        }
    }

    pub(crate) fn is_voting(&self) -> bool {
        matches!(self, VotingState::Voting)
    }
}

/// PeerInfo is everything the local replica knows about one remote member. `next_index` and
/// `match_index` are only meaningful while the local replica is leader.
#[derive(Clone, Debug)]
pub(crate) struct PeerInfo {
    metadata: ReplicaMetadata,
    voting_state: VotingState,
    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next_index: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    match_index: Index,
    last_activity: Option<Instant>,
}

impl PeerInfo {
    fn new(metadata: ReplicaMetadata, voting_state: VotingState) -> Self {
        PeerInfo {
            metadata,
            voting_state,
            next_index: Index::start_index(),
            match_index: Index::ZERO,
            last_activity: None,
        }
    }

    pub(crate) fn metadata(&self) -> &ReplicaMetadata {
        &self.metadata
    }

    pub(crate) fn voting_state(&self) -> VotingState {
        self.voting_state
    }

    pub(crate) fn next_index(&self) -> Index {
        self.next_index
    }

    pub(crate) fn match_index(&self) -> Index {
        self.match_index
    }

    pub(crate) fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    /// Peer confirmed its log matches ours up to and including `acknowledged`.
    pub(crate) fn record_match(&mut self, acknowledged: Index) {
        self.match_index = cmp::max(self.match_index, acknowledged);
        self.next_index = self.match_index.plus(1);
    }

    /// Peer rejected our previous-entry check. Walk `next_index` back, skipping straight to the
    /// peer's log tail when it told us where that is. Never rewinds below what it has matched.
    pub(crate) fn record_mismatch(&mut self, peer_last_log_index: Index) {
        let decremented = self.next_index.saturating_minus(1);
        let hinted = peer_last_log_index.plus(1);
        let floor = cmp::max(self.match_index.plus(1), Index::start_index());

        self.next_index = cmp::max(cmp::min(decremented, hinted), floor);
    }

    fn reset_progress(&mut self, next_index: Index) {
        self.next_index = next_index;
        self.match_index = Index::ZERO;
    }
}

/// Which remote members appeared or disappeared when a configuration was applied.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ConfigurationDelta {
    pub(crate) added: Vec<ReplicaId>,
    pub(crate) removed: Vec<ReplicaId>,
}

/// PeerTable tracks cluster membership as seen by this replica, voting eligibility for every
/// member, and per-peer replication progress while we are leader.
///
/// A committed ServerConfiguration is the only thing that changes membership. The single
/// exception is a leader adding a tentative non-voting peer so it can start replicating to a
/// joining server before the configuration that names it has committed.
pub(crate) struct PeerTable {
    me: ReplicaMetadata,
    i_am_voting: bool,
    peers: HashMap<ReplicaId, PeerInfo>,
    committed_configuration: ServerConfiguration,
}

impl PeerTable {
    pub(crate) fn new(me: ReplicaMetadata, configuration: ServerConfiguration) -> Self {
        let mut table = PeerTable {
            me,
            i_am_voting: false,
            peers: HashMap::new(),
            committed_configuration: ServerConfiguration::default(),
        };
        table.apply_configuration(&configuration);

        table
    }

    pub(crate) fn my_replica_id(&self) -> &ReplicaId {
        self.me.replica_id()
    }

    pub(crate) fn my_metadata(&self) -> &ReplicaMetadata {
        &self.me
    }

    pub(crate) fn i_am_voting(&self) -> bool {
        self.i_am_voting
    }

    pub(crate) fn committed_configuration(&self) -> &ServerConfiguration {
        &self.committed_configuration
    }

    /// Make `configuration` the authoritative peer set. Progress of peers that survive the change
    /// is retained.
    pub(crate) fn apply_configuration(&mut self, configuration: &ServerConfiguration) -> ConfigurationDelta {
        let mut delta = ConfigurationDelta::default();

        self.i_am_voting = configuration.is_voting(self.me.replica_id());

        for server in configuration.servers() {
            if server.replica_id() == self.me.replica_id() {
                continue;
            }
            let voting_state = VotingState::from_bool(server.is_voting());
            match self.peers.get_mut(server.replica_id()) {
                Some(existing) => {
                    existing.voting_state = voting_state;
                    existing.metadata = server.metadata();
                }
                None => {
                    self.peers
                        .insert(server.replica_id().clone(), PeerInfo::new(server.metadata(), voting_state));
                    delta.added.push(server.replica_id().clone());
                }
            }
        }

        let removed: Vec<ReplicaId> = self
            .peers
            .keys()
            .filter(|id| !configuration.contains(id))
            .cloned()
            .collect();
        for id in removed.iter() {
            self.peers.remove(id);
        }
        delta.removed = removed;

        self.committed_configuration = configuration.clone();

        delta
    }

    /// Leader only. Returns false if the replica is already a member.
    pub(crate) fn add_tentative_peer(&mut self, metadata: ReplicaMetadata, next_index: Index) -> bool {
        if self.contains_member(metadata.replica_id()) {
            return false;
        }

        let mut peer = PeerInfo::new(metadata, VotingState::NonVoting);
        peer.reset_progress(next_index);
        self.peers.insert(peer.metadata.replica_id().clone(), peer);

        true
    }

    /// Drop anything that isn't backed by the committed configuration.
    pub(crate) fn revert_to_committed(&mut self) -> ConfigurationDelta {
        let committed = self.committed_configuration.clone();
        self.apply_configuration(&committed)
    }

    pub(crate) fn contains_member(&self, replica_id: &ReplicaId) -> bool {
        replica_id == self.me.replica_id() || self.peers.contains_key(replica_id)
    }

    pub(crate) fn metadata(&self, replica_id: &ReplicaId) -> Option<ReplicaMetadata> {
        if replica_id == self.me.replica_id() {
            return Some(self.me.clone());
        }

        self.peers.get(replica_id).map(|p| p.metadata.clone())
    }

    pub(crate) fn peer(&self, replica_id: &ReplicaId) -> Option<&PeerInfo> {
        self.peers.get(replica_id)
    }

    pub(crate) fn peer_mut(&mut self, replica_id: &ReplicaId) -> Option<&mut PeerInfo> {
        self.peers.get_mut(replica_id)
    }

    pub(crate) fn iter_peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    pub(crate) fn peer_ids(&self) -> Vec<ReplicaId> {
        self.peers.keys().cloned().collect()
    }

    pub(crate) fn voting_peer_ids(&self) -> Vec<ReplicaId> {
        self.peers
            .values()
            .filter(|p| p.voting_state.is_voting())
            .map(|p| p.metadata.replica_id().clone())
            .collect()
    }

    pub(crate) fn is_voting_member(&self, replica_id: &ReplicaId) -> bool {
        if replica_id == self.me.replica_id() {
            return self.i_am_voting;
        }

        matches!(self.peers.get(replica_id), Some(p) if p.voting_state.is_voting())
    }

    pub(crate) fn has_followers(&self) -> bool {
        !self.peers.is_empty()
    }

    pub(crate) fn num_voting_members(&self) -> usize {
        let num_voting_peers = self.peers.values().filter(|p| p.voting_state.is_voting()).count();
        if self.i_am_voting {
            num_voting_peers + 1
        } else {
            num_voting_peers
        }
    }

    pub(crate) fn majority(&self) -> usize {
        (self.num_voting_members() / 2) + 1
    }

    /// Leader only. Called on election.
    pub(crate) fn reset_progress(&mut self, next_index: Index) {
        for peer in self.peers.values_mut() {
            peer.reset_progress(next_index);
        }
    }

    pub(crate) fn record_activity(&mut self, replica_id: &ReplicaId, now: Instant) {
        if let Some(peer) = self.peers.get_mut(replica_id) {
            peer.last_activity.replace(now);
        }
    }

    /// True if a majority of voting members (ourselves included) were heard from within `window`.
    pub(crate) fn has_quorum_contact(&self, now: Instant, window: Duration) -> bool {
        let recently_active = self
            .peers
            .values()
            .filter(|p| p.voting_state.is_voting())
            .filter(|p| matches!(p.last_activity, Some(t) if now.saturating_duration_since(t) <= window))
            .count();
        let me = if self.i_am_voting { 1 } else { 0 };

        recently_active + me >= self.majority()
    }

    /// Highest index replicated on a majority of voting members. `my_durable_index` is how far
    /// our own log is flushed; it only counts if we are voting.
    pub(crate) fn quorum_match_index(&self, my_durable_index: Index) -> Index {
        let mut matched: Vec<Index> = self
            .peers
            .values()
            .filter(|p| p.voting_state.is_voting())
            .map(|p| p.match_index)
            .collect();
        if self.i_am_voting {
            matched.push(my_durable_index);
        }

        Self::quorum_index(matched)
    }

    fn quorum_index(mut matched: Vec<Index>) -> Index {
        if matched.is_empty() {
            return Index::ZERO;
        }
        matched.sort();

        // The value at position `len - majority` (ascending) is held by at least `majority`
        // members: itself and everything to its right.
        let majority = (matched.len() / 2) + 1;
        matched[matched.len() - majority]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::membership::ServerInfo;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn server(id: &str, port: u16, voting: bool) -> ServerInfo {
        ServerInfo::new(ReplicaMetadata::new(ReplicaId::new(id), addr(port)), voting)
    }

    fn table(servers: Vec<ServerInfo>) -> PeerTable {
        PeerTable::new(
            ReplicaMetadata::new(ReplicaId::new("me"), addr(1)),
            ServerConfiguration::new(servers),
        )
    }

    #[test]
    fn test_commit_checker_logic() {
        fn run(expected: u64, peers_matched: Vec<u64>) {
            // Leader's own log is always the longest, so it sits at the tail.
            let mut matched: Vec<Index> = peers_matched.into_iter().map(Index::new).collect();
            matched.push(Index::new(u64::MAX));

            assert_eq!(Index::new(expected), PeerTable::quorum_index(matched));
        }

        // 3-cluster
        run(0, vec![0, 0]);
        run(9, vec![0, 9]);
        run(9, vec![8, 9]);

        // 4-cluster
        run(0, vec![0, 0, 0]);
        run(0, vec![0, 0, 9]);
        run(8, vec![0, 8, 9]);
        run(8, vec![7, 8, 9]);

        // 5-cluster
        run(0, vec![0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 9]);
        run(8, vec![0, 0, 8, 9]);
        run(8, vec![0, 7, 8, 9]);
        run(8, vec![6, 7, 8, 9]);

        // 6-cluster
        run(0, vec![0, 0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 8, 9]);
        run(7, vec![0, 0, 7, 8, 9]);
        run(7, vec![0, 6, 7, 8, 9]);
        run(7, vec![5, 6, 7, 8, 9]);

        // 7-cluster
        run(0, vec![0, 0, 0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 0, 0, 9]);
        run(0, vec![0, 0, 0, 0, 8, 9]);
        run(7, vec![0, 0, 0, 7, 8, 9]);
        run(7, vec![0, 0, 6, 7, 8, 9]);
        run(7, vec![0, 5, 6, 7, 8, 9]);
        run(7, vec![4, 5, 6, 7, 8, 9]);

        // Ordering doesn't matter
        run(9, vec![9, 8]);
        run(8, vec![7, 9, 8]);
        run(8, vec![6, 0, 8, 9]);
        run(7, vec![9, 8, 0, 0, 7]);
    }

    #[test]
    fn non_voting_peers_are_excluded_from_quorum() {
        let mut peers = table(vec![
            server("me", 1, true),
            server("a", 2, true),
            server("b", 3, true),
            server("learner", 4, false),
        ]);
        assert_eq!(peers.num_voting_members(), 3);
        assert_eq!(peers.majority(), 2);

        // Only the learner has caught up. That is not a majority.
        peers.peer_mut(&ReplicaId::new("learner")).unwrap().record_match(Index::new(10));
        assert_eq!(peers.quorum_match_index(Index::new(10)), Index::ZERO);

        peers.peer_mut(&ReplicaId::new("a")).unwrap().record_match(Index::new(7));
        assert_eq!(peers.quorum_match_index(Index::new(10)), Index::new(7));
    }

    #[test]
    fn apply_configuration_adds_promotes_and_removes() {
        let mut peers = table(vec![server("me", 1, true), server("a", 2, true), server("b", 3, true)]);
        peers.peer_mut(&ReplicaId::new("a")).unwrap().record_match(Index::new(4));

        let delta = peers.apply_configuration(&ServerConfiguration::new(vec![
            server("me", 1, true),
            server("a", 2, true),
            server("c", 4, false),
        ]));

        assert_eq!(delta.added, vec![ReplicaId::new("c")]);
        assert_eq!(delta.removed, vec![ReplicaId::new("b")]);
        assert!(!peers.contains_member(&ReplicaId::new("b")));
        assert!(!peers.is_voting_member(&ReplicaId::new("c")));
        // Surviving peers keep their progress.
        assert_eq!(peers.peer(&ReplicaId::new("a")).unwrap().match_index(), Index::new(4));

        let delta = peers.apply_configuration(&ServerConfiguration::new(vec![
            server("me", 1, true),
            server("a", 2, true),
            server("c", 4, true),
        ]));
        assert_eq!(delta, ConfigurationDelta::default());
        assert!(peers.is_voting_member(&ReplicaId::new("c")));
        assert_eq!(peers.majority(), 2);
    }

    #[test]
    fn replica_missing_from_configuration_is_not_voting() {
        let peers = table(vec![server("a", 2, true), server("b", 3, true)]);

        assert!(!peers.i_am_voting());
        assert_eq!(peers.num_voting_members(), 2);
        assert_eq!(peers.quorum_match_index(Index::new(100)), Index::ZERO);
    }

    #[test]
    fn tentative_peer_is_dropped_on_revert() {
        let mut peers = table(vec![server("me", 1, true), server("a", 2, true)]);

        assert!(peers.add_tentative_peer(
            ReplicaMetadata::new(ReplicaId::new("new"), addr(9)),
            Index::new(5)
        ));
        assert!(!peers.add_tentative_peer(
            ReplicaMetadata::new(ReplicaId::new("a"), addr(2)),
            Index::new(5)
        ));
        assert_eq!(peers.peer(&ReplicaId::new("new")).unwrap().next_index(), Index::new(5));
        assert_eq!(peers.num_voting_members(), 2);

        let delta = peers.revert_to_committed();
        assert_eq!(delta.removed, vec![ReplicaId::new("new")]);
        assert!(!peers.contains_member(&ReplicaId::new("new")));
    }

    #[test]
    fn mismatch_rewinds_next_index_using_hint() {
        let mut peers = table(vec![server("me", 1, true), server("a", 2, true)]);
        peers.reset_progress(Index::new(11));
        let peer = peers.peer_mut(&ReplicaId::new("a")).unwrap();

        // No hint beyond our own guess: plain decrement.
        peer.record_mismatch(Index::new(50));
        assert_eq!(peer.next_index(), Index::new(10));

        // Peer's log ends at 3, skip straight there.
        peer.record_mismatch(Index::new(3));
        assert_eq!(peer.next_index(), Index::new(4));

        peer.record_match(Index::new(3));
        peer.record_mismatch(Index::ZERO);
        assert_eq!(peer.next_index(), Index::new(4));
    }

    #[test]
    fn quorum_contact() {
        let mut peers = table(vec![server("me", 1, true), server("a", 2, true), server("b", 3, true)]);
        let now = Instant::now();
        let window = Duration::from_millis(100);

        assert!(!peers.has_quorum_contact(now, window));

        peers.record_activity(&ReplicaId::new("a"), now);
        assert!(peers.has_quorum_contact(now + window / 2, window));
        assert!(!peers.has_quorum_contact(now + window * 2, window));
    }
}
