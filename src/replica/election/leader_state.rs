use crate::actor::WeakActorClient;
use crate::replica::election::timers::HeartbeatTimer;
use crate::replica::peers::ReplicaId;
use crate::replica::term_store::Term;
use std::collections::HashMap;
use std::time::Duration;

/// LeaderStateTracker holds what only exists while we are leader for one term: a heartbeat timer
/// and a request sequence per peer. Replication progress itself lives in the PeerTable.
pub(crate) struct LeaderStateTracker {
    term: Term,
    heartbeat_duration: Duration,
    actor_client: WeakActorClient,
    peer_state: HashMap<ReplicaId, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(
        term: Term,
        peer_ids: Vec<ReplicaId>,
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        let mut tracker = LeaderStateTracker {
            term,
            heartbeat_duration,
            actor_client,
            peer_state: HashMap::with_capacity(peer_ids.len()),
        };
        for peer_id in peer_ids {
            tracker.add_peer(peer_id);
        }

        tracker
    }

    pub(crate) fn term(&self) -> Term {
        self.term
    }

    /// Start replicating to `peer_id`. The new timer fires right away, so the peer hears from us
    /// without waiting a full heartbeat interval.
    pub(crate) fn add_peer(&mut self, peer_id: ReplicaId) {
        if self.peer_state.contains_key(&peer_id) {
            return;
        }

        let timer = HeartbeatTimer::spawn(
            self.heartbeat_duration,
            self.actor_client.clone(),
            peer_id.clone(),
            self.term,
        );
        self.peer_state.insert(peer_id, PeerState::new(timer));
    }

    /// Dropping the peer's state stops its timer.
    pub(crate) fn remove_peer(&mut self, peer_id: &ReplicaId) {
        self.peer_state.remove(peer_id);
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> Vec<ReplicaId> {
        self.peer_state.keys().cloned().collect()
    }
}

/// Requests to a peer carry increasing sequence numbers within a term. A reply is processed
/// only if it answers the newest request we've heard back about, and only one request is in
/// flight at a time. Entries are still batched, so a lagging peer catches up quickly.
pub(crate) struct PeerState {
    heartbeat_timer: HeartbeatTimer,
    sent: u64,
    acknowledged: u64,
}

impl PeerState {
    fn new(heartbeat_timer: HeartbeatTimer) -> Self {
        PeerState {
            heartbeat_timer,
            sent: 0,
            acknowledged: 0,
        }
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.acknowledged < self.sent
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.sent += 1;
        self.sent
    }

    /// False for replies that arrived late or answer something never sent.
    pub(crate) fn accept_reply_seq_no(&mut self, seq_no: u64) -> bool {
        if seq_no <= self.acknowledged || seq_no > self.sent {
            return false;
        }
        self.acknowledged = seq_no;
        true
    }

    pub(crate) fn postpone_heartbeat(&self) {
        self.heartbeat_timer.postpone();
    }
}
