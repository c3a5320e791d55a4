use crate::actor::Callback;
use crate::replica::log_entry::Index;
use crate::replica::peers::{PeerTable, ReplicaId};
use crate::replica::replica_api::{TransferLeadershipError, TransferLeadershipOutput};

/// LeadershipTransfer is the leader's side of a graceful handoff that is in flight.
///
/// While it exists the leader rejects new client writes. The target is first brought fully up to
/// date, then told to start an election right away (TimeoutNow). The leader answers the caller
/// once the target accepted the TimeoutNow, and steps down.
pub(crate) struct LeadershipTransfer {
    transfer_id: u64,
    target: ReplicaId,
    timeout_now_sent: bool,
    callback: Callback<TransferLeadershipOutput, TransferLeadershipError>,
}

impl LeadershipTransfer {
    pub(crate) fn new(
        transfer_id: u64,
        target: ReplicaId,
        callback: Callback<TransferLeadershipOutput, TransferLeadershipError>,
    ) -> Self {
        LeadershipTransfer {
            transfer_id,
            target,
            timeout_now_sent: false,
            callback,
        }
    }

    /// The voting peer with the highest match index.
    pub(crate) fn pick_target(peers: &PeerTable) -> Option<ReplicaId> {
        peers
            .iter_peers()
            .filter(|p| p.voting_state().is_voting())
            .max_by(|a, b| {
                a.match_index()
                    .cmp(&b.match_index())
                    // Ties broken by id so the choice is deterministic.
                    .then_with(|| b.metadata().replica_id().cmp(a.metadata().replica_id()))
            })
            .map(|p| p.metadata().replica_id().clone())
    }

    pub(crate) fn transfer_id(&self) -> u64 {
        self.transfer_id
    }

    pub(crate) fn target(&self) -> &ReplicaId {
        &self.target
    }

    pub(crate) fn timeout_now_sent(&self) -> bool {
        self.timeout_now_sent
    }

    /// True when the target has caught up and hasn't been told to time out yet. Marks the
    /// TimeoutNow as sent.
    pub(crate) fn should_send_timeout_now(&mut self, target_match_index: Index, my_last_index: Index) -> bool {
        if self.timeout_now_sent || target_match_index < my_last_index {
            return false;
        }

        self.timeout_now_sent = true;
        true
    }

    /// Allow another TimeoutNow after a failed attempt.
    pub(crate) fn timeout_now_failed(&mut self) {
        self.timeout_now_sent = false;
    }

    pub(crate) fn succeed(self) {
        let target = self.target;
        self.callback.send(Ok(TransferLeadershipOutput { target }));
    }

    pub(crate) fn fail(self, error: TransferLeadershipError) {
        self.callback.send(Err(error));
    }
}
