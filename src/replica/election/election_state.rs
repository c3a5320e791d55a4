use crate::actor::WeakActorClient;
use crate::replica::election::state_change_listener::ElectionStateChangeNotifier;
use crate::replica::election::timers::ElectionTimer;
use crate::replica::election::{state_change_listener, ElectionStateChangeListener, ElectionStateSnapshot, LeaderStateTracker};
use crate::replica::peers::ReplicaId;
use crate::replica::replica_api::{ElectionTimeout, LeaderRedirectInfo, Role};
use crate::replica::term_store::Term;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
}

/// ElectionState tracks which role this replica plays and the timers owned by that role. The
/// replica decides when to transition; term and log checks happen there too.
///
/// Every transition drops the previous role's timers. Election timers are also stamped with a
/// generation, so a timeout that was already queued when the timer was dropped is recognized as
/// stale.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
    last_timer_generation: u64,
}

impl ElectionState {
    /// Every replica boots as a follower that doesn't know the leader.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
    ) -> (Self, ElectionStateChangeListener) {
        let (notifier, listener) = state_change_listener::new(ElectionStateSnapshot::FollowerNoLeader);
        let initial_timer = ElectionTimer::spawn(
            config.follower_min_timeout,
            config.follower_max_timeout,
            actor_client.clone(),
            1,
        );

        let election_state = ElectionState {
            state: State::Follower(FollowerState {
                leader: None,
                election_timer: initial_timer,
            }),
            config,
            actor_client,
            state_change_notifier: notifier,
            last_timer_generation: 1,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, new_leader: Option<LeaderRedirectInfo>) {
        let election_timer = self.spawn_follower_timer();
        self.state = State::Follower(FollowerState {
            leader: new_leader,
            election_timer,
        });
        self.notify_new_state();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self, term: Term) {
        let mut received_votes_from = HashSet::with_capacity(3);
        // Vote for self
        received_votes_from.insert(self.config.my_replica_id.clone());

        let election_timer = self.spawn_follower_timer();
        self.state = State::Candidate(CandidateState {
            term,
            received_votes_from,
            election_timer,
        });
        self.notify_new_state();
    }

    pub(crate) fn transition_to_leader(&mut self, term: Term, peer_ids: Vec<ReplicaId>) {
        self.state = State::Leader(LeaderState {
            tracker: LeaderStateTracker::new(
                term,
                peer_ids,
                self.config.leader_heartbeat_duration,
                self.actor_client.clone(),
            ),
        });
        self.notify_new_state();
    }

    fn spawn_follower_timer(&mut self) -> ElectionTimer {
        self.last_timer_generation += 1;
        ElectionTimer::spawn(
            self.config.follower_min_timeout,
            self.config.follower_max_timeout,
            self.actor_client.clone(),
            self.last_timer_generation,
        )
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        match &self.state {
            State::Leader(ls) => ElectionStateSnapshot::Leader(ls.tracker_term()),
            State::Candidate(cs) => ElectionStateSnapshot::Candidate(cs.term),
            State::Follower(FollowerState { leader: None, .. }) => ElectionStateSnapshot::FollowerNoLeader,
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => ElectionStateSnapshot::Follower(leader_info.clone()),
        }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier.notify_new_state(self.current_state());
    }

    pub(crate) fn role(&self) -> Role {
        match &self.state {
            State::Leader(_) => Role::Leader,
            State::Candidate(_) => Role::Candidate,
            State::Follower(_) => Role::Follower,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    /// The leader as known by a follower.
    pub(crate) fn known_leader(&self) -> Option<&LeaderRedirectInfo> {
        match &self.state {
            State::Follower(fs) => fs.leader.as_ref(),
            _ => None,
        }
    }

    /// True if `timeout` came from the election timer that is currently running.
    pub(crate) fn is_current_timeout(&self, timeout: &ElectionTimeout) -> bool {
        match &self.state {
            State::Follower(fs) => fs.election_timer.generation() == timeout.generation,
            State::Candidate(cs) => cs.election_timer.generation() == timeout.generation,
            State::Leader(_) => false,
        }
    }

    pub(crate) fn reset_election_timer_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.election_timer.reset();
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &LeaderRedirectInfo) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_state();
            }
        }
    }

    /// Return the votes received so far if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<&HashSet<ReplicaId>> {
        if let State::Candidate(cs) = &mut self.state {
            cs.received_votes_from.insert(vote_from);
            Some(&cs.received_votes_from)
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(_) => write!(f, "Candidate"),
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => write!(f, "Follower(Leader={:?})", leader_info.replica_id),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
        }
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct LeaderState {
    tracker: LeaderStateTracker,
}

impl LeaderState {
    fn tracker_term(&self) -> Term {
        self.tracker.term()
    }
}

struct CandidateState {
    term: Term,
    received_votes_from: HashSet<ReplicaId>,
    election_timer: ElectionTimer,
}

struct FollowerState {
    leader: Option<LeaderRedirectInfo>,
    election_timer: ElectionTimer,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use std::net::SocketAddr;

    fn config() -> ElectionConfig {
        ElectionConfig {
            my_replica_id: ReplicaId::new("me"),
            leader_heartbeat_duration: Duration::from_secs(60),
            follower_min_timeout: Duration::from_secs(60),
            follower_max_timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn stale_timeouts_are_recognized() {
        let (client, _rx) = ActorClient::new(10);
        let (mut state, _listener) = ElectionState::new_follower(config(), client.weak());
        assert!(state.is_current_timeout(&ElectionTimeout { generation: 1 }));

        state.transition_to_candidate_and_vote_for_self(Term::new(1));
        assert!(!state.is_current_timeout(&ElectionTimeout { generation: 1 }));
        assert!(state.is_current_timeout(&ElectionTimeout { generation: 2 }));

        state.transition_to_leader(Term::new(1), vec![]);
        assert!(!state.is_current_timeout(&ElectionTimeout { generation: 2 }));
    }

    #[tokio::test]
    async fn votes_and_leader_tracking() {
        let (client, _rx) = ActorClient::new(10);
        let (mut state, mut listener) = ElectionState::new_follower(config(), client.weak());

        assert!(state.add_vote_if_candidate(ReplicaId::new("a")).is_none());

        state.transition_to_candidate_and_vote_for_self(Term::new(4));
        state.add_vote_if_candidate(ReplicaId::new("a"));
        assert_eq!(state.add_vote_if_candidate(ReplicaId::new("a")).map(|v| v.len()), Some(2));
        assert!(matches!(listener.next().await, Some(ElectionStateSnapshot::Candidate(_))));

        state.transition_to_follower(None);
        let leader = LeaderRedirectInfo {
            replica_id: ReplicaId::new("a"),
            address: SocketAddr::from(([127, 0, 0, 1], 1)),
        };
        state.set_leader_if_unknown(&leader);
        assert_eq!(state.known_leader().map(|l| l.replica_id.clone()), Some(ReplicaId::new("a")));
        assert_eq!(state.role(), Role::Follower);
    }
}
