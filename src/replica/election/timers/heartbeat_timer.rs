use crate::actor::WeakActorClient;
use crate::replica::election::timers::deadline::{self, DeadlineSetter, DeadlineWatch};
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::replica::{LeaderTimerTick, ReplicaId, Term};
use tokio::time::{Duration, Instant};

/// HeartbeatTimer asks the actor to send AppendEntries to one peer whenever that peer has gone a
/// full heartbeat interval without hearing from us. The first tick is immediate.
pub(crate) struct HeartbeatTimer<C: Clock = RealClock> {
    interval: Duration,
    clock: C,
    deadline: DeadlineSetter,
}

struct HeartbeatTask<C: Clock> {
    interval: Duration,
    clock: C,
    deadline: DeadlineWatch,
    tick: LeaderTimerTick,
    actor_client: WeakActorClient,
}

impl HeartbeatTimer {
    pub(crate) fn spawn(interval: Duration, actor_client: WeakActorClient, peer_id: ReplicaId, term: Term) -> Self {
        let (task, timer) = HeartbeatTask::new(interval, actor_client, LeaderTimerTick { peer_id, term }, RealClock);
        tokio::task::spawn(task.run());
        timer
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimer<C> {
    /// Called after any AppendEntries went out to the peer, so idle peers are the only ones that
    /// get periodic heartbeats.
    pub(crate) fn postpone(&self) {
        self.deadline.set(self.clock.now() + self.interval);
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTask<C> {
    fn new(
        interval: Duration,
        actor_client: WeakActorClient,
        tick: LeaderTimerTick,
        clock: C,
    ) -> (Self, HeartbeatTimer<C>) {
        let (setter, watch) = deadline::new(clock.now());
        let task = HeartbeatTask {
            interval,
            clock: clock.clone(),
            deadline: watch,
            tick,
            actor_client,
        };
        let timer = HeartbeatTimer {
            interval,
            clock,
            deadline: setter,
        };

        (task, timer)
    }

    async fn run(mut self) {
        let mut fire_at: Instant = self.clock.now();
        loop {
            tokio::select! {
                biased;
                moved = self.deadline.moved() => match moved {
                    Some(new_fire_at) => fire_at = new_fire_at,
                    None => return,
                },
                _ = self.clock.sleep_until(fire_at) => {
                    if self.actor_client.leader_timer(self.tick.clone()).await.is_err() {
                        return;
                    }
                    fire_at = self.clock.now() + self.interval;
                }
            }
        }
    }
}
