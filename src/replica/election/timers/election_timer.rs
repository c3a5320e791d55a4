use crate::actor::WeakActorClient;
use crate::replica::election::timers::deadline::{self, DeadlineSetter, DeadlineWatch};
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::replica::ElectionTimeout;
use rand::Rng;
use tokio::time::{Duration, Instant};

/// ElectionTimer fires an `ElectionTimeout` when no leader has been heard from within a random
/// timeout between min and max. It keeps firing, at most once per min timeout, until the handle
/// is dropped or reset.
pub(crate) struct ElectionTimer<C: Clock = RealClock> {
    generation: u64,
    min_timeout: Duration,
    max_timeout: Duration,
    clock: C,
    deadline: DeadlineSetter,
}

struct ElectionTimerTask<C: Clock> {
    timeout: ElectionTimeout,
    retry_interval: Duration,
    clock: C,
    deadline: DeadlineWatch,
    actor_client: WeakActorClient,
}

impl ElectionTimer {
    pub(crate) fn spawn(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
        generation: u64,
    ) -> Self {
        let (task, timer) = ElectionTimerTask::new(min_timeout, max_timeout, actor_client, generation, RealClock);
        tokio::task::spawn(task.run());
        timer
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimer<C> {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Heard from the leader. Pick a fresh random deadline.
    pub(crate) fn reset(&self) {
        self.deadline.set(self.next_deadline());
    }

    fn next_deadline(&self) -> Instant {
        let timeout = if self.min_timeout < self.max_timeout {
            rand::thread_rng().gen_range(self.min_timeout..=self.max_timeout)
        } else {
            self.min_timeout
        };
        self.clock.now() + timeout
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
        generation: u64,
        clock: C,
    ) -> (Self, ElectionTimer<C>) {
        let (setter, watch) = deadline::new(clock.now());
        let timer = ElectionTimer {
            generation,
            min_timeout,
            max_timeout,
            clock: clock.clone(),
            deadline: setter,
        };
        // Start with a full timeout, or a new follower would call an election right away.
        timer.reset();

        let task = ElectionTimerTask {
            timeout: ElectionTimeout { generation },
            retry_interval: min_timeout,
            clock,
            deadline: watch,
            actor_client,
        };

        (task, timer)
    }

    async fn run(mut self) {
        let mut fire_at = match self.deadline.moved().await {
            Some(deadline) => deadline,
            None => return,
        };
        loop {
            tokio::select! {
                biased;
                moved = self.deadline.moved() => match moved {
                    Some(new_fire_at) => fire_at = new_fire_at,
                    None => return,
                },
                _ = self.clock.sleep_until(fire_at) => {
                    if self.actor_client.follower_timeout(self.timeout.clone()).await.is_err() {
                        return;
                    }
                    // The actor may still be handling an AppendEntries that resets us.
                    fire_at = self.clock.now() + self.retry_interval;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::election::timers::test_utils::TestUtilActor;
    use crate::replica::election::timers::time;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn resets_push_the_timeout_out() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, mut controller) = time::mocked_clock();

        let (task, timer) = ElectionTimerTask::new(TIMEOUT, TIMEOUT, actor_client.weak(), 3, clock);
        tokio::task::spawn(task.run());
        actor.assert_no_event().await;

        for _ in 0..6 {
            controller.advance(TIMEOUT / 2);
            timer.reset();
        }
        actor.assert_no_event().await;

        // Last reset was at T=3.0
        controller.advance(TIMEOUT - Duration::from_nanos(1));
        actor.assert_no_event().await;
        controller.advance(Duration::from_nanos(1));
        actor.assert_follower_timeout_event(3).await;
        assert_eq!(controller.elapsed_time(), TIMEOUT * 4);
    }

    #[tokio::test]
    async fn keeps_firing_until_reset() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, mut controller) = time::mocked_clock();

        let (task, timer) = ElectionTimerTask::new(TIMEOUT, TIMEOUT, actor_client.weak(), 1, clock);
        tokio::task::spawn(task.run());

        controller.advance(TIMEOUT);
        actor.assert_follower_timeout_event(1).await;
        controller.advance(TIMEOUT);
        actor.assert_follower_timeout_event(1).await;

        // A reset racing a queued timeout leaves the timer running.
        timer.reset();
        controller.advance(TIMEOUT / 2);
        actor.assert_no_event().await;
        controller.advance(TIMEOUT / 2);
        actor.assert_follower_timeout_event(1).await;
    }

    #[tokio::test]
    async fn dropping_timer_ends_task() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, mut controller) = time::mocked_clock();

        let (task, timer) = ElectionTimerTask::new(TIMEOUT, TIMEOUT, actor_client.weak(), 1, clock);
        let join_handle = tokio::task::spawn(task.run());
        drop(timer);

        controller.advance(TIMEOUT * 2);
        join_handle.await.unwrap();
        actor.assert_no_event().await;
    }

    #[test]
    fn random_deadline_stays_in_range() {
        let (actor_client, _rx) = ActorClient::new(1);
        let (clock, controller) = time::mocked_clock();
        let (_task, timer) = ElectionTimerTask::new(
            Duration::from_millis(150),
            Duration::from_millis(300),
            actor_client.weak(),
            1,
            clock,
        );

        for _ in 0..100 {
            let timeout = timer.next_deadline() - controller.current_time();
            assert!(timeout >= Duration::from_millis(150) && timeout <= Duration::from_millis(300));
        }
    }
}
