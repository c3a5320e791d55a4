use crate::actor::Event;
use crate::replica::LeaderTimerTick;
use std::time::Duration;
use tokio::sync::mpsc;

/// Stands in for the replica actor and asserts on what timers put in its queue.
pub(super) struct TestUtilActor {
    queue: mpsc::Receiver<Event>,
    quiet_period: Duration,
}

impl TestUtilActor {
    pub(super) fn new(queue: mpsc::Receiver<Event>) -> Self {
        TestUtilActor {
            queue,
            quiet_period: Duration::from_millis(10),
        }
    }

    async fn next_event(&mut self) -> Event {
        match tokio::time::timeout(Duration::from_secs(5), self.queue.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => panic!("Actor queue closed"),
            Err(_) => panic!("No event within 5s"),
        }
    }

    pub(super) async fn assert_leader_heartbeat_event(&mut self, expected: LeaderTimerTick) {
        match self.next_event().await {
            Event::LeaderTimer(tick) => assert_eq!(tick, expected),
            _ => panic!("Expected a leader timer tick"),
        }
    }

    pub(super) async fn assert_follower_timeout_event(&mut self, expected_generation: u64) {
        match self.next_event().await {
            Event::FollowerTimeout(timeout) => assert_eq!(timeout.generation, expected_generation),
            _ => panic!("Expected an election timeout"),
        }
    }

    pub(super) async fn assert_no_event(&mut self) {
        if tokio::time::timeout(self.quiet_period, self.queue.recv()).await.is_ok() {
            panic!("Expected no event");
        }
    }
}
