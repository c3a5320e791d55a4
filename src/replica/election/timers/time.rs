use tokio::time::Instant;

/// Timer tasks read time through a Clock so tests can drive them by hand.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone {
    fn now(&self) -> Instant;

    async fn sleep_until(&mut self, deadline: Instant);
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await
    }
}

#[cfg(test)]
pub(crate) use mock::mocked_clock;


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[tokio::test]
    async fn mock_sleep_waits_for_controller() {
        let (mut clock, mut controller) = mocked_clock();
        let deadline = controller.current_time() + Duration::from_secs(60);

        let sleeper = tokio::spawn(async move {
            clock.sleep_until(deadline).await;
            clock.now()
        });

        controller.advance(Duration::from_secs(30));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        controller.advance(Duration::from_secs(45));
        let woke_at = sleeper.await.unwrap();
        assert_eq!(woke_at - deadline, Duration::from_secs(15));
        assert_eq!(controller.elapsed_time(), Duration::from_secs(75));
    }
}
