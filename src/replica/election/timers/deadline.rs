use tokio::sync::watch;
use tokio::time::Instant;

/// Owned by a timer handle. Dropping it tells the timer task to exit.
pub(super) struct DeadlineSetter {
    tx: watch::Sender<Instant>,
}

/// Owned by a timer task.
pub(super) struct DeadlineWatch {
    rx: watch::Receiver<Instant>,
}

pub(super) fn new(initial: Instant) -> (DeadlineSetter, DeadlineWatch) {
    let (tx, rx) = watch::channel(initial);
    (DeadlineSetter { tx }, DeadlineWatch { rx })
}

impl DeadlineSetter {
    pub(super) fn set(&self, deadline: Instant) {
        // Fails only once the task is gone.
        let _ = self.tx.send(deadline);
    }
}

impl DeadlineWatch {
    /// Waits for the handle to move the deadline. `None` means the handle was dropped.
    pub(super) async fn moved(&mut self) -> Option<Instant> {
        match self.rx.changed().await {
            Ok(()) => Some(*self.rx.borrow_and_update()),
            Err(_) => None,
        }
    }
}
