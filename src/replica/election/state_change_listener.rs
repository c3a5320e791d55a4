use crate::replica::replica_api::LeaderRedirectInfo;
use crate::replica::term_store::Term;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub(crate) enum ElectionStateSnapshot {
    Leader(Term),
    Candidate(Term),
    Follower(LeaderRedirectInfo),
    FollowerNoLeader,
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (tx, rx) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { tx }, ElectionStateChangeListener { rx })
}

pub(super) struct ElectionStateChangeNotifier {
    tx: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        // Nobody listening is fine.
        let _ = self.tx.send(new_state);
    }
}

/// Listeners only see the latest state. Intermediate states may be skipped if the listener is slow.
#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rx: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rx.changed().await {
            Ok(_) => Some(self.rx.borrow().clone()),
            Err(_) => None,
        }
    }

    pub(crate) fn current(&self) -> ElectionStateSnapshot {
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_sees_latest_state_and_close() {
        let (notifier, mut listener) = new(ElectionStateSnapshot::FollowerNoLeader);
        assert!(matches!(listener.current(), ElectionStateSnapshot::FollowerNoLeader));

        notifier.notify_new_state(ElectionStateSnapshot::Candidate(Term::new(1)));
        notifier.notify_new_state(ElectionStateSnapshot::Leader(Term::new(1)));
        assert!(matches!(
            listener.next().await,
            Some(ElectionStateSnapshot::Leader(term)) if term == Term::new(1)
        ));

        drop(notifier);
        assert!(listener.next().await.is_none());
    }
}
