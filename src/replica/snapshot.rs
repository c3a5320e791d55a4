use crate::actor::Callback;
use crate::replica::log_entry::{Index, LogEntry};
use crate::replica::membership::ServerConfiguration;
use crate::replica::replica_api::GetSnapshotError;
use crate::replica::term_store::{Term, TermInfo};
use bytes::Bytes;

/// Snapshot is the state machine's state after applying every entry up to `last_applied_index`,
/// plus what the core needs to resume from it: the term/vote, the membership at that point, and
/// the entries that were in the log past the snapshot when it was taken.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Snapshot {
    pub(crate) state: Bytes,
    pub(crate) last_included_index: Index,
    pub(crate) last_included_term: Term,
    pub(crate) last_applied_index: Index,
    pub(crate) last_applied_term: Term,
    pub(crate) unapplied_entries: Vec<LogEntry>,
    pub(crate) term_info: TermInfo,
    pub(crate) server_configuration: ServerConfiguration,
}

impl Snapshot {
    /// Copy without the log tail. This is what a lagging follower receives; the leader's
    /// AppendEntries take over right after the snapshot.
    pub(crate) fn without_unapplied(&self) -> Snapshot {
        Snapshot {
            unapplied_entries: Vec::new(),
            ..self.clone()
        }
    }
}

pub(crate) struct PendingCapture {
    pub(crate) index: Index,
    pub(crate) term: Term,
    // False when the capture was requested only to hand out a copy (GetSnapshot).
    pub(crate) compact: bool,
    pub(crate) configuration: ServerConfiguration,
    pub(crate) waiters: Vec<Callback<Snapshot, GetSnapshotError>>,
}

/// SnapshotTracker remembers the latest completed snapshot and the one capture that may be in
/// flight on the state machine task.
pub(crate) struct SnapshotTracker {
    latest: Option<Snapshot>,
    pending: Option<PendingCapture>,
}

impl SnapshotTracker {
    pub(crate) fn new(latest: Option<Snapshot>) -> Self {
        SnapshotTracker { latest, pending: None }
    }

    pub(crate) fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    pub(crate) fn set_latest(&mut self, snapshot: Snapshot) {
        self.latest.replace(snapshot);
    }

    pub(crate) fn is_capturing(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns false if a capture is already in flight.
    pub(crate) fn begin(&mut self, index: Index, term: Term, compact: bool, configuration: ServerConfiguration) -> bool {
        if self.pending.is_some() {
            return false;
        }

        self.pending = Some(PendingCapture {
            index,
            term,
            compact,
            configuration,
            waiters: Vec::new(),
        });
        true
    }

    /// Hand the in-flight capture's result to `callback` as well. Returns the callback if nothing is
    /// in flight.
    pub(crate) fn add_waiter(
        &mut self,
        callback: Callback<Snapshot, GetSnapshotError>,
    ) -> Option<Callback<Snapshot, GetSnapshotError>> {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.waiters.push(callback);
                None
            }
            None => Some(callback),
        }
    }

    /// Take the in-flight capture if `index`/`term` identify it.
    pub(crate) fn complete(&mut self, index: Index, term: Term) -> Option<PendingCapture> {
        match &self.pending {
            Some(p) if p.index == index && p.term == term => self.pending.take(),
            _ => None,
        }
    }
}

impl PendingCapture {
    pub(crate) fn fail(self, message: &str) {
        for waiter in self.waiters {
            waiter.send(Err(GetSnapshotError::CaptureFailed(message.to_string())));
        }
    }

    pub(crate) fn succeed(self, snapshot: &Snapshot) {
        for waiter in self.waiters {
            waiter.send(Ok(snapshot.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::log_entry::EntryPayload;
    use tokio::sync::oneshot;

    fn snapshot() -> Snapshot {
        Snapshot {
            state: Bytes::from_static(b"state"),
            last_included_index: Index::new(10),
            last_included_term: Term::new(2),
            last_applied_index: Index::new(10),
            last_applied_term: Term::new(2),
            unapplied_entries: vec![LogEntry::new(Index::new(11), Term::new(2), EntryPayload::Noop)],
            term_info: TermInfo::new(Term::new(3), None),
            server_configuration: ServerConfiguration::default(),
        }
    }

    #[test]
    fn without_unapplied_keeps_everything_else() {
        let stripped = snapshot().without_unapplied();
        assert!(stripped.unapplied_entries.is_empty());
        assert_eq!(stripped.last_included_index, Index::new(10));
        assert_eq!(stripped.state, Bytes::from_static(b"state"));
    }

    #[tokio::test]
    async fn one_capture_at_a_time_and_waiters_get_the_result() {
        let mut tracker = SnapshotTracker::new(None);
        let (tx, rx) = oneshot::channel();

        // Nothing in flight, the callback comes straight back.
        let callback = tracker.add_waiter(Callback::new(tx)).expect("not capturing");

        assert!(tracker.begin(Index::new(10), Term::new(2), false, ServerConfiguration::default()));
        assert!(!tracker.begin(Index::new(12), Term::new(2), true, ServerConfiguration::default()));
        assert!(tracker.add_waiter(callback).is_none());

        // Result for some other capture is ignored.
        assert!(tracker.complete(Index::new(9), Term::new(2)).is_none());
        assert!(tracker.is_capturing());

        let pending = tracker.complete(Index::new(10), Term::new(2)).expect("pending");
        assert!(!pending.compact);
        pending.succeed(&snapshot());
        assert!(!tracker.is_capturing());

        assert_eq!(rx.await.unwrap().unwrap(), snapshot());
    }
}
