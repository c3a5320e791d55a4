use crate::actor::Callback;
use crate::replica::log_entry::Index;
use crate::replica::replica_api::{SubmitError, SubmitOutput};
use crate::replica::term_store::Term;
use std::collections::BTreeMap;

/// A client write waiting for its entry to be applied.
#[derive(Debug)]
pub(crate) struct TrackedRequest {
    pub(crate) index: Index,
    pub(crate) term: Term,
    pub(crate) request_id: String,
    pub(crate) callback: Callback<SubmitOutput, SubmitError>,
}

/// ClientRequestTracker correlates in-flight client writes with the log index that has to be
/// applied before the client gets an answer. Every tracked request is answered exactly once:
/// either by the state machine's reply after apply, or with `NotCommitted` when leadership is lost.
pub(crate) struct ClientRequestTracker {
    pending: BTreeMap<Index, TrackedRequest>,
}

impl ClientRequestTracker {
    pub(crate) fn new() -> Self {
        ClientRequestTracker {
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn track(
        &mut self,
        index: Index,
        term: Term,
        request_id: String,
        callback: Callback<SubmitOutput, SubmitError>,
    ) {
        let request = TrackedRequest {
            index,
            term,
            request_id,
            callback,
        };
        if let Some(replaced) = self.pending.insert(index, request) {
            // Only possible if we lost and regained leadership without failing the old requests.
            replaced.callback.send(Err(SubmitError::NotCommitted));
        }
    }

    /// Remove the request tracked for `index`, if any. Its term must match the applied entry's,
    /// otherwise the entry it was waiting for was overwritten.
    pub(crate) fn take(&mut self, index: Index, term: Term) -> Option<TrackedRequest> {
        let request = self.pending.remove(&index)?;
        if request.term != term {
            request.callback.send(Err(SubmitError::NotCommitted));
            return None;
        }

        Some(request)
    }

    /// Answer every pending request with "not committed, retry".
    pub(crate) fn fail_all(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let num_failed = pending.len();
        for (_, request) in pending {
            request.callback.send(Err(SubmitError::NotCommitted));
        }

        num_failed
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
