use crate::replica::membership::ServerConfiguration;
use crate::replica::term_store::Term;
use bytes::Bytes;
use std::fmt;

/// Index is the position of an entry in the replicated log. The first entry lives at index 1.
/// Index 0 means "before the first entry" and is used for an empty log or an empty snapshot.
#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub(crate) struct Index(u64);

impl Index {
    pub(crate) const ZERO: Index = Index(0);

    pub(crate) fn new(index: u64) -> Self {
        Index(index)
    }

    pub(crate) fn start_index() -> Self {
        Index(1)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn plus(&self, delta: u64) -> Index {
        Index(self.0 + delta)
    }

    pub(crate) fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.0.checked_sub(delta).map(Index)
    }

    pub(crate) fn saturating_minus(&self, delta: u64) -> Index {
        Index(self.0.saturating_sub(delta))
    }

    /// Number of entries in the inclusive range `(self, other]`, or 0 if `other <= self`.
    pub(crate) fn distance_to(&self, other: Index) -> u64 {
        other.0.saturating_sub(self.0)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Rough per-entry bookkeeping cost (index, term, framing) added to the payload size when
// accounting for memory held by the log.
const ENTRY_OVERHEAD_BYTES: usize = 24;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum EntryPayload {
    /// Opaque bytes from the application. The only payload that reaches the state machine.
    Client(Bytes),
    /// Appended by a new leader so entries from earlier terms commit transitively.
    Noop,
    /// Membership. Becomes the authoritative peer set once committed.
    ServerConfiguration(ServerConfiguration),
}

/// LogEntry is immutable once created.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LogEntry {
    pub(crate) index: Index,
    pub(crate) term: Term,
    pub(crate) payload: EntryPayload,
}

impl LogEntry {
    pub(crate) fn new(index: Index, term: Term, payload: EntryPayload) -> Self {
        LogEntry { index, term, payload }
    }

    pub(crate) fn approx_size(&self) -> usize {
        let payload_size = match &self.payload {
            EntryPayload::Client(data) => data.len(),
            EntryPayload::Noop => 0,
            EntryPayload::ServerConfiguration(config) => config.approx_size(),
        };

        ENTRY_OVERHEAD_BYTES + payload_size
    }

    /// Configuration entries must be flushed before they are acknowledged.
    pub(crate) fn requires_sync(&self) -> bool {
        matches!(self.payload, EntryPayload::ServerConfiguration(_))
    }
}
