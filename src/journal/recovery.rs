use crate::journal::JournalRecord;
use crate::replica::{Index, LogEntry, Snapshot, TermInfo};
use std::cmp;

/// RecoveredState is what a replica resumes from after a restart.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct RecoveredState {
    pub(crate) term_info: TermInfo,
    pub(crate) snapshot: Option<Snapshot>,
    /// Contiguous entries following the snapshot (or starting at index 1).
    pub(crate) entries: Vec<LogEntry>,
    pub(crate) applied_index: Index,
}

impl RecoveredState {
    /// Fold the journal's records, oldest first, into the state they describe.
    pub(crate) fn replay(records: Vec<JournalRecord>) -> Self {
        let mut state = RecoveredState::default();

        for record in records {
            match record {
                JournalRecord::TermInfo(info) => {
                    if info.current_term >= state.term_info.current_term {
                        state.term_info = info;
                    }
                }
                JournalRecord::Entry(entry) => state.push_entry(entry),
                JournalRecord::RemoveFrom(index) => state.remove_from(index),
                JournalRecord::ApplyTo(index) => {
                    state.applied_index = cmp::max(state.applied_index, index);
                }
                JournalRecord::Snapshot(snapshot) => state.install_snapshot(snapshot),
            }
        }

        // Apply records can't outrun the log, but a journal cut short by a crash might.
        let last_index = state.last_index();
        state.applied_index = cmp::min(state.applied_index, last_index);

        state
    }

    fn snapshot_index(&self) -> Index {
        self.snapshot
            .as_ref()
            .map(|s| s.last_included_index)
            .unwrap_or(Index::ZERO)
    }

    fn last_index(&self) -> Index {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or_else(|| self.snapshot_index())
    }

    fn push_entry(&mut self, entry: LogEntry) {
        if entry.index <= self.snapshot_index() {
            return;
        }
        // A later write at an existing index replaced everything from there on.
        self.remove_from(entry.index);
        if entry.index == self.last_index().plus(1) {
            self.entries.push(entry);
        }
    }

    fn remove_from(&mut self, index: Index) {
        self.entries.retain(|e| e.index < index);
    }

    fn install_snapshot(&mut self, mut snapshot: Snapshot) {
        if snapshot.term_info.current_term > self.term_info.current_term {
            self.term_info = snapshot.term_info.clone();
        }
        self.applied_index = cmp::max(self.applied_index, snapshot.last_applied_index);

        let snapshot_index = snapshot.last_included_index;
        let tail = std::mem::take(&mut snapshot.unapplied_entries);
        self.entries.retain(|e| e.index > snapshot_index);
        if self.entries.is_empty() {
            self.entries = tail;
        }
        self.snapshot = Some(snapshot);

        // Keep only a contiguous run starting right after the snapshot.
        let mut expected = snapshot_index.plus(1);
        let mut contiguous = 0;
        for entry in self.entries.iter() {
            if entry.index != expected {
                break;
            }
            expected = expected.plus(1);
            contiguous += 1;
        }
        self.entries.truncate(contiguous);
    }
}
