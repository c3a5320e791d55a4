use crate::replica::entry_store::EntryStore;
use crate::replica::log_entry::{Index, LogEntry};
use crate::replica::replica_api::LogPosition;
use crate::replica::term_store::Term;
use std::cmp;
use std::collections::VecDeque;
use std::io;

// Without followers there is no replication pressure to keep the log short, so data size counts
// for less.
const SINGLE_NODE_DATA_DAMPING_FACTOR: usize = 5;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SnapshotPolicy {
    /// Capture once this many applied entries sit in the log past the last snapshot.
    pub(crate) batch_count: u64,
    /// Capture once the entries held in memory add up to this many bytes.
    pub(crate) data_threshold: usize,
}

/// ReplicatedLog holds the in-memory log past the latest snapshot, and the commit and apply
/// positions.
///
/// `snapshot_index <= last_applied <= commit_index <= last_index()` always holds.
pub(crate) struct ReplicatedLog {
    // entries[0] is at snapshot_index + 1.
    entries: VecDeque<LogEntry>,
    snapshot_index: Index,
    snapshot_term: Term,
    commit_index: Index,
    last_applied: Index,
    data_size: usize,
    policy: SnapshotPolicy,
}

impl ReplicatedLog {
    pub(crate) fn new(policy: SnapshotPolicy) -> Self {
        ReplicatedLog {
            entries: VecDeque::new(),
            snapshot_index: Index::ZERO,
            snapshot_term: Term::default(),
            commit_index: Index::ZERO,
            last_applied: Index::ZERO,
            data_size: 0,
            policy,
        }
    }

    /// Resume from a replayed journal. Entries up to `applied_index` were applied, so they are
    /// committed too.
    pub(crate) fn recover(
        policy: SnapshotPolicy,
        snapshot_position: LogPosition,
        entries: Vec<LogEntry>,
        applied_index: Index,
    ) -> Self {
        let mut log = ReplicatedLog::new(policy);
        log.snapshot_index = snapshot_position.index;
        log.snapshot_term = snapshot_position.term;
        for entry in entries {
            log.push(entry);
        }
        // Recovered entries past the applied index are re-applied once committed again.
        log.last_applied = cmp::max(log.snapshot_index, cmp::min(applied_index, log.last_index()));
        log.commit_index = log.last_applied;

        log
    }

    pub(crate) fn snapshot_index(&self) -> Index {
        self.snapshot_index
    }

    pub(crate) fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub(crate) fn commit_index(&self) -> Index {
        self.commit_index
    }

    pub(crate) fn last_applied(&self) -> Index {
        self.last_applied
    }

    pub(crate) fn data_size(&self) -> usize {
        self.data_size
    }

    pub(crate) fn last_index(&self) -> Index {
        self.entries.back().map(|e| e.index).unwrap_or(self.snapshot_index)
    }

    pub(crate) fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    pub(crate) fn last_position(&self) -> LogPosition {
        LogPosition::new(self.last_term(), self.last_index())
    }

    pub(crate) fn entry_at(&self, index: Index) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        let offset = self.snapshot_index.distance_to(index) - 1;
        self.entries.get(offset as usize)
    }

    /// Term of the entry at `index`, which is known for the snapshot boundary too.
    pub(crate) fn term_at(&self, index: Index) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry_at(index).map(|e| e.term)
    }

    /// Append `entry` at the end of the log. Returns true if it was appended or an identical
    /// entry is already there. Returns false if a different-term entry occupies the index (the
    /// caller must truncate first) or the entry doesn't follow the log.
    pub(crate) fn append(&mut self, entry: LogEntry) -> bool {
        if entry.index <= self.last_index() {
            return self.term_at(entry.index) == Some(entry.term);
        }
        if entry.index != self.last_index().plus(1) || entry.term < self.last_term() {
            return false;
        }

        self.push(entry);
        true
    }

    fn push(&mut self, entry: LogEntry) {
        self.data_size += entry.approx_size();
        self.entries.push_back(entry);
    }

    /// True if our log has an entry at `previous_index` with `previous_term`. Everything up to the
    /// snapshot is committed, and committed entries match any leader's log.
    pub(crate) fn is_in_sync(&self, previous_index: Index, previous_term: Term) -> bool {
        if previous_index < self.snapshot_index {
            return true;
        }
        self.term_at(previous_index) == Some(previous_term)
    }

    /// Remove every entry at or after `index`, recording the truncation in the journal first.
    /// Committed entries are never removed.
    pub(crate) fn remove_from_and_persist(&mut self, index: Index, store: &mut EntryStore) -> io::Result<()> {
        if index <= self.commit_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Refusing to remove committed entries from {:?} (commit index {:?})",
                    index, self.commit_index
                ),
            ));
        }
        if index > self.last_index() {
            return Ok(());
        }

        store.remove_from(index)?;
        while matches!(self.entries.back(), Some(e) if e.index >= index) {
            if let Some(removed) = self.entries.pop_back() {
                self.data_size = self.data_size.saturating_sub(removed.approx_size());
            }
        }
        Ok(())
    }

    /// Up to `max` entries starting at `index`.
    pub(crate) fn entries_from(&self, index: Index, max: usize) -> Vec<LogEntry> {
        if index <= self.snapshot_index {
            return Vec::new();
        }
        let offset = (self.snapshot_index.distance_to(index) - 1) as usize;
        self.entries.iter().skip(offset).take(max).cloned().collect()
    }

    /// Every entry after `index`.
    pub(crate) fn entries_after(&self, index: Index) -> Vec<LogEntry> {
        self.entries.iter().filter(|e| e.index > index).cloned().collect()
    }

    /// A follower whose next needed entry has been compacted away must be sent the snapshot.
    pub(crate) fn needs_snapshot(&self, next_index: Index) -> bool {
        !self.snapshot_index.is_zero() && next_index <= self.snapshot_index
    }

    /// Returns true if the commit index moved.
    pub(crate) fn ratchet_commit_index(&mut self, index: Index) -> bool {
        let index = cmp::min(index, self.last_index());
        if index > self.commit_index {
            self.commit_index = index;
            true
        } else {
            false
        }
    }

    pub(crate) fn next_to_apply(&self) -> Option<&LogEntry> {
        if self.last_applied >= self.commit_index {
            return None;
        }
        self.entry_at(self.last_applied.plus(1))
    }

    pub(crate) fn mark_applied(&mut self, index: Index) {
        self.last_applied = cmp::max(self.last_applied, cmp::min(index, self.commit_index));
    }

    pub(crate) fn should_capture_snapshot(&self, has_followers: bool) -> bool {
        if self.last_applied <= self.snapshot_index {
            return false;
        }

        let applied_since_snapshot = self.snapshot_index.distance_to(self.last_applied);
        if applied_since_snapshot >= self.policy.batch_count {
            return true;
        }

        let accounted_size = if has_followers {
            self.data_size
        } else {
            self.data_size / SINGLE_NODE_DATA_DAMPING_FACTOR
        };
        accounted_size >= self.policy.data_threshold
    }

    /// Discard entries up to and including `index`, which a snapshot now covers.
    pub(crate) fn compact_through(&mut self, index: Index, term: Term) {
        if index <= self.snapshot_index {
            return;
        }

        while matches!(self.entries.front(), Some(e) if e.index <= index) {
            if let Some(removed) = self.entries.pop_front() {
                self.data_size = self.data_size.saturating_sub(removed.approx_size());
            }
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Replace our log prefix with an installed snapshot. Entries past the snapshot survive only
    /// if our log agrees with the snapshot's last entry.
    pub(crate) fn install_snapshot(&mut self, index: Index, term: Term) {
        if self.term_at(index) == Some(term) {
            self.compact_through(index, term);
        } else {
            self.entries.clear();
            self.data_size = 0;
            self.snapshot_index = index;
            self.snapshot_term = term;
        }

        self.commit_index = cmp::max(self.commit_index, index);
        self.last_applied = index;
    }
}
