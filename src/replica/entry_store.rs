use crate::actor::WeakActorClient;
use crate::journal::{Journal, JournalRecord};
use crate::replica::log_entry::{Index, LogEntry};
use crate::replica::replica_api::EntryPersisted;
use crate::replica::snapshot::Snapshot;
use crate::replica::term_store::TermInfo;
use std::cmp;
use std::io;

/// EntryStore is the replica's only path to its journal.
///
/// `persist()` only buffers the write. The first buffered write after a flush asks the actor (via
/// an `EntryPersisted` event) to flush, so everything buffered in between is synced together.
/// `durable_index()` is how far the log is known to be on disk; a leader only counts itself
/// towards a majority up to that index.
pub(crate) struct EntryStore {
    logger: slog::Logger,
    journal: Box<dyn Journal>,
    notifier: WeakActorClient,
    durable_index: Index,
    last_appended: Index,
    flush_requested: bool,
}

impl EntryStore {
    pub(crate) fn new(logger: slog::Logger, journal: Box<dyn Journal>, notifier: WeakActorClient) -> Self {
        EntryStore {
            logger,
            journal,
            notifier,
            durable_index: Index::ZERO,
            last_appended: Index::ZERO,
            flush_requested: false,
        }
    }

    /// Called once after journal replay. Everything replayed is durable.
    pub(crate) fn recovered(&mut self, last_index: Index) {
        self.durable_index = last_index;
        self.last_appended = last_index;
    }

    pub(crate) fn durable_index(&self) -> Index {
        self.durable_index
    }

    pub(crate) fn persist(&mut self, entry: &LogEntry) -> io::Result<()> {
        self.journal.append(&JournalRecord::Entry(entry.clone()))?;
        self.last_appended = entry.index;

        if !self.flush_requested {
            self.flush_requested = true;
            let notifier = self.notifier.clone();
            let event = EntryPersisted { index: entry.index };
            tokio::task::spawn(async move {
                let _ = notifier.notify_entry_persisted(event).await;
            });
        }

        Ok(())
    }

    pub(crate) fn persist_and_sync(&mut self, entry: &LogEntry) -> io::Result<()> {
        self.journal.append(&JournalRecord::Entry(entry.clone()))?;
        self.last_appended = entry.index;
        self.sync()
    }

    /// Append a batch and sync once. Used by followers, which must not acknowledge entries that
    /// aren't durable.
    pub(crate) fn persist_all_and_sync(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        for entry in entries {
            self.journal.append(&JournalRecord::Entry(entry.clone()))?;
            self.last_appended = entry.index;
        }
        self.sync()
    }

    /// Handles the flush requested by `persist()`. Returns the new durable index.
    pub(crate) fn on_entry_persisted(&mut self) -> io::Result<Index> {
        self.flush_requested = false;
        self.sync()?;

        Ok(self.durable_index)
    }

    pub(crate) fn remove_from(&mut self, index: Index) -> io::Result<()> {
        self.journal.append(&JournalRecord::RemoveFrom(index))?;
        self.sync()?;

        let new_last = index.saturating_minus(1);
        self.last_appended = cmp::min(self.last_appended, new_last);
        self.durable_index = cmp::min(self.durable_index, new_last);
        Ok(())
    }

    /// Not synced. Losing it means re-applying some entries after a restart, which the state
    /// machine has to tolerate anyway.
    pub(crate) fn apply_to(&mut self, index: Index) -> io::Result<()> {
        self.journal.append(&JournalRecord::ApplyTo(index))
    }

    pub(crate) fn persist_term_info(&mut self, term_info: &TermInfo) -> io::Result<()> {
        self.journal.append(&JournalRecord::TermInfo(term_info.clone()))?;
        self.journal.sync()
    }

    /// Compact the journal down to `snapshot` (whose unapplied entries must be the whole log past
    /// the snapshot) plus the current term/vote and apply position.
    pub(crate) fn save_snapshot(
        &mut self,
        snapshot: &Snapshot,
        term_info: &TermInfo,
        applied_index: Index,
    ) -> io::Result<()> {
        self.journal.rewrite(&[
            JournalRecord::Snapshot(snapshot.clone()),
            JournalRecord::TermInfo(term_info.clone()),
            JournalRecord::ApplyTo(applied_index),
        ])?;

        let last_index = snapshot
            .unapplied_entries
            .last()
            .map(|e| e.index)
            .unwrap_or(snapshot.last_included_index);
        slog::info!(
            self.logger,
            "Journal compacted to snapshot at {:?}, log now ends at {:?}",
            snapshot.last_included_index,
            last_index
        );
        self.last_appended = last_index;
        self.durable_index = last_index;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.journal.sync()?;
        self.durable_index = self.last_appended;
        Ok(())
    }
}
