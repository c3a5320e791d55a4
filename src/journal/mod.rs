mod api;
mod file;
mod in_memory;
mod recovery;

pub(crate) use api::Journal;
pub(crate) use api::JournalRecord;
pub(crate) use file::FileJournal;
pub use in_memory::InMemoryJournal;
pub(crate) use recovery::RecoveredState;
