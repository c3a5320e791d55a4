use crate::journal::api::{decode_all, Journal, JournalRecord};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

// Records are kept encoded, same as on disk.
#[derive(Default)]
struct Inner {
    encoded: Vec<u8>,
    fail_writes: bool,
}

/// InMemoryJournal keeps a replica's journal in memory. Clones share the same storage, so a test
/// can shut a replica down and start a new one over the journal the old one left behind.
#[derive(Clone, Default)]
pub struct InMemoryJournal {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        InMemoryJournal::default()
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "InMemoryJournal mutex guard poison"))
    }

    fn check_writable(inner: &Inner) -> io::Result<()> {
        if inner.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "Injected journal write failure"));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn records(&self) -> Vec<JournalRecord> {
        let inner = self.lock().expect("lock");
        decode_all(&inner.encoded).0
    }

    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.lock().expect("lock").fail_writes = fail;
    }
}

impl Journal for InMemoryJournal {
    fn append(&mut self, record: &JournalRecord) -> io::Result<()> {
        let encoded = record.encode_length_delimited()?;
        let mut inner = self.lock()?;
        Self::check_writable(&inner)?;
        inner.encoded.extend_from_slice(&encoded);

        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        let inner = self.lock()?;
        Self::check_writable(&inner)
    }

    fn load(&mut self) -> io::Result<Vec<JournalRecord>> {
        let inner = self.lock()?;
        Ok(decode_all(&inner.encoded).0)
    }

    fn rewrite(&mut self, records: &[JournalRecord]) -> io::Result<()> {
        let mut encoded = Vec::new();
        for record in records {
            encoded.extend(record.encode_length_delimited()?);
        }

        let mut inner = self.lock()?;
        Self::check_writable(&inner)?;
        inner.encoded = encoded;

        Ok(())
    }
}
