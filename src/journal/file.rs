use crate::journal::api::{decode_all, Journal, JournalRecord};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// FileJournal is a single append-only file of length-delimited protobuf records per replica.
///
/// Appends are buffered. `sync()` flushes the buffer and fsyncs the data. `rewrite()` writes a
/// temp file next to the journal, fsyncs it, then renames it over the journal.
pub(crate) struct FileJournal {
    logger: slog::Logger,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileJournal {
    pub(crate) fn open(logger: slog::Logger, directory: &Path, replica_id: &str) -> io::Result<Self> {
        fs::create_dir_all(directory)?;
        let path = directory.join(format!("{}.journal", replica_id));
        let file = Self::open_for_append(&path)?;

        Ok(FileJournal {
            logger,
            path,
            writer: BufWriter::new(file),
        })
    }

    fn open_for_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).read(true).open(path)
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("journal.tmp")
    }
}

impl Journal for FileJournal {
    fn append(&mut self, record: &JournalRecord) -> io::Result<()> {
        let encoded = record.encode_length_delimited()?;
        self.writer.write_all(&encoded)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    fn load(&mut self) -> io::Result<Vec<JournalRecord>> {
        self.writer.flush()?;

        let mut data = Vec::new();
        File::open(&self.path)?.read_to_end(&mut data)?;
        let (records, valid_len) = decode_all(&data);

        if valid_len < data.len() {
            slog::warn!(
                self.logger,
                "Discarding {} bytes of torn journal tail in {:?}",
                data.len() - valid_len,
                self.path
            );
            let file = self.writer.get_ref();
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        Ok(records)
    }

    fn rewrite(&mut self, records: &[JournalRecord]) -> io::Result<()> {
        self.writer.flush()?;

        let temp_path = self.temp_path();
        {
            let mut temp = BufWriter::new(File::create(&temp_path)?);
            for record in records {
                temp.write_all(&record.encode_length_delimited()?)?;
            }
            temp.flush()?;
            temp.get_ref().sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        self.writer = BufWriter::new(Self::open_for_append(&self.path)?);
        Ok(())
    }
}
