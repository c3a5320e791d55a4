use crate::grpc::{proto_journal_record, ProtoJournalRecord};
use crate::replica::{Index, LogEntry, Snapshot, TermInfo};
use crate::wire;
use prost::Message;
use std::io;

/// Journal is the durable record of one replica: its term/vote, its log, and its latest snapshot.
///
/// Appended records are only guaranteed durable after `sync()` returns.
pub(crate) trait Journal: Send {
    fn append(&mut self, record: &JournalRecord) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;

    /// Read back every record, oldest first. A partially written trailing record is discarded.
    fn load(&mut self) -> io::Result<Vec<JournalRecord>>;

    /// Atomically replace the whole journal with `records`. Durable on return.
    fn rewrite(&mut self, records: &[JournalRecord]) -> io::Result<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum JournalRecord {
    TermInfo(TermInfo),
    Entry(LogEntry),
    /// Every entry at or after the index was removed.
    RemoveFrom(Index),
    /// Entries up to the index were handed to the state machine.
    ApplyTo(Index),
    Snapshot(Snapshot),
}

impl JournalRecord {
    pub(crate) fn encode_length_delimited(&self) -> io::Result<Vec<u8>> {
        let proto = self.to_proto();
        let mut buf = Vec::with_capacity(proto.encoded_len() + 10);
        proto
            .encode_length_delimited(&mut buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(buf)
    }

    pub(crate) fn decode(data: &[u8]) -> io::Result<JournalRecord> {
        let proto = ProtoJournalRecord::decode(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Self::from_proto(proto)
    }

    fn to_proto(&self) -> ProtoJournalRecord {
        let record = match self {
            JournalRecord::TermInfo(info) => proto_journal_record::Record::TermInfo(wire::term_info_to_proto(info)),
            JournalRecord::Entry(entry) => proto_journal_record::Record::Entry(wire::log_entry_to_proto(entry)),
            JournalRecord::RemoveFrom(index) => proto_journal_record::Record::RemoveFrom(index.as_u64()),
            JournalRecord::ApplyTo(index) => proto_journal_record::Record::ApplyTo(index.as_u64()),
            JournalRecord::Snapshot(snapshot) => {
                proto_journal_record::Record::Snapshot(wire::snapshot_to_proto(snapshot))
            }
        };

        ProtoJournalRecord { record: Some(record) }
    }

    fn from_proto(proto: ProtoJournalRecord) -> io::Result<JournalRecord> {
        let invalid = |e: wire::WireError| io::Error::new(io::ErrorKind::InvalidData, e);

        match proto.record {
            Some(proto_journal_record::Record::TermInfo(info)) => {
                Ok(JournalRecord::TermInfo(wire::term_info_from_proto(info)))
            }
            Some(proto_journal_record::Record::Entry(entry)) => {
                Ok(JournalRecord::Entry(wire::log_entry_from_proto(entry).map_err(invalid)?))
            }
            Some(proto_journal_record::Record::RemoveFrom(index)) => Ok(JournalRecord::RemoveFrom(Index::new(index))),
            Some(proto_journal_record::Record::ApplyTo(index)) => Ok(JournalRecord::ApplyTo(Index::new(index))),
            Some(proto_journal_record::Record::Snapshot(snapshot)) => {
                Ok(JournalRecord::Snapshot(wire::snapshot_from_proto(snapshot).map_err(invalid)?))
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidData, "Empty journal record")),
        }
    }
}

/// Split a buffer of length-delimited records. Returns the records and how many bytes they
/// covered; anything past that is a torn write.
pub(super) fn decode_all(data: &[u8]) -> (Vec<JournalRecord>, usize) {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let mut cursor = &data[offset..];
        let len = match prost::decode_length_delimiter(&mut cursor) {
            Ok(len) => len,
            Err(_) => break,
        };
        let header_len = data.len() - offset - cursor.len();
        if cursor.len() < len {
            break;
        }
        match JournalRecord::decode(&cursor[..len]) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        offset += header_len + len;
    }

    (records, offset)
}
