//! Conversions between the core's types and their protobuf representations. Shared by the journal
//! (records on disk), the RPC server (inbound) and the gRPC transport (outbound).
use crate::grpc::{
    proto_log_entry, ProtoLogEntry, ProtoNoop, ProtoServerConfiguration, ProtoServerInfo, ProtoSnapshot,
    ProtoTermInfo,
};
use crate::replica::{
    EntryPayload, Index, LogEntry, LogPosition, ReplicaId, ReplicaMetadata, ServerConfiguration, ServerInfo,
    Snapshot, Term, TermInfo,
};
use bytes::Bytes;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub(crate) enum WireError {
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),
    #[error("Invalid socket address '{0}'")]
    InvalidAddress(String),
    #[error("Log position has term {term} and index {index}, only one of them is zero")]
    InvalidLogPosition { term: u64, index: u64 },
    #[error("Log entry index 0 is reserved")]
    ZeroIndexEntry,
}

pub(crate) fn log_position(term: u64, index: u64) -> Result<LogPosition, WireError> {
    match (term, index) {
        (0, 0) => Ok(LogPosition::default()),
        (0, _) | (_, 0) => Err(WireError::InvalidLogPosition { term, index }),
        (term, index) => Ok(LogPosition::new(Term::new(term), Index::new(index))),
    }
}

// ------- LogEntry -------

pub(crate) fn log_entry_to_proto(entry: &LogEntry) -> ProtoLogEntry {
    let payload = match &entry.payload {
        EntryPayload::Client(data) => proto_log_entry::Payload::ClientData(data.to_vec()),
        EntryPayload::Noop => proto_log_entry::Payload::Noop(ProtoNoop {}),
        EntryPayload::ServerConfiguration(config) => {
            proto_log_entry::Payload::ServerConfiguration(configuration_to_proto(config))
        }
    };

    ProtoLogEntry {
        index: entry.index.as_u64(),
        term: entry.term.as_u64(),
        payload: Some(payload),
    }
}

pub(crate) fn log_entry_from_proto(proto: ProtoLogEntry) -> Result<LogEntry, WireError> {
    if proto.index == 0 {
        return Err(WireError::ZeroIndexEntry);
    }

    let payload = match proto.payload {
        Some(proto_log_entry::Payload::ClientData(data)) => EntryPayload::Client(Bytes::from(data)),
        Some(proto_log_entry::Payload::Noop(_)) => EntryPayload::Noop,
        Some(proto_log_entry::Payload::ServerConfiguration(config)) => {
            EntryPayload::ServerConfiguration(configuration_from_proto(config)?)
        }
        None => return Err(WireError::MissingField("payload")),
    };

    Ok(LogEntry::new(Index::new(proto.index), Term::new(proto.term), payload))
}

pub(crate) fn log_entries_from_proto(protos: Vec<ProtoLogEntry>) -> Result<Vec<LogEntry>, WireError> {
    protos.into_iter().map(log_entry_from_proto).collect()
}

// ------- ServerConfiguration -------

pub(crate) fn configuration_to_proto(config: &ServerConfiguration) -> ProtoServerConfiguration {
    ProtoServerConfiguration {
        servers: config
            .servers()
            .iter()
            .map(|server| ProtoServerInfo {
                replica_id: server.replica_id().as_str().to_string(),
                address: server.metadata().address().to_string(),
                voting: server.is_voting(),
            })
            .collect(),
    }
}

pub(crate) fn configuration_from_proto(proto: ProtoServerConfiguration) -> Result<ServerConfiguration, WireError> {
    let mut servers = Vec::with_capacity(proto.servers.len());
    for server in proto.servers {
        let address: SocketAddr = server
            .address
            .parse()
            .map_err(|_| WireError::InvalidAddress(server.address.clone()))?;
        servers.push(ServerInfo::new(
            ReplicaMetadata::new(ReplicaId::new(server.replica_id), address),
            server.voting,
        ));
    }

    Ok(ServerConfiguration::new(servers))
}

// ------- TermInfo -------

pub(crate) fn term_info_to_proto(info: &TermInfo) -> ProtoTermInfo {
    ProtoTermInfo {
        current_term: info.current_term.as_u64(),
        voted_for: info
            .voted_for
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_default(),
    }
}

pub(crate) fn term_info_from_proto(proto: ProtoTermInfo) -> TermInfo {
    let voted_for = if proto.voted_for.is_empty() {
        None
    } else {
        Some(ReplicaId::new(proto.voted_for))
    };

    TermInfo::new(Term::new(proto.current_term), voted_for)
}

// ------- Snapshot -------

pub(crate) fn snapshot_to_proto(snapshot: &Snapshot) -> ProtoSnapshot {
    ProtoSnapshot {
        state: snapshot.state.to_vec(),
        last_included_index: snapshot.last_included_index.as_u64(),
        last_included_term: snapshot.last_included_term.as_u64(),
        last_applied_index: snapshot.last_applied_index.as_u64(),
        last_applied_term: snapshot.last_applied_term.as_u64(),
        unapplied_entries: snapshot.unapplied_entries.iter().map(log_entry_to_proto).collect(),
        term_info: Some(term_info_to_proto(&snapshot.term_info)),
        server_configuration: Some(configuration_to_proto(&snapshot.server_configuration)),
    }
}

pub(crate) fn snapshot_from_proto(proto: ProtoSnapshot) -> Result<Snapshot, WireError> {
    let term_info = proto
        .term_info
        .map(term_info_from_proto)
        .ok_or(WireError::MissingField("term_info"))?;
    let server_configuration = match proto.server_configuration {
        Some(config) => configuration_from_proto(config)?,
        None => return Err(WireError::MissingField("server_configuration")),
    };

    Ok(Snapshot {
        state: Bytes::from(proto.state),
        last_included_index: Index::new(proto.last_included_index),
        last_included_term: Term::new(proto.last_included_term),
        last_applied_index: Index::new(proto.last_applied_index),
        last_applied_term: Term::new(proto.last_applied_term),
        unapplied_entries: log_entries_from_proto(proto.unapplied_entries)?,
        term_info,
        server_configuration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration() -> ServerConfiguration {
        ServerConfiguration::new(vec![
            ServerInfo::new(
                ReplicaMetadata::new(ReplicaId::new("a"), "127.0.0.1:7001".parse().unwrap()),
                true,
            ),
            ServerInfo::new(
                ReplicaMetadata::new(ReplicaId::new("b"), "[::1]:7002".parse().unwrap()),
                false,
            ),
        ])
    }

    #[test]
    fn log_position_rejects_half_zero() {
        assert_eq!(log_position(0, 0).unwrap(), LogPosition::default());
        assert!(log_position(0, 4).is_err());
        assert!(log_position(4, 0).is_err());
        assert_eq!(
            log_position(2, 9).unwrap(),
            LogPosition::new(Term::new(2), Index::new(9))
        );
    }

    #[test]
    fn configuration_entry_survives_the_wire() {
        let entry = LogEntry::new(
            Index::new(3),
            Term::new(2),
            EntryPayload::ServerConfiguration(configuration()),
        );

        assert_eq!(log_entry_from_proto(log_entry_to_proto(&entry)).unwrap(), entry);
    }

    #[test]
    fn malformed_entries_are_rejected() {
        let missing_payload = ProtoLogEntry {
            index: 1,
            term: 1,
            payload: None,
        };
        assert!(matches!(
            log_entry_from_proto(missing_payload),
            Err(WireError::MissingField("payload"))
        ));

        let zero_index = ProtoLogEntry {
            index: 0,
            term: 1,
            payload: Some(proto_log_entry::Payload::Noop(ProtoNoop {})),
        };
        assert!(matches!(log_entry_from_proto(zero_index), Err(WireError::ZeroIndexEntry)));

        let bad_address = ProtoServerConfiguration {
            servers: vec![ProtoServerInfo {
                replica_id: "a".into(),
                address: "not-an-address".into(),
                voting: true,
            }],
        };
        assert!(matches!(
            configuration_from_proto(bad_address),
            Err(WireError::InvalidAddress(_))
        ));
    }

    #[test]
    fn empty_vote_means_no_vote() {
        let info = TermInfo::new(Term::new(4), None);
        let proto = term_info_to_proto(&info);
        assert_eq!(proto.voted_for, "");
        assert_eq!(term_info_from_proto(proto), info);
    }
}
