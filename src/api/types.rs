use crate::replica;
use std::net::SocketAddr;

/// A member of the cluster the local replica is seeded with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftMemberInfo {
    pub replica_id: String,
    /// Where the member serves Raft RPCs.
    pub address: SocketAddr,
}

impl From<RaftMemberInfo> for replica::ReplicaMetadata {
    fn from(member_info: RaftMemberInfo) -> Self {
        Self::new(replica::ReplicaId::new(member_info.replica_id), member_info.address)
    }
}

/// The replica that was leader last time we heard. Retry the call there.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftLeaderInfo {
    pub replica_id: String,
    pub address: SocketAddr,
}

impl From<replica::LeaderRedirectInfo> for RaftLeaderInfo {
    fn from(internal_leader: replica::LeaderRedirectInfo) -> Self {
        Self {
            replica_id: internal_leader.replica_id.into_inner(),
            address: internal_leader.address,
        }
    }
}

/// A member of a server configuration, as committed in the log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftServerInfo {
    pub replica_id: String,
    pub address: SocketAddr,
    pub voting: bool,
}

impl From<&replica::ServerInfo> for RaftServerInfo {
    fn from(server: &replica::ServerInfo) -> Self {
        Self {
            replica_id: server.replica_id().as_str().to_string(),
            address: server.metadata().address(),
            voting: server.is_voting(),
        }
    }
}
