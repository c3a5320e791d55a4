use crate::api::admin::RaftAdmin;
use crate::api::event_bus::RaftEventListener;
use crate::api::replicated_log::ReplicatedLog;

/// RaftClient is the handle to a local raft replica. The replica keeps running for as long as
/// `replicated_log` or `admin` (or a clone of either) is alive.
pub struct RaftClient {
    pub replicated_log: ReplicatedLog,
    pub admin: RaftAdmin,
    pub event_listener: RaftEventListener,
}
