use crate::replica::{ReplicaOptions, SnapshotPolicy};
use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs. Anything left `None` gets a default that suits a LAN cluster.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    /// Take a snapshot once this many applied entries accumulate past the previous one.
    pub snapshot_batch_count: Option<u64>,
    /// Take a snapshot once the in-memory log holds this many bytes.
    pub snapshot_data_threshold: Option<usize>,
    pub max_entries_per_append_entries: Option<usize>,
    pub leadership_transfer_timeout: Option<Duration>,
    /// How long a new server gets to catch up before the AddServer is abandoned.
    pub membership_catch_up_timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub snapshot_batch_count: u64,
    pub snapshot_data_threshold: usize,
    pub max_entries_per_append_entries: usize,
    pub leadership_transfer_timeout: Duration,
    pub membership_catch_up_timeout: Duration,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.snapshot_batch_count == 0 || self.snapshot_data_threshold == 0 {
            return Err("Snapshot thresholds must be greater than zero");
        }
        if self.max_entries_per_append_entries == 0 {
            return Err("AppendEntries must be allowed to carry at least one entry");
        }
        if self.leadership_transfer_timeout.as_millis() == 0 || self.membership_catch_up_timeout.as_millis() == 0 {
            return Err("Leadership transfer and catch-up timeouts must be greater than zero");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let follower_max_timeout = options.follower_max_timeout.unwrap_or(Duration::from_millis(1500));
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout,
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            snapshot_batch_count: options.snapshot_batch_count.unwrap_or(20_000),
            snapshot_data_threshold: options.snapshot_data_threshold.unwrap_or(16 * 1024 * 1024),
            max_entries_per_append_entries: options.max_entries_per_append_entries.unwrap_or(64),
            leadership_transfer_timeout: options
                .leadership_transfer_timeout
                .unwrap_or(follower_max_timeout * 2),
            membership_catch_up_timeout: options
                .membership_catch_up_timeout
                .unwrap_or(follower_max_timeout * 10),
        };

        values.validate()?;
        Ok(values)
    }
}

impl From<RaftOptionsValidated> for ReplicaOptions {
    fn from(options: RaftOptionsValidated) -> Self {
        ReplicaOptions {
            leader_heartbeat_duration: options.leader_heartbeat_duration,
            follower_min_timeout: options.follower_min_timeout,
            follower_max_timeout: options.follower_max_timeout,
            rpc_timeout: options.leader_append_entries_timeout,
            max_entries_per_request: options.max_entries_per_append_entries,
            snapshot_policy: SnapshotPolicy {
                batch_count: options.snapshot_batch_count,
                data_threshold: options.snapshot_data_threshold,
            },
            catch_up_timeout: options.membership_catch_up_timeout,
            leadership_transfer_timeout: options.leadership_transfer_timeout,
        }
    }
}
