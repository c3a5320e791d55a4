//! Timers that feed the replica's actor queue. Each timer runs as its own task and lives exactly
//! as long as the handle the election state holds for it.

mod deadline;
mod election_timer;
mod heartbeat_timer;
mod time;

#[cfg(test)]
mod test_utils;

pub(super) use election_timer::ElectionTimer;
pub(super) use heartbeat_timer::HeartbeatTimer;
