use crate::actor::WeakActorClient;
use crate::api::StateMachine;
use crate::replica::client_requests::TrackedRequest;
use crate::replica::log_entry::Index;
use crate::replica::replica_api::{SnapshotCaptured, SnapshotRestored, SubmitOutput};
use crate::replica::term_store::Term;
use bytes::Bytes;
use tokio::sync::mpsc;

// Commands are executed strictly in the order they were sent, so a capture reflects exactly the
// entries handed over before it.
#[derive(Debug)]
enum Command {
    Apply {
        index: Index,
        term: Term,
        data: Bytes,
        reply: Option<TrackedRequest>,
    },
    Capture {
        index: Index,
        term: Term,
    },
    Restore {
        index: Index,
        state: Bytes,
    },
}

/// StateMachineHandle is the replica's end of the state machine task.
pub(crate) struct StateMachineHandle {
    logger: slog::Logger,
    sender: mpsc::UnboundedSender<Command>,
}

impl StateMachineHandle {
    pub(crate) fn apply(&self, index: Index, term: Term, data: Bytes, reply: Option<TrackedRequest>) {
        self.send(Command::Apply {
            index,
            term,
            data,
            reply,
        });
    }

    /// Result comes back as a `SnapshotCaptured` event.
    pub(crate) fn capture(&self, index: Index, term: Term) {
        self.send(Command::Capture { index, term });
    }

    /// Result comes back as a `SnapshotRestored` event.
    pub(crate) fn restore(&self, index: Index, state: Bytes) {
        self.send(Command::Restore { index, state });
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.sender.send(command) {
            slog::error!(self.logger, "State machine task has exited. Dropping {:?}", e.0);
        }
    }
}

/// StateMachineDriver owns the application's state machine on its own task, so that applying
/// entries and capturing snapshots never block the replica's event loop.
struct StateMachineDriver {
    logger: slog::Logger,
    state_machine: Box<dyn StateMachine>,
    receiver: mpsc::UnboundedReceiver<Command>,
    actor_client: WeakActorClient,
}

pub(crate) fn spawn(
    logger: slog::Logger,
    state_machine: Box<dyn StateMachine>,
    actor_client: WeakActorClient,
) -> StateMachineHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let driver = StateMachineDriver {
        logger: logger.clone(),
        state_machine,
        receiver: rx,
        actor_client,
    };
    tokio::task::spawn(driver.run());

    StateMachineHandle { logger, sender: tx }
}

impl StateMachineDriver {
    async fn run(mut self) {
        // Exits once the replica drops its handle.
        while let Some(command) = self.receiver.recv().await {
            match command {
                Command::Apply {
                    index,
                    term,
                    data,
                    reply,
                } => {
                    let output = self.state_machine.apply_entry(index.as_u64(), data);
                    if let Some(request) = reply {
                        request.callback.send(Ok(SubmitOutput { index, term, output }));
                    }
                }
                Command::Capture { index, term } => {
                    let result = self.state_machine.create_snapshot().map_err(|e| e.to_string());
                    if let Err(e) = &result {
                        slog::warn!(self.logger, "Snapshot capture at {:?} failed: {}", index, e);
                    }
                    let _ = self
                        .actor_client
                        .notify_snapshot_captured(SnapshotCaptured { index, term, result })
                        .await;
                }
                Command::Restore { index, state } => {
                    let result = self.state_machine.apply_snapshot(state).map_err(|e| e.to_string());
                    if let Err(e) = &result {
                        slog::warn!(self.logger, "Snapshot restore at {:?} failed: {}", index, e);
                    }
                    let _ = self
                        .actor_client
                        .notify_snapshot_restored(SnapshotRestored { index, result })
                        .await;
                }
            }
        }
        slog::debug!(self.logger, "State machine task exiting");
    }
}
