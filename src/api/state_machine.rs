use bytes::Bytes;

/// StateMachine is the application specific view of applying the replicated log in sequential
/// consistent order.
///
/// All methods are called from one dedicated task, one at a time, in log order.
pub trait StateMachine: Send + 'static {
    /// apply_entry is called only when it's guaranteed that the provided entry has been committed
    /// (i.e. replicated to a majority). Because of this guarantee, you will never need to reverse
    /// an entry once you've been asked to apply it.
    ///
    /// Entries are applied at-least-once: after a restart, entries past the latest snapshot are
    /// applied again. Your impl must be idempotent per `index`.
    ///
    /// The returned bytes are handed back to the client that submitted the entry, if that client
    /// is still connected to the leader that appended it.
    fn apply_entry(&mut self, index: u64, data: Bytes) -> Bytes;

    /// Serialize the state reached by every entry applied so far.
    fn create_snapshot(&mut self) -> Result<Bytes, StateMachineError>;

    /// Replace all state with a snapshot previously produced by `create_snapshot()` (possibly on
    /// another member).
    ///
    /// This must be all-or-nothing. On `Err` the existing state has to be left exactly as it was:
    /// the install is dropped and later entries are applied on top of the state you already had.
    fn apply_snapshot(&mut self, snapshot: Bytes) -> Result<(), StateMachineError>;
}

#[derive(Debug, thiserror::Error)]
#[error("State machine error: {message}")]
pub struct StateMachineError {
    message: String,
}

impl StateMachineError {
    pub fn new(message: impl Into<String>) -> Self {
        StateMachineError {
            message: message.into(),
        }
    }
}
