use crate::replica;
use crate::replica::{
    AddServerError, AddServerInput, AddServerOutput, AppendEntriesError, AppendEntriesInput, AppendEntriesOutput,
    AppendEntriesReplyFromPeer, ElectionTimeout, EntryPersisted, GetOnDemandStateError, GetSnapshotError,
    InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput, InstallSnapshotReplyFromPeer, LeaderTimerTick,
    MembershipDeadline, OnDemandState, RemoveServerError, RemoveServerInput, RemoveServerOutput, RequestVoteError,
    RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer, Snapshot, SnapshotCaptured, SnapshotRestored,
    SubmitError, SubmitInput, SubmitOutput, TimeoutNowError, TimeoutNowInput, TimeoutNowOutput,
    TimeoutNowReplyFromPeer, TransferDeadline, TransferLeadershipError, TransferLeadershipOutput,
};
use std::error::Error;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

// Disk interaction is synchronous from the actor's point of view, except journal flushes which are
// batched: the flush is requested by a spawned task and comes back as an `EntryPersisted` event.
//
// The application state machine lives on its own task. Entries are handed over in order and the
// results come back via the callbacks stored in the client request tracker.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Append to log, track the request until applied.
    // Candidate/Follower: Redirect or reject.
    Submit(SubmitInput, Callback<SubmitOutput, SubmitError>),

    // Any state: Grant vote if applicable (includes write to disk). Step down on higher term.
    RequestVote(RequestVoteInput, Callback<RequestVoteOutput, RequestVoteError>),

    // Candidate: Count vote, maybe become leader. Others: discard.
    RequestVoteReplyFromPeer(RequestVoteReplyFromPeer),

    // Any state: Step down if applicable. Reconcile log, write to disk, then respond. Reset timeout.
    AppendEntries(AppendEntriesInput, Callback<AppendEntriesOutput, AppendEntriesError>),

    // Leader: Update replication progress, advance commit index, apply. Others: discard.
    AppendEntriesReplyFromPeer(AppendEntriesReplyFromPeer),

    // Any state: Replace state with the leader's snapshot. Replies once the state machine restored it.
    InstallSnapshot(InstallSnapshotInput, Callback<InstallSnapshotOutput, InstallSnapshotError>),

    // Leader: Advance peer progress past the snapshot. Others: discard.
    InstallSnapshotReplyFromPeer(InstallSnapshotReplyFromPeer),

    // Voting follower: Start an election right now.
    TimeoutNow(TimeoutNowInput, Callback<TimeoutNowOutput, TimeoutNowError>),

    // Leader transferring leadership: Step down.
    TimeoutNowReplyFromPeer(TimeoutNowReplyFromPeer),

    // Leader: Send AppendEntries (or InstallSnapshot) to one peer.
    LeaderTimer(LeaderTimerTick),

    // Follower/Candidate: Start a new election, if the timer is still current.
    FollowerTimeout(ElectionTimeout),

    // Flush buffered journal writes.
    EntryPersisted(EntryPersisted),

    // Results from the state machine task.
    SnapshotCaptured(SnapshotCaptured),
    SnapshotRestored(SnapshotRestored),

    // Management.
    AddServer(AddServerInput, Callback<AddServerOutput, AddServerError>),
    RemoveServer(RemoveServerInput, Callback<RemoveServerOutput, RemoveServerError>),
    MembershipDeadline(MembershipDeadline),
    TransferLeadership(Callback<TransferLeadershipOutput, TransferLeadershipError>),
    TransferDeadline(TransferDeadline),
    GetOnDemandState(Callback<OnDemandState, GetOnDemandStateError>),
    GetSnapshot(Callback<Snapshot, GetSnapshotError>),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn new(sender: oneshot::Sender<Result<O, E>>) -> Self {
        Callback(sender)
    }

    pub(crate) fn send(self, message: Result<O, E>) {
        // Caller may have given up waiting. That's fine.
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Replica task has exited")]
pub(crate) struct ActorExited;

/// ActorClient holds the strong end of the actor's queue. The event loop runs until every
/// ActorClient is dropped.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);

        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn submit(&self, input: SubmitInput) -> Result<SubmitOutput, SubmitError> {
        self.call(|cb| Event::Submit(input, cb), SubmitError::ActorExited).await
    }

    pub(crate) async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        self.call(|cb| Event::RequestVote(input, cb), RequestVoteError::ActorExited)
            .await
    }

    pub(crate) async fn append_entries(
        &self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        self.call(|cb| Event::AppendEntries(input, cb), AppendEntriesError::ActorExited)
            .await
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        self.call(|cb| Event::InstallSnapshot(input, cb), InstallSnapshotError::ActorExited)
            .await
    }

    pub(crate) async fn timeout_now(&self, input: TimeoutNowInput) -> Result<TimeoutNowOutput, TimeoutNowError> {
        self.call(|cb| Event::TimeoutNow(input, cb), TimeoutNowError::ActorExited)
            .await
    }

    pub(crate) async fn add_server(&self, input: AddServerInput) -> Result<AddServerOutput, AddServerError> {
        self.call(|cb| Event::AddServer(input, cb), AddServerError::ActorExited)
            .await
    }

    pub(crate) async fn remove_server(
        &self,
        input: RemoveServerInput,
    ) -> Result<RemoveServerOutput, RemoveServerError> {
        self.call(|cb| Event::RemoveServer(input, cb), RemoveServerError::ActorExited)
            .await
    }

    pub(crate) async fn transfer_leadership(&self) -> Result<TransferLeadershipOutput, TransferLeadershipError> {
        self.call(Event::TransferLeadership, TransferLeadershipError::ActorExited)
            .await
    }

    pub(crate) async fn get_on_demand_state(&self) -> Result<OnDemandState, GetOnDemandStateError> {
        self.call(Event::GetOnDemandState, GetOnDemandStateError::ActorExited)
            .await
    }

    pub(crate) async fn get_snapshot(&self) -> Result<Snapshot, GetSnapshotError> {
        self.call(Event::GetSnapshot, GetSnapshotError::ActorExited).await
    }

    async fn call<O, E, F>(&self, to_event: F, actor_exited: E) -> Result<O, E>
    where
        O: Debug,
        E: Error,
        F: FnOnce(Callback<O, E>) -> Event,
    {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(to_event(Callback(tx))).await.is_err() {
            return Err(actor_exited);
        }

        match rx.await {
            Ok(result) => result,
            // Actor dropped the callback without replying. It only does that while exiting.
            Err(_) => Err(actor_exited),
        }
    }

    async fn notify(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// WeakActorClient is held by everything the actor itself owns (timers, RPC server, spawned peer
/// calls), so that those don't keep the actor alive.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    fn upgrade(&self) -> Result<ActorClient, ActorExited> {
        self.sender
            .upgrade()
            .map(|sender| ActorClient { sender })
            .ok_or(ActorExited)
    }

    pub(crate) async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        match self.upgrade() {
            Ok(client) => client.request_vote(input).await,
            Err(_) => Err(RequestVoteError::ActorExited),
        }
    }

    pub(crate) async fn append_entries(
        &self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        match self.upgrade() {
            Ok(client) => client.append_entries(input).await,
            Err(_) => Err(AppendEntriesError::ActorExited),
        }
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        match self.upgrade() {
            Ok(client) => client.install_snapshot(input).await,
            Err(_) => Err(InstallSnapshotError::ActorExited),
        }
    }

    pub(crate) async fn timeout_now(&self, input: TimeoutNowInput) -> Result<TimeoutNowOutput, TimeoutNowError> {
        match self.upgrade() {
            Ok(client) => client.timeout_now(input).await,
            Err(_) => Err(TimeoutNowError::ActorExited),
        }
    }

    pub(crate) async fn leader_timer(&self, tick: LeaderTimerTick) -> Result<(), ActorExited> {
        self.upgrade()?.notify(Event::LeaderTimer(tick)).await
    }

    pub(crate) async fn follower_timeout(&self, timeout: ElectionTimeout) -> Result<(), ActorExited> {
        self.upgrade()?.notify(Event::FollowerTimeout(timeout)).await
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        reply: RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.upgrade()?.notify(Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        reply: AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.upgrade()?.notify(Event::AppendEntriesReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_install_snapshot_reply_from_peer(
        &self,
        reply: InstallSnapshotReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.upgrade()?
            .notify(Event::InstallSnapshotReplyFromPeer(reply))
            .await
    }

    pub(crate) async fn notify_timeout_now_reply_from_peer(
        &self,
        reply: TimeoutNowReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.upgrade()?.notify(Event::TimeoutNowReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_entry_persisted(&self, event: EntryPersisted) -> Result<(), ActorExited> {
        self.upgrade()?.notify(Event::EntryPersisted(event)).await
    }

    pub(crate) async fn notify_snapshot_captured(&self, event: SnapshotCaptured) -> Result<(), ActorExited> {
        self.upgrade()?.notify(Event::SnapshotCaptured(event)).await
    }

    pub(crate) async fn notify_snapshot_restored(&self, event: SnapshotRestored) -> Result<(), ActorExited> {
        self.upgrade()?.notify(Event::SnapshotRestored(event)).await
    }

    pub(crate) async fn notify_membership_deadline(&self, event: MembershipDeadline) -> Result<(), ActorExited> {
        self.upgrade()?.notify(Event::MembershipDeadline(event)).await
    }

    pub(crate) async fn notify_transfer_deadline(&self, event: TransferDeadline) -> Result<(), ActorExited> {
        self.upgrade()?.notify(Event::TransferDeadline(event)).await
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica,
}

impl ReplicaActor {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        slog::info!(self.logger, "Replica event loop starting");
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }
        slog::info!(self.logger, "Replica event loop has exited");
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and/or come back as an event to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Submit(input, callback) => {
                self.replica.handle_submit(input, callback);
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(reply) => {
                self.replica.handle_request_vote_reply_from_peer(reply);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::AppendEntriesReplyFromPeer(reply) => {
                self.replica.handle_append_entries_reply_from_peer(reply);
            }
            Event::InstallSnapshot(input, callback) => {
                self.replica.server_handle_install_snapshot(input, callback);
            }
            Event::InstallSnapshotReplyFromPeer(reply) => {
                self.replica.handle_install_snapshot_reply_from_peer(reply);
            }
            Event::TimeoutNow(input, callback) => {
                let result = self.replica.server_handle_timeout_now(input);
                callback.send(result);
            }
            Event::TimeoutNowReplyFromPeer(reply) => {
                self.replica.handle_timeout_now_reply_from_peer(reply);
            }
            Event::LeaderTimer(tick) => {
                self.replica.handle_leader_timer(tick);
            }
            Event::FollowerTimeout(timeout) => {
                self.replica.handle_follower_timeout(timeout);
            }
            Event::EntryPersisted(event) => {
                self.replica.handle_entry_persisted(event);
            }
            Event::SnapshotCaptured(event) => {
                self.replica.handle_snapshot_captured(event);
            }
            Event::SnapshotRestored(event) => {
                self.replica.handle_snapshot_restored(event);
            }
            Event::AddServer(input, callback) => {
                self.replica.handle_add_server(input, callback);
            }
            Event::RemoveServer(input, callback) => {
                self.replica.handle_remove_server(input, callback);
            }
            Event::MembershipDeadline(event) => {
                self.replica.handle_membership_deadline(event);
            }
            Event::TransferLeadership(callback) => {
                self.replica.handle_transfer_leadership(callback);
            }
            Event::TransferDeadline(event) => {
                self.replica.handle_transfer_deadline(event);
            }
            Event::GetOnDemandState(callback) => {
                callback.send(Ok(self.replica.on_demand_state()));
            }
            Event::GetSnapshot(callback) => {
                self.replica.handle_get_snapshot(callback);
            }
        }
    }
}
