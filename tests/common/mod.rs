#![allow(dead_code)]

use bytes::Bytes;
use chrono::Utc;
use shard_raft::{
    InMemoryJournal, InMemoryNetwork, JournalConfig, RaftClient, RaftClientConfig, RaftElectionState, RaftMemberInfo,
    RaftOnDemandState, RaftOptions, RaftRole, StateMachine, StateMachineError, SubmitError, SubmitInput,
    SubmitOutput, TransportConfig,
};
use slog::Drain;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

pub const HEARTBEAT: Duration = Duration::from_millis(20);

pub fn fast_options() -> RaftOptions {
    RaftOptions {
        leader_heartbeat_duration: Some(HEARTBEAT),
        follower_min_timeout: Some(Duration::from_millis(150)),
        follower_max_timeout: Some(Duration::from_millis(300)),
        leader_append_entries_timeout: Some(Duration::from_millis(100)),
        ..RaftOptions::default()
    }
}

// ------- State machine -------

/// Entries applied to a `KvStateMachine`, shared with the test so it can look inside.
#[derive(Clone, Default)]
pub struct KvState {
    inner: Arc<Mutex<KvInner>>,
}

#[derive(Default)]
struct KvInner {
    values: BTreeMap<String, String>,
    applied: Vec<u64>,
    restored_snapshots: usize,
}

impl KvState {
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().values.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().values.len()
    }

    /// Indexes passed to `apply_entry()`, in call order.
    pub fn applied(&self) -> Vec<u64> {
        self.inner.lock().unwrap().applied.clone()
    }

    pub fn restored_snapshots(&self) -> usize {
        self.inner.lock().unwrap().restored_snapshots
    }
}

/// Entries are `key=value`. Applying one replies with the value it replaced.
pub struct KvStateMachine {
    state: KvState,
}

impl KvStateMachine {
    pub fn new(state: KvState) -> Self {
        KvStateMachine { state }
    }
}

impl StateMachine for KvStateMachine {
    fn apply_entry(&mut self, index: u64, data: Bytes) -> Bytes {
        let mut inner = self.state.inner.lock().unwrap();
        inner.applied.push(index);

        let text = String::from_utf8_lossy(&data).to_string();
        let (key, value) = match text.find('=') {
            Some(pos) => (text[..pos].to_string(), text[pos + 1..].to_string()),
            None => (text.clone(), String::new()),
        };
        let previous = inner.values.insert(key, value).unwrap_or_default();
        Bytes::from(previous)
    }

    fn create_snapshot(&mut self) -> Result<Bytes, StateMachineError> {
        let inner = self.state.inner.lock().unwrap();
        let lines: Vec<String> = inner.values.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        Ok(Bytes::from(lines.join("\n")))
    }

    fn apply_snapshot(&mut self, snapshot: Bytes) -> Result<(), StateMachineError> {
        let text = String::from_utf8(snapshot.to_vec()).map_err(|e| StateMachineError::new(e.to_string()))?;
        let mut values = BTreeMap::new();
        for line in text.lines().filter(|line| !line.is_empty()) {
            let pos = line
                .find('=')
                .ok_or_else(|| StateMachineError::new(format!("Bad line {:?}", line)))?;
            values.insert(line[..pos].to_string(), line[pos + 1..].to_string());
        }
        let mut inner = self.state.inner.lock().unwrap();
        inner.values = values;
        inner.restored_snapshots += 1;
        Ok(())
    }
}

// ------- In-memory cluster -------

pub struct TestNode {
    pub client: RaftClient,
    pub state: KvState,
}

/// A cluster of replicas talking over an `InMemoryNetwork`. Journals outlive the replicas, so a
/// stopped replica can be started again.
pub struct TestCluster {
    pub network: InMemoryNetwork,
    pub members: Vec<RaftMemberInfo>,
    pub options: RaftOptions,
    nodes: HashMap<String, TestNode>,
    journals: HashMap<String, InMemoryJournal>,
}

impl TestCluster {
    pub async fn start(ids: &[&str], options: RaftOptions) -> TestCluster {
        let members = ids.iter().map(|id| member(id)).collect();
        let mut cluster = TestCluster {
            network: InMemoryNetwork::new(),
            members,
            options,
            nodes: HashMap::new(),
            journals: HashMap::new(),
        };
        for id in ids {
            cluster.start_node(id).await;
        }

        cluster
    }

    /// Start (or restart) `id`. Ids that aren't cluster members join as non-voting servers.
    pub async fn start_node(&mut self, id: &str) {
        let journal = self.journals.entry(id.to_string()).or_default().clone();
        let state = KvState::default();
        let client = shard_raft::try_create_raft_client(RaftClientConfig {
            my_replica_id: id.to_string(),
            my_address: member(id).address,
            cluster_members: self.members.clone(),
            journal: JournalConfig::InMemory(journal),
            transport: TransportConfig::InMemory(self.network.clone()),
            state_machine: Box::new(KvStateMachine::new(state.clone())),
            info_logger: test_logger(),
            options: self.options.clone(),
        })
        .await
        .expect("create raft client");

        self.nodes.insert(id.to_string(), TestNode { client, state });
    }

    pub fn stop_node(&mut self, id: &str) {
        self.nodes.remove(id);
    }

    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes.get(id).unwrap_or_else(|| panic!("No node {}", id))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn state_of(&self, id: &str) -> RaftOnDemandState {
        self.node(id)
            .client
            .admin
            .get_on_demand_state()
            .await
            .expect("replica is running")
    }

    pub async fn states(&self) -> Vec<RaftOnDemandState> {
        let mut states = Vec::new();
        for id in self.ids() {
            states.push(self.state_of(&id).await);
        }
        states
    }

    /// Wait until one replica among `among` is leader and the others follow it.
    pub async fn wait_for_stable_leader(&self, among: &[&str], timeout: Duration) -> String {
        let cluster = self;
        wait_until(timeout, move || async move {
            let mut states = Vec::new();
            for id in among.iter() {
                states.push(cluster.state_of(id).await);
            }
            let leaders: Vec<&RaftOnDemandState> = states.iter().filter(|s| s.role == RaftRole::Leader).collect();
            if leaders.len() != 1 {
                return None;
            }
            let leader = leaders[0];
            let all_follow = states
                .iter()
                .all(|s| s.leader_id.as_deref() == Some(leader.replica_id.as_str()) && s.current_term == leader.current_term);
            if all_follow {
                Some(leader.replica_id.clone())
            } else {
                None
            }
        })
        .await
        .expect("Timeout waiting for a stable leader")
    }

    pub async fn submit(&self, id: &str, data: &str) -> Result<SubmitOutput, SubmitError> {
        self.node(id)
            .client
            .replicated_log
            .submit(SubmitInput {
                data: Bytes::from(data.to_string()),
                request_id: format!("{}@{}", data, id),
            })
            .await
    }

    /// Submit through whichever replica is leader, following redirects.
    pub async fn submit_anywhere(&self, data: &str, timeout: Duration) -> SubmitOutput {
        let deadline = Instant::now() + timeout;
        let mut target = self.ids()[0].clone();
        loop {
            assert!(Instant::now() < deadline, "Timeout submitting {:?}", data);
            match self.submit(&target, data).await {
                Ok(output) => return output,
                Err(SubmitError::NotLeader(leader)) if self.nodes.contains_key(&leader.replica_id) => {
                    target = leader.replica_id;
                }
                Err(_) => {
                    tokio::time::sleep(HEARTBEAT).await;
                    let ids = self.ids();
                    let next = ids.iter().position(|id| id == &target).map_or(0, |i| (i + 1) % ids.len());
                    target = ids[next].clone();
                }
            }
        }
    }

    /// Wait until every running replica in `ids` has applied `key` with `value`.
    pub async fn wait_for_value(&self, ids: &[&str], key: &str, value: &str, timeout: Duration) {
        let cluster = self;
        wait_until(timeout, move || async move {
            if ids.iter().all(|id| cluster.node(id).state.get(key).as_deref() == Some(value)) {
                Some(())
            } else {
                None
            }
        })
        .await
        .unwrap_or_else(|| panic!("Timeout waiting for {}={} on {:?}", key, value, ids));
    }
}

pub fn member(id: &str) -> RaftMemberInfo {
    // The in-memory network routes by id. Addresses only need to be distinct.
    let port = 20_000 + id.bytes().fold(0u16, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u16)) % 10_000;
    RaftMemberInfo {
        replica_id: id.to_string(),
        address: SocketAddr::from(([127, 0, 0, 1], port)),
    }
}

pub fn is_leader(state: &RaftElectionState) -> bool {
    matches!(state, RaftElectionState::Leader { .. })
}

/// Poll `check` until it returns `Some`, or give up after `timeout`.
pub async fn wait_until<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ------- Logging -------

/// Silent unless `RAFT_TEST_LOG` is set.
pub fn test_logger() -> slog::Logger {
    match std::env::var("RAFT_TEST_LOG") {
        Ok(_) => create_root_logger_for_stdout(),
        Err(_) => slog::Logger::root(slog::Discard, slog::o!()),
    }
}

pub fn create_root_logger_for_file(directory_prefix: &str, replica_id: &str) -> slog::Logger {
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let log_path = format!("{}/{}_{}_info.log", directory_prefix, replica_id, now);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .unwrap();

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}

pub fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
