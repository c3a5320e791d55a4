mod common;

use bytes::Bytes;
use common::{fast_options, test_logger, wait_until, KvState, KvStateMachine};
use shard_raft::{
    JournalConfig, RaftClient, RaftClientConfig, RaftMemberInfo, RaftRole, SubmitError, SubmitInput, TransportConfig,
};
use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use tokio::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(15);

fn members(port_base: u16, count: u16) -> Vec<RaftMemberInfo> {
    (0..count)
        .map(|i| RaftMemberInfo {
            replica_id: format!("replica-{}", i + 1),
            address: SocketAddr::from(([127, 0, 0, 1], port_base + i)),
        })
        .collect()
}

async fn start(member: &RaftMemberInfo, cluster: &[RaftMemberInfo], directory: &Path) -> (RaftClient, KvState) {
    let state = KvState::default();
    let client = shard_raft::try_create_raft_client(RaftClientConfig {
        my_replica_id: member.replica_id.clone(),
        my_address: member.address,
        cluster_members: cluster.to_vec(),
        journal: JournalConfig::File {
            directory: directory.to_path_buf(),
        },
        transport: TransportConfig::Grpc,
        state_machine: Box::new(KvStateMachine::new(state.clone())),
        info_logger: test_logger(),
        options: fast_options(),
    })
    .await
    .expect("create raft client");

    (client, state)
}

async fn find_leader(clients: &HashMap<String, (RaftClient, KvState)>) -> String {
    wait_until(TIMEOUT, || async {
        for (id, (client, _)) in clients.iter() {
            if let Ok(state) = client.admin.get_on_demand_state().await {
                if state.role == RaftRole::Leader {
                    return Some(id.clone());
                }
            }
        }
        None
    })
    .await
    .expect("Timeout waiting for leader election")
}

#[tokio::test]
async fn grpc_cluster_replicates_over_localhost() -> Result<(), Box<dyn Error>> {
    let directory = tempfile::tempdir()?;
    let cluster = members(47_311, 3);

    let mut clients = HashMap::new();
    for member in cluster.iter() {
        clients.insert(member.replica_id.clone(), start(member, &cluster, directory.path()).await);
    }

    // Followers may redirect while an election is still settling, so retry until the write lands.
    let (leader_id, output) = wait_until(TIMEOUT, || async {
        let leader_id = find_leader(&clients).await;
        let (leader, _) = &clients[&leader_id];
        match leader
            .replicated_log
            .submit(SubmitInput {
                data: Bytes::from("hello=world"),
                request_id: "hello".into(),
            })
            .await
        {
            Ok(output) => Some((leader_id, output)),
            Err(SubmitError::NotLeader(_)) | Err(SubmitError::NoLeader) => None,
            Err(e) => panic!("Submit failed: {:?}", e),
        }
    })
    .await
    .expect("Entry committed");
    assert!(output.index > 0);

    wait_until(TIMEOUT, || async {
        if clients.values().all(|(_, state)| state.get("hello").as_deref() == Some("world")) {
            Some(())
        } else {
            None
        }
    })
    .await
    .expect("Every replica applies the entry");

    // Redirects carry the leader's RPC address.
    for (id, (client, _)) in clients.iter().filter(|(id, _)| *id != &leader_id) {
        match client
            .replicated_log
            .submit(SubmitInput {
                data: Bytes::from("x=1"),
                request_id: "x".into(),
            })
            .await
        {
            Err(SubmitError::NotLeader(leader)) => {
                let expected = cluster.iter().find(|m| m.replica_id == leader_id).map(|m| m.address);
                assert_eq!(Some(leader.address), expected, "redirect from {}", id);
            }
            Err(SubmitError::NoLeader) => {}
            other => panic!("Expected redirect from {}, got {:?}", id, other),
        }
    }

    // Each replica keeps its own journal file in the shared directory.
    let files = std::fs::read_dir(directory.path())?.count();
    assert!(files >= cluster.len());

    Ok(())
}
