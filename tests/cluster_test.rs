mod common;

use bytes::Bytes;
use common::{fast_options, is_leader, member, wait_until, TestCluster};
use shard_raft::{
    AddServerError, AddServerInput, RaftElectionState, RaftEvent, RaftOptions, RaftRole, RemoveServerError,
    RemoveServerInput, SubmitError, SubmitInput,
};
use std::error::Error;
use tokio::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn leader_election() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(&["a", "b", "c", "d", "e"], fast_options()).await;
    let leader_id = cluster
        .wait_for_stable_leader(&["a", "b", "c", "d", "e"], TIMEOUT)
        .await;

    let states = cluster.states().await;
    let term = states.iter().map(|s| s.current_term).max().unwrap_or_default();
    let leaders_in_term = states
        .iter()
        .filter(|s| s.role == RaftRole::Leader && s.current_term == term)
        .count();
    assert_eq!(leaders_in_term, 1);

    // Everybody learns about the leader through the event listener too.
    for id in cluster.ids() {
        match cluster.node(&id).client.event_listener.current_election_state() {
            RaftElectionState::Leader { term: leader_term } => {
                assert_eq!(id, leader_id);
                assert_eq!(leader_term, term);
            }
            RaftElectionState::Follower(leader) => {
                assert_eq!(leader.replica_id, leader_id);
                assert_eq!(leader.address, member(&leader_id).address);
            }
            other => panic!("{} is in unexpected state {:?}", id, other),
        }
    }

    Ok(())
}

#[tokio::test]
async fn event_listener_reports_leadership() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(&["solo"], fast_options()).await;
    let mut listener = cluster.node("solo").client.event_listener.clone();

    let event = tokio::time::timeout(TIMEOUT, async {
        loop {
            match listener.next_event().await {
                Some(RaftEvent::Election(state)) if is_leader(&state) => return state,
                Some(_) => continue,
                None => panic!("Replica exited"),
            }
        }
    })
    .await?;
    assert_eq!(event, RaftElectionState::Leader { term: 1 });

    Ok(())
}

#[tokio::test]
async fn commit_and_apply_on_every_member() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(&["a", "b", "c"], fast_options()).await;
    let leader_id = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;

    let first = cluster.submit(&leader_id, "greeting=hello").await?;
    assert_eq!(first.output, Bytes::new());
    let second = cluster.submit(&leader_id, "greeting=world").await?;
    assert_eq!(second.output, Bytes::from("hello"));
    assert_eq!(second.index, first.index + 1);
    assert_eq!(second.term, first.term);

    cluster
        .wait_for_value(&["a", "b", "c"], "greeting", "world", TIMEOUT)
        .await;

    // Each member applies each entry exactly once, in order.
    for id in cluster.ids() {
        let applied = cluster.node(&id).state.applied();
        assert_eq!(applied, vec![first.index, second.index], "{}", id);
    }

    let leader_state = cluster.state_of(&leader_id).await;
    assert!(leader_state.commit_index >= second.index);
    assert_eq!(leader_state.peers.len(), 2);
    assert!(leader_state.peers.iter().all(|peer| peer.voting));

    Ok(())
}

#[tokio::test]
async fn followers_redirect_to_leader() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(&["a", "b", "c"], fast_options()).await;
    let leader_id = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;

    for id in cluster.ids().into_iter().filter(|id| id != &leader_id) {
        match cluster.submit(&id, "x=1").await {
            Err(SubmitError::NotLeader(leader)) => {
                assert_eq!(leader.replica_id, leader_id);
                assert_eq!(leader.address, member(&leader_id).address);
            }
            other => panic!("Expected redirect from {}, got {:?}", id, other),
        }
    }

    Ok(())
}

#[tokio::test]
async fn new_leader_after_leader_stops() -> Result<(), Box<dyn Error>> {
    let mut cluster = TestCluster::start(&["a", "b", "c"], fast_options()).await;
    let old_leader = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;
    let old_term = cluster.state_of(&old_leader).await.current_term;
    cluster.submit(&old_leader, "before=1").await?;

    cluster.stop_node(&old_leader);
    let survivors: Vec<String> = cluster.ids();
    let survivors: Vec<&str> = survivors.iter().map(|s| s.as_str()).collect();
    let new_leader = cluster.wait_for_stable_leader(&survivors, TIMEOUT).await;
    assert_ne!(new_leader, old_leader);

    let new_state = cluster.state_of(&new_leader).await;
    assert!(new_state.current_term > old_term);

    // Committed entries survive the change of leadership.
    cluster.submit(&new_leader, "after=2").await?;
    cluster.wait_for_value(&survivors, "before", "1", TIMEOUT).await;
    cluster.wait_for_value(&survivors, "after", "2", TIMEOUT).await;

    // The old leader comes back as a follower and catches up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.start_node(&old_leader).await;
    cluster.wait_for_value(&[old_leader.as_str()], "after", "2", TIMEOUT).await;
    assert_eq!(cluster.state_of(&old_leader).await.role, RaftRole::Follower);

    Ok(())
}

#[tokio::test]
async fn uncommitted_entries_of_a_deposed_leader_are_overwritten() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(&["a", "b", "c"], fast_options()).await;
    let old_leader = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;
    cluster.submit(&old_leader, "k=committed").await?;
    cluster.wait_for_value(&["a", "b", "c"], "k", "committed", TIMEOUT).await;

    // The old leader still thinks it has a quorum, so it accepts the write but can't commit it.
    cluster.network.isolate(&old_leader);
    let replicated_log = cluster.node(&old_leader).client.replicated_log.clone();
    let stale_write = tokio::spawn(async move {
        replicated_log
            .submit(SubmitInput {
                data: Bytes::from("k=lost"),
                request_id: "lost".into(),
            })
            .await
    });

    let majority: Vec<String> = cluster.ids().into_iter().filter(|id| id != &old_leader).collect();
    let majority: Vec<&str> = majority.iter().map(|s| s.as_str()).collect();
    let new_leader = cluster.wait_for_stable_leader(&majority, TIMEOUT).await;
    cluster.submit(&new_leader, "k=new").await?;

    cluster.network.heal();
    cluster.wait_for_value(&["a", "b", "c"], "k", "new", TIMEOUT).await;

    let result = tokio::time::timeout(TIMEOUT, stale_write).await??;
    assert!(matches!(result, Err(SubmitError::NotCommitted)), "{:?}", result);

    // Logs converge on the new leader's.
    let states = cluster.states().await;
    for state in states.iter() {
        assert_eq!(state.last_log_index, states[0].last_log_index);
        assert_eq!(state.last_log_term, states[0].last_log_term);
    }
    assert_eq!(cluster.node(&old_leader).state.get("k").as_deref(), Some("new"));

    Ok(())
}

#[tokio::test]
async fn leader_without_quorum_rejects_writes() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(&["a", "b", "c"], fast_options()).await;
    let leader_id = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;

    for id in cluster.ids().into_iter().filter(|id| id != &leader_id) {
        cluster.network.isolate(&id);
    }
    // Longer than the maximum election timeout.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(matches!(
        cluster.submit(&leader_id, "x=1").await,
        Err(SubmitError::QuorumUnavailable)
    ));

    cluster.network.heal();
    let output = cluster.submit_anywhere("x=2", TIMEOUT).await;
    assert!(output.index > 0);
    cluster.wait_for_value(&["a", "b", "c"], "x", "2", TIMEOUT).await;

    Ok(())
}

#[tokio::test]
async fn add_and_remove_server() -> Result<(), Box<dyn Error>> {
    let mut cluster = TestCluster::start(&["a", "b", "c"], fast_options()).await;
    let leader_id = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;
    cluster.submit(&leader_id, "before=1").await?;

    // "d" isn't part of the initial cluster, so it waits to be added.
    cluster.start_node("d").await;
    let d_state = cluster.state_of("d").await;
    assert!(!d_state.voting);
    assert_eq!(d_state.role, RaftRole::Follower);

    let admin = cluster.node(&leader_id).client.admin.clone();
    let output = admin
        .add_server(AddServerInput {
            replica_id: "d".into(),
            address: member("d").address,
        })
        .await?;
    assert!(output.configuration_index > 0);
    assert!(matches!(
        admin
            .add_server(AddServerInput {
                replica_id: "d".into(),
                address: member("d").address,
            })
            .await,
        Err(AddServerError::AlreadyMember)
    ));

    cluster.wait_for_value(&["d"], "before", "1", TIMEOUT).await;
    wait_until(TIMEOUT, || async {
        if cluster.state_of("d").await.voting {
            Some(())
        } else {
            None
        }
    })
    .await
    .expect("d becomes voting");

    cluster.submit(&leader_id, "after=2").await?;
    cluster
        .wait_for_value(&["a", "b", "c", "d"], "after", "2", TIMEOUT)
        .await;

    admin
        .remove_server(RemoveServerInput {
            replica_id: "d".into(),
        })
        .await?;
    let leader_state = cluster.state_of(&leader_id).await;
    assert!(leader_state.peers.iter().all(|peer| peer.replica_id != "d"));
    assert!(matches!(
        admin
            .remove_server(RemoveServerInput {
                replica_id: "d".into(),
            })
            .await,
        Err(RemoveServerError::NotMember)
    ));
    assert!(matches!(
        admin
            .remove_server(RemoveServerInput {
                replica_id: leader_id.clone(),
            })
            .await,
        Err(RemoveServerError::RequiresLeadershipTransfer)
    ));

    // The cluster keeps working without "d".
    cluster.submit(&leader_id, "after=3").await?;
    cluster.wait_for_value(&["a", "b", "c"], "after", "3", TIMEOUT).await;

    Ok(())
}

#[tokio::test]
async fn server_that_cannot_catch_up_is_not_added() -> Result<(), Box<dyn Error>> {
    let options = RaftOptions {
        membership_catch_up_timeout: Some(Duration::from_millis(500)),
        ..fast_options()
    };
    let cluster = TestCluster::start(&["a", "b", "c"], options).await;
    let leader_id = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;

    // Nobody runs "ghost".
    let result = cluster
        .node(&leader_id)
        .client
        .admin
        .add_server(AddServerInput {
            replica_id: "ghost".into(),
            address: member("ghost").address,
        })
        .await;
    assert!(matches!(result, Err(AddServerError::CatchUpTimedOut)), "{:?}", result);

    let leader_state = cluster.state_of(&leader_id).await;
    assert!(leader_state.peers.iter().all(|peer| peer.replica_id != "ghost"));
    assert!(!leader_state.membership_change_in_progress);
    cluster.submit(&leader_id, "still=working").await?;

    Ok(())
}

#[tokio::test]
async fn lagging_follower_catches_up_from_snapshot() -> Result<(), Box<dyn Error>> {
    let options = RaftOptions {
        snapshot_batch_count: Some(5),
        ..fast_options()
    };
    let mut cluster = TestCluster::start(&["a", "b", "c"], options).await;
    let leader_id = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;
    let lagging = cluster.ids().into_iter().find(|id| id != &leader_id).unwrap_or_default();

    cluster.stop_node(&lagging);
    for i in 0..20 {
        cluster.submit(&leader_id, &format!("key{}={}", i, i)).await?;
    }

    // The leader compacted past anything the stopped follower has.
    let leader_state = wait_until(TIMEOUT, || async {
        let state = cluster.state_of(&leader_id).await;
        if state.snapshot_index >= 15 {
            Some(state)
        } else {
            None
        }
    })
    .await
    .expect("leader takes a snapshot");
    assert!(leader_state.snapshot_term > 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.start_node(&lagging).await;
    cluster.wait_for_value(&[lagging.as_str()], "key19", "19", TIMEOUT).await;

    let node = cluster.node(&lagging);
    assert!(node.state.restored_snapshots() >= 1);
    assert_eq!(node.state.len(), 20);
    assert!(cluster.state_of(&lagging).await.snapshot_index > 0);

    Ok(())
}

#[tokio::test]
async fn get_snapshot_returns_current_state() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(&["a", "b", "c"], fast_options()).await;
    let leader_id = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;
    let last = cluster.submit(&leader_id, "color=blue").await?;

    let snapshot = cluster.node(&leader_id).client.admin.get_snapshot().await?;
    assert_eq!(snapshot.state, Bytes::from("color=blue"));
    assert!(snapshot.last_applied_index >= last.index);
    assert_eq!(snapshot.servers.len(), 3);
    assert!(snapshot.servers.iter().all(|server| server.voting));

    // Taking a copy doesn't compact the log.
    assert_eq!(cluster.state_of(&leader_id).await.snapshot_index, 0);

    Ok(())
}

#[tokio::test]
async fn transfer_leadership() -> Result<(), Box<dyn Error>> {
    let cluster = TestCluster::start(&["a", "b", "c"], fast_options()).await;
    let old_leader = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;
    cluster.submit(&old_leader, "k=1").await?;
    cluster.wait_for_value(&["a", "b", "c"], "k", "1", TIMEOUT).await;

    let output = cluster.node(&old_leader).client.admin.transfer_leadership().await?;
    assert_ne!(output.new_leader_id, old_leader);

    let new_leader = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;
    assert_eq!(new_leader, output.new_leader_id);
    assert_eq!(cluster.state_of(&old_leader).await.role, RaftRole::Follower);

    cluster.submit(&new_leader, "k=2").await?;
    cluster.wait_for_value(&["a", "b", "c"], "k", "2", TIMEOUT).await;

    Ok(())
}

#[tokio::test]
async fn restart_replays_journal() -> Result<(), Box<dyn Error>> {
    let mut cluster = TestCluster::start(&["a", "b", "c"], fast_options()).await;
    let leader_id = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;
    for i in 0..5 {
        cluster.submit(&leader_id, &format!("key{}={}", i, i)).await?;
    }
    cluster.wait_for_value(&["a", "b", "c"], "key4", "4", TIMEOUT).await;
    let term_before = cluster.state_of(&leader_id).await.current_term;

    for id in ["a", "b", "c"].iter() {
        cluster.stop_node(id);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    for id in ["a", "b", "c"].iter() {
        cluster.start_node(id).await;
    }

    let leader_id = cluster.wait_for_stable_leader(&["a", "b", "c"], TIMEOUT).await;
    assert!(cluster.state_of(&leader_id).await.current_term > term_before);
    cluster.wait_for_value(&["a", "b", "c"], "key0", "0", TIMEOUT).await;
    cluster.wait_for_value(&["a", "b", "c"], "key4", "4", TIMEOUT).await;

    let output = cluster.submit(&leader_id, "key5=5").await?;
    assert!(output.index > 5);
    cluster.wait_for_value(&["a", "b", "c"], "key5", "5", TIMEOUT).await;

    Ok(())
}
