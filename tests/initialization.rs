use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use fixtures::RaftRouter;
use raftwal::Config;
use raftwal::State;

mod fixtures;

/// Three-node cold-start election.
///
/// What does this test do?
///
/// - brings three pristine nodes online with election timeout {150, 300} and
///   heartbeat threshold 0.5.
/// - initializes the cluster from node 0 (the seed).
/// - asserts that exactly one leader emerges within two election rounds, and
///   that every follower observes the leader's term and identity.
///
/// RUST_LOG=raftwal,initialization=trace cargo test --test initialization
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_election() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        Config::build("test".into())
            .election_timeout(150, 300)
            .heartbeat_threshold(0.5)
            .validate()
            .expect("failed to build Raft config"),
    );
    let router = Arc::new(RaftRouter::new(config));

    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    tracing::info!("--- initializing cluster from seed node 0");
    router.initialize_cluster(&[0, 1, 2]).await?;

    // Two election rounds at the upper timeout bound, plus scheduling slack.
    let leader = router.wait_for_leader(Duration::from_millis(2 * 300 + 1000)).await?;

    let leader_metrics = router
        .wait_for_metrics(&leader, |m| m.state == State::Leader, Duration::from_millis(500), "leader stable")
        .await?;
    let leader_term = leader_metrics.current_term;

    // Every other node settles as follower on the same term, pointing at the leader.
    for node in [0u64, 1, 2].iter().filter(|n| **n != leader) {
        router
            .wait_for_metrics(
                node,
                |m| {
                    m.state == State::Follower
                        && m.current_term == leader_term
                        && m.current_leader == Some(leader)
                },
                Duration::from_millis(2000),
                &format!("node {} observes leader {} at term {}", node, leader, leader_term),
            )
            .await?;
    }

    // Election safety: exactly one leader for this term.
    let leaders = router.leaders_with_terms().await;
    assert_eq!(leaders.len(), 1, "expected exactly one leader, got {:?}", leaders);
    assert_eq!(leaders[0], (leader, leader_term));

    Ok(())
}

/// A resigning leader steps down and the cluster elects a replacement.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_resigns() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).election_timeout(150, 300).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    for id in 0..3 {
        router.new_raft_node(id).await;
    }
    router.initialize_cluster(&[0, 1, 2]).await?;
    let leader = router.wait_for_leader(Duration::from_millis(3000)).await?;

    // Settle all members on the leader's log before resigning.
    let all: BTreeSet<u64> = (0..3).collect();
    router.wait_for_log(&all, 1, Duration::from_millis(3000), "initial entry replicated").await?;

    // A non-leader refuses to resign.
    let bystander = (0..3).find(|n| *n != leader).unwrap();
    let handle = router.get_raft_handle(&bystander).await?;
    assert!(!handle.resign().await?);

    let handle = router.get_raft_handle(&leader).await?;
    assert!(handle.resign().await?);

    router
        .wait_for_metrics(
            &leader,
            |m| m.state != State::Leader,
            Duration::from_millis(1000),
            "resigned leader leaves leader state",
        )
        .await?;

    // A replacement is elected.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(5000);
    loop {
        if let Some(next) = router.leader().await {
            if next != leader || tokio::time::Instant::now() >= deadline {
                break;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no replacement leader elected");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Ok(())
}

/// Synchronize returns a node's live log position.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn synchronize_reports_log_position() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    router.new_raft_node(0).await;
    router.initialize_cluster(&[0]).await?;
    router.wait_for_state(&0, State::Leader, Duration::from_millis(2000), "single node becomes leader").await?;

    router.client_request_many(0, "cmd", 5).await?;

    let handle = router.get_raft_handle(&0).await?;
    let pos = handle.synchronize().await?;
    // Initial config entry + five writes.
    assert_eq!(pos.last_log_id.index, 6);
    assert_eq!(pos.commit_index, 6);
    Ok(())
}
