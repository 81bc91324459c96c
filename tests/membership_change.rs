use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use fixtures::members_of;
use fixtures::RaftRouter;
use raftwal::membership::ConfigurationStorage;
use raftwal::Config;
use raftwal::State;

mod fixtures;

/// Single-step membership reconfiguration.
///
/// What does this test do?
///
/// - brings up a three-node cluster {0, 1, 2}.
/// - registers `wait_for_apply` futures on every node's configuration storage.
/// - proposes adding node 3 and applies the change.
/// - asserts that every node's active configuration contains node 3, that
///   the configuration fingerprint advanced by exactly one, and that the
///   pending `wait_for_apply` futures completed with the new configuration.
///
/// RUST_LOG=raftwal,membership_change=trace cargo test --test membership_change
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_member_applies_everywhere() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).election_timeout(150, 300).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    for id in 0..3 {
        router.new_raft_node(id).await;
    }
    router.initialize_cluster(&[0, 1, 2]).await?;
    let leader = router.wait_for_leader(Duration::from_millis(3000)).await?;

    let all: BTreeSet<u64> = (0..3).collect();
    router.wait_for_log(&all, 1, Duration::from_millis(3000), "initial entry replicated").await?;

    let fingerprint_before = router
        .wait_for_metrics(&leader, |_| true, Duration::from_millis(500), "leader metrics")
        .await?
        .membership_config
        .active
        .fingerprint;

    // Subscribe to the apply event on every original member before proposing.
    let mut apply_waiters = Vec::new();
    for id in 0..3 {
        let sto = router.get_storage_handle(&id).await?;
        let configs = sto.configuration_storage();
        apply_waiters.push(tokio::spawn(async move { configs.wait_for_apply().await }));
    }

    tracing::info!("--- adding node 3 to the cluster");
    router.new_raft_node(3).await;
    let handle = router.get_raft_handle(&leader).await?;
    handle.change_membership(members_of(&[0, 1, 2, 3])).await?;

    // Every node observes the new active member set with the fingerprint
    // advanced by exactly one.
    let want: BTreeSet<u64> = (0..4).collect();
    for id in 0..4 {
        router
            .wait_for_metrics(
                &id,
                |m| {
                    m.membership_config.active.members.keys().cloned().collect::<BTreeSet<_>>() == want
                        && m.membership_config.active.fingerprint == fingerprint_before.wrapping_add(1)
                        && !m.membership_config.is_reconfiguring()
                },
                Duration::from_millis(5000),
                &format!("node {} observes applied configuration", id),
            )
            .await?;
    }

    // The pending wait_for_apply futures all completed with the new config.
    for waiter in apply_waiters {
        let applied = waiter.await?.expect("apply event must complete");
        assert!(applied.contains(&3));
        assert_eq!(applied.fingerprint, fingerprint_before.wrapping_add(1));
    }

    // The joined node participates as a follower.
    router.wait_for_state(&3, State::Follower, Duration::from_millis(3000), "node 3 becomes follower").await?;

    Ok(())
}

/// Removing a member returns the cluster to a smaller active set and keeps
/// the fingerprint strictly increasing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_member_advances_fingerprint() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).election_timeout(150, 300).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    for id in 0..3 {
        router.new_raft_node(id).await;
    }
    router.initialize_cluster(&[0, 1, 2]).await?;
    let leader = router.wait_for_leader(Duration::from_millis(3000)).await?;
    let all: BTreeSet<u64> = (0..3).collect();
    router.wait_for_log(&all, 1, Duration::from_millis(3000), "initial entry replicated").await?;

    let before = router
        .wait_for_metrics(&leader, |_| true, Duration::from_millis(500), "leader metrics")
        .await?
        .membership_config
        .active
        .fingerprint;

    // Drop a non-leader member.
    let doomed = (0..3).find(|n| *n != leader).unwrap();
    let keep: Vec<u64> = (0..3).filter(|n| *n != doomed).collect();
    let handle = router.get_raft_handle(&leader).await?;
    handle.change_membership(members_of(&keep)).await?;

    let want: BTreeSet<u64> = keep.iter().cloned().collect();
    for id in &keep {
        router
            .wait_for_metrics(
                id,
                |m| {
                    m.membership_config.active.members.keys().cloned().collect::<BTreeSet<_>>() == want
                        && m.membership_config.active.fingerprint == before.wrapping_add(1)
                },
                Duration::from_millis(5000),
                &format!("node {} observes shrunk configuration", id),
            )
            .await?;
    }

    Ok(())
}
