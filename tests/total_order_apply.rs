use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use fixtures::RaftRouter;
use raftwal::Config;
use raftwal::State;

mod fixtures;

/// Cluster total_order_apply test.
///
/// What does this test do?
///
/// - brings 2 nodes online: one leader and one standby.
/// - writes a stream of commands to the leader.
/// - asserts that the standby's state machine applied every command exactly
///   once, in log order.
///
/// RUST_LOG=raftwal,total_order_apply=trace cargo test --test total_order_apply
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn total_order_apply() -> Result<()> {
    fixtures::init_tracing();

    // Setup test dependencies.
    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_raft_node(0).await;
    router.new_raft_node(1).await;

    tracing::info!("--- initializing single node cluster");

    router.initialize_cluster(&[0]).await?;
    router
        .wait_for_metrics(&0u64, |x| x.state == State::Leader, Duration::from_millis(2000), "n0.state -> Leader")
        .await?;

    tracing::info!("--- add one standby");
    let leader = router.get_raft_handle(&0).await?;
    leader.add_standby(1, "node-1".into()).await?;

    let n = 300usize;
    router.client_request_many(0, "foo", n).await?;

    // Initial config entry + n client requests.
    let want = n as u64 + 1;
    router
        .wait_for_metrics(
            &1u64,
            |x| x.last_applied >= want,
            Duration::from_millis(5000),
            &format!("n1.last_applied -> {}", want),
        )
        .await?;

    // The standby's machine holds every command, in strictly increasing
    // log order, exactly once.
    let sto = router.get_storage_handle(&1).await?;
    let applied = sto.machine().applied();
    assert_eq!(applied.len(), n);
    let mut prev = 0;
    for (pos, (index, data)) in applied.iter().enumerate() {
        assert!(*index > prev, "out of order apply: {} after {}", index, prev);
        prev = *index;
        assert_eq!(&data[..], format!("foo-{}", pos).as_bytes());
    }

    Ok(())
}
