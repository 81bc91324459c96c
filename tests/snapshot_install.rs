use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use fixtures::members_of;
use fixtures::RaftRouter;
use raftwal::wal::LogStoreOptions;
use raftwal::Config;
use raftwal::SnapshotPolicy;
use raftwal::State;

mod fixtures;

/// Snapshot install for a lagging joiner.
///
/// What does this test do?
///
/// - brings up a single-node cluster and writes enough entries that the
///   leader compacts its log into a snapshot.
/// - adds a pristine node to the cluster; its log is far enough behind that
///   the leader must stream an InstallSnapshot before AppendEntries can
///   resume.
/// - asserts the new node converges on the leader's log, that its snapshot
///   covers the compacted prefix, and that reading inside the compacted
///   range yields the snapshot rather than entries.
///
/// RUST_LOG=raftwal,snapshot_install=trace cargo test --test snapshot_install
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_joiner_receives_snapshot() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        Config::build("test".into())
            .election_timeout(150, 300)
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(50))
            .validate()?,
    );
    let store_options = LogStoreOptions {
        records_per_partition: 16,
        ..Default::default()
    };
    let router = Arc::new(RaftRouter::with_store_options(config, store_options));

    router.new_raft_node(0).await;
    router.initialize_cluster(&[0]).await?;
    router.wait_for_state(&0, State::Leader, Duration::from_millis(2000), "node 0 becomes leader").await?;

    tracing::info!("--- writing entries past the snapshot threshold");
    let n = 120usize;
    router.client_request_many(0, "cmd", n).await?;
    let last = n as u64 + 1; // Initial config entry + n writes.

    let solo: BTreeSet<u64> = std::iter::once(0).collect();
    router.wait_for_log(&solo, last, Duration::from_millis(5000), "leader applied all writes").await?;

    // The snapshot policy has compacted the leader's log.
    router
        .wait_for_metrics(
            &0,
            |m| m.snapshot.index > 0,
            Duration::from_millis(5000),
            "leader snapshot created",
        )
        .await?;
    let leader_snapshot = router
        .wait_for_metrics(&0, |_| true, Duration::from_millis(500), "leader metrics")
        .await?
        .snapshot;

    tracing::info!("--- joining a pristine node, which must be snapshotted");
    router.new_raft_node(1).await;
    let handle = router.get_raft_handle(&0).await?;
    handle.change_membership(members_of(&[0, 1])).await?;

    // The joiner converges on the leader's log, and its snapshot covers the
    // compacted prefix.
    router
        .wait_for_metrics(
            &1,
            |m| m.last_applied >= last && m.snapshot.index >= leader_snapshot.index,
            Duration::from_millis(10_000),
            "joiner installed snapshot and caught up",
        )
        .await?;

    // Reading inside the compacted range yields the snapshot.
    let sto = router.get_storage_handle(&1).await?;
    let view = sto.read(1, leader_snapshot.index).await?;
    let snap = view.snapshot.expect("read inside the compacted prefix must return the snapshot");
    assert!(snap.index >= leader_snapshot.index);

    // The restored state machine replays the snapshotted commands.
    assert!(sto.machine().last_applied() >= last);

    Ok(())
}
