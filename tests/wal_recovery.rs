use anyhow::Result;
use bytes::Bytes;

use fixtures::TestStateMachine;
use raftwal::raft::Entry;
use raftwal::wal::AppendOptions;
use raftwal::wal::LogStore;
use raftwal::wal::LogStoreOptions;
use raftwal::wal::WriteMode;
use raftwal::LogId;
use raftwal::WalError;

mod fixtures;

fn entry(term: u64, index: u64) -> Entry {
    Entry::new_normal(LogId::new(term, index), Some(7), Bytes::from(format!("payload-{}", index)))
}

fn options() -> LogStoreOptions {
    LogStoreOptions {
        records_per_partition: 64,
        write_mode: WriteMode::WriteThrough,
        ..Default::default()
    }
}

/// Crash-recovery of the partitioned store.
///
/// What does this test do?
///
/// - appends entries 1..=200 with 64 records per partition (four partition
///   files) and commits up to 150.
/// - drops the store without ceremony, simulating a process kill.
/// - reopens the directory and asserts that all 200 payloads read back
///   bytewise identical, commit_index is 150 and last_index is 200.
///
/// RUST_LOG=raftwal,wal_recovery=trace cargo test --test wal_recovery
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_recovery_round_trip() -> Result<()> {
    fixtures::init_tracing();
    let dir = tempfile::tempdir()?;

    {
        let store = LogStore::open(dir.path(), 1, options(), TestStateMachine::default()).await?;
        let entries: Vec<Entry> = (1..=200).map(|i| entry(1, i)).collect();
        let last = store.append(&entries, AppendOptions::default()).await?;
        assert_eq!(last, 200);
        let applied = store.commit(150).await?;
        assert_eq!(applied, 150);

        // Entries 1..=200 with 64 records per partition span four partitions.
        let partitions = std::fs::read_dir(dir.path().join("partitions"))?.count();
        assert_eq!(partitions, 4);
        // Kill: the store is dropped without close or final flush.
    }

    let store = LogStore::open(dir.path(), 1, options(), TestStateMachine::default()).await?;
    assert_eq!(store.last_index().await, 200);
    assert_eq!(store.commit_index().await, 150);

    let view = store.read(1, 201).await?;
    assert!(view.snapshot.is_none());
    assert_eq!(view.entries.len(), 200);
    for (n, got) in view.entries.iter().enumerate() {
        let want = entry(1, n as u64 + 1);
        assert_eq!(got.log_id, want.log_id);
        assert_eq!(got.payload, want.payload);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn append_boundaries() -> Result<()> {
    fixtures::init_tracing();
    let dir = tempfile::tempdir()?;
    let store = LogStore::open(dir.path(), 1, options(), TestStateMachine::default()).await?;

    // Appending zero entries is a no-op returning the current last index.
    assert_eq!(store.append(&[], AppendOptions::default()).await?, 0);

    let entries: Vec<Entry> = (1..=10).map(|i| entry(1, i)).collect();
    store.append(&entries, AppendOptions::default()).await?;

    // A gap is rejected.
    let res = store.append(&[entry(1, 15)], AppendOptions::default()).await;
    assert!(matches!(res, Err(WalError::OutOfOrder { expected: 11, got: 15 })));

    // Overwriting without skip_committed is rejected too.
    let res = store.append(&[entry(2, 5)], AppendOptions::default()).await;
    assert!(matches!(res, Err(WalError::OutOfOrder { .. })));

    // Reading an empty range returns an empty but well-formed view.
    let view = store.read(4, 4).await?;
    assert!(view.snapshot.is_none());
    assert!(view.entries.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn skip_committed_overwrites_uncommitted_tail() -> Result<()> {
    fixtures::init_tracing();
    let dir = tempfile::tempdir()?;
    let store = LogStore::open(dir.path(), 1, options(), TestStateMachine::default()).await?;

    let entries: Vec<Entry> = (1..=10).map(|i| entry(1, i)).collect();
    store.append(&entries, AppendOptions::default()).await?;
    store.commit(5).await?;

    // A leader-enforced overwrite: entries 4..=8 at a higher term. The
    // committed overlap (4, 5) matches the existing terms and is skipped;
    // the uncommitted tail (6..=10) is truncated and replaced by 6..=8.
    let overwrite: Vec<Entry> = (4..=5)
        .map(|i| entry(1, i))
        .chain((6..=8).map(|i| entry(2, i)))
        .collect();
    let last = store
        .append(&overwrite, AppendOptions {
            skip_committed: true,
            fail_fast: false,
        })
        .await?;
    assert_eq!(last, 8);
    assert_eq!(store.last_index().await, 8);

    let view = store.read(6, 9).await?;
    assert_eq!(view.entries.len(), 3);
    assert!(view.entries.iter().all(|e| e.log_id.term == 2));

    // A committed-overlap term mismatch is a safety violation.
    let conflicting: Vec<Entry> = (5..=6).map(|i| entry(3, i)).collect();
    let res = store
        .append(&conflicting, AppendOptions {
            skip_committed: true,
            fail_fast: false,
        })
        .await;
    assert!(matches!(res, Err(WalError::AlreadyCommitted(5))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drop_entries_respects_commit_index() -> Result<()> {
    fixtures::init_tracing();
    let dir = tempfile::tempdir()?;
    let store = LogStore::open(dir.path(), 1, options(), TestStateMachine::default()).await?;

    let entries: Vec<Entry> = (1..=20).map(|i| entry(1, i)).collect();
    store.append(&entries, AppendOptions::default()).await?;
    store.commit(10).await?;

    let res = store.drop_entries_starting_at(10).await;
    assert!(matches!(res, Err(WalError::AlreadyCommitted(10))));

    store.drop_entries_starting_at(15).await?;
    assert_eq!(store.last_index().await, 14);

    // Commit index never regresses.
    assert_eq!(store.commit_index().await, 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn install_snapshot_covers_prefix() -> Result<()> {
    fixtures::init_tracing();
    let dir = tempfile::tempdir()?;
    let store = LogStore::open(dir.path(), 1, options(), TestStateMachine::default()).await?;

    let entries: Vec<Entry> = (1..=200).map(|i| entry(1, i)).collect();
    store.append(&entries, AppendOptions::default()).await?;
    store.commit(200).await?;

    let machine_bytes = Bytes::from_static(b"machine-state");
    store.install_snapshot(150, 1, 42, machine_bytes.clone()).await?;
    assert_eq!(store.snapshot_index().await, 150);

    // Partitions fully covered by the snapshot are gone: 0..63 and 64..127.
    let partitions = std::fs::read_dir(dir.path().join("partitions"))?.count();
    assert_eq!(partitions, 2);

    // A read at or below the snapshot index returns the snapshot first.
    let view = store.read(100, 160).await?;
    let snap = view.snapshot.expect("read below snapshot index must return the snapshot");
    assert_eq!(snap.index, 150);
    assert_eq!(snap.term, 1);
    assert_eq!(snap.config_fingerprint, 42);
    assert_eq!(view.entries.first().map(|e| e.log_id.index), Some(151));
    assert_eq!(view.entries.last().map(|e| e.log_id.index), Some(159));

    // The snapshot survives a reopen.
    drop(store);
    let store = LogStore::open(dir.path(), 1, options(), TestStateMachine::default()).await?;
    assert_eq!(store.snapshot_index().await, 150);
    assert_eq!(store.last_index().await, 200);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backup_and_restore() -> Result<()> {
    fixtures::init_tracing();
    let dir = tempfile::tempdir()?;
    let store = LogStore::open(dir.path(), 1, options(), TestStateMachine::default()).await?;
    let entries: Vec<Entry> = (1..=30).map(|i| entry(1, i)).collect();
    store.append(&entries, AppendOptions::default()).await?;
    store.commit(30).await?;

    let archive_dir = tempfile::tempdir()?;
    let archive = archive_dir.path().join("store.backup");
    store.create_backup(&archive).await?;
    drop(store);

    let restored_dir = tempfile::tempdir()?;
    raftwal::wal::restore_backup(&archive, restored_dir.path()).await?;
    let restored = LogStore::open(restored_dir.path(), 1, options(), TestStateMachine::default()).await?;
    assert_eq!(restored.last_index().await, 30);
    assert_eq!(restored.commit_index().await, 30);
    let view = restored.read(1, 31).await?;
    assert_eq!(view.entries.len(), 30);
    Ok(())
}
