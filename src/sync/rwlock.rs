//! An asynchronous reader-writer lock with optimistic read stamps.
//!
//! The lock is write-preferring: a queued writer blocks readers that arrive
//! after it, so writers cannot starve. Every transition out of the write
//! state bumps the version counter, which is what makes optimistic stamps
//! sound: a stamp validates only when no write acquisition happened between
//! issuance and validation.

use std::time::Duration;

use crate::error::SyncError;
use crate::sync::event::CancellationToken;
use crate::sync::queued::LockManager;
use crate::sync::queued::QueuedSynchronizer;

#[derive(Debug)]
struct RwState {
    version: u64,
    read_count: i64,
    write_held: bool,
}

#[derive(Clone, Copy, Debug)]
enum RwRole {
    Read,
    Write,
    /// Convert the caller's sole read grant into a write grant.
    Upgrade,
}

impl LockManager<RwState> for RwRole {
    fn is_allowed(&self, s: &RwState) -> bool {
        match self {
            RwRole::Read => !s.write_held,
            RwRole::Write => !s.write_held && s.read_count == 0,
            RwRole::Upgrade => !s.write_held && s.read_count == 1,
        }
    }

    fn acquire(&self, s: &mut RwState) {
        match self {
            RwRole::Read => s.read_count += 1,
            RwRole::Write => {
                s.write_held = true;
                s.version = s.version.wrapping_add(1);
            }
            RwRole::Upgrade => {
                s.read_count = 0;
                s.write_held = true;
                s.version = s.version.wrapping_add(1);
            }
        }
    }

    fn release(&self, s: &mut RwState) -> Result<(), SyncError> {
        match self {
            RwRole::Read => {
                if s.read_count == 0 || s.write_held {
                    return Err(SyncError::NotInLock);
                }
                s.read_count -= 1;
            }
            RwRole::Write | RwRole::Upgrade => {
                if !s.write_held {
                    return Err(SyncError::NotInLock);
                }
                s.write_held = false;
                s.version = s.version.wrapping_add(1);
            }
        }
        Ok(())
    }
}

/// An opaque token issued for optimistic reads.
///
/// A stamp issued while no writer held the lock remains valid until the next
/// write acquisition. Readers validate after reading; on failure the read is
/// retried under a shared lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStamp {
    version: u64,
    valid: bool,
}

/// An asynchronous reader-writer lock.
pub struct AsyncReaderWriterLock {
    sync: QueuedSynchronizer<RwState, RwRole>,
}

impl AsyncReaderWriterLock {
    pub fn new() -> Self {
        Self {
            sync: QueuedSynchronizer::new(RwState {
                version: 0,
                read_count: 0,
                write_held: false,
            }),
        }
    }

    /// Issue an optimistic read stamp against the current version.
    ///
    /// The stamp is born invalid when a writer holds the lock at issuance.
    pub fn try_optimistic_read(&self) -> LockStamp {
        self.sync.with_state(|s| LockStamp {
            version: s.version,
            valid: !s.write_held,
        })
    }

    /// Whether no write acquisition has occurred since the stamp was issued.
    pub fn validate(&self, stamp: &LockStamp) -> bool {
        stamp.valid && self.sync.with_state(|s| s.version == stamp.version && !s.write_held)
    }

    /// Acquire a shared read grant, suspending in queue order.
    pub async fn read(&self) -> Result<ReadGuard<'_>, SyncError> {
        self.read_with(None, None).await.map(|g| g.expect("untimed acquire cannot resolve empty"))
    }

    /// Acquire a shared read grant with an optional timeout and cancellation
    /// token. `Ok(None)` means the timeout elapsed.
    pub async fn read_with(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<ReadGuard<'_>>, SyncError> {
        let ok = self.sync.acquire(RwRole::Read, timeout, cancel, false).await?;
        Ok(if ok { Some(ReadGuard { lock: self }) } else { None })
    }

    /// Acquire a read grant immediately or not at all. Ignores queue order.
    pub fn try_read(&self) -> Result<Option<ReadGuard<'_>>, SyncError> {
        let ok = self.sync.try_acquire(RwRole::Read)?;
        Ok(if ok { Some(ReadGuard { lock: self }) } else { None })
    }

    /// Acquire the exclusive write grant, suspending in queue order.
    pub async fn write(&self) -> Result<WriteGuard<'_>, SyncError> {
        self.write_with(None, None).await.map(|g| g.expect("untimed acquire cannot resolve empty"))
    }

    /// Acquire the exclusive write grant with an optional timeout and
    /// cancellation token. `Ok(None)` means the timeout elapsed.
    pub async fn write_with(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<WriteGuard<'_>>, SyncError> {
        let ok = self.sync.acquire(RwRole::Write, timeout, cancel, false).await?;
        Ok(if ok { Some(WriteGuard { lock: self }) } else { None })
    }

    /// Acquire the write grant immediately or not at all. Ignores queue order.
    pub fn try_write(&self) -> Result<Option<WriteGuard<'_>>, SyncError> {
        let ok = self.sync.try_acquire(RwRole::Write)?;
        Ok(if ok { Some(WriteGuard { lock: self }) } else { None })
    }

    /// Fail every queued waiter with `Interrupted(reason)`, then acquire the
    /// write grant through the normal path.
    pub async fn steal_write(&self, reason: &str) -> Result<WriteGuard<'_>, SyncError> {
        self.sync.interrupt(reason);
        self.write().await
    }

    /// Refuse all further use of this lock.
    pub fn dispose(&self) {
        self.sync.dispose();
    }

    #[cfg(test)]
    fn state(&self) -> (u64, i64, bool) {
        self.sync.with_state(|s| (s.version, s.read_count, s.write_held))
    }
}

impl Default for AsyncReaderWriterLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a shared read grant.
pub struct ReadGuard<'a> {
    lock: &'a AsyncReaderWriterLock,
}

impl<'a> ReadGuard<'a> {
    /// Convert this read grant into the exclusive write grant.
    ///
    /// Requires that this is the only read grant outstanding; otherwise the
    /// caller suspends until the other readers have released. On failure the
    /// read grant is retained.
    pub async fn upgrade(self) -> Result<WriteGuard<'a>, SyncError> {
        let lock = self.lock;
        lock.sync.acquire(RwRole::Upgrade, None, None, true).await?;
        // The read grant was consumed by the upgrade acquisition.
        std::mem::forget(self);
        Ok(WriteGuard { lock })
    }
}

impl<'a> Drop for ReadGuard<'a> {
    fn drop(&mut self) {
        let _ = self.lock.sync.release(RwRole::Read);
    }
}

/// RAII guard for the exclusive write grant.
pub struct WriteGuard<'a> {
    lock: &'a AsyncReaderWriterLock,
}

impl<'a> WriteGuard<'a> {
    /// Convert this write grant into a single read grant.
    ///
    /// The version is bumped, so optimistic stamps issued while the write
    /// grant was held never validate.
    pub fn downgrade(self) -> ReadGuard<'a> {
        let lock = self.lock;
        lock.sync.update_state(|s| {
            s.write_held = false;
            s.read_count = 1;
            s.version = s.version.wrapping_add(1);
        });
        std::mem::forget(self);
        ReadGuard { lock }
    }
}

impl<'a> Drop for WriteGuard<'a> {
    fn drop(&mut self) {
        let _ = self.lock.sync.release(RwRole::Write);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_many_readers_one_writer() {
        let lock = AsyncReaderWriterLock::new();
        let r1 = lock.read().await.unwrap();
        let r2 = lock.read().await.unwrap();
        assert!(lock.try_write().unwrap().is_none());
        drop(r1);
        assert!(lock.try_write().unwrap().is_none());
        drop(r2);
        let w = lock.try_write().unwrap();
        assert!(w.is_some());
    }

    #[tokio::test]
    async fn test_optimistic_stamp_survives_reads_only() {
        let lock = AsyncReaderWriterLock::new();
        let stamp = lock.try_optimistic_read();
        assert!(lock.validate(&stamp));

        {
            let _r = lock.read().await.unwrap();
            assert!(lock.validate(&stamp));
        }
        assert!(lock.validate(&stamp));

        {
            let _w = lock.write().await.unwrap();
            assert!(!lock.validate(&stamp));
        }
        // Writer released; the write window still invalidates the stamp.
        assert!(!lock.validate(&stamp));
    }

    #[tokio::test]
    async fn test_stamp_issued_under_write_is_invalid() {
        let lock = AsyncReaderWriterLock::new();
        let _w = lock.write().await.unwrap();
        let stamp = lock.try_optimistic_read();
        assert!(!lock.validate(&stamp));
    }

    #[tokio::test]
    async fn test_downgrade_bumps_version() {
        let lock = AsyncReaderWriterLock::new();
        let w = lock.write().await.unwrap();
        let stamp = lock.try_optimistic_read();
        let r = w.downgrade();
        // Readers may now enter alongside the downgraded grant.
        let r2 = lock.try_read().unwrap();
        assert!(r2.is_some());
        // A stamp observing the write window must not validate after downgrade.
        assert!(!lock.validate(&stamp));
        drop(r);
    }

    #[tokio::test]
    async fn test_upgrade_from_sole_reader() {
        let lock = AsyncReaderWriterLock::new();
        let r = lock.read().await.unwrap();
        let w = r.upgrade().await.unwrap();
        let (_, read_count, write_held) = lock.state();
        assert_eq!(read_count, 0);
        assert!(write_held);
        drop(w);
        let (_, read_count, write_held) = lock.state();
        assert_eq!(read_count, 0);
        assert!(!write_held);
    }

    #[tokio::test]
    async fn test_queued_writer_blocks_new_readers() {
        let lock = Arc::new(AsyncReaderWriterLock::new());
        let r = lock.read().await.unwrap();

        let l2 = lock.clone();
        let writer = tokio::spawn(async move {
            let _w = l2.write().await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The queued writer takes precedence over a newly arriving reader.
        let late = lock.read_with(Some(Duration::from_millis(20)), None).await.unwrap();
        assert!(late.is_none());

        drop(r);
        writer.await.unwrap();
        assert!(lock.try_read().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_steal_write_interrupts_all_waiters() {
        let lock = Arc::new(AsyncReaderWriterLock::new());
        let held = lock.write().await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..10 {
            let l = lock.clone();
            waiters.push(tokio::spawn(async move {
                match l.write().await {
                    Err(SyncError::Interrupted(reason)) => reason.to_string(),
                    other => panic!("expected Interrupted, got {:?}", other.is_ok()),
                }
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let l2 = lock.clone();
        let stealer = tokio::spawn(async move {
            let _w = l2.steal_write("maintenance").await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        for w in waiters {
            assert_eq!(w.await.unwrap(), "maintenance");
        }

        drop(held);
        stealer.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_leaves_no_dangling_node() {
        let lock = Arc::new(AsyncReaderWriterLock::new());
        let w = lock.write().await.unwrap();

        let token = CancellationToken::new();
        let l2 = lock.clone();
        let t2 = token.clone();
        let waiter = tokio::spawn(async move { l2.read_with(None, Some(&t2)).await.map(|g| g.is_some()) });
        tokio::time::sleep(Duration::from_millis(20)).await;

        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(SyncError::Cancelled));

        drop(w);
        assert!(lock.try_write().unwrap().is_some());
    }
}
