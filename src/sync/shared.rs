//! An asynchronous shared lock with an exclusive (strong) mode.
//!
//! Up to `concurrency_level` weak holders may coexist; the strong mode takes
//! the whole lock. A queued strong acquirer blocks weak grants behind it, so
//! writers drain the lock instead of starving.

use std::time::Duration;

use crate::error::SyncError;
use crate::sync::event::CancellationToken;
use crate::sync::queued::LockManager;
use crate::sync::queued::QueuedSynchronizer;

/// `remaining == concurrency_level` means free; `remaining == -1` means
/// strong-held; otherwise `concurrency_level - remaining` weak holders exist.
#[derive(Debug)]
struct SharedState {
    concurrency_level: i64,
    remaining: i64,
}

#[derive(Clone, Copy, Debug)]
enum SharedRole {
    Weak,
    Strong,
}

impl LockManager<SharedState> for SharedRole {
    fn is_allowed(&self, s: &SharedState) -> bool {
        match self {
            SharedRole::Weak => s.remaining > 0,
            SharedRole::Strong => s.remaining == s.concurrency_level,
        }
    }

    fn acquire(&self, s: &mut SharedState) {
        match self {
            SharedRole::Weak => s.remaining -= 1,
            SharedRole::Strong => s.remaining = -1,
        }
    }

    fn release(&self, s: &mut SharedState) -> Result<(), SyncError> {
        match self {
            SharedRole::Weak => {
                if s.remaining < 0 || s.remaining >= s.concurrency_level {
                    return Err(SyncError::NotInLock);
                }
                s.remaining += 1;
            }
            SharedRole::Strong => {
                if s.remaining != -1 {
                    return Err(SyncError::NotInLock);
                }
                s.remaining = s.concurrency_level;
            }
        }
        Ok(())
    }
}

/// An asynchronous shared lock.
pub struct AsyncSharedLock {
    sync: QueuedSynchronizer<SharedState, SharedRole>,
}

impl AsyncSharedLock {
    /// Create a lock admitting at most `concurrency_level` weak holders.
    pub fn new(concurrency_level: u32) -> Self {
        let level = i64::from(concurrency_level.max(1));
        Self {
            sync: QueuedSynchronizer::new(SharedState {
                concurrency_level: level,
                remaining: level,
            }),
        }
    }

    /// Acquire a weak (shared) grant.
    pub async fn acquire_weak(&self) -> Result<WeakGuard<'_>, SyncError> {
        self.acquire_weak_with(None, None).await.map(|g| g.expect("untimed acquire cannot resolve empty"))
    }

    /// Acquire a weak grant with an optional timeout and cancellation token.
    pub async fn acquire_weak_with(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<WeakGuard<'_>>, SyncError> {
        let ok = self.sync.acquire(SharedRole::Weak, timeout, cancel, false).await?;
        Ok(if ok { Some(WeakGuard { lock: self }) } else { None })
    }

    /// Acquire a weak grant immediately or not at all.
    pub fn try_acquire_weak(&self) -> Result<Option<WeakGuard<'_>>, SyncError> {
        let ok = self.sync.try_acquire(SharedRole::Weak)?;
        Ok(if ok { Some(WeakGuard { lock: self }) } else { None })
    }

    /// Acquire the strong (exclusive) grant.
    pub async fn acquire_strong(&self) -> Result<StrongGuard<'_>, SyncError> {
        self.acquire_strong_with(None, None).await.map(|g| g.expect("untimed acquire cannot resolve empty"))
    }

    /// Acquire the strong grant with an optional timeout and cancellation token.
    pub async fn acquire_strong_with(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<StrongGuard<'_>>, SyncError> {
        let ok = self.sync.acquire(SharedRole::Strong, timeout, cancel, false).await?;
        Ok(if ok { Some(StrongGuard { lock: self }) } else { None })
    }

    /// Acquire the strong grant immediately or not at all.
    pub fn try_acquire_strong(&self) -> Result<Option<StrongGuard<'_>>, SyncError> {
        let ok = self.sync.try_acquire(SharedRole::Strong)?;
        Ok(if ok { Some(StrongGuard { lock: self }) } else { None })
    }

    /// Fail every queued waiter with `Interrupted(reason)`.
    pub fn interrupt(&self, reason: &str) {
        self.sync.interrupt(reason);
    }

    /// Refuse all further use of this lock.
    pub fn dispose(&self) {
        self.sync.dispose();
    }

    /// The number of weak holders currently inside the lock, or `None` while
    /// strong-held.
    pub fn weak_holders(&self) -> Option<u32> {
        self.sync.with_state(|s| {
            if s.remaining < 0 {
                None
            } else {
                Some((s.concurrency_level - s.remaining) as u32)
            }
        })
    }
}

/// RAII guard for a weak grant.
pub struct WeakGuard<'a> {
    lock: &'a AsyncSharedLock,
}

impl<'a> Drop for WeakGuard<'a> {
    fn drop(&mut self) {
        let _ = self.lock.sync.release(SharedRole::Weak);
    }
}

/// RAII guard for the strong grant.
pub struct StrongGuard<'a> {
    lock: &'a AsyncSharedLock,
}

impl<'a> StrongGuard<'a> {
    /// Convert the strong grant into a single weak grant, letting other weak
    /// acquirers in.
    pub fn downgrade(self) -> WeakGuard<'a> {
        let lock = self.lock;
        lock.sync.update_state(|s| {
            s.remaining = s.concurrency_level - 1;
        });
        std::mem::forget(self);
        WeakGuard { lock }
    }
}

impl<'a> Drop for StrongGuard<'a> {
    fn drop(&mut self) {
        let _ = self.lock.sync.release(SharedRole::Strong);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_weak_holders_up_to_level() {
        let lock = AsyncSharedLock::new(2);
        let a = lock.try_acquire_weak().unwrap();
        assert!(a.is_some());
        let b = lock.try_acquire_weak().unwrap();
        assert!(b.is_some());
        assert!(lock.try_acquire_weak().unwrap().is_none());
        assert_eq!(lock.weak_holders(), Some(2));
        drop(a);
        assert!(lock.try_acquire_weak().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_strong_requires_free_lock() {
        let lock = AsyncSharedLock::new(4);
        let weak = lock.acquire_weak().await.unwrap();
        assert!(lock.try_acquire_strong().unwrap().is_none());
        drop(weak);
        let strong = lock.try_acquire_strong().unwrap();
        assert!(strong.is_some());
        assert_eq!(lock.weak_holders(), None);
        assert!(lock.try_acquire_weak().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_waiting_strong_blocks_new_weak_grants() {
        let lock = Arc::new(AsyncSharedLock::new(4));
        let weak = lock.acquire_weak().await.unwrap();

        let l2 = lock.clone();
        let strong = tokio::spawn(async move {
            let _s = l2.acquire_strong().await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The queued strong acquirer drains the lock: a late weak waits.
        let late = lock.acquire_weak_with(Some(Duration::from_millis(20)), None).await.unwrap();
        assert!(late.is_none());

        drop(weak);
        strong.await.unwrap();
        assert!(lock.try_acquire_weak().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_downgrade_strong_to_weak() {
        let lock = AsyncSharedLock::new(3);
        let strong = lock.acquire_strong().await.unwrap();
        let weak = strong.downgrade();
        assert_eq!(lock.weak_holders(), Some(1));
        assert!(lock.try_acquire_weak().unwrap().is_some());
        assert!(lock.try_acquire_strong().unwrap().is_none());
        drop(weak);
    }
}
