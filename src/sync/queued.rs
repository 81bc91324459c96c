//! The queued-synchronizer base shared by every async lock in this crate.
//!
//! A primitive is a piece of lock state `S` plus one or more lock roles `R`.
//! A role decides whether it may be granted against the current state, how a
//! grant mutates the state, and how a release mutates it back. The
//! synchronizer owns the state and a FIFO queue of suspended acquirers.
//!
//! Fairness is strict head-of-line: a waiter is only granted when every
//! waiter ahead of it has been granted or abandoned. In particular a queued
//! writer blocks readers that arrive after it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::SyncError;
use crate::sync::event::CancellationToken;

/// The capability set a lock role exposes to the synchronizer.
///
/// Implementations are small value types (`Copy` enums); composition of these
/// policies replaces a subclass hierarchy of lock kinds.
pub(crate) trait LockManager<S>: Copy + Send + 'static {
    /// Whether a grant of this role is currently possible.
    fn is_allowed(&self, state: &S) -> bool;

    /// Apply a grant of this role to the state. Only called when allowed.
    fn acquire(&self, state: &mut S);

    /// Undo a grant of this role. Surfaces `NotInLock` when the state shows
    /// no matching acquisition.
    fn release(&self, state: &mut S) -> Result<(), SyncError>;
}

/// The outcome delivered to a parked waiter.
enum Grant {
    Acquired,
    Interrupted(Arc<str>),
    Disposed,
}

/// A node in the wait queue.
struct WaitNode<R> {
    ticket: u64,
    role: R,
    tx: oneshot::Sender<Grant>,
    /// Set when the waiting future was abandoned (timeout or cancellation)
    /// but the node could not be unlinked inline; the next drain removes it.
    needs_removal: bool,
}

struct Inner<S, R> {
    state: S,
    queue: VecDeque<WaitNode<R>>,
    next_ticket: u64,
    disposed: bool,
}

/// A FIFO wait queue with per-node completion, timeouts, cancellation and
/// interruption, parameterized over the lock state and role set.
pub(crate) struct QueuedSynchronizer<S, R> {
    inner: Mutex<Inner<S, R>>,
}

impl<S, R> QueuedSynchronizer<S, R>
where R: LockManager<S>
{
    pub(crate) fn new(state: S) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                queue: VecDeque::new(),
                next_ticket: 0,
                disposed: false,
            }),
        }
    }

    /// Attempt a grant without suspending and without respecting queue order.
    pub(crate) fn try_acquire(&self, role: R) -> Result<bool, SyncError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.disposed {
            return Err(SyncError::Disposed);
        }
        if role.is_allowed(&inner.state) {
            role.acquire(&mut inner.state);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Acquire a grant of `role`, suspending in FIFO order when necessary.
    ///
    /// `timeout == Some(ZERO)` degenerates to a fairness-respecting try. When
    /// the timeout fires and `throw_on_timeout` is false, resolves `Ok(false)`
    /// instead of `Err(Timeout)`. Cancellation always surfaces `Cancelled`.
    pub(crate) async fn acquire(
        &self,
        role: R,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
        throw_on_timeout: bool,
    ) -> Result<bool, SyncError> {
        let (ticket, rx) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.disposed {
                return Err(SyncError::Disposed);
            }
            if !Self::has_active_waiters(&inner) && role.is_allowed(&inner.state) {
                role.acquire(&mut inner.state);
                return Ok(true);
            }
            if timeout == Some(Duration::from_millis(0)) {
                return if throw_on_timeout { Err(SyncError::Timeout) } else { Ok(false) };
            }

            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            inner.queue.push_back(WaitNode {
                ticket,
                role,
                tx,
                needs_removal: false,
            });
            (ticket, rx)
        };

        let timeout_fut = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => futures::future::pending().await,
            }
        };
        let cancel_fut = async {
            match cancel {
                Some(c) => c.cancelled().await,
                None => futures::future::pending().await,
            }
        };
        tokio::pin!(timeout_fut);
        tokio::pin!(cancel_fut);
        let mut rx = rx;

        tokio::select! {
            biased;
            res = &mut rx => Self::map_grant(res),
            _ = &mut timeout_fut => {
                let fallback = if throw_on_timeout { Err(SyncError::Timeout) } else { Ok(false) };
                self.abandon(ticket, rx, fallback)
            }
            _ = &mut cancel_fut => self.abandon(ticket, rx, Err(SyncError::Cancelled)),
        }
    }

    /// Release a grant of `role` and wake whatever the new state permits.
    pub(crate) fn release(&self, role: R) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().unwrap();
        role.release(&mut inner.state)?;
        Self::drain_wait_queue(&mut inner);
        Ok(())
    }

    /// Fail every queued waiter with `Interrupted(reason)`.
    ///
    /// Current holders are unaffected; the interrupter competes for the lock
    /// through the normal acquisition path afterwards.
    pub(crate) fn interrupt(&self, reason: &str) {
        let reason: Arc<str> = Arc::from(reason);
        let mut inner = self.inner.lock().unwrap();
        while let Some(node) = inner.queue.pop_front() {
            if node.needs_removal {
                continue;
            }
            let _ = node.tx.send(Grant::Interrupted(reason.clone()));
        }
    }

    /// Dispose the synchronizer: all waiters and all future acquirers observe
    /// `Disposed`.
    pub(crate) fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.disposed = true;
        while let Some(node) = inner.queue.pop_front() {
            let _ = node.tx.send(Grant::Disposed);
        }
    }

    /// Read a snapshot of the lock state under the mutex.
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        let inner = self.inner.lock().unwrap();
        f(&inner.state)
    }

    /// Mutate the lock state under the mutex and drain the wait queue against
    /// the new state.
    pub(crate) fn update_state<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        let mut inner = self.inner.lock().unwrap();
        let out = f(&mut inner.state);
        Self::drain_wait_queue(&mut inner);
        out
    }

    /// Whether any live waiter is queued.
    pub(crate) fn has_waiters(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        Self::has_active_waiters(&inner)
    }

    fn has_active_waiters(inner: &Inner<S, R>) -> bool {
        inner.queue.iter().any(|n| !n.needs_removal)
    }

    /// Walk the queue head-to-tail granting every waiter the state now allows,
    /// stopping at the first waiter that cannot be granted.
    fn drain_wait_queue(inner: &mut Inner<S, R>) {
        loop {
            let node = match inner.queue.front() {
                Some(front) => {
                    if front.needs_removal {
                        inner.queue.pop_front();
                        continue;
                    }
                    if !front.role.is_allowed(&inner.state) {
                        return;
                    }
                    inner.queue.pop_front().expect("front checked above")
                }
                None => return,
            };
            node.role.acquire(&mut inner.state);
            if node.tx.send(Grant::Acquired).is_err() {
                // The waiting future was dropped before it could be unlinked.
                let _ = node.role.release(&mut inner.state);
            }
        }
    }

    /// Called by a waiter abandoning its wait (timeout or cancellation).
    ///
    /// Unlinks the node when it is still queued; when a grant raced the
    /// abandonment the grant wins and `Ok(true)` is returned instead of the
    /// fallback result.
    fn abandon(
        &self,
        ticket: u64,
        mut rx: oneshot::Receiver<Grant>,
        fallback: Result<bool, SyncError>,
    ) -> Result<bool, SyncError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.queue.iter_mut().find(|n| n.ticket == ticket) {
            node.needs_removal = true;
            // Removing a blocker at the head may unblock compatible waiters behind it.
            Self::drain_wait_queue(&mut inner);
            return fallback;
        }
        drop(inner);
        match rx.try_recv() {
            Ok(grant) => Self::map_grant(Ok(grant)),
            Err(_) => Err(SyncError::Disposed),
        }
    }

    fn map_grant(res: Result<Grant, oneshot::error::RecvError>) -> Result<bool, SyncError> {
        match res {
            Ok(Grant::Acquired) => Ok(true),
            Ok(Grant::Interrupted(reason)) => Err(SyncError::Interrupted(reason)),
            Ok(Grant::Disposed) | Err(_) => Err(SyncError::Disposed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    /// A single-holder mutex role, the smallest possible lock policy.
    #[derive(Clone, Copy)]
    struct Exclusive;

    impl LockManager<bool> for Exclusive {
        fn is_allowed(&self, held: &bool) -> bool {
            !*held
        }

        fn acquire(&self, held: &mut bool) {
            *held = true;
        }

        fn release(&self, held: &mut bool) -> Result<(), SyncError> {
            if !*held {
                return Err(SyncError::NotInLock);
            }
            *held = false;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_try_acquire_and_release() {
        let sync = QueuedSynchronizer::new(false);
        assert!(sync.try_acquire(Exclusive).unwrap());
        assert!(!sync.try_acquire(Exclusive).unwrap());
        sync.release(Exclusive).unwrap();
        assert!(sync.try_acquire(Exclusive).unwrap());
    }

    #[tokio::test]
    async fn test_double_release_is_not_in_lock() {
        let sync = QueuedSynchronizer::new(false);
        assert!(sync.try_acquire(Exclusive).unwrap());
        sync.release(Exclusive).unwrap();
        assert_eq!(sync.release(Exclusive), Err(SyncError::NotInLock));
    }

    #[tokio::test]
    async fn test_fifo_handoff() {
        let sync = Arc::new(QueuedSynchronizer::new(false));
        assert!(sync.try_acquire(Exclusive).unwrap());

        let s2 = sync.clone();
        let waiter = tokio::spawn(async move { s2.acquire(Exclusive, None, None, true).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sync.has_waiters());

        sync.release(Exclusive).unwrap();
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_timeout_non_throwing_resolves_false() {
        let sync = Arc::new(QueuedSynchronizer::new(false));
        assert!(sync.try_acquire(Exclusive).unwrap());

        let got = sync.acquire(Exclusive, Some(Duration::from_millis(20)), None, false).await;
        assert_eq!(got, Ok(false));

        let got = sync.acquire(Exclusive, Some(Duration::from_millis(20)), None, true).await;
        assert_eq!(got, Err(SyncError::Timeout));
    }

    #[tokio::test]
    async fn test_zero_timeout_is_a_fair_try() {
        let sync = Arc::new(QueuedSynchronizer::new(false));
        let got = sync.acquire(Exclusive, Some(Duration::from_millis(0)), None, false).await;
        assert_eq!(got, Ok(true));
        let got = sync.acquire(Exclusive, Some(Duration::from_millis(0)), None, false).await;
        assert_eq!(got, Ok(false));
    }

    #[tokio::test]
    async fn test_cancellation_unlinks_wait_node() {
        let sync = Arc::new(QueuedSynchronizer::new(false));
        assert!(sync.try_acquire(Exclusive).unwrap());

        let token = CancellationToken::new();
        let s2 = sync.clone();
        let t2 = token.clone();
        let waiter = tokio::spawn(async move { s2.acquire(Exclusive, None, Some(&t2), true).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(SyncError::Cancelled));

        // The abandoned node must not dangle: a release should find no live waiters.
        sync.release(Exclusive).unwrap();
        assert!(!sync.has_waiters());
    }

    #[tokio::test]
    async fn test_interrupt_fails_all_waiters() {
        let sync = Arc::new(QueuedSynchronizer::new(false));
        assert!(sync.try_acquire(Exclusive).unwrap());

        let mut waiters = Vec::new();
        for _ in 0..10 {
            let s = sync.clone();
            waiters.push(tokio::spawn(async move { s.acquire(Exclusive, None, None, true).await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        sync.interrupt("shutdown");
        for w in waiters {
            match w.await.unwrap() {
                Err(SyncError::Interrupted(reason)) => assert_eq!(&*reason, "shutdown"),
                other => panic!("expected Interrupted, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_dispose_rejects_everything() {
        let sync = Arc::new(QueuedSynchronizer::new(false));
        assert!(sync.try_acquire(Exclusive).unwrap());

        let s2 = sync.clone();
        let waiter = tokio::spawn(async move { s2.acquire(Exclusive, None, None, true).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        sync.dispose();
        assert_eq!(waiter.await.unwrap(), Err(SyncError::Disposed));
        assert_eq!(sync.try_acquire(Exclusive), Err(SyncError::Disposed));
        assert_eq!(sync.acquire(Exclusive, None, None, true).await, Err(SyncError::Disposed));
    }
}
