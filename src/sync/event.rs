//! Reset events, completion pipes and cancellation tokens.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::error::SyncError;
use crate::sync::queued::LockManager;
use crate::sync::queued::QueuedSynchronizer;

/// A cancellation token observed by every public async operation of the
/// synchronization primitives.
///
/// Cloning shares the underlying flag; once `cancel` is called, every waiter
/// at a suspension point resolves with `SyncError::Cancelled`.
#[derive(Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<bool>,
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the token fires. Never resolves for a token that is
    /// never cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

struct EventState {
    signaled: bool,
}

/// A waiter against a manual-reset event: granted while signaled, does not
/// consume the signal.
#[derive(Clone, Copy)]
struct ManualWait;

impl LockManager<EventState> for ManualWait {
    fn is_allowed(&self, state: &EventState) -> bool {
        state.signaled
    }

    fn acquire(&self, _state: &mut EventState) {}

    fn release(&self, _state: &mut EventState) -> Result<(), SyncError> {
        Ok(())
    }
}

/// A waiter against an auto-reset event: the grant consumes the signal, so
/// exactly one waiter passes per `set`.
#[derive(Clone, Copy)]
struct AutoWait;

impl LockManager<EventState> for AutoWait {
    fn is_allowed(&self, state: &EventState) -> bool {
        state.signaled
    }

    fn acquire(&self, state: &mut EventState) {
        state.signaled = false;
    }

    fn release(&self, _state: &mut EventState) -> Result<(), SyncError> {
        Ok(())
    }
}

/// An event that, once set, lets every present and future waiter through
/// until explicitly reset.
pub struct AsyncManualResetEvent {
    sync: QueuedSynchronizer<EventState, ManualWait>,
}

impl AsyncManualResetEvent {
    pub fn new(signaled: bool) -> Self {
        Self {
            sync: QueuedSynchronizer::new(EventState { signaled }),
        }
    }

    pub fn set(&self) {
        self.sync.update_state(|s| s.signaled = true);
    }

    pub fn reset(&self) {
        self.sync.update_state(|s| s.signaled = false);
    }

    pub fn is_set(&self) -> bool {
        self.sync.with_state(|s| s.signaled)
    }

    /// Suspend until the event is set.
    pub async fn wait(&self) -> Result<(), SyncError> {
        self.sync.acquire(ManualWait, None, None, true).await.map(|_| ())
    }

    /// Suspend until the event is set, the timeout fires, or the token fires.
    /// Resolves `Ok(false)` on timeout when `throw_on_timeout` is false.
    pub async fn wait_with(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
        throw_on_timeout: bool,
    ) -> Result<bool, SyncError> {
        self.sync.acquire(ManualWait, timeout, cancel, throw_on_timeout).await
    }
}

/// An event that releases exactly one waiter per `set`.
pub struct AsyncAutoResetEvent {
    sync: QueuedSynchronizer<EventState, AutoWait>,
}

impl AsyncAutoResetEvent {
    pub fn new(signaled: bool) -> Self {
        Self {
            sync: QueuedSynchronizer::new(EventState { signaled }),
        }
    }

    pub fn set(&self) {
        self.sync.update_state(|s| s.signaled = true);
    }

    pub fn is_set(&self) -> bool {
        self.sync.with_state(|s| s.signaled)
    }

    pub async fn wait(&self) -> Result<(), SyncError> {
        self.sync.acquire(AutoWait, None, None, true).await.map(|_| ())
    }

    pub async fn wait_with(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
        throw_on_timeout: bool,
    ) -> Result<bool, SyncError> {
        self.sync.acquire(AutoWait, timeout, cancel, throw_on_timeout).await
    }
}

/// A completion pipe: consumers subscribe, and the next `complete` call
/// delivers its value to every subscriber registered at that point, in
/// subscription order.
pub struct AsyncCompletionPipe<T> {
    waiters: Mutex<Option<Vec<oneshot::Sender<T>>>>,
}

impl<T: Clone> AsyncCompletionPipe<T> {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Some(Vec::new())),
        }
    }

    /// Register for the next completion.
    pub fn subscribe(&self) -> Result<oneshot::Receiver<T>, SyncError> {
        let mut waiters = self.waiters.lock().unwrap();
        match waiters.as_mut() {
            Some(list) => {
                let (tx, rx) = oneshot::channel();
                list.push(tx);
                Ok(rx)
            }
            None => Err(SyncError::Disposed),
        }
    }

    /// Suspend until the next completion.
    pub async fn wait(&self) -> Result<T, SyncError> {
        let rx = self.subscribe()?;
        rx.await.map_err(|_| SyncError::Disposed)
    }

    /// Deliver `value` to every present subscriber.
    pub fn complete(&self, value: T) {
        let pending = {
            let mut waiters = self.waiters.lock().unwrap();
            match waiters.as_mut() {
                Some(list) => std::mem::take(list),
                None => return,
            }
        };
        for tx in pending {
            let _ = tx.send(value.clone());
        }
    }

    /// Drop all subscribers and refuse new ones.
    pub fn dispose(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        *waiters = None;
    }
}

impl<T: Clone> Default for AsyncCompletionPipe<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_manual_reset_event_releases_all() {
        let event = Arc::new(AsyncManualResetEvent::new(false));
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let e = event.clone();
            waiters.push(tokio::spawn(async move { e.wait().await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        event.set();
        for w in waiters {
            w.await.unwrap().unwrap();
        }
        // Still set: a late waiter passes without suspending.
        event.wait().await.unwrap();
        event.reset();
        assert!(!event.is_set());
    }

    #[tokio::test]
    async fn test_auto_reset_event_releases_one() {
        let event = AsyncAutoResetEvent::new(true);
        event.wait().await.unwrap();
        assert!(!event.is_set());
        let ok = event.wait_with(Some(Duration::from_millis(10)), None, false).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_completion_pipe_delivers_in_order() {
        let pipe = Arc::new(AsyncCompletionPipe::<u64>::new());
        let a = pipe.subscribe().unwrap();
        let b = pipe.subscribe().unwrap();
        pipe.complete(7);
        assert_eq!(a.await.unwrap(), 7);
        assert_eq!(b.await.unwrap(), 7);

        // New subscribers only see the next cycle.
        let c = pipe.subscribe().unwrap();
        pipe.complete(9);
        assert_eq!(c.await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_cancellation_token_fires_once() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }
}
