//! Asynchronous synchronization primitives.
//!
//! All primitives in this module share one mechanism: a FIFO wait queue with
//! per-node completion, timeout, cancellation and interruption, implemented by
//! [`queued::QueuedSynchronizer`]. Each lock flavor contributes only a small
//! state struct and a set of lock-role policies; the queue discipline, the
//! head-of-line fairness rule and the failure semantics are common.

pub(crate) mod queued;

pub mod event;
pub mod rwlock;
pub mod shared;

pub use event::AsyncAutoResetEvent;
pub use event::AsyncCompletionPipe;
pub use event::AsyncManualResetEvent;
pub use event::CancellationToken;
pub use rwlock::AsyncReaderWriterLock;
pub use rwlock::LockStamp;
pub use shared::AsyncSharedLock;
