//! Blocking synchronization primitives.
//!
//! Everything here is built on [`WaitQueue`]: an interrupt-safe spinlock
//! coupled to a FIFO of blocked threads and to the state the waiters test.

pub mod mutex;
pub mod rcu;
pub mod rwlock;
pub mod semaphore;
pub mod waitqueue;

pub use mutex::Mutex;
pub use rcu::{RcuCell, RcuReadGuard};
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
pub use waitqueue::{WaitQueue, WaitQueueGuard};
