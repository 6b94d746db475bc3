//! # Synchronization Primitives
//!
//! Mutexes with priority inheritance and counting semaphores. Both keep a
//! [`WaitQueue`](crate::list::WaitQueue) of blocked tasks and hand the
//! resource straight to the woken waiter, highest priority first.

pub mod mutex;
pub mod semaphore;

pub use mutex::MutexId;
pub use semaphore::SemaphoreId;
