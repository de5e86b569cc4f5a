//! Primitive synchronization: IRQ-saving spinlocks, interruptible wait
//! queues, and the deferred-procedure-call (DPC) worker queue.

pub mod dpc;
pub mod semaphore;
pub mod spinlock;
pub mod waitqueue;

pub use semaphore::Semaphore;
pub use spinlock::{Spinlock, SpinlockGuard};
pub use waitqueue::{WaitQueue, WaitResult};
