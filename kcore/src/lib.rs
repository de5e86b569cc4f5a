//! Core kernel subsystem: process address spaces, the physical page cache,
//! and preemptive SMP thread scheduling.
//!
//! The crate is `no_std` in production and links `std` under `cfg(test)` so
//! that its own unit tests can run on the host toolchain without a second
//! build profile.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod arch;
pub mod config;
pub mod error;
pub mod handle;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod util;
pub mod vm;

pub use error::{Errno, KernelError, Result};
pub use handle::{HandleId, HandleTable, HandleType, KernelObject};
pub use sched::{process, scheduler, thread, Capabilities, Identity, Pid, Process, ProcessFlags, ProcessState, Thread, ThreadFlags, ThreadId, ThreadState};
pub use sync::{dpc, Semaphore, Spinlock, SpinlockGuard, WaitQueue, WaitResult};
pub use vm::{AddressSpace, PageSource, Region};

/// Bring the kernel-wide singletons (DPC queue, reaper, pid registry) up
/// in the order later-layer `init`s assume: the DPC queue has no
/// dependency on the others, but [`sched::process::init`] must run before
/// any [`sched::process::create`] so the reap hook is wired before a
/// thread can ever exit.
pub fn init() {
    sync::dpc::init();
    sched::scheduler::init();
    sched::process::init();
}
