//! Central tunables.
//!
//! The teacher scatters these as magic numbers across `mm::paging`,
//! `smp::percpu`, and `process::pid` (`PAGE_SIZE`, `MAX_CPUS`, `MAX_PIDS`).
//! Collecting them in one module is a straight generalization of that
//! pattern, not new behavior.

/// Bytes per physical/virtual page on every supported architecture.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Upper bound on the number of schedulable CPUs.
pub const MAX_CPUS: usize = 32;

/// Scheduler quantum, in microseconds.
pub const SCHED_QUANTUM_US: u64 = 3_000;

/// Priority levels, 0 (lowest) through 31 (highest, reserved for realtime).
pub const NUM_PRIORITIES: usize = 32;

/// How far a thread's current priority may drift from its configured
/// maximum as a CPU-bound penalty / sleep-before-quantum bonus.
pub const PRIORITY_PENALTY_RANGE: u8 = 5;

/// Largest power-of-two order served by the physical page allocator's
/// buddy-style freelists (order 10 == 4 MiB contiguous runs at PAGE_SIZE=4096).
pub const MAX_PAGE_ORDER: u8 = 10;

/// Allocations up to this size (in quantum-arena units) are served from a
/// per-size object cache rather than a freelist search.
pub const ARENA_QCACHE_MAX: usize = 32;

/// Preallocated DPC request slots; exhaustion is fatal rather than a
/// dynamic allocation, matching the teacher's avoid-alloc-in-irq stance.
pub const DPC_POOL_SIZE: usize = 128;

/// Maximum live handles in a single process's handle table.
pub const MAX_HANDLES_PER_PROCESS: usize = 4096;

/// Maximum concurrently live process ids, mirroring `process::pid::MAX_PIDS`.
pub const MAX_PIDS: usize = 32768;

/// Bytes reserved for each thread's kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Default fixed-size message buffer for a single log line.
pub const LOG_MESSAGE_CAP: usize = 256;

/// Depth of the in-memory log ring buffer.
pub const LOG_RING_CAPACITY: usize = 4096;

use core::sync::atomic::{AtomicBool, Ordering};

static ASLR_ENABLED: AtomicBool = AtomicBool::new(false);

/// Whether address-space creation should perturb stack/heap/mmap placement.
/// Off by default so tests get a deterministic, fixed layout.
pub fn aslr_enabled() -> bool {
    ASLR_ENABLED.load(Ordering::Relaxed)
}

pub fn set_aslr_enabled(enabled: bool) {
    ASLR_ENABLED.store(enabled, Ordering::Relaxed);
}
