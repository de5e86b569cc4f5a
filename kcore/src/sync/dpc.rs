//! Deferred-procedure-call queue (§4.C), grounded in the teacher's
//! preallocated-pool-plus-worker-thread pattern for IRQ-safe work handoff
//! (`smp::percpu` defers cross-CPU work the same way: never allocate on the
//! IRQ-safe path, always hand off to a worker).
//!
//! The pool is preallocated at [`init`] so [`request`] — callable from
//! interrupt context — never touches the allocator. Exhaustion is fatal:
//! the pool must be provisioned large enough for the system's peak deferred
//! work, not grown dynamically.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::config::DPC_POOL_SIZE;
use crate::sched::thread::{self, ThreadFlags, ThreadId};
use crate::sync::spinlock::Spinlock;
use crate::sync::Semaphore;

#[derive(Clone, Copy)]
struct Slot {
    func: Option<fn(usize)>,
    arg: usize,
}

struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    pending: VecDeque<u32>,
}

static STATE: Spinlock<Option<Inner>> = Spinlock::new(None);
static READY: Semaphore = Semaphore::new(0);

/// Preallocate the request-slot pool. Idempotent; later calls are no-ops.
pub fn init() {
    let mut guard = STATE.lock_irqsave();
    if guard.is_some() {
        return;
    }
    let slots = alloc::vec![Slot { func: None, arg: 0 }; DPC_POOL_SIZE];
    let free = (0..DPC_POOL_SIZE as u32).collect();
    *guard = Some(Inner {
        slots,
        free,
        pending: VecDeque::new(),
    });
}

/// Queue `func(arg)` to run on the DPC worker thread. IRQ-safe: never
/// allocates, never blocks. Fatal if the preallocated pool is exhausted
/// (§4.C "pool exhaustion is fatal").
pub fn request(func: fn(usize), arg: usize) {
    let mut guard = STATE.lock_irqsave();
    let inner = guard
        .as_mut()
        .unwrap_or_else(|| crate::error::panic("dpc: request before init"));
    let idx = inner
        .free
        .pop()
        .unwrap_or_else(|| crate::error::panic("dpc: request-slot pool exhausted"));
    inner.slots[idx as usize] = Slot { func: Some(func), arg };
    inner.pending.push_back(idx);
    drop(guard);
    READY.signal();
}

/// Run exactly one pending request, blocking until one is available. The
/// worker loop's body; also directly callable by tests that want to drain
/// requests without a running scheduler thread.
pub fn worker_step() {
    READY.wait();
    let (func, arg, idx) = {
        let mut guard = STATE.lock_irqsave();
        let inner = guard.as_mut().unwrap_or_else(|| crate::error::panic("dpc: worker_step before init"));
        let idx = inner
            .pending
            .pop_front()
            .unwrap_or_else(|| crate::error::panic("dpc: semaphore signaled with an empty pending list"));
        let slot = inner.slots[idx as usize];
        (slot.func, slot.arg, idx)
    };
    // Run the function with the table lock released, per §4.C: the worker
    // "releases its spinlock, runs the function, re-acquires lock".
    if let Some(f) = func {
        f(arg);
    }
    let mut guard = STATE.lock_irqsave();
    guard.as_mut().unwrap().free.push(idx);
}

/// Non-blocking probe: run one pending request if any is queued, without
/// parking or spinning the calling thread. Returns whether a request ran.
/// Uses [`Spinlock::try_lock_irqsave`] rather than `lock_irqsave` so a
/// caller that must never block (e.g. an interrupt handler polling for
/// leftover work) gives up cleanly on contention instead of spinning.
pub fn try_worker_step() -> bool {
    if !READY.try_wait() {
        return false;
    }
    let (func, arg, idx) = {
        let Some(mut guard) = STATE.try_lock_irqsave() else {
            // Lost the race for STATE; put the unit back so nothing is lost.
            READY.signal();
            return false;
        };
        let inner = guard.as_mut().unwrap_or_else(|| crate::error::panic("dpc: try_worker_step before init"));
        let idx = inner
            .pending
            .pop_front()
            .unwrap_or_else(|| crate::error::panic("dpc: semaphore signaled with an empty pending list"));
        let slot = inner.slots[idx as usize];
        (slot.func, slot.arg, idx)
    };
    if let Some(f) = func {
        f(arg);
    }
    let mut guard = STATE.lock_irqsave();
    guard.as_mut().unwrap().free.push(idx);
    true
}

fn worker_loop(_: usize) {
    loop {
        worker_step();
    }
}

/// Create (but do not yet schedule) the DPC worker kernel thread. Callers
/// run it with [`crate::sched::thread::run`] once boot is far enough along
/// to start the scheduler.
pub fn spawn_worker() -> ThreadId {
    init();
    thread::create("dpc-worker", None, ThreadFlags::KERNEL, 16, worker_loop, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    fn record(arg: usize) {
        SEEN.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn request_then_step_runs_the_function() {
        init();
        SEEN.store(0, Ordering::SeqCst);
        request(record, 7);
        try_worker_step();
        assert_eq!(SEEN.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn step_with_nothing_pending_is_a_noop() {
        init();
        assert!(!try_worker_step());
    }

    #[test]
    fn freed_slots_are_reused() {
        init();
        let before_free = STATE.lock_irqsave().as_ref().unwrap().free.len();
        request(record, 1);
        try_worker_step();
        let after_free = STATE.lock_irqsave().as_ref().unwrap().free.len();
        assert_eq!(before_free, after_free);
    }

    /// `try_worker_step` must give up rather than block when `STATE` is
    /// already held, and must not drop the pending unit it gave up on.
    #[test]
    fn try_worker_step_backs_off_when_state_is_held() {
        init();
        SEEN.store(0, Ordering::SeqCst);
        request(record, 9);
        let guard = STATE.lock_irqsave();
        assert!(!try_worker_step());
        drop(guard);
        assert!(try_worker_step());
        assert_eq!(SEEN.load(Ordering::SeqCst), 9);
    }
}
