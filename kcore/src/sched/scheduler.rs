//! Per-CPU preemptive scheduler (§4.K), grounded in the teacher's
//! `smp::percpu::PerCpu` layout (one struct indexed by `current_cpu_id()`)
//! combined with the classic active/expired dual-array priority scheduler:
//! each CPU holds two [`PriorityQueue`]s, threads run from `active` until
//! their quantum expires into `expired`, and the two swap once `active`
//! drains. A 32-bit bitmap tracks which of the `NUM_PRIORITIES` levels are
//! non-empty so picking the next thread is a `leading_zeros` away rather
//! than a scan.

use alloc::vec::Vec;

use lazy_static::lazy_static;

use crate::arch;
use crate::config::{NUM_PRIORITIES, PRIORITY_PENALTY_RANGE, SCHED_QUANTUM_US};
use crate::sched::thread::{self, Pid, ThreadFlags, ThreadId, ThreadState};
use crate::sync::spinlock::Spinlock;

struct PriorityQueue {
    bitmap: u32,
    lists: Vec<Vec<ThreadId>>,
    len: usize,
}

impl PriorityQueue {
    fn new() -> Self {
        Self {
            bitmap: 0,
            lists: alloc::vec![Vec::new(); NUM_PRIORITIES],
            len: 0,
        }
    }

    fn push(&mut self, prio: u8, tid: ThreadId) {
        self.lists[prio as usize].push(tid);
        self.bitmap |= 1 << prio;
        self.len += 1;
    }

    fn pop_highest(&mut self) -> Option<ThreadId> {
        if self.bitmap == 0 {
            return None;
        }
        let prio = 31 - self.bitmap.leading_zeros();
        let list = &mut self.lists[prio as usize];
        let tid = list.remove(0);
        if list.is_empty() {
            self.bitmap &= !(1 << prio);
        }
        self.len -= 1;
        Some(tid)
    }

    fn is_empty(&self) -> bool {
        self.bitmap == 0
    }
}

struct RunQueue {
    active: PriorityQueue,
    expired: PriorityQueue,
    current: ThreadId,
    idle: ThreadId,
    quantum_remaining_us: u64,
    context_switches: u64,
    timer_ticks: u64,
}

impl RunQueue {
    fn new(idle: ThreadId) -> Self {
        Self {
            active: PriorityQueue::new(),
            expired: PriorityQueue::new(),
            current: idle,
            idle,
            quantum_remaining_us: SCHED_QUANTUM_US,
            context_switches: 0,
            timer_ticks: 0,
        }
    }

    fn load(&self) -> usize {
        self.active.len + self.expired.len
    }

    fn enqueue_ready(&mut self, tid: ThreadId, prio: u8) {
        self.active.push(prio, tid);
    }

    fn pick_next(&mut self) -> ThreadId {
        if self.active.is_empty() {
            core::mem::swap(&mut self.active, &mut self.expired);
        }
        self.active.pop_highest().unwrap_or(self.idle)
    }
}

lazy_static! {
    static ref RUN_QUEUES: Vec<Spinlock<RunQueue>> = {
        let n = arch::arch().num_cpus();
        (0..n).map(|cpu| Spinlock::new(RunQueue::new(thread::create_idle(cpu)))).collect()
    };
}

fn this_cpu() -> usize {
    arch::arch().current_cpu_id()
}

pub fn init() {
    lazy_static::initialize(&RUN_QUEUES);
}

pub fn current_thread() -> ThreadId {
    RUN_QUEUES[this_cpu()].lock_irqsave().current
}

/// `priority = 5 + process_priority_class*8 + (thread_priority-1)*2`,
/// clamped into `[0,31]` (§4.K). `process_priority_class` is `0..=3`,
/// `thread_priority` is `1..=4`; callers outside that range are clamped
/// rather than rejected, since this is an internal scheduling knob, not a
/// user-facing validated input.
pub const fn priority_for(process_priority_class: u8, thread_priority: u8) -> u8 {
    let raw = 5i32 + (process_priority_class as i32) * 8 + (thread_priority as i32 - 1) * 2;
    if raw < 0 {
        0
    } else if raw > 31 {
        31
    } else {
        raw as u8
    }
}

/// Choose a CPU for a thread with no sticky affinity yet, or recheck one
/// that already has a previous CPU: keep `prev` if its load is at or below
/// the ceiling of the average load across all CPUs; otherwise take the
/// first CPU strictly below that average, falling back to `prev` if none
/// qualifies (§4.K "Insertion").
fn choose_cpu(prev: Option<usize>) -> usize {
    let loads: Vec<usize> = RUN_QUEUES.iter().map(|rq| rq.lock_irqsave().load()).collect();
    let total: usize = loads.iter().sum();
    let n = loads.len();
    let ceiling_avg = (total + n - 1) / n;
    if let Some(p) = prev {
        if loads[p] <= ceiling_avg {
            return p;
        }
    }
    for (cpu, &load) in loads.iter().enumerate() {
        if load < ceiling_avg {
            return cpu;
        }
    }
    prev.unwrap_or(this_cpu())
}

/// Make a freshly created thread runnable for the first time.
pub fn ready(tid: ThreadId) {
    let cpu = choose_cpu(None);
    let prio = thread::curr_prio(tid);
    thread::set_state(tid, ThreadState::Ready);
    thread::with_mut(tid, |t| t.cpu = Some(cpu));
    RUN_QUEUES[cpu].lock_irqsave().enqueue_ready(tid, prio);
}

/// Return a blocked thread to the ready set after it was woken.
pub fn wake(tid: ThreadId) {
    let prev = thread::with(tid, |t| t.cpu).flatten();
    let cpu = choose_cpu(prev);
    let prio = thread::curr_prio(tid);
    thread::adjust_priority(tid, true);
    thread::set_state(tid, ThreadState::Ready);
    thread::with_mut(tid, |t| t.cpu = Some(cpu));
    RUN_QUEUES[cpu].lock_irqsave().enqueue_ready(tid, prio);
}

/// Voluntarily give up the CPU, or be forced off it by [`tick`]. Must be
/// called with IRQs already disabled; returns once this thread is chosen to
/// run again.
pub fn reschedule() {
    let cpu = this_cpu();
    let (old_tid, next_tid) = {
        let mut rq = RUN_QUEUES[cpu].lock_irqsave();
        let old_tid = rq.current;
        let next_tid = rq.pick_next();
        rq.current = next_tid;
        rq.quantum_remaining_us = SCHED_QUANTUM_US;
        if old_tid != next_tid {
            rq.context_switches += 1;
        }
        (old_tid, next_tid)
    };

    if old_tid == next_tid {
        return;
    }

    thread::with_mut(old_tid, |t| {
        if t.state == ThreadState::Running {
            t.state = ThreadState::Ready;
        }
    });
    if thread::state(old_tid) == Some(ThreadState::Ready) && !thread::with(old_tid, |t| t.flags.contains(ThreadFlags::IDLE)).unwrap_or(true) {
        let prio = thread::curr_prio(old_tid);
        RUN_QUEUES[cpu].lock_irqsave().expired.push(prio, old_tid);
    }

    thread::set_state(next_tid, ThreadState::Running);
    thread::with_mut(next_tid, |t| t.cpu = Some(cpu));

    let old_ctx = thread::raw_ctx(old_tid);
    let new_ctx = thread::raw_ctx(next_tid);
    // SAFETY: neither thread can be reaped while one is `Running` and the
    // other is mid-handoff to `Running`; both boxes are heap-stable.
    unsafe {
        arch::arch().thread_switch(&*new_ctx, &mut *old_ctx);
    }
}

/// Timer-driven quantum accounting (§4.K step 2): called on every scheduler
/// tick with the elapsed slice in microseconds. Applies the CPU-bound
/// penalty and forces a reschedule once the quantum is exhausted.
pub fn tick(elapsed_us: u64) {
    let cpu = this_cpu();
    let expired_quantum = {
        let mut rq = RUN_QUEUES[cpu].lock_irqsave();
        rq.timer_ticks += 1;
        if rq.quantum_remaining_us <= elapsed_us {
            rq.quantum_remaining_us = 0;
            true
        } else {
            rq.quantum_remaining_us -= elapsed_us;
            false
        }
    };
    if expired_quantum {
        let current = current_thread();
        if !thread::with(current, |t| t.flags.contains(ThreadFlags::IDLE)).unwrap_or(true) {
            thread::adjust_priority(current, false);
        }
        reschedule();
    }
}

/// Lowest priority level currently eligible for the CPU-bound penalty,
/// exposed for tests asserting the drift stays within range.
pub const fn penalty_floor(max_prio: u8) -> u8 {
    max_prio.saturating_sub(PRIORITY_PENALTY_RANGE)
}

/// Per-CPU scheduler snapshot for diagnostics, grounded in the teacher's
/// `process::scheduler_smp::stats()` / `SchedulerStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cpu_id: usize,
    pub current_pid: Option<Pid>,
    pub runqueue_len: usize,
    pub context_switches: u64,
    pub timer_ticks: u64,
    pub timeslice_remaining_us: u64,
}

pub fn stats(cpu: usize) -> SchedulerStats {
    let rq = RUN_QUEUES[cpu].lock_irqsave();
    SchedulerStats {
        cpu_id: cpu,
        current_pid: thread::owner(rq.current),
        runqueue_len: rq.load(),
        context_switches: rq.context_switches,
        timer_ticks: rq.timer_ticks,
        timeslice_remaining_us: rq.quantum_remaining_us,
    }
}

/// Sum over every CPU of its runqueue length plus, if its current thread is
/// the real (non-idle) running thread, one more (§8 testable property: this
/// must always equal the count of non-`Dead` threads outside `Sleeping`).
pub fn threads_running() -> usize {
    (0..RUN_QUEUES.len())
        .map(|cpu| {
            let rq = RUN_QUEUES[cpu].lock_irqsave();
            let mut n = rq.load();
            if rq.current != rq.idle && thread::state(rq.current) == Some(ThreadState::Running) {
                n += 1;
            }
            n
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::tests_support::install_test_arch;

    fn noop_entry(_: usize) {}

    #[test]
    fn highest_priority_runs_first() {
        install_test_arch();
        thread::reset_for_tests();
        init();
        let low = thread::create("low", None, ThreadFlags::empty(), 5, noop_entry, 0);
        let high = thread::create("high", None, ThreadFlags::empty(), 20, noop_entry, 0);
        ready(low);
        ready(high);
        let cpu = this_cpu();
        let picked = RUN_QUEUES[cpu].lock_irqsave().pick_next();
        assert_eq!(picked, high);
    }

    #[test]
    fn active_and_expired_swap_when_active_drains() {
        install_test_arch();
        thread::reset_for_tests();
        init();
        let a = thread::create("a", None, ThreadFlags::empty(), 10, noop_entry, 0);
        let cpu = this_cpu();
        {
            let mut rq = RUN_QUEUES[cpu].lock_irqsave();
            rq.expired.push(10, a);
            assert!(rq.active.is_empty());
        }
        let picked = RUN_QUEUES[cpu].lock_irqsave().pick_next();
        assert_eq!(picked, a);
    }
}
