//! Process (§3 Process, §4.J), grounded in the teacher's `process::Process`
//! struct (address space + fd table + task list fused together), split
//! here into its own layer since the spec keeps thread (I) and scheduler
//! (K) as components a process composes rather than owns outright.
//!
//! Process ids are drawn from the same [`RangeArena`] generalization the
//! physical page allocator uses (§4.E "the same allocator... backs the
//! physical page allocator and process ids").

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::config::MAX_PIDS;
use crate::error::{KernelError, Result};
use crate::handle::HandleTable;
use crate::mm::arena::RangeArena;
use crate::sched::scheduler;
use crate::sched::thread::{self, EntryFn, Pid, ThreadFlags, ThreadId};
use crate::sync::Spinlock;
use crate::vm::AddressSpace;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcessFlags: u32 {
        /// Termination (even voluntary exit) is a fatal kernel error —
        /// reserved for processes the system cannot run without (§4.J
        /// `detach`).
        const CRITICAL = 1 << 0;
        /// Every thread's scheduling priority is pinned to the process's
        /// base priority; per-thread priority requests are ignored.
        const FIXED_PRIORITY = 1 << 1;
    }
}

/// Process identity (§3 Process "identity (uid/gid)"), grounded in the
/// teacher's `process::task::Credentials`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Default for Identity {
    fn default() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

bitflags::bitflags! {
    /// Capability bitmap (§3 Process "capability bitmap"). A child may only
    /// be created with a subset of its parent's capabilities; the kernel
    /// process (no parent) may be granted any set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// May create and tear down other processes.
        const SPAWN_PROCESS = 1 << 0;
        /// May raise a thread's scheduling priority above its own drift floor.
        const SET_PRIORITY = 1 << 1;
        /// May force-kill a thread or process it does not own.
        const KILL = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Dead,
}

/// A schedulable unit of isolation: one address space, one handle table,
/// one or more threads (§3 "Process").
pub struct Process {
    pub pid: Pid,
    name: [u8; 32],
    name_len: u8,
    pub parent: Option<Pid>,
    pub address_space: Arc<AddressSpace>,
    pub handles: HandleTable,
    pub flags: ProcessFlags,
    pub priority_class: u8,
    pub identity: Identity,
    pub capabilities: Capabilities,
    threads: Spinlock<Vec<ThreadId>>,
    state: Spinlock<ProcessState>,
    exit_status: AtomicI32,
    notifiers: Spinlock<Vec<fn(Pid, i32)>>,
}

impl Process {
    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock_irqsave()
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock_irqsave().len()
    }
}

static PROCESSES: Spinlock<BTreeMap<Pid, Arc<Process>>> = Spinlock::new(BTreeMap::new());
static PID_ARENA: RangeArena = RangeArena::new(1, 0);
static PID_ARENA_INIT: spin::Once<()> = spin::Once::new();

fn ensure_pid_arena() {
    PID_ARENA_INIT.call_once(|| {
        // Pid 0 is reserved for the kernel process and never handed out.
        PID_ARENA.add(1, MAX_PIDS as u64 - 1).expect("pid arena double-init");
    });
}

/// Seed the pid arena and wire the thread layer's death hook to
/// [`on_thread_exit`]. Call once at boot before any [`create`].
pub fn init() {
    ensure_pid_arena();
    thread::set_reap_hook(on_thread_exit);
}

fn alloc_pid() -> Result<Pid> {
    ensure_pid_arena();
    PID_ARENA.alloc(1, false).map(|p| p as Pid)
}

/// Build a new process with a fresh address space and handle table, and
/// spawn its main thread at `entry(arg)` (§4.J `create`). Loading `name`'s
/// image into the address space and populating `args`/`env` is the
/// out-of-scope ELF loader's job; callers that need that must map the
/// image themselves before running the returned process's main thread.
///
/// `capabilities` must be a subset of `parent`'s own capabilities — a
/// process can never grant its child more than it holds itself. The
/// pidless (kernel) process is exempt since it has no parent to check
/// against.
pub fn create(
    name: &str,
    parent: Option<Pid>,
    flags: ProcessFlags,
    priority_class: u8,
    identity: Identity,
    capabilities: Capabilities,
    entry: EntryFn,
    arg: usize,
) -> Result<Arc<Process>> {
    if let Some(parent_pid) = parent {
        let parent_proc = lookup(parent_pid).ok_or(KernelError::NotFound)?;
        if !parent_proc.capabilities.contains(capabilities) {
            return Err(KernelError::PermDenied);
        }
    }
    let pid = alloc_pid()?;
    let mut name_buf = [0u8; 32];
    let bytes = name.as_bytes();
    let len = core::cmp::min(bytes.len(), 32);
    name_buf[..len].copy_from_slice(&bytes[..len]);

    let address_space = AddressSpace::create_user();
    address_space.incref();

    let process = Arc::new(Process {
        pid,
        name: name_buf,
        name_len: len as u8,
        parent,
        address_space,
        handles: HandleTable::new(),
        flags,
        priority_class: core::cmp::min(priority_class, 3),
        identity,
        capabilities,
        threads: Spinlock::new(Vec::new()),
        state: Spinlock::new(ProcessState::Running),
        exit_status: AtomicI32::new(0),
        notifiers: Spinlock::new(Vec::new()),
    });

    PROCESSES.lock_irqsave().insert(pid, process.clone());

    let thread_prio = scheduler::priority_for(process.priority_class, 2);
    let tid = thread::create(name, Some(pid), ThreadFlags::empty(), thread_prio, entry, arg);
    process.threads.lock_irqsave().push(tid);
    thread::run(tid);

    Ok(process)
}

pub fn lookup(pid: Pid) -> Option<Arc<Process>> {
    PROCESSES.lock_irqsave().get(&pid).cloned()
}

/// Spawn an additional thread owned by `process` (§6 `thread_create` +
/// `process_attach`). Priority is clamped to the process's own base
/// priority when [`ProcessFlags::FIXED_PRIORITY`] is set.
pub fn spawn_thread(process: &Arc<Process>, name: &str, priority: u8, entry: EntryFn, arg: usize) -> ThreadId {
    let prio = if process.flags.contains(ProcessFlags::FIXED_PRIORITY) {
        scheduler::priority_for(process.priority_class, 2)
    } else {
        scheduler::priority_for(process.priority_class, priority)
    };
    let tid = thread::create(name, Some(process.pid), ThreadFlags::empty(), prio, entry, arg);
    process.threads.lock_irqsave().push(tid);
    thread::run(tid);
    tid
}

/// Register a callback to run, with the exiting pid and its exit status,
/// once this process's last thread is reaped (§4.J "death-notifier").
pub fn watch(pid: Pid, callback: fn(Pid, i32)) -> Result<()> {
    let process = lookup(pid).ok_or(KernelError::NotFound)?;
    process.notifiers.lock_irqsave().push(callback);
    Ok(())
}

/// Terminate the whole process from one of its own threads: kill every
/// sibling thread, then exit the caller (§4.J `exit`). Never returns.
pub fn exit(pid: Pid, status: i32) -> ! {
    let Some(process) = lookup(pid) else {
        crate::error::panic("process: exit on unknown pid");
    };
    *process.state.lock_irqsave() = ProcessState::Dead;
    process.exit_status.store(status, Ordering::Release);
    let current = scheduler::current_thread();
    let siblings: Vec<ThreadId> = process.threads.lock_irqsave().iter().copied().filter(|&t| t != current).collect();
    for tid in siblings {
        thread::kill(tid);
    }
    thread::exit(current);
}

/// Thread-layer death hook (registered by [`init`]): removes the reaped
/// thread from its owning process and, once the last one is gone, tears
/// the process down (§4.J `detach`).
fn on_thread_exit(tid: ThreadId, owner: Option<Pid>) {
    let Some(pid) = owner else { return };
    let Some(process) = lookup(pid) else { return };
    let remaining = {
        let mut threads = process.threads.lock_irqsave();
        threads.retain(|&t| t != tid);
        threads.len()
    };
    if remaining == 0 {
        detach_last(&process);
    }
}

/// Last-thread-out teardown: close every handle, tear down the address
/// space, run death notifiers, remove the process from the registry and
/// free its pid, and — if [`ProcessFlags::CRITICAL`] is set — treat
/// termination as a fatal kernel error (§4.J "detach").
fn detach_last(process: &Arc<Process>) {
    process.handles.destroy_all();
    process.address_space.decref();
    let _ = process.address_space.destroy();
    *process.state.lock_irqsave() = ProcessState::Dead;
    let status = process.exit_status();
    for cb in process.notifiers.lock_irqsave().iter() {
        cb(process.pid, status);
    }
    PROCESSES.lock_irqsave().remove(&process.pid);
    PID_ARENA.free(process.pid as u64, 1);
    if process.flags.contains(ProcessFlags::CRITICAL) {
        crate::error::panic("process: critical process terminated");
    }
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    *PROCESSES.lock_irqsave() = BTreeMap::new();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::tests_support::install_test_arch;
    use crate::mm::page;
    use crate::sched::scheduler;

    fn noop_entry(_: usize) {}

    fn setup() {
        install_test_arch();
        thread::reset_for_tests();
        reset_for_tests();
        scheduler::init();
        let _ = page::range_add(0, 4096 << crate::config::PAGE_SHIFT);
        init();
    }

    #[test]
    fn create_registers_a_running_process_with_one_thread() {
        setup();
        let process = create("init", None, ProcessFlags::empty(), 1, Identity::default(), Capabilities::empty(), noop_entry, 0).unwrap();
        assert_eq!(process.state(), ProcessState::Running);
        assert_eq!(process.thread_count(), 1);
        assert!(lookup(process.pid).is_some());
    }

    #[test]
    fn last_thread_exit_tears_the_process_down() {
        setup();
        let process = create("solo", None, ProcessFlags::empty(), 0, Identity::default(), Capabilities::empty(), noop_entry, 0).unwrap();
        let tid = process.threads.lock_irqsave()[0];
        thread::set_state(tid, thread::ThreadState::Dead);
        on_thread_exit(tid, Some(process.pid));
        assert!(lookup(process.pid).is_none());
    }

    #[test]
    fn watch_notifier_fires_with_the_exit_status() {
        use core::sync::atomic::{AtomicI32, Ordering};
        static LAST_STATUS: AtomicI32 = AtomicI32::new(-1);
        fn record(_pid: Pid, status: i32) {
            LAST_STATUS.store(status, Ordering::SeqCst);
        }
        setup();
        let process = create("watched", None, ProcessFlags::empty(), 0, Identity::default(), Capabilities::empty(), noop_entry, 0).unwrap();
        watch(process.pid, record).unwrap();
        process.exit_status.store(7, Ordering::Release);
        let tid = process.threads.lock_irqsave()[0];
        thread::set_state(tid, thread::ThreadState::Dead);
        on_thread_exit(tid, Some(process.pid));
        assert_eq!(LAST_STATUS.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn fixed_priority_process_ignores_thread_priority_requests() {
        setup();
        let process = create("pinned", None, ProcessFlags::FIXED_PRIORITY, 2, Identity::default(), Capabilities::empty(), noop_entry, 0).unwrap();
        let tid = spawn_thread(&process, "extra", 4, noop_entry, 0);
        let expected = scheduler::priority_for(2, 2);
        assert_eq!(thread::curr_prio(tid), expected);
    }
}
