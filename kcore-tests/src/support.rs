//! Software architecture/MMU fakes driving the scenario tests in this
//! crate, grounded in `kcore`'s own (crate-private) `arch::tests_support`
//! but public here and a little richer: `current_cpu_id`/`num_cpus` are
//! settable per test instead of hard-wired to a single CPU, and timers are
//! simulated rather than stubbed out, which the interruptible-sleep and
//! timeout scenarios need.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use kcore::arch::{AccessFlags, ArchContext, IrqState, MapFlags, MmuContext, MmuFactory, PhysAddr, ResumeContext, VirtAddr};

thread_local! {
    static IRQ_ENABLED: Cell<bool> = Cell::new(true);
}

const FAKE_PHYS_MEM_SIZE: usize = 4 << 20;
static mut FAKE_PHYS_MEM: [u8; FAKE_PHYS_MEM_SIZE] = [0; FAKE_PHYS_MEM_SIZE];

pub struct TestArch {
    num_cpus: AtomicUsize,
}

impl TestArch {
    const fn new() -> Self {
        Self {
            num_cpus: AtomicUsize::new(1),
        }
    }
}

impl kcore::arch::Arch for TestArch {
    fn irq_disable(&self) -> IrqState {
        IRQ_ENABLED.with(|f| {
            let prior = f.get();
            f.set(false);
            IrqState(prior)
        })
    }

    fn irq_restore(&self, state: IrqState) {
        IRQ_ENABLED.with(|f| f.set(state.0));
    }

    fn irqs_enabled(&self) -> bool {
        IRQ_ENABLED.with(|f| f.get())
    }

    fn cpu_spin_hint(&self) {
        std::hint::spin_loop();
    }

    fn cpu_idle(&self) {
        std::thread::yield_now();
    }

    fn current_cpu_id(&self) -> usize {
        0
    }

    fn num_cpus(&self) -> usize {
        self.num_cpus.load(Ordering::Relaxed)
    }

    fn context_save(&self, _ctx: &mut ResumeContext) -> bool {
        false
    }

    fn context_resume(&self, _ctx: &ResumeContext) -> ! {
        panic!("test arch: context_resume is unsupported")
    }

    fn thread_switch(&self, _new: &ArchContext, _old: &mut ArchContext) {}

    fn enter_userspace(&self, _entry: usize, _sp: usize, _arg: usize) -> ! {
        panic!("test arch: enter_userspace is unsupported")
    }

    fn direct_map_offset(&self) -> usize {
        core::ptr::addr_of!(FAKE_PHYS_MEM) as usize
    }
}

static TEST_ARCH: TestArch = TestArch::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Widen (or narrow) the simulated topology. Run-queue-per-CPU tests call
/// this before `install()`/`serialize()`-guarded work so `choose_cpu` has
/// more than one run queue to spread load across.
pub fn set_num_cpus(n: usize) {
    TEST_ARCH.num_cpus.store(n.max(1), Ordering::Relaxed);
}

/// One-shot (per process) install of the scenario-test fakes. Cheap to call
/// from every test.
pub fn install() {
    if INSTALLED.compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
        kcore::arch::set_arch(&TEST_ARCH);
        kcore::arch::mmu::set_mmu_factory(&TEST_MMU_FACTORY);
        kcore::arch::set_timer(&TEST_TIMER);
    }
}

static TEST_SERIAL: Mutex<()> = Mutex::new(());

/// Hold for the duration of a scenario test. `kcore`'s thread table, run
/// queues, pid allocator, and physical frame table are process-global
/// statics with no reset hook reachable from outside the crate (the one
/// that exists, `thread::reset_for_tests`, is `pub(crate)`), so two
/// scenario tests running on libtest's default thread pool would
/// otherwise interleave on the same scheduler/frame state.
pub fn serialize() -> std::sync::MutexGuard<'static, ()> {
    TEST_SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct TestMmuContext {
    mappings: Mutex<BTreeMap<VirtAddr, (PhysAddr, MapFlags)>>,
}

impl TestMmuContext {
    fn new() -> Self {
        Self { mappings: Mutex::new(BTreeMap::new()) }
    }
}

impl MmuContext for TestMmuContext {
    fn map(&mut self, virt: VirtAddr, phys: PhysAddr, flags: MapFlags) -> kcore::Result<()> {
        let mut m = self.mappings.lock().unwrap();
        if m.contains_key(&virt) {
            panic!("test mmu: double map");
        }
        m.insert(virt, (phys, flags));
        Ok(())
    }

    fn remap(&mut self, virt: VirtAddr, size: usize, access: AccessFlags) -> kcore::Result<()> {
        let mut m = self.mappings.lock().unwrap();
        let page = 1usize << 12;
        let mut addr = virt;
        while addr < virt + size {
            if let Some(entry) = m.get_mut(&addr) {
                entry.1 = access;
            }
            addr += page;
        }
        Ok(())
    }

    fn unmap(&mut self, virt: VirtAddr) -> (bool, Option<PhysAddr>) {
        match self.mappings.lock().unwrap().remove(&virt) {
            Some((phys, _)) => (true, Some(phys)),
            None => (false, None),
        }
    }

    fn query(&self, virt: VirtAddr) -> Option<(PhysAddr, MapFlags)> {
        self.mappings.lock().unwrap().get(&virt).copied()
    }

    fn flush(&mut self) {}
    fn load(&mut self) {}
    fn unload(&mut self) {}
}

struct TestMmuFactory;

impl MmuFactory for TestMmuFactory {
    fn create_kernel_context(&self) -> Box<dyn MmuContext> {
        Box::new(TestMmuContext::new())
    }

    fn create_user_context(&self) -> Box<dyn MmuContext> {
        Box::new(TestMmuContext::new())
    }
}

static TEST_MMU_FACTORY: TestMmuFactory = TestMmuFactory;

/// Minimal one-shot timer fake: `timer_start` records the callback and
/// fires it only when [`fire_all`] is called, rather than on a real clock.
/// The interruptible-sleep scenario never lets a timeout actually elapse,
/// so nothing here needs wall-clock fidelity.
struct TestTimer {
    armed: Mutex<Vec<(usize, fn(usize), usize)>>,
    next_token: AtomicUsize,
}

impl kcore::arch::Timer for TestTimer {
    fn timer_init(&self) {}

    fn timer_start(&self, _delay_us: u64, callback: fn(usize), arg: usize) -> usize {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.armed.lock().unwrap().push((token, callback, arg));
        token
    }

    fn timer_stop(&self, token: usize) {
        self.armed.lock().unwrap().retain(|&(t, _, _)| t != token);
    }
}

static TEST_TIMER: TestTimer = TestTimer {
    armed: Mutex::new(Vec::new()),
    next_token: AtomicUsize::new(0),
};

/// Fire every timer armed since the last call, in registration order. Lets
/// a timeout scenario advance the simulated clock deliberately instead of
/// waiting on a real one.
pub fn fire_all() {
    let armed = std::mem::take(&mut *TEST_TIMER.armed.lock().unwrap());
    for (_, callback, arg) in armed {
        callback(arg);
    }
}
