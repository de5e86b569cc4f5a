//! Load-balanced insertion across CPUs (§4.K "Insertion"), the one piece of
//! `choose_cpu` S5 never exercises since it pins everything to a single
//! simulated CPU. This widens the simulated topology instead and readies a
//! pile of randomly-prioritized threads, checking the ceiling-average
//! balancing invariant holds throughout rather than just at the end.
//!
//! Must run in its own process: `support::set_num_cpus` only has an effect
//! before `kcore`'s run-queue table (a process-wide lazy static) is first
//! touched, so this cannot share a binary with `scenarios.rs`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kcore::sched::thread::ThreadFlags;
use kcore::sched::{scheduler, thread};

use kcore_tests::support;

fn noop_entry(_: usize) {}

#[test]
fn readying_many_threads_spreads_them_within_the_ceiling_average() {
    let _guard = support::serialize();
    support::set_num_cpus(4);
    support::install();
    scheduler::init();

    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let mut tids = Vec::new();
    for i in 0..64 {
        let prio = rng.gen_range(0..=31u8);
        let tid = thread::create(&format!("worker-{i}"), None, ThreadFlags::empty(), prio, noop_entry, 0);
        scheduler::ready(tid);
        tids.push(tid);

        let loads: Vec<usize> = (0..4).map(|cpu| scheduler::stats(cpu).runqueue_len).collect();
        let total: usize = loads.iter().sum();
        let n = loads.len();
        let ceiling_avg = (total + n - 1) / n;
        assert!(
            loads.iter().all(|&l| l <= ceiling_avg),
            "no run queue should exceed the ceiling average after balanced insertion: {loads:?}"
        );
    }

    let total_len: usize = (0..4).map(|cpu| scheduler::stats(cpu).runqueue_len).sum();
    assert_eq!(total_len, tids.len(), "every readied thread must land on exactly one run queue");
}
