//! The persistent worker pool and its launch barrier.
//!
//! Workers park on a condition variable between steps. A launch sets the
//! `launch` and `launch_count` counters, wakes everyone, fills the queues,
//! and waits for both `launch` and `running` to return to zero, at which
//! point the graph has drained and every worker is parked again.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::runner::{self, WorkerContext};

struct BarrierCounts {
    running: usize,
    launch: usize,
    launch_count: usize,
    shutdown: bool,
}

struct BarrierState {
    counts: Mutex<BarrierCounts>,
    cond: Condvar,
}

/// The pool: worker threads plus the barrier that gates them.
pub struct RunnerPool {
    barrier: Arc<BarrierState>,
    handles: Vec<JoinHandle<()>>,
    /// Number of workers.
    pub nr_threads: usize,
}

impl RunnerPool {
    /// Spawn `nr_threads` workers over the shared context. Workers park
    /// immediately; nothing runs until [`RunnerPool::launch`].
    pub fn new(ctx: Arc<WorkerContext>, nr_threads: usize, pin: bool) -> Self {
        let nr_threads = nr_threads.max(1);
        let barrier = Arc::new(BarrierState {
            counts: Mutex::new(BarrierCounts {
                running: nr_threads,
                launch: 0,
                launch_count: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let handles = (0..nr_threads)
            .map(|tid| {
                let barrier = Arc::clone(&barrier);
                let ctx = Arc::clone(&ctx);
                std::thread::Builder::new()
                    .name(format!("runner-{tid}"))
                    .spawn(move || {
                        if pin {
                            pin_to_core(tid);
                        }
                        worker_loop(&barrier, &ctx, tid);
                    })
                    .expect("failed to spawn runner thread")
            })
            .collect();

        RunnerPool {
            barrier,
            handles,
            nr_threads,
        }
    }

    /// Wake `nr_runners` workers, run `prelaunch` (queue filling) while they
    /// spin up, then block until the graph has drained and everyone is
    /// parked again.
    pub fn launch<F: FnOnce()>(&self, nr_runners: usize, prelaunch: F) {
        let nr_runners = nr_runners.min(self.nr_threads);
        {
            let mut counts = self.barrier.counts.lock().unwrap();
            // Wait for any stragglers from a previous launch.
            while counts.running > 0 {
                counts = self.barrier.cond.wait(counts).unwrap();
            }
            counts.launch = nr_runners;
            counts.launch_count = nr_runners;
            self.barrier.cond.notify_all();
        }

        prelaunch();

        let mut counts = self.barrier.counts.lock().unwrap();
        while counts.launch > 0 || counts.running > 0 {
            counts = self.barrier.cond.wait(counts).unwrap();
        }
    }

    /// Stop and join all workers.
    pub fn shutdown(&mut self) {
        {
            let mut counts = self.barrier.counts.lock().unwrap();
            counts.shutdown = true;
            self.barrier.cond.notify_all();
        }
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

impl Drop for RunnerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(barrier: &BarrierState, ctx: &WorkerContext, tid: usize) {
    loop {
        {
            let mut counts = barrier.counts.lock().unwrap();
            // This thread is no longer running.
            counts.running -= 1;
            if counts.running == 0 {
                barrier.cond.notify_all();
            }
            // Wait for the barrier to open for this thread.
            while !counts.shutdown
                && (counts.launch == 0 || tid >= counts.launch_count)
            {
                counts = barrier.cond.wait(counts).unwrap();
            }
            if counts.shutdown {
                return;
            }
            counts.running += 1;
            counts.launch -= 1;
            if counts.launch == 0 {
                barrier.cond.notify_all();
            }
        }

        runner::drain(ctx, tid);
    }
}

/// Bind the calling thread to a CPU, interleaving workers over the
/// available cores.
#[cfg(target_os = "linux")]
fn pin_to_core(tid: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let nr_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut set = CpuSet::new();
    if set.set(tid % nr_cpus).is_ok() {
        if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
            tracing::warn!("failed to pin runner {} to a core: {}", tid, e);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_tid: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpaceParams;
    use crate::scheduler::Scheduler;
    use crate::space::Space;
    use crate::task::{Task, TaskSubtype, TaskType};
    use crate::transport::MemoryTransport;
    use kernel::Timeline;
    use std::sync::atomic::AtomicI64;
    use std::sync::{Mutex, RwLock};

    fn empty_ctx(nr_queues: usize) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            space: RwLock::new(Space::new([1.0; 3], false, SpaceParams::default())),
            sched: Scheduler::new(nr_queues, 0),
            transport: Arc::new(MemoryTransport::solo()),
            timeline: Timeline::new(0.0, 1.0, kernel::MAX_NR_TIMESTEPS, 0.0, 1.0),
            ti_current: AtomicI64::new(0),
            params: Default::default(),
            node_id: 0,
            mesh: Mutex::new(Default::default()),
        })
    }

    #[test]
    fn launch_with_no_tasks_returns() {
        let ctx = empty_ctx(2);
        let pool = RunnerPool::new(Arc::clone(&ctx), 2, false);
        for _ in 0..3 {
            ctx.sched.hold();
            pool.launch(2, || {
                ctx.sched.start();
                ctx.sched.release();
            });
        }
    }

    #[test]
    fn launch_runs_an_init_task() {
        // A single init task on a single-cell space, built before the pool
        // exists.
        let mut space = Space::new([1.0; 3], false, SpaceParams::default());
        space
            .cells
            .push(crate::cell::Cell::new([0.0; 3], [1.0; 3], 0, 0));
        space.nr_top_cells = 1;

        let sched = Scheduler::new(1, 0);
        let id = sched.addtask(Task::new(
            TaskType::Init,
            TaskSubtype::None,
            0,
            Some(crate::cell::CellId(0)),
            None,
            false,
        ));
        sched.set_unlocks();
        sched.rank_tasks().unwrap();
        sched.reweight(&space);
        sched.tasks.read().unwrap()[id.idx()].activate();

        let ctx = Arc::new(WorkerContext {
            space: RwLock::new(space),
            sched,
            transport: Arc::new(MemoryTransport::solo()),
            timeline: Timeline::new(0.0, 1.0, kernel::MAX_NR_TIMESTEPS, 0.0, 1.0),
            ti_current: AtomicI64::new(0),
            params: Default::default(),
            node_id: 0,
            mesh: Mutex::new(Default::default()),
        });

        let pool = RunnerPool::new(Arc::clone(&ctx), 2, false);
        ctx.sched.hold();
        pool.launch(2, || {
            ctx.sched.start();
            ctx.sched.release();
        });
        assert_eq!(ctx.sched.waiting(), 0);
        assert!(!ctx.sched.aborted());
    }
}
