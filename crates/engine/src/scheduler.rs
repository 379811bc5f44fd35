//! The task scheduler: weight-keyed queues, unlock propagation, and the
//! per-step activation bookkeeping.
//!
//! Tasks are held in one flat list behind an `RwLock`: the graph builder
//! takes exclusive access between launches, workers share read access while
//! the graph drains and touch only the atomic fields. Each queue is a
//! mutex-protected binary heap keyed by task weight; a task enters its owner
//! queue when its `wait` counter reaches zero, and idle workers steal from
//! other queues in a bounded random order.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::cell::TaskId;
use crate::error::{EngineError, Result};
use crate::space::Space;
use crate::task::{Task, TaskSubtype, TaskType};

/// Heap entry: heavier tasks pop first, ties break on the task id so the
/// order is deterministic.
#[derive(Debug, PartialEq, Eq)]
struct QEntry {
    weight: i64,
    task: u32,
}

impl Ord for QEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.weight
            .cmp(&other.weight)
            .then(other.task.cmp(&self.task))
    }
}

impl PartialOrd for QEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The scheduler.
pub struct Scheduler {
    /// The task list. Writers: graph construction. Readers: the launch.
    pub tasks: RwLock<Vec<Task>>,
    /// Owner queue of each task, parallel to `tasks`.
    qids: RwLock<Vec<u32>>,
    /// Unlock edges accumulated during construction, compiled by
    /// [`Scheduler::set_unlocks`]. Only touched between launches.
    edges: Mutex<Vec<(TaskId, TaskId)>>,
    /// Topological order, filled by [`Scheduler::rank_tasks`].
    topo: Mutex<Vec<TaskId>>,
    /// The queues.
    queues: Vec<Mutex<BinaryHeap<QEntry>>>,
    /// Number of queues.
    pub nr_queues: usize,
    /// Tasks still to complete this launch (plus the launch safeguard).
    waiting: AtomicUsize,
    /// Fatal-error latch; workers drain out when set.
    abort: AtomicBool,
    /// First error recorded.
    abort_detail: Mutex<Option<String>>,
    /// This node's rank, for diagnostics.
    node_id: usize,
}

impl Scheduler {
    /// A scheduler with `nr_queues` queues.
    pub fn new(nr_queues: usize, node_id: usize) -> Self {
        let nr_queues = nr_queues.max(1);
        Scheduler {
            tasks: RwLock::new(Vec::new()),
            qids: RwLock::new(Vec::new()),
            edges: Mutex::new(Vec::new()),
            topo: Mutex::new(Vec::new()),
            queues: (0..nr_queues)
                .map(|_| Mutex::new(BinaryHeap::new()))
                .collect(),
            nr_queues,
            waiting: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
            abort_detail: Mutex::new(None),
            node_id,
        }
    }

    // -----------------------------------------------------------------
    // Construction (between launches; the workers are parked)
    // -----------------------------------------------------------------

    /// Throw away the previous graph.
    pub fn reset(&self) {
        self.tasks.write().unwrap().clear();
        self.qids.write().unwrap().clear();
        self.edges.lock().unwrap().clear();
        self.topo.lock().unwrap().clear();
        for q in &self.queues {
            q.lock().unwrap().clear();
        }
        self.abort.store(false, Ordering::Relaxed);
        *self.abort_detail.lock().unwrap() = None;
    }

    /// Append a task and return its id.
    pub fn addtask(&self, task: Task) -> TaskId {
        let mut tasks = self.tasks.write().unwrap();
        let id = TaskId(tasks.len() as u32);
        tasks.push(task);
        id
    }

    /// Number of tasks in the graph.
    pub fn nr_tasks(&self) -> usize {
        self.tasks.read().unwrap().len()
    }

    /// Record that completing `unlocker` releases one dependency of `locked`.
    pub fn addunlock(&self, unlocker: TaskId, locked: TaskId) {
        debug_assert_ne!(unlocker, locked);
        self.edges.lock().unwrap().push((unlocker, locked));
    }

    /// Compile the recorded edges into each task's unlock list.
    pub fn set_unlocks(&self) {
        let mut tasks = self.tasks.write().unwrap();
        for t in tasks.iter_mut() {
            t.unlocks.clear();
        }
        for &(a, b) in self.edges.lock().unwrap().iter() {
            tasks[a.idx()].unlocks.push(b);
        }
    }

    /// Topologically order the tasks and assign ranks. Fails on a cycle.
    pub fn rank_tasks(&self) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap();
        let n = tasks.len();
        let mut indegree = vec![0u32; n];
        for t in tasks.iter() {
            for u in &t.unlocks {
                indegree[u.idx()] += 1;
            }
        }
        let mut order = Vec::with_capacity(n);
        let mut frontier: Vec<usize> =
            (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut rank = 0u32;
        while let Some(i) = frontier.pop() {
            tasks[i].rank = rank;
            rank += 1;
            order.push(TaskId(i as u32));
            for u in tasks[i].unlocks.clone() {
                indegree[u.idx()] -= 1;
                if indegree[u.idx()] == 0 {
                    frontier.push(u.idx());
                }
            }
        }
        if order.len() != n {
            return Err(EngineError::CyclicGraph {
                node: self.node_id,
                remaining: n - order.len(),
            });
        }
        *self.topo.lock().unwrap() = order;
        Ok(())
    }

    /// Cost model per task, and weight = own cost plus the heaviest
    /// downstream chain. Runs in reverse topological order.
    pub fn reweight(&self, space: &Space) {
        let mut tasks = self.tasks.write().unwrap();
        for t in tasks.iter_mut() {
            t.cost = task_cost(t, space);
        }
        let topo = self.topo.lock().unwrap();
        for id in topo.iter().rev() {
            let heaviest = tasks[id.idx()]
                .unlocks
                .iter()
                .map(|u| tasks[u.idx()].weight)
                .max()
                .unwrap_or(0);
            let t = &mut tasks[id.idx()];
            t.weight = t.cost + heaviest;
        }

        // Owner queues: tasks of one super cell share a queue.
        let mut qids = self.qids.write().unwrap();
        qids.clear();
        for (i, t) in tasks.iter().enumerate() {
            let home = t
                .ci
                .map(|c| space.cells[c.idx()].super_.unwrap_or(c).idx())
                .unwrap_or(i);
            qids.push((home % self.nr_queues) as u32);
        }
    }

    // -----------------------------------------------------------------
    // Launch-time (shared access)
    // -----------------------------------------------------------------

    /// Recount the wait counters from the active tasks and enqueue every
    /// active task with no unmet dependencies. Returns the number of active
    /// tasks.
    pub fn start(&self) -> usize {
        let tasks = self.tasks.read().unwrap();
        for t in tasks.iter() {
            t.wait.store(0, Ordering::Relaxed);
        }
        let mut active = 0usize;
        for t in tasks.iter() {
            if t.is_skipped() {
                continue;
            }
            active += 1;
            for u in &t.unlocks {
                tasks[u.idx()].wait.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.waiting.fetch_add(active, Ordering::Relaxed);
        for (i, t) in tasks.iter().enumerate() {
            if !t.is_skipped() && t.wait.load(Ordering::Relaxed) == 0 {
                self.enqueue(&tasks, TaskId(i as u32));
            }
        }
        active
    }

    /// Put a ready task into its owner queue.
    pub fn enqueue(&self, tasks: &[Task], tid: TaskId) {
        let qid = self.qids.read().unwrap()[tid.idx()] as usize;
        let weight = tasks[tid.idx()].weight;
        self.queues[qid].lock().unwrap().push(QEntry {
            weight,
            task: tid.0,
        });
    }

    /// Mark a task complete: release its unlocks, enqueue any that become
    /// ready, and retire it from the waiting count.
    pub fn task_done(&self, tasks: &[Task], tid: TaskId) {
        for u in &tasks[tid.idx()].unlocks {
            let left = tasks[u.idx()].wait.fetch_sub(1, Ordering::AcqRel);
            if left == 1 && !tasks[u.idx()].is_skipped() {
                self.enqueue(tasks, *u);
            }
        }
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }

    /// Pop the heaviest ready task, preferring the worker's own queue and
    /// falling back to stealing from the other queues in a bounded random
    /// order.
    pub fn gettask(&self, qid: usize, rng: &mut ChaCha8Rng) -> Option<TaskId> {
        if self.abort.load(Ordering::Relaxed) {
            return None;
        }
        if let Some(e) = self.queues[qid % self.nr_queues].lock().unwrap().pop() {
            return Some(TaskId(e.task));
        }
        let mut order: Vec<usize> =
            (0..self.nr_queues).filter(|&q| q != qid).collect();
        order.shuffle(rng);
        for q in order {
            if let Some(e) = self.queues[q].lock().unwrap().pop() {
                return Some(TaskId(e.task));
            }
        }
        None
    }

    /// Tasks (plus safeguards) still outstanding.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Raise the waiting count by one so workers do not drain out while the
    /// queues are being filled.
    pub fn hold(&self) {
        self.waiting.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop the safeguard.
    pub fn release(&self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }

    /// Has a worker aborted the step?
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Latch a fatal error; the first one wins.
    pub fn set_abort(&self, detail: String) {
        let mut slot = self.abort_detail.lock().unwrap();
        if slot.is_none() {
            *slot = Some(detail);
        }
        self.abort.store(true, Ordering::Release);
    }

    /// The recorded abort reason, if any.
    pub fn take_abort(&self) -> Option<String> {
        self.abort_detail.lock().unwrap().take()
    }

    /// A deterministic per-worker RNG for the steal order.
    pub fn steal_rng(&self, worker: usize) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(0x5eed ^ (worker as u64) << 8 ^ self.node_id as u64)
    }
}

/// Cost estimate by task shape: quadratic for interactions, linear for the
/// per-particle passes, byte-sized for communication.
fn task_cost(t: &Task, space: &Space) -> i64 {
    let count = |cid: Option<crate::cell::CellId>| -> i64 {
        cid.map(|c| {
            let cell = &space.cells[c.idx()];
            (cell.parts.count + cell.gparts.count + cell.sparts.count) as i64
        })
        .unwrap_or(0)
    };
    let ni = count(t.ci);
    let nj = count(t.cj);
    match t.ttype {
        TaskType::SelfTask | TaskType::SubSelf => ni * ni,
        TaskType::Pair | TaskType::SubPair => {
            // Corner pairs overlap less than face pairs.
            let sid_factor = match t.subtype {
                TaskSubtype::Density | TaskSubtype::Force | TaskSubtype::Gradient => 2,
                _ => 1,
            };
            ni * nj / (1 + t.flags() as i64 % 3) * sid_factor
        }
        TaskType::Sort => ni * 13,
        TaskType::Send | TaskType::Recv => ni * 24,
        TaskType::GravGatherM | TaskType::GravFft => 1000,
        _ => ni,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellId;
    use crate::config::SpaceParams;

    fn empty_space() -> Space {
        Space::new([1.0; 3], false, SpaceParams::default())
    }

    fn chain(sched: &Scheduler, n: usize) -> Vec<TaskId> {
        let ids: Vec<TaskId> = (0..n)
            .map(|_| {
                sched.addtask(Task::new(
                    TaskType::Init,
                    TaskSubtype::None,
                    0,
                    None,
                    None,
                    false,
                ))
            })
            .collect();
        for w in ids.windows(2) {
            sched.addunlock(w[0], w[1]);
        }
        ids
    }

    #[test]
    fn ranking_orders_a_chain() {
        let sched = Scheduler::new(2, 0);
        let ids = chain(&sched, 5);
        sched.set_unlocks();
        sched.rank_tasks().unwrap();
        let tasks = sched.tasks.read().unwrap();
        for w in ids.windows(2) {
            assert!(tasks[w[0].idx()].rank < tasks[w[1].idx()].rank);
        }
    }

    #[test]
    fn cycle_is_detected() {
        let sched = Scheduler::new(1, 0);
        let ids = chain(&sched, 3);
        sched.addunlock(ids[2], ids[0]);
        sched.set_unlocks();
        assert!(matches!(
            sched.rank_tasks(),
            Err(EngineError::CyclicGraph { .. })
        ));
    }

    #[test]
    fn weight_accumulates_downstream() {
        let sched = Scheduler::new(1, 0);
        let ids = chain(&sched, 3);
        sched.set_unlocks();
        sched.rank_tasks().unwrap();
        let space = empty_space();
        sched.reweight(&space);
        let tasks = sched.tasks.read().unwrap();
        // Upstream carries the whole chain's weight.
        assert!(tasks[ids[0].idx()].weight >= tasks[ids[2].idx()].weight);
    }

    #[test]
    fn start_enqueues_only_roots() {
        let sched = Scheduler::new(1, 0);
        let ids = chain(&sched, 3);
        sched.set_unlocks();
        sched.rank_tasks().unwrap();
        let space = empty_space();
        sched.reweight(&space);
        {
            let tasks = sched.tasks.read().unwrap();
            for t in tasks.iter() {
                t.activate();
            }
        }
        let active = sched.start();
        assert_eq!(active, 3);

        let mut rng = sched.steal_rng(0);
        // Only the chain head is ready.
        let first = sched.gettask(0, &mut rng).unwrap();
        assert_eq!(first, ids[0]);
        assert!(sched.gettask(0, &mut rng).is_none());

        // Completing it releases the next.
        {
            let tasks = sched.tasks.read().unwrap();
            sched.task_done(&tasks, first);
        }
        let second = sched.gettask(0, &mut rng).unwrap();
        assert_eq!(second, ids[1]);
    }

    #[test]
    fn steal_finds_work_in_other_queues() {
        let sched = Scheduler::new(4, 0);
        let id = sched.addtask(Task::new(
            TaskType::Init,
            TaskSubtype::None,
            0,
            Some(CellId(0)),
            None,
            false,
        ));
        sched.set_unlocks();
        sched.rank_tasks().unwrap();
        // One top cell so the task's home is queue 0.
        let mut space = empty_space();
        space.cells.push(crate::cell::Cell::new([0.0; 3], [1.0; 3], 0, 0));
        sched.reweight(&space);
        sched.tasks.read().unwrap()[id.idx()].activate();
        sched.start();

        // A worker on queue 3 must steal it.
        let mut rng = sched.steal_rng(3);
        assert_eq!(sched.gettask(3, &mut rng), Some(id));
    }

    #[test]
    fn abort_latch_records_first_error() {
        let sched = Scheduler::new(1, 0);
        sched.set_abort("first".to_string());
        sched.set_abort("second".to_string());
        assert!(sched.aborted());
        assert_eq!(sched.take_abort().as_deref(), Some("first"));
    }
}
