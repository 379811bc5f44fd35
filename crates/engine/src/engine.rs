//! Step orchestration.
//!
//! Each step: collect the next integer end-time across cells and nodes,
//! check the load balance, handle snapshots, advance the clock, drift and
//! redistribute if needed, re-activate the graph (rebuilding it when the
//! displacement invariants broke), then launch the workers and wait for the
//! graph to drain.

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use kernel::hydro;
use kernel::{IntegerTime, Timeline, MAX_NR_TIMESTEPS};

use crate::cell::CellId;
use crate::config::EngineParams;
use crate::error::{EngineError, Result};
use crate::exchange;
use crate::graph::{self, GraphPolicy};
use crate::partition::{needs_rebalance, Partitioner};
use crate::pool::RunnerPool;
use crate::proxy::{self, Proxy};
use crate::runner::{self, RunnerParams, WorkerContext};
use crate::scheduler::Scheduler;
use crate::space::Space;
use crate::task::{Task, TaskSubtype, TaskType};
use crate::threadpool::ThreadPool;
use crate::transport::Transport;

/// Where snapshots go; the engine only decides when.
pub trait SnapshotSink: Send {
    /// Write one snapshot of the current particle state.
    fn dump(&mut self, space: &Space, time: f64, step: u64) -> Result<()>;
}

/// Discards snapshots.
pub struct NullSink;

impl SnapshotSink for NullSink {
    fn dump(&mut self, _space: &Space, _time: f64, _step: u64) -> Result<()> {
        Ok(())
    }
}

/// One JSON file per snapshot, `basename_NNNN.json`.
pub struct JsonSnapshotSink {
    basename: String,
    index: usize,
}

impl JsonSnapshotSink {
    /// A sink writing next to the working directory.
    pub fn new(basename: &str) -> Self {
        JsonSnapshotSink {
            basename: basename.to_string(),
            index: 0,
        }
    }
}

impl SnapshotSink for JsonSnapshotSink {
    fn dump(&mut self, space: &Space, time: f64, step: u64) -> Result<()> {
        #[derive(serde::Serialize)]
        struct Snapshot<'a> {
            time: f64,
            step: u64,
            parts: &'a [kernel::Part],
        }
        let path = format!("{}_{:04}.json", self.basename, self.index);
        self.index += 1;
        let parts = unsafe { space.parts.slice(0..space.nr_parts()) };
        let body = serde_json::to_string(&Snapshot { time, step, parts }).map_err(|e| {
            EngineError::Io {
                path: path.clone(),
                detail: e.to_string(),
            }
        })?;
        std::fs::write(&path, body).map_err(|e| EngineError::Io {
            path,
            detail: e.to_string(),
        })
    }
}

/// Per-run switches.
pub struct EnginePolicy {
    /// Which physics the graph carries.
    pub graph: GraphPolicy,
    /// Physics constants handed to the runner.
    pub runner: RunnerParams,
    /// Worker threads per node.
    pub nr_threads: usize,
    /// Pin workers to cores.
    pub pin_threads: bool,
    /// Drift every particle every step instead of only the active cells.
    pub drift_all: bool,
}

/// What one step did, for logs and callers.
#[derive(Debug, Clone, Copy)]
pub struct StepInfo {
    /// Step number.
    pub step: u64,
    /// Physical time reached.
    pub time: f64,
    /// Physical step size.
    pub dt: f64,
    /// Gas particles updated.
    pub updates: u64,
    /// Gravity particles updated.
    pub g_updates: u64,
    /// Star particles updated.
    pub s_updates: u64,
    /// Whether this step rebuilt the tree and graph.
    pub rebuilt: bool,
}

/// The engine: one per node.
pub struct Engine {
    /// Shared state the workers see.
    pub ctx: Arc<WorkerContext>,
    pool: RunnerPool,
    tp: ThreadPool,
    policy: EnginePolicy,
    params: EngineParams,
    partitioner: Box<dyn Partitioner>,
    sink: Box<dyn SnapshotSink>,
    proxies: Vec<Proxy>,
    /// This node's rank.
    pub node_id: usize,
    /// Number of nodes.
    pub nr_nodes: usize,
    /// Step counter.
    pub step: u64,
    /// Physical time.
    pub time: f64,
    time_old: f64,
    /// Integer time.
    pub ti_current: IntegerTime,
    ti_end_min: IntegerTime,
    ti_next_snapshot: IntegerTime,
    time_last_statistics: f64,
    /// Rebuild requested for the next prepare.
    pub forcerebuild: bool,
    forcerepart: bool,
    last_step_rebuilt: bool,
    tasks_age: u64,
    /// Gas particles updated in the last step (all nodes).
    pub updates: u64,
    /// Gravity particles updated in the last step (all nodes).
    pub g_updates: u64,
    /// Star particles updated in the last step (all nodes).
    pub s_updates: u64,
    last_step_wall: f64,
}

impl Engine {
    /// Bring up an engine over a particle-filled space.
    pub fn new(
        mut space: Space,
        params: EngineParams,
        policy: EnginePolicy,
        transport: Arc<dyn Transport>,
        partitioner: Box<dyn Partitioner>,
        sink: Box<dyn SnapshotSink>,
    ) -> Result<Self> {
        params.validate()?;
        let node_id = transport.rank();
        let nr_nodes = transport.size();
        space.nr_nodes = nr_nodes;
        let timeline = Timeline::new(
            params.time_integration.time_begin,
            params.time_integration.time_end,
            MAX_NR_TIMESTEPS,
            params.time_integration.dt_min,
            params.time_integration.dt_max,
        );
        let nr_queues = if params.scheduler.nr_queues == 0 {
            policy.nr_threads
        } else {
            params.scheduler.nr_queues
        };

        let mut runner_params = policy.runner.clone();
        runner_params.cfl = params.cfl;

        let ctx = Arc::new(WorkerContext {
            space: RwLock::new(space),
            sched: Scheduler::new(nr_queues, node_id),
            transport,
            timeline,
            ti_current: Default::default(),
            params: runner_params,
            node_id,
            mesh: Mutex::new(Default::default()),
        });
        let pool = RunnerPool::new(Arc::clone(&ctx), policy.nr_threads, policy.pin_threads);
        let tp = ThreadPool::new(policy.nr_threads);

        let time = params.time_integration.time_begin;
        let mut engine = Engine {
            ctx,
            pool,
            tp,
            policy,
            params,
            partitioner,
            sink,
            proxies: Vec::new(),
            node_id,
            nr_nodes,
            step: 0,
            time,
            time_old: time,
            ti_current: 0,
            ti_end_min: 0,
            ti_next_snapshot: -1,
            time_last_statistics: time,
            forcerebuild: true,
            forcerepart: false,
            last_step_rebuilt: false,
            tasks_age: 0,
            updates: 0,
            g_updates: 0,
            s_updates: 0,
            last_step_wall: 0.0,
        };
        engine.compute_next_snapshot_time();
        tracing::info!(
            "engine up on node {}/{}: {} threads, {} queues",
            node_id,
            nr_nodes,
            engine.policy.nr_threads,
            nr_queues
        );
        Ok(engine)
    }

    /// The timeline in use.
    pub fn timeline(&self) -> Timeline {
        self.ctx.timeline
    }

    fn compute_next_snapshot_time(&mut self) {
        let tl = self.ctx.timeline;
        let mut t = self.params.snapshots.time_first;
        while t <= tl.time_end && tl.tick_of(t) <= self.ti_current {
            t += self.params.snapshots.delta_time;
        }
        self.ti_next_snapshot = if t > tl.time_end { -1 } else { tl.tick_of(t) };
    }

    // -----------------------------------------------------------------
    // Preparation
    // -----------------------------------------------------------------

    /// Activate only the tasks whose cells are active now; flags a rebuild
    /// when any tight pair has drifted past its tolerance.
    pub fn marktasks(&mut self) -> Result<bool> {
        let space = self.ctx.space.read().unwrap();
        let tasks_guard = self.ctx.sched.tasks.read().unwrap();
        Ok(unskip_pass(
            &self.tp,
            &space,
            &tasks_guard,
            self.ti_current,
            self.node_id,
        ))
    }

    /// Drift every local particle to the current time.
    pub fn drift_all(&mut self) {
        let space = self.ctx.space.read().unwrap();
        let node_id = self.node_id;
        let tops: Vec<CellId> = (0..space.nr_top_cells)
            .filter(|&c| space.cells[c].node_id == node_id && !space.cells[c].is_empty())
            .map(|c| CellId(c as u32))
            .collect();
        let ctx = &self.ctx;
        self.tp.map(tops.len(), 1, |range| {
            for &cid in &tops[range] {
                runner::drift_top(ctx, &space, cid);
            }
        });
    }

    /// Rebuild the cell tree and regenerate the task graph.
    pub fn rebuild(&mut self) -> Result<()> {
        let tic = Instant::now();
        self.forcerebuild = false;

        // Agree on the grid geometry first; the cell width follows the
        // global maximal smoothing length.
        let grid_changed = {
            let mut space = self.ctx.space.write().unwrap();
            let global_h = if self.nr_nodes > 1 {
                let local = space.local_h_max();
                let all = self.ctx.transport.allgather_f64(local as f64)?;
                Some(all.into_iter().fold(0.0_f64, f64::max) as f32)
            } else {
                None
            };
            space.prepare_grid(self.node_id, global_h)?
        };

        if self.nr_nodes > 1 {
            // Drifted particles go home before the tree is rebuilt. A
            // resized grid may move cells across old proxy boundaries, so
            // fall back to talking to every rank.
            let mut space = self.ctx.space.write().unwrap();
            if grid_changed {
                let everyone: Vec<Proxy> = (0..self.nr_nodes)
                    .filter(|&r| r != self.node_id)
                    .map(Proxy::new)
                    .collect();
                exchange::exchange_strays(
                    &mut space,
                    &everyone,
                    self.ctx.transport.as_ref(),
                    self.node_id,
                )?;
            } else {
                exchange::exchange_strays(
                    &mut space,
                    &self.proxies,
                    self.ctx.transport.as_ref(),
                    self.node_id,
                )?;
            }
        }
        {
            let mut space = self.ctx.space.write().unwrap();
            space.rebuild(self.ti_current, self.node_id)?;
            if self.nr_nodes > 1 {
                self.proxies = proxy::make_proxies(&space, self.node_id)?;
                exchange::exchange_cells(
                    &mut space,
                    &self.proxies,
                    self.ctx.transport.as_ref(),
                    self.node_id,
                )?;
            }
            graph::make_tasks(
                &self.ctx.sched,
                &mut space,
                &self.policy.graph,
                self.node_id,
                &self.proxies,
            )?;
        }
        if self.marktasks()? {
            return Err(EngineError::InvariantViolation {
                node: self.node_id,
                location: "engine::rebuild",
                detail: "activation still demands a rebuild right after one".to_string(),
            });
        }
        tracing::debug!("rebuild took {:.3} ms", tic.elapsed().as_secs_f64() * 1e3);
        Ok(())
    }

    /// Unskip, rebuild if the displacement invariants broke, and keep the
    /// task weights fresh.
    pub fn prepare(&mut self, drift_before_rebuild: bool, postrepart: bool) -> Result<()> {
        let mut rebuild = self.forcerebuild;
        if !postrepart {
            rebuild |= self.marktasks()?;
        }
        rebuild = self.ctx.transport.allreduce_or(rebuild)?;

        self.last_step_rebuilt = rebuild;
        if rebuild {
            if drift_before_rebuild {
                self.drift_all();
            }
            self.rebuild()?;
        }
        if postrepart {
            self.marktasks()?;
        }

        if self.tasks_age % 50 == 1 {
            let space = self.ctx.space.read().unwrap();
            self.ctx.sched.reweight(&space);
        }
        self.tasks_age += 1;
        self.forcerebuild = false;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------

    /// Reduce the minimum next end-time and the updated-particle counters
    /// over all cells and nodes.
    pub fn collect_timestep(&mut self) -> Result<()> {
        let (mut ti_end_min, mut updates, mut g_updates, mut s_updates) = {
            let space = self.ctx.space.read().unwrap();
            let mut ti_end_min = self.ctx.timeline.max_nr_timesteps;
            let (mut u, mut gu, mut su) = (0u64, 0u64, 0u64);
            for cid in 0..space.nr_top_cells {
                let c = &space.cells[cid];
                if c.is_empty() {
                    continue;
                }
                collect_kick(&space, CellId(cid as u32));
                ti_end_min = ti_end_min.min(c.ti_end_min.load(Ordering::Relaxed));
                u += c.updated.swap(0, Ordering::Relaxed) as u64;
                gu += c.g_updated.swap(0, Ordering::Relaxed) as u64;
                su += c.s_updated.swap(0, Ordering::Relaxed) as u64;
            }
            (ti_end_min, u, gu, su)
        };

        if self.nr_nodes > 1 {
            ti_end_min = self.ctx.transport.allreduce_min_i64(ti_end_min)?;
            updates = self.ctx.transport.allreduce_sum_u64(updates)?;
            g_updates = self.ctx.transport.allreduce_sum_u64(g_updates)?;
            s_updates = self.ctx.transport.allreduce_sum_u64(s_updates)?;
        }
        self.ti_end_min = ti_end_min;
        self.updates = updates;
        self.g_updates = g_updates;
        self.s_updates = s_updates;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Launching
    // -----------------------------------------------------------------

    /// Wake the workers and wait for the graph to drain.
    pub fn launch(&mut self) -> Result<()> {
        let tic = Instant::now();
        let sched = &self.ctx.sched;
        sched.hold();
        self.pool.launch(self.policy.nr_threads, || {
            sched.start();
            sched.release();
        });
        if sched.aborted() {
            return Err(EngineError::StepAborted {
                node: self.node_id,
                detail: sched
                    .take_abort()
                    .unwrap_or_else(|| "unknown worker error".to_string()),
            });
        }
        tracing::debug!("launch took {:.3} ms", tic.elapsed().as_secs_f64() * 1e3);
        Ok(())
    }

    fn skip_tasks_where(&self, pred: impl Fn(&Task) -> bool) {
        let tasks = self.ctx.sched.tasks.read().unwrap();
        for t in tasks.iter() {
            if pred(t) {
                t.skip.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Skip everything that moves particles forward in time; used by the
    /// initialisation launches.
    pub fn skip_force_and_kick(&self) {
        self.skip_tasks_where(|t| {
            matches!(
                t.ttype,
                TaskType::Drift
                    | TaskType::Kick1
                    | TaskType::Kick2
                    | TaskType::Timestep
                    | TaskType::Cooling
                    | TaskType::SourceTerms
            ) || t.subtype == TaskSubtype::Force
        });
    }

    /// Skip the drift and the first kick; used by the fake first step.
    pub fn skip_drift_and_kick(&self) {
        self.skip_tasks_where(|t| matches!(t.ttype, TaskType::Drift | TaskType::Kick1));
    }

    // -----------------------------------------------------------------
    // Initialisation
    // -----------------------------------------------------------------

    /// Compute the initial densities and time bins: a density-only launch,
    /// the entropy conversion, then a fake step without drift or first
    /// kick.
    pub fn init_particles(&mut self) -> Result<()> {
        tracing::info!("computing initial densities");
        {
            let mut guard = self.ctx.space.write().unwrap();
            let space: &mut Space = &mut guard;
            let parts = space.parts.get_mut();
            let xparts = space.xparts.get_mut();
            for (p, xp) in parts.iter_mut().zip(xparts.iter_mut()) {
                hydro::first_init_part(p, xp);
            }
        }

        self.forcerebuild = true;
        self.prepare(false, false)?;
        self.skip_force_and_kick();
        self.launch()?;

        {
            let mut guard = self.ctx.space.write().unwrap();
            let space: &mut Space = &mut guard;
            let parts = space.parts.get_mut();
            let xparts = space.xparts.get_mut();
            for (p, xp) in parts.iter_mut().zip(xparts.iter_mut()) {
                hydro::convert_quantities(p, xp);
            }
        }

        tracing::info!("running initial fake time-step");
        self.marktasks()?;
        self.skip_drift_and_kick();
        self.launch()?;
        self.collect_timestep()?;

        self.step = 0;
        self.forcerebuild = true;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------

    /// Has the integer clock reached the end of the timeline?
    pub fn is_done(&self) -> bool {
        self.ti_current >= self.ctx.timeline.max_nr_timesteps
    }

    /// Advance the system by one step.
    pub fn step(&mut self) -> Result<StepInfo> {
        let wall = Instant::now();

        self.collect_timestep()?;

        // Load balance: compare the elapsed times of the last step.
        if self.params.partition.enabled && self.nr_nodes > 1 {
            let times = self.ctx.transport.allgather_f64(self.last_step_wall)?;
            if needs_rebalance(&times, self.params.partition.fractional_time) {
                tracing::info!("load imbalance beyond threshold, will repartition");
                self.forcerepart = true;
            }
        }

        // Snapshots due before the next end-time.
        while self.ti_next_snapshot >= 0 && self.ti_end_min >= self.ti_next_snapshot {
            self.ti_current = self.ti_next_snapshot;
            self.ctx.ti_current.store(self.ti_current, Ordering::Relaxed);
            self.time = self.ctx.timeline.time_of(self.ti_current);
            self.drift_all();
            {
                let space = self.ctx.space.read().unwrap();
                self.sink.dump(&space, self.time, self.step)?;
            }
            self.compute_next_snapshot_time();
        }

        // Move forward in time.
        self.time_old = self.time;
        self.ti_current = self.ti_end_min;
        self.ctx.ti_current.store(self.ti_current, Ordering::Relaxed);
        self.time = self.ctx.timeline.time_of(self.ti_current);
        self.step += 1;
        let dt = self.time - self.time_old;

        if self.node_id == 0 {
            tracing::info!(
                "step {:6} t={:.6e} dt={:.6e} updates {}/{}/{} wall {:.1} ms",
                self.step,
                self.time,
                dt,
                self.updates,
                self.g_updates,
                self.s_updates,
                self.last_step_wall * 1e3,
            );
            // An empty file name switches the log off.
            if !self.params.statistics.timestep_file_name.is_empty() {
                self.append_line(
                    &self.params.statistics.timestep_file_name.clone(),
                    &format!(
                        "{:6} {:14e} {:14e} {:10} {:10} {:10}\n",
                        self.step, self.time, dt, self.updates, self.g_updates, self.s_updates
                    ),
                )?;
            }
        }

        let repart = self.forcerepart;
        self.forcerepart = false;
        if repart || self.policy.drift_all {
            self.drift_all();
        }
        if repart {
            self.repartition()?;
        }

        self.prepare(!(repart || self.policy.drift_all), repart)?;

        if self.time - self.time_last_statistics >= self.params.statistics.delta_time {
            self.print_stats()?;
            self.time_last_statistics += self.params.statistics.delta_time;
        }

        self.launch()?;

        self.last_step_wall = wall.elapsed().as_secs_f64();
        Ok(StepInfo {
            step: self.step,
            time: self.time,
            dt,
            updates: self.updates,
            g_updates: self.g_updates,
            s_updates: self.s_updates,
            rebuilt: self.last_step_rebuilt,
        })
    }

    /// Step until the timeline ends or `max_steps` elapse.
    pub fn run(&mut self, max_steps: Option<u64>) -> Result<()> {
        let mut steps = 0u64;
        while !self.is_done() {
            if let Some(max) = max_steps {
                if steps >= max {
                    break;
                }
            }
            self.step()?;
            steps += 1;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Repartitioning and statistics
    // -----------------------------------------------------------------

    /// Ask the partitioner for a new ownership map and redistribute
    /// everything accordingly.
    pub fn repartition(&mut self) -> Result<()> {
        let map = {
            let space = self.ctx.space.read().unwrap();
            let tasks = self.ctx.sched.tasks.read().unwrap();
            self.partitioner.repartition(self.nr_nodes, &space, &tasks)
        };
        {
            let mut space = self.ctx.space.write().unwrap();
            space.top_node_map = map;
            for cid in 0..space.nr_top_cells {
                space.cells[cid].node_id = space.top_node_map[cid];
            }
            // The global redistribute may cross old proxy boundaries, so
            // talk to every rank.
            let everyone: Vec<Proxy> = (0..self.nr_nodes)
                .filter(|&r| r != self.node_id)
                .map(Proxy::new)
                .collect();
            exchange::exchange_strays(
                &mut space,
                &everyone,
                self.ctx.transport.as_ref(),
                self.node_id,
            )?;
        }
        self.forcerebuild = true;
        tracing::info!("repartition complete, rebuild forced");
        Ok(())
    }

    fn append_line(&self, path: &str, line: &str) -> Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EngineError::Io {
                path: path.to_string(),
                detail: e.to_string(),
            })?;
        f.write_all(line.as_bytes()).map_err(|e| EngineError::Io {
            path: path.to_string(),
            detail: e.to_string(),
        })
    }

    /// Conserved-quantity statistics, reduced over nodes, written by rank 0.
    pub fn print_stats(&mut self) -> Result<()> {
        let (kinetic, internal, momentum) = {
            let mut guard = self.ctx.space.write().unwrap();
            let space: &mut Space = &mut guard;
            let mut kinetic = 0.0_f64;
            let mut internal = 0.0_f64;
            let mut momentum = [0.0_f64; 3];
            let parts = space.parts.get_mut();
            let xparts = space.xparts.get_mut();
            for (p, xp) in parts.iter().zip(xparts.iter()) {
                let m = p.mass as f64;
                let v2 = (xp.v_full[0] as f64).powi(2)
                    + (xp.v_full[1] as f64).powi(2)
                    + (xp.v_full[2] as f64).powi(2);
                kinetic += 0.5 * m * v2;
                internal += m * xp.u_full as f64;
                for k in 0..3 {
                    momentum[k] += m * xp.v_full[k] as f64;
                }
            }
            (kinetic, internal, momentum)
        };

        let reduce = |v: f64| -> Result<f64> {
            if self.nr_nodes > 1 {
                Ok(self.ctx.transport.allgather_f64(v)?.iter().sum())
            } else {
                Ok(v)
            }
        };
        let kinetic = reduce(kinetic)?;
        let internal = reduce(internal)?;
        let px = reduce(momentum[0])?;
        let py = reduce(momentum[1])?;
        let pz = reduce(momentum[2])?;

        if self.node_id == 0 && !self.params.statistics.energy_file_name.is_empty() {
            self.append_line(
                &self.params.statistics.energy_file_name.clone(),
                &format!(
                    "{:14e} {:14e} {:14e} {:14e} {:14e} {:14e}\n",
                    self.time, kinetic, internal, px, py, pz
                ),
            )?;
        }
        Ok(())
    }
}

/// Aggregate the integer-time marks of subtrees whose time-step task sits
/// below the top cell.
fn collect_kick(space: &Space, cid: CellId) {
    let c = &space.cells[cid.idx()];
    if c.tasks.timestep.is_some() || c.tasks.recv_ti.is_some() {
        return;
    }
    let mut ti_end_min = IntegerTime::MAX;
    let (mut updated, mut g_updated, mut s_updated) = (0i64, 0i64, 0i64);
    for child in c.progeny.iter().flatten() {
        let cp = &space.cells[child.idx()];
        if cp.is_empty() {
            continue;
        }
        collect_kick(space, *child);
        ti_end_min = ti_end_min.min(cp.ti_end_min.load(Ordering::Relaxed));
        updated += cp.updated.swap(0, Ordering::Relaxed);
        g_updated += cp.g_updated.swap(0, Ordering::Relaxed);
        s_updated += cp.s_updated.swap(0, Ordering::Relaxed);
    }
    if ti_end_min < IntegerTime::MAX {
        c.ti_end_min.store(ti_end_min, Ordering::Relaxed);
    }
    c.updated.store(updated, Ordering::Relaxed);
    c.g_updated.store(g_updated, Ordering::Relaxed);
    c.s_updated.store(s_updated, Ordering::Relaxed);
}

/// The per-step activation ("unskip") pass: everything off first, then a
/// mapped pass switches on what this step needs. Running it twice without a
/// state change yields the same active set. Returns whether any tight pair
/// has drifted past its tolerance and a rebuild is due.
pub fn unskip_pass(
    tp: &ThreadPool,
    space: &Space,
    tasks: &[Task],
    ti_current: IntegerTime,
    node_id: usize,
) -> bool {
    let rebuild = AtomicBool::new(false);
    let max_rel_dx = space.params.max_rel_dx;

    tp.map(tasks.len(), 1024, |range| {
        for t in &tasks[range] {
            t.skip.store(true, Ordering::Relaxed);
            if t.ttype == TaskType::Sort {
                t.flags.store(0, Ordering::Relaxed);
            }
        }
    });

    tp.map(tasks.len(), 256, |range| {
        for idx in range {
            mark_one(space, tasks, idx, ti_current, node_id, max_rel_dx, &rebuild);
        }
    });

    rebuild.load(Ordering::Relaxed)
}

/// Activation rules for one task; the unskip pass maps this over the whole
/// list.
#[allow(clippy::too_many_arguments)]
fn mark_one(
    space: &Space,
    tasks: &[Task],
    idx: usize,
    ti_current: IntegerTime,
    node_id: usize,
    max_rel_dx: f64,
    rebuild: &AtomicBool,
) {
    let t = &tasks[idx];
    match t.ttype {
        TaskType::SelfTask
        | TaskType::SubSelf
        | TaskType::Ghost
        | TaskType::ExtraGhost
        | TaskType::Cooling
        | TaskType::SourceTerms => {
            if let Some(ci) = t.ci {
                if space.cells[ci.idx()].is_active(ti_current) {
                    t.activate();
                }
            }
        }
        TaskType::Pair | TaskType::SubPair => {
            let (Some(ci), Some(cj)) = (t.ci, t.cj) else { return };
            let cell_i = &space.cells[ci.idx()];
            let cell_j = &space.cells[cj.idx()];

            // Too much particle movement since the last rebuild?
            if t.tight {
                let h_max = cell_i.h_max.max(cell_j.h_max) as f64;
                let dx_i = cell_i.dx_max_part.load() as f64;
                let dx_j = cell_j.dx_max_part.load() as f64;
                if h_max + dx_i + dx_j > cell_j.dmin
                    || dx_i > max_rel_dx * cell_i.h_max as f64
                    || dx_j > max_rel_dx * cell_j.h_max as f64
                {
                    rebuild.store(true, Ordering::Relaxed);
                }
            }

            if !cell_i.is_active(ti_current) && !cell_j.is_active(ti_current) {
                return;
            }
            t.activate();

            if t.subtype != TaskSubtype::Density {
                return;
            }

            // Sorted pairs need both cells ordered along the pair axis.
            if t.ttype == TaskType::Pair {
                let bit = 1u32 << t.flags();
                for cell in [cell_i, cell_j] {
                    if let Some(s) = cell.tasks.sorts {
                        tasks[s.idx()].flags.fetch_or(bit, Ordering::Relaxed);
                        tasks[s.idx()].activate();
                    }
                }
            }

            // Cross-node pairs wake the matching receive and send tasks.
            if cell_i.node_id != node_id {
                activate_comm(space, tasks, cell_i, cell_j, ti_current, node_id);
            } else if cell_j.node_id != node_id {
                activate_comm(space, tasks, cell_j, cell_i, ti_current, node_id);
            }
        }
        TaskType::Kick1 | TaskType::Kick2 | TaskType::Drift | TaskType::Init => {
            if let Some(ci) = t.ci {
                if space.cells[ci.idx()].is_active(ti_current) {
                    t.activate();
                }
            }
        }
        TaskType::Timestep => {
            if let Some(ci) = t.ci {
                let c = &space.cells[ci.idx()];
                c.updated.store(0, Ordering::Relaxed);
                c.g_updated.store(0, Ordering::Relaxed);
                c.s_updated.store(0, Ordering::Relaxed);
                if c.is_active(ti_current) {
                    t.activate();
                }
            }
        }
        TaskType::GravUp | TaskType::GravMm => {
            if let Some(ci) = t.ci {
                if space.cells[ci.idx()].is_active(ti_current) {
                    t.activate();
                }
            }
        }
        TaskType::GravGatherM | TaskType::GravFft => {
            t.activate();
        }
        // Sorts, sends and receives are switched on by the pairs that need
        // them.
        TaskType::Sort | TaskType::Send | TaskType::Recv => {}
    }
}

/// Wake the receive tuple of a foreign cell and the matching sends on the
/// local side.
fn activate_comm(
    space: &Space,
    tasks: &[Task],
    foreign: &crate::cell::Cell,
    local: &crate::cell::Cell,
    ti_current: IntegerTime,
    _node_id: usize,
) {
    if let Some(rx) = foreign.tasks.recv_xv {
        tasks[rx.idx()].activate();
    }
    if foreign.is_active(ti_current) {
        if let Some(rr) = foreign.tasks.recv_rho {
            tasks[rr.idx()].activate();
        }
        if let Some(rt) = foreign.tasks.recv_ti {
            tasks[rt.idx()].activate();
        }
    }

    let peer = foreign.node_id;
    for &(p, s) in &local.links.send_xv {
        if p == peer {
            tasks[s.idx()].activate();
        }
    }
    // The payload must be drifted before it leaves.
    if let Some(sup) = local.super_ {
        if let Some(d) = space.cells[sup.idx()].tasks.drift {
            tasks[d.idx()].activate();
        }
    }
    if local.is_active(ti_current) {
        for &(p, s) in &local.links.send_rho {
            if p == peer {
                tasks[s.idx()].activate();
            }
        }
        for &(p, s) in &local.links.send_ti {
            if p == peer {
                tasks[s.idx()].activate();
            }
        }
    }
}
