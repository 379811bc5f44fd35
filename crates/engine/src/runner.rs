//! Task execution.
//!
//! Workers pull tasks off the scheduler and dispatch them here by
//! `(type, subtype)`. Interaction tasks hold their cells' locks for the
//! duration of one execution; everything else is serialized by the graph.
//! Particle access goes through the space's unsafe range accessors under
//! the disjointness guarantees described in [`crate::space::Storage`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use kernel::cooling::{CoolingParams, SourceTermParams};
use kernel::gravity::{self, Multipole, PointMassPotential};
use kernel::hydro::{self, DensityNeighbour, ForceNeighbour};
use kernel::timeline::{max_active_bin, ti_end_for};
use kernel::{IntegerTime, Part, Timeline};

use crate::cell::{Cell, CellId, TaskId};
use crate::error::{EngineError, Result};
use crate::scheduler::Scheduler;
use crate::sort;
use crate::space::Space;
use crate::task::{Task, TaskSubtype, TaskType};
use crate::transport::Transport;

/// Physics switches and constants threaded to every task.
#[derive(Debug, Clone)]
pub struct RunnerParams {
    /// CFL safety factor.
    pub cfl: f32,
    /// Cooling on/off, and its law.
    pub with_cooling: bool,
    /// Cooling parameters.
    pub cooling: CoolingParams,
    /// Source terms on/off.
    pub with_sourceterms: bool,
    /// Source-term parameters.
    pub sourceterms: SourceTermParams,
    /// External potential, when external gravity is on.
    pub external_potential: Option<PointMassPotential>,
    /// Gravity time-step accuracy.
    pub grav_eta: f32,
    /// Gravity softening length.
    pub grav_softening: f32,
    /// How long a launch may sit on unsatisfied receives before the step is
    /// declared dead.
    pub recv_patience: Duration,
}

impl Default for RunnerParams {
    fn default() -> Self {
        RunnerParams {
            cfl: 0.1,
            with_cooling: false,
            cooling: CoolingParams {
                lambda: 0.0,
                min_energy: 0.0,
            },
            with_sourceterms: false,
            sourceterms: SourceTermParams { energy_rate: 0.0 },
            external_potential: None,
            grav_eta: 0.025,
            grav_softening: 1.0e-3,
            recv_patience: crate::transport::RECV_TIMEOUT,
        }
    }
}

/// Long-range gravity state shared by the gather/fft/mm tasks.
#[derive(Debug, Default)]
pub struct MeshState {
    /// Sum of all local top-cell multipoles.
    pub total: Multipole,
    /// Set by the mesh transform once the far field is usable.
    pub ready: bool,
}

/// Everything a worker needs to run tasks.
pub struct WorkerContext {
    /// The domain. Workers share read access during a launch.
    pub space: RwLock<Space>,
    /// The scheduler.
    pub sched: Scheduler,
    /// Cross-node transport.
    pub transport: Arc<dyn Transport>,
    /// The integer timeline.
    pub timeline: Timeline,
    /// Current integer time.
    pub ti_current: AtomicI64,
    /// Physics switches.
    pub params: RunnerParams,
    /// This node's rank.
    pub node_id: usize,
    /// Long-range gravity scratch state.
    pub mesh: Mutex<MeshState>,
}

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed; unlock its dependents.
    Done,
    /// Not ready (a receive without a message); put it back.
    Requeue,
}

/// One worker's drain of the task graph: pull, execute, unlock, until the
/// scheduler is quiescent or aborted.
pub fn drain(ctx: &WorkerContext, worker_id: usize) {
    let space = ctx.space.read().unwrap();
    let tasks_guard = ctx.sched.tasks.read().unwrap();
    let tasks: &[Task] = &tasks_guard;
    let mut rng = ctx.sched.steal_rng(worker_id);
    let qid = worker_id % ctx.sched.nr_queues;
    let mut last_progress = Instant::now();

    loop {
        if ctx.sched.aborted() {
            break;
        }
        match ctx.sched.gettask(qid, &mut rng) {
            Some(tid) => match execute(ctx, &space, tasks, tid) {
                Ok(Outcome::Done) => {
                    ctx.sched.task_done(tasks, tid);
                    last_progress = Instant::now();
                }
                Ok(Outcome::Requeue) => {
                    if last_progress.elapsed() > ctx.params.recv_patience {
                        ctx.sched.set_abort(
                            EngineError::Communication {
                                node: ctx.node_id,
                                peer: tasks[tid.idx()]
                                    .ci
                                    .map(|c| space.cells[c.idx()].node_id)
                                    .unwrap_or(usize::MAX),
                                detail: "receive starved the launch".to_string(),
                            }
                            .to_string(),
                        );
                        break;
                    }
                    std::thread::yield_now();
                    ctx.sched.enqueue(tasks, tid);
                }
                Err(e) => {
                    ctx.sched.set_abort(e.to_string());
                    break;
                }
            },
            None => {
                if ctx.sched.waiting() == 0 {
                    break;
                }
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
    }
}

/// Dispatch one task.
pub fn execute(
    ctx: &WorkerContext,
    space: &Space,
    tasks: &[Task],
    tid: TaskId,
) -> Result<Outcome> {
    let t = &tasks[tid.idx()];
    let ti_current = ctx.ti_current.load(Ordering::Relaxed);

    match t.ttype {
        TaskType::SelfTask | TaskType::SubSelf => {
            let ci = t.ci.expect("self task without a cell");
            let cell = &space.cells[ci.idx()];
            let _hold = cell.hold.lock().unwrap();
            match t.subtype {
                TaskSubtype::Density => doself_density(space, cell, ti_current),
                TaskSubtype::Force => doself_force(space, cell, ti_current),
                TaskSubtype::Grav => doself_grav(ctx, space, cell, ti_current),
                TaskSubtype::ExternalGrav => do_external_grav(ctx, space, cell, ti_current),
                other => {
                    return Err(invariant(ctx, "runner::execute (self subtype)", format!("{:?}", other)))
                }
            }
            Ok(Outcome::Done)
        }
        TaskType::Pair | TaskType::SubPair => {
            let ci = t.ci.expect("pair task without ci");
            let cj = t.cj.expect("pair task without cj");
            let (lo, hi) = if ci.0 < cj.0 { (ci, cj) } else { (cj, ci) };
            let _hold_lo = space.cells[lo.idx()].hold.lock().unwrap();
            let _hold_hi = space.cells[hi.idx()].hold.lock().unwrap();
            let sorted_pair = t.ttype == TaskType::Pair;
            match t.subtype {
                TaskSubtype::Density => {
                    if sorted_pair {
                        dopair_density(ctx, space, ci, cj, t.flags() as usize, ti_current)?
                    } else {
                        dopair_naive(space, ci, cj, ti_current, ctx.node_id, Loop::Density)
                    }
                }
                TaskSubtype::Force => {
                    if sorted_pair {
                        dopair_force(ctx, space, ci, cj, t.flags() as usize, ti_current)?
                    } else {
                        dopair_naive(space, ci, cj, ti_current, ctx.node_id, Loop::Force)
                    }
                }
                TaskSubtype::Grav => dopair_grav(ctx, space, ci, cj, ti_current),
                other => {
                    return Err(invariant(ctx, "runner::execute (pair subtype)", format!("{:?}", other)))
                }
            }
            Ok(Outcome::Done)
        }
        TaskType::Sort => {
            let ci = t.ci.expect("sort task without a cell");
            sort::do_sort(space, ci, t.flags(), ti_current);
            // Sorting resets the per-sort displacement accumulators.
            reset_sort_diffs(space, ci);
            Ok(Outcome::Done)
        }
        TaskType::Drift => {
            do_drift(ctx, space, t.ci.expect("drift task without a cell"), ti_current);
            Ok(Outcome::Done)
        }
        TaskType::Init => {
            do_init(space, &space.cells[t.ci.expect("init task without a cell").idx()], ti_current);
            Ok(Outcome::Done)
        }
        TaskType::Ghost => {
            do_ghost(space, &space.cells[t.ci.expect("ghost task without a cell").idx()], ti_current);
            Ok(Outcome::Done)
        }
        TaskType::ExtraGhost => {
            // Only built by two-loop hydro schemes.
            Err(invariant(ctx, "runner::execute", "extra_ghost without a second loop".to_string()))
        }
        TaskType::Kick1 | TaskType::Kick2 => {
            do_kick(space, &space.cells[t.ci.expect("kick task without a cell").idx()], &ctx.timeline, ti_current);
            Ok(Outcome::Done)
        }
        TaskType::Timestep => {
            do_timestep(ctx, space, t.ci.expect("timestep task without a cell"), ti_current);
            Ok(Outcome::Done)
        }
        TaskType::Cooling => {
            do_cooling(ctx, space, &space.cells[t.ci.expect("cooling task without a cell").idx()], ti_current);
            Ok(Outcome::Done)
        }
        TaskType::SourceTerms => {
            do_sourceterms(ctx, space, &space.cells[t.ci.expect("source-term task without a cell").idx()], ti_current);
            Ok(Outcome::Done)
        }
        TaskType::Send => {
            do_send(ctx, space, t)?;
            Ok(Outcome::Done)
        }
        TaskType::Recv => do_recv(ctx, space, t),
        TaskType::GravUp => {
            do_grav_up(space, &space.cells[t.ci.expect("grav_up task without a cell").idx()]);
            Ok(Outcome::Done)
        }
        TaskType::GravGatherM => {
            do_grav_gather(ctx, space);
            Ok(Outcome::Done)
        }
        TaskType::GravFft => {
            ctx.mesh.lock().unwrap().ready = true;
            Ok(Outcome::Done)
        }
        TaskType::GravMm => {
            do_grav_mm(ctx, space, t.ci.expect("grav_mm task without a cell"), ti_current);
            Ok(Outcome::Done)
        }
    }
}

fn invariant(ctx: &WorkerContext, location: &'static str, detail: String) -> EngineError {
    EngineError::InvariantViolation {
        node: ctx.node_id,
        location,
        detail,
    }
}

// ---------------------------------------------------------------------
// Hydro loops
// ---------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Loop {
    Density,
    Force,
}

/// Density self-interaction of one cell; the standalone entry point used by
/// the pair/self benchmark harness and the scenario tests.
pub fn doself1_density(space: &Space, ci: CellId, ti_current: IntegerTime) {
    doself_density(space, &space.cells[ci.idx()], ti_current);
}

/// Density pair interaction along a sorted axis; both cells must hold valid
/// sort entries for `sid`.
pub fn dopair1_density(
    ctx: &WorkerContext,
    space: &Space,
    ci: CellId,
    cj: CellId,
    sid: usize,
    ti_current: IntegerTime,
) -> Result<()> {
    dopair_density(ctx, space, ci, cj, sid, ti_current)
}

/// Brute-force density pair, no sorting required; the reference the sorted
/// sweep is checked against.
pub fn dopair_density_naive(space: &Space, ci: CellId, cj: CellId, ti_current: IntegerTime) {
    dopair_naive(space, ci, cj, ti_current, usize::MAX, Loop::Density);
}

/// Direct N^2 density loop over one cell's (sub)range.
fn doself_density(space: &Space, cell: &Cell, ti_current: IntegerTime) {
    if cell.is_foreign || cell.parts.is_empty() {
        return;
    }
    let max_bin = max_active_bin(ti_current);
    let parts = unsafe { space.parts_of_mut(cell) };
    let snap: Vec<DensityNeighbour> = parts.iter().map(DensityNeighbour::of).collect();
    let n = parts.len();
    for i in 0..n {
        if parts[i].time_bin > max_bin {
            continue;
        }
        let reach2 = 4.0 * parts[i].h * parts[i].h;
        let xi = parts[i].x;
        for (j, nj) in snap.iter().enumerate() {
            if j == i {
                continue;
            }
            let dx = [
                (xi[0] - nj.x[0]) as f32,
                (xi[1] - nj.x[1]) as f32,
                (xi[2] - nj.x[2]) as f32,
            ];
            let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2];
            if r2 < reach2 {
                hydro::density_interact(&mut parts[i], dx, r2, nj);
            }
        }
    }
}

/// Direct N^2 force loop over one cell's (sub)range.
fn doself_force(space: &Space, cell: &Cell, ti_current: IntegerTime) {
    if cell.is_foreign || cell.parts.is_empty() {
        return;
    }
    let max_bin = max_active_bin(ti_current);
    let parts = unsafe { space.parts_of_mut(cell) };
    let snap: Vec<ForceNeighbour> = parts.iter().map(ForceNeighbour::of).collect();
    let n = parts.len();
    for i in 0..n {
        if parts[i].time_bin > max_bin {
            continue;
        }
        let xi = parts[i].x;
        let hi = parts[i].h;
        for (j, nj) in snap.iter().enumerate() {
            if j == i {
                continue;
            }
            let reach = (2.0 * hi).max(2.0 * nj.h);
            let dx = [
                (xi[0] - nj.x[0]) as f32,
                (xi[1] - nj.x[1]) as f32,
                (xi[2] - nj.x[2]) as f32,
            ];
            let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2];
            if r2 < reach * reach {
                hydro::force_interact(&mut parts[i], dx, r2, nj);
            }
        }
    }
}

/// Sorted-sweep density pair: walk both cells' projections along the pair
/// axis and only test candidates inside the kernel-support window.
fn dopair_density(
    ctx: &WorkerContext,
    space: &Space,
    ci: CellId,
    cj: CellId,
    sid: usize,
    ti_current: IntegerTime,
) -> Result<()> {
    let cell_i = &space.cells[ci.idx()];
    let cell_j = &space.cells[cj.idx()];
    let mask = 1u32 << sid;
    if cell_i.sorted.load(Ordering::Relaxed) & mask == 0
        || cell_j.sorted.load(Ordering::Relaxed) & mask == 0
    {
        return Err(invariant(
            ctx,
            "runner::dopair_density (unsorted)",
            format!("cells {:?}/{:?} axis {}", ci, cj, sid),
        ));
    }

    let shift_j = space.periodic_shift(ci, cj);
    let axis = sort::SORT_AXES[sid];
    let dshift_j =
        (shift_j[0] * axis[0] + shift_j[1] * axis[1] + shift_j[2] * axis[2]) as f32;

    // Sort caches are locked in cell-id order, like the hold locks.
    let (sort_i, sort_j);
    if ci.0 < cj.0 {
        sort_i = cell_i.sort.lock().unwrap();
        sort_j = cell_j.sort.lock().unwrap();
    } else {
        sort_j = cell_j.sort.lock().unwrap();
        sort_i = cell_i.sort.lock().unwrap();
    }
    let entries_i = &sort_i.axes[sid];
    let entries_j = &sort_j.axes[sid];

    if !cell_i.is_foreign {
        let parts_i = unsafe { space.parts_of_mut(cell_i) };
        let parts_j = unsafe { space.parts_of(cell_j) };
        sweep_density(
            parts_i,
            cell_i.parts.first,
            entries_i,
            parts_j,
            cell_j.parts.first,
            entries_j,
            dshift_j,
            shift_j,
            ti_current,
        );
    }
    if !cell_j.is_foreign {
        let parts_j = unsafe { space.parts_of_mut(cell_j) };
        let parts_i = unsafe { space.parts_of(cell_i) };
        let shift_i = [-shift_j[0], -shift_j[1], -shift_j[2]];
        sweep_density(
            parts_j,
            cell_j.parts.first,
            entries_j,
            parts_i,
            cell_i.parts.first,
            entries_i,
            -dshift_j,
            shift_i,
            ti_current,
        );
    }
    Ok(())
}

/// First entry index whose projection is at least `bound`.
fn lower_bound(entries: &[crate::cell::SortEntry], bound: f32) -> usize {
    entries.partition_point(|e| e.dist < bound)
}

#[allow(clippy::too_many_arguments)]
fn sweep_density(
    parts_i: &mut [Part],
    first_i: usize,
    entries_i: &[crate::cell::SortEntry],
    parts_j: &[Part],
    first_j: usize,
    entries_j: &[crate::cell::SortEntry],
    dshift_j: f32,
    shift_j: [f64; 3],
    ti_current: IntegerTime,
) {
    let max_bin = max_active_bin(ti_current);
    for e in entries_i {
        let li = e.index as usize - first_i;
        if parts_i[li].time_bin > max_bin {
            continue;
        }
        let hi = parts_i[li].h;
        let reach = 2.0 * hi;
        let xi = parts_i[li].x;
        let start = lower_bound(entries_j, e.dist - reach - dshift_j);
        for ej in &entries_j[start..] {
            if ej.dist + dshift_j > e.dist + reach {
                break;
            }
            let lj = ej.index as usize - first_j;
            let pj = &parts_j[lj];
            let dx = [
                (xi[0] - pj.x[0] - shift_j[0]) as f32,
                (xi[1] - pj.x[1] - shift_j[1]) as f32,
                (xi[2] - pj.x[2] - shift_j[2]) as f32,
            ];
            let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2];
            if r2 < reach * reach {
                let nj = DensityNeighbour {
                    x: [
                        pj.x[0] + shift_j[0],
                        pj.x[1] + shift_j[1],
                        pj.x[2] + shift_j[2],
                    ],
                    v: pj.v,
                    mass: pj.mass,
                };
                hydro::density_interact(&mut parts_i[li], dx, r2, &nj);
            }
        }
    }
}

/// Sorted-sweep force pair; the window widens to the larger of the two
/// supports.
fn dopair_force(
    ctx: &WorkerContext,
    space: &Space,
    ci: CellId,
    cj: CellId,
    sid: usize,
    ti_current: IntegerTime,
) -> Result<()> {
    let cell_i = &space.cells[ci.idx()];
    let cell_j = &space.cells[cj.idx()];
    let mask = 1u32 << sid;
    if cell_i.sorted.load(Ordering::Relaxed) & mask == 0
        || cell_j.sorted.load(Ordering::Relaxed) & mask == 0
    {
        return Err(invariant(
            ctx,
            "runner::dopair_force (unsorted)",
            format!("cells {:?}/{:?} axis {}", ci, cj, sid),
        ));
    }

    let shift_j = space.periodic_shift(ci, cj);
    let axis = sort::SORT_AXES[sid];
    let dshift_j =
        (shift_j[0] * axis[0] + shift_j[1] * axis[1] + shift_j[2] * axis[2]) as f32;

    let (sort_i, sort_j);
    if ci.0 < cj.0 {
        sort_i = cell_i.sort.lock().unwrap();
        sort_j = cell_j.sort.lock().unwrap();
    } else {
        sort_j = cell_j.sort.lock().unwrap();
        sort_i = cell_i.sort.lock().unwrap();
    }

    if !cell_i.is_foreign {
        let parts_i = unsafe { space.parts_of_mut(cell_i) };
        let parts_j = unsafe { space.parts_of(cell_j) };
        sweep_force(
            parts_i,
            cell_i.parts.first,
            &sort_i.axes[sid],
            parts_j,
            cell_j.parts.first,
            &sort_j.axes[sid],
            cell_j.h_max,
            dshift_j,
            shift_j,
            ti_current,
        );
    }
    if !cell_j.is_foreign {
        let parts_j = unsafe { space.parts_of_mut(cell_j) };
        let parts_i = unsafe { space.parts_of(cell_i) };
        let shift_i = [-shift_j[0], -shift_j[1], -shift_j[2]];
        sweep_force(
            parts_j,
            cell_j.parts.first,
            &sort_j.axes[sid],
            parts_i,
            cell_i.parts.first,
            &sort_i.axes[sid],
            cell_i.h_max,
            -dshift_j,
            shift_i,
            ti_current,
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn sweep_force(
    parts_i: &mut [Part],
    first_i: usize,
    entries_i: &[crate::cell::SortEntry],
    parts_j: &[Part],
    first_j: usize,
    entries_j: &[crate::cell::SortEntry],
    h_max_j: f32,
    dshift_j: f32,
    shift_j: [f64; 3],
    ti_current: IntegerTime,
) {
    let max_bin = max_active_bin(ti_current);
    for e in entries_i {
        let li = e.index as usize - first_i;
        if parts_i[li].time_bin > max_bin {
            continue;
        }
        let hi = parts_i[li].h;
        let window = (2.0 * hi).max(2.0 * h_max_j);
        let xi = parts_i[li].x;
        let start = lower_bound(entries_j, e.dist - window - dshift_j);
        for ej in &entries_j[start..] {
            if ej.dist + dshift_j > e.dist + window {
                break;
            }
            let lj = ej.index as usize - first_j;
            let pj = &parts_j[lj];
            let reach = (2.0 * hi).max(2.0 * pj.h);
            let dx = [
                (xi[0] - pj.x[0] - shift_j[0]) as f32,
                (xi[1] - pj.x[1] - shift_j[1]) as f32,
                (xi[2] - pj.x[2] - shift_j[2]) as f32,
            ];
            let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2];
            if r2 < reach * reach {
                let mut nj = ForceNeighbour::of(pj);
                nj.x = [
                    pj.x[0] + shift_j[0],
                    pj.x[1] + shift_j[1],
                    pj.x[2] + shift_j[2],
                ];
                hydro::force_interact(&mut parts_i[li], dx, r2, &nj);
            }
        }
    }
}

/// Brute-force pair loop used by sub-pair tasks (small subtrees, no sorts).
fn dopair_naive(
    space: &Space,
    ci: CellId,
    cj: CellId,
    ti_current: IntegerTime,
    _node_id: usize,
    which: Loop,
) {
    let cell_i = &space.cells[ci.idx()];
    let cell_j = &space.cells[cj.idx()];
    let shift_j = space.periodic_shift(ci, cj);
    let max_bin = max_active_bin(ti_current);

    let one_side = |mutable: &Cell, readonly: &Cell, shift: [f64; 3]| {
        if mutable.is_foreign || mutable.parts.is_empty() || readonly.parts.is_empty() {
            return;
        }
        let parts_m = unsafe { space.parts_of_mut(mutable) };
        let parts_r = unsafe { space.parts_of(readonly) };
        for pi in parts_m.iter_mut() {
            if pi.time_bin > max_bin {
                continue;
            }
            for pj in parts_r.iter() {
                let reach = match which {
                    Loop::Density => 2.0 * pi.h,
                    Loop::Force => (2.0 * pi.h).max(2.0 * pj.h),
                };
                let dx = [
                    (pi.x[0] - pj.x[0] - shift[0]) as f32,
                    (pi.x[1] - pj.x[1] - shift[1]) as f32,
                    (pi.x[2] - pj.x[2] - shift[2]) as f32,
                ];
                let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2];
                if r2 < reach * reach {
                    let xj = [
                        pj.x[0] + shift[0],
                        pj.x[1] + shift[1],
                        pj.x[2] + shift[2],
                    ];
                    match which {
                        Loop::Density => {
                            let nj = DensityNeighbour {
                                x: xj,
                                v: pj.v,
                                mass: pj.mass,
                            };
                            hydro::density_interact(pi, dx, r2, &nj);
                        }
                        Loop::Force => {
                            let mut nj = ForceNeighbour::of(pj);
                            nj.x = xj;
                            hydro::force_interact(pi, dx, r2, &nj);
                        }
                    }
                }
            }
        }
    };

    one_side(cell_i, cell_j, shift_j);
    one_side(cell_j, cell_i, [-shift_j[0], -shift_j[1], -shift_j[2]]);
}

// ---------------------------------------------------------------------
// Gravity
// ---------------------------------------------------------------------

fn doself_grav(ctx: &WorkerContext, space: &Space, cell: &Cell, ti_current: IntegerTime) {
    if cell.is_foreign || cell.gparts.is_empty() {
        return;
    }
    let max_bin = max_active_bin(ti_current);
    let gparts = unsafe { space.gparts_of_mut(cell) };
    let snap: Vec<([f64; 3], f32)> = gparts.iter().map(|g| (g.x, g.mass)).collect();
    for i in 0..gparts.len() {
        if gparts[i].time_bin > max_bin {
            continue;
        }
        for (j, &(xj, mj)) in snap.iter().enumerate() {
            if j != i {
                gravity::grav_interact(&mut gparts[i], xj, mj, ctx.params.grav_softening);
            }
        }
    }
}

fn dopair_grav(
    ctx: &WorkerContext,
    space: &Space,
    ci: CellId,
    cj: CellId,
    ti_current: IntegerTime,
) {
    let cell_i = &space.cells[ci.idx()];
    let cell_j = &space.cells[cj.idx()];
    let shift_j = space.periodic_shift(ci, cj);
    let max_bin = max_active_bin(ti_current);

    let one_side = |mutable: &Cell, readonly: &Cell, shift: [f64; 3]| {
        if mutable.is_foreign || mutable.gparts.is_empty() || readonly.gparts.is_empty() {
            return;
        }
        let gm = unsafe { space.gparts_of_mut(mutable) };
        let gr = unsafe { space.gparts_of(readonly) };
        for gi in gm.iter_mut() {
            if gi.time_bin > max_bin {
                continue;
            }
            for gj in gr.iter() {
                let xj = [
                    gj.x[0] + shift[0],
                    gj.x[1] + shift[1],
                    gj.x[2] + shift[2],
                ];
                gravity::grav_interact(gi, xj, gj.mass, ctx.params.grav_softening);
            }
        }
    };

    one_side(cell_i, cell_j, shift_j);
    one_side(cell_j, cell_i, [-shift_j[0], -shift_j[1], -shift_j[2]]);
}

fn do_external_grav(
    ctx: &WorkerContext,
    space: &Space,
    cell: &Cell,
    ti_current: IntegerTime,
) {
    let Some(pot) = ctx.params.external_potential else {
        return;
    };
    if cell.is_foreign || cell.gparts.is_empty() {
        return;
    }
    let max_bin = max_active_bin(ti_current);
    let gparts = unsafe { space.gparts_of_mut(cell) };
    for g in gparts.iter_mut() {
        if g.time_bin <= max_bin {
            gravity::external_grav_interact(g, &pot);
        }
    }
}

fn do_grav_up(space: &Space, cell: &Cell) {
    let gparts = unsafe { space.gparts_of(cell) };
    *cell.multipole.lock().unwrap() = Multipole::from_gparts(gparts);
}

fn do_grav_gather(ctx: &WorkerContext, space: &Space) {
    let mut total = Multipole::default();
    for cid in 0..space.nr_top_cells {
        let c = &space.cells[cid];
        if c.node_id == ctx.node_id && !c.gparts.is_empty() {
            total = total.add(&c.multipole.lock().unwrap());
        }
    }
    let mut mesh = ctx.mesh.lock().unwrap();
    mesh.total = total;
    mesh.ready = false;
}

/// Long-range pull of every non-neighbouring top cell's monopole.
fn do_grav_mm(ctx: &WorkerContext, space: &Space, ci: CellId, ti_current: IntegerTime) {
    let cell = &space.cells[ci.idx()];
    if cell.is_foreign || cell.gparts.is_empty() {
        return;
    }
    let max_bin = max_active_bin(ti_current);
    let gparts = unsafe { space.gparts_of_mut(cell) };
    for cjd in 0..space.nr_top_cells {
        let cj = CellId(cjd as u32);
        if cj == ci {
            continue;
        }
        let other = &space.cells[cjd];
        if other.node_id != ctx.node_id || other.gparts.is_empty() {
            continue;
        }
        if space.cells_are_neighbours(ci, cj) {
            continue;
        }
        let m = *other.multipole.lock().unwrap();
        for g in gparts.iter_mut() {
            if g.time_bin <= max_bin {
                gravity::mm_interact(g, &m, ctx.params.grav_softening);
            }
        }
    }
}

// ---------------------------------------------------------------------
// Per-particle hierarchical tasks
// ---------------------------------------------------------------------

/// Advance positions of the subtree below `cid` to the current time.
fn do_drift(ctx: &WorkerContext, space: &Space, cid: CellId, ti_current: IntegerTime) {
    drift_cell(ctx, space, cid, ti_current);
}

/// Drift one top-level subtree; the engine's drift-all pass maps this over
/// the local top cells outside the task graph.
pub fn drift_top(ctx: &WorkerContext, space: &Space, cid: CellId) {
    let ti = ctx.ti_current.load(Ordering::Relaxed);
    drift_cell(ctx, space, cid, ti);
}

fn drift_cell(
    ctx: &WorkerContext,
    space: &Space,
    cid: CellId,
    ti_current: IntegerTime,
) -> (f32, f32) {
    let cell = &space.cells[cid.idx()];
    let ti_old = cell.ti_old_part.load(Ordering::Relaxed);
    if ti_old == ti_current {
        return (cell.dx_max_part.load(), cell.dx_max_sort.load());
    }
    let dt = ctx.timeline.dt_of(ti_current - ti_old);

    let (mut dx_max, mut dx_max_sort) = (0.0_f32, 0.0_f32);
    if cell.split {
        for child in cell.progeny.iter().flatten() {
            let (d, ds) = drift_cell(ctx, space, *child, ti_current);
            dx_max = dx_max.max(d);
            dx_max_sort = dx_max_sort.max(ds);
        }
    } else {
        let parts = unsafe { space.parts_of_mut(cell) };
        let xparts = unsafe { space.xparts_of_mut(cell) };
        for (p, xp) in parts.iter_mut().zip(xparts.iter_mut()) {
            for k in 0..3 {
                let dx = xp.v_full[k] as f64 * dt;
                p.x[k] += dx;
                xp.x_diff[k] += dx as f32;
                xp.x_diff_sort[k] += dx as f32;
            }
            // Predicted velocity follows the full-step one between kicks.
            p.v = xp.v_full;
            let d2 = xp.x_diff[0] * xp.x_diff[0]
                + xp.x_diff[1] * xp.x_diff[1]
                + xp.x_diff[2] * xp.x_diff[2];
            let s2 = xp.x_diff_sort[0] * xp.x_diff_sort[0]
                + xp.x_diff_sort[1] * xp.x_diff_sort[1]
                + xp.x_diff_sort[2] * xp.x_diff_sort[2];
            dx_max = dx_max.max(d2.sqrt());
            dx_max_sort = dx_max_sort.max(s2.sqrt());
        }
        let gparts = unsafe { space.gparts_of_mut(cell) };
        for g in gparts.iter_mut() {
            for k in 0..3 {
                g.x[k] += g.v_full[k] as f64 * dt;
            }
        }
        let sparts = unsafe { space.sparts_of_mut(cell) };
        for s in sparts.iter_mut() {
            for k in 0..3 {
                s.x[k] += s.v[k] as f64 * dt;
            }
        }
    }

    cell.dx_max_part.store(dx_max);
    cell.dx_max_sort.store(dx_max_sort);
    cell.ti_old_part.store(ti_current, Ordering::Relaxed);
    (dx_max, dx_max_sort)
}

/// Clear the since-last-sort displacement of a freshly sorted subtree.
fn reset_sort_diffs(space: &Space, cid: CellId) {
    let cell = &space.cells[cid.idx()];
    if cell.is_foreign {
        return;
    }
    if cell.split {
        for child in cell.progeny.iter().flatten() {
            reset_sort_diffs(space, *child);
        }
    } else {
        let xparts = unsafe { space.xparts_of_mut(cell) };
        for xp in xparts.iter_mut() {
            xp.x_diff_sort = [0.0; 3];
        }
    }
    cell.dx_max_sort.store(0.0);
}

fn do_init(space: &Space, cell: &Cell, ti_current: IntegerTime) {
    let max_bin = max_active_bin(ti_current);
    let parts = unsafe { space.parts_of_mut(cell) };
    for p in parts.iter_mut() {
        if p.time_bin <= max_bin {
            hydro::init_part(p);
        }
    }
    let gparts = unsafe { space.gparts_of_mut(cell) };
    for g in gparts.iter_mut() {
        if g.time_bin <= max_bin {
            g.a_grav = [0.0; 3];
        }
    }
}

fn do_ghost(space: &Space, cell: &Cell, ti_current: IntegerTime) {
    let max_bin = max_active_bin(ti_current);
    let parts = unsafe { space.parts_of_mut(cell) };
    for p in parts.iter_mut() {
        if p.time_bin <= max_bin {
            hydro::end_density(p);
            hydro::prepare_force(p);
        }
    }
}

fn do_kick(space: &Space, cell: &Cell, timeline: &Timeline, ti_current: IntegerTime) {
    let max_bin = max_active_bin(ti_current);
    let first_g = cell.gparts.first;
    let parts = unsafe { space.parts_of_mut(cell) };
    let xparts = unsafe { space.xparts_of_mut(cell) };
    let gparts = unsafe { space.gparts_of_mut(cell) };

    for (p, xp) in parts.iter_mut().zip(xparts.iter_mut()) {
        if p.time_bin > max_bin {
            continue;
        }
        let dt_half = 0.5 * timeline.dt_of(Timeline::step_of(p.time_bin)) as f32;
        let grav_a = p
            .gpart
            .map(|j| gparts[j as usize - first_g].a_grav)
            .unwrap_or([0.0; 3]);
        hydro::kick(p, xp, grav_a, dt_half);
    }
    for g in gparts.iter_mut() {
        if !g.partner.is_dark_matter() || g.time_bin > max_bin {
            continue;
        }
        let dt_half = 0.5 * timeline.dt_of(Timeline::step_of(g.time_bin)) as f32;
        for k in 0..3 {
            g.v_full[k] += g.a_grav[k] * dt_half;
        }
    }
}

/// Recompute the time bins of the active particles and refresh the
/// integer-time marks of the whole subtree.
fn do_timestep(ctx: &WorkerContext, space: &Space, cid: CellId, ti_current: IntegerTime) {
    timestep_cell(ctx, space, cid, ti_current);
}

fn timestep_cell(
    ctx: &WorkerContext,
    space: &Space,
    cid: CellId,
    ti_current: IntegerTime,
) -> (IntegerTime, IntegerTime, i64, i64, i64) {
    let cell = &space.cells[cid.idx()];
    let max_bin = max_active_bin(ti_current);
    let mut ti_end_min = IntegerTime::MAX;
    let mut ti_end_max = 0;
    let (mut updated, mut g_updated, mut s_updated) = (0i64, 0i64, 0i64);

    if cell.split {
        for child in cell.progeny.iter().flatten() {
            let (emin, emax, u, gu, su) = timestep_cell(ctx, space, *child, ti_current);
            ti_end_min = ti_end_min.min(emin);
            ti_end_max = ti_end_max.max(emax);
            updated += u;
            g_updated += gu;
            s_updated += su;
        }
    } else {
        let first_p = cell.parts.first;
        let parts = unsafe { space.parts_of_mut(cell) };
        for p in parts.iter_mut() {
            if p.time_bin <= max_bin {
                let dt = hydro::timestep(p, ctx.params.cfl) as f64;
                let dti = ctx.timeline.integer_timestep(dt, ti_current);
                p.time_bin = Timeline::bin_of(dti);
                updated += 1;
            }
            let end = ti_end_for(p.time_bin, ti_current);
            ti_end_min = ti_end_min.min(end);
            ti_end_max = ti_end_max.max(end);
        }
        let gparts = unsafe { space.gparts_of_mut(cell) };
        for g in gparts.iter_mut() {
            if g.time_bin <= max_bin {
                match g.partner {
                    kernel::PartnerRef::DarkMatter(_) => {
                        let dt = gravity::grav_timestep(
                            g,
                            ctx.params.grav_eta,
                            ctx.params.grav_softening,
                        ) as f64;
                        let dti = ctx.timeline.integer_timestep(dt, ti_current);
                        g.time_bin = Timeline::bin_of(dti);
                    }
                    kernel::PartnerRef::Gas(i) => {
                        g.time_bin = parts[i as usize - first_p].time_bin;
                    }
                    kernel::PartnerRef::Star(_) => {
                        let dti = ctx
                            .timeline
                            .integer_timestep(ctx.timeline.dt_max, ti_current);
                        g.time_bin = Timeline::bin_of(dti);
                    }
                }
                g_updated += 1;
            }
            let end = ti_end_for(g.time_bin, ti_current);
            ti_end_min = ti_end_min.min(end);
            ti_end_max = ti_end_max.max(end);
        }
        let sparts = unsafe { space.sparts_of_mut(cell) };
        for s in sparts.iter_mut() {
            if s.time_bin <= max_bin {
                let dti = ctx
                    .timeline
                    .integer_timestep(ctx.timeline.dt_max, ti_current);
                s.time_bin = Timeline::bin_of(dti);
                s_updated += 1;
            }
            let end = ti_end_for(s.time_bin, ti_current);
            ti_end_min = ti_end_min.min(end);
            ti_end_max = ti_end_max.max(end);
        }
    }

    if ti_end_min == IntegerTime::MAX {
        // An empty cell never wakes up.
        ti_end_min = ctx.timeline.max_nr_timesteps;
        ti_end_max = ctx.timeline.max_nr_timesteps;
    }

    cell.ti_end_min.store(ti_end_min, Ordering::Relaxed);
    cell.ti_end_max.store(ti_end_max, Ordering::Relaxed);
    cell.updated.store(updated, Ordering::Relaxed);
    cell.g_updated.store(g_updated, Ordering::Relaxed);
    cell.s_updated.store(s_updated, Ordering::Relaxed);
    (ti_end_min, ti_end_max, updated, g_updated, s_updated)
}

fn do_cooling(ctx: &WorkerContext, space: &Space, cell: &Cell, ti_current: IntegerTime) {
    let max_bin = max_active_bin(ti_current);
    let parts = unsafe { space.parts_of_mut(cell) };
    let xparts = unsafe { space.xparts_of_mut(cell) };
    for (p, xp) in parts.iter_mut().zip(xparts.iter_mut()) {
        if p.time_bin <= max_bin {
            let dt = ctx.timeline.dt_of(Timeline::step_of(p.time_bin)) as f32;
            kernel::cooling::cool_part(p, xp, &ctx.params.cooling, dt);
        }
    }
}

fn do_sourceterms(ctx: &WorkerContext, space: &Space, cell: &Cell, ti_current: IntegerTime) {
    let max_bin = max_active_bin(ti_current);
    let parts = unsafe { space.parts_of_mut(cell) };
    let xparts = unsafe { space.xparts_of_mut(cell) };
    for (p, xp) in parts.iter_mut().zip(xparts.iter_mut()) {
        if p.time_bin <= max_bin {
            let dt = ctx.timeline.dt_of(Timeline::step_of(p.time_bin)) as f32;
            kernel::cooling::apply_source_terms(p, xp, &ctx.params.sourceterms, dt);
        }
    }
}

// ---------------------------------------------------------------------
// Communication tasks
// ---------------------------------------------------------------------

fn do_send(ctx: &WorkerContext, space: &Space, t: &Task) -> Result<()> {
    let ci = t.ci.expect("send task without a cell");
    let cell = &space.cells[ci.idx()];
    let peer = space.cells[t.cj.expect("send task without a peer cell").idx()].node_id;
    let tag = t.flags() as i64;

    let bytes = match t.subtype {
        TaskSubtype::Xv => {
            let parts = unsafe { space.parts_of(cell) };
            let msgs: Vec<crate::proxy::PartXvMsg> = parts
                .iter()
                .map(|p| crate::proxy::PartXvMsg {
                    x: p.x,
                    id: p.id,
                    v: p.v,
                    h: p.h,
                    mass: p.mass,
                    pad: 0,
                })
                .collect();
            bytemuck::cast_slice(&msgs).to_vec()
        }
        TaskSubtype::Rho => {
            let parts = unsafe { space.parts_of(cell) };
            let msgs: Vec<crate::proxy::PartRhoMsg> = parts
                .iter()
                .map(|p| crate::proxy::PartRhoMsg {
                    rho: p.rho,
                    wcount: p.density.wcount,
                    wcount_dh: p.density.wcount_dh,
                    rho_dh: p.density.rho_dh,
                    div_v: p.density.div_v,
                    rot_v: p.density.rot_v,
                    entropy: p.entropy,
                    pad: 0.0,
                })
                .collect();
            bytemuck::cast_slice(&msgs).to_vec()
        }
        TaskSubtype::Tend => {
            let parts = unsafe { space.parts_of(cell) };
            let bins: Vec<i8> = parts.iter().map(|p| p.time_bin).collect();
            bytemuck::cast_slice(&bins).to_vec()
        }
        other => {
            return Err(invariant(
                ctx,
                "runner::do_send (subtype)",
                format!("{:?}", other),
            ))
        }
    };
    ctx.transport.send(peer, tag, bytes)
}

fn do_recv(ctx: &WorkerContext, space: &Space, t: &Task) -> Result<Outcome> {
    let ci = t.ci.expect("recv task without a cell");
    let cell = &space.cells[ci.idx()];
    let peer = cell.node_id;
    let tag = t.flags() as i64;

    let Some(bytes) = ctx.transport.try_recv(peer, tag)? else {
        return Ok(Outcome::Requeue);
    };

    match t.subtype {
        TaskSubtype::Xv => {
            // The transport hands back unaligned bytes; decode by copy.
            let msgs: Vec<crate::proxy::PartXvMsg> = bytemuck::pod_collect_to_vec(&bytes);
            check_payload(ctx, peer, msgs.len(), cell.parts.count)?;
            let parts =
                unsafe { space.parts_foreign.slice_mut(cell.parts.range()) };
            for (p, m) in parts.iter_mut().zip(&msgs) {
                p.x = m.x;
                p.v = m.v;
                p.h = m.h;
                p.mass = m.mass;
                p.id = m.id;
            }
        }
        TaskSubtype::Rho => {
            let msgs: Vec<crate::proxy::PartRhoMsg> = bytemuck::pod_collect_to_vec(&bytes);
            check_payload(ctx, peer, msgs.len(), cell.parts.count)?;
            let parts =
                unsafe { space.parts_foreign.slice_mut(cell.parts.range()) };
            for (p, m) in parts.iter_mut().zip(&msgs) {
                p.rho = m.rho;
                p.density.wcount = m.wcount;
                p.density.wcount_dh = m.wcount_dh;
                p.density.rho_dh = m.rho_dh;
                p.density.div_v = m.div_v;
                p.density.rot_v = m.rot_v;
                p.entropy = m.entropy;
            }
        }
        TaskSubtype::Tend => {
            let bins: &[i8] = bytemuck::cast_slice(&bytes);
            check_payload(ctx, peer, bins.len(), cell.parts.count)?;
            {
                let parts =
                    unsafe { space.parts_foreign.slice_mut(cell.parts.range()) };
                for (p, &b) in parts.iter_mut().zip(bins) {
                    p.time_bin = b;
                }
            }
            let ti_current = ctx.ti_current.load(Ordering::Relaxed);
            refresh_foreign_ti(ctx, space, ci, ti_current);
        }
        other => {
            return Err(invariant(
                ctx,
                "runner::do_recv (subtype)",
                format!("{:?}", other),
            ))
        }
    }
    Ok(Outcome::Done)
}

fn check_payload(
    ctx: &WorkerContext,
    peer: usize,
    got: usize,
    want: usize,
) -> Result<()> {
    if got != want {
        return Err(EngineError::Communication {
            node: ctx.node_id,
            peer,
            detail: format!("payload count {} does not match cell count {}", got, want),
        });
    }
    Ok(())
}

/// Refresh the integer-time marks of a foreign subtree after new bins
/// arrived.
fn refresh_foreign_ti(
    ctx: &WorkerContext,
    space: &Space,
    cid: CellId,
    ti_current: IntegerTime,
) -> IntegerTime {
    let cell = &space.cells[cid.idx()];
    let mut ti_end_min = IntegerTime::MAX;
    if cell.split {
        for child in cell.progeny.iter().flatten() {
            ti_end_min = ti_end_min.min(refresh_foreign_ti(ctx, space, *child, ti_current));
        }
    } else {
        let parts = unsafe { space.parts_foreign.slice(cell.parts.range()) };
        for p in parts {
            ti_end_min = ti_end_min.min(ti_end_for(p.time_bin, ti_current));
        }
    }
    if ti_end_min == IntegerTime::MAX {
        ti_end_min = ctx.timeline.max_nr_timesteps;
    }
    cell.ti_end_min.store(ti_end_min, Ordering::Relaxed);
    ti_end_min
}
