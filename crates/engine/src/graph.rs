//! Task-graph construction.
//!
//! Runs after every rebuild: enumerate the interaction tasks over the fresh
//! cell tree (splitting large ones into their children as it goes), attach
//! the hierarchical per-cell tasks at the super cells, duplicate the density
//! loop into the force loop, wire the gravity chain, add the per-proxy
//! send/receive tasks, then compile, rank and weight the whole graph.

use crate::cell::{CellId, TaskId};
use crate::error::{EngineError, Result};
use crate::proxy::{self, Proxy};
use crate::scheduler::Scheduler;
use crate::sort::sid_of_offset;
use crate::space::Space;
use crate::task::{Task, TaskSubtype, TaskType};

/// Which physics the graph carries.
#[derive(Debug, Clone, Default)]
pub struct GraphPolicy {
    /// SPH density/force loops.
    pub hydro: bool,
    /// Self-gravity (pair + long-range).
    pub self_gravity: bool,
    /// External potential.
    pub external_gravity: bool,
    /// Cooling tasks.
    pub cooling: bool,
    /// Source-term tasks.
    pub sourceterms: bool,
}

/// Build the complete task graph for the current cell tree.
pub fn make_tasks(
    sched: &Scheduler,
    space: &mut Space,
    policy: &GraphPolicy,
    node_id: usize,
    proxies: &[Proxy],
) -> Result<()> {
    sched.reset();

    // Clear per-cell graph state from the previous build.
    for c in space.cells.iter_mut() {
        c.tasks = Default::default();
        c.links = Default::default();
        c.nr_tasks = 0;
        c.super_ = None;
    }

    if policy.hydro {
        make_hydroloop_tasks(sched, space, node_id);
    }
    if policy.self_gravity {
        make_gravity_tasks(sched, space, node_id);
    }
    if policy.external_gravity {
        make_external_gravity_tasks(sched, space, node_id);
    }

    let have_local_particles = (0..space.nr_top_cells).any(|cid| {
        space.cells[cid].node_id == node_id && !space.cells[cid].is_empty()
    });
    if sched.nr_tasks() == 0 && have_local_particles {
        return Err(EngineError::InvariantViolation {
            node: node_id,
            location: "graph::make_tasks",
            detail: "particles present but no interaction tasks created".to_string(),
        });
    }

    count_and_link_tasks(sched, space);

    // The super pointers need the task counts from the link pass.
    for cid in 0..space.nr_top_cells {
        set_super(space, CellId(cid as u32), None);
    }

    make_hierarchical_tasks(sched, space, policy, node_id)?;
    link_sort_tasks(sched, space, node_id)?;

    if policy.hydro {
        make_extra_hydroloop_tasks(sched, space, policy, node_id)?;
    }
    if policy.self_gravity || policy.external_gravity {
        if policy.self_gravity {
            make_gravity_recursive_tasks(sched, space, node_id);
        }
        link_gravity_tasks(sched, space, policy, node_id)?;
    }

    for p in proxies {
        for &c in &p.cells_in {
            add_recv_tasks(sched, space, c, None)?;
        }
        for &c in &p.cells_out {
            add_send_tasks(sched, space, c, p.peer, None, node_id)?;
        }
    }

    sched.set_unlocks();
    sched.rank_tasks()?;
    sched.reweight(space);

    tracing::debug!(
        "task graph built: {} tasks over {} cells",
        sched.nr_tasks(),
        space.cells.len()
    );
    Ok(())
}

// ---------------------------------------------------------------------
// Interaction enumeration
// ---------------------------------------------------------------------

/// Sort id of a pair of same-size cells from their grid offset.
fn sid_of_cells(space: &Space, ci: CellId, cj: CellId) -> usize {
    let shift = space.periodic_shift(ci, cj);
    let a = &space.cells[ci.idx()];
    let b = &space.cells[cj.idx()];
    let eps = 0.25 * a.width[0].min(a.width[1]).min(a.width[2]);
    let mut off = [0i32; 3];
    for k in 0..3 {
        let d = (b.loc[k] + shift[k]) - a.loc[k];
        off[k] = if d > eps {
            1
        } else if d < -eps {
            -1
        } else {
            0
        };
    }
    sid_of_offset(off).0
}

/// Self density on a cell, split into its children while they are large and
/// still resolve the kernel support.
fn add_self_density(sched: &Scheduler, space: &Space, cid: CellId) {
    let c = &space.cells[cid.idx()];
    if c.parts.count == 0 {
        return;
    }
    if c.split && c.parts.count > space.params.sub_size_self {
        let reach = 2.0 * c.h_max as f64;
        let progeny: Vec<CellId> = c.progeny.iter().flatten().copied().collect();
        for &child in &progeny {
            add_self_density(sched, space, child);
        }
        for (n, &a) in progeny.iter().enumerate() {
            for &b in &progeny[n + 1..] {
                if space.cells[a.idx()].parts.count > 0
                    && space.cells[b.idx()].parts.count > 0
                    && space.cells_within_reach(a, b, reach)
                {
                    add_pair_density(sched, space, a, b);
                }
            }
        }
    } else if c.split {
        sched.addtask(Task::new(
            TaskType::SubSelf,
            TaskSubtype::Density,
            0,
            Some(cid),
            None,
            false,
        ));
    } else {
        sched.addtask(Task::new(
            TaskType::SelfTask,
            TaskSubtype::Density,
            0,
            Some(cid),
            None,
            false,
        ));
    }
}

/// Pair density between two cells, recursing into both sets of children
/// while the pair is large; each interacting leaf pair ends up covered by
/// exactly one task.
fn add_pair_density(sched: &Scheduler, space: &Space, ci: CellId, cj: CellId) {
    let a = &space.cells[ci.idx()];
    let b = &space.cells[cj.idx()];
    if a.parts.count == 0 || b.parts.count == 0 {
        return;
    }
    let reach = 2.0 * a.h_max.max(b.h_max) as f64;
    let large = a.parts.count * b.parts.count > space.params.sub_size_pair;

    if a.split && b.split && large {
        let pa: Vec<CellId> = a.progeny.iter().flatten().copied().collect();
        let pb: Vec<CellId> = b.progeny.iter().flatten().copied().collect();
        for &ca in &pa {
            for &cb in &pb {
                if space.cells[ca.idx()].parts.count > 0
                    && space.cells[cb.idx()].parts.count > 0
                    && space.cells_within_reach(ca, cb, reach)
                {
                    add_pair_density(sched, space, ca, cb);
                }
            }
        }
    } else if !a.split && !b.split {
        let sid = sid_of_cells(space, ci, cj);
        sched.addtask(Task::new(
            TaskType::Pair,
            TaskSubtype::Density,
            sid as u32,
            Some(ci),
            Some(cj),
            true,
        ));
    } else {
        let sid = sid_of_cells(space, ci, cj);
        sched.addtask(Task::new(
            TaskType::SubPair,
            TaskSubtype::Density,
            sid as u32,
            Some(ci),
            Some(cj),
            true,
        ));
    }
}

/// Top-level hydro enumeration: one self per non-empty local top cell, one
/// pair per unordered neighbour couple with a local member.
fn make_hydroloop_tasks(sched: &Scheduler, space: &Space, node_id: usize) {
    let cdim = space.cdim;
    for i in 0..cdim[0] {
        for j in 0..cdim[1] {
            for k in 0..cdim[2] {
                let cid = crate::cell::cell_getid(cdim, i, j, k);
                let ci = CellId(cid as u32);
                if space.cells[cid].parts.count == 0 {
                    continue;
                }
                if space.cells[cid].node_id == node_id {
                    add_self_density(sched, space, ci);
                }
                for ii in -1i32..=1 {
                    let mut iii = i + ii;
                    if !space.periodic && (iii < 0 || iii >= cdim[0]) {
                        continue;
                    }
                    iii = (iii + cdim[0]) % cdim[0];
                    for jj in -1i32..=1 {
                        let mut jjj = j + jj;
                        if !space.periodic && (jjj < 0 || jjj >= cdim[1]) {
                            continue;
                        }
                        jjj = (jjj + cdim[1]) % cdim[1];
                        for kk in -1i32..=1 {
                            let mut kkk = k + kk;
                            if !space.periodic && (kkk < 0 || kkk >= cdim[2]) {
                                continue;
                            }
                            kkk = (kkk + cdim[2]) % cdim[2];
                            let cjd = crate::cell::cell_getid(cdim, iii, jjj, kkk);
                            if cid >= cjd
                                || space.cells[cjd].parts.count == 0
                                || (space.cells[cid].node_id != node_id
                                    && space.cells[cjd].node_id != node_id)
                            {
                                continue;
                            }
                            add_pair_density(sched, space, ci, CellId(cjd as u32));
                        }
                    }
                }
            }
        }
    }
}

/// Self gravity, split by particle count; child pairs carry no reach cut
/// because gravity has none.
fn add_self_grav(sched: &Scheduler, space: &Space, cid: CellId) {
    let c = &space.cells[cid.idx()];
    if c.gparts.count == 0 {
        return;
    }
    if c.split && c.gparts.count > space.params.sub_size_self {
        let progeny: Vec<CellId> = c.progeny.iter().flatten().copied().collect();
        for &child in &progeny {
            add_self_grav(sched, space, child);
        }
        for (n, &a) in progeny.iter().enumerate() {
            for &b in &progeny[n + 1..] {
                if space.cells[a.idx()].gparts.count > 0
                    && space.cells[b.idx()].gparts.count > 0
                {
                    sched.addtask(Task::new(
                        TaskType::Pair,
                        TaskSubtype::Grav,
                        0,
                        Some(a),
                        Some(b),
                        false,
                    ));
                }
            }
        }
    } else {
        sched.addtask(Task::new(
            TaskType::SelfTask,
            TaskSubtype::Grav,
            0,
            Some(cid),
            None,
            false,
        ));
    }
}

/// Top-level gravity: self + long-range per local cell, pair per
/// neighbouring local couple.
fn make_gravity_tasks(sched: &Scheduler, space: &Space, node_id: usize) {
    let nr_cells = space.nr_top_cells;
    for cid in 0..nr_cells {
        let ci = CellId(cid as u32);
        if space.cells[cid].gparts.count == 0 || space.cells[cid].node_id != node_id {
            continue;
        }
        add_self_grav(sched, space, ci);
        sched.addtask(Task::new(
            TaskType::GravMm,
            TaskSubtype::None,
            0,
            Some(ci),
            None,
            false,
        ));
        for cjd in cid + 1..nr_cells {
            let cj = CellId(cjd as u32);
            if space.cells[cjd].gparts.count == 0 || space.cells[cjd].node_id != node_id {
                continue;
            }
            if space.cells_are_neighbours(ci, cj) {
                sched.addtask(Task::new(
                    TaskType::Pair,
                    TaskSubtype::Grav,
                    0,
                    Some(ci),
                    Some(cj),
                    false,
                ));
            }
        }
    }
}

fn make_external_gravity_tasks(sched: &Scheduler, space: &Space, node_id: usize) {
    for cid in 0..space.nr_top_cells {
        let c = &space.cells[cid];
        if c.gparts.count == 0 || c.node_id != node_id {
            continue;
        }
        sched.addtask(Task::new(
            TaskType::SelfTask,
            TaskSubtype::ExternalGrav,
            0,
            Some(CellId(cid as u32)),
            None,
            false,
        ));
    }
}

// ---------------------------------------------------------------------
// Linking
// ---------------------------------------------------------------------

/// Attach the interaction tasks to their cells' link lists and count them
/// for the super-cell placement; create the sort task of every cell that
/// participates in a sorted pair.
fn count_and_link_tasks(sched: &Scheduler, space: &mut Space) {
    let metas: Vec<(TaskType, TaskSubtype, Option<CellId>, Option<CellId>)> = {
        let tasks = sched.tasks.read().unwrap();
        tasks
            .iter()
            .map(|t| (t.ttype, t.subtype, t.ci, t.cj))
            .collect()
    };

    for (idx, (ttype, subtype, ci, cj)) in metas.iter().enumerate() {
        let tid = TaskId(idx as u32);
        match ttype {
            TaskType::SelfTask | TaskType::SubSelf => {
                let Some(ci) = ci else { continue };
                space.cells[ci.idx()].nr_tasks += 1;
                match subtype {
                    TaskSubtype::Density => space.cells[ci.idx()].links.density.push(tid),
                    TaskSubtype::Grav | TaskSubtype::ExternalGrav => {
                        space.cells[ci.idx()].links.grav.push(tid)
                    }
                    _ => {}
                }
            }
            TaskType::Pair | TaskType::SubPair => {
                let (Some(ci), Some(cj)) = (*ci, *cj) else { continue };
                space.cells[ci.idx()].nr_tasks += 1;
                space.cells[cj.idx()].nr_tasks += 1;
                match subtype {
                    TaskSubtype::Density => {
                        space.cells[ci.idx()].links.density.push(tid);
                        space.cells[cj.idx()].links.density.push(tid);
                    }
                    TaskSubtype::Grav => {
                        space.cells[ci.idx()].links.grav.push(tid);
                        space.cells[cj.idx()].links.grav.push(tid);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    // Sorted pairs need both cells' sort tasks.
    for (idx, (ttype, subtype, ci, cj)) in metas.iter().enumerate() {
        if *ttype != TaskType::Pair || *subtype != TaskSubtype::Density {
            continue;
        }
        let tid = TaskId(idx as u32);
        let (Some(ci), Some(cj)) = (*ci, *cj) else { continue };
        for cell in [ci, cj] {
            let sorts = match space.cells[cell.idx()].tasks.sorts {
                Some(s) => s,
                None => {
                    let s = sched.addtask(Task::new(
                        TaskType::Sort,
                        TaskSubtype::None,
                        0,
                        Some(cell),
                        None,
                        false,
                    ));
                    space.cells[cell.idx()].tasks.sorts = Some(s);
                    s
                }
            };
            sched.addunlock(sorts, tid);
        }
    }

    // A split cell's sort merges its children's runs: order the child sort
    // tasks first where they exist.
    let sort_tasks: Vec<(CellId, TaskId)> = space
        .cells
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.tasks.sorts.map(|s| (CellId(i as u32), s)))
        .collect();
    for (cid, sorts) in sort_tasks {
        let progeny = space.cells[cid.idx()].progeny;
        for child in progeny.iter().flatten() {
            if let Some(child_sorts) = space.cells[child.idx()].tasks.sorts {
                sched.addunlock(child_sorts, sorts);
            }
        }
    }
}

/// The super cell of a subtree is its topmost cell carrying interaction
/// tasks.
fn set_super(space: &mut Space, cid: CellId, super_: Option<CellId>) {
    let super_ = match super_ {
        Some(s) => Some(s),
        None if space.cells[cid.idx()].nr_tasks > 0 => Some(cid),
        None => None,
    };
    space.cells[cid.idx()].super_ = super_;
    let progeny = space.cells[cid.idx()].progeny;
    for child in progeny.iter().flatten() {
        set_super(space, *child, super_);
    }
}

fn need<T>(t: Option<T>, node: usize, what: &'static str) -> Result<T> {
    t.ok_or(EngineError::InvariantViolation {
        node,
        location: "graph (missing hierarchical task)",
        detail: what.to_string(),
    })
}

/// Create the per-particle hierarchical tasks at every local super cell:
/// init, the two kicks, the time-step, the drift, and the conditional ghost
/// /cooling/source-term tasks, with their backbone dependencies.
fn make_hierarchical_tasks(
    sched: &Scheduler,
    space: &mut Space,
    policy: &GraphPolicy,
    node_id: usize,
) -> Result<()> {
    fn recurse(
        sched: &Scheduler,
        space: &mut Space,
        policy: &GraphPolicy,
        node_id: usize,
        cid: CellId,
    ) -> Result<()> {
        let is_super = space.cells[cid.idx()].super_ == Some(cid);
        if is_super {
            if space.cells[cid.idx()].node_id == node_id {
                let mk = |sched: &Scheduler, ttype| {
                    sched.addtask(Task::new(ttype, TaskSubtype::None, 0, Some(cid), None, false))
                };
                let init = mk(sched, TaskType::Init);
                let kick1 = mk(sched, TaskType::Kick1);
                let kick2 = mk(sched, TaskType::Kick2);
                let timestep = mk(sched, TaskType::Timestep);
                let drift = mk(sched, TaskType::Drift);

                sched.addunlock(kick2, timestep);
                sched.addunlock(kick1, drift);
                sched.addunlock(drift, init);

                let c = &mut space.cells[cid.idx()];
                c.tasks.init = Some(init);
                c.tasks.kick1 = Some(kick1);
                c.tasks.kick2 = Some(kick2);
                c.tasks.timestep = Some(timestep);
                c.tasks.drift = Some(drift);

                if policy.hydro {
                    let ghost = mk(sched, TaskType::Ghost);
                    space.cells[cid.idx()].tasks.ghost = Some(ghost);
                }
                if policy.cooling {
                    let cooling = mk(sched, TaskType::Cooling);
                    sched.addunlock(cooling, kick2);
                    space.cells[cid.idx()].tasks.cooling = Some(cooling);
                }
                if policy.sourceterms {
                    let sourceterms = mk(sched, TaskType::SourceTerms);
                    sched.addunlock(sourceterms, kick2);
                    space.cells[cid.idx()].tasks.sourceterms = Some(sourceterms);
                }
            }
        } else {
            let progeny = space.cells[cid.idx()].progeny;
            for child in progeny.iter().flatten() {
                recurse(sched, space, policy, node_id, *child)?;
            }
        }
        Ok(())
    }

    for cid in 0..space.nr_top_cells {
        recurse(sched, space, policy, node_id, CellId(cid as u32))?;
    }
    Ok(())
}

/// Sorts run on drifted positions: order each local sort task after its
/// super cell's drift.
fn link_sort_tasks(sched: &Scheduler, space: &Space, node_id: usize) -> Result<()> {
    let sort_tasks: Vec<(CellId, TaskId)> = space
        .cells
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.tasks.sorts.map(|s| (CellId(i as u32), s)))
        .collect();
    for (cid, sorts) in sort_tasks {
        let cell = &space.cells[cid.idx()];
        if cell.node_id != node_id {
            continue; // foreign sorts hang off recv_xv instead
        }
        let sup = need(cell.super_, node_id, "super of a sorting cell")?;
        let drift = need(space.cells[sup.idx()].tasks.drift, node_id, "drift for sorts")?;
        sched.addunlock(drift, sorts);
    }
    Ok(())
}

/// The hydro chain of one cell: `init -> density -> ghost -> force ->
/// (cooling | kick2)`.
fn hydro_deps(
    sched: &Scheduler,
    space: &Space,
    density: TaskId,
    force: TaskId,
    cell: CellId,
    policy: &GraphPolicy,
    node_id: usize,
) -> Result<()> {
    let sup = need(space.cells[cell.idx()].super_, node_id, "super for hydro deps")?;
    let st = &space.cells[sup.idx()].tasks;
    let init = need(st.init, node_id, "init")?;
    let ghost = need(st.ghost, node_id, "ghost")?;
    sched.addunlock(init, density);
    sched.addunlock(density, ghost);
    sched.addunlock(ghost, force);
    if policy.cooling {
        sched.addunlock(force, need(st.cooling, node_id, "cooling")?);
    } else {
        sched.addunlock(force, need(st.kick2, node_id, "kick2")?);
    }
    Ok(())
}

/// Duplicate every density-loop task into a force-loop task on the same
/// cells and wire the full hydro dependency chain for the local sides.
fn make_extra_hydroloop_tasks(
    sched: &Scheduler,
    space: &mut Space,
    policy: &GraphPolicy,
    node_id: usize,
) -> Result<()> {
    let metas: Vec<(TaskId, TaskType, Option<CellId>, Option<CellId>, u32)> = {
        let tasks = sched.tasks.read().unwrap();
        tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.subtype == TaskSubtype::Density)
            .map(|(i, t)| (TaskId(i as u32), t.ttype, t.ci, t.cj, t.flags()))
            .collect()
    };

    for (density, ttype, ci, cj, flags) in metas {
        let force = sched.addtask(Task::new(
            ttype,
            TaskSubtype::Force,
            flags,
            ci,
            cj,
            false,
        ));

        match ttype {
            TaskType::SelfTask | TaskType::SubSelf => {
                let Some(ci) = ci else { continue };
                space.cells[ci.idx()].links.force.push(force);
                hydro_deps(sched, space, density, force, ci, policy, node_id)?;
            }
            TaskType::Pair | TaskType::SubPair => {
                let (Some(ci), Some(cj)) = (ci, cj) else { continue };
                space.cells[ci.idx()].links.force.push(force);
                space.cells[cj.idx()].links.force.push(force);
                if space.cells[ci.idx()].node_id == node_id {
                    hydro_deps(sched, space, density, force, ci, policy, node_id)?;
                }
                if space.cells[cj.idx()].node_id == node_id
                    && space.cells[ci.idx()].super_ != space.cells[cj.idx()].super_
                {
                    hydro_deps(sched, space, density, force, cj, policy, node_id)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Gravity linking
// ---------------------------------------------------------------------

/// One multipole-construction sweep per local top cell with gravity
/// particles, its handle pushed down the subtree.
fn make_gravity_recursive_tasks(sched: &Scheduler, space: &mut Space, node_id: usize) {
    fn push_down(space: &mut Space, cid: CellId, up: TaskId) {
        space.cells[cid.idx()].tasks.grav_up = Some(up);
        // The downward recursion hook stays empty until the gravity scheme
        // calls for it.
        space.cells[cid.idx()].tasks.grav_down = None;
        let progeny = space.cells[cid.idx()].progeny;
        for child in progeny.iter().flatten() {
            push_down(space, *child, up);
        }
    }

    for cid in 0..space.nr_top_cells {
        if space.cells[cid].node_id == node_id && space.cells[cid].gparts.count > 0 {
            let up = sched.addtask(Task::new(
                TaskType::GravUp,
                TaskSubtype::None,
                0,
                Some(CellId(cid as u32)),
                None,
                false,
            ));
            push_down(space, CellId(cid as u32), up);
        }
    }
}

fn grav_deps(
    sched: &Scheduler,
    space: &Space,
    grav: TaskId,
    cell: CellId,
    with_up: bool,
    node_id: usize,
) -> Result<()> {
    let sup = need(space.cells[cell.idx()].super_, node_id, "super for gravity deps")?;
    let st = &space.cells[sup.idx()].tasks;
    sched.addunlock(need(st.init, node_id, "init for gravity")?, grav);
    sched.addunlock(grav, need(st.kick2, node_id, "kick2 for gravity")?);
    if with_up {
        if let Some(up) = st.grav_up {
            sched.addunlock(up, grav);
        }
    }
    Ok(())
}

/// The long-range chain (`grav_up -> gather -> fft -> grav_mm`) and the
/// init/kick fencing of every gravity interaction.
fn link_gravity_tasks(
    sched: &Scheduler,
    space: &Space,
    policy: &GraphPolicy,
    node_id: usize,
) -> Result<()> {
    let (gather, fft) = if policy.self_gravity {
        let gather = sched.addtask(Task::new(
            TaskType::GravGatherM,
            TaskSubtype::None,
            0,
            None,
            None,
            false,
        ));
        let fft = sched.addtask(Task::new(
            TaskType::GravFft,
            TaskSubtype::None,
            0,
            None,
            None,
            false,
        ));
        sched.addunlock(gather, fft);
        (Some(gather), Some(fft))
    } else {
        (None, None)
    };

    let metas: Vec<(TaskType, TaskSubtype, Option<CellId>, Option<CellId>, TaskId)> = {
        let tasks = sched.tasks.read().unwrap();
        tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.ttype, t.subtype, t.ci, t.cj, TaskId(i as u32)))
            .collect()
    };

    for (ttype, subtype, ci, cj, tid) in metas {
        match (ttype, subtype) {
            (TaskType::GravUp, _) => {
                if let Some(gather) = gather {
                    sched.addunlock(tid, gather);
                }
            }
            (TaskType::GravMm, _) => {
                let ci = ci.unwrap_or(CellId(0));
                if let Some(fft) = fft {
                    sched.addunlock(fft, tid);
                }
                let sup = need(space.cells[ci.idx()].super_, node_id, "super for grav_mm")?;
                let st = &space.cells[sup.idx()].tasks;
                sched.addunlock(need(st.init, node_id, "init for grav_mm")?, tid);
                sched.addunlock(tid, need(st.kick2, node_id, "kick2 for grav_mm")?);
            }
            (TaskType::SelfTask, TaskSubtype::Grav) => {
                grav_deps(sched, space, tid, ci.unwrap_or(CellId(0)), true, node_id)?;
            }
            (TaskType::SelfTask, TaskSubtype::ExternalGrav) => {
                grav_deps(sched, space, tid, ci.unwrap_or(CellId(0)), false, node_id)?;
            }
            (TaskType::Pair, TaskSubtype::Grav) | (TaskType::SubPair, TaskSubtype::Grav) => {
                let ci = ci.unwrap_or(CellId(0));
                let cj = cj.unwrap_or(CellId(0));
                if space.cells[ci.idx()].node_id == node_id {
                    grav_deps(sched, space, tid, ci, true, node_id)?;
                }
                if space.cells[cj.idx()].node_id == node_id
                    && space.cells[ci.idx()].super_ != space.cells[cj.idx()].super_
                {
                    grav_deps(sched, space, tid, cj, true, node_id)?;
                }
            }
            (TaskType::SubSelf, TaskSubtype::Grav) => {
                if space.cells[ci.unwrap_or(CellId(0)).idx()].node_id == node_id {
                    grav_deps(sched, space, tid, ci.unwrap_or(CellId(0)), true, node_id)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Communication tasks
// ---------------------------------------------------------------------

/// Walk a local subtree adding the send tuple wherever density pairs talk
/// to `peer`; one tuple is created at the highest such cell and shared
/// below.
fn add_send_tasks(
    sched: &Scheduler,
    space: &mut Space,
    cid: CellId,
    peer: usize,
    inherited: Option<(TaskId, TaskId, TaskId)>,
    node_id: usize,
) -> Result<()> {
    let involved = {
        let tasks = sched.tasks.read().unwrap();
        space.cells[cid.idx()].links.density.iter().any(|l| {
            let t = &tasks[l.idx()];
            t.ci
                .map(|c| space.cells[c.idx()].node_id == peer)
                .unwrap_or(false)
                || t.cj
                    .map(|c| space.cells[c.idx()].node_id == peer)
                    .unwrap_or(false)
        })
    };

    let mut tuple = inherited;
    if involved {
        if tuple.is_none() {
            let cell_tag = space.cells[cid.idx()].tag;
            // A representative foreign cell resolves the destination rank.
            let peer_cell = space
                .cells
                .iter()
                .position(|c| c.is_foreign && c.node_id == peer)
                .map(|i| CellId(i as u32))
                .ok_or(EngineError::InvariantViolation {
                    node: node_id,
                    location: "graph::add_send_tasks",
                    detail: format!("no foreign cell for peer {}", peer),
                })?;

            let sup = need(space.cells[cid.idx()].super_, node_id, "super for sends")?;
            let st = space.cells[sup.idx()].tasks.clone();
            let drift = need(st.drift, node_id, "drift for send_xv")?;
            let ghost = need(st.ghost, node_id, "ghost for send_rho")?;
            let kick2 = need(st.kick2, node_id, "kick2 for send_rho")?;
            let timestep = need(st.timestep, node_id, "timestep for send_ti")?;

            let t_xv = sched.addtask(Task::new(
                TaskType::Send,
                TaskSubtype::Xv,
                proxy::wire_tag(cell_tag, proxy::TAG_XV) as u32,
                Some(cid),
                Some(peer_cell),
                false,
            ));
            let t_rho = sched.addtask(Task::new(
                TaskType::Send,
                TaskSubtype::Rho,
                proxy::wire_tag(cell_tag, proxy::TAG_RHO) as u32,
                Some(cid),
                Some(peer_cell),
                false,
            ));
            let t_ti = sched.addtask(Task::new(
                TaskType::Send,
                TaskSubtype::Tend,
                proxy::wire_tag(cell_tag, proxy::TAG_TEND) as u32,
                Some(cid),
                Some(peer_cell),
                false,
            ));

            // Drift before positions leave; the density payload follows the
            // ghost and fences the kick; time-step ends go last.
            sched.addunlock(drift, t_xv);
            sched.addunlock(t_xv, ghost);
            sched.addunlock(ghost, t_rho);
            sched.addunlock(t_rho, kick2);
            sched.addunlock(timestep, t_ti);

            tuple = Some((t_xv, t_rho, t_ti));
        }
        if let Some((t_xv, t_rho, t_ti)) = tuple {
            let links = &mut space.cells[cid.idx()].links;
            links.send_xv.push((peer, t_xv));
            links.send_rho.push((peer, t_rho));
            links.send_ti.push((peer, t_ti));
        }
    }

    let progeny = space.cells[cid.idx()].progeny;
    for child in progeny.iter().flatten() {
        add_send_tasks(sched, space, *child, peer, tuple, node_id)?;
    }
    Ok(())
}

/// Walk a foreign subtree adding the receive tuple and fencing it against
/// the local tasks that read or follow the foreign data.
fn add_recv_tasks(
    sched: &Scheduler,
    space: &mut Space,
    cid: CellId,
    inherited: Option<(TaskId, TaskId, TaskId)>,
) -> Result<()> {
    let has_links = !space.cells[cid.idx()].links.density.is_empty();

    let mut tuple = inherited;
    if tuple.is_none() && has_links {
        let cell_tag = space.cells[cid.idx()].tag;
        let t_xv = sched.addtask(Task::new(
            TaskType::Recv,
            TaskSubtype::Xv,
            proxy::wire_tag(cell_tag, proxy::TAG_XV) as u32,
            Some(cid),
            None,
            false,
        ));
        let t_rho = sched.addtask(Task::new(
            TaskType::Recv,
            TaskSubtype::Rho,
            proxy::wire_tag(cell_tag, proxy::TAG_RHO) as u32,
            Some(cid),
            None,
            false,
        ));
        let t_ti = sched.addtask(Task::new(
            TaskType::Recv,
            TaskSubtype::Tend,
            proxy::wire_tag(cell_tag, proxy::TAG_TEND) as u32,
            Some(cid),
            None,
            false,
        ));
        tuple = Some((t_xv, t_rho, t_ti));
    }

    if let Some((t_xv, t_rho, t_ti)) = tuple {
        {
            let c = &mut space.cells[cid.idx()];
            c.tasks.recv_xv = Some(t_xv);
            c.tasks.recv_rho = Some(t_rho);
            c.tasks.recv_ti = Some(t_ti);
        }
        let density = space.cells[cid.idx()].links.density.clone();
        for l in density {
            sched.addunlock(t_xv, l);
            sched.addunlock(l, t_rho);
        }
        let force = space.cells[cid.idx()].links.force.clone();
        for l in force {
            sched.addunlock(t_rho, l);
            sched.addunlock(l, t_ti);
        }
        if let Some(sorts) = space.cells[cid.idx()].tasks.sorts {
            sched.addunlock(t_xv, sorts);
        }
    }

    let progeny = space.cells[cid.idx()].progeny;
    for child in progeny.iter().flatten() {
        add_recv_tasks(sched, space, *child, tuple)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpaceParams;
    use kernel::Part;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn hydro_policy() -> GraphPolicy {
        GraphPolicy {
            hydro: true,
            ..Default::default()
        }
    }

    fn built(n: usize, h: f32, split_size: usize) -> (Space, Scheduler) {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let parts: Vec<Part> = (0..n)
            .map(|i| {
                Part::new(
                    [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()],
                    h,
                    1.0,
                    i as u64,
                )
            })
            .collect();
        let mut params = SpaceParams::default();
        params.split_size = split_size;
        let mut space = Space::new([1.0; 3], false, params);
        space.set_particles(parts, Vec::new(), Vec::new());
        space.rebuild(0, 0).unwrap();
        let sched = Scheduler::new(2, 0);
        make_tasks(&sched, &mut space, &hydro_policy(), 0, &[]).unwrap();
        (space, sched)
    }

    #[test]
    fn every_density_task_has_a_force_twin() {
        let (_, sched) = built(800, 0.06, 64);
        let tasks = sched.tasks.read().unwrap();
        let density = tasks
            .iter()
            .filter(|t| t.subtype == TaskSubtype::Density)
            .count();
        let force = tasks
            .iter()
            .filter(|t| t.subtype == TaskSubtype::Force)
            .count();
        assert!(density > 0);
        assert_eq!(density, force);
    }

    #[test]
    fn hierarchical_tasks_live_at_supers() {
        let (space, _) = built(800, 0.06, 64);
        for (i, c) in space.cells.iter().enumerate() {
            if c.super_ == Some(CellId(i as u32)) {
                assert!(c.tasks.init.is_some());
                assert!(c.tasks.kick1.is_some());
                assert!(c.tasks.kick2.is_some());
                assert!(c.tasks.timestep.is_some());
                assert!(c.tasks.drift.is_some());
                assert!(c.tasks.ghost.is_some());
                // The reserved downward recursion hook stays empty.
                assert!(c.tasks.grav_down.is_none());
            }
        }
    }

    #[test]
    fn pair_tasks_have_axis_flags_and_sorts() {
        let (space, sched) = built(2000, 0.05, 48);
        let tasks = sched.tasks.read().unwrap();
        let mut saw_pair = false;
        for t in tasks.iter() {
            if t.ttype == TaskType::Pair && t.subtype == TaskSubtype::Density {
                saw_pair = true;
                assert!(t.flags() < 13);
                let ci = t.ci.unwrap();
                let cj = t.cj.unwrap();
                assert!(space.cells[ci.idx()].tasks.sorts.is_some());
                assert!(space.cells[cj.idx()].tasks.sorts.is_some());
            }
        }
        assert!(saw_pair);
    }

    #[test]
    fn graph_is_acyclic_and_ranked() {
        let (_, sched) = built(1200, 0.05, 64);
        let tasks = sched.tasks.read().unwrap();
        // The chain upstream always ranks lower than what it unlocks.
        for t in tasks.iter() {
            for u in &t.unlocks {
                assert!(t.rank < tasks[u.idx()].rank);
            }
        }
    }

    #[test]
    fn force_waits_for_ghost_which_waits_for_density() {
        let (space, sched) = built(500, 0.07, 64);
        let tasks = sched.tasks.read().unwrap();
        for (i, c) in space.cells.iter().enumerate() {
            if c.super_ != Some(CellId(i as u32)) {
                continue;
            }
            let ghost = c.tasks.ghost.unwrap();
            // Each density task on this super's cells unlocks the ghost.
            for l in &c.links.density {
                assert!(
                    tasks[l.idx()].unlocks.contains(&ghost),
                    "density task must unlock its ghost"
                );
            }
            // The ghost unlocks each force task.
            for l in &c.links.force {
                assert!(
                    tasks[ghost.idx()].unlocks.contains(l),
                    "ghost must unlock the force tasks"
                );
            }
        }
    }

    /// Interaction coverage: collecting every leaf-pair touched by the
    /// graph's self/pair/sub tasks covers each close leaf couple exactly
    /// once.
    #[test]
    fn leaf_interactions_covered_exactly_once() {
        // Large counts over a coarse grid so the pair splitter actually
        // recurses into children.
        let (space, sched) = built(8000, 0.12, 24);
        assert!(
            space.cells.len() > space.nr_top_cells,
            "the tree must have split for this test to bite"
        );

        use std::collections::HashMap;
        let mut cover: HashMap<(u32, u32), usize> = HashMap::new();

        fn leaves(space: &Space, c: CellId, out: &mut Vec<CellId>) {
            if space.cells[c.idx()].split {
                for ch in space.cells[c.idx()].progeny.iter().flatten() {
                    leaves(space, *ch, out);
                }
            } else if space.cells[c.idx()].parts.count > 0 {
                out.push(c);
            }
        }

        let tasks = sched.tasks.read().unwrap();
        for t in tasks.iter() {
            if t.subtype != TaskSubtype::Density {
                continue;
            }
            match t.ttype {
                TaskType::SelfTask | TaskType::SubSelf => {
                    let mut ls = Vec::new();
                    leaves(&space, t.ci.unwrap(), &mut ls);
                    for (n, &a) in ls.iter().enumerate() {
                        *cover.entry((a.0, a.0)).or_default() += 1;
                        for &b in &ls[n + 1..] {
                            let key = (a.0.min(b.0), a.0.max(b.0));
                            *cover.entry(key).or_default() += 1;
                        }
                    }
                }
                TaskType::Pair | TaskType::SubPair => {
                    let mut la = Vec::new();
                    let mut lb = Vec::new();
                    leaves(&space, t.ci.unwrap(), &mut la);
                    leaves(&space, t.cj.unwrap(), &mut lb);
                    for &a in &la {
                        for &b in &lb {
                            let key = (a.0.min(b.0), a.0.max(b.0));
                            *cover.entry(key).or_default() += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        for (&(a, b), &count) in &cover {
            assert_eq!(
                count, 1,
                "leaf couple ({}, {}) covered {} times",
                a, b, count
            );
        }
    }
}
