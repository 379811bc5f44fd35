//! Activation correctness: with a handful of active cells, the unskip pass
//! must switch on exactly the self tasks of those cells and the pair tasks
//! touching them, leave all other interactions skipped, and be idempotent.

use std::sync::atomic::Ordering;

use engine::cell::CellId;
use engine::config::SpaceParams;
use engine::graph::{self, GraphPolicy};
use engine::scheduler::Scheduler;
use engine::space::Space;
use engine::task::{TaskSubtype, TaskType};
use engine::threadpool::ThreadPool;
use engine::unskip_pass;
use kernel::Part;

const TI_NOW: i64 = 1 << 10;
const TI_FUTURE: i64 = 1 << 20;

/// A 10x10x10 top grid, a couple of particles per cell, no octree depth.
fn thousand_cell_space() -> Space {
    let n = 20usize;
    let spacing = 1.0 / n as f64;
    let parts: Vec<Part> = (0..n * n * n)
        .map(|i| {
            let x = (i / (n * n)) as f64;
            let y = ((i / n) % n) as f64;
            let z = (i % n) as f64;
            Part::new(
                [
                    (x + 0.5) * spacing,
                    (y + 0.5) * spacing,
                    (z + 0.5) * spacing,
                ],
                0.04,
                1.0,
                i as u64,
            )
        })
        .collect();

    let mut params = SpaceParams::default();
    params.cell_min = 0.1;
    params.split_size = usize::MAX;
    let mut space = Space::new([1.0; 3], false, params);
    space.set_particles(parts, Vec::new(), Vec::new());
    space.rebuild(0, 0).unwrap();
    assert_eq!(space.nr_top_cells, 1000);
    space
}

fn set_times(space: &Space, active: &[usize]) {
    for cid in 0..space.nr_top_cells {
        let ti = if active.contains(&cid) { TI_NOW } else { TI_FUTURE };
        space.cells[cid].ti_end_min.store(ti, Ordering::Relaxed);
    }
}

#[test]
fn only_tasks_touching_active_cells_wake_up() {
    let mut space = thousand_cell_space();
    let sched = Scheduler::new(2, 0);
    graph::make_tasks(
        &sched,
        &mut space,
        &GraphPolicy {
            hydro: true,
            ..Default::default()
        },
        0,
        &[],
    )
    .unwrap();

    let active = [13usize, 402, 777];
    set_times(&space, &active);

    let tp = ThreadPool::new(2);
    let tasks = sched.tasks.read().unwrap();
    let rebuild = unskip_pass(&tp, &space, &tasks, TI_NOW, 0);
    assert!(!rebuild, "nothing has moved, no rebuild expected");

    let is_active_cell = |c: Option<CellId>| {
        c.map(|c| active.contains(&c.idx())).unwrap_or(false)
    };

    let mut checked_self = 0;
    let mut checked_pair = 0;
    for t in tasks.iter() {
        match (t.ttype, t.subtype) {
            (TaskType::SelfTask | TaskType::SubSelf, TaskSubtype::Density) => {
                assert_eq!(
                    !t.is_skipped(),
                    is_active_cell(t.ci),
                    "self task on cell {:?}",
                    t.ci
                );
                checked_self += 1;
            }
            (TaskType::Pair | TaskType::SubPair, TaskSubtype::Density) => {
                let expect = is_active_cell(t.ci) || is_active_cell(t.cj);
                assert_eq!(
                    !t.is_skipped(),
                    expect,
                    "pair task {:?}/{:?}",
                    t.ci,
                    t.cj
                );
                checked_pair += 1;
            }
            _ => {}
        }
    }
    assert!(checked_self >= 1000);
    assert!(checked_pair > 1000);

    // Every active pair got its axis flagged on both cells' sort tasks.
    for t in tasks.iter() {
        if t.ttype == TaskType::Pair
            && t.subtype == TaskSubtype::Density
            && !t.is_skipped()
        {
            let bit = 1u32 << t.flags();
            for cell in [t.ci.unwrap(), t.cj.unwrap()] {
                let sorts = space.cells[cell.idx()].tasks.sorts.unwrap();
                assert!(!tasks[sorts.idx()].is_skipped());
                assert_ne!(tasks[sorts.idx()].flags() & bit, 0);
            }
        }
    }
}

/// Property: running the unskip pass twice without any state change yields
/// the identical set of active tasks.
#[test]
fn unskip_is_idempotent() {
    let mut space = thousand_cell_space();
    let sched = Scheduler::new(2, 0);
    graph::make_tasks(
        &sched,
        &mut space,
        &GraphPolicy {
            hydro: true,
            ..Default::default()
        },
        0,
        &[],
    )
    .unwrap();

    set_times(&space, &[5, 250, 999]);

    let tp = ThreadPool::new(2);
    let tasks = sched.tasks.read().unwrap();
    unskip_pass(&tp, &space, &tasks, TI_NOW, 0);
    let first: Vec<bool> = tasks.iter().map(|t| t.is_skipped()).collect();
    let first_flags: Vec<u32> = tasks.iter().map(|t| t.flags()).collect();

    unskip_pass(&tp, &space, &tasks, TI_NOW, 0);
    let second: Vec<bool> = tasks.iter().map(|t| t.is_skipped()).collect();
    let second_flags: Vec<u32> = tasks.iter().map(|t| t.flags()).collect();

    assert_eq!(first, second);
    assert_eq!(first_flags, second_flags);
}
