//! Task records.
//!
//! A task is pure data: what to do (`TaskType` x `TaskSubtype`), on which
//! cell(s), plus the scheduling state (skip flag, unmet-dependency counter,
//! weight, rank, unlock list). Dispatch lives in the runner; the record
//! never stores code.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use crate::cell::{CellId, TaskId};

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Interactions within one cell.
    SelfTask,
    /// Interactions between two cells.
    Pair,
    /// A self task that recurses into the cell's children.
    SubSelf,
    /// A pair task that recurses into both cells' children.
    SubPair,
    /// Axis sorts of one cell.
    Sort,
    /// Position drift of one cell's subtree.
    Drift,
    /// Accumulator reset.
    Init,
    /// Closure between the density and force loops.
    Ghost,
    /// Second closure for two-loop hydro schemes.
    ExtraGhost,
    /// First half-kick.
    Kick1,
    /// Second half-kick.
    Kick2,
    /// New time-step sizes.
    Timestep,
    /// Cooling update.
    Cooling,
    /// Source-term update.
    SourceTerms,
    /// Asynchronous send to a peer node.
    Send,
    /// Asynchronous receive from a peer node.
    Recv,
    /// Multipole construction sweep over one top-level tree.
    GravUp,
    /// Long-range multipole interaction of one cell.
    GravMm,
    /// Gather of all multipoles (no cell).
    GravGatherM,
    /// Long-range mesh transform (no cell).
    GravFft,
}

/// What a self/pair/communication task operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskSubtype {
    /// No payload distinction.
    None,
    /// SPH density loop.
    Density,
    /// SPH gradient loop (two-loop schemes).
    Gradient,
    /// SPH force loop.
    Force,
    /// Self-gravity.
    Grav,
    /// External gravity.
    ExternalGrav,
    /// Positions and velocities payload.
    Xv,
    /// Density payload.
    Rho,
    /// Gradient payload (two-loop schemes).
    GradientMsg,
    /// Time-step-end payload.
    Tend,
}

/// One node of the dependency graph.
#[derive(Debug)]
pub struct Task {
    /// What to do.
    pub ttype: TaskType,
    /// On what data.
    pub subtype: TaskSubtype,
    /// First cell.
    pub ci: Option<CellId>,
    /// Second cell (pairs and communications).
    pub cj: Option<CellId>,
    /// Axis id for pairs, axis bits for sorts, message tag for send/recv.
    pub flags: AtomicU32,
    /// Whether the pair relies on tight sorting (rebuild trigger checks).
    pub tight: bool,
    /// Skipped tasks are invisible to the scheduler this step.
    pub skip: AtomicBool,
    /// Unmet-dependency counter, live while the graph drains.
    pub wait: AtomicI32,
    /// Topological rank.
    pub rank: u32,
    /// Own cost estimate.
    pub cost: i64,
    /// Own cost plus the heaviest downstream chain; queue priority.
    pub weight: i64,
    /// Tasks whose `wait` this task decrements on completion.
    pub unlocks: Vec<TaskId>,
}

impl Task {
    /// A fresh, skipped task with no dependencies.
    pub fn new(
        ttype: TaskType,
        subtype: TaskSubtype,
        flags: u32,
        ci: Option<CellId>,
        cj: Option<CellId>,
        tight: bool,
    ) -> Self {
        Task {
            ttype,
            subtype,
            ci,
            cj,
            flags: AtomicU32::new(flags),
            tight,
            skip: AtomicBool::new(true),
            wait: AtomicI32::new(0),
            rank: 0,
            cost: 0,
            weight: 0,
            unlocks: Vec::new(),
        }
    }

    /// Is the task switched off this step?
    #[inline]
    pub fn is_skipped(&self) -> bool {
        self.skip.load(Ordering::Relaxed)
    }

    /// Switch the task on for this step.
    #[inline]
    pub fn activate(&self) {
        self.skip.store(false, Ordering::Relaxed);
    }

    /// Current flags value.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    /// True for the per-particle hierarchical types that live on super
    /// cells.
    pub fn is_hierarchical(&self) -> bool {
        matches!(
            self.ttype,
            TaskType::Drift
                | TaskType::Init
                | TaskType::Ghost
                | TaskType::ExtraGhost
                | TaskType::Kick1
                | TaskType::Kick2
                | TaskType::Timestep
                | TaskType::Cooling
                | TaskType::SourceTerms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_skipped() {
        let t = Task::new(TaskType::SelfTask, TaskSubtype::Density, 0, Some(CellId(0)), None, false);
        assert!(t.is_skipped());
        t.activate();
        assert!(!t.is_skipped());
    }

    #[test]
    fn hierarchical_classification() {
        let drift = Task::new(TaskType::Drift, TaskSubtype::None, 0, Some(CellId(0)), None, false);
        assert!(drift.is_hierarchical());
        let pair = Task::new(TaskType::Pair, TaskSubtype::Density, 4, Some(CellId(0)), Some(CellId(1)), true);
        assert!(!pair.is_hierarchical());
    }
}
