//! Octree cell records.
//!
//! Cells live in a typed arena owned by the [`Space`](crate::space::Space);
//! children, parents and super cells are referenced by [`CellId`] indices.
//! A cell does not own particles: it holds index ranges into the space-owned
//! arrays, one per particle kind.
//!
//! Fields fall into three groups with different mutation rules:
//! - structure (geometry, ranges, progeny, task handles, link lists): written
//!   only while the engine holds exclusive access, between launches;
//! - step-mutable marks (`ti_*`, `dx_max_*`, `sorted`, `updated` counters):
//!   atomics, written by at most one task at a time by graph construction;
//! - the sort cache and the pair critical section: per-cell mutexes.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use kernel::IntegerTime;

/// Index of a cell in the space arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub u32);

impl CellId {
    /// The arena index as `usize`.
    #[inline]
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Index of a task in the scheduler's task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u32);

impl TaskId {
    /// The list index as `usize`.
    #[inline]
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A contiguous index range into one of the particle arrays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slice {
    /// First index.
    pub first: usize,
    /// Number of particles.
    pub count: usize,
}

impl Slice {
    /// The `first..first+count` range.
    #[inline]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.first..self.first + self.count
    }

    /// True when the slice is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// An `f32` with atomic store/load and a max-update, kept as raw bits.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    /// A new atomic holding `v`.
    pub fn new(v: f32) -> Self {
        AtomicF32(AtomicU32::new(v.to_bits()))
    }

    /// Current value.
    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Overwrite.
    #[inline]
    pub fn store(&self, v: f32) {
        self.0.store(v.to_bits(), Ordering::Relaxed)
    }

    /// Monotonic max-update.
    pub fn fetch_max(&self, v: f32) {
        let mut cur = self.load();
        while v > cur {
            match self.0.compare_exchange_weak(
                cur.to_bits(),
                v.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(bits) => cur = f32::from_bits(bits),
            }
        }
    }
}

/// One entry of a per-axis sort: a particle index and its projection.
#[derive(Debug, Clone, Copy)]
pub struct SortEntry {
    /// Absolute index into the space part array.
    pub index: u32,
    /// Projection onto the axis.
    pub dist: f32,
}

/// Per-axis sorted permutations; filled lazily per the 13-bit `sorted` mask.
#[derive(Debug, Default)]
pub struct SortCache {
    /// One list per canonical axis, empty until sorted.
    pub axes: [Vec<SortEntry>; 13],
}

/// Handles of the hierarchical per-cell tasks, set at graph construction.
#[derive(Debug, Clone, Default)]
pub struct CellTasks {
    /// Position drift.
    pub drift: Option<TaskId>,
    /// Axis sorts (flags carry the axis bits).
    pub sorts: Option<TaskId>,
    /// Accumulator reset.
    pub init: Option<TaskId>,
    /// Density-loop closure.
    pub ghost: Option<TaskId>,
    /// Second closure for two-loop schemes.
    pub extra_ghost: Option<TaskId>,
    /// First half-kick.
    pub kick1: Option<TaskId>,
    /// Second half-kick.
    pub kick2: Option<TaskId>,
    /// Time-step recomputation.
    pub timestep: Option<TaskId>,
    /// Cooling.
    pub cooling: Option<TaskId>,
    /// Source terms.
    pub sourceterms: Option<TaskId>,
    /// Multipole construction sweep.
    pub grav_up: Option<TaskId>,
    /// Reserved: a downward gravity recursion has a slot here but no task is
    /// ever created for it.
    pub grav_down: Option<TaskId>,
    /// Receive of positions/velocities from the owning node.
    pub recv_xv: Option<TaskId>,
    /// Receive of densities.
    pub recv_rho: Option<TaskId>,
    /// Receive of gradient data (two-loop schemes).
    pub recv_gradient: Option<TaskId>,
    /// Receive of time-step ends.
    pub recv_ti: Option<TaskId>,
}

/// Link lists tying a cell to the interaction tasks that touch it, and to
/// its per-peer send tasks. Grown at graph construction, read-only during
/// execution.
#[derive(Debug, Clone, Default)]
pub struct CellLinks {
    /// Density-loop tasks.
    pub density: Vec<TaskId>,
    /// Gradient-loop tasks (two-loop schemes).
    pub gradient: Vec<TaskId>,
    /// Force-loop tasks.
    pub force: Vec<TaskId>,
    /// Gravity tasks.
    pub grav: Vec<TaskId>,
    /// Per-peer `send_xv` tasks as `(peer, task)`.
    pub send_xv: Vec<(usize, TaskId)>,
    /// Per-peer `send_rho` tasks.
    pub send_rho: Vec<(usize, TaskId)>,
    /// Per-peer `send_gradient` tasks.
    pub send_gradient: Vec<(usize, TaskId)>,
    /// Per-peer `send_ti` tasks.
    pub send_ti: Vec<(usize, TaskId)>,
}

/// An octree node.
#[derive(Debug)]
pub struct Cell {
    /// Lower corner.
    pub loc: [f64; 3],
    /// Edge lengths.
    pub width: [f64; 3],
    /// Depth below the top grid (top cells are 0).
    pub depth: u8,
    /// True for interior nodes.
    pub split: bool,
    /// The eight children.
    pub progeny: [Option<CellId>; 8],
    /// Parent cell.
    pub parent: Option<CellId>,
    /// Nearest ancestor owning the hierarchical per-particle tasks.
    pub super_: Option<CellId>,
    /// Owning node.
    pub node_id: usize,
    /// True for shadow copies of cells owned by another node; their particle
    /// ranges index the foreign arrays.
    pub is_foreign: bool,
    /// Stable identifier naming messages between proxies.
    pub tag: i32,
    /// Gas particles.
    pub parts: Slice,
    /// Gravity particles.
    pub gparts: Slice,
    /// Star particles.
    pub sparts: Slice,
    /// Worst-case smoothing length in the cell.
    pub h_max: f32,
    /// Minimum edge length, the pair-distance yardstick.
    pub dmin: f64,
    /// Number of interaction tasks attached (used for `super_` placement).
    pub nr_tasks: u32,

    /// Earliest step end over the cell's particles.
    pub ti_end_min: AtomicI64,
    /// Latest step end over the cell's particles.
    pub ti_end_max: AtomicI64,
    /// Time the particles were last drifted to.
    pub ti_old_part: AtomicI64,
    /// Time the sort entries were built at.
    pub ti_sort: AtomicI64,
    /// Worst particle displacement since the last rebuild.
    pub dx_max_part: AtomicF32,
    /// Worst particle displacement since the last sort.
    pub dx_max_sort: AtomicF32,
    /// 13-bit mask of valid sort axes.
    pub sorted: AtomicU32,
    /// Gas particles updated by the last `timestep` task.
    pub updated: AtomicI64,
    /// Gravity particles updated.
    pub g_updated: AtomicI64,
    /// Star particles updated.
    pub s_updated: AtomicI64,

    /// Per-axis sort entries.
    pub sort: Mutex<SortCache>,
    /// Held for the duration of one task's access to this cell.
    pub hold: Mutex<()>,
    /// Monopole of the cell's gravity particles, built by the `grav_up`
    /// sweep.
    pub multipole: Mutex<kernel::gravity::Multipole>,

    /// Hierarchical task handles.
    pub tasks: CellTasks,
    /// Interaction links.
    pub links: CellLinks,
}

impl Cell {
    /// A fresh cell covering `loc + [0, width)` on `node_id`.
    pub fn new(loc: [f64; 3], width: [f64; 3], depth: u8, node_id: usize) -> Self {
        let dmin = width[0].min(width[1]).min(width[2]);
        Cell {
            loc,
            width,
            depth,
            split: false,
            progeny: [None; 8],
            parent: None,
            super_: None,
            node_id,
            is_foreign: false,
            tag: -1,
            parts: Slice::default(),
            gparts: Slice::default(),
            sparts: Slice::default(),
            h_max: 0.0,
            dmin,
            nr_tasks: 0,
            ti_end_min: AtomicI64::new(0),
            ti_end_max: AtomicI64::new(0),
            ti_old_part: AtomicI64::new(0),
            ti_sort: AtomicI64::new(0),
            dx_max_part: AtomicF32::new(0.0),
            dx_max_sort: AtomicF32::new(0.0),
            sorted: AtomicU32::new(0),
            updated: AtomicI64::new(0),
            g_updated: AtomicI64::new(0),
            s_updated: AtomicI64::new(0),
            sort: Mutex::new(SortCache::default()),
            hold: Mutex::new(()),
            multipole: Mutex::new(kernel::gravity::Multipole::default()),
            tasks: CellTasks::default(),
            links: CellLinks::default(),
        }
    }

    /// A cell is active when its earliest step end has been reached.
    #[inline]
    pub fn is_active(&self, ti_current: IntegerTime) -> bool {
        self.ti_end_min.load(Ordering::Relaxed) <= ti_current
    }

    /// Total particles of any kind.
    #[inline]
    pub fn total_count(&self) -> usize {
        self.parts.count + self.gparts.count + self.sparts.count
    }

    /// True when the cell holds nothing.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }
}

/// Flat index of a top cell at grid coordinates `(i, j, k)`.
#[inline]
pub fn cell_getid(cdim: [i32; 3], i: i32, j: i32, k: i32) -> usize {
    (i * cdim[1] * cdim[2] + j * cdim[2] + k) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_getid_is_row_major() {
        let cdim = [4, 3, 2];
        assert_eq!(cell_getid(cdim, 0, 0, 0), 0);
        assert_eq!(cell_getid(cdim, 0, 0, 1), 1);
        assert_eq!(cell_getid(cdim, 0, 1, 0), 2);
        assert_eq!(cell_getid(cdim, 1, 0, 0), 6);
        assert_eq!(cell_getid(cdim, 3, 2, 1), 23);
    }

    #[test]
    fn activity_predicate() {
        let c = Cell::new([0.0; 3], [1.0; 3], 0, 0);
        c.ti_end_min.store(8, Ordering::Relaxed);
        assert!(!c.is_active(7));
        assert!(c.is_active(8));
        assert!(c.is_active(9));
    }

    #[test]
    fn atomic_f32_fetch_max() {
        let a = AtomicF32::new(1.0);
        a.fetch_max(0.5);
        assert_eq!(a.load(), 1.0);
        a.fetch_max(2.5);
        assert_eq!(a.load(), 2.5);
    }

    #[test]
    fn slice_range() {
        let s = Slice { first: 3, count: 4 };
        assert_eq!(s.range(), 3..7);
        assert!(!s.is_empty());
        assert!(Slice::default().is_empty());
    }
}
