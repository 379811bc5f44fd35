//! The spatial domain: top-level grid, octree refinement, particle storage
//! and membership.
//!
//! The `Space` owns the contiguous particle arrays; cells hold index ranges
//! into them. A rebuild recreates the whole cell arena from the current
//! particle positions; between rebuilds cells are only mutated by drift,
//! sort and the per-particle tasks.

use std::cell::UnsafeCell;
use std::sync::atomic::Ordering;

use kernel::part::PartnerRef;
use kernel::{GPart, IntegerTime, Part, SPart, XPart};

use crate::cell::{cell_getid, Cell, CellId, Slice};
use crate::config::SpaceParams;
use crate::error::{EngineError, Result};

/// Particle storage shared with the worker threads.
///
/// Workers obtain disjoint mutable slices through the unsafe accessors; the
/// task graph guarantees that no two concurrently runnable tasks touch
/// overlapping ranges, and the engine only takes `&mut` access while the
/// workers are parked.
#[derive(Debug)]
pub struct Storage<T>(UnsafeCell<Vec<T>>);

// Shared access is mediated by the task graph; see the struct docs.
unsafe impl<T: Send + Sync> Sync for Storage<T> {}

impl<T> Storage<T> {
    fn new(v: Vec<T>) -> Self {
        Storage(UnsafeCell::new(v))
    }

    /// Exclusive access; the safe path for everything outside task execution.
    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(&mut self) -> &mut Vec<T> {
        self.0.get_mut()
    }

    /// Number of elements. Only meaningful while no reallocation is running.
    pub fn len(&self) -> usize {
        unsafe { (*self.0.get()).len() }
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A shared slice of `range`.
    ///
    /// # Safety
    /// No concurrent task may mutate any element of `range`.
    pub unsafe fn slice(&self, range: std::ops::Range<usize>) -> &[T] {
        let v = self.0.get();
        debug_assert!(range.end <= (*v).len());
        std::slice::from_raw_parts((*v).as_ptr().add(range.start), range.len())
    }

    /// A mutable slice of `range`.
    ///
    /// # Safety
    /// The caller must be the only task accessing `range`; the task graph
    /// (or a held cell lock) must guarantee it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, range: std::ops::Range<usize>) -> &mut [T] {
        let v = self.0.get();
        debug_assert!(range.end <= (*v).len());
        std::slice::from_raw_parts_mut((*v).as_mut_ptr().add(range.start), range.len())
    }
}

/// Gas, gravity and star particles straying off this node, grouped with
/// their destinations. Produced by [`Space::collect_strays`].
#[derive(Debug, Default)]
pub struct StrayBatch {
    /// Stray gas particles with their extended state and destination node.
    pub parts: Vec<(Part, XPart, usize)>,
    /// Stray gravity records with destination node. Gas/star partners are
    /// batch-local indices into `parts`/`sparts`.
    pub gparts: Vec<(GPart, usize)>,
    /// Stray star particles with destination node.
    pub sparts: Vec<(SPart, usize)>,
}

impl StrayBatch {
    /// Total particles in the batch.
    pub fn len(&self) -> usize {
        self.parts.len() + self.gparts.len() + self.sparts.len()
    }

    /// True when nothing strayed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The spatial domain and everything it owns.
pub struct Space {
    /// Box dimensions.
    pub dim: [f64; 3],
    /// Periodic boundary conditions.
    pub periodic: bool,
    /// Tree and sorting parameters.
    pub params: SpaceParams,

    /// Top-grid dimensions.
    pub cdim: [i32; 3],
    /// Top-cell widths.
    pub width: [f64; 3],
    /// Inverse top-cell widths.
    pub iwidth: [f64; 3],

    /// Gas particles.
    pub parts: Storage<Part>,
    /// Extended gas state, parallel to `parts`.
    pub xparts: Storage<XPart>,
    /// Gravity particles.
    pub gparts: Storage<GPart>,
    /// Star particles.
    pub sparts: Storage<SPart>,

    /// Read-only shadow copies of particles in foreign cells.
    pub parts_foreign: Storage<Part>,
    /// Foreign gravity particles.
    pub gparts_foreign: Storage<GPart>,
    /// Foreign star particles.
    pub sparts_foreign: Storage<SPart>,

    /// The cell arena. Top cells occupy `0..nr_top_cells` in grid order.
    pub cells: Vec<Cell>,
    /// Number of top-level cells.
    pub nr_top_cells: usize,
    /// Owner of each top cell; kept across rebuilds, replaced by the
    /// repartitioner.
    pub top_node_map: Vec<usize>,
    /// Number of compute nodes sharing the domain; seeds the ownership map
    /// when the grid is (re)created.
    pub nr_nodes: usize,

    /// Largest smoothing length seen at the last rebuild.
    pub h_max: f32,
    /// Whether the one-shot sanitation pass has run.
    pub sanitized: bool,
    /// Next message tag to hand out.
    next_tag: i32,
}

impl Space {
    /// An empty space over the given box.
    pub fn new(dim: [f64; 3], periodic: bool, params: SpaceParams) -> Self {
        Space {
            dim,
            periodic,
            params,
            cdim: [0; 3],
            width: [0.0; 3],
            iwidth: [0.0; 3],
            parts: Storage::new(Vec::new()),
            xparts: Storage::new(Vec::new()),
            gparts: Storage::new(Vec::new()),
            sparts: Storage::new(Vec::new()),
            parts_foreign: Storage::new(Vec::new()),
            gparts_foreign: Storage::new(Vec::new()),
            sparts_foreign: Storage::new(Vec::new()),
            cells: Vec::new(),
            nr_top_cells: 0,
            top_node_map: Vec::new(),
            nr_nodes: 1,
            h_max: 0.0,
            sanitized: false,
            next_tag: 0,
        }
    }

    /// Install the local particle population. Extended records are created,
    /// and any gas or star particle without a gravity record gets one.
    pub fn set_particles(
        &mut self,
        parts: Vec<Part>,
        gparts: Vec<GPart>,
        sparts: Vec<SPart>,
    ) {
        let n = parts.len();
        *self.parts.get_mut() = parts;
        *self.xparts.get_mut() = vec![XPart::default(); n];
        *self.gparts.get_mut() = gparts;
        *self.sparts.get_mut() = sparts;
        self.link_gravity_records();
    }

    /// Create gravity records for gas and star particles that lack one and
    /// restore the two-way linkage invariant.
    pub fn link_gravity_records(&mut self) {
        let n_parts = self.parts.len();
        for i in 0..n_parts {
            let (x, v, mass, missing) = {
                let p = &self.parts.get_mut()[i];
                (p.x, p.v, p.mass, p.gpart.is_none())
            };
            if missing {
                let g = GPart {
                    x,
                    v_full: v,
                    a_grav: [0.0; 3],
                    mass,
                    time_bin: 0,
                    partner: PartnerRef::Gas(i as u32),
                };
                let j = self.gparts.len() as u32;
                self.gparts.get_mut().push(g);
                self.parts.get_mut()[i].gpart = Some(j);
            }
        }
        let n_sparts = self.sparts.len();
        for i in 0..n_sparts {
            let (x, v, mass, missing) = {
                let s = &self.sparts.get_mut()[i];
                (s.x, s.v, s.mass, s.gpart.is_none())
            };
            if missing {
                let g = GPart {
                    x,
                    v_full: v,
                    a_grav: [0.0; 3],
                    mass,
                    time_bin: 0,
                    partner: PartnerRef::Star(i as u32),
                };
                let j = self.gparts.len() as u32;
                self.gparts.get_mut().push(g);
                self.sparts.get_mut()[i].gpart = Some(j);
            }
        }
    }

    /// Check the gas/star <-> gravity linkage both ways (testable property 2).
    pub fn verify_linkage(&mut self, node: usize) -> Result<()> {
        let n_parts = self.parts.len();
        for i in 0..n_parts {
            if let Some(j) = self.parts.get_mut()[i].gpart {
                let partner = self.gparts.get_mut()[j as usize].partner;
                if partner != PartnerRef::Gas(i as u32) {
                    return Err(EngineError::InvariantViolation {
                        node,
                        location: "space::verify_linkage (gas)",
                        detail: format!("part {} -> gpart {} -> {:?}", i, j, partner),
                    });
                }
            }
        }
        let n_sparts = self.sparts.len();
        for i in 0..n_sparts {
            if let Some(j) = self.sparts.get_mut()[i].gpart {
                let partner = self.gparts.get_mut()[j as usize].partner;
                if partner != PartnerRef::Star(i as u32) {
                    return Err(EngineError::InvariantViolation {
                        node,
                        location: "space::verify_linkage (star)",
                        detail: format!("spart {} -> gpart {} -> {:?}", i, j, partner),
                    });
                }
            }
        }
        let n_gparts = self.gparts.len();
        for j in 0..n_gparts {
            match self.gparts.get_mut()[j].partner {
                PartnerRef::Gas(i) => {
                    if self.parts.get_mut()[i as usize].gpart != Some(j as u32) {
                        return Err(EngineError::InvariantViolation {
                            node,
                            location: "space::verify_linkage (gpart->gas)",
                            detail: format!("gpart {} -> part {}", j, i),
                        });
                    }
                }
                PartnerRef::Star(i) => {
                    if self.sparts.get_mut()[i as usize].gpart != Some(j as u32) {
                        return Err(EngineError::InvariantViolation {
                            node,
                            location: "space::verify_linkage (gpart->star)",
                            detail: format!("gpart {} -> spart {}", j, i),
                        });
                    }
                }
                PartnerRef::DarkMatter(id) => {
                    if id < 0 {
                        return Err(EngineError::InvariantViolation {
                            node,
                            location: "space::verify_linkage (dm id)",
                            detail: format!("gpart {} has negative id {}", j, id),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Geometry helpers
    // -----------------------------------------------------------------

    /// Wrap (periodic) or clamp (open) a position into the box.
    pub fn box_wrap(&self, x: [f64; 3]) -> [f64; 3] {
        let mut out = x;
        for k in 0..3 {
            if self.periodic {
                out[k] -= (out[k] / self.dim[k]).floor() * self.dim[k];
                if out[k] >= self.dim[k] {
                    out[k] = 0.0;
                }
            } else {
                out[k] = out[k].clamp(0.0, self.dim[k] * (1.0 - 1e-12));
            }
        }
        out
    }

    /// Top-cell index of a (wrapped) position.
    pub fn top_cell_of(&self, x: [f64; 3]) -> usize {
        let i = ((x[0] * self.iwidth[0]) as i32).clamp(0, self.cdim[0] - 1);
        let j = ((x[1] * self.iwidth[1]) as i32).clamp(0, self.cdim[1] - 1);
        let k = ((x[2] * self.iwidth[2]) as i32).clamp(0, self.cdim[2] - 1);
        cell_getid(self.cdim, i, j, k)
    }

    /// The shift to add to positions in `cj` so they sit next to `ci`
    /// across a periodic boundary (zero in the open case).
    pub fn periodic_shift(&self, ci: CellId, cj: CellId) -> [f64; 3] {
        let mut shift = [0.0; 3];
        if !self.periodic {
            return shift;
        }
        let li = self.cells[ci.idx()].loc;
        let lj = self.cells[cj.idx()].loc;
        for k in 0..3 {
            let d = lj[k] - li[k];
            if d > 0.5 * self.dim[k] {
                shift[k] = -self.dim[k];
            } else if d < -0.5 * self.dim[k] {
                shift[k] = self.dim[k];
            }
        }
        shift
    }

    /// Do the bounding boxes of two cells come within `reach` of each
    /// other (periodic-aware)?
    pub fn cells_within_reach(&self, ci: CellId, cj: CellId, reach: f64) -> bool {
        let shift = self.periodic_shift(ci, cj);
        let a = &self.cells[ci.idx()];
        let b = &self.cells[cj.idx()];
        let mut d2 = 0.0_f64;
        for k in 0..3 {
            let ca = a.loc[k] + 0.5 * a.width[k];
            let cb = b.loc[k] + shift[k] + 0.5 * b.width[k];
            let gap = (ca - cb).abs() - 0.5 * (a.width[k] + b.width[k]);
            if gap > 0.0 {
                d2 += gap * gap;
            }
        }
        d2 <= reach * reach
    }

    /// Are two cells close enough for direct pair interactions?
    pub fn cells_are_neighbours(&self, ci: CellId, cj: CellId) -> bool {
        let shift = self.periodic_shift(ci, cj);
        let a = &self.cells[ci.idx()];
        let b = &self.cells[cj.idx()];
        for k in 0..3 {
            let ca = a.loc[k] + 0.5 * a.width[k];
            let cb = b.loc[k] + shift[k] + 0.5 * b.width[k];
            let max_gap = 0.5 * (a.width[k] + b.width[k]);
            if (ca - cb).abs() > max_gap * 1.000_001 {
                return false;
            }
        }
        true
    }

    // -----------------------------------------------------------------
    // Per-cell particle views (task-side)
    // -----------------------------------------------------------------

    /// Gas particles of a cell, from the local or foreign array.
    ///
    /// # Safety
    /// No concurrent task may mutate the cell's range; guaranteed by the
    /// task graph for the calling task.
    pub unsafe fn parts_of(&self, cell: &Cell) -> &[Part] {
        if cell.is_foreign {
            self.parts_foreign.slice(cell.parts.range())
        } else {
            self.parts.slice(cell.parts.range())
        }
    }

    /// Mutable gas particles of a local cell.
    ///
    /// # Safety
    /// The calling task must be the only one touching the cell's range.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn parts_of_mut(&self, cell: &Cell) -> &mut [Part] {
        debug_assert!(!cell.is_foreign);
        self.parts.slice_mut(cell.parts.range())
    }

    /// Extended records of a local cell.
    ///
    /// # Safety
    /// Same contract as [`Space::parts_of_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn xparts_of_mut(&self, cell: &Cell) -> &mut [XPart] {
        debug_assert!(!cell.is_foreign);
        self.xparts.slice_mut(cell.parts.range())
    }

    /// Gravity particles of a cell.
    ///
    /// # Safety
    /// Same contract as [`Space::parts_of`].
    pub unsafe fn gparts_of(&self, cell: &Cell) -> &[GPart] {
        if cell.is_foreign {
            self.gparts_foreign.slice(cell.gparts.range())
        } else {
            self.gparts.slice(cell.gparts.range())
        }
    }

    /// Mutable gravity particles of a local cell.
    ///
    /// # Safety
    /// Same contract as [`Space::parts_of_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn gparts_of_mut(&self, cell: &Cell) -> &mut [GPart] {
        debug_assert!(!cell.is_foreign);
        self.gparts.slice_mut(cell.gparts.range())
    }

    /// Star particles of a cell.
    ///
    /// # Safety
    /// Same contract as [`Space::parts_of`].
    pub unsafe fn sparts_of(&self, cell: &Cell) -> &[SPart] {
        if cell.is_foreign {
            self.sparts_foreign.slice(cell.sparts.range())
        } else {
            self.sparts.slice(cell.sparts.range())
        }
    }

    /// Mutable star particles of a local cell.
    ///
    /// # Safety
    /// Same contract as [`Space::parts_of_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn sparts_of_mut(&self, cell: &Cell) -> &mut [SPart] {
        debug_assert!(!cell.is_foreign);
        self.sparts.slice_mut(cell.sparts.range())
    }

    /// Number of local gas particles.
    pub fn nr_parts(&self) -> usize {
        self.parts.len()
    }

    /// Number of local gravity particles.
    pub fn nr_gparts(&self) -> usize {
        self.gparts.len()
    }

    /// Number of local star particles.
    pub fn nr_sparts(&self) -> usize {
        self.sparts.len()
    }

    /// Hand out the next dense message tag.
    pub fn take_tag(&mut self) -> i32 {
        let t = self.next_tag;
        self.next_tag += 1;
        t
    }

    // -----------------------------------------------------------------
    // Permutation plumbing
    // -----------------------------------------------------------------

    /// Reorder the gas particles so that `parts[i] = old_parts[perm[i]]`,
    /// carrying the extended records along and re-pointing the gravity
    /// partners at the new indices.
    pub fn permute_parts(&mut self, perm: &[usize]) {
        let parts = self.parts.get_mut();
        let xparts = self.xparts.get_mut();
        debug_assert_eq!(perm.len(), parts.len());
        let new_parts: Vec<Part> = perm.iter().map(|&o| parts[o].clone()).collect();
        let new_xparts: Vec<XPart> = perm.iter().map(|&o| xparts[o].clone()).collect();
        *parts = new_parts;
        *xparts = new_xparts;
        for (i, p) in self.parts.get_mut().iter().enumerate() {
            if let Some(j) = p.gpart {
                self.gparts.get_mut()[j as usize].partner = PartnerRef::Gas(i as u32);
            }
        }
    }

    /// Reorder the gravity particles, re-pointing gas and star partners.
    pub fn permute_gparts(&mut self, perm: &[usize]) {
        let gparts = self.gparts.get_mut();
        debug_assert_eq!(perm.len(), gparts.len());
        let new: Vec<GPart> = perm.iter().map(|&o| gparts[o].clone()).collect();
        *gparts = new;
        let n = self.gparts.len();
        for j in 0..n {
            match self.gparts.get_mut()[j].partner {
                PartnerRef::Gas(i) => self.parts.get_mut()[i as usize].gpart = Some(j as u32),
                PartnerRef::Star(i) => self.sparts.get_mut()[i as usize].gpart = Some(j as u32),
                PartnerRef::DarkMatter(_) => {}
            }
        }
    }

    /// Reorder the star particles, re-pointing their gravity partners.
    pub fn permute_sparts(&mut self, perm: &[usize]) {
        let sparts = self.sparts.get_mut();
        debug_assert_eq!(perm.len(), sparts.len());
        let new: Vec<SPart> = perm.iter().map(|&o| sparts[o].clone()).collect();
        *sparts = new;
        for (i, s) in self.sparts.get_mut().iter().enumerate() {
            if let Some(j) = s.gpart {
                self.gparts.get_mut()[j as usize].partner = PartnerRef::Star(i as u32);
            }
        }
    }

    /// Stable permutation grouping elements by ascending destination.
    /// `perm[new] = old`. Destinations must be `< nr_buckets`.
    pub fn counting_sort_perm(dest: &[usize], nr_buckets: usize) -> Vec<usize> {
        let mut counts = vec![0usize; nr_buckets + 1];
        for &d in dest {
            counts[d + 1] += 1;
        }
        for b in 0..nr_buckets {
            counts[b + 1] += counts[b];
        }
        let mut perm = vec![0usize; dest.len()];
        for (old, &d) in dest.iter().enumerate() {
            perm[counts[d]] = old;
            counts[d] += 1;
        }
        perm
    }

    // -----------------------------------------------------------------
    // Rebuild
    // -----------------------------------------------------------------

    /// Clamp pathological smoothing lengths; runs once on the first rebuild.
    pub fn sanitize(&mut self) {
        let max_h = (self.dim[0].min(self.dim[1]).min(self.dim[2]) / 4.0) as f32;
        for p in self.parts.get_mut().iter_mut() {
            if !p.h.is_finite() || p.h <= 0.0 || p.h > max_h {
                p.h = max_h;
            }
        }
        self.sanitized = true;
        tracing::debug!("space sanitized, h clamped to {}", max_h);
    }

    /// Local maximal smoothing length, with a fallback for gravity-only
    /// populations.
    pub fn local_h_max(&mut self) -> f32 {
        let mut h_max = 0.0_f32;
        for p in self.parts.get_mut().iter() {
            if p.h > h_max {
                h_max = p.h;
            }
        }
        if h_max <= 0.0 {
            h_max = (self.dim[0].min(self.dim[1]).min(self.dim[2]) / 8.0) as f32;
        }
        h_max
    }

    /// Recompute the top-grid geometry from the (globally agreed) maximal
    /// smoothing length. On a fresh or resized grid the ownership map is
    /// re-seeded with x-slabs over `nr_nodes`, the same on every node.
    /// Returns whether the grid dimensions changed.
    pub fn prepare_grid(&mut self, node_id: usize, global_h_max: Option<f32>) -> Result<bool> {
        let h_max = global_h_max.unwrap_or_else(|| 0.0).max(self.local_h_max());
        self.h_max = h_max;

        let target = (2.0 * h_max as f64 * self.params.stretch).max(self.params.cell_min);
        let mut cdim = [0i32; 3];
        for k in 0..3 {
            cdim[k] = ((self.dim[k] / target).floor() as i32).max(1);
        }
        if self.periodic && (cdim[0] < 3 || cdim[1] < 3 || cdim[2] < 3) {
            return Err(EngineError::InvariantViolation {
                node: node_id,
                location: "space::prepare_grid",
                detail: format!(
                    "periodic box needs at least 3 cells per axis, got {:?} \
                     (h_max = {})",
                    cdim, h_max
                ),
            });
        }

        let changed = cdim != self.cdim;
        self.cdim = cdim;
        for k in 0..3 {
            self.width[k] = self.dim[k] / cdim[k] as f64;
            self.iwidth[k] = 1.0 / self.width[k];
        }
        let nr_top = (cdim[0] * cdim[1] * cdim[2]) as usize;
        if changed || self.top_node_map.len() != nr_top {
            // Deterministic x-slab seeding; every node computes the same
            // map without talking.
            let mut map = vec![0usize; nr_top];
            if self.nr_nodes > 1 {
                for i in 0..cdim[0] {
                    let owner = (i as usize * self.nr_nodes) / cdim[0] as usize;
                    for j in 0..cdim[1] {
                        for k in 0..cdim[2] {
                            map[cell_getid(cdim, i, j, k)] = owner;
                        }
                    }
                }
            }
            self.top_node_map = map;
        }
        Ok(changed)
    }

    /// Rebuild the top grid and octree from the current particle positions.
    ///
    /// Every local particle must land in a cell owned by `node_id`; strays
    /// must have been exchanged beforehand.
    pub fn rebuild(&mut self, ti_current: IntegerTime, node_id: usize) -> Result<()> {
        if self.cdim == [0; 3] {
            self.prepare_grid(node_id, None)?;
        }
        let cdim = self.cdim;
        let nr_top = (cdim[0] * cdim[1] * cdim[2]) as usize;

        if !self.sanitized {
            self.sanitize();
        }

        // 2. Wrap positions and compute top-cell destinations.
        let nr_parts = self.parts.len();
        let mut dest_parts = vec![0usize; nr_parts];
        for i in 0..nr_parts {
            let raw_x = self.parts.get_mut()[i].x;

            let x = self.box_wrap(raw_x);
            self.parts.get_mut()[i].x = x;
            dest_parts[i] = self.top_cell_of(x);
            if self.top_node_map[dest_parts[i]] != node_id {
                return Err(EngineError::InvariantViolation {
                    node: node_id,
                    location: "space::rebuild (stray part)",
                    detail: format!(
                        "part id {} at {:?} belongs to node {}",
                        self.parts.get_mut()[i].id,
                        x,
                        self.top_node_map[dest_parts[i]]
                    ),
                });
            }
        }
        let nr_gparts = self.gparts.len();
        let mut dest_gparts = vec![0usize; nr_gparts];
        for i in 0..nr_gparts {
            let raw_x = self.gparts.get_mut()[i].x;

            let x = self.box_wrap(raw_x);
            self.gparts.get_mut()[i].x = x;
            dest_gparts[i] = self.top_cell_of(x);
            if self.top_node_map[dest_gparts[i]] != node_id {
                return Err(EngineError::InvariantViolation {
                    node: node_id,
                    location: "space::rebuild (stray gpart)",
                    detail: format!("gravity particle at {:?} is off-node", x),
                });
            }
        }
        let nr_sparts = self.sparts.len();
        let mut dest_sparts = vec![0usize; nr_sparts];
        for i in 0..nr_sparts {
            let raw_x = self.sparts.get_mut()[i].x;

            let x = self.box_wrap(raw_x);
            self.sparts.get_mut()[i].x = x;
            dest_sparts[i] = self.top_cell_of(x);
            if self.top_node_map[dest_sparts[i]] != node_id {
                return Err(EngineError::InvariantViolation {
                    node: node_id,
                    location: "space::rebuild (stray spart)",
                    detail: format!("star particle at {:?} is off-node", x),
                });
            }
        }

        // 3. Group particles by top cell. Displacement accumulators restart
        // from the rebuilt tree.
        for xp in self.xparts.get_mut().iter_mut() {
            xp.x_diff = [0.0; 3];
            xp.x_diff_sort = [0.0; 3];
        }
        let perm = Self::counting_sort_perm(&dest_parts, nr_top);
        self.permute_parts(&perm);
        let perm_g = Self::counting_sort_perm(&dest_gparts, nr_top);
        self.permute_gparts(&perm_g);
        let perm_s = Self::counting_sort_perm(&dest_sparts, nr_top);
        self.permute_sparts(&perm_s);

        // Per-cell counts from the sorted destinations.
        let mut count_parts = vec![0usize; nr_top];
        for &d in &dest_parts {
            count_parts[d] += 1;
        }
        let mut count_gparts = vec![0usize; nr_top];
        for &d in &dest_gparts {
            count_gparts[d] += 1;
        }
        let mut count_sparts = vec![0usize; nr_top];
        for &d in &dest_sparts {
            count_sparts[d] += 1;
        }

        // 4. Fresh arena: top cells in grid order.
        self.cells.clear();
        self.next_tag = 0;
        self.nr_top_cells = nr_top;
        let mut first_p = 0usize;
        let mut first_g = 0usize;
        let mut first_s = 0usize;
        for i in 0..cdim[0] {
            for j in 0..cdim[1] {
                for k in 0..cdim[2] {
                    let cid = cell_getid(cdim, i, j, k);
                    let loc = [
                        i as f64 * self.width[0],
                        j as f64 * self.width[1],
                        k as f64 * self.width[2],
                    ];
                    let mut c = Cell::new(loc, self.width, 0, self.top_node_map[cid]);
                    c.parts = Slice {
                        first: first_p,
                        count: count_parts[cid],
                    };
                    c.gparts = Slice {
                        first: first_g,
                        count: count_gparts[cid],
                    };
                    c.sparts = Slice {
                        first: first_s,
                        count: count_sparts[cid],
                    };
                    c.ti_old_part.store(ti_current, Ordering::Relaxed);
                    c.ti_sort.store(ti_current, Ordering::Relaxed);
                    first_p += count_parts[cid];
                    first_g += count_gparts[cid];
                    first_s += count_sparts[cid];
                    self.cells.push(c);
                }
            }
        }

        // 5. Refine and close each local top cell.
        for cid in 0..nr_top {
            let tag = self.take_tag();
            self.cells[cid].tag = tag;
            if self.cells[cid].node_id == node_id {
                self.split_cell(CellId(cid as u32), ti_current, node_id)?;
            }
        }

        tracing::debug!(
            "space rebuilt: cdim {:?}, {} top cells, {} cells total, h_max {}",
            self.cdim,
            nr_top,
            self.cells.len(),
            self.h_max
        );
        Ok(())
    }

    /// Recursively split `cid` until every leaf is below the split target,
    /// updating `h_max` and the integer-time marks bottom-up.
    fn split_cell(
        &mut self,
        cid: CellId,
        ti_current: IntegerTime,
        node_id: usize,
    ) -> Result<()> {
        let (count, gcount, scount, width, loc, depth) = {
            let c = &self.cells[cid.idx()];
            (
                c.parts.count,
                c.gparts.count,
                c.sparts.count,
                c.width,
                c.loc,
                c.depth,
            )
        };

        let split_size = self.params.split_size;
        if count.max(gcount).max(scount) <= split_size {
            // Leaf: close out h_max.
            let mut h_max = 0.0_f32;
            let range = self.cells[cid.idx()].parts.range();
            for p in &self.parts.get_mut()[range] {
                if p.h > h_max {
                    h_max = p.h;
                }
            }
            self.cells[cid.idx()].h_max = h_max;
            return Ok(());
        }

        if depth > 60 {
            return Err(EngineError::InvariantViolation {
                node: node_id,
                location: "space::split_cell (depth)",
                detail: format!("cell at {:?} exceeds maximum depth", loc),
            });
        }

        // Partition each kind into octants.
        let half = [width[0] * 0.5, width[1] * 0.5, width[2] * 0.5];
        let mid = [loc[0] + half[0], loc[1] + half[1], loc[2] + half[2]];
        let octant = |x: &[f64; 3]| -> usize {
            ((x[0] >= mid[0]) as usize) << 2
                | ((x[1] >= mid[1]) as usize) << 1
                | (x[2] >= mid[2]) as usize
        };

        let p_slice = self.cells[cid.idx()].parts;
        let g_slice = self.cells[cid.idx()].gparts;
        let s_slice = self.cells[cid.idx()].sparts;

        let dest_p: Vec<usize> = self.parts.get_mut()[p_slice.range()]
            .iter()
            .map(|p| octant(&p.x))
            .collect();
        let perm = Self::counting_sort_perm(&dest_p, 8);
        let full: Vec<usize> = (0..p_slice.first)
            .chain(perm.iter().map(|&o| p_slice.first + o))
            .chain(p_slice.first + p_slice.count..self.parts.len())
            .collect();
        self.permute_parts(&full);

        let dest_g: Vec<usize> = self.gparts.get_mut()[g_slice.range()]
            .iter()
            .map(|g| octant(&g.x))
            .collect();
        let perm_g = Self::counting_sort_perm(&dest_g, 8);
        let full_g: Vec<usize> = (0..g_slice.first)
            .chain(perm_g.iter().map(|&o| g_slice.first + o))
            .chain(g_slice.first + g_slice.count..self.gparts.len())
            .collect();
        self.permute_gparts(&full_g);

        let dest_s: Vec<usize> = self.sparts.get_mut()[s_slice.range()]
            .iter()
            .map(|s| octant(&s.x))
            .collect();
        let perm_s = Self::counting_sort_perm(&dest_s, 8);
        let full_s: Vec<usize> = (0..s_slice.first)
            .chain(perm_s.iter().map(|&o| s_slice.first + o))
            .chain(s_slice.first + s_slice.count..self.sparts.len())
            .collect();
        self.permute_sparts(&full_s);

        let mut oct_counts_p = [0usize; 8];
        for &d in &dest_p {
            oct_counts_p[d] += 1;
        }
        let mut oct_counts_g = [0usize; 8];
        for &d in &dest_g {
            oct_counts_g[d] += 1;
        }
        let mut oct_counts_s = [0usize; 8];
        for &d in &dest_s {
            oct_counts_s[d] += 1;
        }

        // Create the progeny.
        self.cells[cid.idx()].split = true;
        let mut first_p = p_slice.first;
        let mut first_g = g_slice.first;
        let mut first_s = s_slice.first;
        let mut children = [None; 8];
        for o in 0..8 {
            let child_loc = [
                loc[0] + if o & 4 != 0 { half[0] } else { 0.0 },
                loc[1] + if o & 2 != 0 { half[1] } else { 0.0 },
                loc[2] + if o & 1 != 0 { half[2] } else { 0.0 },
            ];
            let mut child = Cell::new(child_loc, half, depth + 1, node_id);
            child.parent = Some(cid);
            child.parts = Slice {
                first: first_p,
                count: oct_counts_p[o],
            };
            child.gparts = Slice {
                first: first_g,
                count: oct_counts_g[o],
            };
            child.sparts = Slice {
                first: first_s,
                count: oct_counts_s[o],
            };
            child.ti_old_part.store(ti_current, Ordering::Relaxed);
            child.ti_sort.store(ti_current, Ordering::Relaxed);
            child.tag = self.take_tag();
            first_p += oct_counts_p[o];
            first_g += oct_counts_g[o];
            first_s += oct_counts_s[o];
            let child_id = CellId(self.cells.len() as u32);
            self.cells.push(child);
            children[o] = Some(child_id);
        }
        self.cells[cid.idx()].progeny = children;

        // Recurse and pull h_max back up.
        let mut h_max = 0.0_f32;
        for o in 0..8 {
            if let Some(child_id) = children[o] {
                self.split_cell(child_id, ti_current, node_id)?;
                h_max = h_max.max(self.cells[child_id.idx()].h_max);
            }
        }
        self.cells[cid.idx()].h_max = h_max;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Strays
    // -----------------------------------------------------------------

    /// Remove every particle whose wrapped position falls in a foreign top
    /// cell and return them grouped with their destination nodes.
    ///
    /// Requires a valid top grid from a previous rebuild. Gas and star
    /// strays take their gravity records along; the batch keeps the linkage
    /// as batch-local indices.
    pub fn collect_strays(&mut self, node_id: usize) -> Result<StrayBatch> {
        if self.nr_top_cells == 0 {
            return Ok(StrayBatch::default());
        }

        // 0 = keep, 1 = stray: a stable two-bucket partition per array.
        let nr_parts = self.parts.len();
        let mut part_flag = vec![0usize; nr_parts];
        let mut part_node = vec![node_id; nr_parts];
        for i in 0..nr_parts {
            let raw_x = self.parts.get_mut()[i].x;

            let x = self.box_wrap(raw_x);
            let owner = self.top_node_map[self.top_cell_of(x)];
            if owner != node_id {
                part_flag[i] = 1;
                part_node[i] = owner;
            }
        }
        let perm = Self::counting_sort_perm(&part_flag, 2);
        let keep_parts = part_flag.iter().filter(|&&f| f == 0).count();
        self.permute_parts(&perm);
        let part_node: Vec<usize> = perm.iter().map(|&o| part_node[o]).collect();

        let nr_sparts = self.sparts.len();
        let mut spart_flag = vec![0usize; nr_sparts];
        let mut spart_node = vec![node_id; nr_sparts];
        for i in 0..nr_sparts {
            let raw_x = self.sparts.get_mut()[i].x;

            let x = self.box_wrap(raw_x);
            let owner = self.top_node_map[self.top_cell_of(x)];
            if owner != node_id {
                spart_flag[i] = 1;
                spart_node[i] = owner;
            }
        }
        let perm_s = Self::counting_sort_perm(&spart_flag, 2);
        let keep_sparts = spart_flag.iter().filter(|&&f| f == 0).count();
        self.permute_sparts(&perm_s);
        let spart_node: Vec<usize> = perm_s.iter().map(|&o| spart_node[o]).collect();

        // Gravity records follow their partners; dark matter goes by its own
        // position.
        let nr_gparts = self.gparts.len();
        let mut gpart_flag = vec![0usize; nr_gparts];
        let mut gpart_node = vec![node_id; nr_gparts];
        for j in 0..nr_gparts {
            match self.gparts.get_mut()[j].partner {
                PartnerRef::Gas(i) => {
                    if (i as usize) >= keep_parts {
                        gpart_flag[j] = 1;
                        gpart_node[j] = part_node[i as usize];
                    }
                }
                PartnerRef::Star(i) => {
                    if (i as usize) >= keep_sparts {
                        gpart_flag[j] = 1;
                        gpart_node[j] = spart_node[i as usize];
                    }
                }
                PartnerRef::DarkMatter(_) => {
                    let raw_x = self.gparts.get_mut()[j].x;

                    let x = self.box_wrap(raw_x);
                    let owner = self.top_node_map[self.top_cell_of(x)];
                    if owner != node_id {
                        gpart_flag[j] = 1;
                        gpart_node[j] = owner;
                    }
                }
            }
        }
        let perm_g = Self::counting_sort_perm(&gpart_flag, 2);
        let keep_gparts = gpart_flag.iter().filter(|&&f| f == 0).count();
        self.permute_gparts(&perm_g);
        let gpart_node: Vec<usize> = perm_g.iter().map(|&o| gpart_node[o]).collect();

        // Pop the tails into the batch, rebasing linkage to batch-local
        // indices.
        let mut batch = StrayBatch::default();
        {
            let parts = self.parts.get_mut();
            let xparts = self.xparts.get_mut();
            for i in keep_parts..nr_parts {
                let mut p = parts[i].clone();
                p.gpart = None; // re-established on the receiving side
                batch.parts.push((p, xparts[i].clone(), part_node[i]));
            }
            parts.truncate(keep_parts);
            xparts.truncate(keep_parts);
        }
        {
            let sparts = self.sparts.get_mut();
            for i in keep_sparts..nr_sparts {
                let mut s = sparts[i].clone();
                s.gpart = None;
                batch.sparts.push((s, spart_node[i]));
            }
            sparts.truncate(keep_sparts);
        }
        {
            let gparts = self.gparts.get_mut();
            for j in keep_gparts..nr_gparts {
                let mut g = gparts[j].clone();
                g.partner = match g.partner {
                    PartnerRef::Gas(i) => PartnerRef::Gas(i - keep_parts as u32),
                    PartnerRef::Star(i) => PartnerRef::Star(i - keep_sparts as u32),
                    dm => dm,
                };
                batch.gparts.push((g, gpart_node[j]));
            }
            gparts.truncate(keep_gparts);
        }

        // The keepers must still be consistent.
        self.verify_linkage(node_id)?;
        Ok(batch)
    }

    /// Append particles received from other nodes, rebasing their linkage
    /// from batch-local to absolute indices. `parts`/`sparts` arrive in the
    /// same relative order the sender used.
    pub fn append_received(
        &mut self,
        parts: Vec<(Part, XPart)>,
        gparts: Vec<GPart>,
        sparts: Vec<SPart>,
    ) {
        let grow = self.params.parts_size_grow;
        let part_base = self.parts.len();
        let spart_base = self.sparts.len();

        {
            let store = self.parts.get_mut();
            let xstore = self.xparts.get_mut();
            if store.capacity() < part_base + parts.len() {
                let target = ((part_base + parts.len()) as f64 * grow) as usize;
                store.reserve(target - store.len());
                xstore.reserve(target - xstore.len());
            }
            for (p, xp) in parts {
                store.push(p);
                xstore.push(xp);
            }
        }
        {
            let store = self.sparts.get_mut();
            for s in sparts {
                store.push(s);
            }
        }
        {
            let base = self.gparts.len();
            let store = self.gparts.get_mut();
            if store.capacity() < base + gparts.len() {
                let target = ((base + gparts.len()) as f64 * grow) as usize;
                store.reserve(target - store.len());
            }
            for mut g in gparts {
                let j = store.len() as u32;
                match g.partner {
                    PartnerRef::Gas(local) => {
                        let abs = part_base + local as usize;
                        g.partner = PartnerRef::Gas(abs as u32);
                        self.parts.get_mut()[abs].gpart = Some(j);
                    }
                    PartnerRef::Star(local) => {
                        let abs = spart_base + local as usize;
                        g.partner = PartnerRef::Star(abs as u32);
                        self.sparts.get_mut()[abs].gpart = Some(j);
                    }
                    PartnerRef::DarkMatter(_) => {}
                }
                store.push(g);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::Part;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn random_parts(n: usize, h: f32, seed: u64) -> Vec<Part> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                Part::new(
                    [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()],
                    h,
                    1.0,
                    i as u64,
                )
            })
            .collect()
    }

    fn test_space(n: usize) -> Space {
        let mut params = SpaceParams::default();
        params.split_size = 32;
        let mut s = Space::new([1.0, 1.0, 1.0], false, params);
        s.set_particles(random_parts(n, 0.05, 42), Vec::new(), Vec::new());
        s
    }

    /// Every particle lies inside exactly one leaf and appears in its slice.
    #[test]
    fn rebuild_partitions_every_particle() {
        let mut s = test_space(1000);
        s.rebuild(0, 0).unwrap();

        let mut seen = vec![0usize; s.nr_parts()];
        for ci in 0..s.cells.len() {
            let (split, slice, loc, width) = {
                let c = &s.cells[ci];
                (c.split, c.parts, c.loc, c.width)
            };
            if split || slice.is_empty() {
                continue;
            }
            for i in slice.range() {
                let x = s.parts.get_mut()[i].x;
                for k in 0..3 {
                    assert!(
                        x[k] >= loc[k] && x[k] < loc[k] + width[k],
                        "particle {} outside its leaf on axis {}",
                        i,
                        k
                    );
                }
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1), "leaf slices must partition");
    }

    #[test]
    fn rebuild_preserves_linkage() {
        let mut s = test_space(500);
        s.rebuild(0, 0).unwrap();
        s.verify_linkage(0).unwrap();
    }

    #[test]
    fn leaves_respect_split_size() {
        let mut s = test_space(2000);
        s.rebuild(0, 0).unwrap();
        for c in &s.cells {
            if !c.split {
                assert!(c.parts.count <= s.params.split_size);
            }
        }
    }

    #[test]
    fn counting_sort_is_stable() {
        let dest = vec![1, 0, 1, 0, 1];
        let perm = Space::counting_sort_perm(&dest, 2);
        assert_eq!(perm, vec![1, 3, 0, 2, 4]);
    }

    #[test]
    fn box_wrap_periodic() {
        let mut params = SpaceParams::default();
        params.cell_min = 0.2;
        let s = Space::new([1.0, 1.0, 1.0], true, params);
        let w = s.box_wrap([1.25, -0.25, 0.5]);
        assert!((w[0] - 0.25).abs() < 1e-12);
        assert!((w[1] - 0.75).abs() < 1e-12);
        assert_eq!(w[2], 0.5);
    }

    #[test]
    fn strays_detected_against_node_map() {
        let mut s = test_space(300);
        s.rebuild(0, 0).unwrap();
        // Give the upper half of the grid to node 1.
        let nr_top = s.nr_top_cells;
        for cid in 0..nr_top {
            if s.cells[cid].loc[0] >= 0.5 {
                s.top_node_map[cid] = 1;
                s.cells[cid].node_id = 1;
            }
        }
        let total = s.nr_parts() + s.nr_gparts();
        let batch = s.collect_strays(0).unwrap();
        assert!(!batch.is_empty());
        assert!(batch.parts.iter().all(|(p, _, node)| {
            *node == 1 && p.x[0] >= 0.5
        }));
        // Nothing lost: keepers + strays = original population.
        assert_eq!(
            s.nr_parts() + s.nr_gparts() + batch.len(),
            total,
        );
        s.verify_linkage(0).unwrap();
    }

    #[test]
    fn stray_round_trip_restores_linkage() {
        let mut s = test_space(300);
        s.rebuild(0, 0).unwrap();
        let nr_top = s.nr_top_cells;
        for cid in 0..nr_top {
            if s.cells[cid].loc[0] >= 0.5 {
                s.top_node_map[cid] = 1;
                s.cells[cid].node_id = 1;
            }
        }
        let batch = s.collect_strays(0).unwrap();

        // Feed the batch straight back, as the peer node would.
        let parts: Vec<(Part, XPart)> =
            batch.parts.into_iter().map(|(p, xp, _)| (p, xp)).collect();
        let gparts: Vec<GPart> = batch.gparts.into_iter().map(|(g, _)| g).collect();
        let sparts: Vec<SPart> = batch.sparts.into_iter().map(|(s, _)| s).collect();
        let expect = s.nr_parts() + parts.len();
        s.append_received(parts, gparts, sparts);
        assert_eq!(s.nr_parts(), expect);
        s.verify_linkage(0).unwrap();
    }
}
