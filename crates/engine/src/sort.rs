//! Sorting cell particles along the 13 canonical pair axes.
//!
//! A 3-D grid cell has 26 neighbours but only 13 unique relative directions
//! (the other 13 are point reflections). Pair interactions sweep both cells'
//! particles in projection order along the pair's axis, so each cell keeps
//! one lazily-built sorted permutation per axis, flagged in its 13-bit
//! `sorted` mask.

use std::sync::atomic::Ordering;

use kernel::IntegerTime;

use crate::cell::{CellId, SortEntry};
use crate::space::Space;

const F_1_SQRT3: f64 = 0.577_350_269_189_625_8;
const F_1_SQRT2: f64 = 0.707_106_781_186_547_5;

/// Unit vectors of the 13 canonical axes, indexed by sort id.
pub const SORT_AXES: [[f64; 3]; 13] = [
    [-F_1_SQRT3, -F_1_SQRT3, -F_1_SQRT3],
    [-F_1_SQRT2, -F_1_SQRT2, 0.0],
    [-F_1_SQRT3, -F_1_SQRT3, F_1_SQRT3],
    [-F_1_SQRT2, 0.0, -F_1_SQRT2],
    [-1.0, 0.0, 0.0],
    [-F_1_SQRT2, 0.0, F_1_SQRT2],
    [-F_1_SQRT3, F_1_SQRT3, -F_1_SQRT3],
    [-F_1_SQRT2, F_1_SQRT2, 0.0],
    [-F_1_SQRT3, F_1_SQRT3, F_1_SQRT3],
    [0.0, -F_1_SQRT2, -F_1_SQRT2],
    [0.0, -1.0, 0.0],
    [0.0, -F_1_SQRT2, F_1_SQRT2],
    [0.0, 0.0, -1.0],
];

/// Sort id of a grid offset `cj - ci` with components in `{-1, 0, 1}`,
/// plus whether the canonical direction is the reflection of the offset.
///
/// The centre offset `(0, 0, 0)` maps to 13, which is not a valid axis.
#[inline]
pub fn sid_of_offset(off: [i32; 3]) -> (usize, bool) {
    let sid = ((off[0] + 1) * 9 + (off[1] + 1) * 3 + (off[2] + 1)) as usize;
    if sid > 13 {
        (26 - sid, true)
    } else {
        (sid, false)
    }
}

/// Projection of a position onto an axis.
#[inline]
fn project(x: [f64; 3], axis: [f64; 3]) -> f32 {
    (x[0] * axis[0] + x[1] * axis[1] + x[2] * axis[2]) as f32
}

/// Sort the particles of `cid` along every axis set in `flags` that is not
/// already valid, children first, then a pairwise merge up the tree.
///
/// # Safety contract
/// Called from a sort task; the task graph guarantees exclusive access to
/// the subtree's sort caches and stable particle positions (drift ordered
/// before sort).
pub fn do_sort(space: &Space, cid: CellId, flags: u32, ti_current: IntegerTime) {
    let cell = &space.cells[cid.idx()];
    // Requested axes are rebuilt from the current positions even when the
    // mask says they exist; the particles may have drifted since.
    let missing = flags & 0x1FFF;
    if missing == 0 {
        return;
    }

    if cell.split {
        // Children first.
        for child in cell.progeny.iter().flatten() {
            do_sort(space, *child, missing, ti_current);
        }
        // Then merge their sorted runs pairwise.
        let mut cache = cell.sort.lock().unwrap();
        for sid in 0..13 {
            if missing & (1 << sid) == 0 {
                continue;
            }
            let mut merged: Vec<SortEntry> = Vec::with_capacity(cell.parts.count);
            for child in cell.progeny.iter().flatten() {
                let child_cache = space.cells[child.idx()].sort.lock().unwrap();
                merged = merge_runs(&merged, &child_cache.axes[sid]);
            }
            cache.axes[sid] = merged;
        }
    } else {
        let parts = unsafe { space.parts_of(cell) };
        let mut cache = cell.sort.lock().unwrap();
        for sid in 0..13 {
            if missing & (1 << sid) == 0 {
                continue;
            }
            let axis = SORT_AXES[sid];
            let mut entries: Vec<SortEntry> = parts
                .iter()
                .enumerate()
                .map(|(off, p)| SortEntry {
                    index: (cell.parts.first + off) as u32,
                    dist: project(p.x, axis),
                })
                .collect();
            // Ties break on the particle index, which makes repeated sorts
            // reproduce the exact same permutation.
            entries.sort_unstable_by(|a, b| {
                a.dist
                    .partial_cmp(&b.dist)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.index.cmp(&b.index))
            });
            cache.axes[sid] = entries;
        }
    }

    cell.sorted.fetch_or(missing, Ordering::Relaxed);
    cell.ti_sort.store(ti_current, Ordering::Relaxed);
    cell.dx_max_sort.store(0.0);
}

/// Stable two-way merge of sorted runs.
fn merge_runs(a: &[SortEntry], b: &[SortEntry]) -> Vec<SortEntry> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let take_a = match a[i].dist.partial_cmp(&b[j].dist) {
            Some(std::cmp::Ordering::Less) => true,
            Some(std::cmp::Ordering::Greater) => false,
            _ => a[i].index <= b[j].index,
        };
        if take_a {
            out.push(a[i]);
            i += 1;
        } else {
            out.push(b[j]);
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}
