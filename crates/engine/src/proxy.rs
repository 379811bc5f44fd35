//! Per-peer communication endpoints and the wire records they exchange.
//!
//! A proxy bundles everything this node says to one peer: the foreign cells
//! it reads (`cells_in`) and the local cells it publishes (`cells_out`).
//! Payloads are plain-old-data record arrays cast to bytes; the packed-cell
//! records describe a subtree in pre-order so the receiver can rebuild the
//! foreign skeleton.

use bytemuck::{Pod, Zeroable};

use crate::cell::{Cell, CellId, Slice};
use crate::error::{EngineError, Result};
use crate::space::Space;

/// Hard cap on the number of proxies per node.
pub const MAX_PROXIES: usize = 64;

/// Payload kind selector inside a cell's tag block.
pub const TAG_XV: i64 = 0;
/// Density payload.
pub const TAG_RHO: i64 = 1;
/// Time-step-end payload.
pub const TAG_TEND: i64 = 2;
/// Gradient payload (two-loop schemes; reserved).
pub const TAG_GRADIENT: i64 = 3;

/// Wire tag of payload `kind` for a cell: `4 * tag + kind`.
#[inline]
pub fn wire_tag(cell_tag: i32, kind: i64) -> i64 {
    4 * cell_tag as i64 + kind
}

/// Tags used by the cell-metadata exchange, outside the per-cell block.
pub const TAG_CELL_COUNTS: i64 = i64::MAX - 1;
/// Packed subtree payload of the metadata exchange.
pub const TAG_CELL_PCELLS: i64 = i64::MAX - 2;
/// Stray-exchange counts.
pub const TAG_STRAY_COUNTS: i64 = i64::MAX - 3;
/// Stray gas payload.
pub const TAG_STRAY_PARTS: i64 = i64::MAX - 4;
/// Stray gravity payload.
pub const TAG_STRAY_GPARTS: i64 = i64::MAX - 5;
/// Stray star payload.
pub const TAG_STRAY_SPARTS: i64 = i64::MAX - 6;

/// One packed cell of a pre-order subtree traversal.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct PCell {
    /// Lower corner.
    pub loc: [f64; 3],
    /// Edge lengths.
    pub width: [f64; 3],
    /// Earliest step end in the subtree.
    pub ti_end_min: i64,
    /// Gas count.
    pub count: u32,
    /// Gravity count.
    pub gcount: u32,
    /// Star count.
    pub scount: u32,
    /// Message tag block of this cell.
    pub tag: i32,
    /// Bit `k` set when progeny `k` exists.
    pub progeny_mask: u32,
    /// Worst-case smoothing length.
    pub h_max: f32,
}

/// Gas positions-and-velocities payload record.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct PartXvMsg {
    /// Position.
    pub x: [f64; 3],
    /// Particle id.
    pub id: u64,
    /// Velocity.
    pub v: [f32; 3],
    /// Smoothing length.
    pub h: f32,
    /// Mass.
    pub mass: f32,
    /// Layout padding.
    pub pad: u32,
}

/// Gas density payload record.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct PartRhoMsg {
    /// Density.
    pub rho: f32,
    /// Neighbour count estimate.
    pub wcount: f32,
    /// Its h-derivative.
    pub wcount_dh: f32,
    /// Density h-derivative.
    pub rho_dh: f32,
    /// Velocity divergence.
    pub div_v: f32,
    /// Velocity curl.
    pub rot_v: [f32; 3],
    /// Entropy function.
    pub entropy: f32,
    /// Layout padding.
    pub pad: f32,
}

/// Stray gas particle record.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct StrayPartMsg {
    /// Position.
    pub x: [f64; 3],
    /// Particle id.
    pub id: u64,
    /// Velocity.
    pub v: [f32; 3],
    /// Full-step velocity.
    pub v_full: [f32; 3],
    /// Smoothing length.
    pub h: f32,
    /// Mass.
    pub mass: f32,
    /// Entropy function.
    pub entropy: f32,
    /// Internal energy.
    pub u_full: f32,
    /// Time bin.
    pub time_bin: i32,
    /// Layout padding.
    pub pad: i32,
}

/// Stray gravity record. `partner_kind` is 0 for dark matter (with
/// `partner` carrying the id), 1 for gas and 2 for stars (with `partner`
/// carrying the batch-local partner index).
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct StrayGPartMsg {
    /// Position.
    pub x: [f64; 3],
    /// Dark-matter id or batch-local partner index.
    pub partner: i64,
    /// Full-step velocity.
    pub v_full: [f32; 3],
    /// Mass.
    pub mass: f32,
    /// Time bin.
    pub time_bin: i32,
    /// Partner discriminant.
    pub partner_kind: i32,
}

/// Stray star particle record.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct StraySPartMsg {
    /// Position.
    pub x: [f64; 3],
    /// Particle id.
    pub id: u64,
    /// Velocity.
    pub v: [f32; 3],
    /// Mass.
    pub mass: f32,
    /// Feedback radius.
    pub h: f32,
    /// Time bin.
    pub time_bin: i32,
    /// Layout padding.
    pub pad: [i32; 2],
}

/// Everything exchanged with one peer node.
#[derive(Debug, Default)]
pub struct Proxy {
    /// The peer's rank.
    pub peer: usize,
    /// Foreign cells whose particles this node reads.
    pub cells_in: Vec<CellId>,
    /// Local cells whose particles this node publishes.
    pub cells_out: Vec<CellId>,
}

impl Proxy {
    /// A proxy towards `peer`.
    pub fn new(peer: usize) -> Self {
        Proxy {
            peer,
            cells_in: Vec::new(),
            cells_out: Vec::new(),
        }
    }

    /// Register a foreign cell, once.
    pub fn add_cell_in(&mut self, cid: CellId) {
        if !self.cells_in.contains(&cid) {
            self.cells_in.push(cid);
        }
    }

    /// Register a local cell, once.
    pub fn add_cell_out(&mut self, cid: CellId) {
        if !self.cells_out.contains(&cid) {
            self.cells_out.push(cid);
        }
    }
}

/// Scan the 26-neighbourhood of every top cell and build one proxy per peer
/// that shares a boundary with this node. The scan order is the grid order,
/// identical on every node, so both sides list the shared cells in the same
/// sequence.
pub fn make_proxies(space: &Space, node_id: usize) -> Result<Vec<Proxy>> {
    let cdim = space.cdim;
    let mut proxies: Vec<Proxy> = Vec::new();
    let mut proxy_ind: Vec<Option<usize>> = Vec::new();

    let mut proxy_for = |proxies: &mut Vec<Proxy>,
                         proxy_ind: &mut Vec<Option<usize>>,
                         peer: usize|
     -> Result<usize> {
        if peer >= proxy_ind.len() {
            proxy_ind.resize(peer + 1, None);
        }
        if let Some(pid) = proxy_ind[peer] {
            return Ok(pid);
        }
        if proxies.len() >= MAX_PROXIES {
            return Err(EngineError::GraphOverflow {
                node: node_id,
                what: "proxy table",
                capacity: MAX_PROXIES,
            });
        }
        let pid = proxies.len();
        proxies.push(Proxy::new(peer));
        proxy_ind[peer] = Some(pid);
        Ok(pid)
    };

    for i in 0..cdim[0] {
        for j in 0..cdim[1] {
            for k in 0..cdim[2] {
                let cid = crate::cell::cell_getid(cdim, i, j, k);
                for di in -1i32..=1 {
                    for dj in -1i32..=1 {
                        for dk in -1i32..=1 {
                            if di == 0 && dj == 0 && dk == 0 {
                                continue;
                            }
                            let mut ii = i + di;
                            let mut jj = j + dj;
                            let mut kk = k + dk;
                            if space.periodic {
                                ii = (ii + cdim[0]) % cdim[0];
                                jj = (jj + cdim[1]) % cdim[1];
                                kk = (kk + cdim[2]) % cdim[2];
                            } else if ii < 0
                                || ii >= cdim[0]
                                || jj < 0
                                || jj >= cdim[1]
                                || kk < 0
                                || kk >= cdim[2]
                            {
                                continue;
                            }
                            let cjd = crate::cell::cell_getid(cdim, ii, jj, kk);
                            let node_i = space.cells[cid].node_id;
                            let node_j = space.cells[cjd].node_id;
                            // Both directions are handled inside one grid
                            // iteration so every node appends the shared
                            // cells in the same sequence.
                            if node_i == node_id && node_j != node_id {
                                let pid =
                                    proxy_for(&mut proxies, &mut proxy_ind, node_j)?;
                                proxies[pid].add_cell_in(CellId(cjd as u32));
                                proxies[pid].add_cell_out(CellId(cid as u32));
                            }
                            if node_j == node_id && node_i != node_id {
                                let pid =
                                    proxy_for(&mut proxies, &mut proxy_ind, node_i)?;
                                proxies[pid].add_cell_in(CellId(cid as u32));
                                proxies[pid].add_cell_out(CellId(cjd as u32));
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(proxies)
}

/// Pack the subtree under `cid` in pre-order.
pub fn pack_cells(space: &Space, cid: CellId, out: &mut Vec<PCell>) {
    let c = &space.cells[cid.idx()];
    let mut progeny_mask = 0u32;
    for (k, p) in c.progeny.iter().enumerate() {
        if p.is_some() {
            progeny_mask |= 1 << k;
        }
    }
    out.push(PCell {
        loc: c.loc,
        width: c.width,
        ti_end_min: c.ti_end_min.load(std::sync::atomic::Ordering::Relaxed),
        count: c.parts.count as u32,
        gcount: c.gparts.count as u32,
        scount: c.sparts.count as u32,
        tag: c.tag,
        progeny_mask,
        h_max: c.h_max,
    });
    for p in c.progeny.iter().flatten() {
        pack_cells(space, *p, out);
    }
}

/// Rebuild the foreign subtree below `cid` from a packed sequence,
/// assigning particle ranges starting at the given offsets into the foreign
/// arrays. Returns the number of packed records consumed.
pub fn unpack_cells(
    space: &mut Space,
    cid: CellId,
    pcells: &[PCell],
    peer: usize,
    offsets: &mut [usize; 3],
) -> Result<usize> {
    let pc = pcells.first().ok_or(EngineError::Communication {
        node: space.cells[cid.idx()].node_id,
        peer,
        detail: "truncated packed-cell stream".to_string(),
    })?;

    let (first_p, first_g, first_s) = (offsets[0], offsets[1], offsets[2]);
    {
        let c = &mut space.cells[cid.idx()];
        c.is_foreign = true;
        c.node_id = peer;
        c.tag = pc.tag;
        c.h_max = pc.h_max;
        c.parts = Slice {
            first: first_p,
            count: pc.count as usize,
        };
        c.gparts = Slice {
            first: first_g,
            count: pc.gcount as usize,
        };
        c.sparts = Slice {
            first: first_s,
            count: pc.scount as usize,
        };
        c.ti_end_min
            .store(pc.ti_end_min, std::sync::atomic::Ordering::Relaxed);
    }

    let mut used = 1usize;
    if pc.progeny_mask != 0 {
        space.cells[cid.idx()].split = true;
        // Children split the parent's ranges; their own pcells carry the
        // counts, the offsets advance as we recurse left to right.
        let mask = pc.progeny_mask;
        let (loc, width, depth) = {
            let c = &space.cells[cid.idx()];
            (c.loc, c.width, c.depth)
        };
        let half = [width[0] * 0.5, width[1] * 0.5, width[2] * 0.5];
        for k in 0..8usize {
            if mask & (1 << k) == 0 {
                continue;
            }
            let child_loc = [
                loc[0] + if k & 4 != 0 { half[0] } else { 0.0 },
                loc[1] + if k & 2 != 0 { half[1] } else { 0.0 },
                loc[2] + if k & 1 != 0 { half[2] } else { 0.0 },
            ];
            let mut child = Cell::new(child_loc, half, depth + 1, peer);
            child.parent = Some(cid);
            child.is_foreign = true;
            let child_id = CellId(space.cells.len() as u32);
            space.cells.push(child);
            space.cells[cid.idx()].progeny[k] = Some(child_id);
            used += unpack_cells(space, child_id, &pcells[used..], peer, offsets)?;
        }
    } else {
        // Leaf: consume the particles.
        offsets[0] = first_p + pc.count as usize;
        offsets[1] = first_g + pc.gcount as usize;
        offsets[2] = first_s + pc.scount as usize;
    }
    Ok(used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpaceParams;
    use kernel::Part;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn pod_records_have_stable_sizes() {
        assert_eq!(std::mem::size_of::<PCell>(), 80);
        assert_eq!(std::mem::size_of::<PartXvMsg>(), 56);
        assert_eq!(std::mem::size_of::<PartRhoMsg>(), 40);
        assert_eq!(std::mem::size_of::<StrayGPartMsg>(), 56);
    }

    #[test]
    fn wire_tags_partition_by_kind() {
        assert_eq!(wire_tag(5, TAG_XV), 20);
        assert_eq!(wire_tag(5, TAG_RHO), 21);
        assert_eq!(wire_tag(5, TAG_TEND), 22);
        assert_eq!(wire_tag(5, TAG_GRADIENT), 23);
        assert_ne!(wire_tag(5, TAG_GRADIENT), wire_tag(6, TAG_XV));
    }

    fn built_space(n: usize) -> Space {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let parts: Vec<Part> = (0..n)
            .map(|i| {
                Part::new(
                    [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()],
                    0.05,
                    1.0,
                    i as u64,
                )
            })
            .collect();
        let mut params = SpaceParams::default();
        params.split_size = 24;
        let mut s = Space::new([1.0; 3], false, params);
        s.set_particles(parts, Vec::new(), Vec::new());
        s.rebuild(0, 0).unwrap();
        s
    }

    #[test]
    fn pack_then_unpack_recreates_the_skeleton() {
        let src = built_space(400);
        let mut packed = Vec::new();
        pack_cells(&src, CellId(0), &mut packed);
        assert!(!packed.is_empty());

        // A bare receiving space with one matching top cell.
        let mut dst = Space::new([1.0; 3], false, SpaceParams::default());
        let top = &src.cells[0];
        dst.cells.push(Cell::new(top.loc, top.width, 0, 1));
        dst.nr_top_cells = 1;
        let mut offsets = [0usize; 3];
        let used = unpack_cells(&mut dst, CellId(0), &packed, 1, &mut offsets).unwrap();
        assert_eq!(used, packed.len());
        assert_eq!(offsets[0], top.parts.count);
        assert_eq!(dst.cells[0].parts.count, top.parts.count);
        assert_eq!(dst.cells[0].split, top.split);
        assert!(dst.cells[0].is_foreign);
        // Same number of cells in the rebuilt subtree.
        fn subtree_count(s: &Space, c: CellId) -> usize {
            1 + s.cells[c.idx()]
                .progeny
                .iter()
                .flatten()
                .map(|p| subtree_count(s, *p))
                .sum::<usize>()
        }
        assert_eq!(subtree_count(&dst, CellId(0)), subtree_count(&src, CellId(0)));
    }

    #[test]
    fn proxies_found_for_split_grid() {
        let mut s = built_space(600);
        // Hand the x-upper half to node 1.
        for cid in 0..s.nr_top_cells {
            if s.cells[cid].loc[0] >= 0.5 {
                s.cells[cid].node_id = 1;
                s.top_node_map[cid] = 1;
            }
        }
        let proxies = make_proxies(&s, 0).unwrap();
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].peer, 1);
        assert!(!proxies[0].cells_in.is_empty());
        assert!(!proxies[0].cells_out.is_empty());
        // Everything listed points the right way.
        for c in &proxies[0].cells_in {
            assert_eq!(s.cells[c.idx()].node_id, 1);
        }
        for c in &proxies[0].cells_out {
            assert_eq!(s.cells[c.idx()].node_id, 0);
        }
    }
}
