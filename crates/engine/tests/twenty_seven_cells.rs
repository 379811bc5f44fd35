//! 27-cell neighbour test: a 3x3x3 block of cells filled with lattice
//! particles, the centre cell interacted against itself and its 26
//! neighbours. The recovered density, velocity divergence and curl must
//! match the analytic fields.

use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex, RwLock};

use engine::cell::{cell_getid, CellId};
use engine::config::SpaceParams;
use engine::runner::{self, WorkerContext};
use engine::scheduler::Scheduler;
use engine::sort;
use engine::space::Space;
use engine::transport::MemoryTransport;
use kernel::hydro;
use kernel::{Part, Timeline, MAX_NR_TIMESTEPS};

const N: usize = 6;
const SIZE: f64 = 1.0;
const RHO: f32 = 1.0;
const H_FACTOR: f64 = 1.2348;

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Rotating,
    Divergent,
}

fn lattice_space(field: Field) -> Space {
    let spacing = SIZE / N as f64;
    let h = (H_FACTOR * spacing) as f32;
    let mass = RHO * (spacing * spacing * spacing) as f32;

    let mut parts = Vec::with_capacity(27 * N * N * N);
    let mut id = 0u64;
    for ci in 0..3 {
        for cj in 0..3 {
            for ck in 0..3 {
                for x in 0..N {
                    for y in 0..N {
                        for z in 0..N {
                            let pos = [
                                ci as f64 * SIZE + (x as f64 + 0.5) * spacing,
                                cj as f64 * SIZE + (y as f64 + 0.5) * spacing,
                                ck as f64 * SIZE + (z as f64 + 0.5) * spacing,
                            ];
                            id += 1;
                            let mut p = Part::new(pos, h, mass, id);
                            p.v = match field {
                                Field::Rotating => [pos[1] as f32, -(pos[0] as f32), 0.0],
                                Field::Divergent => [
                                    (pos[0] - 1.5 * SIZE) as f32,
                                    (pos[1] - 1.5 * SIZE) as f32,
                                    (pos[2] - 1.5 * SIZE) as f32,
                                ],
                            };
                            parts.push(p);
                        }
                    }
                }
            }
        }
    }

    let mut params = SpaceParams::default();
    params.cell_min = SIZE;
    params.split_size = usize::MAX;
    let mut space = Space::new([3.0 * SIZE; 3], true, params);
    space.set_particles(parts, Vec::new(), Vec::new());
    space.rebuild(0, 0).unwrap();
    assert_eq!(space.cdim, [3, 3, 3]);
    space
}

fn solo_ctx(space: Space) -> WorkerContext {
    WorkerContext {
        space: RwLock::new(space),
        sched: Scheduler::new(1, 0),
        transport: Arc::new(MemoryTransport::solo()),
        timeline: Timeline::new(0.0, 1.0, MAX_NR_TIMESTEPS, 0.0, 1.0),
        ti_current: AtomicI64::new(0),
        params: Default::default(),
        node_id: 0,
        mesh: Mutex::new(Default::default()),
    }
}

fn pair_sid(space: &Space, ci: CellId, cj: CellId) -> usize {
    let shift = space.periodic_shift(ci, cj);
    let a = &space.cells[ci.idx()];
    let b = &space.cells[cj.idx()];
    let eps = 0.25 * a.width[0];
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
    sort::sid_of_offset(off).0
}

/// Run all 26 pairs plus the self interaction on the centre cell and close
/// the density loop there.
fn interact_centre(ctx: &WorkerContext, sorted: bool) -> Vec<Part> {
    let space = ctx.space.read().unwrap();
    let main_cell = CellId(cell_getid(space.cdim, 1, 1, 1) as u32);

    for cid in 0..space.nr_top_cells {
        let cell = &space.cells[cid];
        let parts = unsafe { space.parts_of_mut(cell) };
        for p in parts {
            hydro::init_part(p);
        }
        if sorted {
            sort::do_sort(&space, CellId(cid as u32), 0x1FFF, 0);
        }
    }

    for cid in 0..space.nr_top_cells {
        let cj = CellId(cid as u32);
        if cj == main_cell {
            continue;
        }
        if sorted {
            let sid = pair_sid(&space, main_cell, cj);
            runner::dopair1_density(ctx, &space, main_cell, cj, sid, 0).unwrap();
        } else {
            runner::dopair_density_naive(&space, main_cell, cj, 0);
        }
    }
    runner::doself1_density(&space, main_cell, 0);

    let cell = &space.cells[main_cell.idx()];
    let parts = unsafe { space.parts_of_mut(cell) };
    for p in parts.iter_mut() {
        hydro::end_density(p);
    }
    parts.to_vec()
}

#[test]
fn rotating_field_recovers_density_and_curl() {
    let ctx = solo_ctx(lattice_space(Field::Rotating));
    let parts = interact_centre(&ctx, true);
    assert_eq!(parts.len(), N * N * N);

    let spacing = (SIZE / N as f64) as f32;
    let number_density = 1.0 / (spacing * spacing * spacing);
    for p in &parts {
        // Neighbour count within half a percent of the lattice target.
        let rel = (p.density.wcount - number_density).abs() / number_density;
        assert!(
            rel < 5e-3,
            "particle {}: wcount {} vs target {}",
            p.id,
            p.density.wcount,
            number_density
        );
        let rel_rho = (p.rho - RHO).abs() / RHO;
        assert!(rel_rho < 5e-3, "particle {}: rho {}", p.id, p.rho);

        // v = (y, -x, 0) is divergence-free with curl (0, 0, -2).
        assert!(p.density.div_v.abs() < 0.03, "div_v = {}", p.density.div_v);
        assert!(p.density.rot_v[0].abs() < 0.03);
        assert!(p.density.rot_v[1].abs() < 0.03);
        assert!(
            (p.density.rot_v[2] + 2.0).abs() < 0.05,
            "curl_z = {}",
            p.density.rot_v[2]
        );
    }
}

#[test]
fn divergent_field_recovers_divergence() {
    let ctx = solo_ctx(lattice_space(Field::Divergent));
    let parts = interact_centre(&ctx, true);
    for p in &parts {
        assert!(
            (p.density.div_v - 3.0).abs() < 0.05,
            "div_v = {}",
            p.density.div_v
        );
        assert!(p.density.rot_v[2].abs() < 0.03);
    }
}

/// The sorted sweep and the brute-force double loop see exactly the same
/// neighbours; only the summation order may differ.
#[test]
fn sorted_sweep_matches_brute_force() {
    let ctx = solo_ctx(lattice_space(Field::Rotating));
    let sorted = interact_centre(&ctx, true);
    let brute = interact_centre(&ctx, false);

    assert_eq!(sorted.len(), brute.len());
    for (a, b) in sorted.iter().zip(brute.iter()) {
        assert_eq!(a.id, b.id);
        let rel = (a.rho - b.rho).abs() / b.rho;
        assert!(rel < 1e-4, "particle {}: {} vs {}", a.id, a.rho, b.rho);
        let dw = (a.density.wcount - b.density.wcount).abs() / b.density.wcount;
        assert!(dw < 1e-4);
    }
}
