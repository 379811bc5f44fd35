//! 27-cell benchmark driver.
//!
//! Builds a 3x3x3 block of top cells, each filled with `n^3` particles on a
//! perturbed Cartesian lattice, then interacts the centre cell against its
//! 26 neighbours plus itself through the sorted pair sweep and the direct
//! self loop. A brute-force pass over the same cells provides the accuracy
//! reference. Field dumps go to plain-text files for inspection.

use std::io::Write as _;
use std::process::ExitCode;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use clap::Parser;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use engine::cell::{cell_getid, CellId};
use engine::config::SpaceParams;
use engine::runner::{self, WorkerContext};
use engine::scheduler::Scheduler;
use engine::sort;
use engine::space::Space;
use engine::transport::MemoryTransport;
use kernel::hydro;
use kernel::kernels::WENDLAND_C2_NORM_3D;
use kernel::{Part, Timeline, MAX_NR_TIMESTEPS};

/// Velocity field applied to the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VelocityField {
    Zero,
    Random,
    Divergent,
    Rotating,
}

#[derive(Parser, Debug)]
#[command(
    name = "pair27",
    about = "Generates 27 cells of lattice particles and interacts the centre \
             cell with its neighbours through the density loop."
)]
struct Args {
    /// Particles per axis and cell.
    #[arg(short = 'n')]
    particles: usize,

    /// Number of timed repetitions.
    #[arg(short = 'r')]
    runs: usize,

    /// Smoothing length in units of the inter-particle separation.
    #[arg(short = 'H', long = "smoothing", default_value_t = 1.2348)]
    h: f64,

    /// Physical density in the cells.
    #[arg(short = 'm', default_value_t = 1.0)]
    rho: f64,

    /// Physical cell size.
    #[arg(short = 's', default_value_t = 1.0)]
    size: f64,

    /// Fractional lattice perturbation in [0, 1).
    #[arg(short = 'd', default_value_t = 0.0)]
    perturbation: f64,

    /// Velocity field: 0 zero, 1 random, 2 divergent, 3 rotating.
    #[arg(short = 'v', default_value_t = 0)]
    velocity: u32,

    /// Random fractional change in h, h *= uniform(1, 1+p).
    #[arg(short = 'p', default_value_t = 0.0)]
    h_pert: f64,

    /// Tag inserted into the output file names.
    #[arg(short = 'f', default_value = "")]
    tag: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };
    if args.particles == 0 || args.runs == 0 || args.h <= 0.0 {
        eprintln!(
            "Usage: pair27 -n PARTICLES_PER_AXIS -r RUNS [-H h] [-m rho] [-s size] \
             [-d pert] [-v 0|1|2|3] [-p h_pert] [-f tag]"
        );
        return ExitCode::from(1);
    }
    let vel = match args.velocity {
        0 => VelocityField::Zero,
        1 => VelocityField::Random,
        2 => VelocityField::Divergent,
        3 => VelocityField::Rotating,
        _ => {
            eprintln!("velocity field must be 0, 1, 2 or 3");
            return ExitCode::from(1);
        }
    };

    match run(&args, vel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::from(1)
        }
    }
}

fn run(args: &Args, vel: VelocityField) -> engine::Result<()> {
    let n = args.particles;
    let size = args.size;
    let spacing = size / n as f64;
    let h = (args.h * spacing) as f32;

    tracing::info!("smoothing length: h = {}", h);
    tracing::info!("kernel: Wendland C2, norm {}", WENDLAND_C2_NORM_3D);
    tracing::info!(
        "neighbour target: N = {:.3}",
        4.0 / 3.0 * std::f64::consts::PI * (2.0 * args.h).powi(3)
    );
    tracing::info!("density target: rho = {}", args.rho);
    tracing::info!(
        "div_v target: {}",
        if vel == VelocityField::Divergent { 3.0 } else { 0.0 }
    );
    tracing::info!(
        "curl_v target: [0, 0, {}]",
        if vel == VelocityField::Rotating { -2.0 } else { 0.0 }
    );

    // A 3x3x3 top grid holding the lattice.
    let mut params = SpaceParams::default();
    params.cell_min = size;
    params.split_size = usize::MAX;
    let mut space = Space::new([3.0 * size; 3], true, params);
    space.set_particles(
        make_lattice(args, vel, n, size, spacing, h),
        Vec::new(),
        Vec::new(),
    );
    space.rebuild(0, 0)?;
    if space.cdim != [3, 3, 3] {
        return Err(engine::EngineError::InvariantViolation {
            node: 0,
            location: "pair27",
            detail: format!("expected a 3x3x3 grid, got {:?}", space.cdim),
        });
    }

    let ctx = WorkerContext {
        space: RwLock::new(space),
        sched: Scheduler::new(1, 0),
        transport: Arc::new(MemoryTransport::solo()),
        timeline: Timeline::new(0.0, 1.0, MAX_NR_TIMESTEPS, 0.0, 1.0),
        ti_current: AtomicI64::new(0),
        params: Default::default(),
        node_id: 0,
        mesh: Mutex::new(Default::default()),
    };
    let space = ctx.space.read().unwrap();
    let main_cell = CellId(cell_getid(space.cdim, 1, 1, 1) as u32);

    // Sort every cell along all thirteen axes, as the pair sweep expects.
    for cid in 0..space.nr_top_cells {
        sort::do_sort(&space, CellId(cid as u32), 0x1FFF, 0);
    }

    let neighbours: Vec<CellId> = (0..space.nr_top_cells)
        .map(|c| CellId(c as u32))
        .filter(|&c| c != main_cell)
        .collect();

    let mut pair_time = 0.0_f64;
    let mut self_time = 0.0_f64;
    for run in 0..args.runs {
        zero_fields(&space);

        for &cj in &neighbours {
            let sid = pair_sid(&space, main_cell, cj);
            let tic = Instant::now();
            runner::dopair1_density(&ctx, &space, main_cell, cj, sid, 0)?;
            pair_time += tic.elapsed().as_secs_f64();
        }
        let tic = Instant::now();
        runner::doself1_density(&space, main_cell, 0);
        self_time += tic.elapsed().as_secs_f64();

        end_calculation(&space, main_cell);

        if run == 0 {
            dump_fields(&space, main_cell, &dump_name("dopair_27", &args.tag))?;
        }
    }
    tracing::info!(
        "pair sweeps: {:.3} ms/run, self loop: {:.3} ms/run",
        pair_time / args.runs as f64 * 1e3,
        self_time / args.runs as f64 * 1e3
    );

    // Brute force for the accuracy reference.
    zero_fields(&space);
    let tic = Instant::now();
    for &cj in &neighbours {
        runner::dopair_density_naive(&space, main_cell, cj, 0);
    }
    runner::doself1_density(&space, main_cell, 0);
    end_calculation(&space, main_cell);
    tracing::info!(
        "brute force reference: {:.3} ms",
        tic.elapsed().as_secs_f64() * 1e3
    );
    dump_fields(&space, main_cell, &dump_name("brute_force_27", &args.tag))?;

    Ok(())
}

fn dump_name(base: &str, tag: &str) -> String {
    if tag.is_empty() {
        format!("{base}.dat")
    } else {
        format!("{base}_{tag}.dat")
    }
}

fn make_lattice(
    args: &Args,
    vel: VelocityField,
    n: usize,
    size: f64,
    spacing: f64,
    h: f32,
) -> Vec<Part> {
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let mass = (args.rho * spacing * spacing * spacing) as f32;
    let mut parts = Vec::with_capacity(27 * n * n * n);
    let mut id = 0u64;
    for ci in 0..3 {
        for cj in 0..3 {
            for ck in 0..3 {
                let offset = [ci as f64 * size, cj as f64 * size, ck as f64 * size];
                for x in 0..n {
                    for y in 0..n {
                        for z in 0..n {
                            let pert = |rng: &mut ChaCha8Rng| {
                                rng.gen_range(-0.5..0.5) * args.perturbation
                            };
                            let pos = [
                                offset[0] + (x as f64 + 0.5 + pert(&mut rng)) * spacing,
                                offset[1] + (y as f64 + 0.5 + pert(&mut rng)) * spacing,
                                offset[2] + (z as f64 + 0.5 + pert(&mut rng)) * spacing,
                            ];
                            let mut h_i = h;
                            if args.h_pert > 0.0 {
                                h_i *= rng.gen_range(1.0..1.0 + args.h_pert) as f32;
                            }
                            id += 1;
                            let mut p = Part::new(pos, h_i, mass, id);
                            p.v = match vel {
                                VelocityField::Zero => [0.0; 3],
                                VelocityField::Random => [
                                    rng.gen_range(-0.05..0.05),
                                    rng.gen_range(-0.05..0.05),
                                    rng.gen_range(-0.05..0.05),
                                ],
                                VelocityField::Divergent => [
                                    (pos[0] - 1.5 * size) as f32,
                                    (pos[1] - 1.5 * size) as f32,
                                    (pos[2] - 1.5 * size) as f32,
                                ],
                                VelocityField::Rotating => {
                                    [pos[1] as f32, -pos[0] as f32, 0.0]
                                }
                            };
                            parts.push(p);
                        }
                    }
                }
            }
        }
    }
    parts
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

fn zero_fields(space: &Space) {
    for cid in 0..space.nr_top_cells {
        let cell = &space.cells[cid];
        let parts = unsafe { space.parts_of_mut(cell) };
        for p in parts {
            hydro::init_part(p);
        }
    }
}

fn end_calculation(space: &Space, main_cell: CellId) {
    let cell = &space.cells[main_cell.idx()];
    let parts = unsafe { space.parts_of_mut(cell) };
    for p in parts {
        hydro::end_density(p);
    }
}

fn dump_fields(space: &Space, main_cell: CellId, path: &str) -> engine::Result<()> {
    let cell = &space.cells[main_cell.idx()];
    let parts = unsafe { space.parts_of(cell) };
    let mut out = String::new();
    out.push_str(
        "# id pos_x pos_y pos_z v_x v_y v_z rho wcount div_v curl_x curl_y curl_z\n",
    );
    for p in parts {
        out.push_str(&format!(
            "{:6} {:10.6} {:10.6} {:10.6} {:10.6} {:10.6} {:10.6} {:13.6e} {:13.6e} \
             {:13.6e} {:13.6e} {:13.6e} {:13.6e}\n",
            p.id,
            p.x[0],
            p.x[1],
            p.x[2],
            p.v[0],
            p.v[1],
            p.v[2],
            p.rho,
            p.density.wcount,
            p.density.div_v,
            p.density.rot_v[0],
            p.density.rot_v[1],
            p.density.rot_v[2],
        ));
    }
    let mut f = std::fs::File::create(path).map_err(|e| engine::EngineError::Io {
        path: path.to_string(),
        detail: e.to_string(),
    })?;
    f.write_all(out.as_bytes())
        .map_err(|e| engine::EngineError::Io {
            path: path.to_string(),
            detail: e.to_string(),
        })
}
