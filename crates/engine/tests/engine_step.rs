//! End-to-end single-node run: a warm gas lattice stepped through the full
//! collect/prepare/launch cycle for several steps.

use std::sync::Arc;

use engine::config::{
    EngineParams, PartitionParams, SchedulerParams, Snapshots, SpaceParams, Statistics,
    TimeIntegration,
};
use engine::engine::{Engine, EnginePolicy, NullSink};
use engine::graph::GraphPolicy;
use engine::partition::WeightedSlabPartitioner;
use engine::runner::RunnerParams;
use engine::space::Space;
use engine::transport::MemoryTransport;
use kernel::Part;

fn params() -> EngineParams {
    EngineParams {
        time_integration: TimeIntegration {
            time_begin: 0.0,
            time_end: 1.0,
            dt_min: 0.0,
            dt_max: 1.0 / 64.0,
        },
        snapshots: Snapshots {
            time_first: 2.0,
            delta_time: 1.0,
            basename: String::new(),
            compression: 0,
        },
        scheduler: SchedulerParams { nr_queues: 2 },
        statistics: Statistics {
            delta_time: 100.0,
            energy_file_name: String::new(),
            timestep_file_name: String::new(),
        },
        space: SpaceParams::default(),
        partition: PartitionParams::default(),
        cfl: 0.1,
    }
}

fn warm_lattice() -> Space {
    let n = 12usize;
    let spacing = 1.0 / n as f64;
    let h = (1.2348 * spacing) as f32;
    let mass = (spacing * spacing * spacing) as f32; // rho = 1
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
                h,
                mass,
                i as u64,
            )
        })
        .collect();

    let mut space = Space::new([1.0; 3], false, SpaceParams::default());
    space.set_particles(parts, Vec::new(), Vec::new());
    // A little internal energy so the gas has pressure and sound speed.
    for xp in space.xparts.get_mut().iter_mut() {
        xp.u_full = 1.0e-3;
    }
    space
}

#[test]
fn several_steps_conserve_particles_and_advance_time() {
    let policy = EnginePolicy {
        graph: GraphPolicy {
            hydro: true,
            ..Default::default()
        },
        runner: RunnerParams::default(),
        nr_threads: 2,
        pin_threads: false,
        drift_all: false,
    };
    let mut engine = Engine::new(
        warm_lattice(),
        params(),
        policy,
        Arc::new(MemoryTransport::solo()),
        Box::new(WeightedSlabPartitioner),
        Box::new(NullSink),
    )
    .unwrap();

    engine.init_particles().unwrap();

    {
        // The initial density pass must have produced sensible densities.
        let mut space = engine.ctx.space.write().unwrap();
        let n = space.nr_parts();
        assert_eq!(n, 12 * 12 * 12);
        let interior = space
            .parts
            .get_mut()
            .iter()
            .filter(|p| p.x.iter().all(|&c| c > 0.25 && c < 0.75))
            .map(|p| p.rho)
            .collect::<Vec<_>>();
        assert!(!interior.is_empty());
        for rho in interior {
            assert!((rho - 1.0).abs() < 0.05, "interior density {}", rho);
        }
        space.verify_linkage(0).unwrap();
    }

    let mut last_time = 0.0;
    for _ in 0..5 {
        let info = engine.step().unwrap();
        assert!(info.time > last_time, "time must advance monotonically");
        assert!(info.dt > 0.0);
        assert!(info.updates > 0, "active particles must be updated");
        last_time = info.time;
    }

    {
        let mut space = engine.ctx.space.write().unwrap();
        assert_eq!(space.nr_parts(), 12 * 12 * 12);
        space.verify_linkage(0).unwrap();
        // Positions stayed inside the box (open boundaries clamp).
        for p in space.parts.get_mut().iter() {
            for k in 0..3 {
                assert!(p.x[k] >= 0.0 && p.x[k] <= 1.0);
            }
        }
    }
}

#[test]
fn snapshot_schedule_fires() {
    let mut prm = params();
    prm.snapshots.time_first = 0.02;
    prm.snapshots.delta_time = 0.02;

    struct CountingSink(std::sync::Arc<std::sync::atomic::AtomicUsize>);
    impl engine::engine::SnapshotSink for CountingSink {
        fn dump(
            &mut self,
            _space: &Space,
            _time: f64,
            _step: u64,
        ) -> engine::Result<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
    }

    let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let policy = EnginePolicy {
        graph: GraphPolicy {
            hydro: true,
            ..Default::default()
        },
        runner: RunnerParams::default(),
        nr_threads: 2,
        pin_threads: false,
        drift_all: false,
    };
    let mut engine = Engine::new(
        warm_lattice(),
        prm,
        policy,
        Arc::new(MemoryTransport::solo()),
        Box::new(WeightedSlabPartitioner),
        Box::new(CountingSink(std::sync::Arc::clone(&count))),
    )
    .unwrap();

    engine.init_particles().unwrap();
    for _ in 0..4 {
        engine.step().unwrap();
    }
    assert!(
        count.load(std::sync::atomic::Ordering::Relaxed) >= 1,
        "at least one snapshot must have been dumped"
    );
}
