//! Cell-to-node partitioning.
//!
//! The engine is agnostic to the partitioning algorithm: it hands the
//! current space and task list to a [`Partitioner`] and gets back a new
//! top-cell ownership map. A weight-balancing slab partitioner is provided
//! as the default.

use crate::cell::cell_getid;
use crate::space::Space;
use crate::task::Task;

/// The black box deciding which node owns which top cell.
pub trait Partitioner: Send + Sync {
    /// Produce a new owner per top cell.
    fn repartition(&self, nr_nodes: usize, space: &Space, tasks: &[Task]) -> Vec<usize>;
}

/// Slabs along the x-axis, cut so each node carries roughly the same task
/// weight.
#[derive(Debug, Default)]
pub struct WeightedSlabPartitioner;

impl Partitioner for WeightedSlabPartitioner {
    fn repartition(&self, nr_nodes: usize, space: &Space, tasks: &[Task]) -> Vec<usize> {
        let nr_top = space.nr_top_cells;
        if nr_nodes <= 1 || nr_top == 0 {
            return vec![0; nr_top];
        }

        // Weight per top cell from the tasks that touch it; fall back to
        // particle counts when the graph is empty.
        let mut weights = vec![0i64; nr_top];
        for t in tasks {
            for cid in [t.ci, t.cj].into_iter().flatten() {
                if cid.idx() < nr_top {
                    weights[cid.idx()] += t.cost.max(1);
                }
            }
        }
        if weights.iter().all(|&w| w == 0) {
            for (cid, w) in weights.iter_mut().enumerate() {
                *w = (space.cells[cid].total_count() + 1) as i64;
            }
        }

        // Aggregate per x-slice, then cut the slices into contiguous slabs
        // of roughly equal weight.
        let cdim = space.cdim;
        let mut slice_weight = vec![0i64; cdim[0] as usize];
        for i in 0..cdim[0] {
            for j in 0..cdim[1] {
                for k in 0..cdim[2] {
                    slice_weight[i as usize] += weights[cell_getid(cdim, i, j, k)];
                }
            }
        }
        let total: i64 = slice_weight.iter().sum();
        let per_node = (total / nr_nodes as i64).max(1);

        let mut slab_of_slice = vec![0usize; cdim[0] as usize];
        let mut acc = 0i64;
        let mut node = 0usize;
        for (i, &w) in slice_weight.iter().enumerate() {
            // Keep at least one slice per remaining node.
            let slices_left = slice_weight.len() - i;
            let nodes_left = nr_nodes - node;
            if acc >= per_node && node + 1 < nr_nodes && slices_left >= nodes_left {
                node += 1;
                acc = 0;
            }
            slab_of_slice[i] = node;
            acc += w;
        }

        let mut map = vec![0usize; nr_top];
        for i in 0..cdim[0] {
            for j in 0..cdim[1] {
                for k in 0..cdim[2] {
                    map[cell_getid(cdim, i, j, k)] = slab_of_slice[i as usize];
                }
            }
        }
        map
    }
}

/// Does the spread of per-node CPU times call for a repartition?
pub fn needs_rebalance(elapsed: &[f64], fractional_time: f64) -> bool {
    if elapsed.len() < 2 {
        return false;
    }
    let min = elapsed.iter().cloned().fold(f64::MAX, f64::min);
    let max = elapsed.iter().cloned().fold(0.0_f64, f64::max);
    if min <= 0.0 {
        return false;
    }
    (max - min) / min > fractional_time
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpaceParams;
    use kernel::Part;

    fn grid_space(n_per_axis: usize) -> Space {
        let mut params = SpaceParams::default();
        params.cell_min = 0.25;
        let mut space = Space::new([1.0; 3], false, params);
        let spacing = 1.0 / n_per_axis as f64;
        let parts: Vec<Part> = (0..n_per_axis * n_per_axis * n_per_axis)
            .map(|i| {
                let x = (i / (n_per_axis * n_per_axis)) as f64;
                let y = ((i / n_per_axis) % n_per_axis) as f64;
                let z = (i % n_per_axis) as f64;
                Part::new(
                    [
                        (x + 0.5) * spacing,
                        (y + 0.5) * spacing,
                        (z + 0.5) * spacing,
                    ],
                    0.1,
                    1.0,
                    i as u64,
                )
            })
            .collect();
        space.set_particles(parts, Vec::new(), Vec::new());
        space.rebuild(0, 0).unwrap();
        space
    }

    #[test]
    fn single_node_gets_everything() {
        let space = grid_space(8);
        let map = WeightedSlabPartitioner.repartition(1, &space, &[]);
        assert!(map.iter().all(|&n| n == 0));
    }

    #[test]
    fn slabs_cover_all_nodes() {
        let space = grid_space(8);
        let map = WeightedSlabPartitioner.repartition(4, &space, &[]);
        assert_eq!(map.len(), space.nr_top_cells);
        for node in 0..4 {
            assert!(map.iter().any(|&n| n == node), "node {} got no cells", node);
        }
        // Slabs are contiguous in x: the owner never decreases with x.
        let cdim = space.cdim;
        for i in 0..cdim[0] - 1 {
            let a = map[cell_getid(cdim, i, 0, 0)];
            let b = map[cell_getid(cdim, i + 1, 0, 0)];
            assert!(b >= a);
        }
    }

    #[test]
    fn rebalance_thresholds() {
        assert!(!needs_rebalance(&[1.0, 1.05], 0.1));
        assert!(needs_rebalance(&[1.0, 1.3], 0.1));
        assert!(!needs_rebalance(&[1.0], 0.1));
        assert!(!needs_rebalance(&[0.0, 1.0], 0.1));
    }
}
