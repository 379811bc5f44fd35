//! Engine parameters: keyed sections loaded from a JSON file, validated in
//! full before any particle is touched.

use serde::{Deserialize, Serialize};
use std::fs;

use crate::error::{EngineError, Result};

/// Time-integration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeIntegration {
    /// Physical start time.
    pub time_begin: f64,
    /// Physical end time.
    pub time_end: f64,
    /// Smallest allowed physical step.
    pub dt_min: f64,
    /// Largest allowed physical step.
    pub dt_max: f64,
}

/// Snapshot section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshots {
    /// Time of the first snapshot.
    pub time_first: f64,
    /// Interval between snapshots.
    pub delta_time: f64,
    /// Base name of the snapshot files.
    #[serde(default = "default_snapshot_basename")]
    pub basename: String,
    /// Compression level handed to the sink (0 = none).
    #[serde(default)]
    pub compression: u32,
}

/// Scheduler section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerParams {
    /// Number of task queues; 0 means one per worker thread.
    #[serde(default)]
    pub nr_queues: usize,
}

/// Statistics section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    /// Interval between statistics lines.
    pub delta_time: f64,
    /// Energy statistics file.
    #[serde(default = "default_energy_file")]
    pub energy_file_name: String,
    /// Time-step log file.
    #[serde(default = "default_timestep_file")]
    pub timestep_file_name: String,
}

/// Space / cell-tree section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceParams {
    /// Target maximum particle count per leaf.
    #[serde(default = "default_split_size")]
    pub split_size: usize,
    /// Self tasks on cells above this count are split into their children.
    #[serde(default = "default_sub_size_self")]
    pub sub_size_self: usize,
    /// Pair tasks above this count product are split into child pairs.
    #[serde(default = "default_sub_size_pair")]
    pub sub_size_pair: usize,
    /// Safety stretch applied to the maximal smoothing length when choosing
    /// the top-grid cell width.
    #[serde(default = "default_stretch")]
    pub stretch: f64,
    /// Maximum displacement, in units of the smoothing length, before a
    /// rebuild is forced.
    #[serde(default = "default_max_rel_dx")]
    pub max_rel_dx: f64,
    /// Smallest allowed top-cell width.
    #[serde(default)]
    pub cell_min: f64,
    /// Growth margin applied when particle arrays are reallocated.
    #[serde(default = "default_parts_size_grow")]
    pub parts_size_grow: f64,
}

/// Repartitioning section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionParams {
    /// Repartition when `(max - min) / min` of the per-node CPU times
    /// exceeds this.
    #[serde(default = "default_fractional_time")]
    pub fractional_time: f64,
    /// Master switch.
    #[serde(default)]
    pub enabled: bool,
}

fn default_snapshot_basename() -> String {
    "snapshot".to_string()
}
fn default_energy_file() -> String {
    "energy.txt".to_string()
}
fn default_timestep_file() -> String {
    "timesteps.txt".to_string()
}
fn default_split_size() -> usize {
    400
}
fn default_sub_size_self() -> usize {
    32_000
}
fn default_sub_size_pair() -> usize {
    65_536
}
fn default_stretch() -> f64 {
    1.1
}
fn default_max_rel_dx() -> f64 {
    0.25
}
fn default_parts_size_grow() -> f64 {
    1.2
}
fn default_fractional_time() -> f64 {
    0.1
}

impl Default for SpaceParams {
    fn default() -> Self {
        SpaceParams {
            split_size: default_split_size(),
            sub_size_self: default_sub_size_self(),
            sub_size_pair: default_sub_size_pair(),
            stretch: default_stretch(),
            max_rel_dx: default_max_rel_dx(),
            cell_min: 0.0,
            parts_size_grow: default_parts_size_grow(),
        }
    }
}

impl Default for SchedulerParams {
    fn default() -> Self {
        SchedulerParams { nr_queues: 0 }
    }
}

impl Default for PartitionParams {
    fn default() -> Self {
        PartitionParams {
            fractional_time: default_fractional_time(),
            enabled: false,
        }
    }
}

/// The full parameter file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineParams {
    /// Time-integration section.
    pub time_integration: TimeIntegration,
    /// Snapshot section.
    pub snapshots: Snapshots,
    /// Scheduler section.
    #[serde(default)]
    pub scheduler: SchedulerParams,
    /// Statistics section.
    pub statistics: Statistics,
    /// Space section.
    #[serde(default)]
    pub space: SpaceParams,
    /// Repartitioning section.
    #[serde(default)]
    pub partition: PartitionParams,
    /// CFL safety factor for the hydro time-step.
    #[serde(default = "default_cfl")]
    pub cfl: f32,
}

fn default_cfl() -> f32 {
    0.1
}

impl EngineParams {
    /// Load parameters from a JSON file and validate them.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| EngineError::Io {
            path: path.to_string(),
            detail: e.to_string(),
        })?;
        let params: EngineParams =
            serde_json::from_str(&contents).map_err(|e| EngineError::Io {
                path: path.to_string(),
                detail: e.to_string(),
            })?;
        params.validate()?;
        Ok(params)
    }

    /// Check every section; the first violation is reported with its
    /// section-qualified key.
    pub fn validate(&self) -> Result<()> {
        let fail = |key: &str, detail: &str| {
            Err(EngineError::Parameter {
                key: key.to_string(),
                detail: detail.to_string(),
            })
        };

        if self.time_integration.time_end <= self.time_integration.time_begin {
            return fail("TimeIntegration:time_end", "must exceed time_begin");
        }
        if self.time_integration.dt_min < 0.0 {
            return fail("TimeIntegration:dt_min", "must be non-negative");
        }
        if self.time_integration.dt_max <= 0.0 {
            return fail("TimeIntegration:dt_max", "must be positive");
        }
        if self.time_integration.dt_min > self.time_integration.dt_max {
            return fail("TimeIntegration:dt_min", "must not exceed dt_max");
        }
        if self.snapshots.delta_time <= 0.0 {
            return fail("Snapshots:delta_time", "must be positive");
        }
        if self.statistics.delta_time <= 0.0 {
            return fail("Statistics:delta_time", "must be positive");
        }
        if self.space.split_size == 0 {
            return fail("Space:split_size", "must be at least 1");
        }
        if self.space.stretch < 1.0 {
            return fail("Space:stretch", "must be at least 1");
        }
        if self.space.max_rel_dx <= 0.0 {
            return fail("Space:max_rel_dx", "must be positive");
        }
        if self.space.parts_size_grow < 1.0 {
            return fail("Space:parts_size_grow", "must be at least 1");
        }
        if self.partition.fractional_time <= 0.0 {
            return fail("Partition:fractional_time", "must be positive");
        }
        if self.cfl <= 0.0 || self.cfl > 1.0 {
            return fail("cfl", "must lie in (0, 1]");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EngineParams {
        EngineParams {
            time_integration: TimeIntegration {
                time_begin: 0.0,
                time_end: 1.0,
                dt_min: 1e-10,
                dt_max: 1e-2,
            },
            snapshots: Snapshots {
                time_first: 0.0,
                delta_time: 0.1,
                basename: "snap".to_string(),
                compression: 0,
            },
            scheduler: SchedulerParams::default(),
            statistics: Statistics {
                delta_time: 0.05,
                energy_file_name: default_energy_file(),
                timestep_file_name: default_timestep_file(),
            },
            space: SpaceParams::default(),
            partition: PartitionParams::default(),
            cfl: 0.1,
        }
    }

    #[test]
    fn valid_params_pass() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn reversed_time_range_fails() {
        let mut p = valid();
        p.time_integration.time_end = -1.0;
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("TimeIntegration:time_end"));
    }

    #[test]
    fn bad_cfl_fails() {
        let mut p = valid();
        p.cfl = 0.0;
        assert!(p.validate().is_err());
        p.cfl = 1.5;
        assert!(p.validate().is_err());
    }

    #[test]
    fn json_round_trip() {
        let p = valid();
        let text = serde_json::to_string(&p).unwrap();
        let back: EngineParams = serde_json::from_str(&text).unwrap();
        assert!(back.validate().is_ok());
        assert_eq!(back.space.split_size, p.space.split_size);
    }
}
