//! Particle storage types: gas, extended gas state, gravity and star records.
//!
//! The arrays themselves are owned by the engine's `Space`; everything here is
//! plain data. Gas and star particles carry an optional index into the gravity
//! array, and every gravity record identifies its partner through
//! [`PartnerRef`], which must stay consistent across sorts, exchanges and
//! reallocations (see [`PartnerRef`] for the exact invariant).

use serde::{Deserialize, Serialize};

/// Time-bin type: a particle in bin `b` advances by `1 << b` integer ticks
/// per step.
pub type TimeBin = i8;

/// Identifies the partner of a gravity record.
///
/// Dark-matter records carry their own (non-negative) id. Gas and star
/// records carry the index of the partner particle in the node-local gas or
/// star array. The linkage invariant is: for a gas particle at index `i`
/// with `gpart == Some(j)`, `gparts[j].partner == PartnerRef::Gas(i)`, and
/// symmetrically for stars. Every operation that permutes or moves particle
/// arrays must restore this before anything else observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartnerRef {
    /// A dark-matter particle carrying its own unique id.
    DarkMatter(i64),
    /// Partner is the gas particle at this index in the local gas array.
    Gas(u32),
    /// Partner is the star particle at this index in the local star array.
    Star(u32),
}

impl PartnerRef {
    /// True if this record belongs to a dark-matter particle.
    pub fn is_dark_matter(&self) -> bool {
        matches!(self, PartnerRef::DarkMatter(_))
    }
}

/// Density-loop accumulators, reset by `hydro::init_part` and finalised by
/// `hydro::end_density` once all neighbour contributions are in.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DensityAccum {
    /// Neighbour number-density estimate (sum of kernel weights).
    pub wcount: f32,
    /// Derivative of `wcount` with respect to the smoothing length.
    pub wcount_dh: f32,
    /// Derivative of the density with respect to the smoothing length.
    pub rho_dh: f32,
    /// Velocity divergence estimate (unnormalised until `end_density`).
    pub div_v: f32,
    /// Velocity curl estimate (unnormalised until `end_density`).
    pub rot_v: [f32; 3],
}

/// Force-loop accumulators and signal velocity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ForceAccum {
    /// Maximum signal velocity over all interactions this step.
    pub v_sig: f32,
    /// Rate of change of the entropy function.
    pub entropy_dt: f32,
    /// Rate of change of the smoothing length.
    pub h_dt: f32,
}

/// A gas particle.
///
/// Positions are double precision; everything else lives in single precision,
/// packed for the hot loops. Slowly-varying companion state goes in
/// [`XPart`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    /// Position.
    pub x: [f64; 3],
    /// Velocity.
    pub v: [f32; 3],
    /// Hydrodynamic acceleration.
    pub a_hydro: [f32; 3],
    /// Smoothing length.
    pub h: f32,
    /// Mass.
    pub mass: f32,
    /// Density.
    pub rho: f32,
    /// Entropy function A in P = A rho^gamma.
    pub entropy: f32,
    /// Density-loop accumulators.
    pub density: DensityAccum,
    /// Force-loop accumulators.
    pub force: ForceAccum,
    /// Current time bin.
    pub time_bin: TimeBin,
    /// Unique particle id.
    pub id: u64,
    /// Index of the gravity record carrying this particle, if any.
    pub gpart: Option<u32>,
}

impl Part {
    /// A gas particle at rest at `x` with the given smoothing length and mass.
    pub fn new(x: [f64; 3], h: f32, mass: f32, id: u64) -> Self {
        Part {
            x,
            v: [0.0; 3],
            a_hydro: [0.0; 3],
            h,
            mass,
            rho: 0.0,
            entropy: 0.0,
            density: DensityAccum::default(),
            force: ForceAccum::default(),
            time_bin: 0,
            id,
            gpart: None,
        }
    }
}

/// Extended gas-particle state, kept in a parallel array so the density and
/// force loops touch only [`Part`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XPart {
    /// Displacement accumulated since the last rebuild.
    pub x_diff: [f32; 3],
    /// Displacement accumulated since the cell was last sorted.
    pub x_diff_sort: [f32; 3],
    /// Full-step velocity (the kick operates on half steps).
    pub v_full: [f32; 3],
    /// Internal energy carried between the kick and the entropy update.
    pub u_full: f32,
}

/// A gravity particle. Dark matter exists only as this record; gas and star
/// particles own exactly one each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GPart {
    /// Position.
    pub x: [f64; 3],
    /// Full-step velocity.
    pub v_full: [f32; 3],
    /// Gravitational acceleration.
    pub a_grav: [f32; 3],
    /// Mass.
    pub mass: f32,
    /// Current time bin.
    pub time_bin: TimeBin,
    /// What this record carries.
    pub partner: PartnerRef,
}

impl GPart {
    /// A dark-matter record with the given id.
    pub fn dark_matter(x: [f64; 3], mass: f32, id: i64) -> Self {
        GPart {
            x,
            v_full: [0.0; 3],
            a_grav: [0.0; 3],
            mass,
            time_bin: 0,
            partner: PartnerRef::DarkMatter(id),
        }
    }
}

/// A star particle: positions and feedback state, no hydro fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SPart {
    /// Position.
    pub x: [f64; 3],
    /// Velocity.
    pub v: [f32; 3],
    /// Mass.
    pub mass: f32,
    /// Feedback search radius.
    pub h: f32,
    /// Current time bin.
    pub time_bin: TimeBin,
    /// Unique particle id.
    pub id: u64,
    /// Index of the gravity record carrying this particle, if any.
    pub gpart: Option<u32>,
}

impl SPart {
    /// A star particle at rest at `x`.
    pub fn new(x: [f64; 3], mass: f32, id: u64) -> Self {
        SPart {
            x,
            v: [0.0; 3],
            mass,
            h: 0.0,
            time_bin: 0,
            id,
            gpart: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partner_ref_kinds() {
        assert!(PartnerRef::DarkMatter(42).is_dark_matter());
        assert!(!PartnerRef::Gas(0).is_dark_matter());
        assert!(!PartnerRef::Star(7).is_dark_matter());
    }

    #[test]
    fn new_part_is_at_rest() {
        let p = Part::new([0.5, 0.5, 0.5], 0.1, 1.0, 99);
        assert_eq!(p.v, [0.0; 3]);
        assert_eq!(p.a_hydro, [0.0; 3]);
        assert_eq!(p.id, 99);
        assert!(p.gpart.is_none());
        assert_eq!(p.time_bin, 0);
    }
}
