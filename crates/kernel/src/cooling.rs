//! Radiative cooling and source-term particle updates.
//!
//! Both follow a simple parameterised law; the scheduler only cares that they
//! mutate particles of one cell and nothing else.

use crate::hydro::GAMMA_MINUS_ONE;
use crate::part::{Part, XPart};

/// Cooling-law parameters.
#[derive(Debug, Clone, Copy)]
pub struct CoolingParams {
    /// Inverse cooling time-scale.
    pub lambda: f32,
    /// Floor on the internal energy.
    pub min_energy: f32,
}

/// Cool one particle over `dt`: exponential decay of the internal energy
/// towards the floor.
pub fn cool_part(p: &mut Part, xp: &mut XPart, params: &CoolingParams, dt: f32) {
    let decay = (-params.lambda * dt).exp();
    xp.u_full = params.min_energy + (xp.u_full - params.min_energy) * decay;
    if p.rho > 0.0 {
        p.entropy = GAMMA_MINUS_ONE * xp.u_full / p.rho.powf(GAMMA_MINUS_ONE);
    }
}

/// Source-term parameters: a constant specific-energy injection rate.
#[derive(Debug, Clone, Copy)]
pub struct SourceTermParams {
    /// Specific energy injected per unit time.
    pub energy_rate: f32,
}

/// Inject energy into one particle over `dt`.
pub fn apply_source_terms(p: &mut Part, xp: &mut XPart, params: &SourceTermParams, dt: f32) {
    xp.u_full += params.energy_rate * dt;
    if p.rho > 0.0 {
        p.entropy = GAMMA_MINUS_ONE * xp.u_full / p.rho.powf(GAMMA_MINUS_ONE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cooling_decays_towards_floor() {
        let mut p = Part::new([0.0; 3], 0.1, 1.0, 0);
        p.rho = 1.0;
        let mut xp = XPart {
            u_full: 10.0,
            ..Default::default()
        };
        let params = CoolingParams {
            lambda: 1.0,
            min_energy: 1.0,
        };
        cool_part(&mut p, &mut xp, &params, 1.0);
        assert!(xp.u_full < 10.0);
        assert!(xp.u_full > 1.0);
        // Long cooling reaches the floor.
        cool_part(&mut p, &mut xp, &params, 100.0);
        assert_relative_eq!(xp.u_full, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn source_terms_heat() {
        let mut p = Part::new([0.0; 3], 0.1, 1.0, 0);
        p.rho = 1.0;
        let mut xp = XPart {
            u_full: 1.0,
            ..Default::default()
        };
        let params = SourceTermParams { energy_rate: 0.5 };
        apply_source_terms(&mut p, &mut xp, &params, 2.0);
        assert_relative_eq!(xp.u_full, 2.0);
        assert!(p.entropy > 0.0);
    }
}
