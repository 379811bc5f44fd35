//! The integer timeline.
//!
//! Simulation time is a 64-bit integer tick count over `[0, max_nr_timesteps]`
//! mapped linearly onto `[time_begin, time_end]`. All scheduling decisions
//! compare ticks exactly; floating-point time exists only for output and for
//! closing the physics. A particle in time bin `b` advances by `1 << b` ticks
//! per step, and its step must start on a multiple of its own length.

/// Integer simulation time (ticks).
pub type IntegerTime = i64;

/// Number of usable time bins.
pub const NUM_TIME_BINS: u32 = 56;

/// Default length of the integer timeline.
pub const MAX_NR_TIMESTEPS: IntegerTime = 1 << NUM_TIME_BINS;

/// The mapping between ticks and physical time, plus step-size policy.
#[derive(Debug, Clone, Copy)]
pub struct Timeline {
    /// Physical time at tick 0.
    pub time_begin: f64,
    /// Physical time at the last tick.
    pub time_end: f64,
    /// Number of ticks on the timeline.
    pub max_nr_timesteps: IntegerTime,
    /// Physical duration of one tick.
    pub time_base: f64,
    /// Inverse of `time_base`.
    pub time_base_inv: f64,
    /// Smallest allowed physical step.
    pub dt_min: f64,
    /// Largest allowed physical step.
    pub dt_max: f64,
}

impl Timeline {
    /// Build a timeline over `[time_begin, time_end]` with the given tick
    /// count and step bounds.
    pub fn new(
        time_begin: f64,
        time_end: f64,
        max_nr_timesteps: IntegerTime,
        dt_min: f64,
        dt_max: f64,
    ) -> Self {
        debug_assert!(time_end > time_begin);
        debug_assert!(max_nr_timesteps > 0);
        let time_base = (time_end - time_begin) / max_nr_timesteps as f64;
        Timeline {
            time_begin,
            time_end,
            max_nr_timesteps,
            time_base,
            time_base_inv: 1.0 / time_base,
            dt_min,
            dt_max,
        }
    }

    /// Physical time of an integer tick.
    #[inline]
    pub fn time_of(&self, ti: IntegerTime) -> f64 {
        self.time_begin + ti as f64 * self.time_base
    }

    /// Integer tick of a physical time, rounded down to the grid.
    #[inline]
    pub fn tick_of(&self, t: f64) -> IntegerTime {
        ((t - self.time_begin) * self.time_base_inv) as IntegerTime
    }

    /// Physical duration of `dti` ticks.
    #[inline]
    pub fn dt_of(&self, dti: IntegerTime) -> f64 {
        dti as f64 * self.time_base
    }

    /// Convert a desired physical timestep into an integer step length:
    /// the largest power-of-two tick count not exceeding the request,
    /// clamped to `[dt_min, dt_max]`, and aligned so the step starts on a
    /// multiple of its own length.
    pub fn integer_timestep(&self, dt_wanted: f64, ti_current: IntegerTime) -> IntegerTime {
        let dt = dt_wanted.clamp(self.dt_min, self.dt_max);
        let mut dti = (dt * self.time_base_inv) as IntegerTime;
        dti = dti.min(self.max_nr_timesteps);
        if dti < 1 {
            dti = 1;
        }
        // Round down to a power of two.
        dti = 1 << (63 - dti.leading_zeros() as IntegerTime);
        // A step of length 2^b must start on a multiple of 2^b.
        while dti > 1 && ti_current % dti != 0 {
            dti >>= 1;
        }
        dti
    }

    /// The time bin of an integer step length.
    #[inline]
    pub fn bin_of(dti: IntegerTime) -> i8 {
        debug_assert!(dti > 0);
        (63 - dti.leading_zeros()) as i8
    }

    /// The integer step length of a time bin.
    #[inline]
    pub fn step_of(bin: i8) -> IntegerTime {
        1 << bin
    }
}

/// The largest bin whose steps can begin at `ti_current`: a particle is
/// active iff its bin is at most this.
#[inline]
pub fn max_active_bin(ti_current: IntegerTime) -> i8 {
    if ti_current == 0 {
        NUM_TIME_BINS as i8
    } else {
        (ti_current.trailing_zeros().min(NUM_TIME_BINS) as i8)
    }
}

/// End of the step a particle in `bin` is on at `ti_current`: the next
/// multiple of its step length strictly after `ti_current`.
#[inline]
pub fn ti_end_for(bin: i8, ti_current: IntegerTime) -> IntegerTime {
    let dti = Timeline::step_of(bin);
    ti_current - ti_current.rem_euclid(dti) + dti
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_on_the_grid() {
        // t_begin = 0, t_end = 1, 2^28 steps: every grid point survives the
        // float -> tick -> float round trip.
        let tl = Timeline::new(0.0, 1.0, 1 << 28, 0.0, 1.0);
        assert_eq!(tl.time_base * tl.max_nr_timesteps as f64, 1.0);
        for ti in [0_i64, 1, 7, 1 << 14, (1 << 28) - 1, 1 << 28] {
            let t = tl.time_of(ti);
            assert_eq!(tl.tick_of(t), ti);
        }
    }

    #[test]
    fn bin_step_inverse() {
        for bin in 0..NUM_TIME_BINS as i8 {
            assert_eq!(Timeline::bin_of(Timeline::step_of(bin)), bin);
        }
    }

    #[test]
    fn integer_timestep_is_power_of_two() {
        let tl = Timeline::new(0.0, 1.0, MAX_NR_TIMESTEPS, 1e-12, 1e-2);
        let dti = tl.integer_timestep(3.7e-4, 0);
        assert!(dti > 0);
        assert_eq!(dti & (dti - 1), 0);
        assert!(tl.dt_of(dti) <= 1e-2 + 1e-15);
    }

    #[test]
    fn integer_timestep_aligns_to_current_time() {
        let tl = Timeline::new(0.0, 1.0, MAX_NR_TIMESTEPS, 0.0, 1.0);
        // At an odd tick only a step of one tick is allowed.
        assert_eq!(tl.integer_timestep(0.5, 12345), 1);
        // At a multiple of 8, a step of 8 is allowed.
        let dti = tl.integer_timestep(tl.dt_of(8), 16);
        assert_eq!(dti, 8);
    }

    #[test]
    fn active_bins_follow_trailing_zeros() {
        assert_eq!(max_active_bin(0), NUM_TIME_BINS as i8);
        assert_eq!(max_active_bin(1), 0);
        assert_eq!(max_active_bin(8), 3);
        assert_eq!(max_active_bin(12), 2);
    }

    /// After a timestep at `ti_current`, a particle rebinned to `b` ends no
    /// earlier than `ti_current + (1 << b)`.
    #[test]
    fn step_end_is_monotonic() {
        for bin in 0..8i8 {
            for ti in [0i64, 5, 8, 13, 64] {
                let end = ti_end_for(bin, ti);
                assert!(end > ti);
                assert_eq!(end.rem_euclid(Timeline::step_of(bin)), 0);
                if ti.rem_euclid(Timeline::step_of(bin)) == 0 {
                    assert_eq!(end, ti + Timeline::step_of(bin));
                }
            }
        }
    }

    #[test]
    fn timestep_clamped_by_dt_max() {
        let tl = Timeline::new(0.0, 1.0, MAX_NR_TIMESTEPS, 0.0, 1e-6);
        let dti = tl.integer_timestep(1.0, 0);
        assert!(tl.dt_of(dti) <= 1e-6);
    }
}
