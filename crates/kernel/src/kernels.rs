//! SPH smoothing kernel functions.
//!
//! The Wendland C2 kernel with support radius `2h` is used throughout: it is
//! strictly positive and free of the tensile pairing instability of the cubic
//! spline.

use std::f32::consts::PI;

/// Normalization constant for the 3D Wendland C2 kernel: 21 / (16 pi).
pub const WENDLAND_C2_NORM_3D: f32 = 21.0 / (16.0 * PI);

/// Wendland C2 smoothing kernel in 3D.
///
/// ```text
/// W(r, h) = (21 / (16 pi h^3)) * (1 - q/2)^4 * (1 + 2q)   for q = r/h <= 2
/// W(r, h) = 0                                             for q > 2
/// ```
#[inline]
pub fn wendland_c2(r: f32, h: f32) -> f32 {
    let q = r / h;
    if q >= 2.0 {
        return 0.0;
    }
    let h3 = h * h * h;
    let t = 1.0 - 0.5 * q;
    let t2 = t * t;
    WENDLAND_C2_NORM_3D / h3 * t2 * t2 * (1.0 + 2.0 * q)
}

/// Kernel value and radial derivative, evaluated together.
///
/// Returns `(W, dW/dr)`. The radial derivative is
/// `dW/dr = (21 / (16 pi h^4)) * (-5 q) * (1 - q/2)^3`.
#[inline]
pub fn wendland_c2_deval(r: f32, h: f32) -> (f32, f32) {
    let q = r / h;
    if q >= 2.0 {
        return (0.0, 0.0);
    }
    let h3 = h * h * h;
    let t = 1.0 - 0.5 * q;
    let t2 = t * t;
    let t3 = t2 * t;
    let w = WENDLAND_C2_NORM_3D / h3 * t2 * t2 * (1.0 + 2.0 * q);
    let dw_dr = WENDLAND_C2_NORM_3D / (h3 * h) * (-5.0 * q) * t3;
    (w, dw_dr)
}

/// Gradient of the kernel given the displacement `(dx, dy, dz)` from particle
/// j to particle i and the pre-computed distance `r`.
///
/// Zero when the particles overlap.
#[inline]
pub fn wendland_c2_gradient(dx: f32, dy: f32, dz: f32, r: f32, h: f32) -> (f32, f32, f32) {
    if r < 1.0e-12 {
        return (0.0, 0.0, 0.0);
    }
    let (_, dw_dr) = wendland_c2_deval(r, h);
    let inv_r = 1.0 / r;
    (dw_dr * dx * inv_r, dw_dr * dy * inv_r, dw_dr * dz * inv_r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn kernel_has_compact_support() {
        assert_eq!(wendland_c2(0.21, 0.1), 0.0);
        assert!(wendland_c2(0.19, 0.1) > 0.0);
    }

    #[test]
    fn kernel_integrates_to_one() {
        // Radial quadrature of 4 pi r^2 W(r) over the support.
        let h = 0.37_f32;
        let n = 20_000;
        let dr = 2.0 * h / n as f32;
        let mut total = 0.0_f64;
        for i in 0..n {
            let r = (i as f32 + 0.5) * dr;
            total += (4.0 * std::f32::consts::PI * r * r * wendland_c2(r, h) * dr) as f64;
        }
        assert_relative_eq!(total, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn deval_matches_finite_difference() {
        let h = 0.5_f32;
        let r = 0.4_f32;
        let eps = 1e-4_f32;
        let (w, dw_dr) = wendland_c2_deval(r, h);
        assert_relative_eq!(w, wendland_c2(r, h));
        let fd = (wendland_c2(r + eps, h) - wendland_c2(r - eps, h)) / (2.0 * eps);
        assert_relative_eq!(dw_dr, fd, epsilon = 1e-3);
    }

    #[test]
    fn gradient_points_along_separation() {
        let (gx, gy, gz) = wendland_c2_gradient(0.1, 0.0, 0.0, 0.1, 0.2);
        assert!(gx < 0.0); // kernel decreases away from the origin
        assert_eq!(gy, 0.0);
        assert_eq!(gz, 0.0);
    }
}
