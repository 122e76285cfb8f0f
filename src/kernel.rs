//! Smoothing kernels.

use std::f64::consts::PI;

use crate::geometry::{norm, Point};

/// A radially symmetric SPH smoothing kernel in `D` dimensions.
///
/// The kernel vanishes beyond `width() * h`.
pub trait SmoothingKernel<const D: usize>: Sync {
    /// Support radius in units of the smoothing length.
    fn width(&self) -> f64;

    /// Value of the kernel at distance `r` for smoothing length `h`.
    fn kernel(&self, r: f64, h: f64) -> f64;

    /// Gradient of the kernel with respect to `ri` for `rij = ri - rj`.
    fn gradient(&self, rij: &Point<D>, h: f64) -> Point<D>;
}

/// The M4 cubic spline of Monaghan and Lattanzio.
#[derive(Copy, Clone, Debug, Default)]
pub struct CubicSpline<const D: usize>;

impl<const D: usize> CubicSpline<D> {
    /// Normalization constant for `h = 1`.
    pub fn sigma() -> f64 {
        match D {
            1 => 2.0 / 3.0,
            2 => 10.0 / (7.0 * PI),
            3 => 1.0 / PI,
            _ => panic!("cubic spline is only defined for 1, 2 and 3 dimensions"),
        }
    }

    // Derivative of the kernel with respect to r.
    fn derivative(r: f64, h: f64) -> f64 {
        let q = r / h;
        let scale = Self::sigma() / h.powi(D as i32 + 1);
        if q < 1.0 {
            scale * (-3.0 * q + 2.25 * q * q)
        } else if q < 2.0 {
            scale * (-0.75 * (2.0 - q) * (2.0 - q))
        } else {
            0.0
        }
    }
}

impl<const D: usize> SmoothingKernel<D> for CubicSpline<D> {
    fn width(&self) -> f64 {
        2.0
    }

    fn kernel(&self, r: f64, h: f64) -> f64 {
        let q = r / h;
        let scale = Self::sigma() / h.powi(D as i32);
        if q < 1.0 {
            scale * (1.0 - 1.5 * q * q + 0.75 * q * q * q)
        } else if q < 2.0 {
            scale * 0.25 * (2.0 - q).powi(3)
        } else {
            0.0
        }
    }

    fn gradient(&self, rij: &Point<D>, h: f64) -> Point<D> {
        let r = norm(rij);
        if r == 0.0 {
            return [0.0; D];
        }
        let factor = Self::derivative(r, h) / r;
        std::array::from_fn(|d| factor * rij[d])
    }
}

#[cfg(test)]
mod test {
    use std::f64::consts::PI;

    use approx::assert_relative_eq;

    use super::{CubicSpline, SmoothingKernel};

    // Integrate the radial profile over the support with the midpoint rule.
    fn integrate<const D: usize>(h: f64) -> f64 {
        let kernel = CubicSpline::<D>;
        let n = 20000;
        let dr = kernel.width() * h / n as f64;
        (0..n)
            .map(|i| {
                let r = (i as f64 + 0.5) * dr;
                let shell = match D {
                    1 => 2.0,
                    2 => 2.0 * PI * r,
                    _ => 4.0 * PI * r * r,
                };
                shell * kernel.kernel(r, h) * dr
            })
            .sum()
    }

    #[test]
    fn test_normalization() {
        assert_relative_eq!(integrate::<1>(0.3), 1.0, epsilon = 1E-6);
        assert_relative_eq!(integrate::<2>(0.3), 1.0, epsilon = 1E-6);
        assert_relative_eq!(integrate::<3>(0.3), 1.0, epsilon = 1E-6);
    }

    #[test]
    fn test_support() {
        let kernel = CubicSpline::<3>;
        assert_eq!(kernel.kernel(2.0, 1.0), 0.0);
        assert_eq!(kernel.kernel(5.0, 1.0), 0.0);
        assert!(kernel.kernel(1.9, 1.0) > 0.0);
        assert_eq!(kernel.gradient(&[0.0, 0.0, 0.0], 1.0), [0.0; 3]);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let kernel = CubicSpline::<2>;
        let h = 0.7;
        let eps = 1E-6;

        for rij in [[0.1, 0.2], [0.5, -0.4], [-0.9, 0.3]] {
            let gradient = kernel.gradient(&rij, h);
            for d in 0..2 {
                let mut plus = rij;
                let mut minus = rij;
                plus[d] += eps;
                minus[d] -= eps;
                let r_plus = (plus[0] * plus[0] + plus[1] * plus[1]).sqrt();
                let r_minus = (minus[0] * minus[0] + minus[1] * minus[1]).sqrt();
                let fd = (kernel.kernel(r_plus, h) - kernel.kernel(r_minus, h)) / (2.0 * eps);
                assert_relative_eq!(gradient[d], fd, epsilon = 1E-6);
            }
        }
    }
}
