//! Weighted prior factors: the soft constraints that keep triangulated
//! points, camera positions, rotations, and quaternion norms close to
//! their targets.
//!
//! These residuals are linear (or quadratic) in their single parameter
//! block, so they override `linearize` with exact Jacobians instead of
//! paying for finite differences.

use nalgebra::{DMatrix, DVector, Vector3};

use crate::core::Factor;

/// Residual: `weight * (point - observation)`, 3 components.
///
/// Used both for the DEM constraint (observation = DEM surface point) and
/// for the triangulation inertia constraint (observation = initial
/// triangulated point).
pub struct XyzError {
    observation: Vector3<f64>,
    weight: f64,
}

impl XyzError {
    pub fn new(observation: Vector3<f64>, weight: f64) -> Self {
        Self { observation, weight }
    }
}

impl Factor for XyzError {
    fn residual_dim(&self) -> usize {
        3
    }

    fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
        let p = &params[0];
        DVector::from_fn(3, |i, _| self.weight * (p[i] - self.observation[i]))
    }

    fn linearize(&self, params: &[DVector<f64>]) -> (DVector<f64>, DMatrix<f64>) {
        let jacobian = DMatrix::identity(3, 3) * self.weight;
        (self.evaluate(params), jacobian)
    }
}

/// Residual: `weight * (position - initial_position)`, 3 components.
///
/// The initial position is copied at construction, as the live value will
/// change during the solve.
pub struct TranslationError {
    initial: [f64; 3],
    weight: f64,
}

impl TranslationError {
    pub fn new(initial: &[f64], weight: f64) -> Self {
        Self {
            initial: [initial[0], initial[1], initial[2]],
            weight,
        }
    }
}

impl Factor for TranslationError {
    fn residual_dim(&self) -> usize {
        3
    }

    fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
        let p = &params[0];
        DVector::from_fn(3, |i, _| self.weight * (p[i] - self.initial[i]))
    }

    fn linearize(&self, params: &[DVector<f64>]) -> (DVector<f64>, DMatrix<f64>) {
        let jacobian = DMatrix::identity(3, 3) * self.weight;
        (self.evaluate(params), jacobian)
    }
}

/// Residual: `weight * (quat - initial_quat)`, 4 components, no loss.
/// Holds the attitude close to initial, per sample.
pub struct RotationError {
    initial: [f64; 4],
    weight: f64,
}

impl RotationError {
    pub fn new(initial: &[f64], weight: f64) -> Self {
        Self {
            initial: [initial[0], initial[1], initial[2], initial[3]],
            weight,
        }
    }
}

impl Factor for RotationError {
    fn residual_dim(&self) -> usize {
        4
    }

    fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
        let q = &params[0];
        DVector::from_fn(4, |i, _| self.weight * (q[i] - self.initial[i]))
    }

    fn linearize(&self, params: &[DVector<f64>]) -> (DVector<f64>, DMatrix<f64>) {
        let jacobian = DMatrix::identity(4, 4) * self.weight;
        (self.evaluate(params), jacobian)
    }
}

/// Residual: `weight * (|q|^2 - 1)`, a single component.
///
/// Keeps every optimized quaternion sample close to unit norm so that
/// interpolation between mutated and untouched samples stays stable.
pub struct QuatNormError {
    weight: f64,
}

impl QuatNormError {
    pub fn new(weight: f64) -> Self {
        Self { weight }
    }
}

impl Factor for QuatNormError {
    fn residual_dim(&self) -> usize {
        1
    }

    fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
        let q = &params[0];
        let norm2 = q.iter().map(|c| c * c).sum::<f64>();
        DVector::from_element(1, self.weight * (norm2 - 1.0))
    }

    fn linearize(&self, params: &[DVector<f64>]) -> (DVector<f64>, DMatrix<f64>) {
        let q = &params[0];
        let mut jacobian = DMatrix::zeros(1, q.len());
        for (i, c) in q.iter().enumerate() {
            jacobian[(0, i)] = 2.0 * self.weight * c;
        }
        (self.evaluate(params), jacobian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn xyz_error_is_weighted_difference() {
        let f = XyzError::new(Vector3::new(1.0, 2.0, 3.0), 2.0);
        let r = f.evaluate(&[DVector::from_vec(vec![2.0, 2.0, 2.0])]);
        assert_relative_eq!(r[0], 2.0, epsilon = 1e-15);
        assert_relative_eq!(r[1], 0.0, epsilon = 1e-15);
        assert_relative_eq!(r[2], -2.0, epsilon = 1e-15);
    }

    #[test]
    fn quat_norm_residual_and_jacobian() {
        let f = QuatNormError::new(10.0);
        let params = vec![DVector::from_vec(vec![0.0, 0.0, 0.0, 1.1])];
        let (r, j) = f.linearize(&params);
        assert_relative_eq!(r[0], 10.0 * (1.21 - 1.0), epsilon = 1e-12);
        assert_relative_eq!(j[(0, 3)], 22.0, epsilon = 1e-12);
    }

    #[test]
    fn analytic_jacobians_match_numeric() {
        // Spot-check the overrides against the default finite differences.
        struct Numeric<F: Factor>(F);
        impl<F: Factor> Factor for Numeric<F> {
            fn residual_dim(&self) -> usize {
                self.0.residual_dim()
            }
            fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
                self.0.evaluate(params)
            }
        }

        let params = vec![DVector::from_vec(vec![0.3, -0.1, 0.9, 0.2])];
        let f = QuatNormError::new(3.0);
        let (_, j_analytic) = f.linearize(&params);
        let (_, j_numeric) = Numeric(QuatNormError::new(3.0)).linearize(&params);
        for c in 0..4 {
            assert_relative_eq!(j_analytic[(0, c)], j_numeric[(0, c)], epsilon = 1e-5);
        }
    }
}
