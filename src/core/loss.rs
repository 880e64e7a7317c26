//! Robust loss functions and the corrector that folds them into residuals
//! and Jacobians.
//!
//! A loss function transforms the squared residual norm `s = ||r||²` into a
//! robust cost `ρ(s)` that reduces the influence of outliers. Each loss
//! reports the triple `[ρ(s), ρ'(s), ρ''(s)]`; the corrector rewrites the
//! residual and Jacobian so the optimizer can proceed as if solving a
//! plain least-squares problem.

use nalgebra::{DMatrix, DVector};

/// Trait for robust loss functions.
///
/// # Returns
///
/// `evaluate` returns `[ρ(s), ρ'(s), ρ''(s)]` at `s = ||r||²`. Near zero a
/// loss behaves like plain least squares: `ρ(0) = 0`, `ρ'(0) = 1`.
pub trait Loss: Send + Sync {
    fn evaluate(&self, s: f64) -> [f64; 3];
}

/// Cauchy loss: `ρ(s) = b·log(1 + s/b)` with `b = threshold²`.
///
/// Grows logarithmically for large residuals, which keeps gross outliers
/// from dominating without fully rejecting them.
#[derive(Debug, Clone, Copy)]
pub struct CauchyLoss {
    scale2: f64,
    inv_scale2: f64,
}

impl CauchyLoss {
    /// Create a Cauchy loss with the given threshold. Non-positive
    /// thresholds are a configuration error caught by options validation,
    /// so this constructor only asserts in debug builds.
    pub fn new(threshold: f64) -> Self {
        debug_assert!(threshold > 0.0);
        let scale2 = threshold * threshold;
        Self {
            scale2,
            inv_scale2: 1.0 / scale2,
        }
    }
}

impl Loss for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.inv_scale2;
        let inv = 1.0 / sum;
        [
            self.scale2 * sum.ln(),
            inv.max(f64::MIN_POSITIVE),
            -self.inv_scale2 * inv * inv,
        ]
    }
}

/// Applies a loss function to a residual/Jacobian pair, following the
/// Triggs correction: with `α` solving `α² / 2 - α - ρ''·s/ρ' = 0`,
///
/// ```text
/// r ← sqrt(ρ') / (1 - α) · r
/// J ← sqrt(ρ') · (J - α/s · r rᵀ J)
/// ```
///
/// The Jacobian must be corrected with the uncorrected residuals, so the
/// Jacobian correction is applied first.
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    pub fn new(s: f64, rho: &[f64; 3]) -> Self {
        let sqrt_rho1 = rho[1].sqrt();
        if s == 0.0 || rho[2] <= 0.0 {
            return Self {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        let d = 1.0 + 2.0 * s * rho[2] / rho[1];
        let alpha = 1.0 - d.max(0.0).sqrt();
        Self {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / s,
        }
    }

    pub fn correct_jacobian(&self, residuals: &DVector<f64>, jacobian: &mut DMatrix<f64>) {
        if self.alpha_sq_norm == 0.0 {
            *jacobian *= self.sqrt_rho1;
            return;
        }
        let rt_j = residuals.transpose() * &*jacobian;
        let outer = residuals * rt_j;
        *jacobian = self.sqrt_rho1 * (&*jacobian - self.alpha_sq_norm * outer);
    }

    pub fn correct_residuals(&self, residuals: &mut DVector<f64>) {
        *residuals *= self.residual_scaling;
    }
}
