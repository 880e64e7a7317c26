//! The residual-producer trait and its numeric differentiation.
//!
//! A factor consumes an ordered list of parameter blocks and produces a
//! residual vector. Factors whose residuals go through an opaque camera
//! projection use the provided finite-difference `linearize`; the small
//! linear prior factors override it with exact Jacobians.

use nalgebra::{DMatrix, DVector};

/// Relative step size of the central finite differences.
const NUMERIC_DIFF_RELATIVE_STEP: f64 = 1e-6;

/// A residual producer over an ordered list of parameter blocks.
///
/// Implementations must be re-entrant: `evaluate` is called concurrently
/// from multiple solver threads.
pub trait Factor: Send + Sync {
    /// Number of residual components.
    fn residual_dim(&self) -> usize;

    /// Evaluate the residual at the given parameter block values.
    fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64>;

    /// Evaluate the residual and the Jacobian with respect to every
    /// parameter block, with block Jacobians concatenated horizontally in
    /// block order.
    ///
    /// The default computes central finite differences with a relative
    /// step, one column per parameter coordinate.
    fn linearize(&self, params: &[DVector<f64>]) -> (DVector<f64>, DMatrix<f64>) {
        let residual = self.evaluate(params);
        let dim = self.residual_dim();
        let total_cols: usize = params.iter().map(|p| p.len()).sum();
        let mut jacobian = DMatrix::<f64>::zeros(dim, total_cols);

        let mut perturbed: Vec<DVector<f64>> = params.to_vec();
        let mut col = 0;
        for k in 0..params.len() {
            for j in 0..params[k].len() {
                let x = params[k][j];
                let step = NUMERIC_DIFF_RELATIVE_STEP * x.abs().max(1.0);

                perturbed[k][j] = x + step;
                let forward = self.evaluate(&perturbed);
                perturbed[k][j] = x - step;
                let backward = self.evaluate(&perturbed);
                perturbed[k][j] = x;

                let scale = 1.0 / (2.0 * step);
                for r in 0..dim {
                    jacobian[(r, col)] = (forward[r] - backward[r]) * scale;
                }
                col += 1;
            }
        }
        (residual, jacobian)
    }
}
