//! Direct sparse Cholesky solve of the damped normal equations.
//!
//! The point blocks already sit last in the column layout, which gives the
//! factorization the fill-reducing structure of an explicit Schur
//! ordering. Used as the fallback when the iterative Schur solver stalls.

use std::ops::Mul;

use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers;
use faer::sparse::{SparseColMat, Triplet};
use faer::Mat;

use super::{SchurPartition, SparseLinearSolver, MAX_DIAGONAL, MIN_DIAGONAL};

#[derive(Debug, Clone, Default)]
pub struct SchurCholeskySolver {}

impl SchurCholeskySolver {
    pub fn new() -> Self {
        Self {}
    }
}

impl SparseLinearSolver for SchurCholeskySolver {
    fn solve_augmented(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        lambda: f64,
        _partition: &SchurPartition,
    ) -> Option<Mat<f64>> {
        let n = jacobian.ncols();

        // H = J^T * J
        let hessian = jacobian
            .as_ref()
            .transpose()
            .to_col_major()
            .ok()?
            .mul(jacobian.as_ref());

        // g = J^T * -r
        let gradient = jacobian.as_ref().transpose().mul(-residuals);

        // H_aug = H + lambda * clamp(diag(H))
        let mut damping_triplets = Vec::with_capacity(n);
        for i in 0..n {
            let diag = hessian[(i, i)].clamp(MIN_DIAGONAL, MAX_DIAGONAL);
            damping_triplets.push(Triplet::new(i, i, lambda * diag));
        }
        let damping = SparseColMat::try_new_from_triplets(n, n, &damping_triplets).ok()?;
        let augmented = hessian + damping;

        // The sparsity of the augmented system changes with the damping,
        // so the symbolic analysis is redone every call.
        let symbolic =
            solvers::SymbolicLlt::try_new(augmented.symbolic(), faer::Side::Lower).ok()?;
        let cholesky =
            solvers::Llt::try_new_with_symbolic(symbolic, augmented.as_ref(), faer::Side::Lower)
                .ok()?;
        Some(cholesky.solve(gradient))
    }
}
