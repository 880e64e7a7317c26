//! Sparse linear solvers for the damped normal equations.
//!
//! The Jacobian columns are laid out pose-blocks-first, triangulated
//! points last, so both solvers can treat the trailing 3-wide point blocks
//! as the eliminated part of a Schur complement.

pub mod cholesky;
pub mod schur;

use faer::sparse::SparseColMat;
use faer::Mat;

pub use cholesky::SchurCholeskySolver;
pub use schur::IterativeSchurSolver;

/// Diagonal clamping bounds applied before damping, so that a vanishing
/// Hessian diagonal cannot wipe out the regularization.
pub(crate) const MIN_DIAGONAL: f64 = 1e-6;
pub(crate) const MAX_DIAGONAL: f64 = 1e32;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverKind {
    /// Preconditioned conjugate gradients on the point-marginalized
    /// reduced camera system.
    #[default]
    IterativeSchur,
    /// Direct sparse Cholesky on the full damped normal equations, with
    /// points ordered last.
    SchurCholesky,
}

/// Split of the Jacobian columns into pose and point parts.
#[derive(Debug, Clone, Copy)]
pub struct SchurPartition {
    pub camera_dof: usize,
    pub point_dof: usize,
}

/// Trait for sparse linear solvers of the augmented (damped) system
/// `(J^T J + lambda D) dx = -J^T r`, where `D` is the clamped Hessian
/// diagonal.
pub trait SparseLinearSolver: Send {
    fn solve_augmented(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        lambda: f64,
        partition: &SchurPartition,
    ) -> Option<Mat<f64>>;
}

/// Create the solver for a given kind.
pub fn create_linear_solver(kind: LinearSolverKind) -> Box<dyn SparseLinearSolver> {
    match kind {
        LinearSolverKind::IterativeSchur => Box::new(IterativeSchurSolver::new()),
        LinearSolverKind::SchurCholesky => Box::new(SchurCholeskySolver::new()),
    }
}
