//! Iterative Schur complement solver.
//!
//! Solves the damped normal equations by marginalizing out the
//! triangulated points (3x3 diagonal blocks) and running preconditioned
//! conjugate gradients on the reduced camera system
//! `S = H_cc - H_cp * H_pp^{-1} * H_cp^T`, applied implicitly. The
//! preconditioner is the Jacobi diagonal of the damped camera block.
//!
//! Back-substitution recovers the point update:
//! `dp = H_pp^{-1} * (g_p - H_cp^T * dc)`.

use std::ops::Mul;

use faer::sparse::{SparseColMat, Triplet};
use faer::Mat;
use nalgebra::{Matrix3, Vector3};

use super::{SchurPartition, SparseLinearSolver, MAX_DIAGONAL, MIN_DIAGONAL};

const MAX_CG_ITERATIONS: usize = 200;
const CG_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Clone)]
pub struct IterativeSchurSolver {
    max_cg_iterations: usize,
    cg_tolerance: f64,
}

impl IterativeSchurSolver {
    pub fn new() -> Self {
        Self {
            max_cg_iterations: MAX_CG_ITERATIONS,
            cg_tolerance: CG_TOLERANCE,
        }
    }

    pub fn with_cg_params(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_cg_iterations: max_iterations,
            cg_tolerance: tolerance,
        }
    }
}

impl Default for IterativeSchurSolver {
    fn default() -> Self {
        Self::new()
    }
}

fn dot(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    let mut sum = 0.0;
    for i in 0..a.nrows() {
        sum += a[(i, 0)] * b[(i, 0)];
    }
    sum
}

fn sub(a: &Mat<f64>, b: &Mat<f64>) -> Mat<f64> {
    let mut out = Mat::zeros(a.nrows(), 1);
    for i in 0..a.nrows() {
        out[(i, 0)] = a[(i, 0)] - b[(i, 0)];
    }
    out
}

impl SparseLinearSolver for IterativeSchurSolver {
    fn solve_augmented(
        &mut self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        lambda: f64,
        partition: &SchurPartition,
    ) -> Option<Mat<f64>> {
        let nc = partition.camera_dof;
        let np = partition.point_dof;
        if np % 3 != 0 || nc == 0 {
            return None;
        }
        let num_points = np / 3;

        // H = J^T * J and g = -J^T * r for the full system.
        let hessian = jacobian
            .as_ref()
            .transpose()
            .to_col_major()
            .ok()?
            .mul(jacobian.as_ref());
        let gradient = jacobian.as_ref().transpose().mul(-residuals);

        // Split H into the camera block, the camera/point coupling (both
        // directions), and the 3x3 point diagonal blocks, applying the
        // diagonal damping as we go.
        let mut cc_triplets: Vec<Triplet<usize, usize, f64>> = Vec::new();
        let mut cp_triplets: Vec<Triplet<usize, usize, f64>> = Vec::new();
        let mut pc_triplets: Vec<Triplet<usize, usize, f64>> = Vec::new();
        let mut point_blocks = vec![Matrix3::<f64>::zeros(); num_points];

        for t in hessian.triplet_iter() {
            let (row, col, val) = (t.row, t.col, *t.val);
            let damped = if row == col {
                val + lambda * val.clamp(MIN_DIAGONAL, MAX_DIAGONAL)
            } else {
                val
            };
            match (row < nc, col < nc) {
                (true, true) => cc_triplets.push(Triplet::new(row, col, damped)),
                (true, false) => cp_triplets.push(Triplet::new(row, col - nc, damped)),
                (false, true) => pc_triplets.push(Triplet::new(row - nc, col, damped)),
                (false, false) => {
                    let r = row - nc;
                    let c = col - nc;
                    if r / 3 != c / 3 {
                        // Off-diagonal coupling between two points cannot
                        // happen: no residual touches two points at once.
                        return None;
                    }
                    point_blocks[r / 3][(r % 3, c % 3)] = damped;
                }
            }
        }

        let h_cc = SparseColMat::try_new_from_triplets(nc, nc, &cc_triplets).ok()?;
        let h_cp = SparseColMat::try_new_from_triplets(nc, np.max(1), &cp_triplets).ok()?;
        let h_pc = SparseColMat::try_new_from_triplets(np.max(1), nc, &pc_triplets).ok()?;

        let point_inverses: Option<Vec<Matrix3<f64>>> =
            point_blocks.iter().map(|b| b.try_inverse()).collect();
        let point_inverses = point_inverses?;

        let apply_point_inverse = |v: &Mat<f64>| -> Mat<f64> {
            let mut out = Mat::zeros(np.max(1), 1);
            for k in 0..num_points {
                let b = Vector3::new(v[(3 * k, 0)], v[(3 * k + 1, 0)], v[(3 * k + 2, 0)]);
                let x = point_inverses[k] * b;
                out[(3 * k, 0)] = x.x;
                out[(3 * k + 1, 0)] = x.y;
                out[(3 * k + 2, 0)] = x.z;
            }
            out
        };

        let mut g_c = Mat::zeros(nc, 1);
        for i in 0..nc {
            g_c[(i, 0)] = gradient[(i, 0)];
        }
        let mut g_p = Mat::zeros(np.max(1), 1);
        for i in 0..np {
            g_p[(i, 0)] = gradient[(nc + i, 0)];
        }

        // Reduced right-hand side: b = g_c - H_cp * H_pp^{-1} * g_p
        let hpp_inv_gp = apply_point_inverse(&g_p);
        let b = sub(&g_c, &(&h_cp * &hpp_inv_gp));

        // S * x without forming S.
        let apply_schur = |x: &Mat<f64>| -> Mat<f64> {
            let hx = &h_cc * x;
            let px = apply_point_inverse(&(&h_pc * x));
            sub(&hx, &(&h_cp * &px))
        };

        // Jacobi preconditioner from the damped camera diagonal.
        let mut precond = vec![1.0; nc];
        for t in h_cc.triplet_iter() {
            if t.row == t.col {
                let d = *t.val;
                if d > 0.0 {
                    precond[t.row] = 1.0 / d;
                }
            }
        }
        let apply_precond = |v: &Mat<f64>| -> Mat<f64> {
            let mut out = Mat::zeros(nc, 1);
            for i in 0..nc {
                out[(i, 0)] = precond[i] * v[(i, 0)];
            }
            out
        };

        // Preconditioned conjugate gradients on S * dc = b.
        let mut dc = Mat::zeros(nc, 1);
        let mut r = b.clone();
        let mut z = apply_precond(&r);
        let mut p = z.clone();
        let mut rz = dot(&r, &z);
        let b_norm = dot(&b, &b).sqrt();
        if b_norm == 0.0 {
            return Some(Mat::zeros(nc + np, 1));
        }

        let mut converged = false;
        for _ in 0..self.max_cg_iterations {
            let sp = apply_schur(&p);
            let psp = dot(&p, &sp);
            if psp <= 0.0 || !psp.is_finite() {
                // Indefinite reduced system under this damping.
                return None;
            }
            let alpha = rz / psp;
            for i in 0..nc {
                dc[(i, 0)] += alpha * p[(i, 0)];
                r[(i, 0)] -= alpha * sp[(i, 0)];
            }
            if dot(&r, &r).sqrt() <= self.cg_tolerance * b_norm {
                converged = true;
                break;
            }
            z = apply_precond(&r);
            let rz_new = dot(&r, &z);
            let beta = rz_new / rz;
            rz = rz_new;
            for i in 0..nc {
                p[(i, 0)] = z[(i, 0)] + beta * p[(i, 0)];
            }
        }
        if !converged {
            return None;
        }

        // Back-substitute the point update.
        let dp = apply_point_inverse(&sub(&g_p, &(&h_pc * &dc)));

        let mut dx = Mat::zeros(nc + np, 1);
        for i in 0..nc {
            dx[(i, 0)] = dc[(i, 0)];
        }
        for i in 0..np {
            dx[(nc + i, 0)] = dp[(i, 0)];
        }
        Some(dx)
    }
}
