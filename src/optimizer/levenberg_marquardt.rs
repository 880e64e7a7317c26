//! Levenberg-Marquardt with adaptive damping and a Schur-partitioned
//! linear solve.
//!
//! The damping update follows the standard trust-region-flavored rule: a
//! good step shrinks the damping by up to a factor of three, a rejected
//! step doubles it. When the iterative Schur solver fails on a step (CG
//! breakdown or a singular point block), the step is retried with the
//! direct Cholesky fallback before counting as invalid.

use nalgebra::DVector;

use crate::core::{Layout, Problem};
use crate::error::JitterResult;
use crate::linalg::{
    create_linear_solver, LinearSolverKind, SchurPartition, SparseLinearSolver,
};

use super::{OptimizationStatus, OptimizerConfig, SolverSummary};

pub struct LevenbergMarquardt {
    config: OptimizerConfig,
    damping: f64,
    damping_min: f64,
    damping_max: f64,
}

impl LevenbergMarquardt {
    pub fn new() -> Self {
        Self::with_config(OptimizerConfig::default())
    }

    pub fn with_config(config: OptimizerConfig) -> Self {
        Self {
            config,
            damping: 1e-4,
            damping_min: 1e-12,
            damping_max: 1e12,
        }
    }

    /// Update damping from the step quality ratio; returns whether the
    /// step is accepted.
    fn update_damping(&mut self, rho: f64) -> bool {
        if rho > 0.0 {
            let tmp = 2.0 * rho - 1.0;
            self.damping *= (1.0_f64 / 3.0).max(1.0 - tmp * tmp * tmp);
            self.damping = self.damping.max(self.damping_min);
            true
        } else {
            self.damping *= 2.0;
            self.damping = self.damping.min(self.damping_max);
            false
        }
    }

    /// Minimize the problem in place. The optimized state is written back
    /// into the problem's parameter blocks even on `NoConvergence`.
    pub fn solve_problem(
        &mut self,
        problem: &mut Problem,
        layout: &Layout,
    ) -> JitterResult<SolverSummary> {
        let partition = SchurPartition {
            camera_dof: layout.camera_dof,
            point_dof: layout.point_dof,
        };

        let mut solver = create_linear_solver(self.config.linear_solver);
        let mut fallback: Option<Box<dyn SparseLinearSolver>> =
            match self.config.linear_solver {
                LinearSolverKind::IterativeSchur => Some(create_linear_solver(
                    LinearSolverKind::SchurCholesky,
                )),
                LinearSolverKind::SchurCholesky => None,
            };

        let mut x = problem.initial_state(layout);

        let (residuals, jacobian) = problem.linearize(layout, &x)?;
        let mut cost = 0.5 * residuals.norm_l2() * residuals.norm_l2();
        let initial_cost = cost;

        let mut current = (residuals, jacobian);
        let mut successful_steps = 0;
        let mut unsuccessful_steps = 0;
        let mut consecutive_invalid = 0;
        let mut final_gradient_norm = f64::NAN;
        let mut status = OptimizationStatus::NoConvergence;

        tracing::info!(
            "Starting Levenberg-Marquardt: {} residuals, {} parameters, initial cost {:.6e}",
            problem.num_residuals(),
            layout.num_cols,
            initial_cost
        );

        let mut iteration = 0;
        while iteration < self.config.max_iterations {
            iteration += 1;
            let (residuals, jacobian) = &current;

            // gradient = J^T * r
            let gradient = jacobian.as_ref().transpose() * residuals;
            let gradient_norm = gradient.norm_l2();
            final_gradient_norm = gradient_norm;
            if gradient_norm <= self.config.gradient_tolerance {
                status = OptimizationStatus::GradientToleranceReached;
                break;
            }

            // Solve the damped system, falling back to the direct solver
            // when the iterative one gives up.
            let step = solver
                .solve_augmented(residuals, jacobian, self.damping, &partition)
                .or_else(|| {
                    fallback.as_mut().and_then(|s| {
                        tracing::debug!("iterative Schur failed, retrying with direct Cholesky");
                        s.solve_augmented(residuals, jacobian, self.damping, &partition)
                    })
                });

            let Some(step) = step else {
                unsuccessful_steps += 1;
                consecutive_invalid += 1;
                if consecutive_invalid > self.config.max_consecutive_invalid_steps {
                    break;
                }
                self.damping = (self.damping * 10.0).min(self.damping_max);
                continue;
            };

            let step_norm = step.norm_l2();
            let mut x_new = x.clone();
            for i in 0..x_new.len() {
                x_new[i] += step[(i, 0)];
            }

            // Predicted reduction of the linearized model:
            // cost - 0.5 * ||r + J * dx||^2
            let j_step = jacobian.as_ref() * &step;
            let mut linear_norm2 = 0.0;
            for i in 0..residuals.nrows() {
                let v = residuals[(i, 0)] + j_step[(i, 0)];
                linear_norm2 += v * v;
            }
            let predicted_cost = 0.5 * linear_norm2;
            let predicted_reduction = cost - predicted_cost;

            let new_residuals = problem.evaluate(layout, &x_new);
            let new_cost = 0.5 * new_residuals.norm_l2() * new_residuals.norm_l2();
            let actual_reduction = cost - new_cost;

            let rho = if predicted_reduction.abs() < 1e-300 {
                if actual_reduction > 0.0 {
                    1.0
                } else {
                    0.0
                }
            } else {
                actual_reduction / predicted_reduction
            };

            if self.update_damping(rho) {
                x = x_new;
                let cost_change = cost - new_cost;
                cost = new_cost;
                successful_steps += 1;
                consecutive_invalid = 0;

                tracing::debug!(
                    "iteration {iteration}: cost {cost:.6e}, reduction {cost_change:.6e}, \
                     damping {:.3e}, step norm {step_norm:.3e}, rho {rho:.3}",
                    self.damping
                );

                if cost_change.abs() <= self.config.function_tolerance * cost.max(1e-300) {
                    status = OptimizationStatus::FunctionToleranceReached;
                    break;
                }
                if step_norm
                    <= self.config.parameter_tolerance
                        * (x.norm() + self.config.parameter_tolerance)
                {
                    status = OptimizationStatus::ParameterToleranceReached;
                    break;
                }

                current = problem.linearize(layout, &x)?;
            } else {
                unsuccessful_steps += 1;
                consecutive_invalid += 1;
                tracing::debug!(
                    "iteration {iteration}: step rejected, damping {:.3e}, rho {rho:.3}",
                    self.damping
                );
                if consecutive_invalid > self.config.max_consecutive_invalid_steps {
                    break;
                }
            }
        }

        problem.write_state(layout, &x);

        let summary = SolverSummary {
            status,
            initial_cost,
            final_cost: cost,
            iterations: iteration,
            successful_steps,
            unsuccessful_steps,
            final_gradient_norm,
        };
        if summary.status == OptimizationStatus::NoConvergence {
            tracing::info!(
                "Found a valid solution, but did not reach the actual minimum. This is \
                 expected, and likely the produced solution is good enough."
            );
        }
        tracing::info!("{summary}");
        Ok(summary)
    }
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Factor;
    use approx::assert_relative_eq;

    // Residuals [a - x0, sqrt(b) * (x1 - x0^2)]: the Rosenbrock function
    // in least-squares form, over a single 2-dim block.
    struct Rosenbrock {
        a: f64,
        b: f64,
    }

    impl Factor for Rosenbrock {
        fn residual_dim(&self) -> usize {
            2
        }

        fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
            let x0 = params[0][0];
            let x1 = params[0][1];
            DVector::from_vec(vec![self.a - x0, self.b.sqrt() * (x1 - x0 * x0)])
        }
    }

    #[test]
    fn minimizes_rosenbrock() {
        let mut problem = Problem::new();
        let x = problem.add_param_block(DVector::from_vec(vec![-1.2, 1.0]));
        problem.add_residual_block(Box::new(Rosenbrock { a: 1.0, b: 100.0 }), None, vec![x]);

        let layout = problem.build_layout().unwrap();
        let mut lm = LevenbergMarquardt::with_config(OptimizerConfig {
            max_iterations: 200,
            linear_solver: LinearSolverKind::SchurCholesky,
            ..Default::default()
        });
        let summary = lm.solve_problem(&mut problem, &layout).unwrap();

        assert!(summary.final_cost < 1e-10, "cost: {}", summary.final_cost);
        let solution = problem.block_values(x);
        assert_relative_eq!(solution[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(solution[1], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn respects_fixed_blocks() {
        let mut problem = Problem::new();
        let x = problem.add_param_block(DVector::from_vec(vec![5.0]));
        let y = problem.add_param_block(DVector::from_vec(vec![3.0]));
        problem.set_block_fixed(y);

        struct Pull;
        impl Factor for Pull {
            fn residual_dim(&self) -> usize {
                1
            }
            fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
                DVector::from_vec(vec![params[0][0] - params[1][0]])
            }
        }
        problem.add_residual_block(Box::new(Pull), None, vec![x, y]);

        let layout = problem.build_layout().unwrap();
        let mut lm = LevenbergMarquardt::with_config(OptimizerConfig {
            linear_solver: LinearSolverKind::SchurCholesky,
            ..Default::default()
        });
        lm.solve_problem(&mut problem, &layout).unwrap();

        assert_relative_eq!(problem.block_values(y)[0], 3.0, epsilon = 1e-15);
        assert_relative_eq!(problem.block_values(x)[0], 3.0, epsilon = 1e-6);
    }
}
