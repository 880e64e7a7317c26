//! Nonlinear least-squares optimization driver.

pub mod levenberg_marquardt;

use std::fmt;

use crate::linalg::LinearSolverKind;

pub use levenberg_marquardt::LevenbergMarquardt;

/// Optimizer configuration. The defaults match the jitter solve: very
/// tight gradient/function tolerances so termination is normally by
/// parameter tolerance or the iteration cap.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub max_iterations: usize,
    pub gradient_tolerance: f64,
    pub function_tolerance: f64,
    pub parameter_tolerance: f64,
    /// Consecutive rejected or failed steps tolerated before giving up.
    pub max_consecutive_invalid_steps: usize,
    pub linear_solver: LinearSolverKind,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        let max_iterations = 500;
        Self {
            max_iterations,
            gradient_tolerance: 1e-16,
            function_tolerance: 1e-16,
            parameter_tolerance: 1e-12,
            max_consecutive_invalid_steps: 20.max(max_iterations / 5),
            linear_solver: LinearSolverKind::default(),
        }
    }
}

impl OptimizerConfig {
    /// Build a config from the user-facing iteration and tolerance knobs,
    /// deriving the invalid-step cap from the iteration count.
    pub fn from_user_options(num_iterations: usize, parameter_tolerance: f64) -> Self {
        Self {
            max_iterations: num_iterations,
            parameter_tolerance,
            max_consecutive_invalid_steps: 20.max(num_iterations / 5),
            ..Default::default()
        }
    }
}

/// How the optimization terminated. `NoConvergence` is not an error: the
/// parameters at the last accepted step are still written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationStatus {
    GradientToleranceReached,
    FunctionToleranceReached,
    ParameterToleranceReached,
    NoConvergence,
}

/// Summary of an optimization run.
#[derive(Debug, Clone)]
pub struct SolverSummary {
    pub status: OptimizationStatus,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub successful_steps: usize,
    pub unsuccessful_steps: usize,
    pub final_gradient_norm: f64,
}

impl fmt::Display for SolverSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Optimization summary")?;
        writeln!(f, "  status:              {:?}", self.status)?;
        writeln!(f, "  initial cost:        {:.6e}", self.initial_cost)?;
        writeln!(f, "  final cost:          {:.6e}", self.final_cost)?;
        writeln!(f, "  iterations:          {}", self.iterations)?;
        writeln!(f, "  successful steps:    {}", self.successful_steps)?;
        writeln!(f, "  unsuccessful steps:  {}", self.unsuccessful_steps)?;
        writeln!(f, "  final gradient norm: {:.6e}", self.final_gradient_norm)?;
        Ok(())
    }
}
