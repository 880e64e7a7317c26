//! Solver options: robust thresholds, uncertainty sigmas, constraint weights,
//! iteration caps, and resampling density.
//!
//! Options are validated once, before any problem assembly. An invalid
//! combination aborts with a single diagnostic line; nothing is retried.

use serde::{Deserialize, Serialize};

use crate::error::{JitterError, JitterResult};

/// All numeric knobs recognized by the solver.
///
/// Weights that are zero disable the corresponding soft constraint, except
/// for the quaternion-norm constraint which should normally stay on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Outlier filter cutoff in pixels. Also sets the slack for the
    /// pose-sample time window of each reprojection residual.
    pub max_initial_reprojection_error: f64,
    /// Cauchy loss threshold for reprojection residuals.
    pub robust_threshold: f64,

    /// Inertia constraint on triangulated points, in units of pixels per
    /// meter of motion (divided by the per-point GSD when applied).
    pub tri_weight: f64,
    pub tri_robust_threshold: f64,

    /// DEM constraint: sigma in meters, and robust threshold.
    pub heights_from_dem_uncertainty: f64,
    pub heights_from_dem_robust_threshold: f64,

    /// Camera-position inertia.
    pub camera_position_weight: f64,
    pub camera_position_robust_threshold: f64,

    /// Rotation inertia, per quaternion sample.
    pub rotation_weight: f64,

    /// Soft constraint keeping quaternion norms close to 1.
    pub quat_norm_weight: f64,

    /// Roll/yaw constraint against the satellite along-track frame.
    pub roll_weight: f64,
    pub yaw_weight: f64,
    /// Measure roll/yaw against the initial camera orientation instead of
    /// the along-track frame. Roll and pitch swap roles in this mode.
    pub initial_camera_constraint: bool,

    /// Anchor points, uniformly distributed per image. Mutually exclusive
    /// with `num_anchor_points_per_tile`.
    pub num_anchor_points_per_image: i32,
    /// Anchor points per 1024 x 1024 image tile.
    pub num_anchor_points_per_tile: i32,
    /// Start placing anchor points this many lines before the first image
    /// line and after the last one.
    pub num_anchor_points_extra_lines: i32,
    pub anchor_weight: f64,

    /// Solver controls.
    pub parameter_tolerance: f64,
    pub num_iterations: usize,
    pub num_threads: usize,

    /// Linescan resampling density; values <= 0 leave the arrays alone.
    pub num_lines_per_position: i32,
    pub num_lines_per_orientation: i32,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_initial_reprojection_error: 10.0,
            robust_threshold: 0.5,
            tri_weight: 0.1,
            tri_robust_threshold: 0.1,
            heights_from_dem_uncertainty: 10.0,
            heights_from_dem_robust_threshold: 0.1,
            camera_position_weight: 0.0,
            camera_position_robust_threshold: 0.1,
            rotation_weight: 0.0,
            quat_norm_weight: 1.0,
            roll_weight: 0.0,
            yaw_weight: 0.0,
            initial_camera_constraint: false,
            num_anchor_points_per_image: 0,
            num_anchor_points_per_tile: 0,
            num_anchor_points_extra_lines: 0,
            anchor_weight: 0.0,
            parameter_tolerance: 1e-12,
            num_iterations: 500,
            num_threads: 0,
            num_lines_per_position: -1,
            num_lines_per_orientation: -1,
        }
    }
}

impl SolverOptions {
    /// Validate the options before assembly. Each failure is a single
    /// diagnostic line.
    pub fn validate(&self) -> JitterResult<()> {
        if self.max_initial_reprojection_error <= 0.0 {
            return Err(JitterError::Config(
                "The maximum initial reprojection error must be positive.".to_string(),
            ));
        }
        if self.robust_threshold <= 0.0 {
            return Err(JitterError::Config(
                "The robust threshold must be positive.".to_string(),
            ));
        }
        if self.tri_weight < 0.0 || self.tri_robust_threshold <= 0.0 {
            return Err(JitterError::Config(
                "Detected invalid triangulation weight or robust threshold.".to_string(),
            ));
        }
        if self.heights_from_dem_uncertainty <= 0.0
            || self.heights_from_dem_robust_threshold <= 0.0
        {
            return Err(JitterError::Config(
                "Detected invalid robust threshold or weights.".to_string(),
            ));
        }
        if self.camera_position_weight < 0.0 || self.camera_position_robust_threshold <= 0.0 {
            return Err(JitterError::Config(
                "Detected invalid camera position weight or robust threshold.".to_string(),
            ));
        }
        if self.rotation_weight < 0.0 || self.quat_norm_weight < 0.0 {
            return Err(JitterError::Config(
                "Rotation and quaternion norm weights must be non-negative.".to_string(),
            ));
        }
        if self.roll_weight < 0.0 || self.yaw_weight < 0.0 {
            return Err(JitterError::Config(
                "Roll and yaw weights must be non-negative.".to_string(),
            ));
        }
        if self.num_anchor_points_per_image < 0 || self.num_anchor_points_per_tile < 0 {
            return Err(JitterError::Config(
                "The number of anchor points must be non-negative.".to_string(),
            ));
        }
        if self.num_anchor_points_per_image > 0 && self.num_anchor_points_per_tile > 0 {
            return Err(JitterError::Config(
                "Cannot have anchor points both per image and per tile.".to_string(),
            ));
        }
        if self.anchor_weight < 0.0 {
            return Err(JitterError::Config(
                "The anchor weight must be non-negative.".to_string(),
            ));
        }
        if self.parameter_tolerance <= 0.0 || self.num_iterations == 0 {
            return Err(JitterError::Config(
                "Need a positive parameter tolerance and at least one iteration.".to_string(),
            ));
        }
        Ok(())
    }
}
