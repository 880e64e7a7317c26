//! Reprojection factors for non-reference sensors on a rig.
//!
//! The effective pose of the observed sensor at time `t` is
//! `T_ref(t) * T_ref_to_sensor`, where `T_ref(t)` interpolates the
//! reference sensor's sampled trajectory. The optimized parameters are the
//! reference pose samples inside the interpolation window and the rig
//! transform; for a rig frame observation the frame pose is computed from
//! this composition, never optimized independently.

use std::ops::Range;
use std::sync::Arc;

use nalgebra::{DVector, Vector2, Vector3};

use crate::camera::frame::project_frame_pose;
use crate::camera::linescan::ground_to_image_with;
use crate::camera::{
    note_projection_failure, Intrinsics, LinescanModel, PoseSampler, BIG_PIXEL_VALUE,
    DEFAULT_PROJECTION_PRECISION, NUM_QUAT_PARAMS, NUM_XYZ_PARAMS, PIXEL_SIZE,
};
use crate::core::Factor;
use crate::rig::{ComposedTrajectory, RigTransform, NUM_RIGID_PARAMS};

/// The sensor that produced the observation: a frame sensor at a single
/// time, or another linescan sensor with its own timeline.
pub enum ObservedSensor {
    Frame { intrinsics: Intrinsics, time: f64 },
    Linescan { model: Arc<LinescanModel> },
}

/// Reprojection of a triangulated point into a non-reference rig sensor.
///
/// Parameter blocks, in order: one per reference quaternion sample in
/// `quat_range`, one per reference position sample in `pos_range`, the
/// 6-parameter rig transform, then the triangulated point.
pub struct RigReprojection {
    observation: Vector2<f64>,
    weight: f64,
    ref_model: Arc<LinescanModel>,
    quat_range: Range<usize>,
    pos_range: Range<usize>,
    observed: ObservedSensor,
}

impl RigReprojection {
    pub fn new(
        observation: Vector2<f64>,
        weight: f64,
        ref_model: Arc<LinescanModel>,
        quat_range: Range<usize>,
        pos_range: Range<usize>,
        observed: ObservedSensor,
    ) -> Self {
        Self {
            observation,
            weight,
            ref_model,
            quat_range,
            pos_range,
            observed,
        }
    }

    fn big_residual(err: &crate::error::JitterError) -> DVector<f64> {
        note_projection_failure(err);
        DVector::from_element(PIXEL_SIZE, BIG_PIXEL_VALUE)
    }
}

impl Factor for RigReprojection {
    fn residual_dim(&self) -> usize {
        PIXEL_SIZE
    }

    fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
        // Candidate reference trajectory: copy the snapshot and overwrite
        // the samples inside the window.
        let mut ref_cam = (*self.ref_model).clone();
        let mut shift = 0;
        for qi in self.quat_range.clone() {
            ref_cam.quaternions[NUM_QUAT_PARAMS * qi..NUM_QUAT_PARAMS * (qi + 1)]
                .copy_from_slice(params[shift].as_slice());
            shift += 1;
        }
        for pi in self.pos_range.clone() {
            ref_cam.positions[NUM_XYZ_PARAMS * pi..NUM_XYZ_PARAMS * (pi + 1)]
                .copy_from_slice(params[shift].as_slice());
            shift += 1;
        }

        let x = params[shift].as_slice();
        let transform = RigTransform([x[0], x[1], x[2], x[3], x[4], x[5]]);
        debug_assert_eq!(x.len(), NUM_RIGID_PARAMS);
        shift += 1;

        let tri = &params[shift];
        let xyz = Vector3::new(tri[0], tri[1], tri[2]);

        let trajectory = ComposedTrajectory {
            ref_model: &ref_cam,
            transform,
        };

        let projected = match &self.observed {
            ObservedSensor::Frame { intrinsics, time } => {
                match trajectory.rotation_at(*time) {
                    Ok(rot) => {
                        let pos = trajectory.position_at(*time);
                        project_frame_pose(&pos, &rot, intrinsics, &xyz)
                    }
                    Err(err) => Err(err),
                }
            }
            ObservedSensor::Linescan { model } => ground_to_image_with(
                &trajectory,
                &model.intrinsics,
                model,
                &xyz,
                DEFAULT_PROJECTION_PRECISION,
            ),
        };

        match projected {
            Ok(pix) => DVector::from_vec(vec![
                self.weight * (pix.x - self.observation.x),
                self.weight * (pix.y - self.observation.y),
            ]),
            Err(err) => Self::big_residual(&err),
        }
    }
}
