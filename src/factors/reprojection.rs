//! Pixel reprojection factors for linescan and frame cameras.
//!
//! The linescan factor copies its model snapshot on every call and
//! overwrites the quaternion and position samples in its ranges with the
//! candidate parameter values before projecting; this is how a candidate
//! pose is expressed to the projection routine, and it keeps the factor
//! re-entrant across solver threads. The copy may be expensive; see the
//! module-level notes in `camera`.

use std::ops::Range;
use std::sync::Arc;

use nalgebra::{DVector, Vector2, Vector3};

use crate::camera::frame::project_frame;
use crate::camera::{
    note_projection_failure, Intrinsics, LinescanModel, BIG_PIXEL_VALUE,
    DEFAULT_PROJECTION_PRECISION, NUM_QUAT_PARAMS, NUM_XYZ_PARAMS, PIXEL_SIZE,
};
use crate::core::Factor;

/// Reprojection of a triangulated point into a linescan camera.
///
/// Parameter blocks, in order: one per quaternion sample in `quat_range`
/// (4 values each), one per position sample in `pos_range` (3 values
/// each), then the triangulated point (3 values).
pub struct LinescanReprojection {
    observation: Vector2<f64>,
    weight: f64,
    model: Arc<LinescanModel>,
    quat_range: Range<usize>,
    pos_range: Range<usize>,
}

impl LinescanReprojection {
    pub fn new(
        observation: Vector2<f64>,
        weight: f64,
        model: Arc<LinescanModel>,
        quat_range: Range<usize>,
        pos_range: Range<usize>,
    ) -> Self {
        Self {
            observation,
            weight,
            model,
            quat_range,
            pos_range,
        }
    }

    /// Write the candidate parameter values into a model copy and read
    /// back the triangulated point.
    fn apply_params(&self, params: &[DVector<f64>], cam: &mut LinescanModel) -> Vector3<f64> {
        let mut shift = 0;
        for qi in self.quat_range.clone() {
            let q = &params[shift];
            cam.quaternions[NUM_QUAT_PARAMS * qi..NUM_QUAT_PARAMS * (qi + 1)]
                .copy_from_slice(q.as_slice());
            shift += 1;
        }
        for pi in self.pos_range.clone() {
            let p = &params[shift];
            cam.positions[NUM_XYZ_PARAMS * pi..NUM_XYZ_PARAMS * (pi + 1)]
                .copy_from_slice(p.as_slice());
            shift += 1;
        }
        let tri = &params[shift];
        Vector3::new(tri[0], tri[1], tri[2])
    }
}

impl Factor for LinescanReprojection {
    fn residual_dim(&self) -> usize {
        PIXEL_SIZE
    }

    fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
        let mut cam = (*self.model).clone();
        let xyz = self.apply_params(params, &mut cam);

        match cam.ground_to_image(&xyz, DEFAULT_PROJECTION_PRECISION) {
            Ok(pix) => DVector::from_vec(vec![
                self.weight * (pix.x - self.observation.x),
                self.weight * (pix.y - self.observation.y),
            ]),
            Err(err) => {
                // Accept the step anyway; the solver sees a large flat
                // residual instead of a failure.
                note_projection_failure(&err);
                DVector::from_element(PIXEL_SIZE, BIG_PIXEL_VALUE)
            }
        }
    }
}

/// Reprojection of a triangulated point into a frame camera.
///
/// Parameter blocks, in order: position (3), quaternion (4), triangulated
/// point (3). The pose blocks live in the frame side array, not in the
/// model.
pub struct FrameReprojection {
    observation: Vector2<f64>,
    weight: f64,
    intrinsics: Intrinsics,
}

impl FrameReprojection {
    pub fn new(observation: Vector2<f64>, weight: f64, intrinsics: Intrinsics) -> Self {
        Self {
            observation,
            weight,
            intrinsics,
        }
    }
}

impl Factor for FrameReprojection {
    fn residual_dim(&self) -> usize {
        PIXEL_SIZE
    }

    fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
        let position = Vector3::new(params[0][0], params[0][1], params[0][2]);
        let quaternion = [params[1][0], params[1][1], params[1][2], params[1][3]];
        let xyz = Vector3::new(params[2][0], params[2][1], params[2][2]);

        match project_frame(&position, &quaternion, &self.intrinsics, &xyz) {
            Ok(pix) => DVector::from_vec(vec![
                self.weight * (pix.x - self.observation.x),
                self.weight * (pix.y - self.observation.y),
            ]),
            Err(err) => {
                note_projection_failure(&err);
                DVector::from_element(PIXEL_SIZE, BIG_PIXEL_VALUE)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::FrameModel;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn down_looking_linescan() -> LinescanModel {
        let num_pos = 30;
        let mut positions = Vec::new();
        for i in 0..num_pos {
            positions.extend_from_slice(&[500.0 * i as f64, 0.0, 400_000.0]);
        }
        let rot = nalgebra::Rotation3::from_basis_unchecked(&[
            Vector3::y(),
            Vector3::x(),
            -Vector3::z(),
        ]);
        let q = UnitQuaternion::from_rotation_matrix(&rot);
        let mut quaternions = Vec::new();
        for _ in 0..num_pos {
            quaternions.extend_from_slice(&[q.i, q.j, q.k, q.w]);
        }
        LinescanModel {
            positions,
            quaternions,
            t0_ephem: 0.0,
            dt_ephem: 1.0,
            t0_quat: 0.0,
            dt_quat: 1.0,
            t0_line: 4.0,
            dt_line: 0.005,
            num_lines: 4000,
            num_samples_per_line: 1000,
            intrinsics: Intrinsics {
                focal_length: 80_000.0,
                center_sample: 500.0,
                center_line: 0.0,
            },
        }
    }

    #[test]
    fn zero_residual_at_true_observation() {
        let model = down_looking_linescan();
        let xyz = Vector3::new(7000.0, 200.0, 0.0);
        let obs = model.ground_to_image(&xyz, 1e-8).unwrap();

        let quat_range = 10..18;
        let pos_range = 10..18;
        let factor = LinescanReprojection::new(
            obs,
            1.5,
            Arc::new(model.clone()),
            quat_range.clone(),
            pos_range.clone(),
        );

        let mut params = Vec::new();
        for qi in quat_range {
            params.push(DVector::from_column_slice(
                &model.quaternions[4 * qi..4 * (qi + 1)],
            ));
        }
        for pi in pos_range {
            params.push(DVector::from_column_slice(
                &model.positions[3 * pi..3 * (pi + 1)],
            ));
        }
        params.push(DVector::from_vec(vec![xyz.x, xyz.y, xyz.z]));

        let r = factor.evaluate(&params);
        assert_relative_eq!(r[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(r[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn failed_projection_gives_big_flat_residual() {
        let model = down_looking_linescan();
        let factor = LinescanReprojection::new(
            Vector2::new(10.0, 10.0),
            2.0,
            Arc::new(model.clone()),
            10..18,
            10..18,
        );
        let mut params = Vec::new();
        for qi in 10..18 {
            params.push(DVector::from_column_slice(
                &model.quaternions[4 * qi..4 * (qi + 1)],
            ));
        }
        for pi in 10..18 {
            params.push(DVector::from_column_slice(
                &model.positions[3 * pi..3 * (pi + 1)],
            ));
        }
        // Point far above the camera: projection must fail.
        params.push(DVector::from_vec(vec![7000.0, 0.0, 900_000.0]));
        let r = factor.evaluate(&params);
        assert_relative_eq!(r[0], BIG_PIXEL_VALUE, epsilon = 1e-12);
        assert_relative_eq!(r[1], BIG_PIXEL_VALUE, epsilon = 1e-12);
    }

    #[test]
    fn frame_residual_matches_model_projection() {
        let model = FrameModel {
            position: Vector3::new(0.0, 0.0, 1000.0),
            quaternion: [1.0, 0.0, 0.0, 0.0],
            time: 0.0,
            num_lines: 1024,
            num_samples_per_line: 1024,
            intrinsics: Intrinsics {
                focal_length: 1000.0,
                center_sample: 512.0,
                center_line: 512.0,
            },
        };
        let xyz = Vector3::new(50.0, -20.0, 0.0);
        let obs = model.ground_to_image(&xyz).unwrap();
        let factor = FrameReprojection::new(obs, 3.0, model.intrinsics);
        let params = vec![
            DVector::from_vec(vec![0.0, 0.0, 1000.0]),
            DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0]),
            DVector::from_vec(vec![50.0, -20.0, 0.0]),
        ];
        let r = factor.evaluate(&params);
        assert_relative_eq!(r[0], 0.0, epsilon = 1e-10);
        assert_relative_eq!(r[1], 0.0, epsilon = 1e-10);
    }
}
