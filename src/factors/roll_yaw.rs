//! The roll/yaw constraint: keeps the optimized camera orientation aligned
//! with the satellite along-track frame (or with the initial camera).
//!
//! The factorization asserted here is
//! `cam2world = sat2world * rollPitchYaw * rot_xy`, with a fixed 90 degree
//! in-sensor rotation `rot_xy`. The residual extracts the roll and yaw
//! angles of `rollPitchYaw`, in degrees, each normalized to (-180, 180].

use nalgebra::{DVector, Matrix3, Quaternion, Rotation3, UnitQuaternion};

use crate::core::Factor;
use crate::error::{JitterError, JitterResult};
use crate::geo::{rotation_xy, satellite_to_world, Georef};

/// Fold an angle in degrees into (-180, 180]. Roll and yaw come out of the
/// factorization with a +/- 180 degree ambiguity.
fn fold_degrees(x: f64) -> f64 {
    x - 180.0 * (x / 180.0).round()
}

/// Roll, pitch, yaw in degrees of a rotation matrix, using the
/// Rz(yaw) * Ry(pitch) * Rx(roll) convention.
fn roll_pitch_yaw_degrees(m: &Matrix3<f64>) -> (f64, f64, f64) {
    let (roll, pitch, yaw) = Rotation3::from_matrix_unchecked(*m).euler_angles();
    (roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees())
}

/// Weighted roll/yaw residual on a single quaternion sample.
///
/// All positions are assumed to lie along one segment in projected
/// coordinates, or at least the current position and its nearest
/// neighbors; that segment provides the along-track direction the roll
/// and yaw are measured from.
pub struct RollYawError {
    roll_weight: f64,
    yaw_weight: f64,
    rot_xy: Matrix3<f64>,
    sat_to_world: Matrix3<f64>,
    init_cam_to_world: Matrix3<f64>,
    initial_camera_constraint: bool,
}

impl RollYawError {
    /// Build the satellite frame at position `cur_pos` of a trajectory
    /// given as flat position and quaternion arrays, one-to-one.
    pub fn new(
        positions: &[f64],
        quaternions: &[f64],
        georef: &Georef,
        cur_pos: usize,
        roll_weight: f64,
        yaw_weight: f64,
        initial_camera_constraint: bool,
    ) -> JitterResult<Self> {
        let num_pos = positions.len() / 3;
        let num_quat = quaternions.len() / 4;
        if num_pos != num_quat {
            return Err(JitterError::Camera(
                "Expecting the same number of positions and quaternions.".to_string(),
            ));
        }

        let sat_to_world = satellite_to_world(positions, cur_pos, georef)?;

        let q = &quaternions[4 * cur_pos..4 * (cur_pos + 1)];
        let init_cam_to_world =
            UnitQuaternion::from_quaternion(Quaternion::new(q[3], q[0], q[1], q[2]))
                .to_rotation_matrix()
                .into_inner();

        Ok(Self {
            roll_weight,
            yaw_weight,
            rot_xy: rotation_xy(),
            sat_to_world,
            init_cam_to_world,
            initial_camera_constraint,
        })
    }
}

impl Factor for RollYawError {
    fn residual_dim(&self) -> usize {
        2
    }

    fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
        let q = &params[0];
        let cam_to_world =
            UnitQuaternion::from_quaternion(Quaternion::new(q[3], q[0], q[1], q[2]))
                .to_rotation_matrix()
                .into_inner();

        if self.initial_camera_constraint {
            // Measure against the initial camera rather than the satellite
            // frame. The camera frame is rotated 90 degrees in the sensor
            // plane relative to the satellite frame, so the roll and pitch
            // roles swap.
            let cam_to_cam = cam_to_world.transpose() * self.init_cam_to_world;
            let (_, pitch, yaw) = roll_pitch_yaw_degrees(&cam_to_cam);
            return DVector::from_vec(vec![
                fold_degrees(pitch) * self.roll_weight,
                fold_degrees(yaw) * self.yaw_weight,
            ]);
        }

        let roll_pitch_yaw =
            self.sat_to_world.transpose() * cam_to_world * self.rot_xy.transpose();
        let (roll, _, yaw) = roll_pitch_yaw_degrees(&roll_pitch_yaw);
        DVector::from_vec(vec![
            fold_degrees(roll) * self.roll_weight,
            fold_degrees(yaw) * self.yaw_weight,
        ])
    }
}
