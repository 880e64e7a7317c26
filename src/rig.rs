//! Rig kinematics: a rigid assembly of sensors with one designated
//! reference sensor per camera. A non-reference sensor's pose is bound to
//! the reference sensor's sampled trajectory through a rigid transform:
//!
//! `cam_pose_sensor = cam_pose_ref(t) * ref_to_sensor`
//!
//! The transform carries 6 parameters (axis-angle rotation and
//! translation) and can itself be optimized.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::camera::{LinescanModel, PoseSampler};
use crate::error::JitterResult;

/// Number of parameters of a rigid transform.
pub const NUM_RIGID_PARAMS: usize = 6;

/// A 6-parameter rigid transform: axis-angle rotation followed by a
/// translation, mapping the sensor frame into the reference frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RigTransform(pub [f64; NUM_RIGID_PARAMS]);

impl RigTransform {
    pub fn identity() -> Self {
        Self([0.0; NUM_RIGID_PARAMS])
    }

    pub fn from_parts(rotation: &UnitQuaternion<f64>, translation: &Vector3<f64>) -> Self {
        let axis_angle = rotation.scaled_axis();
        Self([
            axis_angle.x,
            axis_angle.y,
            axis_angle.z,
            translation.x,
            translation.y,
            translation.z,
        ])
    }

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_scaled_axis(Vector3::new(self.0[0], self.0[1], self.0[2]))
    }

    pub fn translation(&self) -> Vector3<f64> {
        Vector3::new(self.0[3], self.0[4], self.0[5])
    }

    /// Compose a reference camera-to-world pose with this transform,
    /// producing the sensor's camera-to-world pose.
    pub fn compose(
        &self,
        ref_position: &Vector3<f64>,
        ref_rotation: &UnitQuaternion<f64>,
    ) -> (Vector3<f64>, UnitQuaternion<f64>) {
        let rotation = ref_rotation * self.rotation();
        let position = ref_position + ref_rotation * self.translation();
        (position, rotation)
    }
}

/// Per-camera rig bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct RigCamInfo {
    /// Which rig sensor acquired this camera's image.
    pub sensor_id: usize,
    /// Index of the camera acquired by the rig's reference sensor for the
    /// same acquisition.
    pub ref_cam_index: usize,
}

/// The rig: sensor reference flags, initial transforms, and per-camera
/// sensor assignments.
#[derive(Debug, Clone)]
pub struct RigSet {
    /// One flag per sensor.
    pub is_reference: Vec<bool>,
    /// One transform per sensor; identity for reference sensors.
    pub ref_to_sensor: Vec<RigTransform>,
    /// One entry per camera.
    pub cam_info: Vec<RigCamInfo>,
}

impl RigSet {
    pub fn num_sensors(&self) -> usize {
        self.is_reference.len()
    }

    pub fn is_ref_sensor(&self, sensor_id: usize) -> bool {
        self.is_reference[sensor_id]
    }
}

/// The reference trajectory composed with a rig transform, viewed as a
/// pose source for projection into a non-reference sensor.
pub struct ComposedTrajectory<'a> {
    pub ref_model: &'a LinescanModel,
    pub transform: RigTransform,
}

impl PoseSampler for ComposedTrajectory<'_> {
    fn position_at(&self, t: f64) -> Vector3<f64> {
        let ref_pos = self.ref_model.position_at(t);
        // The rotation is needed to carry the translation lever arm; a
        // failed normalization only happens for degenerate candidate
        // quaternions and is caught by rotation_at() in the same residual.
        match self.ref_model.rotation_at(t) {
            Ok(ref_rot) => self.transform.compose(&ref_pos, &ref_rot).0,
            Err(_) => ref_pos,
        }
    }

    fn rotation_at(&self, t: f64) -> JitterResult<UnitQuaternion<f64>> {
        let ref_rot = self.ref_model.rotation_at(t)?;
        Ok(ref_rot * self.transform.rotation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn transform_round_trips_through_parts() {
        let rot = UnitQuaternion::from_scaled_axis(Vector3::new(0.1, -0.2, 0.05));
        let trans = Vector3::new(1.0, 2.0, -0.5);
        let xform = RigTransform::from_parts(&rot, &trans);
        assert_relative_eq!(xform.rotation().angle(), rot.angle(), epsilon = 1e-12);
        assert_relative_eq!(xform.translation(), trans, epsilon = 1e-12);
    }

    #[test]
    fn composition_applies_lever_arm_in_ref_frame() {
        let ref_pos = Vector3::new(100.0, 0.0, 0.0);
        let ref_rot = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2);
        let xform = RigTransform::from_parts(
            &UnitQuaternion::identity(),
            &Vector3::new(1.0, 0.0, 0.0),
        );
        let (pos, rot) = xform.compose(&ref_pos, &ref_rot);
        // The x lever arm rotates into y.
        assert_relative_eq!(pos, Vector3::new(100.0, 1.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(rot.angle(), ref_rot.angle(), epsilon = 1e-12);
    }
}
