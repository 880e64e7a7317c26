//! Frame sensor model: a single pose for the whole image.

use nalgebra::{Vector2, Vector3};

use crate::error::{JitterError, JitterResult};

use super::{unit_quat_from_xyzw, Intrinsics, NUM_QUAT_PARAMS};

/// A frame camera exposed at a single instant.
///
/// During optimization the pose parameters are shadowed into the
/// [`FrameParams`](crate::solve::FrameParams) side array because the model
/// itself is not addressed by the optimizer; the driver copies the side
/// array back here after the solve.
#[derive(Debug, Clone)]
pub struct FrameModel {
    pub position: Vector3<f64>,
    /// Camera-to-world quaternion as (x, y, z, w).
    pub quaternion: [f64; NUM_QUAT_PARAMS],
    pub time: f64,
    pub num_lines: usize,
    pub num_samples_per_line: usize,
    pub intrinsics: Intrinsics,
}

impl FrameModel {
    /// Divide the quaternion by its norm.
    pub fn normalize_quaternion(&mut self) -> JitterResult<()> {
        let q = &mut self.quaternion;
        let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
        if !norm.is_finite() || norm < 1e-12 {
            return Err(JitterError::Camera(format!(
                "Cannot normalize quaternion with norm {norm}."
            )));
        }
        for c in q.iter_mut() {
            *c /= norm;
        }
        Ok(())
    }

    /// Project an ECEF point into the image.
    pub fn ground_to_image(&self, xyz: &Vector3<f64>) -> JitterResult<Vector2<f64>> {
        project_frame(&self.position, &self.quaternion, &self.intrinsics, xyz)
    }
}

/// Closed-form pinhole projection used by the frame model and by the frame
/// reprojection residuals, which supply candidate pose values directly.
pub fn project_frame(
    position: &Vector3<f64>,
    quaternion: &[f64],
    intrinsics: &Intrinsics,
    xyz: &Vector3<f64>,
) -> JitterResult<Vector2<f64>> {
    let rot = unit_quat_from_xyzw(quaternion)?;
    project_frame_pose(position, &rot, intrinsics, xyz)
}

/// Pinhole projection with an already-normalized rotation, as produced by
/// the rig composition.
pub fn project_frame_pose(
    position: &Vector3<f64>,
    rot: &nalgebra::UnitQuaternion<f64>,
    intrinsics: &Intrinsics,
    xyz: &Vector3<f64>,
) -> JitterResult<Vector2<f64>> {
    let pc = rot.inverse_transform_vector(&(xyz - position));
    if pc.z <= 0.0 || !pc.z.is_finite() {
        return Err(JitterError::Projection(
            "Point does not project in front of the camera.".to_string(),
        ));
    }
    let sample = intrinsics.center_sample + intrinsics.focal_length * pc.x / pc.z;
    let line = intrinsics.center_line + intrinsics.focal_length * pc.y / pc.z;
    if !sample.is_finite() || !line.is_finite() {
        return Err(JitterError::Projection(
            "Non-finite projected pixel.".to_string(),
        ));
    }
    Ok(Vector2::new(sample, line))
}
