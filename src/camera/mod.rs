//! Camera model adapters for linescan and frame sensors.
//!
//! A linescan sensor assembles its image line by line over time and carries
//! arrays of pose samples (positions and quaternions) uniformly sampled
//! along the scan timeline. A frame sensor exposes the whole image at a
//! single instant with a single pose.
//!
//! Residual functions take snapshot copies of these models so that
//! candidate pose samples can be written into the copy before projection;
//! see [`LinescanModel::ground_to_image`].

pub mod frame;
pub mod interp;
pub mod linescan;

use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::{UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{JitterError, JitterResult};

pub use frame::FrameModel;
pub use linescan::LinescanModel;

/// Coordinates per position sample.
pub const NUM_XYZ_PARAMS: usize = 3;
/// Coordinates per quaternion sample, stored as (x, y, z, w).
pub const NUM_QUAT_PARAMS: usize = 4;
/// Components per pixel residual.
pub const PIXEL_SIZE: usize = 2;

/// Residual value per pixel component on projection failure. Don't make
/// this too big.
pub const BIG_PIXEL_VALUE: f64 = 1000.0;

/// Projection precision used inside numerically differentiated residuals.
/// Anything coarser than this makes the linescan model return junk
/// derivatives.
pub const DEFAULT_PROJECTION_PRECISION: f64 = 1e-8;

/// Pinhole-style intrinsics shared by both sensor kinds. The focal length
/// is in pixel units; for linescan sensors `center_line` locates the
/// detector line in the focal plane (normally 0).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Intrinsics {
    pub focal_length: f64,
    pub center_sample: f64,
    pub center_line: f64,
}

/// Provides an interpolated camera-to-world pose at a given time.
///
/// Implemented by the linescan model over its sample arrays, and by the
/// rig binding which composes a reference trajectory with a rigid
/// transform.
pub trait PoseSampler {
    fn position_at(&self, t: f64) -> Vector3<f64>;
    fn rotation_at(&self, t: f64) -> JitterResult<UnitQuaternion<f64>>;
}

/// A camera model, either linescan or frame.
#[derive(Debug, Clone)]
pub enum CameraModel {
    Linescan(LinescanModel),
    Frame(FrameModel),
}

impl CameraModel {
    /// Time at which the given pixel was imaged. Constant for frame
    /// sensors.
    pub fn time_of_pixel(&self, pix: &Vector2<f64>) -> f64 {
        match self {
            CameraModel::Linescan(m) => m.time_of_line(pix.y),
            CameraModel::Frame(m) => m.time,
        }
    }

    /// Project an ECEF point into the image.
    pub fn ground_to_image(&self, xyz: &Vector3<f64>, precision: f64) -> JitterResult<Vector2<f64>> {
        match self {
            CameraModel::Linescan(m) => m.ground_to_image(xyz, precision),
            CameraModel::Frame(m) => m.ground_to_image(xyz),
        }
    }

    /// Camera center at the time the given pixel was imaged.
    pub fn camera_center(&self, pix: &Vector2<f64>) -> Vector3<f64> {
        match self {
            CameraModel::Linescan(m) => m.position_at(m.time_of_line(pix.y)),
            CameraModel::Frame(m) => m.position,
        }
    }

    /// Unit ray direction, in ECEF, of the given pixel. For linescan the
    /// detector line sits at the focal-plane origin, so the along-track
    /// component is zero.
    pub fn pixel_to_vector(&self, pix: &Vector2<f64>) -> JitterResult<Vector3<f64>> {
        match self {
            CameraModel::Linescan(m) => {
                let t = m.time_of_line(pix.y);
                let rot = m.rotation_at(t)?;
                let dir = Vector3::new(
                    (pix.x - m.intrinsics.center_sample) / m.intrinsics.focal_length,
                    0.0,
                    1.0,
                );
                Ok(rot * dir.normalize())
            }
            CameraModel::Frame(m) => {
                let rot = unit_quat_from_xyzw(&m.quaternion)?;
                let dir = Vector3::new(
                    (pix.x - m.intrinsics.center_sample) / m.intrinsics.focal_length,
                    (pix.y - m.intrinsics.center_line) / m.intrinsics.focal_length,
                    1.0,
                );
                Ok(rot * dir.normalize())
            }
        }
    }

    /// Image dimensions as (lines, samples per line).
    pub fn image_size(&self) -> (usize, usize) {
        match self {
            CameraModel::Linescan(m) => (m.num_lines, m.num_samples_per_line),
            CameraModel::Frame(m) => (m.num_lines, m.num_samples_per_line),
        }
    }

    /// Ground sample distance at an observed point, in meters per pixel.
    /// The angular size of a pixel is the reciprocal focal length.
    pub fn estimated_gsd(&self, pix: &Vector2<f64>, xyz: &Vector3<f64>) -> f64 {
        let (center, focal) = match self {
            CameraModel::Linescan(m) => {
                (m.position_at(m.time_of_line(pix.y)), m.intrinsics.focal_length)
            }
            CameraModel::Frame(m) => (m.position, m.intrinsics.focal_length),
        };
        (xyz - center).norm() / focal
    }

    pub fn as_linescan(&self) -> Option<&LinescanModel> {
        match self {
            CameraModel::Linescan(m) => Some(m),
            CameraModel::Frame(_) => None,
        }
    }

    pub fn as_linescan_mut(&mut self) -> Option<&mut LinescanModel> {
        match self {
            CameraModel::Linescan(m) => Some(m),
            CameraModel::Frame(_) => None,
        }
    }

    pub fn as_frame(&self) -> Option<&FrameModel> {
        match self {
            CameraModel::Frame(m) => Some(m),
            CameraModel::Linescan(_) => None,
        }
    }

    pub fn as_frame_mut(&mut self) -> Option<&mut FrameModel> {
        match self {
            CameraModel::Frame(m) => Some(m),
            CameraModel::Linescan(_) => None,
        }
    }
}

// Residuals with failed projections are evaluated from many solver threads.
// Only the first batch of failures is reported, the rest are counted.
static PROJECTION_FAILURES: AtomicUsize = AtomicUsize::new(0);
const MAX_REPORTED_FAILURES: usize = 100;

/// Record a projection failure inside a residual, logging only the first
/// [`MAX_REPORTED_FAILURES`] occurrences.
pub fn note_projection_failure(err: &JitterError) {
    let count = PROJECTION_FAILURES.fetch_add(1, Ordering::Relaxed);
    if count < MAX_REPORTED_FAILURES {
        tracing::warn!("projection failed inside a residual: {err}");
        if count + 1 == MAX_REPORTED_FAILURES {
            tracing::warn!("further projection failures will not be reported");
        }
    }
}

/// Total projection failures recorded so far.
pub fn projection_failure_count() -> usize {
    PROJECTION_FAILURES.load(Ordering::Relaxed)
}

/// Build a unit quaternion from a raw (x, y, z, w) slice, normalizing it.
/// Fails on a vanishing or non-finite norm.
pub(crate) fn unit_quat_from_xyzw(q: &[f64]) -> JitterResult<UnitQuaternion<f64>> {
    let quat = nalgebra::Quaternion::new(q[3], q[0], q[1], q[2]);
    let norm = quat.norm();
    if !norm.is_finite() || norm < 1e-12 {
        return Err(JitterError::Camera(format!(
            "Cannot normalize quaternion with norm {norm}."
        )));
    }
    Ok(UnitQuaternion::from_quaternion(quat))
}
