//! Control network structures: triangulated ground points and their pixel
//! observations, plus the camera-major view of the same data used when
//! assembling residuals.
//!
//! The network is built and triangulated by external collaborators; points
//! only move here through optimizer updates.

use std::collections::BTreeSet;

use nalgebra::{Vector2, Vector3};

use crate::error::{JitterError, JitterResult};

/// How a control point is constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    /// Triangulated from image matches.
    Triangulated,
    /// Height overridden from the input DEM; has its own constraint.
    FromDem,
    /// Ground control point; never part of the inertia constraints.
    Gcp,
}

/// A triangulated ground point and the pixels observing it.
#[derive(Debug, Clone)]
pub struct ControlPoint {
    /// ECEF position from triangulation (or DEM override).
    pub position: Vector3<f64>,
    pub kind: PointKind,
    /// Observations as (camera index, pixel).
    pub observations: Vec<(usize, Vector2<f64>)>,
}

/// The control network: a list of points, each with its observations.
#[derive(Debug, Clone, Default)]
pub struct ControlNetwork {
    pub points: Vec<ControlPoint>,
}

impl ControlNetwork {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Indices of control points excluded from the solve. Membership only
/// grows: points are flagged before optimization (by the external
/// reprojection filter) and during structure building (bad weight-image
/// values), never cleared.
pub type OutlierSet = BTreeSet<usize>;

/// Camera-major view of the control network: for each camera, the
/// (point index, pixel) pairs observed by it, in network order.
#[derive(Debug, Clone)]
pub struct CameraObservations {
    per_camera: Vec<Vec<(usize, Vector2<f64>)>>,
}

impl CameraObservations {
    /// Build the camera-major view. Fails when an observation references a
    /// camera outside `0..num_cameras`.
    pub fn from_network(cnet: &ControlNetwork, num_cameras: usize) -> JitterResult<Self> {
        let mut per_camera = vec![Vec::new(); num_cameras];
        for (ipt, point) in cnet.points.iter().enumerate() {
            for (icam, pix) in &point.observations {
                if *icam >= num_cameras {
                    return Err(JitterError::Config(format!(
                        "Observation references camera {icam} but only {num_cameras} cameras \
                         were provided."
                    )));
                }
                per_camera[*icam].push((ipt, *pix));
            }
        }
        Ok(Self { per_camera })
    }

    pub fn num_cameras(&self) -> usize {
        self.per_camera.len()
    }

    pub fn of_camera(&self, icam: usize) -> &[(usize, Vector2<f64>)] {
        &self.per_camera[icam]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_network() -> ControlNetwork {
        ControlNetwork {
            points: vec![
                ControlPoint {
                    position: Vector3::new(1.0, 2.0, 3.0),
                    kind: PointKind::Triangulated,
                    observations: vec![
                        (0, Vector2::new(10.0, 20.0)),
                        (1, Vector2::new(30.0, 40.0)),
                    ],
                },
                ControlPoint {
                    position: Vector3::new(4.0, 5.0, 6.0),
                    kind: PointKind::Gcp,
                    observations: vec![(1, Vector2::new(50.0, 60.0))],
                },
            ],
        }
    }

    #[test]
    fn camera_view_groups_by_camera() {
        let crn = CameraObservations::from_network(&small_network(), 2).unwrap();
        assert_eq!(crn.of_camera(0).len(), 1);
        assert_eq!(crn.of_camera(1).len(), 2);
        assert_eq!(crn.of_camera(1)[1].0, 1);
    }

    #[test]
    fn camera_view_rejects_bad_camera_index() {
        assert!(CameraObservations::from_network(&small_network(), 1).is_err());
    }
}
