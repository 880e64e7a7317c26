//! Problem-structure builder: flattens the control network and the anchor
//! points into the per-camera pixel/weight/flag lists and the flat
//! triangulated-point array consumed by the assembler.
//!
//! Once built, these arrays must not be resized again: the assembler binds
//! parameter blocks to entries within them.

use nalgebra::{Vector2, Vector3};

use crate::camera::{CameraModel, DEFAULT_PROJECTION_PRECISION, NUM_XYZ_PARAMS};
use crate::error::{JitterError, JitterResult};
use crate::geo::{Dem, WeightImage};
use crate::network::{CameraObservations, ControlNetwork, OutlierSet, PointKind};
use crate::options::SolverOptions;

/// Pixel/weight/flag lists per camera, plus the flat triangulated point
/// storage. Anchor points are appended after the control-network points.
#[derive(Debug, Clone, Default)]
pub struct ProblemStructure {
    pub pixels: Vec<Vec<Vector2<f64>>>,
    pub weights: Vec<Vec<f64>>,
    pub is_anchor: Vec<Vec<bool>>,
    pub point_index: Vec<Vec<usize>>,
    /// Flat (x, y, z) per point; control-network points first, then anchor
    /// points.
    pub tri_points: Vec<f64>,
    /// The points before any optimization, for offset reporting.
    pub orig_tri_points: Vec<f64>,
    /// Per control-network point: the DEM surface point, or zeros where
    /// the DEM had no data (or no DEM was given).
    pub dem_xyz: Vec<Vector3<f64>>,
    pub num_cnet_points: usize,
}

impl ProblemStructure {
    pub fn tri_point(&self, ipt: usize) -> Vector3<f64> {
        Vector3::new(
            self.tri_points[NUM_XYZ_PARAMS * ipt],
            self.tri_points[NUM_XYZ_PARAMS * ipt + 1],
            self.tri_points[NUM_XYZ_PARAMS * ipt + 2],
        )
    }

    pub fn num_points(&self) -> usize {
        self.tri_points.len() / NUM_XYZ_PARAMS
    }
}

/// Put the triangulated points into flat storage, overriding their heights
/// from the DEM where it has data. Points that take a DEM height are
/// retyped as [`PointKind::FromDem`] so the inertia constraint skips them.
pub fn form_tri_points(
    cnet: &mut ControlNetwork,
    dem: Option<&Dem>,
    outliers: &OutlierSet,
    structure: &mut ProblemStructure,
) -> JitterResult<()> {
    if cnet.is_empty() {
        return Err(JitterError::Config(
            "No triangulated ground points were found.".to_string(),
        ));
    }

    structure.num_cnet_points = cnet.len();
    structure.dem_xyz = vec![Vector3::zeros(); cnet.len()];

    for (ipt, point) in cnet.points.iter_mut().enumerate() {
        let mut tri = point.position;

        for c in 0..NUM_XYZ_PARAMS {
            structure.orig_tri_points.push(point.position[c]);
        }

        if let Some(dem) = dem {
            if !outliers.contains(&ipt) {
                if let Some(dem_pt) = dem.surface_point_below(&point.position) {
                    structure.dem_xyz[ipt] = dem_pt;
                    tri = dem_pt;
                    point.position = dem_pt;
                    point.kind = PointKind::FromDem;
                }
            }
        }

        for c in 0..NUM_XYZ_PARAMS {
            structure.tri_points.push(tri[c]);
        }
    }
    Ok(())
}

/// Flatten the control network into per-camera observation lists. The
/// pixel weight is 1.0, or the weight-image value at the triangulated
/// point; points with invalid weight-image values become outliers.
pub fn build_structure(
    crn: &CameraObservations,
    outliers: &mut OutlierSet,
    weight_image: Option<&WeightImage>,
    structure: &mut ProblemStructure,
) {
    let num_cameras = crn.num_cameras();
    structure.pixels = vec![Vec::new(); num_cameras];
    structure.weights = vec![Vec::new(); num_cameras];
    structure.is_anchor = vec![Vec::new(); num_cameras];
    structure.point_index = vec![Vec::new(); num_cameras];

    for icam in 0..num_cameras {
        for &(ipt, pix) in crn.of_camera(icam) {
            if outliers.contains(&ipt) {
                continue;
            }

            // Unlike in bundle adjustment, the pixel weight is 1.0 rather
            // than 1 / pixel_sigma.
            let mut weight = 1.0;
            if let Some(img) = weight_image {
                let tri = structure.tri_point(ipt);
                match img.closest_value(&tri) {
                    Some(w) if w > 0.0 => weight = w,
                    _ => {
                        outliers.insert(ipt);
                        continue;
                    }
                }
            }

            structure.pixels[icam].push(pix);
            structure.weights[icam].push(weight);
            structure.is_anchor[icam].push(false);
            structure.point_index[icam].push(ipt);
        }
    }
}

/// Generate anchor points on a uniform pixel grid per image, intersect
/// them with the anchor DEM, and append them as fixed points with their
/// own observations.
pub fn add_anchor_points(
    opts: &SolverOptions,
    anchor_dem: &Dem,
    anchor_weight_image: Option<&WeightImage>,
    cameras: &[CameraModel],
    structure: &mut ProblemStructure,
) -> JitterResult<()> {
    if opts.num_anchor_points_per_image <= 0 && opts.num_anchor_points_per_tile <= 0 {
        return Err(JitterError::Config(
            "Expecting a positive number of anchor points.".to_string(),
        ));
    }

    let mut warning_printed = false;

    for (icam, camera) in cameras.iter().enumerate() {
        let (num_lines, num_samples) = camera.image_size();
        let ls_model = camera.as_linescan();
        // Extra lines beyond the image extent are only for linescan.
        let extra = if ls_model.is_some() {
            opts.num_anchor_points_extra_lines as f64
        } else {
            0.0
        };

        let area = num_samples as f64 * (num_lines as f64 + 2.0 * extra);
        let area_per_point = if opts.num_anchor_points_per_image > 0 {
            area / opts.num_anchor_points_per_image as f64
        } else {
            1024.0 * 1024.0 / opts.num_anchor_points_per_tile as f64
        };
        let bin_len = area_per_point.sqrt().max(1.0);
        let lenx = ((num_samples as f64 / bin_len).ceil() as i64).max(1);
        let leny = (((num_lines as f64 + 2.0 * extra) / bin_len).ceil() as i64).max(1);

        let mut num_anchor_points = 0;
        for binx in 0..=lenx {
            let posx = binx as f64 * bin_len;
            for biny in 0..=leny {
                let posy = biny as f64 * bin_len - extra;
                if posx > num_samples as f64 - 1.0
                    || posy < -extra
                    || posy > num_lines as f64 - 1.0 + extra
                {
                    continue;
                }
                let pix = Vector2::new(posx, posy);

                let Ok(dir) = camera.pixel_to_vector(&pix) else {
                    continue;
                };
                let center = camera.camera_center(&pix);
                let Some(dem_xyz) = anchor_dem.intersect_ray(&center, &dir) else {
                    continue;
                };

                // Check the round trip; a large gap means a bad point.
                let Ok(pix_out) = camera.ground_to_image(&dem_xyz, DEFAULT_PROJECTION_PRECISION)
                else {
                    continue;
                };
                if (pix - pix_out).norm() > 0.01 {
                    continue;
                }

                let mut anchor_weight_from_image = 1.0;
                if let Some(img) = anchor_weight_image {
                    match img.closest_value(&dem_xyz) {
                        Some(w) if w > 0.0 => anchor_weight_from_image = w,
                        _ => continue,
                    }
                }

                // Anchor points must not fall outside the range of
                // tabulated positions and orientations.
                if let Some(ls) = ls_model {
                    let time = ls.time_of_line(pix.y);
                    let pos_index = ((time - ls.t0_ephem) / ls.dt_ephem).floor();
                    let quat_index = ((time - ls.t0_quat) / ls.dt_quat).floor();
                    if pos_index < 0.0
                        || pos_index >= ls.num_positions() as f64
                        || quat_index < 0.0
                        || quat_index >= ls.num_quaternions() as f64
                    {
                        if !warning_printed {
                            tracing::warn!(
                                "Not placing anchor points outside the range of tabulated \
                                 positions and orientations."
                            );
                            warning_printed = true;
                        }
                        continue;
                    }
                }

                let new_point_index = structure.num_points();
                structure.pixels[icam].push(pix);
                structure.weights[icam].push(opts.anchor_weight * anchor_weight_from_image);
                structure.is_anchor[icam].push(true);
                structure.point_index[icam].push(new_point_index);
                for c in 0..NUM_XYZ_PARAMS {
                    structure.orig_tri_points.push(dem_xyz[c]);
                    structure.tri_points.push(dem_xyz[c]);
                }
                num_anchor_points += 1;
            }
        }

        tracing::info!(
            "Camera {icam}: lines and samples: {num_lines} {num_samples}, \
             anchor points: {num_anchor_points}"
        );
    }
    Ok(())
}

/// Median GSD over the observing cameras, per control-network point.
/// Points whose GSD cannot be estimated get a nonpositive value and are
/// skipped by the inertia constraint.
pub fn estimate_gsd_per_point(
    cameras: &[CameraModel],
    crn: &CameraObservations,
    outliers: &OutlierSet,
    structure: &ProblemStructure,
) -> Vec<f64> {
    let mut gsds: Vec<Vec<f64>> = vec![Vec::new(); structure.num_cnet_points];
    for (icam, camera) in cameras.iter().enumerate() {
        for &(ipt, pix) in crn.of_camera(icam) {
            if outliers.contains(&ipt) {
                continue;
            }
            let gsd = camera.estimated_gsd(&pix, &structure.tri_point(ipt));
            if gsd > 0.0 && gsd.is_finite() {
                gsds[ipt].push(gsd);
            }
        }
    }
    gsds.into_iter()
        .map(|mut v| if v.is_empty() { -1.0 } else { median(&mut v) })
        .collect()
}

/// Destructive median; more robust to outliers than the mean.
pub fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ControlPoint;
    use approx::assert_relative_eq;

    #[test]
    fn median_of_odd_and_even() {
        assert_relative_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_relative_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn form_tri_points_requires_points() {
        let mut cnet = ControlNetwork::default();
        let mut structure = ProblemStructure::default();
        assert!(form_tri_points(&mut cnet, None, &OutlierSet::new(), &mut structure).is_err());
    }

    #[test]
    fn build_structure_skips_outliers() {
        let cnet = ControlNetwork {
            points: vec![
                ControlPoint {
                    position: Vector3::new(1.0, 0.0, 0.0),
                    kind: PointKind::Triangulated,
                    observations: vec![(0, Vector2::new(1.0, 2.0))],
                },
                ControlPoint {
                    position: Vector3::new(2.0, 0.0, 0.0),
                    kind: PointKind::Triangulated,
                    observations: vec![(0, Vector2::new(3.0, 4.0))],
                },
            ],
        };
        let crn = CameraObservations::from_network(&cnet, 1).unwrap();
        let mut cnet = cnet;
        let mut structure = ProblemStructure::default();
        form_tri_points(&mut cnet, None, &OutlierSet::new(), &mut structure).unwrap();

        let mut outliers = OutlierSet::new();
        outliers.insert(0);
        build_structure(&crn, &mut outliers, None, &mut structure);

        assert_eq!(structure.pixels[0].len(), 1);
        assert_eq!(structure.point_index[0][0], 1);
        assert_relative_eq!(structure.weights[0][0], 1.0);
    }
}
