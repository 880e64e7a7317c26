#![allow(dead_code)]
//! Shared synthetic-scene builders for the end-to-end solver tests.
//!
//! Cameras fly an equatorial track above the WGS84 ellipsoid, looking
//! nadir; ground points sit on (or near) the surface under the track.

use jitter_solver::geo::{rotation_xy, satellite_to_world};
use jitter_solver::{
    CameraModel, ControlNetwork, ControlPoint, Dem, Ellipsoid, Georef, Intrinsics, LinescanModel,
    PointKind, RasterGeoref,
};
use nalgebra::{Quaternion, Rotation3, UnitQuaternion, Vector3};

pub const ALTITUDE: f64 = 500_000.0;

/// Degrees of longitude per second of flight.
pub const DEFAULT_RATE: f64 = 0.002;

pub fn ellipsoid() -> Ellipsoid {
    Ellipsoid::WGS84
}

/// A nadir-looking linescan camera flying east along the equator.
///
/// The image timeline covers t in [2, 22] with 2000 lines; pose samples
/// cover t in [0, 24] with a 1 s step.
pub fn orbit_linescan(lon_start: f64, focal_length: f64, rate_deg_per_s: f64) -> LinescanModel {
    let ell = ellipsoid();
    let georef = Georef::new(ell);
    let num_samples = 25;

    let mut positions = Vec::with_capacity(num_samples * 3);
    for i in 0..num_samples {
        let t = i as f64;
        let lon = lon_start + rate_deg_per_s * t;
        let p = ell.geodetic_to_ecef(&Vector3::new(lon, 0.0, ALTITUDE));
        positions.extend_from_slice(&[p.x, p.y, p.z]);
    }

    let mut quaternions: Vec<f64> = Vec::with_capacity(num_samples * 4);
    for i in 0..num_samples {
        let sat2world = satellite_to_world(&positions, i, &georef).unwrap();
        let cam2world = sat2world * rotation_xy();
        let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(cam2world));
        let mut sample = [q.i, q.j, q.k, q.w];
        // Keep a consistent sign across samples; a branch flip would
        // corrupt the interpolation between them.
        if i > 0 {
            let prev = &quaternions[4 * (i - 1)..4 * i];
            let dot: f64 = prev.iter().zip(&sample).map(|(a, b)| a * b).sum();
            if dot < 0.0 {
                for c in sample.iter_mut() {
                    *c = -*c;
                }
            }
        }
        quaternions.extend_from_slice(&sample);
    }

    LinescanModel {
        positions,
        quaternions,
        t0_ephem: 0.0,
        dt_ephem: 1.0,
        t0_quat: 0.0,
        dt_quat: 1.0,
        t0_line: 2.0,
        dt_line: 0.01,
        num_lines: 2000,
        num_samples_per_line: 1000,
        intrinsics: Intrinsics {
            focal_length,
            center_sample: 500.0,
            center_line: 0.0,
        },
    }
}

/// A grid of ground points at the given height, under the track segment
/// seen by the cameras.
pub fn ground_grid(
    lon_min: f64,
    lon_max: f64,
    lat_half_span: f64,
    n_lon: usize,
    n_lat: usize,
    height: f64,
) -> Vec<Vector3<f64>> {
    let ell = ellipsoid();
    let mut points = Vec::new();
    for i in 0..n_lon {
        let lon = lon_min + (lon_max - lon_min) * (i as f64 + 0.5) / n_lon as f64;
        for j in 0..n_lat {
            let lat = -lat_half_span + 2.0 * lat_half_span * (j as f64 + 0.5) / n_lat as f64;
            points.push(ell.geodetic_to_ecef(&Vector3::new(lon, lat, height)));
        }
    }
    points
}

/// Build a control network by projecting the points into every camera and
/// keeping in-image observations. Points seen by fewer than two cameras
/// are dropped.
pub fn build_network(cameras: &[CameraModel], points: &[Vector3<f64>]) -> ControlNetwork {
    let mut net = ControlNetwork::default();
    for point in points {
        let mut observations = Vec::new();
        for (icam, camera) in cameras.iter().enumerate() {
            let Ok(pix) = camera.ground_to_image(point, 1e-8) else {
                continue;
            };
            let (num_lines, num_samples) = camera.image_size();
            if pix.x < 0.0
                || pix.y < 0.0
                || pix.x > num_samples as f64 - 1.0
                || pix.y > num_lines as f64 - 1.0
            {
                continue;
            }
            observations.push((icam, pix));
        }
        if observations.len() >= 2 {
            net.points.push(ControlPoint {
                position: *point,
                kind: PointKind::Triangulated,
                observations,
            });
        }
    }
    net
}

/// Rotate every quaternion sample by a small roll about the satellite
/// along-track axis, with a sinusoidal profile over the samples.
pub fn inject_roll_jitter(model: &mut LinescanModel, amplitude_rad: f64, period_samples: f64) {
    let georef = Georef::new(ellipsoid());
    let positions = model.positions.clone();
    let num_quat = model.num_quaternions();
    for i in 0..num_quat {
        let sat2world = satellite_to_world(&positions, i.min(model.num_positions() - 1), &georef)
            .unwrap();
        let along = Vector3::new(sat2world[(0, 0)], sat2world[(1, 0)], sat2world[(2, 0)]);
        let angle = amplitude_rad * (2.0 * std::f64::consts::PI * i as f64 / period_samples).sin();
        let delta = UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(along), angle);

        let q = &mut model.quaternions[4 * i..4 * (i + 1)];
        let quat = UnitQuaternion::from_quaternion(Quaternion::new(q[3], q[0], q[1], q[2]));
        let perturbed = delta * quat;
        q.copy_from_slice(&[perturbed.i, perturbed.j, perturbed.k, perturbed.w]);
    }
}

/// A flat in-memory DEM at constant height covering the equatorial test
/// area.
pub fn flat_dem(height: f64) -> Dem {
    let georef = RasterGeoref {
        lon0: -1.0,
        lat0: -1.0,
        dlon: 0.01,
        dlat: 0.01,
    };
    Dem::new(
        vec![height; 201 * 201],
        201,
        201,
        -32768.0,
        georef,
        ellipsoid(),
    )
    .unwrap()
}

/// Median reprojection error, in pixels, of the optimized cameras against
/// the observations of one camera.
pub fn median_reprojection_error(
    camera: &CameraModel,
    cnet: &ControlNetwork,
    icam: usize,
    tri_points: &[f64],
) -> f64 {
    let mut errors = Vec::new();
    for (ipt, point) in cnet.points.iter().enumerate() {
        for (cam_idx, pix) in &point.observations {
            if *cam_idx != icam {
                continue;
            }
            let xyz = Vector3::new(
                tri_points[3 * ipt],
                tri_points[3 * ipt + 1],
                tri_points[3 * ipt + 2],
            );
            if let Ok(projected) = camera.ground_to_image(&xyz, 1e-8) {
                errors.push((projected - pix).norm());
            } else {
                errors.push(f64::INFINITY);
            }
        }
    }
    assert!(!errors.is_empty(), "camera {icam} has no observations");
    errors.sort_by(|a, b| a.partial_cmp(b).unwrap());
    errors[errors.len() / 2]
}

