//! End-to-end solver scenarios on synthetic orbital scenes: perfect
//! inputs, jitter recovery, DEM pull, anchor immobility, and the residual
//! bookkeeping invariants.

mod common;

use common::*;
use jitter_solver::{
    run_jitter_solve, CameraModel, JitterInputs, OutlierSet, SolverOptions,
};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};

fn inputs_without_rasters(cameras: Vec<CameraModel>, cnet: jitter_solver::ControlNetwork) -> JitterInputs {
    JitterInputs {
        cameras,
        cnet,
        outliers: OutlierSet::new(),
        dem: None,
        anchor_dem: None,
        weight_image: None,
        anchor_weight_image: None,
        rig: None,
        orbital_groups: Vec::new(),
        single_threaded_cameras: false,
    }
}

// Perfect synthetic observations: the solve must be a no-op.
#[test]
fn identity_solve_changes_nothing() {
    let cameras: Vec<CameraModel> = [0.0, 0.002, 0.004]
        .iter()
        .map(|&lon| CameraModel::Linescan(orbit_linescan(lon, 1e5, DEFAULT_RATE)))
        .collect();
    let points = ground_grid(0.010, 0.042, 0.008, 12, 5, 0.0);
    let cnet = build_network(&cameras, &points);
    assert!(cnet.len() >= 40, "too few synthetic points: {}", cnet.len());

    let before: Vec<CameraModel> = cameras.clone();
    let mut inputs = inputs_without_rasters(cameras, cnet);
    let opts = SolverOptions {
        num_iterations: 10,
        ..Default::default()
    };
    let solution = run_jitter_solve(&mut inputs, &opts).unwrap();

    assert!(
        solution.summary.final_cost < 1e-8,
        "cost: {}",
        solution.summary.final_cost
    );

    for (cam_before, cam_after) in before.iter().zip(&inputs.cameras) {
        let (b, a) = (
            cam_before.as_linescan().unwrap(),
            cam_after.as_linescan().unwrap(),
        );
        for (qb, qa) in b.quaternions.iter().zip(&a.quaternions) {
            assert!((qb - qa).abs() < 1e-7, "quaternion moved: {qb} -> {qa}");
        }
        for (pb, pa) in b.positions.iter().zip(&a.positions) {
            assert!((pb - pa).abs() < 1e-4, "position moved: {pb} -> {pa}");
        }
    }
    for (tb, ta) in solution.orig_tri_points.iter().zip(&solution.tri_points) {
        assert!((tb - ta).abs() < 1e-4, "tri point moved: {tb} -> {ta}");
    }
}

// Sinusoidal attitude perturbation on one camera; noise-free matches must
// pull the reprojection error back down to a small fraction of a pixel.
#[test]
fn jitter_injection_is_absorbed() {
    let cameras: Vec<CameraModel> = [0.0, 0.002]
        .iter()
        .map(|&lon| CameraModel::Linescan(orbit_linescan(lon, 1e5, DEFAULT_RATE)))
        .collect();
    let points = ground_grid(0.010, 0.040, 0.008, 10, 4, 0.0);
    let cnet = build_network(&cameras, &points);
    assert!(cnet.len() >= 30);

    let mut cameras = cameras;
    if let CameraModel::Linescan(model) = &mut cameras[0] {
        inject_roll_jitter(model, 1e-5, 8.0);
    }

    // The perturbation is about one pixel before the solve.
    let initial_median =
        median_reprojection_error(&cameras[0], &cnet, 0, &flatten_positions(&cnet));
    assert!(
        initial_median > 0.2,
        "perturbation too small to be meaningful: {initial_median}"
    );

    let mut inputs = inputs_without_rasters(cameras, cnet);
    let opts = SolverOptions {
        robust_threshold: 2.0,
        tri_weight: 1.0,
        camera_position_weight: 0.1,
        // A whisper of rotation inertia keeps the pose samples outside
        // the interpolation kernels well conditioned.
        rotation_weight: 0.01,
        num_iterations: 40,
        ..Default::default()
    };
    let solution = run_jitter_solve(&mut inputs, &opts).unwrap();

    let median =
        median_reprojection_error(&inputs.cameras[0], &inputs.cnet, 0, &solution.tri_points);
    assert!(median <= 0.05, "median reprojection error: {median}");

    // The quaternion-norm constraint kept the samples near unit norm.
    let model = inputs.cameras[0].as_linescan().unwrap();
    for q in model.quaternions.chunks_exact(4) {
        let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
        assert!((norm - 1.0).abs() < 1e-3, "quaternion norm drifted: {norm}");
    }
}

fn flatten_positions(cnet: &jitter_solver::ControlNetwork) -> Vec<f64> {
    cnet.points
        .iter()
        .flat_map(|p| [p.position.x, p.position.y, p.position.z])
        .collect()
}

// A DEM that disagrees with the triangulated heights pulls the points
// onto itself when its uncertainty is small.
#[test]
fn dem_constraint_pulls_points_to_surface() {
    let cameras: Vec<CameraModel> = [0.0, 0.002, 0.004]
        .iter()
        .map(|&lon| CameraModel::Linescan(orbit_linescan(lon, 1e5, DEFAULT_RATE)))
        .collect();
    // Triangulated points sit 5 m above the DEM surface.
    let points = ground_grid(0.012, 0.040, 0.006, 8, 4, 5.0);
    let cnet = build_network(&cameras, &points);
    assert!(cnet.len() >= 20);

    let mut inputs = inputs_without_rasters(cameras, cnet);
    inputs.dem = Some(flat_dem(0.0));
    let opts = SolverOptions {
        heights_from_dem_uncertainty: 0.1,
        heights_from_dem_robust_threshold: 0.5,
        num_iterations: 30,
        ..Default::default()
    };
    let solution = run_jitter_solve(&mut inputs, &opts).unwrap();

    let ell = ellipsoid();
    for ipt in 0..inputs.cnet.len() {
        let xyz = Vector3::new(
            solution.tri_points[3 * ipt],
            solution.tri_points[3 * ipt + 1],
            solution.tri_points[3 * ipt + 2],
        );
        let height = ell.ecef_to_geodetic(&xyz).z;
        assert!(height.abs() <= 0.2, "point {ipt} height: {height}");
    }
}

// Anchor points are fixed by definition: their coordinates must be
// bit-identical before and after the solve.
#[test]
fn anchor_points_do_not_move() {
    let cameras: Vec<CameraModel> = [0.0, 0.002]
        .iter()
        .map(|&lon| CameraModel::Linescan(orbit_linescan(lon, 1e5, DEFAULT_RATE)))
        .collect();
    let points = ground_grid(0.012, 0.040, 0.006, 6, 4, 0.0);
    let cnet = build_network(&cameras, &points);
    let num_cnet_points = cnet.len();

    let mut inputs = inputs_without_rasters(cameras, cnet);
    inputs.anchor_dem = Some(flat_dem(0.0));
    let opts = SolverOptions {
        num_anchor_points_per_image: 10,
        num_anchor_points_extra_lines: 100,
        anchor_weight: 1000.0,
        num_iterations: 10,
        ..Default::default()
    };
    let solution = run_jitter_solve(&mut inputs, &opts).unwrap();

    let num_points = solution.tri_points.len() / 3;
    assert!(
        num_points > num_cnet_points,
        "no anchor points were generated"
    );
    for i in 3 * num_cnet_points..solution.tri_points.len() {
        assert_eq!(
            solution.tri_points[i], solution.orig_tri_points[i],
            "anchor coordinate {i} moved"
        );
    }
}

// Outlier points contribute nothing: the residual count is exactly
// 2 * N_reproj plus the constraint residuals.
#[test]
fn outliers_are_excluded_and_residual_count_matches() {
    let cameras: Vec<CameraModel> = [0.0, 0.002]
        .iter()
        .map(|&lon| CameraModel::Linescan(orbit_linescan(lon, 1e5, DEFAULT_RATE)))
        .collect();
    let points = ground_grid(0.014, 0.038, 0.005, 3, 2, 0.0);
    let cnet = build_network(&cameras, &points);
    assert_eq!(cnet.len(), 6);
    for point in &cnet.points {
        assert_eq!(point.observations.len(), 2);
    }

    let num_quat_samples: usize = cameras
        .iter()
        .map(|c| c.as_linescan().unwrap().num_quaternions())
        .sum();

    let mut outliers = OutlierSet::new();
    outliers.insert(0);

    let mut inputs = inputs_without_rasters(cameras, cnet);
    inputs.outliers = outliers;
    let opts = SolverOptions {
        tri_weight: 0.5,
        num_iterations: 5,
        ..Default::default()
    };
    let solution = run_jitter_solve(&mut inputs, &opts).unwrap();

    // 5 surviving points, 2 observations each, 2 rows per observation;
    // 3 rows of triangulation inertia per point; one quaternion-norm row
    // per sample.
    let expected = 5 * 2 * 2 + 5 * 3 + num_quat_samples;
    assert_eq!(solution.initial_residuals.len(), expected);
    assert_eq!(solution.weight_per_residual.len(), expected);

    // The outlier kept its coordinates to the last bit.
    for c in 0..3 {
        assert_eq!(solution.tri_points[c], solution.orig_tri_points[c]);
    }
}

// A common rigid motion of cameras and points leaves the reprojection
// unchanged: the reprojection term is gauge-invariant.
#[test]
fn reprojection_is_gauge_invariant() {
    let model = orbit_linescan(0.0, 1e5, DEFAULT_RATE);
    let point = ground_grid(0.02, 0.03, 0.004, 1, 1, 0.0)[0];
    let pix = model.ground_to_image(&point, 1e-8).unwrap();

    let rotation = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.5);
    let mut rotated = model.clone();
    for p in rotated.positions.chunks_exact_mut(3) {
        let v = rotation * Vector3::new(p[0], p[1], p[2]);
        p.copy_from_slice(&[v.x, v.y, v.z]);
    }
    for q in rotated.quaternions.chunks_exact_mut(4) {
        let quat = UnitQuaternion::from_quaternion(Quaternion::new(q[3], q[0], q[1], q[2]));
        let r = rotation * quat;
        q.copy_from_slice(&[r.i, r.j, r.k, r.w]);
    }
    let rotated_point = rotation * point;

    let pix_rotated = rotated.ground_to_image(&rotated_point, 1e-8).unwrap();
    assert!(
        (pix - pix_rotated).norm() < 1e-4,
        "gauge violation: {pix:?} vs {pix_rotated:?}"
    );
}

// With an overwhelming rotation weight the optimized quaternions stay at
// their initial values.
#[test]
fn infinite_rotation_weight_freezes_attitude() {
    let cameras: Vec<CameraModel> = [0.0, 0.002]
        .iter()
        .map(|&lon| CameraModel::Linescan(orbit_linescan(lon, 1e5, DEFAULT_RATE)))
        .collect();
    let points = ground_grid(0.012, 0.038, 0.006, 6, 3, 0.0);
    let cnet = build_network(&cameras, &points);

    let mut cameras = cameras;
    if let CameraModel::Linescan(model) = &mut cameras[0] {
        inject_roll_jitter(model, 1e-5, 8.0);
    }
    let initial_quats = cameras[0].as_linescan().unwrap().quaternions.clone();

    let mut inputs = inputs_without_rasters(cameras, cnet);
    let opts = SolverOptions {
        rotation_weight: 1e8,
        num_iterations: 15,
        ..Default::default()
    };
    run_jitter_solve(&mut inputs, &opts).unwrap();

    let model = inputs.cameras[0].as_linescan().unwrap();
    for (qa, qb) in model.quaternions.iter().zip(&initial_quats) {
        assert!(
            (qa - qb).abs() < 1e-6,
            "attitude moved under infinite rotation weight: {qa} vs {qb}"
        );
    }
}
