//! Problem assembler: wires the cost functions to parameter blocks.
//!
//! Reprojection residuals are added in two passes, first the match points
//! and then the anchor points, so the residual order can be reconstructed
//! by reporting code without extra bookkeeping. Every residual row's
//! weight is appended to a ledger so unweighted residuals can be recovered
//! by division.

use std::sync::Arc;

use nalgebra::DVector;

use crate::camera::{
    interp::sample_range, CameraModel, LinescanModel, NUM_QUAT_PARAMS, NUM_XYZ_PARAMS,
    PIXEL_SIZE,
};
use crate::core::{BlockId, CauchyLoss, Problem};
use crate::error::{JitterError, JitterResult};
use crate::factors::{
    FrameReprojection, LinescanReprojection, ObservedSensor, QuatNormError, RigReprojection,
    RollYawError, RotationError, TranslationError, XyzError,
};
use crate::geo::Georef;
use crate::network::{CameraObservations, ControlNetwork, OutlierSet, PointKind};
use crate::options::SolverOptions;
use crate::rig::RigSet;
use crate::solve::structure::{estimate_gsd_per_point, median, ProblemStructure};
use crate::solve::FrameParams;

/// Where each camera's and point's parameter blocks live in the problem.
/// Used by the driver to write the optimized values back.
#[derive(Debug, Clone, Default)]
pub struct BlockLedger {
    /// Per camera, one block per quaternion sample (empty for frame).
    pub quat_blocks: Vec<Vec<BlockId>>,
    /// Per camera, one block per position sample (empty for frame).
    pub pos_blocks: Vec<Vec<BlockId>>,
    /// Per frame camera: (position, quaternion) blocks in the side array.
    pub frame_blocks: Vec<Option<(BlockId, BlockId)>>,
    /// One block per triangulated point (control network + anchors).
    pub tri_blocks: Vec<BlockId>,
    /// Per rig sensor: the 6-parameter transform block, for non-reference
    /// sensors.
    pub rig_blocks: Vec<Option<BlockId>>,
}

/// The assembled problem plus the ledgers the driver and the reporting
/// code need.
pub struct AssembledProblem {
    pub problem: Problem,
    pub ledger: BlockLedger,
    /// One entry per residual row, holding the weight that row was
    /// multiplied by.
    pub weight_per_residual: Vec<f64>,
    /// Median per-observation camera-position weight, per pass (match,
    /// anchor) and camera.
    pub weight_per_cam: [Vec<f64>; 2],
    /// Observation count behind each median, per pass and camera.
    pub count_per_cam: [Vec<f64>; 2],
}

/// Everything the assembler reads; bundled to keep the call sites sane.
pub struct AssemblyContext<'a> {
    pub opts: &'a SolverOptions,
    pub cameras: &'a [CameraModel],
    pub cnet: &'a ControlNetwork,
    pub crn: &'a CameraObservations,
    pub outliers: &'a OutlierSet,
    pub structure: &'a ProblemStructure,
    pub frame_params: &'a FrameParams,
    pub rig: Option<&'a RigSet>,
    /// Map frame for the roll/yaw constraint; required when the roll or
    /// yaw weight is positive.
    pub georef: Option<&'a Georef>,
    /// Orbital group of each camera; required for frame cameras under the
    /// roll/yaw constraint.
    pub orbital_groups: &'a [usize],
    pub single_threaded: bool,
}

/// Build the full problem: reprojection residuals plus every enabled soft
/// constraint, in the fixed order the residual reports rely on.
pub fn assemble_problem(ctx: &AssemblyContext) -> JitterResult<AssembledProblem> {
    let num_cameras = ctx.cameras.len();

    let mut problem = Problem::new();
    problem.set_single_threaded(ctx.single_threaded);

    // Snapshot the linescan models once; the factors clone per call.
    let snapshots: Vec<Option<Arc<LinescanModel>>> = ctx
        .cameras
        .iter()
        .map(|cam| cam.as_linescan().cloned().map(Arc::new))
        .collect();

    let ledger = register_parameter_blocks(ctx, &mut problem, &snapshots);

    let mut assembled = AssembledProblem {
        problem,
        ledger,
        weight_per_residual: Vec::new(),
        weight_per_cam: [vec![0.0; num_cameras], vec![0.0; num_cameras]],
        count_per_cam: [vec![0.0; num_cameras], vec![0.0; num_cameras]],
    };

    add_reprojection_residuals(ctx, &snapshots, &mut assembled)?;

    if ctx.structure.dem_xyz.iter().any(|v| v.norm() > 0.0) {
        add_dem_constraint(ctx, &mut assembled)?;
    }

    if ctx.opts.tri_weight > 0.0 {
        add_tri_constraint(ctx, &mut assembled);
    }

    if ctx.opts.camera_position_weight > 0.0 {
        add_camera_position_constraint(ctx, &snapshots, &mut assembled);
    }

    add_quat_norm_rotation_constraints(ctx, &snapshots, &mut assembled);

    if ctx.opts.roll_weight > 0.0 || ctx.opts.yaw_weight > 0.0 {
        add_roll_yaw_constraint(ctx, &snapshots, &mut assembled)?;
    }

    Ok(assembled)
}

/// Register every pose sample, frame pose, triangulated point, and rig
/// transform as a parameter block. Blocks no residual ends up touching are
/// excluded from the column layout, so over-registration is harmless.
fn register_parameter_blocks(
    ctx: &AssemblyContext,
    problem: &mut Problem,
    snapshots: &[Option<Arc<LinescanModel>>],
) -> BlockLedger {
    let num_cameras = ctx.cameras.len();
    let mut ledger = BlockLedger {
        quat_blocks: vec![Vec::new(); num_cameras],
        pos_blocks: vec![Vec::new(); num_cameras],
        frame_blocks: vec![None; num_cameras],
        tri_blocks: Vec::new(),
        rig_blocks: Vec::new(),
    };

    for (icam, camera) in ctx.cameras.iter().enumerate() {
        match camera {
            CameraModel::Linescan(_) => {
                let model = snapshots[icam].as_ref().unwrap();
                for qi in 0..model.num_quaternions() {
                    let values = DVector::from_column_slice(
                        &model.quaternions[NUM_QUAT_PARAMS * qi..NUM_QUAT_PARAMS * (qi + 1)],
                    );
                    ledger.quat_blocks[icam].push(problem.add_param_block(values));
                }
                for pi in 0..model.num_positions() {
                    let values = DVector::from_column_slice(
                        &model.positions[NUM_XYZ_PARAMS * pi..NUM_XYZ_PARAMS * (pi + 1)],
                    );
                    ledger.pos_blocks[icam].push(problem.add_param_block(values));
                }
            }
            CameraModel::Frame(_) => {
                let pos =
                    problem.add_param_block(DVector::from_column_slice(ctx.frame_params.position_of(icam)));
                let quat =
                    problem.add_param_block(DVector::from_column_slice(ctx.frame_params.quaternion_of(icam)));
                ledger.frame_blocks[icam] = Some((pos, quat));
            }
        }
    }

    for ipt in 0..ctx.structure.num_points() {
        let tri = ctx.structure.tri_point(ipt);
        let id = problem.add_param_block(DVector::from_vec(vec![tri.x, tri.y, tri.z]));
        problem.mark_point_block(id);
        ledger.tri_blocks.push(id);
    }

    if let Some(rig) = ctx.rig {
        for sensor_id in 0..rig.num_sensors() {
            if rig.is_ref_sensor(sensor_id) {
                ledger.rig_blocks.push(None);
            } else {
                let values = DVector::from_column_slice(&rig.ref_to_sensor[sensor_id].0);
                ledger.rig_blocks.push(Some(problem.add_param_block(values)));
            }
        }
    }

    ledger
}

/// The pose-sample window of a linescan observation: the image-line window
/// grown by the reprojection slack, mapped to sample index ranges.
fn linescan_sample_windows(
    opts: &SolverOptions,
    model: &LinescanModel,
    line: f64,
) -> JitterResult<(std::ops::Range<usize>, std::ops::Range<usize>)> {
    // Grow the window because during optimization the 3D point and its
    // pixel may move somewhat.
    let line_extra = opts.max_initial_reprojection_error + 5.0;
    let time1 = model.time_of_line(line - line_extra);
    let time2 = model.time_of_line(line + line_extra);

    let quat_range = sample_range(
        time1,
        time2,
        model.t0_quat,
        model.dt_quat,
        model.num_quaternions(),
    )?;
    let pos_range = sample_range(
        time1,
        time2,
        model.t0_ephem,
        model.dt_ephem,
        model.num_positions(),
    )?;
    Ok((quat_range, pos_range))
}

fn add_linescan_reprojection(
    ctx: &AssemblyContext,
    icam: usize,
    model: &Arc<LinescanModel>,
    pix: nalgebra::Vector2<f64>,
    weight: f64,
    tri_block: BlockId,
    assembled: &mut AssembledProblem,
) -> JitterResult<()> {
    let (quat_range, pos_range) = linescan_sample_windows(ctx.opts, model, pix.y)?;

    let mut params: Vec<BlockId> = Vec::with_capacity(quat_range.len() + pos_range.len() + 1);
    params.extend_from_slice(&assembled.ledger.quat_blocks[icam][quat_range.clone()]);
    params.extend_from_slice(&assembled.ledger.pos_blocks[icam][pos_range.clone()]);
    params.push(tri_block);

    let factor = LinescanReprojection::new(pix, weight, Arc::clone(model), quat_range, pos_range);
    assembled.problem.add_residual_block(
        Box::new(factor),
        Some(Box::new(CauchyLoss::new(ctx.opts.robust_threshold))),
        params,
    );
    Ok(())
}

fn add_frame_reprojection(
    ctx: &AssemblyContext,
    icam: usize,
    pix: nalgebra::Vector2<f64>,
    weight: f64,
    tri_block: BlockId,
    assembled: &mut AssembledProblem,
) -> JitterResult<()> {
    let (pos_block, quat_block) = assembled.ledger.frame_blocks[icam].ok_or_else(|| {
        JitterError::Camera("Frame camera has no registered pose blocks.".to_string())
    })?;
    let intrinsics = ctx.cameras[icam]
        .as_frame()
        .ok_or_else(|| JitterError::Camera("Unknown camera model.".to_string()))?
        .intrinsics;

    let factor = FrameReprojection::new(pix, weight, intrinsics);
    assembled.problem.add_residual_block(
        Box::new(factor),
        Some(Box::new(CauchyLoss::new(ctx.opts.robust_threshold))),
        vec![pos_block, quat_block, tri_block],
    );
    Ok(())
}

fn add_rig_reprojection(
    ctx: &AssemblyContext,
    rig: &RigSet,
    icam: usize,
    snapshots: &[Option<Arc<LinescanModel>>],
    pix: nalgebra::Vector2<f64>,
    weight: f64,
    tri_block: BlockId,
    assembled: &mut AssembledProblem,
) -> JitterResult<()> {
    let info = rig.cam_info[icam];
    let ref_cam = info.ref_cam_index;
    let ref_model = snapshots[ref_cam].as_ref().ok_or_else(|| {
        JitterError::Config("Reference camera must be linescan.".to_string())
    })?;
    let rig_block = assembled.ledger.rig_blocks[info.sensor_id].ok_or_else(|| {
        JitterError::Config("Non-reference rig sensor has no transform block.".to_string())
    })?;

    // The pose-sample window on the reference trajectory, around the
    // observation time of the observed sensor.
    let (observed, time1, time2) = match &ctx.cameras[icam] {
        CameraModel::Frame(frame) => {
            let slack = (ctx.opts.max_initial_reprojection_error + 5.0) * ref_model.dt_line;
            (
                ObservedSensor::Frame {
                    intrinsics: frame.intrinsics,
                    time: frame.time,
                },
                frame.time - slack,
                frame.time + slack,
            )
        }
        CameraModel::Linescan(_) => {
            let model = snapshots[icam].as_ref().unwrap();
            let line_extra = ctx.opts.max_initial_reprojection_error + 5.0;
            (
                ObservedSensor::Linescan {
                    model: Arc::clone(model),
                },
                model.time_of_line(pix.y - line_extra),
                model.time_of_line(pix.y + line_extra),
            )
        }
    };

    let quat_range = sample_range(
        time1,
        time2,
        ref_model.t0_quat,
        ref_model.dt_quat,
        ref_model.num_quaternions(),
    )?;
    let pos_range = sample_range(
        time1,
        time2,
        ref_model.t0_ephem,
        ref_model.dt_ephem,
        ref_model.num_positions(),
    )?;

    let mut params: Vec<BlockId> =
        Vec::with_capacity(quat_range.len() + pos_range.len() + 2);
    params.extend_from_slice(&assembled.ledger.quat_blocks[ref_cam][quat_range.clone()]);
    params.extend_from_slice(&assembled.ledger.pos_blocks[ref_cam][pos_range.clone()]);
    params.push(rig_block);
    params.push(tri_block);

    let factor = RigReprojection::new(
        pix,
        weight,
        Arc::clone(ref_model),
        quat_range,
        pos_range,
        observed,
    );
    assembled.problem.add_residual_block(
        Box::new(factor),
        Some(Box::new(CauchyLoss::new(ctx.opts.robust_threshold))),
        params,
    );
    Ok(())
}

/// Add all reprojection residuals, collecting the per-camera weight
/// medians and counts the camera-position constraint scales with.
///
/// Two passes: pass 0 is the match points, pass 1 the anchor points.
fn add_reprojection_residuals(
    ctx: &AssemblyContext,
    snapshots: &[Option<Arc<LinescanModel>>],
    assembled: &mut AssembledProblem,
) -> JitterResult<()> {
    for pass in 0..2 {
        for icam in 0..ctx.cameras.len() {
            let mut cam_position_weights: Vec<f64> = Vec::new();

            for iobs in 0..ctx.structure.pixels[icam].len() {
                let pix = ctx.structure.pixels[icam][iobs];
                let weight = ctx.structure.weights[icam][iobs];
                let is_anchor = ctx.structure.is_anchor[icam][iobs];
                let ipt = ctx.structure.point_index[icam][iobs];
                let tri_block = assembled.ledger.tri_blocks[ipt];

                if usize::from(is_anchor) != pass {
                    continue;
                }

                let is_rig_non_ref = ctx
                    .rig
                    .map(|rig| !rig.is_ref_sensor(rig.cam_info[icam].sensor_id))
                    .unwrap_or(false);

                if is_rig_non_ref {
                    let rig = ctx.rig.unwrap();
                    add_rig_reprojection(
                        ctx, rig, icam, snapshots, pix, weight, tri_block, assembled,
                    )?;
                } else {
                    match &ctx.cameras[icam] {
                        CameraModel::Linescan(_) => {
                            let model = snapshots[icam].as_ref().unwrap();
                            add_linescan_reprojection(
                                ctx, icam, model, pix, weight, tri_block, assembled,
                            )?;
                        }
                        CameraModel::Frame(_) => {
                            add_frame_reprojection(ctx, icam, pix, weight, tri_block, assembled)?;
                        }
                    }
                }

                // Two residual rows were added; record their weight.
                for _ in 0..PIXEL_SIZE {
                    assembled.weight_per_residual.push(weight);
                }

                // Anchor points are fixed by definition. They try to
                // prevent the cameras from moving too much from the
                // original poses.
                if is_anchor {
                    assembled.problem.set_block_fixed(tri_block);
                }

                // The weight to use later with the camera-position
                // constraint; skip silently when the GSD fails.
                let xyz = ctx.structure.tri_point(ipt);
                let gsd = ctx.cameras[icam].estimated_gsd(&pix, &xyz);
                if gsd <= 0.0 || !gsd.is_finite() {
                    continue;
                }
                cam_position_weights.push(ctx.opts.camera_position_weight * weight / gsd);
            }

            assembled.count_per_cam[pass][icam] = cam_position_weights.len() as f64;
            assembled.weight_per_cam[pass][icam] = if cam_position_weights.is_empty() {
                0.0
            } else {
                median(&mut cam_position_weights)
            };
        }
    }
    Ok(())
}

/// Pull DEM-constrained points toward the DEM surface.
fn add_dem_constraint(
    ctx: &AssemblyContext,
    assembled: &mut AssembledProblem,
) -> JitterResult<()> {
    let xyz_weight = 1.0 / ctx.opts.heights_from_dem_uncertainty;
    let xyz_threshold = ctx.opts.heights_from_dem_robust_threshold;

    for ipt in 0..ctx.structure.num_cnet_points {
        if ctx.cnet.points[ipt].kind == PointKind::Gcp {
            return Err(JitterError::Config(
                "Found a GCP where not expecting any.".to_string(),
            ));
        }
        let observation = ctx.structure.dem_xyz[ipt];
        if ctx.outliers.contains(&ipt) || observation == nalgebra::Vector3::zeros() {
            continue;
        }

        assembled.problem.add_residual_block(
            Box::new(XyzError::new(observation, xyz_weight)),
            Some(Box::new(CauchyLoss::new(xyz_threshold))),
            vec![assembled.ledger.tri_blocks[ipt]],
        );
        for _ in 0..NUM_XYZ_PARAMS {
            assembled.weight_per_residual.push(xyz_weight);
        }
    }
    Ok(())
}

/// Keep triangulated points close to their initial values, in pixel units
/// via the per-point GSD.
fn add_tri_constraint(ctx: &AssemblyContext, assembled: &mut AssembledProblem) {
    let gsds = estimate_gsd_per_point(ctx.cameras, ctx.crn, ctx.outliers, ctx.structure);

    for ipt in 0..ctx.structure.num_cnet_points {
        // GCPs and height-from-dem points have their own constraints.
        match ctx.cnet.points[ipt].kind {
            PointKind::Gcp | PointKind::FromDem => continue,
            PointKind::Triangulated => {}
        }
        if ctx.outliers.contains(&ipt) {
            continue;
        }

        let gsd = gsds[ipt];
        if gsd <= 0.0 {
            continue;
        }
        let weight = ctx.opts.tri_weight / gsd;
        let observation = ctx.structure.tri_point(ipt);

        assembled.problem.add_residual_block(
            Box::new(XyzError::new(observation, weight)),
            Some(Box::new(CauchyLoss::new(ctx.opts.tri_robust_threshold))),
            vec![assembled.ledger.tri_blocks[ipt]],
        );
        for _ in 0..NUM_XYZ_PARAMS {
            assembled.weight_per_residual.push(ctx.opts.tri_weight);
        }
    }
}

/// Camera-position inertia, scaled with the observation count and median
/// per-observation weight so the pull is proportional to the reprojection
/// evidence. Adding N residuals of weight w and threshold t is equivalent
/// to one residual of weight sqrt(N) w and threshold sqrt(N) t; linescan
/// additionally splits the pull across its position samples.
fn add_camera_position_constraint(
    ctx: &AssemblyContext,
    snapshots: &[Option<Arc<LinescanModel>>],
    assembled: &mut AssembledProblem,
) {
    for pass in 0..2 {
        for icam in 0..ctx.cameras.len() {
            if let Some(rig) = ctx.rig {
                if !rig.is_ref_sensor(rig.cam_info[icam].sensor_id) {
                    continue;
                }
            }

            let median_wt = assembled.weight_per_cam[pass][icam];
            let count = assembled.count_per_cam[pass][icam];
            if count <= 0.0 {
                continue;
            }

            let combined_wt = count.sqrt() * median_wt;
            let combined_th = count.sqrt() * ctx.opts.camera_position_robust_threshold;

            match &ctx.cameras[icam] {
                CameraModel::Linescan(_) => {
                    let model = snapshots[icam].as_ref().unwrap();
                    let num_pos = model.num_positions();
                    // Splitting across samples keeps the total squared
                    // residual invariant to the resampling density.
                    let wt = combined_wt / (num_pos as f64).sqrt();
                    let th = combined_th / (num_pos as f64).sqrt();
                    for pi in 0..num_pos {
                        let initial =
                            &model.positions[NUM_XYZ_PARAMS * pi..NUM_XYZ_PARAMS * (pi + 1)];
                        assembled.problem.add_residual_block(
                            Box::new(TranslationError::new(initial, wt)),
                            Some(Box::new(CauchyLoss::new(th))),
                            vec![assembled.ledger.pos_blocks[icam][pi]],
                        );
                        for _ in 0..NUM_XYZ_PARAMS {
                            assembled.weight_per_residual.push(wt);
                        }
                    }
                }
                CameraModel::Frame(_) => {
                    let (pos_block, _) = assembled.ledger.frame_blocks[icam].unwrap();
                    let initial = ctx.frame_params.position_of(icam);
                    assembled.problem.add_residual_block(
                        Box::new(TranslationError::new(initial, combined_wt)),
                        Some(Box::new(CauchyLoss::new(combined_th))),
                        vec![pos_block],
                    );
                    for _ in 0..NUM_XYZ_PARAMS {
                        assembled.weight_per_residual.push(combined_wt);
                    }
                }
            }
        }
    }
}

/// Rotation inertia and the quaternion-norm soft constraint, per
/// quaternion sample. Neither uses a loss function: the quaternions have
/// no outliers.
fn add_quat_norm_rotation_constraints(
    ctx: &AssemblyContext,
    snapshots: &[Option<Arc<LinescanModel>>],
    assembled: &mut AssembledProblem,
) {
    // With a rig, only the reference sensors' samples are free
    // parameters; the others are bound through the rig transform.
    let skip_cam = |icam: usize| -> bool {
        ctx.rig
            .map(|rig| !rig.is_ref_sensor(rig.cam_info[icam].sensor_id))
            .unwrap_or(false)
    };

    if ctx.opts.rotation_weight > 0.0 {
        for icam in 0..ctx.cameras.len() {
            if skip_cam(icam) {
                continue;
            }
            match &ctx.cameras[icam] {
                CameraModel::Linescan(_) => {
                    let model = snapshots[icam].as_ref().unwrap();
                    for qi in 0..model.num_quaternions() {
                        let initial =
                            &model.quaternions[NUM_QUAT_PARAMS * qi..NUM_QUAT_PARAMS * (qi + 1)];
                        assembled.problem.add_residual_block(
                            Box::new(RotationError::new(initial, ctx.opts.rotation_weight)),
                            None,
                            vec![assembled.ledger.quat_blocks[icam][qi]],
                        );
                        for _ in 0..NUM_QUAT_PARAMS {
                            assembled.weight_per_residual.push(ctx.opts.rotation_weight);
                        }
                    }
                }
                CameraModel::Frame(_) => {
                    let (_, quat_block) = assembled.ledger.frame_blocks[icam].unwrap();
                    let initial = ctx.frame_params.quaternion_of(icam);
                    assembled.problem.add_residual_block(
                        Box::new(RotationError::new(initial, ctx.opts.rotation_weight)),
                        None,
                        vec![quat_block],
                    );
                    for _ in 0..NUM_QUAT_PARAMS {
                        assembled.weight_per_residual.push(ctx.opts.rotation_weight);
                    }
                }
            }
        }
    }

    if ctx.opts.quat_norm_weight > 0.0 {
        for icam in 0..ctx.cameras.len() {
            if skip_cam(icam) {
                continue;
            }
            match &ctx.cameras[icam] {
                CameraModel::Linescan(_) => {
                    let model = snapshots[icam].as_ref().unwrap();
                    for qi in 0..model.num_quaternions() {
                        assembled.problem.add_residual_block(
                            Box::new(QuatNormError::new(ctx.opts.quat_norm_weight)),
                            None,
                            vec![assembled.ledger.quat_blocks[icam][qi]],
                        );
                        assembled.weight_per_residual.push(ctx.opts.quat_norm_weight);
                    }
                }
                CameraModel::Frame(_) => {
                    let (_, quat_block) = assembled.ledger.frame_blocks[icam].unwrap();
                    assembled.problem.add_residual_block(
                        Box::new(QuatNormError::new(ctx.opts.quat_norm_weight)),
                        None,
                        vec![quat_block],
                    );
                    assembled.weight_per_residual.push(ctx.opts.quat_norm_weight);
                }
            }
        }
    }
}

/// Roll/yaw constraint. Linescan uses the whole sample sequence of each
/// camera; frame cameras use the trajectory of their orbital group.
fn add_roll_yaw_constraint(
    ctx: &AssemblyContext,
    snapshots: &[Option<Arc<LinescanModel>>],
    assembled: &mut AssembledProblem,
) -> JitterResult<()> {
    let georef = ctx.georef.ok_or_else(|| {
        JitterError::Config(
            "The roll/yaw constraint needs a DEM to define the map frame.".to_string(),
        )
    })?;

    let has_frame = ctx.cameras.iter().any(|c| c.as_frame().is_some());
    if has_frame && ctx.orbital_groups.len() != ctx.cameras.len() {
        return Err(JitterError::Config(
            "Failed to add each input camera to an orbital group.".to_string(),
        ));
    }

    // The recorded weight must not be zero, as reporting divides by it.
    let recorded_roll = ctx.opts.roll_weight.max(1.0);
    let recorded_yaw = ctx.opts.yaw_weight.max(1.0);

    // Frame cameras in one orbital group share a trajectory assembled
    // from their poses, in camera order.
    let mut group_positions: std::collections::BTreeMap<usize, Vec<f64>> = Default::default();
    let mut group_quaternions: std::collections::BTreeMap<usize, Vec<f64>> = Default::default();
    let mut index_in_group: Vec<usize> = vec![0; ctx.cameras.len()];
    for (icam, camera) in ctx.cameras.iter().enumerate() {
        if let Some(frame) = camera.as_frame() {
            let group = ctx.orbital_groups[icam];
            let positions = group_positions.entry(group).or_default();
            let quaternions = group_quaternions.entry(group).or_default();
            index_in_group[icam] = positions.len() / NUM_XYZ_PARAMS;
            positions.extend_from_slice(&[frame.position.x, frame.position.y, frame.position.z]);
            quaternions.extend_from_slice(&frame.quaternion);
        }
    }

    for (icam, camera) in ctx.cameras.iter().enumerate() {
        if let Some(rig) = ctx.rig {
            if !rig.is_ref_sensor(rig.cam_info[icam].sensor_id) {
                continue;
            }
        }

        match camera {
            CameraModel::Linescan(_) => {
                let model = snapshots[icam].as_ref().unwrap();
                // Make the positions one-to-one with the quaternions.
                let interp_positions = model.positions_at_quaternion_times();
                for qi in 0..model.num_quaternions() {
                    let factor = RollYawError::new(
                        &interp_positions,
                        &model.quaternions,
                        georef,
                        qi,
                        ctx.opts.roll_weight,
                        ctx.opts.yaw_weight,
                        ctx.opts.initial_camera_constraint,
                    )?;
                    assembled.problem.add_residual_block(
                        Box::new(factor),
                        None,
                        vec![assembled.ledger.quat_blocks[icam][qi]],
                    );
                    assembled.weight_per_residual.push(recorded_roll);
                    assembled.weight_per_residual.push(recorded_yaw);
                }
            }
            CameraModel::Frame(_) => {
                let group = ctx.orbital_groups[icam];
                let positions = &group_positions[&group];
                let quaternions = &group_quaternions[&group];
                if positions.len() / NUM_XYZ_PARAMS < 2 {
                    tracing::warn!(
                        "Cannot add a roll and/or yaw constraint for an orbital group \
                         consisting of only one frame camera."
                    );
                    continue;
                }
                let factor = RollYawError::new(
                    positions,
                    quaternions,
                    georef,
                    index_in_group[icam],
                    ctx.opts.roll_weight,
                    ctx.opts.yaw_weight,
                    ctx.opts.initial_camera_constraint,
                )?;
                let (_, quat_block) = assembled.ledger.frame_blocks[icam].unwrap();
                assembled
                    .problem
                    .add_residual_block(Box::new(factor), None, vec![quat_block]);
                assembled.weight_per_residual.push(recorded_roll);
                assembled.weight_per_residual.push(recorded_yaw);
            }
        }
    }
    Ok(())
}
