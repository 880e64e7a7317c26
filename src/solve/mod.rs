//! The solve driver: prepares the cameras, builds the problem structure,
//! assembles and runs the optimization, and writes the optimized
//! parameters back into the camera models, the triangulated points, and
//! the rig transforms.

pub mod assemble;
pub mod structure;

use nalgebra::Vector3;

use crate::camera::{CameraModel, NUM_QUAT_PARAMS, NUM_XYZ_PARAMS};
use crate::error::{JitterError, JitterResult};
use crate::geo::{Dem, Georef, WeightImage};
use crate::network::{CameraObservations, ControlNetwork, OutlierSet};
use crate::optimizer::{LevenbergMarquardt, OptimizerConfig, SolverSummary};
use crate::options::SolverOptions;
use crate::rig::{RigSet, RigTransform};

pub use assemble::{assemble_problem, AssembledProblem, AssemblyContext, BlockLedger};
pub use structure::{add_anchor_points, build_structure, form_tri_points, ProblemStructure};

const FRAME_PARAMS_PER_CAM: usize = NUM_XYZ_PARAMS + NUM_QUAT_PARAMS;

/// Side storage for frame camera poses during optimization: 7 values per
/// camera, `[x, y, z, qx, qy, qz, qw]`.
///
/// Needed because the frame model's pose is not sample-addressable the way
/// the linescan arrays are; space is allocated for every camera even when
/// it mostly goes unused.
#[derive(Debug, Clone)]
pub struct FrameParams {
    data: Vec<f64>,
}

impl FrameParams {
    pub fn from_cameras(cameras: &[CameraModel]) -> Self {
        let mut data = vec![0.0; cameras.len() * FRAME_PARAMS_PER_CAM];
        for (icam, camera) in cameras.iter().enumerate() {
            if let CameraModel::Frame(frame) = camera {
                let base = icam * FRAME_PARAMS_PER_CAM;
                data[base] = frame.position.x;
                data[base + 1] = frame.position.y;
                data[base + 2] = frame.position.z;
                data[base + NUM_XYZ_PARAMS..base + FRAME_PARAMS_PER_CAM]
                    .copy_from_slice(&frame.quaternion);
            }
        }
        Self { data }
    }

    pub fn position_of(&self, icam: usize) -> &[f64] {
        let base = icam * FRAME_PARAMS_PER_CAM;
        &self.data[base..base + NUM_XYZ_PARAMS]
    }

    pub fn quaternion_of(&self, icam: usize) -> &[f64] {
        let base = icam * FRAME_PARAMS_PER_CAM;
        &self.data[base + NUM_XYZ_PARAMS..base + FRAME_PARAMS_PER_CAM]
    }

    fn set(&mut self, icam: usize, position: &[f64], quaternion: &[f64]) {
        let base = icam * FRAME_PARAMS_PER_CAM;
        self.data[base..base + NUM_XYZ_PARAMS].copy_from_slice(position);
        self.data[base + NUM_XYZ_PARAMS..base + FRAME_PARAMS_PER_CAM].copy_from_slice(quaternion);
    }
}

/// Everything the core consumes, prepared by external collaborators: the
/// initial cameras, the triangulated control network, the optional
/// rasters, and the rig.
pub struct JitterInputs {
    pub cameras: Vec<CameraModel>,
    pub cnet: ControlNetwork,
    /// Points flagged by the external initial-reprojection-error filter.
    pub outliers: OutlierSet,
    /// DEM for the heights-from-dem constraint.
    pub dem: Option<Dem>,
    /// DEM for anchor-point generation.
    pub anchor_dem: Option<Dem>,
    pub weight_image: Option<WeightImage>,
    pub anchor_weight_image: Option<WeightImage>,
    pub rig: Option<RigSet>,
    /// Orbital group of each camera; required for frame cameras under the
    /// roll/yaw constraint.
    pub orbital_groups: Vec<usize>,
    /// Cameras that cannot be evaluated from multiple threads.
    pub single_threaded_cameras: bool,
}

/// What the solve produces beyond the in-place camera updates. The
/// residual vectors and the weight ledger let reporting code recover
/// unweighted residuals by division.
pub struct JitterSolution {
    pub summary: SolverSummary,
    pub weight_per_residual: Vec<f64>,
    pub initial_residuals: Vec<f64>,
    pub final_residuals: Vec<f64>,
    /// Optimized triangulated points (control network + anchors), flat.
    pub tri_points: Vec<f64>,
    /// The same points before optimization.
    pub orig_tri_points: Vec<f64>,
    pub optimized_rig_transforms: Option<Vec<RigTransform>>,
}

fn validate_inputs(inputs: &JitterInputs, opts: &SolverOptions) -> JitterResult<()> {
    opts.validate()?;

    if inputs.cameras.len() < 2 {
        return Err(JitterError::Config(
            "Expecting at least two input cameras.".to_string(),
        ));
    }
    if (opts.num_anchor_points_per_image > 0 || opts.num_anchor_points_per_tile > 0)
        && opts.anchor_weight > 0.0
        && inputs.anchor_dem.is_none()
    {
        return Err(JitterError::Config(
            "Anchor points were requested but no anchor DEM was provided.".to_string(),
        ));
    }
    if (opts.roll_weight > 0.0 || opts.yaw_weight > 0.0)
        && inputs.dem.is_none()
        && inputs.anchor_dem.is_none()
    {
        return Err(JitterError::Config(
            "The roll/yaw constraint requires a DEM or an anchor DEM.".to_string(),
        ));
    }
    if let Some(rig) = &inputs.rig {
        if rig.cam_info.len() != inputs.cameras.len() {
            return Err(JitterError::Config(
                "Each camera must have rig bookkeeping when a rig is used.".to_string(),
            ));
        }
        for info in &rig.cam_info {
            if inputs.cameras[info.ref_cam_index].as_linescan().is_none() {
                return Err(JitterError::Config(
                    "Reference camera must be linescan.".to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Normalize quaternions and resample the linescan pose arrays. Later the
/// optimized quaternions are kept close to normalized by the soft
/// constraint, which keeps interpolation stable when some samples move
/// and some do not.
fn prepare_cameras(cameras: &mut [CameraModel], opts: &SolverOptions) -> JitterResult<()> {
    for camera in cameras.iter_mut() {
        match camera {
            CameraModel::Linescan(model) => {
                model.validate()?;
                model.normalize_quaternions()?;
                // The provided samples may be too few for absorbing
                // jitter; resample to the requested density.
                model.resample(opts.num_lines_per_position, opts.num_lines_per_orientation);
            }
            CameraModel::Frame(model) => {
                model.normalize_quaternion()?;
            }
        }
    }
    Ok(())
}

fn to_vec(residuals: &faer::Mat<f64>) -> Vec<f64> {
    (0..residuals.nrows()).map(|i| residuals[(i, 0)]).collect()
}

/// Write the optimized parameter blocks back into the linescan arrays,
/// the frame side array and models, the triangulated points, and the rig
/// transforms; non-reference rig sensor models are rebuilt from the
/// optimized reference trajectory composed with their transform.
fn update_cameras(
    cameras: &mut [CameraModel],
    frame_params: &mut FrameParams,
    assembled: &AssembledProblem,
    rig: Option<&RigSet>,
) -> Option<Vec<RigTransform>> {
    let problem = &assembled.problem;
    let ledger = &assembled.ledger;

    for (icam, camera) in cameras.iter_mut().enumerate() {
        match camera {
            CameraModel::Linescan(model) => {
                for (qi, block) in ledger.quat_blocks[icam].iter().enumerate() {
                    let values = problem.block_values(*block);
                    model.quaternions[NUM_QUAT_PARAMS * qi..NUM_QUAT_PARAMS * (qi + 1)]
                        .copy_from_slice(values.as_slice());
                }
                for (pi, block) in ledger.pos_blocks[icam].iter().enumerate() {
                    let values = problem.block_values(*block);
                    model.positions[NUM_XYZ_PARAMS * pi..NUM_XYZ_PARAMS * (pi + 1)]
                        .copy_from_slice(values.as_slice());
                }
            }
            CameraModel::Frame(_) => {
                if let Some((pos_block, quat_block)) = ledger.frame_blocks[icam] {
                    frame_params.set(
                        icam,
                        problem.block_values(pos_block).as_slice(),
                        problem.block_values(quat_block).as_slice(),
                    );
                }
            }
        }
    }

    // Copy the side array into the frame models.
    for (icam, camera) in cameras.iter_mut().enumerate() {
        if let CameraModel::Frame(frame) = camera {
            let p = frame_params.position_of(icam);
            frame.position = Vector3::new(p[0], p[1], p[2]);
            frame.quaternion.copy_from_slice(frame_params.quaternion_of(icam));
        }
    }

    let rig = rig?;
    let transforms: Vec<RigTransform> = ledger
        .rig_blocks
        .iter()
        .enumerate()
        .map(|(sensor_id, block)| match block {
            Some(id) => {
                let v = problem.block_values(*id);
                RigTransform([v[0], v[1], v[2], v[3], v[4], v[5]])
            }
            None => rig.ref_to_sensor[sensor_id],
        })
        .collect();

    // Compose the optimized transforms back into the non-reference sensor
    // models from the (already updated) reference trajectories.
    for icam in 0..cameras.len() {
        let info = rig.cam_info[icam];
        if rig.is_ref_sensor(info.sensor_id) {
            continue;
        }
        let transform = transforms[info.sensor_id];
        let ref_model = match &cameras[info.ref_cam_index] {
            CameraModel::Linescan(m) => m.clone(),
            CameraModel::Frame(_) => continue,
        };

        match &mut cameras[icam] {
            CameraModel::Frame(frame) => {
                if let Ok(ref_rot) = ref_model.rotation_at(frame.time) {
                    let ref_pos = ref_model.position_at(frame.time);
                    let (pos, rot) = transform.compose(&ref_pos, &ref_rot);
                    frame.position = pos;
                    frame.quaternion = [rot.i, rot.j, rot.k, rot.w];
                }
            }
            CameraModel::Linescan(model) => {
                for qi in 0..model.num_quaternions() {
                    let t = model.t0_quat + (qi as f64) * model.dt_quat;
                    if let Ok(ref_rot) = ref_model.rotation_at(t) {
                        let rot = ref_rot * transform.rotation();
                        model.quaternions[NUM_QUAT_PARAMS * qi..NUM_QUAT_PARAMS * (qi + 1)]
                            .copy_from_slice(&[rot.i, rot.j, rot.k, rot.w]);
                    }
                }
                for pi in 0..model.num_positions() {
                    let t = model.t0_ephem + (pi as f64) * model.dt_ephem;
                    if let Ok(ref_rot) = ref_model.rotation_at(t) {
                        let ref_pos = ref_model.position_at(t);
                        let (pos, _) = transform.compose(&ref_pos, &ref_rot);
                        model.positions[NUM_XYZ_PARAMS * pi..NUM_XYZ_PARAMS * (pi + 1)]
                            .copy_from_slice(&[pos.x, pos.y, pos.z]);
                    }
                }
            }
        }
    }

    Some(transforms)
}

/// Run the whole jitter solve: prepare cameras, build the structure,
/// assemble, optimize, and write back. The camera models and the
/// triangulated points are mutated in place; `NoConvergence` is a valid
/// exit and still produces updated cameras.
pub fn run_jitter_solve(
    inputs: &mut JitterInputs,
    opts: &SolverOptions,
) -> JitterResult<JitterSolution> {
    validate_inputs(inputs, opts)?;
    prepare_cameras(&mut inputs.cameras, opts)?;

    let frame_params = FrameParams::from_cameras(&inputs.cameras);
    let crn = CameraObservations::from_network(&inputs.cnet, inputs.cameras.len())?;

    // Flatten the network and the anchor points. These arrays must not be
    // resized afterwards: parameter blocks bind to entries within them.
    let mut structure = ProblemStructure::default();
    form_tri_points(
        &mut inputs.cnet,
        inputs.dem.as_ref(),
        &inputs.outliers,
        &mut structure,
    )?;
    build_structure(
        &crn,
        &mut inputs.outliers,
        inputs.weight_image.as_ref(),
        &mut structure,
    );
    if (opts.num_anchor_points_per_image > 0 || opts.num_anchor_points_per_tile > 0)
        && opts.anchor_weight > 0.0
    {
        let anchor_dem = inputs.anchor_dem.as_ref().unwrap();
        add_anchor_points(
            opts,
            anchor_dem,
            inputs.anchor_weight_image.as_ref(),
            &inputs.cameras,
            &mut structure,
        )?;
    }

    let georef = inputs
        .dem
        .as_ref()
        .map(|d| Georef::new(d.ellipsoid))
        .or_else(|| inputs.anchor_dem.as_ref().map(|d| Georef::new(d.ellipsoid)));

    let single_threaded = inputs.single_threaded_cameras || opts.num_threads == 1;
    let ctx = AssemblyContext {
        opts,
        cameras: &inputs.cameras,
        cnet: &inputs.cnet,
        crn: &crn,
        outliers: &inputs.outliers,
        structure: &structure,
        frame_params: &frame_params,
        rig: inputs.rig.as_ref(),
        georef: georef.as_ref(),
        orbital_groups: &inputs.orbital_groups,
        single_threaded,
    };
    let mut assembled = assemble_problem(&ctx)?;

    let layout = assembled.problem.build_layout()?;
    let x0 = assembled.problem.initial_state(&layout);
    let initial_residuals = to_vec(&assembled.problem.evaluate(&layout, &x0));

    let config = OptimizerConfig::from_user_options(opts.num_iterations, opts.parameter_tolerance);
    let mut lm = LevenbergMarquardt::with_config(config);
    let summary = lm.solve_problem(&mut assembled.problem, &layout)?;

    let x_final = assembled.problem.initial_state(&layout);
    let final_residuals = to_vec(&assembled.problem.evaluate(&layout, &x_final));

    let mut frame_params = frame_params;
    let optimized_rig_transforms = update_cameras(
        &mut inputs.cameras,
        &mut frame_params,
        &assembled,
        inputs.rig.as_ref(),
    );

    // Read the optimized points back into the flat array.
    let mut tri_points = structure.tri_points.clone();
    for (ipt, block) in assembled.ledger.tri_blocks.iter().enumerate() {
        let values = assembled.problem.block_values(*block);
        tri_points[NUM_XYZ_PARAMS * ipt..NUM_XYZ_PARAMS * (ipt + 1)]
            .copy_from_slice(values.as_slice());
    }

    Ok(JitterSolution {
        summary,
        weight_per_residual: assembled.weight_per_residual,
        initial_residuals,
        final_residuals,
        tri_points,
        orig_tri_points: structure.orig_tri_points,
        optimized_rig_transforms,
    })
}
