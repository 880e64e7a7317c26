//! # Jitter Solver
//!
//! A sparse nonlinear least-squares core that refines spacecraft and
//! aerial camera trajectories so that projections of triangulated ground
//! points match observed image features. Linescan sensors carry thousands
//! of sampled pose parameters along their scan timeline; the solver
//! adjusts those samples together with the triangulated points, absorbing
//! the high-frequency attitude error ("jitter") left over after a coarser
//! bundle adjustment.
//!
//! ## Features
//!
//! - **Linescan and frame camera models** with Lagrange-interpolated pose
//!   sampling, resampling, and high-precision ground-to-image projection
//! - **Numeric-diff reprojection residuals** over the exact sub-range of
//!   pose samples that can influence each pixel
//! - **Soft constraints**: DEM anchoring, triangulation inertia,
//!   camera-position and rotation inertia, quaternion-norm, and roll/yaw
//!   satellite-frame constraints, with weights that scale with GSD and
//!   observation counts
//! - **Rig binding** of non-reference sensors to a reference linescan
//!   trajectory through an optimizable rigid transform
//! - **Levenberg-Marquardt** on an iterative Schur solver (PCG with a
//!   Jacobi preconditioner) with a direct sparse Cholesky fallback, built
//!   on the faer linear algebra library
//!
//! All file I/O, interest-point matching, initial triangulation, and
//! report writing live in external collaborators; this crate consumes and
//! produces in-memory structures only.

pub mod camera;
pub mod core;
pub mod error;
pub mod factors;
pub mod geo;
pub mod linalg;
pub mod logger;
pub mod network;
pub mod optimizer;
pub mod options;
pub mod rig;
pub mod solve;

// Re-export the main entry points and types.
pub use camera::{CameraModel, FrameModel, Intrinsics, LinescanModel};
pub use error::{JitterError, JitterResult};
pub use geo::{Dem, Ellipsoid, Georef, RasterGeoref, WeightImage};
pub use logger::{init_logger, init_logger_with_level};
pub use network::{CameraObservations, ControlNetwork, ControlPoint, OutlierSet, PointKind};
pub use optimizer::{OptimizationStatus, SolverSummary};
pub use options::SolverOptions;
pub use rig::{RigCamInfo, RigSet, RigTransform};
pub use solve::{run_jitter_solve, JitterInputs, JitterSolution};
