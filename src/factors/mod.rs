//! Cost functions of the jitter problem.
//!
//! Reprojection residuals (plain and rig-composed) go through the camera
//! projection and are differentiated numerically; the prior-style
//! constraints carry exact Jacobians. Every residual is multiplied by its
//! scalar weight inside the factor; robust behavior is applied by the
//! problem's loss functions, not here.

pub mod priors;
pub mod reprojection;
pub mod rig_reprojection;
pub mod roll_yaw;

pub use priors::{QuatNormError, RotationError, TranslationError, XyzError};
pub use reprojection::{FrameReprojection, LinescanReprojection};
pub use rig_reprojection::{ObservedSensor, RigReprojection};
pub use roll_yaw::RollYawError;
