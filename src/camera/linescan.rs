//! Linescan sensor model with uniformly sampled pose arrays.
//!
//! Positions are sampled every `dt_ephem` seconds from `t0_ephem` and
//! quaternions every `dt_quat` seconds from `t0_quat`. The image timeline
//! is linear: line `l` is exposed at `t0_line + l * dt_line`.

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::error::{JitterError, JitterResult};

use super::interp::{lagrange_interp, INTERP_ORDER};
use super::{Intrinsics, PoseSampler, NUM_QUAT_PARAMS, NUM_XYZ_PARAMS};

/// Cap on the secant iterations of [`LinescanModel::ground_to_image`].
const MAX_PROJECTION_ITERATIONS: usize = 100;

/// A linescan camera with sampled positions and quaternions.
///
/// The pose arrays are deliberately public: the optimizer overwrites
/// sub-ranges of them, and residuals overwrite them in snapshot copies.
/// Quaternions are stored as (x, y, z, w).
#[derive(Debug, Clone)]
pub struct LinescanModel {
    pub positions: Vec<f64>,
    pub quaternions: Vec<f64>,
    pub t0_ephem: f64,
    pub dt_ephem: f64,
    pub t0_quat: f64,
    pub dt_quat: f64,
    /// Time of image line 0.
    pub t0_line: f64,
    /// Seconds per image line; must be positive.
    pub dt_line: f64,
    pub num_lines: usize,
    pub num_samples_per_line: usize,
    pub intrinsics: Intrinsics,
}

impl LinescanModel {
    /// Basic structural validation of the sample arrays.
    pub fn validate(&self) -> JitterResult<()> {
        if self.positions.is_empty() || self.positions.len() % NUM_XYZ_PARAMS != 0 {
            return Err(JitterError::Camera(
                "Linescan position array size must be a positive multiple of 3.".to_string(),
            ));
        }
        if self.quaternions.is_empty() || self.quaternions.len() % NUM_QUAT_PARAMS != 0 {
            return Err(JitterError::Camera(
                "Linescan quaternion array size must be a positive multiple of 4.".to_string(),
            ));
        }
        if self.dt_ephem <= 0.0 || self.dt_quat <= 0.0 || self.dt_line <= 0.0 {
            return Err(JitterError::Camera(
                "Linescan time steps must be positive.".to_string(),
            ));
        }
        Ok(())
    }

    pub fn num_positions(&self) -> usize {
        self.positions.len() / NUM_XYZ_PARAMS
    }

    pub fn num_quaternions(&self) -> usize {
        self.quaternions.len() / NUM_QUAT_PARAMS
    }

    /// Time at which the given (fractional) image line is exposed.
    pub fn time_of_line(&self, line: f64) -> f64 {
        self.t0_line + line * self.dt_line
    }

    /// Image line exposed at the given time.
    pub fn line_of_time(&self, t: f64) -> f64 {
        (t - self.t0_line) / self.dt_line
    }

    /// Divide every quaternion sample by its norm.
    ///
    /// Done once before optimization; afterwards the quaternion-norm soft
    /// constraint keeps the optimized samples near unit norm so that
    /// interpolation between mutated and untouched samples stays stable.
    pub fn normalize_quaternions(&mut self) -> JitterResult<()> {
        for q in self.quaternions.chunks_exact_mut(NUM_QUAT_PARAMS) {
            let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
            if !norm.is_finite() || norm < 1e-12 {
                return Err(JitterError::Camera(format!(
                    "Cannot normalize quaternion with norm {norm}."
                )));
            }
            for c in q.iter_mut() {
                *c /= norm;
            }
        }
        Ok(())
    }

    /// Rebuild the position and quaternion arrays at the requested density,
    /// given as image lines per produced sample. Values <= 0 leave the
    /// corresponding array alone.
    ///
    /// The new sampling covers at least the full image line range; where
    /// the new sample times fall outside the original arrays the
    /// interpolation window is clamped to the array ends.
    pub fn resample(&mut self, num_lines_per_position: i32, num_lines_per_orientation: i32) {
        if num_lines_per_position > 0 {
            let dt_new = self.dt_line * num_lines_per_position as f64;
            let (t0_new, values) = self.resample_series(
                self.t0_ephem,
                self.dt_ephem,
                dt_new,
                &self.positions.clone(),
                NUM_XYZ_PARAMS,
            );
            self.positions = values;
            self.t0_ephem = t0_new;
            self.dt_ephem = dt_new;
        }
        if num_lines_per_orientation > 0 {
            let dt_new = self.dt_line * num_lines_per_orientation as f64;
            let (t0_new, values) = self.resample_series(
                self.t0_quat,
                self.dt_quat,
                dt_new,
                &self.quaternions.clone(),
                NUM_QUAT_PARAMS,
            );
            self.quaternions = values;
            self.t0_quat = t0_new;
            self.dt_quat = dt_new;
        }
    }

    fn resample_series(
        &self,
        t0_old: f64,
        dt_old: f64,
        dt_new: f64,
        values: &[f64],
        dim: usize,
    ) -> (f64, Vec<f64>) {
        let n_old = values.len() / dim;
        let t_last_old = t0_old + ((n_old - 1) as f64) * dt_old;

        // Keep the full image line range covered, and do not shrink the
        // original coverage.
        let t_first_line = self.time_of_line(0.0);
        let t_last_line = self.time_of_line((self.num_lines.max(1) - 1) as f64);
        let t_beg = t0_old.min(t_first_line);
        let t_end = t_last_old.max(t_last_line);

        let n_new = (((t_end - t_beg) / dt_new).ceil() as usize + 1).max(INTERP_ORDER);
        let mut out = vec![0.0; n_new * dim];
        let mut sample = vec![0.0; dim];
        for i in 0..n_new {
            let t = t_beg + (i as f64) * dt_new;
            lagrange_interp(t, t0_old, dt_old, values, dim, &mut sample);
            out[i * dim..(i + 1) * dim].copy_from_slice(&sample);
        }
        (t_beg, out)
    }

    /// Positions interpolated (and extrapolated at the ends) to the
    /// quaternion sample times, one-to-one with the quaternion samples.
    /// Used by the roll/yaw constraint, which needs a position per
    /// orientation sample.
    pub fn positions_at_quaternion_times(&self) -> Vec<f64> {
        let num_quat = self.num_quaternions();
        let mut out = Vec::with_capacity(num_quat * NUM_XYZ_PARAMS);
        let mut p = [0.0; NUM_XYZ_PARAMS];
        for i in 0..num_quat {
            let t = self.t0_quat + (i as f64) * self.dt_quat;
            lagrange_interp(
                t,
                self.t0_ephem,
                self.dt_ephem,
                &self.positions,
                NUM_XYZ_PARAMS,
                &mut p,
            );
            out.extend_from_slice(&p);
        }
        out
    }

    /// Interpolated camera position at time `t`.
    pub fn position_at(&self, t: f64) -> Vector3<f64> {
        let mut p = [0.0; NUM_XYZ_PARAMS];
        lagrange_interp(
            t,
            self.t0_ephem,
            self.dt_ephem,
            &self.positions,
            NUM_XYZ_PARAMS,
            &mut p,
        );
        Vector3::new(p[0], p[1], p[2])
    }

    /// Interpolated camera-to-world rotation at time `t`, normalized after
    /// interpolation.
    pub fn rotation_at(&self, t: f64) -> JitterResult<UnitQuaternion<f64>> {
        let mut q = [0.0; NUM_QUAT_PARAMS];
        lagrange_interp(
            t,
            self.t0_quat,
            self.dt_quat,
            &self.quaternions,
            NUM_QUAT_PARAMS,
            &mut q,
        );
        super::unit_quat_from_xyzw(&q)
    }

    /// Project an ECEF point into the image.
    ///
    /// The exposure time of the point is found by a secant iteration on the
    /// along-track focal-plane coordinate; the iteration stops when that
    /// coordinate is within `precision` pixels of the detector line.
    pub fn ground_to_image(
        &self,
        xyz: &Vector3<f64>,
        precision: f64,
    ) -> JitterResult<Vector2<f64>> {
        ground_to_image_with(self, &self.intrinsics, self, xyz, precision)
    }

    /// Focal-plane coordinates (across, along) of a point seen at time `t`,
    /// through an arbitrary pose source.
    fn focal_plane<S: PoseSampler + ?Sized>(
        sampler: &S,
        intrinsics: &Intrinsics,
        t: f64,
        xyz: &Vector3<f64>,
    ) -> JitterResult<(f64, f64)> {
        let rot = sampler.rotation_at(t)?;
        let pos = sampler.position_at(t);
        let pc = rot.inverse_transform_vector(&(xyz - pos));
        if pc.z <= 0.0 || !pc.z.is_finite() {
            return Err(JitterError::Projection(
                "Point does not project in front of the camera.".to_string(),
            ));
        }
        Ok((
            intrinsics.focal_length * pc.x / pc.z,
            intrinsics.focal_length * pc.y / pc.z,
        ))
    }
}

impl PoseSampler for LinescanModel {
    fn position_at(&self, t: f64) -> Vector3<f64> {
        LinescanModel::position_at(self, t)
    }

    fn rotation_at(&self, t: f64) -> JitterResult<UnitQuaternion<f64>> {
        LinescanModel::rotation_at(self, t)
    }
}

/// Linescan projection through an arbitrary pose source.
///
/// `timeline` supplies the image timeline (line <-> time mapping) while
/// `sampler` supplies the pose at a candidate time. For a plain linescan
/// camera both are the model itself; for a rig-bound sensor the pose comes
/// from the reference trajectory composed with the rig transform.
pub fn ground_to_image_with<S: PoseSampler + ?Sized>(
    sampler: &S,
    intrinsics: &Intrinsics,
    timeline: &LinescanModel,
    xyz: &Vector3<f64>,
    precision: f64,
) -> JitterResult<Vector2<f64>> {
    // Start the secant iteration from the middle of the image.
    let mut t_prev = timeline.time_of_line(0.5 * timeline.num_lines as f64);
    let mut t_curr = t_prev + timeline.dt_line;

    let (_, mut g_prev) = LinescanModel::focal_plane(sampler, intrinsics, t_prev, xyz)?;
    let (_, mut g_curr) = LinescanModel::focal_plane(sampler, intrinsics, t_curr, xyz)?;

    for _ in 0..MAX_PROJECTION_ITERATIONS {
        if g_curr.abs() <= precision {
            let (across, _) = LinescanModel::focal_plane(sampler, intrinsics, t_curr, xyz)?;
            let sample = intrinsics.center_sample + across;
            let line = timeline.line_of_time(t_curr) + intrinsics.center_line;
            if !sample.is_finite() || !line.is_finite() {
                return Err(JitterError::Projection(
                    "Non-finite projected pixel.".to_string(),
                ));
            }
            return Ok(Vector2::new(sample, line));
        }

        let denom = g_curr - g_prev;
        if denom.abs() < f64::EPSILON * (1.0 + g_curr.abs()) {
            return Err(JitterError::Projection(
                "Secant iteration stalled while projecting into the linescan camera.".to_string(),
            ));
        }
        let t_next = t_curr - g_curr * (t_curr - t_prev) / denom;
        if !t_next.is_finite() {
            return Err(JitterError::Projection(
                "Secant iteration diverged while projecting into the linescan camera.".to_string(),
            ));
        }

        t_prev = t_curr;
        g_prev = g_curr;
        t_curr = t_next;
        g_curr = LinescanModel::focal_plane(sampler, intrinsics, t_curr, xyz)?.1;
    }

    Err(JitterError::Projection(format!(
        "Projection into the linescan camera did not reach precision {precision}."
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // A straight-line trajectory high above the x-y plane, looking down.
    fn test_model() -> LinescanModel {
        let num_pos = 40;
        let mut positions = Vec::with_capacity(num_pos * 3);
        for i in 0..num_pos {
            positions.extend_from_slice(&[1000.0 * i as f64, 0.0, 500_000.0]);
        }
        // Camera z looks down (-z world), x across-track (world y),
        // y along-track (world x): columns of cam2world.
        let rot = nalgebra::Rotation3::from_basis_unchecked(&[
            Vector3::y(),
            Vector3::x(),
            -Vector3::z(),
        ]);
        let q = UnitQuaternion::from_rotation_matrix(&rot);
        let mut quaternions = Vec::with_capacity(num_pos * 4);
        for _ in 0..num_pos {
            quaternions.extend_from_slice(&[q.i, q.j, q.k, q.w]);
        }
        LinescanModel {
            positions,
            quaternions,
            t0_ephem: 0.0,
            dt_ephem: 1.0,
            t0_quat: 0.0,
            dt_quat: 1.0,
            t0_line: 5.0,
            dt_line: 0.01,
            num_lines: 3000,
            num_samples_per_line: 2000,
            intrinsics: Intrinsics {
                focal_length: 100_000.0,
                center_sample: 1000.0,
                center_line: 0.0,
            },
        }
    }

    #[test]
    fn timeline_round_trip() {
        let m = test_model();
        assert_relative_eq!(m.line_of_time(m.time_of_line(123.0)), 123.0, epsilon = 1e-9);
    }

    #[test]
    fn projection_hits_nadir_point() {
        let m = test_model();
        // Ground point directly below the camera position at t = 20 s,
        // which is image line (20 - 5) / 0.01 = 1500.
        let xyz = Vector3::new(20_000.0, 0.0, 0.0);
        let pix = m.ground_to_image(&xyz, 1e-8).unwrap();
        assert_relative_eq!(pix.y, 1500.0, epsilon = 1e-4);
        assert_relative_eq!(pix.x, 1000.0, epsilon = 1e-4);
    }

    #[test]
    fn projection_across_track_offset() {
        let m = test_model();
        // 1000 m across track at 500 km altitude with f = 1e5 px is
        // an offset of 1e5 * 1000 / 5e5 = 200 px.
        let xyz = Vector3::new(20_000.0, 1000.0, 0.0);
        let pix = m.ground_to_image(&xyz, 1e-8).unwrap();
        assert_relative_eq!(pix.x, 1200.0, epsilon = 1e-3);
    }

    #[test]
    fn projection_rejects_point_behind_camera() {
        let m = test_model();
        let xyz = Vector3::new(20_000.0, 0.0, 1_000_000.0);
        assert!(m.ground_to_image(&xyz, 1e-8).is_err());
    }

    #[test]
    fn normalize_quaternions_gives_unit_norm() {
        let mut m = test_model();
        for q in m.quaternions.chunks_exact_mut(4) {
            for c in q.iter_mut() {
                *c *= 3.7;
            }
        }
        m.normalize_quaternions().unwrap();
        for q in m.quaternions.chunks_exact(4) {
            let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
            assert_relative_eq!(norm, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn resample_covers_image_lines() {
        let mut m = test_model();
        let old_pix = m
            .ground_to_image(&Vector3::new(20_000.0, 500.0, 0.0), 1e-8)
            .unwrap();
        m.resample(100, 50);
        assert_relative_eq!(m.dt_ephem, 1.0, epsilon = 1e-12);
        assert_relative_eq!(m.dt_quat, 0.5, epsilon = 1e-12);
        // Sampling must reach the last image line.
        let t_last = m.time_of_line((m.num_lines - 1) as f64);
        let n = m.num_positions();
        assert!(m.t0_ephem + ((n - 1) as f64) * m.dt_ephem >= t_last);
        // A straight trajectory resamples exactly; projections agree.
        let new_pix = m
            .ground_to_image(&Vector3::new(20_000.0, 500.0, 0.0), 1e-8)
            .unwrap();
        assert_relative_eq!(old_pix.x, new_pix.x, epsilon = 1e-6);
        assert_relative_eq!(old_pix.y, new_pix.y, epsilon = 1e-6);
    }
}
