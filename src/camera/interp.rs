//! Lagrange interpolation over uniformly sampled series, and the
//! calculation of which samples can influence a given time interval.
//!
//! Pose samples (positions and quaternions) are stored as flat arrays with
//! a fixed number of coordinates per sample, sampled uniformly in time from
//! `t0` with step `dt`. Interpolation is Lagrange of order 8; near the ends
//! of the array the 8-sample window slides inward so the order is preserved
//! (arrays shorter than 8 samples degrade to using every sample).

use std::ops::Range;

use crate::error::{JitterError, JitterResult};

/// Order of Lagrange interpolation used for pose samples.
pub const INTERP_ORDER: usize = 8;

/// Range of sample indices whose interpolation kernel can influence any
/// time in `[time1, time2]`, as a half-open range.
///
/// The Lagrange kernel of order K reaches K/2 samples on either side of its
/// center, plus rounding slack. Fails if the clamped range is empty, which
/// in practice means the image and camera timelines disagree.
pub fn sample_range(
    time1: f64,
    time2: f64,
    t0: f64,
    dt: f64,
    num_vals: usize,
) -> JitterResult<Range<usize>> {
    let half = (INTERP_ORDER / 2) as i64;

    let index1 = ((time1 - t0) / dt).floor() as i64;
    let index2 = ((time2 - t0) / dt).floor() as i64;

    let beg = index1.min(index2) - half + 1;
    let end = index1.max(index2) + half + 1;

    let beg = beg.max(0) as usize;
    let end = (end.max(0) as usize).min(num_vals);
    if beg >= end {
        return Err(JitterError::degenerate_range());
    }

    Ok(beg..end)
}

/// Interpolate a `dim`-dimensional sample series at time `t`.
///
/// `values` holds `dim` coordinates per sample. The result is written into
/// `out`, which must have length `dim`.
pub fn lagrange_interp(t: f64, t0: f64, dt: f64, values: &[f64], dim: usize, out: &mut [f64]) {
    debug_assert_eq!(values.len() % dim, 0);
    debug_assert_eq!(out.len(), dim);

    let n = values.len() / dim;
    if n == 1 {
        out.copy_from_slice(&values[0..dim]);
        return;
    }

    // Window of samples around t, slid inward at the array ends.
    let order = INTERP_ORDER.min(n);
    let center = ((t - t0) / dt).floor() as i64;
    let beg = (center - (order as i64) / 2 + 1).clamp(0, (n - order) as i64) as usize;

    for item in out.iter_mut() {
        *item = 0.0;
    }

    for i in beg..beg + order {
        let ti = t0 + (i as f64) * dt;
        let mut basis = 1.0;
        for j in beg..beg + order {
            if j == i {
                continue;
            }
            let tj = t0 + (j as f64) * dt;
            basis *= (t - tj) / (ti - tj);
        }
        for c in 0..dim {
            out[c] += basis * values[i * dim + c];
        }
    }
}
