//! Geodesy support: ellipsoid conversions, a geographic map frame, and the
//! satellite along/across/down frame used by the roll/yaw constraint.
//!
//! All rasters and georeferences are in-memory structures; no file I/O
//! happens anywhere in this crate.

pub mod dem;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{JitterError, JitterResult};

pub use dem::{Dem, RasterGeoref, WeightImage};

/// Step, in degrees, for the central differences that convert map-frame
/// directions to ECEF directions.
const PROJ_DELTA_DEG: f64 = 1.0e-4;

/// A biaxial reference ellipsoid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ellipsoid {
    /// Semi-major axis, meters.
    pub semi_major: f64,
    /// Semi-minor axis, meters.
    pub semi_minor: f64,
}

impl Ellipsoid {
    pub const WGS84: Ellipsoid = Ellipsoid {
        semi_major: 6_378_137.0,
        semi_minor: 6_356_752.314_245,
    };

    fn ecc2(&self) -> f64 {
        let a2 = self.semi_major * self.semi_major;
        let b2 = self.semi_minor * self.semi_minor;
        (a2 - b2) / a2
    }

    /// Geodetic (lon, lat in degrees, height in meters) to ECEF.
    pub fn geodetic_to_ecef(&self, lon_lat_height: &Vector3<f64>) -> Vector3<f64> {
        let lon = lon_lat_height.x.to_radians();
        let lat = lon_lat_height.y.to_radians();
        let h = lon_lat_height.z;

        let e2 = self.ecc2();
        let sin_lat = lat.sin();
        let n = self.semi_major / (1.0 - e2 * sin_lat * sin_lat).sqrt();

        Vector3::new(
            (n + h) * lat.cos() * lon.cos(),
            (n + h) * lat.cos() * lon.sin(),
            (n * (1.0 - e2) + h) * sin_lat,
        )
    }

    /// ECEF to geodetic (lon, lat in degrees, height in meters), via the
    /// Bowring iteration.
    pub fn ecef_to_geodetic(&self, xyz: &Vector3<f64>) -> Vector3<f64> {
        let e2 = self.ecc2();
        let p = (xyz.x * xyz.x + xyz.y * xyz.y).sqrt();
        let lon = xyz.y.atan2(xyz.x);

        // Near the poles p vanishes; the latitude is then a sign choice.
        if p < 1e-9 {
            let lat = if xyz.z >= 0.0 {
                std::f64::consts::FRAC_PI_2
            } else {
                -std::f64::consts::FRAC_PI_2
            };
            let h = xyz.z.abs() - self.semi_minor;
            return Vector3::new(lon.to_degrees(), lat.to_degrees(), h);
        }

        let mut lat = (xyz.z / (p * (1.0 - e2))).atan();
        let mut h = 0.0;
        for _ in 0..10 {
            let sin_lat = lat.sin();
            let n = self.semi_major / (1.0 - e2 * sin_lat * sin_lat).sqrt();
            h = p / lat.cos() - n;
            lat = (xyz.z / (p * (1.0 - e2 * n / (n + h)))).atan();
        }
        Vector3::new(lon.to_degrees(), lat.to_degrees(), h)
    }

    /// Height above the ellipsoid of an ECEF point.
    pub fn height_above(&self, xyz: &Vector3<f64>) -> f64 {
        self.ecef_to_geodetic(xyz).z
    }
}

/// A geographic map frame over an ellipsoid: map coordinates are
/// (longitude, latitude, height). Used by the roll/yaw constraint to
/// measure the along-track direction, and by DEM rasters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Georef {
    pub ellipsoid: Ellipsoid,
}

impl Georef {
    pub fn new(ellipsoid: Ellipsoid) -> Self {
        Self { ellipsoid }
    }

    pub fn ecef_to_proj(&self, xyz: &Vector3<f64>) -> Vector3<f64> {
        self.ellipsoid.ecef_to_geodetic(xyz)
    }

    pub fn proj_to_ecef(&self, proj: &Vector3<f64>) -> Vector3<f64> {
        self.ellipsoid.geodetic_to_ecef(proj)
    }
}

/// Along and across directions in the map frame from a pair of positions
/// straddling the current one. The heights are ignored: the directions are
/// measured in the horizontal plane.
fn proj_along_across(beg: &Vector3<f64>, end: &Vector3<f64>) -> JitterResult<(Vector3<f64>, Vector3<f64>)> {
    let mut along = end - beg;
    along.z = 0.0;
    let norm = along.norm();
    if norm < 1e-12 {
        return Err(JitterError::Camera(
            "Degenerate trajectory: cannot measure the along-track direction.".to_string(),
        ));
    }
    along /= norm;
    // Perpendicular in the horizontal plane.
    let across = Vector3::new(along.y, -along.x, 0.0);
    Ok((along, across))
}

/// The satellite frame at a position sample: along-track, across-track,
/// and down axes in ECEF, assembled as the columns of a rotation from
/// satellite to world coordinates.
///
/// Positions `i - 1` and `i + 1`, clamped to the array bounds, give the
/// along-track segment in the map frame; central differences of the
/// inverse projection convert the map-frame directions to ECEF at the
/// current position.
pub fn satellite_to_world(
    positions: &[f64],
    cur_pos: usize,
    georef: &Georef,
) -> JitterResult<Matrix3<f64>> {
    let num_pos = positions.len() / 3;
    if cur_pos >= num_pos {
        return Err(JitterError::Camera(
            "Expecting position index in range.".to_string(),
        ));
    }
    let beg_pos = cur_pos.saturating_sub(1);
    let end_pos = (cur_pos + 1).min(num_pos - 1);
    if beg_pos >= end_pos {
        return Err(JitterError::Camera(
            "Expecting at least 2 camera positions.".to_string(),
        ));
    }

    let pt = |i: usize| Vector3::new(positions[3 * i], positions[3 * i + 1], positions[3 * i + 2]);
    let beg_proj = georef.ecef_to_proj(&pt(beg_pos));
    let cur_proj = georef.ecef_to_proj(&pt(cur_pos));
    let end_proj = georef.ecef_to_proj(&pt(end_pos));

    let (proj_along, proj_across) = proj_along_across(&beg_proj, &end_proj)?;

    let to_ecef_dir = |dir: &Vector3<f64>| -> Vector3<f64> {
        let fwd = georef.proj_to_ecef(&(cur_proj + PROJ_DELTA_DEG * dir));
        let back = georef.proj_to_ecef(&(cur_proj - PROJ_DELTA_DEG * dir));
        (fwd - back).normalize()
    };
    let along = to_ecef_dir(&proj_along);
    let across = to_ecef_dir(&proj_across);
    let down = along.cross(&across).normalize();

    Ok(Matrix3::from_columns(&[along, across, down]))
}

/// The fixed 90-degree in-sensor rotation between the satellite frame and
/// the camera frame: `cam2world = sat2world * rollPitchYaw * rotation_xy()`.
pub fn rotation_xy() -> Matrix3<f64> {
    Matrix3::new(
        0.0, -1.0, 0.0, //
        1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0,
    )
}
