//! In-memory georeferenced rasters: the DEM used by the height constraints
//! and anchor generation, and the weight image used for per-point weights.
//!
//! The DEM interpolator is preloaded and in-memory; no raster I/O happens
//! during the solve.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{JitterError, JitterResult};

use super::Ellipsoid;

/// Convergence tolerance, in meters of height, of the DEM ray intersection.
const RAY_TOLERANCE: f64 = 1e-3;
const MAX_RAY_ITERATIONS: usize = 100;

/// Maps raster pixel indices to geographic coordinates: pixel (col, row)
/// sits at longitude `lon0 + col * dlon`, latitude `lat0 + row * dlat`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RasterGeoref {
    pub lon0: f64,
    pub lat0: f64,
    pub dlon: f64,
    pub dlat: f64,
}

impl RasterGeoref {
    fn pixel_of(&self, lon: f64, lat: f64) -> Vector2<f64> {
        Vector2::new((lon - self.lon0) / self.dlon, (lat - self.lat0) / self.dlat)
    }
}

/// A height raster over an ellipsoid, with nodata holes.
#[derive(Debug, Clone)]
pub struct Dem {
    heights: Vec<f64>,
    cols: usize,
    rows: usize,
    nodata: f64,
    pub georef: RasterGeoref,
    pub ellipsoid: Ellipsoid,
}

impl Dem {
    pub fn new(
        heights: Vec<f64>,
        cols: usize,
        rows: usize,
        nodata: f64,
        georef: RasterGeoref,
        ellipsoid: Ellipsoid,
    ) -> JitterResult<Self> {
        if heights.len() != cols * rows || cols < 2 || rows < 2 {
            return Err(JitterError::Config(
                "DEM raster dimensions do not match the height array.".to_string(),
            ));
        }
        Ok(Self {
            heights,
            cols,
            rows,
            nodata,
            georef,
            ellipsoid,
        })
    }

    fn sample(&self, col: usize, row: usize) -> Option<f64> {
        let h = self.heights[row * self.cols + col];
        if h == self.nodata || !h.is_finite() {
            None
        } else {
            Some(h)
        }
    }

    /// Bilinear height at geographic (lon, lat); `None` outside the raster
    /// or where any corner is nodata.
    pub fn height_at(&self, lon: f64, lat: f64) -> Option<f64> {
        let pix = self.georef.pixel_of(lon, lat);
        if pix.x < 0.0 || pix.y < 0.0 {
            return None;
        }
        let c0 = pix.x.floor() as usize;
        let r0 = pix.y.floor() as usize;
        if c0 + 1 >= self.cols || r0 + 1 >= self.rows {
            return None;
        }
        let fx = pix.x - c0 as f64;
        let fy = pix.y - r0 as f64;

        let h00 = self.sample(c0, r0)?;
        let h10 = self.sample(c0 + 1, r0)?;
        let h01 = self.sample(c0, r0 + 1)?;
        let h11 = self.sample(c0 + 1, r0 + 1)?;

        Some(
            h00 * (1.0 - fx) * (1.0 - fy)
                + h10 * fx * (1.0 - fy)
                + h01 * (1.0 - fx) * fy
                + h11 * fx * fy,
        )
    }

    /// The ECEF point where the DEM surface sits above/below a given ECEF
    /// point: same (lon, lat), height replaced by the DEM height. `None`
    /// where the DEM has no data.
    pub fn surface_point_below(&self, xyz: &Vector3<f64>) -> Option<Vector3<f64>> {
        let llh = self.ellipsoid.ecef_to_geodetic(xyz);
        let h = self.height_at(llh.x, llh.y)?;
        Some(
            self.ellipsoid
                .geodetic_to_ecef(&Vector3::new(llh.x, llh.y, h)),
        )
    }

    /// Intersect a ray (camera center, unit direction) with the DEM
    /// surface, by fixed-point iteration on the surface height. Returns
    /// `None` when the ray misses the raster or iteration does not settle.
    pub fn intersect_ray(&self, origin: &Vector3<f64>, dir: &Vector3<f64>) -> Option<Vector3<f64>> {
        let mut height = 0.0;
        let mut point = intersect_ellipsoid(&self.ellipsoid, origin, dir, height)?;
        for _ in 0..MAX_RAY_ITERATIONS {
            let llh = self.ellipsoid.ecef_to_geodetic(&point);
            let surface = self.height_at(llh.x, llh.y)?;
            if (surface - height).abs() < RAY_TOLERANCE {
                return Some(
                    self.ellipsoid
                        .geodetic_to_ecef(&Vector3::new(llh.x, llh.y, surface)),
                );
            }
            height = surface;
            point = intersect_ellipsoid(&self.ellipsoid, origin, dir, height)?;
        }
        None
    }
}

/// First intersection of a ray with the surface at constant height `h`
/// above the ellipsoid (axes grown by `h`).
fn intersect_ellipsoid(
    ell: &Ellipsoid,
    origin: &Vector3<f64>,
    dir: &Vector3<f64>,
    h: f64,
) -> Option<Vector3<f64>> {
    let a = ell.semi_major + h;
    let b = ell.semi_minor + h;

    // Scale z so the surface becomes a sphere of radius a.
    let s = a / b;
    let o = Vector3::new(origin.x, origin.y, origin.z * s);
    let d = Vector3::new(dir.x, dir.y, dir.z * s);

    let qa = d.dot(&d);
    let qb = 2.0 * o.dot(&d);
    let qc = o.dot(&o) - a * a;
    let disc = qb * qb - 4.0 * qa * qc;
    if disc < 0.0 {
        return None;
    }
    let t = (-qb - disc.sqrt()) / (2.0 * qa);
    if t <= 0.0 {
        return None;
    }
    Some(origin + t * dir)
}

/// A non-negative float raster looked up by ground point; used both for
/// per-observation weights and for anchor-point weights.
#[derive(Debug, Clone)]
pub struct WeightImage {
    values: Vec<f64>,
    cols: usize,
    rows: usize,
    nodata: f64,
    pub georef: RasterGeoref,
    pub ellipsoid: Ellipsoid,
}

impl WeightImage {
    pub fn new(
        values: Vec<f64>,
        cols: usize,
        rows: usize,
        nodata: f64,
        georef: RasterGeoref,
        ellipsoid: Ellipsoid,
    ) -> JitterResult<Self> {
        if values.len() != cols * rows {
            return Err(JitterError::Config(
                "Weight image dimensions do not match the value array.".to_string(),
            ));
        }
        Ok(Self {
            values,
            cols,
            rows,
            nodata,
            georef,
            ellipsoid,
        })
    }

    /// Value of the raster pixel closest to the given ECEF point. `None`
    /// outside the raster, at nodata, or for non-finite values.
    pub fn closest_value(&self, xyz: &Vector3<f64>) -> Option<f64> {
        let llh = self.ellipsoid.ecef_to_geodetic(xyz);
        let pix = self.georef.pixel_of(llh.x, llh.y);
        let col = pix.x.round();
        let row = pix.y.round();
        if col < 0.0 || row < 0.0 || col as usize >= self.cols || row as usize >= self.rows {
            return None;
        }
        let v = self.values[(row as usize) * self.cols + col as usize];
        if v == self.nodata || !v.is_finite() {
            None
        } else {
            Some(v)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn flat_dem(height: f64) -> Dem {
        let georef = RasterGeoref {
            lon0: -1.0,
            lat0: -1.0,
            dlon: 0.1,
            dlat: 0.1,
        };
        Dem::new(vec![height; 21 * 21], 21, 21, -32768.0, georef, Ellipsoid::WGS84).unwrap()
    }

    #[test]
    fn bilinear_height_on_flat_dem() {
        let dem = flat_dem(250.0);
        assert_relative_eq!(dem.height_at(0.03, -0.57).unwrap(), 250.0, epsilon = 1e-9);
        assert!(dem.height_at(5.0, 0.0).is_none());
    }

    #[test]
    fn nodata_holes_propagate() {
        let mut dem = flat_dem(100.0);
        dem.heights[10 * 21 + 10] = -32768.0;
        assert!(dem.height_at(0.0, 0.0).is_none());
        assert!(dem.height_at(0.55, 0.55).is_some());
    }

    #[test]
    fn ray_intersection_lands_on_surface() {
        let dem = flat_dem(500.0);
        let ell = Ellipsoid::WGS84;
        // Camera above (0, 0) looking straight down.
        let cam = ell.geodetic_to_ecef(&Vector3::new(0.0, 0.0, 600_000.0));
        let dir = -cam.normalize();
        let hit = dem.intersect_ray(&cam, &dir).unwrap();
        let llh = ell.ecef_to_geodetic(&hit);
        assert_relative_eq!(llh.z, 500.0, epsilon = 1e-2);
        assert!(llh.x.abs() < 1e-6 && llh.y.abs() < 1e-6);
    }

    #[test]
    fn surface_point_keeps_lon_lat() {
        let dem = flat_dem(42.0);
        let ell = Ellipsoid::WGS84;
        let xyz = ell.geodetic_to_ecef(&Vector3::new(0.5, 0.5, 1234.0));
        let s = dem.surface_point_below(&xyz).unwrap();
        let llh = ell.ecef_to_geodetic(&s);
        assert_relative_eq!(llh.x, 0.5, epsilon = 1e-9);
        assert_relative_eq!(llh.z, 42.0, epsilon = 1e-5);
    }

    #[test]
    fn weight_image_lookup() {
        let georef = RasterGeoref {
            lon0: -1.0,
            lat0: -1.0,
            dlon: 0.1,
            dlat: 0.1,
        };
        let mut values = vec![2.0; 21 * 21];
        values[10 * 21 + 10] = 7.5;
        let img = WeightImage::new(values, 21, 21, -1.0, georef, Ellipsoid::WGS84).unwrap();
        let xyz = Ellipsoid::WGS84.geodetic_to_ecef(&Vector3::new(0.0, 0.0, 0.0));
        assert_relative_eq!(img.closest_value(&xyz).unwrap(), 7.5, epsilon = 1e-12);
    }
}
