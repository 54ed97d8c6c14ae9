use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::error::{RmcError, Result};

/// Determinant magnitude below which a lattice is treated as degenerate.
const DEGENERATE_VOLUME: f64 = 1e-10;

/// Periodic Boundary Conditions.
///
/// Columns of `vectors` are the lattice vectors a, b, c. The inverse is
/// precomputed once; the struct is immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryConditions {
    vectors: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl BoundaryConditions {
    /// Builds from a matrix whose columns are the lattice vectors.
    pub fn new(vectors: Matrix3<f64>) -> Result<Self> {
        if vectors.iter().any(|v| !v.is_finite()) {
            return Err(RmcError::Configuration(
                "lattice contains non-finite components".to_string(),
            ));
        }
        let volume = vectors.determinant().abs();
        if volume < DEGENERATE_VOLUME {
            return Err(RmcError::Configuration(format!(
                "degenerate lattice (volume {:.3e})",
                volume
            )));
        }
        let inverse = vectors.try_inverse().ok_or_else(|| {
            RmcError::Configuration("lattice matrix is not invertible".to_string())
        })?;
        Ok(Self { vectors, inverse })
    }

    /// Nine numbers, three per lattice vector: `[ax, ay, az, bx, by, bz, cx, cy, cz]`.
    pub fn from_flat(values: &[f64; 9]) -> Result<Self> {
        let a = Vector3::new(values[0], values[1], values[2]);
        let b = Vector3::new(values[3], values[4], values[5]);
        let c = Vector3::new(values[6], values[7], values[8]);
        Self::new(Matrix3::from_columns(&[a, b, c]))
    }

    /// Orthorhombic box with edge lengths `a`, `b`, `c`.
    pub fn orthorhombic(a: f64, b: f64, c: f64) -> Result<Self> {
        Self::new(Matrix3::from_diagonal(&Vector3::new(a, b, c)))
    }

    pub fn cubic(edge: f64) -> Result<Self> {
        Self::orthorhombic(edge, edge, edge)
    }

    #[inline]
    pub fn vectors(&self) -> &Matrix3<f64> {
        &self.vectors
    }

    #[inline]
    pub fn volume(&self) -> f64 {
        self.vectors.determinant().abs()
    }

    pub fn real_to_fractional(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.inverse * p.coords)
    }

    pub fn fractional_to_real(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.vectors * p.coords)
    }

    /// Maps a point into the primary cell, fractional coordinates in [0, 1).
    pub fn wrap(&self, p: &Point3<f64>) -> Point3<f64> {
        let mut frac = self.real_to_fractional(p);
        frac.x = frac.x.rem_euclid(1.0);
        frac.y = frac.y.rem_euclid(1.0);
        frac.z = frac.z.rem_euclid(1.0);
        self.fractional_to_real(&frac)
    }

    /// Shortest real-space vector from `p1` to any periodic image of `p2`.
    ///
    /// Each fractional component is wrapped into [-0.5, 0.5).
    #[inline]
    pub fn minimum_image_vector(&self, p1: &Point3<f64>, p2: &Point3<f64>) -> Vector3<f64> {
        let mut d_frac = self.inverse * (p2 - p1);
        d_frac.x -= (d_frac.x + 0.5).floor();
        d_frac.y -= (d_frac.y + 0.5).floor();
        d_frac.z -= (d_frac.z + 0.5).floor();
        self.vectors * d_frac
    }

    #[inline]
    pub fn minimum_image_distance_sq(&self, p1: &Point3<f64>, p2: &Point3<f64>) -> f64 {
        self.minimum_image_vector(p1, p2).norm_squared()
    }

    #[inline]
    pub fn minimum_image_distance(&self, p1: &Point3<f64>, p2: &Point3<f64>) -> f64 {
        self.minimum_image_distance_sq(p1, p2).sqrt()
    }
}

/// Angle (radians) at `center` between the bonds to `left` and `right`.
pub fn bond_angle(
    bc: &BoundaryConditions,
    center: &Point3<f64>,
    left: &Point3<f64>,
    right: &Point3<f64>,
) -> f64 {
    let u = bc.minimum_image_vector(center, left);
    let v = bc.minimum_image_vector(center, right);
    let denom = u.norm() * v.norm();
    if denom == 0.0 {
        return f64::NAN;
    }
    (u.dot(&v) / denom).clamp(-1.0, 1.0).acos()
}

/// Signed angle (radians) between the vector `anchor -> improper` and the
/// plane through `anchor`, `first` and `second`. Range [-π/2, π/2].
pub fn improper_angle(
    bc: &BoundaryConditions,
    improper: &Point3<f64>,
    anchor: &Point3<f64>,
    first: &Point3<f64>,
    second: &Point3<f64>,
) -> f64 {
    let u = bc.minimum_image_vector(anchor, first);
    let v = bc.minimum_image_vector(anchor, second);
    let w = bc.minimum_image_vector(anchor, improper);
    let normal = u.cross(&v);
    let denom = normal.norm() * w.norm();
    if denom == 0.0 {
        return f64::NAN;
    }
    (normal.dot(&w) / denom).clamp(-1.0, 1.0).asin()
}
