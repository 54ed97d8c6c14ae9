use nalgebra::{Matrix3, Point3, SymmetricEigen, Vector3, U3};

/// Geometric center of a set of points (unit mass).
pub fn centroid(points: &[Point3<f64>]) -> Point3<f64> {
    if points.is_empty() {
        return Point3::origin();
    }
    let mut center = Vector3::zeros();
    for p in points {
        center += p.coords;
    }
    Point3::from(center / points.len() as f64)
}

/// Inertia tensor about the centroid, assuming mass=1.0 for all atoms.
fn inertia_tensor_unit_mass(points: &[Point3<f64>], center: &Point3<f64>) -> Matrix3<f64> {
    let mut tensor = Matrix3::zeros();
    for p in points {
        let r = p - center;
        tensor[(0, 0)] += r.y * r.y + r.z * r.z;
        tensor[(1, 1)] += r.x * r.x + r.z * r.z;
        tensor[(2, 2)] += r.x * r.x + r.y * r.y;
        let i_xy = -r.x * r.y;
        let i_xz = -r.x * r.z;
        let i_yz = -r.y * r.z;
        tensor[(0, 1)] += i_xy; tensor[(1, 0)] += i_xy;
        tensor[(0, 2)] += i_xz; tensor[(2, 0)] += i_xz;
        tensor[(1, 2)] += i_yz; tensor[(2, 1)] += i_yz;
    }
    tensor
}

/// Symmetry axes of a group: the principal axes of its unit-mass inertia
/// tensor, returned as unit column vectors ordered by ascending moment.
///
/// Axis 0 of a linear molecule therefore lies along the molecule; axis 2 of
/// a planar ring is the ring normal.
pub fn principal_axes(points: &[Point3<f64>]) -> (Point3<f64>, Matrix3<f64>) {
    let center = centroid(points);
    if points.len() < 2 {
        return (center, Matrix3::identity());
    }

    let eigen: SymmetricEigen<f64, U3> = SymmetricEigen::new(inertia_tensor_unit_mass(points, &center));
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[a]
            .partial_cmp(&eigen.eigenvalues[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let columns: Vec<Vector3<f64>> = order
        .iter()
        .map(|&k| eigen.eigenvectors.column(k).normalize())
        .collect();
    (center, Matrix3::from_columns(&columns))
}
