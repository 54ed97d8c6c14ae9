#![allow(dead_code)]

use nalgebra::Point3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use rmc_refine::core::domain::{Atom, Configuration, Species};
use rmc_refine::core::spatial::BoundaryConditions;

pub const EDGE: f64 = 10.0;

pub fn two_species() -> Vec<Species> {
    vec![
        Species::new("A", 8, 15.999, 5.803),
        Species::new("B", 14, 28.085, 4.149),
    ]
}

pub fn cubic_box() -> BoundaryConditions {
    BoundaryConditions::cubic(EDGE).unwrap()
}

/// `molecules` A-B dimers on a simple grid, bond along x of length `bond`.
pub fn dimer_configuration(molecules: usize, bond: f64) -> Configuration {
    let per_side = (molecules as f64).cbrt().ceil() as usize;
    let spacing = EDGE / per_side as f64;
    let mut atoms = Vec::with_capacity(molecules * 2);
    for m in 0..molecules {
        let (i, j, k) = (m % per_side, (m / per_side) % per_side, m / (per_side * per_side));
        let base = Point3::new(
            0.1 + i as f64 * spacing,
            0.1 + j as f64 * spacing,
            0.1 + k as f64 * spacing,
        );
        atoms.push(Atom::new(0, base, m).named("A", "AB"));
        atoms.push(Atom::new(1, base + nalgebra::Vector3::new(bond, 0.0, 0.0), m).named("B", "AB"));
    }
    Configuration::new(two_species(), atoms).unwrap()
}

/// `n` atoms placed uniformly in the box, alternating species, one molecule each.
pub fn random_configuration(n: usize, seed: u64) -> Configuration {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let atoms = (0..n)
        .map(|i| {
            let p = Point3::new(
                rng.gen_range(0.0..EDGE),
                rng.gen_range(0.0..EDGE),
                rng.gen_range(0.0..EDGE),
            );
            Atom::new(i % 2, p, i)
        })
        .collect();
    Configuration::new(two_species(), atoms).unwrap()
}

/// Flat g(r) = 1 on an even grid from 0.5 to 4.0 Å.
pub fn flat_pdf() -> Vec<(f64, f64)> {
    (0..36).map(|k| (0.5 + 0.1 * k as f64, 1.0)).collect()
}

pub fn assert_close(a: f64, b: f64, tol: f64) {
    assert!((a - b).abs() <= tol, "{} != {} (tol {})", a, b, tol);
}
