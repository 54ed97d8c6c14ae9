use nalgebra::{Point3, Rotation3, Unit, Vector3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::analysis::symmetry;
use crate::core::error::{RmcError, Result};

/// Produces candidate coordinates for a group.
///
/// Every variant maps the group's current coordinates to a new array of the
/// same length. Apart from a collector's cycling cursor, generators keep no
/// state between calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MoveGenerator {
    /// Rigid translation in a random direction, length drawn from `amplitude`.
    Translation { amplitude: (f64, f64) },
    /// Rigid translation along one of the group's symmetry axes (0, 1 or 2).
    TranslationAlongSymmetryAxis { axis: usize, amplitude: (f64, f64) },
    /// Rotation about the centroid around a random axis, angle in
    /// `[-amplitude, amplitude]` degrees.
    Rotation { amplitude: f64 },
    /// Rotation about the centroid around a symmetry axis.
    RotationAboutSymmetryAxis { axis: usize, amplitude: f64 },
    /// Delegates to one member per call, either uniformly at random or in order.
    Collector {
        collection: Vec<MoveGenerator>,
        randomize: bool,
        #[serde(default)]
        cursor: usize,
    },
}

impl Default for MoveGenerator {
    fn default() -> Self {
        MoveGenerator::Translation {
            amplitude: (0.0, 0.5),
        }
    }
}

fn check_amplitude(amplitude: (f64, f64)) -> Result<()> {
    let (lo, hi) = amplitude;
    if !lo.is_finite() || !hi.is_finite() || lo < 0.0 || lo > hi {
        return Err(RmcError::Configuration(format!(
            "invalid translation amplitude ({}, {})",
            lo, hi
        )));
    }
    Ok(())
}

fn check_angle(amplitude: f64) -> Result<()> {
    if !amplitude.is_finite() || !(0.0..=360.0).contains(&amplitude) {
        return Err(RmcError::Configuration(format!(
            "rotation amplitude {} outside [0, 360] degrees",
            amplitude
        )));
    }
    Ok(())
}

fn check_axis(axis: usize) -> Result<()> {
    if axis > 2 {
        return Err(RmcError::Configuration(format!(
            "symmetry axis {} does not exist (expected 0, 1 or 2)",
            axis
        )));
    }
    Ok(())
}

impl MoveGenerator {
    pub fn translation(min: f64, max: f64) -> Result<Self> {
        check_amplitude((min, max))?;
        Ok(MoveGenerator::Translation {
            amplitude: (min, max),
        })
    }

    pub fn translation_along_axis(axis: usize, min: f64, max: f64) -> Result<Self> {
        check_axis(axis)?;
        check_amplitude((min, max))?;
        Ok(MoveGenerator::TranslationAlongSymmetryAxis {
            axis,
            amplitude: (min, max),
        })
    }

    pub fn rotation(amplitude_degrees: f64) -> Result<Self> {
        check_angle(amplitude_degrees)?;
        Ok(MoveGenerator::Rotation {
            amplitude: amplitude_degrees,
        })
    }

    pub fn rotation_about_axis(axis: usize, amplitude_degrees: f64) -> Result<Self> {
        check_axis(axis)?;
        check_angle(amplitude_degrees)?;
        Ok(MoveGenerator::RotationAboutSymmetryAxis {
            axis,
            amplitude: amplitude_degrees,
        })
    }

    pub fn collector(collection: Vec<MoveGenerator>, randomize: bool) -> Result<Self> {
        if collection.is_empty() {
            return Err(RmcError::Configuration(
                "a generator collector needs at least one generator".to_string(),
            ));
        }
        Ok(MoveGenerator::Collector {
            collection,
            randomize,
            cursor: 0,
        })
    }

    /// Re-checks parameters; used for generators that arrive deserialized.
    pub fn validate(&self) -> Result<()> {
        match self {
            MoveGenerator::Translation { amplitude } => check_amplitude(*amplitude),
            MoveGenerator::TranslationAlongSymmetryAxis { axis, amplitude } => {
                check_axis(*axis)?;
                check_amplitude(*amplitude)
            }
            MoveGenerator::Rotation { amplitude } => check_angle(*amplitude),
            MoveGenerator::RotationAboutSymmetryAxis { axis, amplitude } => {
                check_axis(*axis)?;
                check_angle(*amplitude)
            }
            MoveGenerator::Collector { collection, .. } => {
                if collection.is_empty() {
                    return Err(RmcError::Configuration(
                        "a generator collector needs at least one generator".to_string(),
                    ));
                }
                collection.iter().try_for_each(|g| g.validate())
            }
        }
    }

    /// Smallest group this generator can meaningfully move.
    pub fn min_group_size(&self) -> usize {
        match self {
            MoveGenerator::Translation { .. } => 1,
            MoveGenerator::TranslationAlongSymmetryAxis { .. }
            | MoveGenerator::Rotation { .. }
            | MoveGenerator::RotationAboutSymmetryAxis { .. } => 2,
            MoveGenerator::Collector { collection, .. } => collection
                .iter()
                .map(|g| g.min_group_size())
                .max()
                .unwrap_or(1),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MoveGenerator::Translation { .. } => "Translation",
            MoveGenerator::TranslationAlongSymmetryAxis { .. } => "TranslationAlongSymmetryAxis",
            MoveGenerator::Rotation { .. } => "Rotation",
            MoveGenerator::RotationAboutSymmetryAxis { .. } => "RotationAboutSymmetryAxis",
            MoveGenerator::Collector { .. } => "Collector",
        }
    }

    /// Returns candidate coordinates for `coords`; the input is untouched.
    pub fn generate<R: Rng + ?Sized>(&mut self, coords: &[Point3<f64>], rng: &mut R) -> Vec<Point3<f64>> {
        match self {
            MoveGenerator::Translation { amplitude } => {
                let length = sample_range(*amplitude, rng);
                let disp = random_unit_vector(rng) * length;
                coords.iter().map(|p| p + disp).collect()
            }
            MoveGenerator::TranslationAlongSymmetryAxis { axis, amplitude } => {
                if coords.len() < 2 {
                    return coords.to_vec();
                }
                let (_, axes) = symmetry::principal_axes(coords);
                let direction: Vector3<f64> = axes.column(*axis).into_owned();
                let sign = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
                let disp = direction * (sign * sample_range(*amplitude, rng));
                coords.iter().map(|p| p + disp).collect()
            }
            MoveGenerator::Rotation { amplitude } => {
                if coords.len() < 2 {
                    return coords.to_vec();
                }
                let axis = random_unit_vector(rng);
                let angle = sample_angle(*amplitude, rng);
                rotate_about_centroid(coords, axis, angle)
            }
            MoveGenerator::RotationAboutSymmetryAxis { axis, amplitude } => {
                if coords.len() < 2 {
                    return coords.to_vec();
                }
                let (_, axes) = symmetry::principal_axes(coords);
                let direction: Vector3<f64> = axes.column(*axis).into_owned();
                let angle = sample_angle(*amplitude, rng);
                rotate_about_centroid(coords, direction, angle)
            }
            MoveGenerator::Collector {
                collection,
                randomize,
                cursor,
            } => {
                if collection.is_empty() {
                    return coords.to_vec();
                }
                let pick = if *randomize {
                    rng.gen_range(0..collection.len())
                } else {
                    let current = *cursor % collection.len();
                    *cursor = (current + 1) % collection.len();
                    current
                };
                collection[pick].generate(coords, rng)
            }
        }
    }
}

// --- Sampling helpers ---

fn sample_range<R: Rng + ?Sized>(range: (f64, f64), rng: &mut R) -> f64 {
    let (lo, hi) = range;
    if hi <= lo {
        lo
    } else {
        rng.gen_range(lo..=hi)
    }
}

fn sample_angle<R: Rng + ?Sized>(amplitude_degrees: f64, rng: &mut R) -> f64 {
    if amplitude_degrees <= 0.0 {
        return 0.0;
    }
    rng.gen_range(-amplitude_degrees..=amplitude_degrees).to_radians()
}

/// Uniform direction on the unit sphere (rejection from the unit ball).
fn random_unit_vector<R: Rng + ?Sized>(rng: &mut R) -> Vector3<f64> {
    loop {
        let v: Vector3<f64> = Vector3::new(
            rng.gen_range(-1.0..=1.0),
            rng.gen_range(-1.0..=1.0),
            rng.gen_range(-1.0..=1.0),
        );
        let norm_sq = v.norm_squared();
        if norm_sq > 1e-12 && norm_sq <= 1.0 {
            return v / norm_sq.sqrt();
        }
    }
}

fn rotate_about_centroid(coords: &[Point3<f64>], axis: Vector3<f64>, angle: f64) -> Vec<Point3<f64>> {
    let center = symmetry::centroid(coords);
    let rot = Rotation3::from_axis_angle(&Unit::new_normalize(axis), angle);
    coords.iter().map(|p| center + rot * (p - center)).collect()
}
