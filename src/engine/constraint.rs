use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::constraints::angles::BondsAngleConstraint;
use crate::constraints::bonds::BondConstraint;
use crate::constraints::distance::InterMolecularDistanceConstraint;
use crate::constraints::improper::ImproperAngleConstraint;
use crate::constraints::pair_distribution::PairDistributionConstraint;
use crate::core::domain::Configuration;
use crate::core::error::{RmcError, Result};
use crate::core::spatial::BoundaryConditions;

/// Bookkeeping shared by every constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintStatus {
    pub used: bool,
    pub initialized: bool,
    /// Multiplier applied to this constraint's error in the engine total.
    pub weight: f64,
    /// Last committed standard error.
    pub standard_error: f64,
}

impl Default for ConstraintStatus {
    fn default() -> Self {
        Self {
            used: true,
            initialized: false,
            weight: 1.0,
            standard_error: 0.0,
        }
    }
}

/// Candidate coordinates of a moving group, overlaid on the committed
/// configuration.
pub struct TrialPositions<'a> {
    configuration: &'a Configuration,
    indices: &'a [usize],
    positions: &'a [Point3<f64>],
    /// (atom, slot) sorted by atom for O(log g) membership tests.
    lookup: Vec<(usize, usize)>,
}

impl<'a> TrialPositions<'a> {
    pub fn new(
        configuration: &'a Configuration,
        indices: &'a [usize],
        positions: &'a [Point3<f64>],
    ) -> Self {
        let mut lookup: Vec<(usize, usize)> = indices.iter().cloned().zip(0..).collect();
        lookup.sort_unstable();
        Self {
            configuration,
            indices,
            positions,
            lookup,
        }
    }

    #[inline]
    pub fn configuration(&self) -> &Configuration {
        self.configuration
    }

    #[inline]
    pub fn indices(&self) -> &[usize] {
        self.indices
    }

    #[inline]
    pub fn group_positions(&self) -> &[Point3<f64>] {
        self.positions
    }

    /// Position of `atom` inside the moving group, if it belongs to it.
    #[inline]
    pub fn slot_of(&self, atom: usize) -> Option<usize> {
        self.lookup
            .binary_search_by_key(&atom, |&(a, _)| a)
            .ok()
            .map(|k| self.lookup[k].1)
    }

    /// Candidate position for moved atoms, committed position otherwise.
    #[inline]
    pub fn position(&self, atom: usize) -> &Point3<f64> {
        match self.slot_of(atom) {
            Some(slot) => &self.positions[slot],
            None => self.configuration.position(atom),
        }
    }
}

/// Visits every unordered atom pair with at least one member in `indices`,
/// exactly once. Group members sit at `group_positions`; every other atom at
/// its committed position. The closure receives `(group_atom, other_atom,
/// squared minimum-image distance)`.
pub fn for_each_group_pair<F>(
    configuration: &Configuration,
    bc: &BoundaryConditions,
    indices: &[usize],
    group_positions: &[Point3<f64>],
    mut visit: F,
) where
    F: FnMut(usize, usize, f64),
{
    let trial = TrialPositions::new(configuration, indices, group_positions);
    let n = configuration.len();
    for (k, &a) in indices.iter().enumerate() {
        let pa = &group_positions[k];
        for j in 0..n {
            if j == a {
                continue;
            }
            let pb = match trial.slot_of(j) {
                Some(m) if m <= k => continue,
                Some(m) => &group_positions[m],
                None => configuration.position(j),
            };
            visit(a, j, bc.minimum_image_distance_sq(pa, pb));
        }
    }
}

pub(crate) fn require_boundary<'b>(
    boundary: Option<&'b BoundaryConditions>,
    constraint: &str,
) -> Result<&'b BoundaryConditions> {
    boundary.ok_or_else(|| {
        RmcError::Configuration(format!(
            "{} needs boundary conditions before initialization",
            constraint
        ))
    })
}

/// A rule judging configurations by a non-negative standard error.
///
/// The engine drives one trial as `compute_before_move` →
/// `compute_after_move` → `accept_move` | `reject_move`. Only `accept_move`
/// may change committed state.
pub trait Constraint: Send + Sync {
    fn name(&self) -> &str;

    fn status(&self) -> &ConstraintStatus;

    fn status_mut(&mut self) -> &mut ConstraintStatus;

    fn is_used(&self) -> bool {
        self.status().used
    }

    /// Disabling drops the initialized flag: the configuration keeps moving
    /// while the constraint is off, so its tables go stale.
    fn set_used(&mut self, used: bool) {
        let status = self.status_mut();
        if !used {
            status.initialized = false;
        }
        status.used = used;
    }

    fn is_initialized(&self) -> bool {
        self.status().initialized
    }

    fn weight(&self) -> f64 {
        self.status().weight
    }

    fn set_weight(&mut self, weight: f64) -> Result<()> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(RmcError::Configuration(format!(
                "{} weight {} must be finite and non-negative",
                self.name(),
                weight
            )));
        }
        self.status_mut().weight = weight;
        Ok(())
    }

    /// Last committed standard error.
    fn standard_error(&self) -> f64 {
        self.status().standard_error
    }

    /// Cheap structural checks against a configuration (index ranges,
    /// species tables). Runs when the constraint is attached.
    fn validate(&self, configuration: &Configuration) -> Result<()>;

    /// Builds committed state from scratch.
    fn initialize(
        &mut self,
        configuration: &Configuration,
        boundary: Option<&BoundaryConditions>,
    ) -> Result<()>;

    /// Snapshots the committed contributions of the atoms about to move.
    fn compute_before_move(
        &mut self,
        configuration: &Configuration,
        boundary: &BoundaryConditions,
        indices: &[usize],
    ) -> Result<()>;

    /// Scratch standard error with the group at its candidate positions.
    fn compute_after_move(
        &mut self,
        trial: &TrialPositions<'_>,
        boundary: &BoundaryConditions,
    ) -> Result<f64>;

    /// Promotes scratch state to committed state.
    fn accept_move(&mut self);

    /// Drops scratch state; committed state is untouched.
    fn reject_move(&mut self);

    /// Standard error recomputed from the configuration alone.
    fn full_standard_error(
        &self,
        configuration: &Configuration,
        boundary: &BoundaryConditions,
    ) -> Result<f64>;
}

/// Every concrete constraint, as stored by the engine and its checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AnyConstraint {
    PairDistribution(PairDistributionConstraint),
    InterMolecularDistance(InterMolecularDistanceConstraint),
    Bond(BondConstraint),
    BondsAngle(BondsAngleConstraint),
    ImproperAngle(ImproperAngleConstraint),
}

macro_rules! dispatch {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            AnyConstraint::PairDistribution($c) => $body,
            AnyConstraint::InterMolecularDistance($c) => $body,
            AnyConstraint::Bond($c) => $body,
            AnyConstraint::BondsAngle($c) => $body,
            AnyConstraint::ImproperAngle($c) => $body,
        }
    };
}

impl Constraint for AnyConstraint {
    fn name(&self) -> &str {
        dispatch!(self, c => c.name())
    }

    fn status(&self) -> &ConstraintStatus {
        dispatch!(self, c => c.status())
    }

    fn status_mut(&mut self) -> &mut ConstraintStatus {
        dispatch!(self, c => c.status_mut())
    }

    fn set_used(&mut self, used: bool) {
        dispatch!(self, c => c.set_used(used))
    }

    fn validate(&self, configuration: &Configuration) -> Result<()> {
        dispatch!(self, c => c.validate(configuration))
    }

    fn initialize(
        &mut self,
        configuration: &Configuration,
        boundary: Option<&BoundaryConditions>,
    ) -> Result<()> {
        dispatch!(self, c => c.initialize(configuration, boundary))
    }

    fn compute_before_move(
        &mut self,
        configuration: &Configuration,
        boundary: &BoundaryConditions,
        indices: &[usize],
    ) -> Result<()> {
        dispatch!(self, c => c.compute_before_move(configuration, boundary, indices))
    }

    fn compute_after_move(
        &mut self,
        trial: &TrialPositions<'_>,
        boundary: &BoundaryConditions,
    ) -> Result<f64> {
        dispatch!(self, c => c.compute_after_move(trial, boundary))
    }

    fn accept_move(&mut self) {
        dispatch!(self, c => c.accept_move())
    }

    fn reject_move(&mut self) {
        dispatch!(self, c => c.reject_move())
    }

    fn full_standard_error(
        &self,
        configuration: &Configuration,
        boundary: &BoundaryConditions,
    ) -> Result<f64> {
        dispatch!(self, c => c.full_standard_error(configuration, boundary))
    }
}

impl From<PairDistributionConstraint> for AnyConstraint {
    fn from(c: PairDistributionConstraint) -> Self {
        AnyConstraint::PairDistribution(c)
    }
}

impl From<InterMolecularDistanceConstraint> for AnyConstraint {
    fn from(c: InterMolecularDistanceConstraint) -> Self {
        AnyConstraint::InterMolecularDistance(c)
    }
}

impl From<BondConstraint> for AnyConstraint {
    fn from(c: BondConstraint) -> Self {
        AnyConstraint::Bond(c)
    }
}

impl From<BondsAngleConstraint> for AnyConstraint {
    fn from(c: BondsAngleConstraint) -> Self {
        AnyConstraint::BondsAngle(c)
    }
}

impl From<ImproperAngleConstraint> for AnyConstraint {
    fn from(c: ImproperAngleConstraint) -> Self {
        AnyConstraint::ImproperAngle(c)
    }
}

impl AnyConstraint {
    pub fn as_pair_distribution(&self) -> Option<&PairDistributionConstraint> {
        match self {
            AnyConstraint::PairDistribution(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_bond(&self) -> Option<&BondConstraint> {
        match self {
            AnyConstraint::Bond(c) => Some(c),
            _ => None,
        }
    }
}
