use log::debug;
use serde::{Deserialize, Serialize};

use crate::constraints::definitions::{
    check_terms, expand_definitions, DefinitionTable, ExpansionRules, RangedTerms, Term,
};
use crate::core::domain::Configuration;
use crate::core::error::Result;
use crate::core::spatial::{self, BoundaryConditions};
use crate::engine::constraint::{require_boundary, Constraint, ConstraintStatus, TrialPositions};

const ANGLE_RULES: ExpansionRules = ExpansionRules {
    arity: 3,
    scale: std::f64::consts::PI / 180.0,
    allowed: (0.0, 180.0),
};

/// Keeps the angle between two bonds sharing a central atom inside a range.
///
/// Definitions read `(central, left, right, lower°, upper°)`; the angle is
/// measured at `central`. Deviations are accumulated in radians.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BondsAngleConstraint {
    status: ConstraintStatus,
    definitions: DefinitionTable,
    angles: RangedTerms,
}

impl BondsAngleConstraint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit `(central, left, right)` terms with bounds in radians.
    pub fn from_terms(terms: Vec<Term>) -> Self {
        Self {
            angles: RangedTerms::new(terms),
            ..Self::default()
        }
    }

    pub fn create_angles_by_definition(
        &mut self,
        configuration: &Configuration,
        definitions: DefinitionTable,
    ) -> Result<()> {
        let terms = expand_definitions(configuration, &definitions, ANGLE_RULES)?;
        self.definitions = definitions;
        self.angles = RangedTerms::new(terms);
        self.status.initialized = false;
        Ok(())
    }

    pub fn from_definitions(configuration: &Configuration, definitions: DefinitionTable) -> Result<Self> {
        let mut c = Self::new();
        c.create_angles_by_definition(configuration, definitions)?;
        Ok(c)
    }

    pub fn definitions(&self) -> &DefinitionTable {
        &self.definitions
    }

    pub fn angles(&self) -> &[Term] {
        self.angles.terms()
    }

    /// Committed angles in radians.
    pub fn angle_values(&self) -> &[f64] {
        self.angles.values()
    }
}

impl Constraint for BondsAngleConstraint {
    fn name(&self) -> &str {
        "BondsAngleConstraint"
    }

    fn status(&self) -> &ConstraintStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut ConstraintStatus {
        &mut self.status
    }

    fn validate(&self, configuration: &Configuration) -> Result<()> {
        check_terms(self.angles.terms(), ANGLE_RULES.arity, configuration.len())
    }

    fn initialize(
        &mut self,
        configuration: &Configuration,
        boundary: Option<&BoundaryConditions>,
    ) -> Result<()> {
        let bc = require_boundary(boundary, self.name())?;
        self.validate(configuration)?;
        let error = self.angles.initialize(configuration.len(), |a| {
            spatial::bond_angle(
                bc,
                configuration.position(a[0]),
                configuration.position(a[1]),
                configuration.position(a[2]),
            )
        })?;
        self.status.standard_error = error;
        self.status.initialized = true;
        debug!(
            "{} initialized: {} angles, standard error {:.6}",
            self.name(),
            self.angles.terms().len(),
            error
        );
        Ok(())
    }

    fn compute_before_move(
        &mut self,
        _configuration: &Configuration,
        _boundary: &BoundaryConditions,
        indices: &[usize],
    ) -> Result<()> {
        self.angles.before_move(indices);
        Ok(())
    }

    fn compute_after_move(
        &mut self,
        trial: &TrialPositions<'_>,
        boundary: &BoundaryConditions,
    ) -> Result<f64> {
        self.angles.after_move(trial.indices(), |a| {
            spatial::bond_angle(
                boundary,
                trial.position(a[0]),
                trial.position(a[1]),
                trial.position(a[2]),
            )
        })
    }

    fn accept_move(&mut self) {
        if let Some(error) = self.angles.accept() {
            self.status.standard_error = error;
        }
    }

    fn reject_move(&mut self) {
        self.angles.reject();
    }

    fn full_standard_error(
        &self,
        configuration: &Configuration,
        boundary: &BoundaryConditions,
    ) -> Result<f64> {
        self.angles.full_error(|a| {
            spatial::bond_angle(
                boundary,
                configuration.position(a[0]),
                configuration.position(a[1]),
                configuration.position(a[2]),
            )
        })
    }
}
