use log::debug;
use serde::{Deserialize, Serialize};

use crate::constraints::definitions::{
    check_terms, expand_definitions, DefinitionTable, ExpansionRules, RangedTerms, Term,
};
use crate::core::domain::Configuration;
use crate::core::error::Result;
use crate::core::spatial::{self, BoundaryConditions};
use crate::engine::constraint::{require_boundary, Constraint, ConstraintStatus, TrialPositions};

const IMPROPER_RULES: ExpansionRules = ExpansionRules {
    arity: 4,
    scale: std::f64::consts::PI / 180.0,
    allowed: (-90.0, 90.0),
};

/// Keeps an atom within an angular range of the plane through three others.
///
/// Definitions read `(improper, anchor, first, second, lower°, upper°)`: the
/// measured value is the signed angle between `anchor → improper` and the
/// plane `(anchor, first, second)`. A range around zero keeps rings flat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImproperAngleConstraint {
    status: ConstraintStatus,
    definitions: DefinitionTable,
    impropers: RangedTerms,
}

fn measure(bc: &BoundaryConditions, p: impl Fn(usize) -> nalgebra::Point3<f64>, a: &[usize]) -> f64 {
    spatial::improper_angle(bc, &p(a[0]), &p(a[1]), &p(a[2]), &p(a[3]))
}

impl ImproperAngleConstraint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit `(improper, anchor, first, second)` terms with bounds in radians.
    pub fn from_terms(terms: Vec<Term>) -> Self {
        Self {
            impropers: RangedTerms::new(terms),
            ..Self::default()
        }
    }

    pub fn create_angles_by_definition(
        &mut self,
        configuration: &Configuration,
        definitions: DefinitionTable,
    ) -> Result<()> {
        let terms = expand_definitions(configuration, &definitions, IMPROPER_RULES)?;
        self.definitions = definitions;
        self.impropers = RangedTerms::new(terms);
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
        self.impropers.terms()
    }

    /// Committed improper angles in radians.
    pub fn angle_values(&self) -> &[f64] {
        self.impropers.values()
    }
}

impl Constraint for ImproperAngleConstraint {
    fn name(&self) -> &str {
        "ImproperAngleConstraint"
    }

    fn status(&self) -> &ConstraintStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut ConstraintStatus {
        &mut self.status
    }

    fn validate(&self, configuration: &Configuration) -> Result<()> {
        check_terms(self.impropers.terms(), IMPROPER_RULES.arity, configuration.len())
    }

    fn initialize(
        &mut self,
        configuration: &Configuration,
        boundary: Option<&BoundaryConditions>,
    ) -> Result<()> {
        let bc = require_boundary(boundary, self.name())?;
        self.validate(configuration)?;
        let error = self
            .impropers
            .initialize(configuration.len(), |a| measure(bc, |i| *configuration.position(i), a))?;
        self.status.standard_error = error;
        self.status.initialized = true;
        debug!(
            "{} initialized: {} impropers, standard error {:.6}",
            self.name(),
            self.impropers.terms().len(),
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
        self.impropers.before_move(indices);
        Ok(())
    }

    fn compute_after_move(
        &mut self,
        trial: &TrialPositions<'_>,
        boundary: &BoundaryConditions,
    ) -> Result<f64> {
        self.impropers
            .after_move(trial.indices(), |a| measure(boundary, |i| *trial.position(i), a))
    }

    fn accept_move(&mut self) {
        if let Some(error) = self.impropers.accept() {
            self.status.standard_error = error;
        }
    }

    fn reject_move(&mut self) {
        self.impropers.reject();
    }

    fn full_standard_error(
        &self,
        configuration: &Configuration,
        boundary: &BoundaryConditions,
    ) -> Result<f64> {
        self.impropers
            .full_error(|a| measure(boundary, |i| *configuration.position(i), a))
    }
}
