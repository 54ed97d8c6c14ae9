use log::debug;
use serde::{Deserialize, Serialize};

use crate::constraints::definitions::{
    check_terms, expand_definitions, DefinitionTable, ExpansionRules, RangedTerms, Term,
};
use crate::core::domain::Configuration;
use crate::core::error::Result;
use crate::core::spatial::BoundaryConditions;
use crate::engine::constraint::{require_boundary, Constraint, ConstraintStatus, TrialPositions};

const BOND_RULES: ExpansionRules = ExpansionRules {
    arity: 2,
    scale: 1.0,
    allowed: (0.0, f64::INFINITY),
};

/// Keeps bond lengths inside `[lower, upper]`.
///
/// Standard error is Σ (distance outside the range)² over all bonds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BondConstraint {
    status: ConstraintStatus,
    definitions: DefinitionTable,
    bonds: RangedTerms,
}

impl BondConstraint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit `(i, j)` bonds; indices are checked when the constraint is attached.
    pub fn from_terms(terms: Vec<Term>) -> Self {
        Self {
            bonds: RangedTerms::new(terms),
            ..Self::default()
        }
    }

    /// Replaces the bond list with the expansion of `definitions` over every
    /// molecule of the matching residues.
    pub fn create_bonds_by_definition(
        &mut self,
        configuration: &Configuration,
        definitions: DefinitionTable,
    ) -> Result<()> {
        let terms = expand_definitions(configuration, &definitions, BOND_RULES)?;
        self.definitions = definitions;
        self.bonds = RangedTerms::new(terms);
        self.status.initialized = false;
        Ok(())
    }

    pub fn from_definitions(configuration: &Configuration, definitions: DefinitionTable) -> Result<Self> {
        let mut c = Self::new();
        c.create_bonds_by_definition(configuration, definitions)?;
        Ok(c)
    }

    pub fn definitions(&self) -> &DefinitionTable {
        &self.definitions
    }

    pub fn bonds(&self) -> &[Term] {
        self.bonds.terms()
    }

    /// Committed bond lengths, one per bond.
    pub fn bond_lengths(&self) -> &[f64] {
        self.bonds.values()
    }
}

impl Constraint for BondConstraint {
    fn name(&self) -> &str {
        "BondConstraint"
    }

    fn status(&self) -> &ConstraintStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut ConstraintStatus {
        &mut self.status
    }

    fn validate(&self, configuration: &Configuration) -> Result<()> {
        check_terms(self.bonds.terms(), BOND_RULES.arity, configuration.len())
    }

    fn initialize(
        &mut self,
        configuration: &Configuration,
        boundary: Option<&BoundaryConditions>,
    ) -> Result<()> {
        let bc = require_boundary(boundary, self.name())?;
        self.validate(configuration)?;
        let error = self.bonds.initialize(configuration.len(), |a| {
            bc.minimum_image_distance(configuration.position(a[0]), configuration.position(a[1]))
        })?;
        self.status.standard_error = error;
        self.status.initialized = true;
        debug!(
            "{} initialized: {} bonds, standard error {:.6}",
            self.name(),
            self.bonds.terms().len(),
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
        self.bonds.before_move(indices);
        Ok(())
    }

    fn compute_after_move(
        &mut self,
        trial: &TrialPositions<'_>,
        boundary: &BoundaryConditions,
    ) -> Result<f64> {
        self.bonds.after_move(trial.indices(), |a| {
            boundary.minimum_image_distance(trial.position(a[0]), trial.position(a[1]))
        })
    }

    fn accept_move(&mut self) {
        if let Some(error) = self.bonds.accept() {
            self.status.standard_error = error;
        }
    }

    fn reject_move(&mut self) {
        self.bonds.reject();
    }

    fn full_standard_error(
        &self,
        configuration: &Configuration,
        boundary: &BoundaryConditions,
    ) -> Result<f64> {
        self.bonds.full_error(|a| {
            boundary.minimum_image_distance(configuration.position(a[0]), configuration.position(a[1]))
        })
    }
}
