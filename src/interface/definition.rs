use std::fs;
use std::path::Path;

use log::info;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::constraints::{
    BondConstraint, BondsAngleConstraint, DefinitionTable, ImproperAngleConstraint,
    InterMolecularDistanceConstraint, PairDistributionConstraint, ViolationMode,
};
use crate::core::chemistry::Weighting;
use crate::core::domain::{Atom, Configuration, EngineSettings, Species};
use crate::core::error::{RmcError, Result};
use crate::core::spatial::BoundaryConditions;
use crate::engine::constraint::{AnyConstraint, Constraint};
use crate::engine::generators::MoveGenerator;
use crate::engine::selectors::GroupSelector;
use crate::solvers::rmc::Engine;

// --- Serde Schema ---

/// One atom of a system file. Species are referenced by symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomRecord {
    pub element: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub residue: String,
    #[serde(default)]
    pub molecule: usize,
    pub position: [f64; 3],
}

/// How atoms are split into move groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    #[default]
    Atoms,
    Molecules,
}

fn default_weighting() -> Weighting {
    Weighting::AtomicNumber
}

fn default_min_distance() -> f64 {
    1.5
}

fn default_mode() -> ViolationMode {
    ViolationMode::Magnitude
}

/// Constraint-specific part of a [`ConstraintSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ConstraintKind {
    PairDistribution {
        /// `(r, g(r))` pairs on an even grid.
        data: Vec<(f64, f64)>,
        #[serde(default = "default_weighting")]
        weighting: Weighting,
    },
    InterMolecularDistance {
        #[serde(default = "default_min_distance")]
        default_distance: f64,
        /// `(element, element, minimum distance)` overrides.
        #[serde(default)]
        pairs: Vec<(String, String, f64)>,
        #[serde(default = "default_mode")]
        mode: ViolationMode,
    },
    Bond {
        definitions: DefinitionTable,
    },
    BondsAngle {
        definitions: DefinitionTable,
    },
    ImproperAngle {
        definitions: DefinitionTable,
    },
}

fn default_weight() -> f64 {
    1.0
}

fn default_used() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    #[serde(flatten)]
    pub kind: ConstraintKind,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_used")]
    pub used: bool,
}

impl ConstraintSpec {
    pub fn new(kind: ConstraintKind) -> Self {
        Self {
            kind,
            weight: default_weight(),
            used: default_used(),
        }
    }

    /// Builds the constraint against a concrete configuration (definition
    /// tables are expanded here).
    pub fn build(&self, configuration: &Configuration) -> Result<AnyConstraint> {
        let mut constraint: AnyConstraint = match &self.kind {
            ConstraintKind::PairDistribution { data, weighting } => {
                PairDistributionConstraint::new(data, *weighting)?.into()
            }
            ConstraintKind::InterMolecularDistance {
                default_distance,
                pairs,
                mode,
            } => {
                let mut c = InterMolecularDistanceConstraint::new(*default_distance, *mode)?;
                for (a, b, d) in pairs {
                    c = c.with_pair_distance(a, b, *d)?;
                }
                c.into()
            }
            ConstraintKind::Bond { definitions } => {
                BondConstraint::from_definitions(configuration, definitions.clone())?.into()
            }
            ConstraintKind::BondsAngle { definitions } => {
                BondsAngleConstraint::from_definitions(configuration, definitions.clone())?.into()
            }
            ConstraintKind::ImproperAngle { definitions } => {
                ImproperAngleConstraint::from_definitions(configuration, definitions.clone())?
                    .into()
            }
        };
        constraint.set_weight(self.weight)?;
        constraint.set_used(self.used);
        Ok(constraint)
    }
}

/// A complete refinement job as read from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemDefinition {
    pub species: Vec<Species>,
    pub atoms: Vec<AtomRecord>,
    /// Lattice vectors a, b, c as three consecutive triples.
    #[serde(default)]
    pub lattice: Option<[f64; 9]>,
    #[serde(default)]
    pub settings: EngineSettings,
    #[serde(default)]
    pub grouping: Grouping,
    /// Applied to every group; the engine default when absent.
    #[serde(default)]
    pub generator: Option<MoveGenerator>,
    #[serde(default)]
    pub selector: Option<GroupSelector>,
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
}

impl SystemDefinition {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Resolves element symbols and validates the atom list.
    pub fn configuration(&self) -> Result<Configuration> {
        let atoms = self
            .atoms
            .iter()
            .enumerate()
            .map(|(i, rec)| {
                let element_id = self
                    .species
                    .iter()
                    .position(|s| s.symbol == rec.element)
                    .ok_or_else(|| {
                        RmcError::Definition(format!(
                            "atom {} has unknown element '{}'",
                            i, rec.element
                        ))
                    })?;
                let [x, y, z] = rec.position;
                Ok(Atom::new(element_id, Point3::new(x, y, z), rec.molecule)
                    .named(&rec.name, &rec.residue))
            })
            .collect::<Result<Vec<Atom>>>()?;
        Configuration::new(self.species.clone(), atoms)
    }

    /// Assembles an engine: configuration, boundary, groups, generator,
    /// selector and constraints, in that order. Used constraints are
    /// initialized so setup problems surface here rather than in `run`.
    pub fn build_engine(&self) -> Result<Engine> {
        let configuration = self.configuration()?;
        let specs = self
            .constraints
            .iter()
            .map(|spec| spec.build(&configuration))
            .collect::<Result<Vec<AnyConstraint>>>()?;

        let mut engine = Engine::new(configuration, self.settings.clone())?;
        if let Some(lattice) = &self.lattice {
            engine.set_boundary_conditions(BoundaryConditions::from_flat(lattice)?);
        }
        if self.grouping == Grouping::Molecules {
            engine.reset_groups_as_molecules()?;
        }
        if let Some(generator) = &self.generator {
            engine.set_all_group_generators(generator)?;
        }
        if let Some(selector) = &self.selector {
            engine.set_group_selector(selector.clone())?;
        }
        for constraint in specs {
            engine.add_constraint(constraint)?;
        }
        if engine.constraints().iter().any(|c| c.is_used()) {
            engine.initialize_used_constraints()?;
        }

        info!(
            "System built: {} atoms, {} groups, {} constraints",
            engine.configuration().len(),
            engine.groups().len(),
            engine.constraints().len()
        );
        Ok(engine)
    }
}
