pub mod angles;
pub mod bonds;
pub mod definitions;
pub mod distance;
pub mod improper;
pub mod pair_distribution;

pub use angles::BondsAngleConstraint;
pub use bonds::BondConstraint;
pub use definitions::{DefinitionTable, Term, TermDefinition};
pub use distance::{InterMolecularDistanceConstraint, ViolationMode};
pub use improper::ImproperAngleConstraint;
pub use pair_distribution::PairDistributionConstraint;
