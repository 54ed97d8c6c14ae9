//! Reverse Monte Carlo structural refinement.
//!
//! An [`Engine`] owns a [`Configuration`], perturbs groups of atoms with
//! [`MoveGenerator`]s chosen by a [`GroupSelector`], and keeps or discards each
//! trial according to the standard error reported by its constraints.

pub mod analysis;
pub mod constraints;
pub mod core;
pub mod engine;
pub mod interface;
pub mod solvers;

pub use crate::core::domain::{Atom, Configuration, EngineSettings, Species};
pub use crate::core::error::{Result, RmcError};
pub use crate::core::spatial::BoundaryConditions;
pub use crate::engine::generators::MoveGenerator;
pub use crate::engine::selectors::GroupSelector;
pub use crate::solvers::rmc::{Engine, RunOptions, RunSummary};
