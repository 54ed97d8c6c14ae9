use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::domain::Configuration;
use crate::core::error::{RmcError, Result};
use crate::engine::generators::MoveGenerator;

/// A set of atom indices that moves as one unit.
///
/// Membership is fixed at construction. Regrouping replaces the whole group
/// list (see [`groups_as_atoms`] and [`groups_as_molecules`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    id: usize,
    indices: Vec<usize>,
    generator: Option<MoveGenerator>,
    pub enabled: bool,
}

impl Group {
    /// Rejects empty groups, duplicate indices and indices outside `0..num_atoms`.
    pub fn new(id: usize, indices: Vec<usize>, num_atoms: usize) -> Result<Self> {
        if indices.is_empty() {
            return Err(RmcError::Configuration(format!("group {} is empty", id)));
        }
        let mut seen = HashSet::with_capacity(indices.len());
        for &i in &indices {
            if i >= num_atoms {
                return Err(RmcError::Configuration(format!(
                    "group {} index {} out of range ({} atoms)",
                    id, i, num_atoms
                )));
            }
            if !seen.insert(i) {
                return Err(RmcError::Configuration(format!(
                    "group {} lists atom {} twice",
                    id, i
                )));
            }
        }
        Ok(Self {
            id,
            indices,
            generator: Some(MoveGenerator::default()),
            enabled: true,
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn generator(&self) -> Option<&MoveGenerator> {
        self.generator.as_ref()
    }

    pub(crate) fn generator_mut(&mut self) -> Option<&mut MoveGenerator> {
        self.generator.as_mut()
    }

    /// Assigns a generator after checking it can move a group of this size.
    pub fn set_generator(&mut self, generator: MoveGenerator) -> Result<()> {
        generator.validate()?;
        if self.indices.len() < generator.min_group_size() {
            return Err(RmcError::Configuration(format!(
                "{} generator needs at least {} atoms, group {} has {}",
                generator.name(),
                generator.min_group_size(),
                self.id,
                self.indices.len()
            )));
        }
        self.generator = Some(generator);
        Ok(())
    }

    pub fn clear_generator(&mut self) {
        self.generator = None;
    }

    /// Eligible for selection: enabled and carrying a generator.
    #[inline]
    pub fn is_selectable(&self) -> bool {
        self.enabled && self.generator.is_some()
    }

    /// Re-checks the membership invariants against a configuration size.
    pub fn validate(&self, num_atoms: usize) -> Result<()> {
        Group::new(self.id, self.indices.clone(), num_atoms).map(|_| ())
    }
}

/// One single-atom group per atom.
pub fn groups_as_atoms(configuration: &Configuration) -> Result<Vec<Group>> {
    let n = configuration.len();
    (0..n).map(|i| Group::new(i, vec![i], n)).collect()
}

/// One group per molecule id, ordered by molecule id.
pub fn groups_as_molecules(configuration: &Configuration) -> Result<Vec<Group>> {
    let n = configuration.len();
    configuration
        .molecules()
        .into_values()
        .enumerate()
        .map(|(id, indices)| Group::new(id, indices, n))
        .collect()
}
