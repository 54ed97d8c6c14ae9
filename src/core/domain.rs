use std::collections::BTreeMap;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::core::error::{RmcError, Result};

// --- Physics Types ---

/// Represents a single chemical element/species properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    pub symbol: String,
    pub atomic_number: u8,
    pub mass: f64,              // amu
    pub scattering_length: f64, // fm, coherent neutron
}

impl Default for Species {
    fn default() -> Self {
        Self {
            symbol: "X".to_string(),
            atomic_number: 1,
            mass: 1.0,
            scattering_length: 1.0,
        }
    }
}

impl Species {
    pub fn new(symbol: &str, atomic_number: u8, mass: f64, scattering_length: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            atomic_number,
            mass,
            scattering_length,
        }
    }
}

/// A single atom record of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub element_id: usize, // Index into Configuration::species
    pub position: Point3<f64>,
    pub molecule_id: usize,
    /// Atom name inside its residue (e.g. "C1"), used by definition expansion.
    pub name: String,
    /// Residue/molecule type (e.g. "THF").
    pub residue: String,
}

impl Atom {
    pub fn new(element_id: usize, position: Point3<f64>, molecule_id: usize) -> Self {
        Self {
            element_id,
            position,
            molecule_id,
            name: String::new(),
            residue: String::new(),
        }
    }

    pub fn named(mut self, name: &str, residue: &str) -> Self {
        self.name = name.to_string();
        self.residue = residue.to_string();
        self
    }
}

// --- The Core Entity ---

/// Ordered atom list plus the species table it refers to.
///
/// Only the engine's commit step mutates positions; constraints and
/// generators see it through shared references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub species: Vec<Species>,
    atoms: Vec<Atom>,
}

impl Configuration {
    /// Validates that every atom refers to a known species.
    pub fn new(species: Vec<Species>, atoms: Vec<Atom>) -> Result<Self> {
        if let Some((i, a)) = atoms
            .iter()
            .enumerate()
            .find(|(_, a)| a.element_id >= species.len())
        {
            return Err(RmcError::Configuration(format!(
                "atom {} refers to unknown species {} ({} species defined)",
                i,
                a.element_id,
                species.len()
            )));
        }
        if let Some(i) = atoms
            .iter()
            .position(|a| a.position.coords.iter().any(|c| !c.is_finite()))
        {
            return Err(RmcError::Configuration(format!(
                "atom {} has a non-finite coordinate",
                i
            )));
        }
        Ok(Self { species, atoms })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    #[inline]
    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    #[inline]
    pub fn position(&self, index: usize) -> &Point3<f64> {
        &self.atoms[index].position
    }

    #[inline]
    pub fn element_of(&self, index: usize) -> usize {
        self.atoms[index].element_id
    }

    pub fn positions_of(&self, indices: &[usize]) -> Vec<Point3<f64>> {
        indices.iter().map(|&i| self.atoms[i].position).collect()
    }

    /// Writes committed coordinates. Crate-private: only the engine commits.
    pub(crate) fn commit_positions(&mut self, indices: &[usize], positions: &[Point3<f64>]) {
        for (&i, p) in indices.iter().zip(positions.iter()) {
            self.atoms[i].position = *p;
        }
    }

    /// Number of atoms per species, indexed by element id.
    pub fn element_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.species.len()];
        for atom in &self.atoms {
            counts[atom.element_id] += 1;
        }
        counts
    }

    /// Atom indices grouped by molecule id, in ascending molecule order.
    pub fn molecules(&self) -> BTreeMap<usize, Vec<usize>> {
        let mut map: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, atom) in self.atoms.iter().enumerate() {
            map.entry(atom.molecule_id).or_default().push(i);
        }
        map
    }

    pub fn species_index(&self, symbol: &str) -> Option<usize> {
        self.species.iter().position(|s| s.symbol == symbol)
    }
}

// --- Configuration Types ---

/// Engine-wide tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub seed: u64,
    /// Scale of the Metropolis-like acceptance: P = exp(-ΔE / temperature).
    /// Zero or negative means worse moves are never accepted.
    pub temperature: f64,
    /// Emit a `StepUpdate` event every this many steps (0 disables).
    pub report_frequency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            temperature: 0.0,
            report_frequency: 1000,
        }
    }
}
