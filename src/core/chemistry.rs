use serde::{Deserialize, Serialize};

use crate::core::domain::Species;
use crate::core::error::{RmcError, Result};

/// A flattened, symmetric species × species table.
/// Access is O(1) via `index = i * N + j`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairGrid {
    num_species: usize,
    values: Vec<f64>,
}

impl PairGrid {
    pub fn uniform(num_species: usize, value: f64) -> Self {
        Self {
            num_species,
            values: vec![value; num_species * num_species],
        }
    }

    /// Sets both (a, b) and (b, a).
    pub fn set(&mut self, a: usize, b: usize, value: f64) {
        let n = self.num_species;
        self.values[a * n + b] = value;
        self.values[b * n + a] = value;
    }

    #[inline(always)]
    pub fn get(&self, a: usize, b: usize) -> f64 {
        // Callers validate element ids when building the grid.
        self.values[a * self.num_species + b]
    }
}

/// Maps an unordered species pair to a dense index in `0..n(n+1)/2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairIndex {
    num_species: usize,
    lookup: Vec<usize>,
}

impl PairIndex {
    pub fn new(num_species: usize) -> Self {
        let mut lookup = vec![0; num_species * num_species];
        let mut next = 0;
        for a in 0..num_species {
            for b in a..num_species {
                lookup[a * num_species + b] = next;
                lookup[b * num_species + a] = next;
                next += 1;
            }
        }
        Self {
            num_species,
            lookup,
        }
    }

    #[inline(always)]
    pub fn index(&self, a: usize, b: usize) -> usize {
        self.lookup[a * self.num_species + b]
    }

    #[inline]
    pub fn num_pairs(&self) -> usize {
        self.num_species * (self.num_species + 1) / 2
    }

    /// Unordered pairs `(a, b)` with `a <= b`, in dense-index order.
    pub fn pairs(&self) -> Vec<(usize, usize)> {
        let n = self.num_species;
        (0..n).flat_map(|a| (a..n).map(move |b| (a, b))).collect()
    }
}

/// How element pairs contribute to a total pair distribution function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weighting {
    AtomicNumber,
    Neutron,
    Equal,
}

impl Weighting {
    fn factor(&self, species: &Species) -> f64 {
        match self {
            Weighting::AtomicNumber => species.atomic_number as f64,
            Weighting::Neutron => species.scattering_length,
            Weighting::Equal => 1.0,
        }
    }

    /// Partial weights `w_ab = (2 - δ_ab) c_a c_b f_a f_b / (Σ c_k f_k)²`.
    ///
    /// `counts` are the number of atoms per species; the weights of all
    /// unordered pairs sum to one.
    pub fn pair_weights(&self, species: &[Species], counts: &[usize]) -> Result<PairGrid> {
        if species.len() != counts.len() {
            return Err(RmcError::Configuration(format!(
                "{} species but {} element counts",
                species.len(),
                counts.len()
            )));
        }
        let total: usize = counts.iter().sum();
        if total == 0 {
            return Err(RmcError::Configuration(
                "cannot weight pairs of an empty configuration".to_string(),
            ));
        }
        let conc: Vec<f64> = counts.iter().map(|&c| c as f64 / total as f64).collect();
        let factors: Vec<f64> = species.iter().map(|s| self.factor(s)).collect();
        let norm: f64 = conc.iter().zip(&factors).map(|(c, f)| c * f).sum();
        if norm.abs() < 1e-12 {
            return Err(RmcError::Configuration(format!(
                "{:?} weighting is zero for this composition",
                self
            )));
        }

        let n = species.len();
        let mut grid = PairGrid::uniform(n, 0.0);
        for a in 0..n {
            for b in a..n {
                let multiplicity = if a == b { 1.0 } else { 2.0 };
                let w = multiplicity * conc[a] * conc[b] * factors[a] * factors[b] / (norm * norm);
                grid.set(a, b, w);
            }
        }
        Ok(grid)
    }
}
