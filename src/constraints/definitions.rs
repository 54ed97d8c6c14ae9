use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::domain::Configuration;
use crate::core::error::{ensure_finite, RmcError, Result};

/// One symbolic entry of a residue definition, e.g. `("C1", "C2", 1.25, 1.90)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermDefinition {
    pub atoms: Vec<String>,
    pub lower: f64,
    pub upper: f64,
}

impl TermDefinition {
    pub fn new(atoms: &[&str], lower: f64, upper: f64) -> Self {
        Self {
            atoms: atoms.iter().map(|a| a.to_string()).collect(),
            lower,
            upper,
        }
    }
}

/// Residue name → definitions for every molecule of that residue.
pub type DefinitionTable = BTreeMap<String, Vec<TermDefinition>>;

/// A concrete atom tuple with its allowed range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub atoms: Vec<usize>,
    pub lower: f64,
    pub upper: f64,
}

/// Rules applied while expanding definitions of one constraint family.
#[derive(Debug, Clone, Copy)]
pub struct ExpansionRules {
    pub arity: usize,
    /// Multiplier from definition units to internal units (degrees → radians).
    pub scale: f64,
    /// Inclusive range bounds must stay in, in definition units.
    pub allowed: (f64, f64),
}

/// Maps per-residue atom names to concrete indices for every molecule whose
/// residue matches a key of `table`.
///
/// Fails with `Definition` when a name is missing from a molecule, a tuple
/// has the wrong arity or repeats an atom, bounds are not finite, fall
/// outside `rules.allowed`, or `lower >= upper`, or no molecule carries a
/// defined residue.
pub fn expand_definitions(
    configuration: &Configuration,
    table: &DefinitionTable,
    rules: ExpansionRules,
) -> Result<Vec<Term>> {
    for (residue, defs) in table {
        for def in defs {
            check_definition(residue, def, rules)?;
        }
    }

    let atoms = configuration.atoms();
    let mut matched: HashMap<&str, usize> = HashMap::new();
    let mut terms = Vec::new();

    for (molecule, indices) in configuration.molecules() {
        let residue = atoms[indices[0]].residue.as_str();
        let defs = match table.get(residue) {
            Some(d) => d,
            None => continue,
        };
        *matched.entry(residue).or_default() += 1;

        let names: HashMap<&str, usize> = indices
            .iter()
            .map(|&i| (atoms[i].name.as_str(), i))
            .collect();

        for def in defs {
            let resolved = def
                .atoms
                .iter()
                .map(|name| {
                    names.get(name.as_str()).copied().ok_or_else(|| {
                        RmcError::Definition(format!(
                            "atom '{}' not found in molecule {} (residue '{}')",
                            name, molecule, residue
                        ))
                    })
                })
                .collect::<Result<Vec<usize>>>()?;
            terms.push(Term {
                atoms: resolved,
                lower: def.lower * rules.scale,
                upper: def.upper * rules.scale,
            });
        }
    }

    if let Some(residue) = table.keys().find(|r| !matched.contains_key(r.as_str())) {
        return Err(RmcError::Definition(format!(
            "no molecule with residue '{}' in the configuration",
            residue
        )));
    }
    Ok(terms)
}

fn check_definition(residue: &str, def: &TermDefinition, rules: ExpansionRules) -> Result<()> {
    if def.atoms.len() != rules.arity {
        return Err(RmcError::Definition(format!(
            "residue '{}': {:?} has {} atoms, expected {}",
            residue,
            def.atoms,
            def.atoms.len(),
            rules.arity
        )));
    }
    for (k, name) in def.atoms.iter().enumerate() {
        if def.atoms[..k].contains(name) {
            return Err(RmcError::Definition(format!(
                "residue '{}': atom '{}' repeated in {:?}",
                residue, name, def.atoms
            )));
        }
    }
    if !def.lower.is_finite() || !def.upper.is_finite() {
        return Err(RmcError::Definition(format!(
            "residue '{}': non-finite bounds for {:?}",
            residue, def.atoms
        )));
    }
    if def.lower >= def.upper {
        return Err(RmcError::Definition(format!(
            "residue '{}': lower bound {} not below upper bound {} for {:?}",
            residue, def.lower, def.upper, def.atoms
        )));
    }
    let (lo, hi) = rules.allowed;
    if def.lower < lo || def.upper > hi {
        return Err(RmcError::Definition(format!(
            "residue '{}': bounds [{}, {}] for {:?} outside [{}, {}]",
            residue, def.lower, def.upper, def.atoms, lo, hi
        )));
    }
    Ok(())
}

/// Checks explicit terms against a configuration size.
pub fn check_terms(terms: &[Term], arity: usize, num_atoms: usize) -> Result<()> {
    for term in terms {
        if term.atoms.len() != arity {
            return Err(RmcError::Definition(format!(
                "term {:?} has {} atoms, expected {}",
                term.atoms,
                term.atoms.len(),
                arity
            )));
        }
        if let Some(&i) = term.atoms.iter().find(|&&i| i >= num_atoms) {
            return Err(RmcError::Configuration(format!(
                "term {:?} refers to atom {} ({} atoms)",
                term.atoms, i, num_atoms
            )));
        }
        if !(term.lower < term.upper) {
            return Err(RmcError::Definition(format!(
                "term {:?}: lower bound {} not below upper bound {}",
                term.atoms, term.lower, term.upper
            )));
        }
    }
    Ok(())
}

/// Distance of `value` outside `[lower, upper]`; zero inside.
#[inline]
pub fn range_deviation(value: f64, lower: f64, upper: f64) -> f64 {
    if value < lower {
        lower - value
    } else if value > upper {
        value - upper
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Default)]
struct PendingTerms {
    ids: Vec<usize>,
    old_sq: f64,
    new_values: Vec<f64>,
    error: f64,
    evaluated: bool,
}

/// Committed measurements of a term list with incremental updates.
///
/// The standard error is Σ deviation² over all terms. A trial re-measures
/// only the terms that include a moving atom.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangedTerms {
    terms: Vec<Term>,
    values: Vec<f64>,
    /// atom → ids of the terms it appears in.
    atom_terms: Vec<Vec<usize>>,
    error: f64,

    #[serde(skip)]
    pending: Option<PendingTerms>,
}

impl RangedTerms {
    pub fn new(terms: Vec<Term>) -> Self {
        Self {
            terms,
            ..Self::default()
        }
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Committed measurement of each term.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn error(&self) -> f64 {
        self.error
    }

    fn deviation_sq(&self, id: usize, value: f64) -> f64 {
        let t = &self.terms[id];
        let d = range_deviation(value, t.lower, t.upper);
        d * d
    }

    pub fn initialize<M>(&mut self, num_atoms: usize, measure: M) -> Result<f64>
    where
        M: Fn(&[usize]) -> f64,
    {
        let mut atom_terms = vec![Vec::new(); num_atoms];
        for (id, term) in self.terms.iter().enumerate() {
            for &a in &term.atoms {
                atom_terms[a].push(id);
            }
        }
        self.atom_terms = atom_terms;
        self.values = self
            .terms
            .iter()
            .map(|t| ensure_finite(measure(&t.atoms), "term measurement"))
            .collect::<Result<Vec<f64>>>()?;
        self.error = self.full_error_of(&self.values);
        self.pending = None;
        Ok(self.error)
    }

    fn full_error_of(&self, values: &[f64]) -> f64 {
        values
            .iter()
            .enumerate()
            .map(|(id, &v)| self.deviation_sq(id, v))
            .sum()
    }

    /// Measures every term afresh without touching committed state.
    pub fn full_error<M>(&self, measure: M) -> Result<f64>
    where
        M: Fn(&[usize]) -> f64,
    {
        let values = self
            .terms
            .iter()
            .map(|t| ensure_finite(measure(&t.atoms), "term measurement"))
            .collect::<Result<Vec<f64>>>()?;
        Ok(self.full_error_of(&values))
    }

    fn affected(&self, indices: &[usize]) -> Vec<usize> {
        let mut ids: Vec<usize> = indices
            .iter()
            .filter_map(|&a| self.atom_terms.get(a))
            .flatten()
            .cloned()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn before_move(&mut self, indices: &[usize]) {
        let ids = self.affected(indices);
        let old_sq = ids.iter().map(|&id| self.deviation_sq(id, self.values[id])).sum();
        self.pending = Some(PendingTerms {
            ids,
            old_sq,
            ..PendingTerms::default()
        });
    }

    pub fn after_move<M>(&mut self, indices: &[usize], measure: M) -> Result<f64>
    where
        M: Fn(&[usize]) -> f64,
    {
        if self.pending.is_none() {
            self.before_move(indices);
        }
        let mut pending = self.pending.take().unwrap_or_default();
        pending.new_values = pending
            .ids
            .iter()
            .map(|&id| ensure_finite(measure(&self.terms[id].atoms), "term measurement"))
            .collect::<Result<Vec<f64>>>()?;
        let new_sq: f64 = pending
            .ids
            .iter()
            .zip(&pending.new_values)
            .map(|(&id, &v)| self.deviation_sq(id, v))
            .sum();
        pending.error = (self.error + (new_sq - pending.old_sq)).max(0.0);
        pending.evaluated = true;
        let error = pending.error;
        self.pending = Some(pending);
        Ok(error)
    }

    pub fn accept(&mut self) -> Option<f64> {
        let pending = self.pending.take().filter(|p| p.evaluated)?;
        for (&id, &v) in pending.ids.iter().zip(&pending.new_values) {
            self.values[id] = v;
        }
        self.error = pending.error;
        Some(self.error)
    }

    pub fn reject(&mut self) {
        self.pending = None;
    }
}
