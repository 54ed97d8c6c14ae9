use log::debug;
use nalgebra::Point3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::chemistry::PairGrid;
use crate::core::domain::Configuration;
use crate::core::error::{ensure_finite, RmcError, Result};
use crate::core::spatial::BoundaryConditions;
use crate::engine::constraint::{
    for_each_group_pair, require_boundary, Constraint, ConstraintStatus, TrialPositions,
};

/// How a too-close pair adds to the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationMode {
    /// Each violating pair counts 1.
    Count,
    /// Each violating pair adds `min_distance - distance`.
    Magnitude,
}

/// Penalizes atoms of different molecules closer than an allowed minimum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterMolecularDistanceConstraint {
    status: ConstraintStatus,
    default_distance: f64,
    /// Per element-symbol pair overrides of the minimum distance.
    pairs_distance: Vec<(String, String, f64)>,
    mode: ViolationMode,

    // Built by initialize()
    min_distance_sq: Option<PairGrid>,

    #[serde(skip)]
    before: Option<f64>,
    #[serde(skip)]
    pending: Option<f64>,
}

impl Default for InterMolecularDistanceConstraint {
    fn default() -> Self {
        Self {
            status: ConstraintStatus::default(),
            default_distance: 1.5,
            pairs_distance: Vec::new(),
            mode: ViolationMode::Magnitude,
            min_distance_sq: None,
            before: None,
            pending: None,
        }
    }
}

fn check_distance(d: f64) -> Result<()> {
    if !d.is_finite() || d < 0.0 {
        return Err(RmcError::Configuration(format!(
            "minimum distance {} must be finite and non-negative",
            d
        )));
    }
    Ok(())
}

impl InterMolecularDistanceConstraint {
    pub fn new(default_distance: f64, mode: ViolationMode) -> Result<Self> {
        check_distance(default_distance)?;
        Ok(Self {
            default_distance,
            mode,
            ..Self::default()
        })
    }

    /// Overrides the minimum distance for one element pair (order irrelevant).
    pub fn with_pair_distance(mut self, a: &str, b: &str, distance: f64) -> Result<Self> {
        check_distance(distance)?;
        self.pairs_distance.push((a.to_string(), b.to_string(), distance));
        self.status.initialized = false;
        Ok(self)
    }

    pub fn default_distance(&self) -> f64 {
        self.default_distance
    }

    pub fn mode(&self) -> ViolationMode {
        self.mode
    }

    fn build_grid(&self, configuration: &Configuration) -> Result<PairGrid> {
        let n = configuration.species.len();
        let d0 = self.default_distance;
        let mut grid = PairGrid::uniform(n, d0 * d0);
        for (a, b, d) in &self.pairs_distance {
            let ia = configuration.species_index(a).ok_or_else(|| {
                RmcError::Configuration(format!("unknown element '{}' in pair distances", a))
            })?;
            let ib = configuration.species_index(b).ok_or_else(|| {
                RmcError::Configuration(format!("unknown element '{}' in pair distances", b))
            })?;
            grid.set(ia, ib, d * d);
        }
        Ok(grid)
    }

    fn grid(&self) -> Result<&PairGrid> {
        self.min_distance_sq.as_ref().ok_or_else(|| {
            RmcError::Configuration(format!("{} used before initialization", self.name()))
        })
    }

    #[inline]
    fn penalty(&self, grid: &PairGrid, ea: usize, eb: usize, dist_sq: f64) -> f64 {
        let limit_sq = grid.get(ea, eb);
        if dist_sq >= limit_sq {
            return 0.0;
        }
        match self.mode {
            ViolationMode::Count => 1.0,
            ViolationMode::Magnitude => limit_sq.sqrt() - dist_sq.sqrt(),
        }
    }

    fn full_violation(&self, configuration: &Configuration, bc: &BoundaryConditions) -> Result<f64> {
        let grid = self.grid()?;
        let atoms = configuration.atoms();
        let n = atoms.len();

        // Per-row sums collected in order, then summed sequentially, so the
        // total does not depend on thread scheduling.
        let rows: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut row = 0.0;
                for j in (i + 1)..n {
                    if atoms[i].molecule_id == atoms[j].molecule_id {
                        continue;
                    }
                    let d_sq = bc.minimum_image_distance_sq(&atoms[i].position, &atoms[j].position);
                    row += self.penalty(grid, atoms[i].element_id, atoms[j].element_id, d_sq);
                }
                row
            })
            .collect();
        ensure_finite(rows.iter().sum(), "inter-molecular violation")
    }

    fn group_violation(
        &self,
        configuration: &Configuration,
        bc: &BoundaryConditions,
        indices: &[usize],
        group_positions: &[Point3<f64>],
    ) -> Result<f64> {
        let grid = self.grid()?;
        let atoms = configuration.atoms();
        let mut total = 0.0;
        for_each_group_pair(configuration, bc, indices, group_positions, |a, b, d_sq| {
            if atoms[a].molecule_id != atoms[b].molecule_id {
                total += self.penalty(grid, atoms[a].element_id, atoms[b].element_id, d_sq);
            }
        });
        ensure_finite(total, "inter-molecular violation")
    }
}

impl Constraint for InterMolecularDistanceConstraint {
    fn name(&self) -> &str {
        "InterMolecularDistanceConstraint"
    }

    fn status(&self) -> &ConstraintStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut ConstraintStatus {
        &mut self.status
    }

    fn validate(&self, configuration: &Configuration) -> Result<()> {
        self.build_grid(configuration).map(|_| ())
    }

    fn initialize(
        &mut self,
        configuration: &Configuration,
        boundary: Option<&BoundaryConditions>,
    ) -> Result<()> {
        let bc = require_boundary(boundary, self.name())?;
        self.min_distance_sq = Some(self.build_grid(configuration)?);
        self.status.standard_error = self.full_violation(configuration, bc)?;
        self.before = None;
        self.pending = None;
        self.status.initialized = true;
        debug!(
            "{} initialized: standard error {:.6}",
            self.name(),
            self.status.standard_error
        );
        Ok(())
    }

    fn compute_before_move(
        &mut self,
        configuration: &Configuration,
        boundary: &BoundaryConditions,
        indices: &[usize],
    ) -> Result<()> {
        let committed = configuration.positions_of(indices);
        self.before = Some(self.group_violation(configuration, boundary, indices, &committed)?);
        Ok(())
    }

    fn compute_after_move(
        &mut self,
        trial: &TrialPositions<'_>,
        boundary: &BoundaryConditions,
    ) -> Result<f64> {
        let configuration = trial.configuration();
        let before = match self.before.take() {
            Some(b) => b,
            None => {
                let committed = configuration.positions_of(trial.indices());
                self.group_violation(configuration, boundary, trial.indices(), &committed)?
            }
        };
        let after = self.group_violation(configuration, boundary, trial.indices(), trial.group_positions())?;
        // Clamp rounding residue; the error is a sum of non-negative terms.
        let error = (self.status.standard_error + (after - before)).max(0.0);
        self.pending = Some(error);
        Ok(error)
    }

    fn accept_move(&mut self) {
        if let Some(error) = self.pending.take() {
            self.status.standard_error = error;
        }
        self.before = None;
    }

    fn reject_move(&mut self) {
        self.pending = None;
        self.before = None;
    }

    fn full_standard_error(
        &self,
        configuration: &Configuration,
        boundary: &BoundaryConditions,
    ) -> Result<f64> {
        self.full_violation(configuration, boundary)
    }
}
