use std::f64::consts::PI;

use log::{debug, warn};
use nalgebra::Point3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::chemistry::{PairGrid, PairIndex, Weighting};
use crate::core::domain::Configuration;
use crate::core::error::{ensure_finite, RmcError, Result};
use crate::core::spatial::BoundaryConditions;
use crate::engine::constraint::{
    for_each_group_pair, require_boundary, Constraint, ConstraintStatus, TrialPositions,
};

/// Relative tolerance on the spacing of experimental distances.
const GRID_SPACING_TOLERANCE: f64 = 1e-6;

/// Fits the weighted total pair distribution function g(r) to experimental data.
///
/// Shells are centered on the experimental distances, which must be evenly
/// spaced. Committed state is one distance histogram per unordered element
/// pair; a trial only rebuilds the rows of the moving atoms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairDistributionConstraint {
    status: ConstraintStatus,
    weighting: Weighting,
    experimental_distances: Vec<f64>,
    experimental_pdf: Vec<f64>,
    bin_width: f64,
    min_edge: f64,

    // Built by initialize()
    pair_index: Option<PairIndex>,
    pair_weights: Option<PairGrid>,
    element_counts: Vec<usize>,
    volume: f64,
    /// `num_pairs * bins`, unordered pair counts.
    histogram: Vec<f64>,

    #[serde(skip)]
    before: Option<Vec<f64>>,
    #[serde(skip)]
    pending: Option<(Vec<f64>, f64)>,
}

impl PairDistributionConstraint {
    /// `experimental` holds `(distance, g(r))` pairs on an even grid.
    pub fn new(experimental: &[(f64, f64)], weighting: Weighting) -> Result<Self> {
        if experimental.len() < 2 {
            return Err(RmcError::Configuration(
                "experimental pair distribution needs at least two points".to_string(),
            ));
        }
        if experimental
            .iter()
            .any(|(r, g)| !r.is_finite() || !g.is_finite())
        {
            return Err(RmcError::Configuration(
                "experimental pair distribution contains non-finite values".to_string(),
            ));
        }

        let distances: Vec<f64> = experimental.iter().map(|(r, _)| *r).collect();
        let values: Vec<f64> = experimental.iter().map(|(_, g)| *g).collect();
        let bin_width = distances[1] - distances[0];
        if bin_width <= 0.0 {
            return Err(RmcError::Configuration(
                "experimental distances must be strictly increasing".to_string(),
            ));
        }
        for w in distances.windows(2) {
            if ((w[1] - w[0]) - bin_width).abs() > GRID_SPACING_TOLERANCE * bin_width.max(1.0) {
                return Err(RmcError::Configuration(format!(
                    "experimental distances are not evenly spaced near r = {}",
                    w[0]
                )));
            }
        }
        let min_edge = distances[0] - bin_width / 2.0;
        if min_edge < 0.0 {
            return Err(RmcError::Configuration(format!(
                "first shell starts at negative distance {}",
                min_edge
            )));
        }

        Ok(Self {
            status: ConstraintStatus::default(),
            weighting,
            experimental_distances: distances,
            experimental_pdf: values,
            bin_width,
            min_edge,
            pair_index: None,
            pair_weights: None,
            element_counts: Vec::new(),
            volume: 0.0,
            histogram: Vec::new(),
            before: None,
            pending: None,
        })
    }

    #[inline]
    pub fn bins(&self) -> usize {
        self.experimental_distances.len()
    }

    pub fn weighting(&self) -> Weighting {
        self.weighting
    }

    pub fn experimental_distances(&self) -> &[f64] {
        &self.experimental_distances
    }

    pub fn experimental_pdf(&self) -> &[f64] {
        &self.experimental_pdf
    }

    /// Shell centers; identical to the experimental distances.
    pub fn shell_centers(&self) -> &[f64] {
        &self.experimental_distances
    }

    fn max_edge(&self) -> f64 {
        self.min_edge + self.bin_width * self.bins() as f64
    }

    #[inline]
    fn bin_of(&self, dist_sq: f64) -> Option<usize> {
        let d = dist_sq.sqrt();
        if d < self.min_edge {
            return None;
        }
        let bin = ((d - self.min_edge) / self.bin_width) as usize;
        if bin < self.bins() {
            Some(bin)
        } else {
            None
        }
    }

    fn shell_volume(&self, bin: usize) -> f64 {
        let lo = self.min_edge + bin as f64 * self.bin_width;
        let hi = lo + self.bin_width;
        4.0 / 3.0 * PI * (hi * hi * hi - lo * lo * lo)
    }

    /// Number of unordered atom pairs of element types `(a, b)`.
    fn pair_population(&self, a: usize, b: usize) -> f64 {
        let na = self.element_counts[a] as f64;
        let nb = self.element_counts[b] as f64;
        if a == b {
            na * (na - 1.0) / 2.0
        } else {
            na * nb
        }
    }

    fn tables(&self) -> Result<(&PairIndex, &PairGrid)> {
        match (&self.pair_index, &self.pair_weights) {
            (Some(i), Some(w)) => Ok((i, w)),
            _ => Err(RmcError::Configuration(format!(
                "{} used before initialization",
                self.name()
            ))),
        }
    }

    /// Histogram of all pairs, rows processed in parallel.
    fn full_histogram(&self, configuration: &Configuration, bc: &BoundaryConditions) -> Result<Vec<f64>> {
        let (pair_index, _) = self.tables()?;
        let bins = self.bins();
        let len = pair_index.num_pairs() * bins;
        let n = configuration.len();
        let atoms = configuration.atoms();

        // Integral counts: the reduction order does not affect the result.
        let histogram = (0..n)
            .into_par_iter()
            .fold(
                || vec![0.0; len],
                |mut h, i| {
                    for j in (i + 1)..n {
                        let d_sq = bc.minimum_image_distance_sq(&atoms[i].position, &atoms[j].position);
                        if let Some(bin) = self.bin_of(d_sq) {
                            let p = pair_index.index(atoms[i].element_id, atoms[j].element_id);
                            h[p * bins + bin] += 1.0;
                        }
                    }
                    h
                },
            )
            .reduce(
                || vec![0.0; len],
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(b) {
                        *x += y;
                    }
                    a
                },
            );
        Ok(histogram)
    }

    /// Histogram restricted to pairs touching `indices`, with the group at
    /// `group_positions`.
    fn group_histogram(
        &self,
        configuration: &Configuration,
        bc: &BoundaryConditions,
        indices: &[usize],
        group_positions: &[Point3<f64>],
    ) -> Result<Vec<f64>> {
        let (pair_index, _) = self.tables()?;
        let bins = self.bins();
        let mut h = vec![0.0; pair_index.num_pairs() * bins];
        let mut bad = None;
        for_each_group_pair(configuration, bc, indices, group_positions, |a, b, d_sq| {
            if !d_sq.is_finite() {
                bad = Some(d_sq);
                return;
            }
            if let Some(bin) = self.bin_of(d_sq) {
                let p = pair_index.index(configuration.element_of(a), configuration.element_of(b));
                h[p * bins + bin] += 1.0;
            }
        });
        if let Some(value) = bad {
            return Err(RmcError::NumericInstability {
                context: format!("{} pair distance", self.name()),
                value,
            });
        }
        Ok(h)
    }

    /// Per-pair g(r) for a histogram, each row `bins` long.
    fn partials(&self, histogram: &[f64]) -> Result<Vec<Vec<f64>>> {
        let (pair_index, _) = self.tables()?;
        let bins = self.bins();
        let partials: Vec<Vec<f64>> = pair_index
            .pairs()
            .iter()
            .enumerate()
            .map(|(p, &(a, b))| {
                let population = self.pair_population(a, b);
                (0..bins)
                    .map(|bin| {
                        if population <= 0.0 {
                            0.0
                        } else {
                            histogram[p * bins + bin] * self.volume
                                / (population * self.shell_volume(bin))
                        }
                    })
                    .collect()
            })
            .collect();
        Ok(partials)
    }

    fn total_from(&self, histogram: &[f64]) -> Result<Vec<f64>> {
        let (pair_index, weights) = self.tables()?;
        let partials = self.partials(histogram)?;
        let mut total = vec![0.0; self.bins()];
        for (row, &(a, b)) in partials.iter().zip(pair_index.pairs().iter()) {
            let w = weights.get(a, b);
            for (t, g) in total.iter_mut().zip(row) {
                *t += w * g;
            }
        }
        Ok(total)
    }

    /// Sum over shells of (g_model - g_experimental)².
    fn chi_square(&self, histogram: &[f64]) -> Result<f64> {
        let total = self.total_from(histogram)?;
        let chi: f64 = total
            .iter()
            .zip(&self.experimental_pdf)
            .map(|(m, e)| (m - e) * (m - e))
            .sum();
        ensure_finite(chi, "pair distribution standard error")
    }

    /// Committed weighted total g(r), one value per shell.
    pub fn total_pdf(&self) -> Result<Vec<f64>> {
        self.total_from(&self.histogram)
    }

    /// Committed per-pair g(r) keyed by element symbols.
    pub fn partial_pdfs(&self, configuration: &Configuration) -> Result<Vec<(String, String, Vec<f64>)>> {
        let (pair_index, _) = self.tables()?;
        let partials = self.partials(&self.histogram)?;
        Ok(pair_index
            .pairs()
            .into_iter()
            .zip(partials)
            .map(|((a, b), g)| {
                (
                    configuration.species[a].symbol.clone(),
                    configuration.species[b].symbol.clone(),
                    g,
                )
            })
            .collect())
    }
}

impl Constraint for PairDistributionConstraint {
    fn name(&self) -> &str {
        "PairDistributionConstraint"
    }

    fn status(&self) -> &ConstraintStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut ConstraintStatus {
        &mut self.status
    }

    fn validate(&self, configuration: &Configuration) -> Result<()> {
        if configuration.len() < 2 {
            return Err(RmcError::Configuration(
                "pair distribution needs at least two atoms".to_string(),
            ));
        }
        Ok(())
    }

    fn initialize(
        &mut self,
        configuration: &Configuration,
        boundary: Option<&BoundaryConditions>,
    ) -> Result<()> {
        let bc = require_boundary(boundary, self.name())?;
        self.validate(configuration)?;

        let counts = configuration.element_counts();
        self.pair_weights = Some(self.weighting.pair_weights(&configuration.species, &counts)?);
        self.pair_index = Some(PairIndex::new(configuration.species.len()));
        self.element_counts = counts;
        self.volume = bc.volume();

        let v = bc.vectors();
        let shortest = (0..3).map(|k| v.column(k).norm()).fold(f64::MAX, f64::min);
        if self.max_edge() > shortest / 2.0 {
            warn!(
                "{}: shells reach {:.3} but half the shortest cell edge is {:.3}",
                self.name(),
                self.max_edge(),
                shortest / 2.0
            );
        }

        self.histogram = self.full_histogram(configuration, bc)?;
        self.before = None;
        self.pending = None;
        self.status.standard_error = self.chi_square(&self.histogram)?;
        self.status.initialized = true;
        debug!(
            "{} initialized: {} shells, standard error {:.6}",
            self.name(),
            self.bins(),
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
        self.before = Some(self.group_histogram(configuration, boundary, indices, &committed)?);
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
                self.group_histogram(configuration, boundary, trial.indices(), &committed)?
            }
        };
        let after = self.group_histogram(configuration, boundary, trial.indices(), trial.group_positions())?;

        let mut delta = after;
        for (d, b) in delta.iter_mut().zip(&before) {
            *d -= b;
        }
        let scratch: Vec<f64> = self.histogram.iter().zip(&delta).map(|(h, d)| h + d).collect();
        let error = self.chi_square(&scratch)?;
        self.pending = Some((scratch, error));
        Ok(error)
    }

    fn accept_move(&mut self) {
        if let Some((histogram, error)) = self.pending.take() {
            self.histogram = histogram;
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
        let histogram = self.full_histogram(configuration, boundary)?;
        self.chi_square(&histogram)
    }
}
