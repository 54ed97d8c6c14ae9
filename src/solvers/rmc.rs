use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use log::{info, warn};
use nalgebra::Point3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use uuid::Uuid;

use crate::core::domain::{Configuration, EngineSettings};
use crate::core::error::{RmcError, Result};
use crate::core::spatial::BoundaryConditions;
use crate::engine::checkpoint::{self, CheckpointInfo, EngineState, RunCounters};
use crate::engine::constraint::{AnyConstraint, Constraint, TrialPositions};
use crate::engine::generators::MoveGenerator;
use crate::engine::group::{self, Group};
use crate::engine::selectors::GroupSelector;
use crate::solvers::{SolverEvent, StepStats};

/// Position of a constraint in the engine's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstraintId(pub usize);

/// Run-loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Checkpointing,
}

/// Parameters of one `run` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub number_of_steps: usize,
    /// Checkpoint every this many steps (0: only at the end of the run).
    pub save_frequency: usize,
    /// Where checkpoints go; `None` disables checkpointing.
    pub save_path: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(number_of_steps: usize) -> Self {
        Self {
            number_of_steps,
            save_frequency: 0,
            save_path: None,
        }
    }

    pub fn save_every(mut self, save_frequency: usize, save_path: impl Into<PathBuf>) -> Self {
        self.save_frequency = save_frequency;
        self.save_path = Some(save_path.into());
        self
    }
}

/// What one `run` call did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub steps: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// True when a stop request ended the run early.
    pub stopped: bool,
    pub total_error: f64,
}

/// Cooperative cancellation, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Ends a recursive selector's current streak from another thread. The
/// signal is consumed by the next selection.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceHandle(Arc<AtomicBool>);

impl ConvergenceHandle {
    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_signaled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Incremental vs from-scratch standard error of one constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintDrift {
    pub name: String,
    pub incremental: f64,
    pub full: f64,
}

impl ConstraintDrift {
    pub fn abs_diff(&self) -> f64 {
        (self.incremental - self.full).abs()
    }
}

/// Metropolis-like rule: never-worse moves always pass; a move that raises
/// the total error by `delta` passes with probability exp(-delta / T), and
/// never when T <= 0.
pub fn acceptance_probability(delta: f64, temperature: f64) -> f64 {
    if delta <= 0.0 {
        1.0
    } else if temperature <= 0.0 {
        0.0
    } else {
        (-delta / temperature).exp()
    }
}

/// The Reverse Monte Carlo engine.
///
/// Owns the configuration, boundary conditions, groups, selector and
/// constraints. `run` can be called repeatedly; each call resumes from the
/// last committed state.
pub struct Engine {
    state: EngineState,
    phase: Phase,
    stop: StopHandle,
    converged: ConvergenceHandle,
    events: Option<Sender<SolverEvent>>,
}

impl Engine {
    /// One single-atom group per atom, each with the default translation
    /// generator, selected at random.
    pub fn new(configuration: Configuration, settings: EngineSettings) -> Result<Self> {
        let groups = group::groups_as_atoms(&configuration)?;
        let rng = ChaCha8Rng::seed_from_u64(settings.seed);
        Ok(Self {
            state: EngineState {
                id: Uuid::new_v4(),
                settings,
                configuration,
                boundary: None,
                groups,
                selector: GroupSelector::Random,
                constraints: Vec::new(),
                counters: RunCounters::default(),
                rng,
            },
            phase: Phase::Idle,
            stop: StopHandle::default(),
            converged: ConvergenceHandle::default(),
            events: None,
        })
    }

    // --- Accessors ---

    pub fn id(&self) -> Uuid {
        self.state.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.state.settings
    }

    pub fn configuration(&self) -> &Configuration {
        &self.state.configuration
    }

    pub fn boundary_conditions(&self) -> Option<&BoundaryConditions> {
        self.state.boundary.as_ref()
    }

    pub fn groups(&self) -> &[Group] {
        &self.state.groups
    }

    pub fn selector(&self) -> &GroupSelector {
        &self.state.selector
    }

    pub fn constraints(&self) -> &[AnyConstraint] {
        &self.state.constraints
    }

    pub fn constraint(&self, id: ConstraintId) -> Option<&AnyConstraint> {
        self.state.constraints.get(id.0)
    }

    /// Direct access, e.g. to redefine bonds. Changes are validated when the
    /// constraint is next initialized.
    pub fn constraint_mut(&mut self, id: ConstraintId) -> Option<&mut AnyConstraint> {
        self.state.constraints.get_mut(id.0)
    }

    pub fn counters(&self) -> &RunCounters {
        &self.state.counters
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Handle for [`Engine::signal_converged`] usable while `run` holds the engine.
    pub fn convergence_handle(&self) -> ConvergenceHandle {
        self.converged.clone()
    }

    pub fn set_event_sender(&mut self, tx: Sender<SolverEvent>) {
        self.events = Some(tx);
    }

    fn emit(&self, event: SolverEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    // --- Setup ---

    /// Stale constraint tables are rebuilt on the next run.
    pub fn set_boundary_conditions(&mut self, boundary: BoundaryConditions) {
        self.state.boundary = Some(boundary);
        for c in &mut self.state.constraints {
            c.status_mut().initialized = false;
        }
    }

    pub fn set_temperature(&mut self, temperature: f64) -> Result<()> {
        if !temperature.is_finite() {
            return Err(RmcError::Configuration(format!(
                "temperature {} must be finite",
                temperature
            )));
        }
        self.state.settings.temperature = temperature;
        Ok(())
    }

    /// Replaces the whole group list. Ids must be unique, every group valid
    /// for the current configuration and the current selector must fit the
    /// new list; on error nothing changes.
    pub fn set_groups(&mut self, groups: Vec<Group>) -> Result<()> {
        let n = self.state.configuration.len();
        let mut ids = HashSet::with_capacity(groups.len());
        for g in &groups {
            g.validate(n)?;
            if !ids.insert(g.id()) {
                return Err(RmcError::Configuration(format!(
                    "group id {} used twice",
                    g.id()
                )));
            }
        }
        self.state.selector.validate(groups.len()).map_err(|e| {
            RmcError::Configuration(format!(
                "{} selector does not fit {} groups; set a new selector first ({})",
                self.state.selector.name(),
                groups.len(),
                e
            ))
        })?;
        self.state.groups = groups;
        self.state.selector.reset();
        Ok(())
    }

    pub fn reset_groups_as_atoms(&mut self) -> Result<()> {
        let groups = group::groups_as_atoms(&self.state.configuration)?;
        self.set_groups(groups)
    }

    /// One group per molecule. Generators return to the default translation.
    pub fn reset_groups_as_molecules(&mut self) -> Result<()> {
        let groups = group::groups_as_molecules(&self.state.configuration)?;
        self.set_groups(groups)
    }

    pub fn set_group_generator(&mut self, position: usize, generator: MoveGenerator) -> Result<()> {
        let n = self.state.groups.len();
        let g = self.state.groups.get_mut(position).ok_or_else(|| {
            RmcError::Configuration(format!("no group at position {} ({} groups)", position, n))
        })?;
        g.set_generator(generator)
    }

    /// Assigns a copy of `generator` to every group.
    pub fn set_all_group_generators(&mut self, generator: &MoveGenerator) -> Result<()> {
        for g in &mut self.state.groups {
            g.set_generator(generator.clone())?;
        }
        Ok(())
    }

    pub fn set_group_enabled(&mut self, position: usize, enabled: bool) -> Result<()> {
        let n = self.state.groups.len();
        let g = self.state.groups.get_mut(position).ok_or_else(|| {
            RmcError::Configuration(format!("no group at position {} ({} groups)", position, n))
        })?;
        g.enabled = enabled;
        Ok(())
    }

    pub fn set_group_selector(&mut self, selector: GroupSelector) -> Result<()> {
        selector.validate(self.state.groups.len())?;
        self.state.selector = selector;
        Ok(())
    }

    /// Tells a recursive selector to move on to a new group.
    pub fn signal_converged(&mut self) {
        self.converged.take();
        self.state.selector.signal_converged();
    }

    /// Attaches a constraint after checking it against the configuration.
    pub fn add_constraint(&mut self, constraint: impl Into<AnyConstraint>) -> Result<ConstraintId> {
        let constraint = constraint.into();
        constraint.validate(&self.state.configuration)?;
        self.state.constraints.push(constraint);
        Ok(ConstraintId(self.state.constraints.len() - 1))
    }

    pub fn set_constraint_used(&mut self, id: ConstraintId, used: bool) -> Result<()> {
        let n = self.state.constraints.len();
        let c = self.state.constraints.get_mut(id.0).ok_or_else(|| {
            RmcError::Configuration(format!("no constraint {} ({} attached)", id.0, n))
        })?;
        c.set_used(used);
        Ok(())
    }

    pub fn set_constraint_weight(&mut self, id: ConstraintId, weight: f64) -> Result<()> {
        let n = self.state.constraints.len();
        let c = self.state.constraints.get_mut(id.0).ok_or_else(|| {
            RmcError::Configuration(format!("no constraint {} ({} attached)", id.0, n))
        })?;
        c.set_weight(weight)
    }

    /// Rebuilds the committed state of every used constraint from scratch.
    pub fn initialize_used_constraints(&mut self) -> Result<()> {
        let state = &mut self.state;
        for c in state.constraints.iter_mut().filter(|c| c.is_used()) {
            c.initialize(&state.configuration, state.boundary.as_ref())?;
        }
        Ok(())
    }

    /// Σ weight × committed error over used constraints.
    pub fn total_standard_error(&self) -> f64 {
        self.state
            .constraints
            .iter()
            .filter(|c| c.is_used())
            .map(|c| c.weight() * c.standard_error())
            .sum()
    }

    /// Recomputes every used constraint from scratch and pairs the result
    /// with its incrementally maintained error.
    pub fn verify_constraints(&self) -> Result<Vec<ConstraintDrift>> {
        let state = &self.state;
        let used: Vec<&AnyConstraint> = state.constraints.iter().filter(|c| c.is_used()).collect();
        if used.is_empty() {
            return Ok(Vec::new());
        }
        let bc = state.boundary.as_ref().ok_or_else(|| {
            RmcError::Configuration("boundary conditions are not set".to_string())
        })?;
        used.into_iter()
            .map(|c| -> Result<ConstraintDrift> {
                Ok(ConstraintDrift {
                    name: c.name().to_string(),
                    incremental: c.standard_error(),
                    full: c.full_standard_error(&state.configuration, bc)?,
                })
            })
            .collect()
    }

    /// Setup checks that must hold before the first step of a run.
    fn prepare(&mut self) -> Result<()> {
        self.state.selector.validate(self.state.groups.len())?;
        let any_used = self.state.constraints.iter().any(|c| c.is_used());
        if any_used && self.state.boundary.is_none() {
            return Err(RmcError::Configuration(
                "boundary conditions must be set before running with constraints".to_string(),
            ));
        }
        let state = &mut self.state;
        for c in state.constraints.iter_mut().filter(|c| c.is_used() && !c.is_initialized()) {
            if state.counters.step > 0 {
                warn!("{} is stale; re-initializing", c.name());
            }
            c.initialize(&state.configuration, state.boundary.as_ref())?;
        }
        Ok(())
    }

    // --- Run loop ---

    /// Performs `options.number_of_steps` trial moves.
    ///
    /// A numeric or checkpoint failure aborts the run and leaves the engine
    /// idle; the configuration then holds the last committed step and the
    /// last checkpoint on disk is untouched.
    pub fn run(&mut self, options: &RunOptions) -> Result<RunSummary> {
        self.prepare()?;
        self.phase = Phase::Running;
        match self.run_steps(options) {
            Ok(summary) => {
                self.phase = Phase::Idle;
                info!(
                    "RMC run finished: {} steps, {} accepted, total error {:.6}",
                    summary.steps, summary.accepted, summary.total_error
                );
                self.emit(SolverEvent::Finished(summary.clone()));
                Ok(summary)
            }
            Err(e) => {
                self.phase = Phase::Idle;
                warn!("Run aborted at step {}: {}", self.state.counters.step, e);
                self.emit(SolverEvent::Log(format!("Run aborted: {}", e)));
                Err(e)
            }
        }
    }

    fn run_steps(&mut self, options: &RunOptions) -> Result<RunSummary> {
        info!(
            "RMC run: {} steps from step {}, {} groups, {} used constraints, total error {:.6}",
            options.number_of_steps,
            self.state.counters.step,
            self.state.groups.len(),
            self.state.constraints.iter().filter(|c| c.is_used()).count(),
            self.total_standard_error()
        );

        let start = Instant::now();
        let start_accepted = self.state.counters.accepted;
        let start_rejected = self.state.counters.rejected;
        let mut committed_total = self.total_standard_error();
        let mut steps = 0;
        let mut stopped = false;

        for _ in 0..options.number_of_steps {
            if self.stop.is_stop_requested() {
                stopped = true;
                break;
            }
            self.step(&mut committed_total)?;
            steps += 1;

            let step = self.state.counters.step;
            if let Some(path) = &options.save_path {
                if options.save_frequency > 0 && step % options.save_frequency as u64 == 0 {
                    self.checkpoint(path)?;
                }
            }
            let every = self.state.settings.report_frequency as u64;
            if every > 0 && step % every == 0 {
                self.report(start);
            }
        }

        if stopped {
            info!("Stop requested at step {}", self.state.counters.step);
            self.stop.clear();
        }

        if let Some(path) = &options.save_path {
            let already_saved = options.save_frequency > 0
                && steps > 0
                && self.state.counters.step % options.save_frequency as u64 == 0;
            if !already_saved {
                self.checkpoint(path)?;
            }
        }

        Ok(RunSummary {
            steps,
            accepted: (self.state.counters.accepted - start_accepted) as usize,
            rejected: (self.state.counters.rejected - start_rejected) as usize,
            stopped,
            total_error: self.total_standard_error(),
        })
    }

    /// Coordinates of a group with every atom taken as the periodic image
    /// nearest to the group's first atom, so rigid moves keep it whole.
    fn group_coordinates(&self, indices: &[usize]) -> Vec<Point3<f64>> {
        let config = &self.state.configuration;
        match (&self.state.boundary, indices.first()) {
            (Some(bc), Some(&first)) if indices.len() > 1 => {
                let anchor = *config.position(first);
                indices
                    .iter()
                    .map(|&i| anchor + bc.minimum_image_vector(&anchor, config.position(i)))
                    .collect()
            }
            _ => config.positions_of(indices),
        }
    }

    /// One select → generate → evaluate → accept/reject cycle.
    /// Returns whether the move was accepted.
    fn step(&mut self, committed_total: &mut f64) -> Result<bool> {
        if self.converged.take() {
            self.state.selector.signal_converged();
        }
        let position = {
            let state = &mut self.state;
            state.selector.select(&state.groups, &mut state.rng)?
        };
        let indices = self.state.groups[position].indices().to_vec();
        let current = self.group_coordinates(&indices);

        let candidate = {
            let state = &mut self.state;
            let generator = state.groups[position].generator_mut().ok_or_else(|| {
                RmcError::SelectionExhausted(format!("group at position {} has no generator", position))
            })?;
            generator.generate(&current, &mut state.rng)
        };
        self.state.counters.generated += 1;

        if candidate.len() != indices.len() {
            return Err(RmcError::NumericInstability {
                context: format!("generator returned {} positions for {} atoms", candidate.len(), indices.len()),
                value: candidate.len() as f64,
            });
        }
        if let Some(p) = candidate.iter().find(|p| p.coords.iter().any(|c| !c.is_finite())) {
            return Err(RmcError::NumericInstability {
                context: "candidate coordinate".to_string(),
                value: p.coords.iter().cloned().find(|c| !c.is_finite()).unwrap_or(f64::NAN),
            });
        }

        let trial_total = match self.evaluate(&indices, &candidate) {
            Ok(total) => total,
            Err(e) => {
                self.discard_trial();
                return Err(e);
            }
        };

        let accepted = self.accept_trial(trial_total - *committed_total);
        let state = &mut self.state;
        if accepted {
            state.configuration.commit_positions(&indices, &candidate);
            for c in state.constraints.iter_mut().filter(|c| c.is_used()) {
                c.accept_move();
            }
            state.counters.accepted += 1;
            *committed_total = self.total_standard_error();
        } else {
            self.discard_trial();
            self.state.counters.rejected += 1;
        }
        self.state.counters.step += 1;
        Ok(accepted)
    }

    /// Weighted scratch total of all used constraints, evaluated in parallel.
    fn evaluate(&mut self, indices: &[usize], candidate: &[Point3<f64>]) -> Result<f64> {
        let state = &mut self.state;
        let bc = match state.boundary.as_ref() {
            Some(bc) => bc,
            None => return Ok(0.0), // prepare() guarantees no used constraint here
        };
        let configuration = &state.configuration;
        let trial = TrialPositions::new(configuration, indices, candidate);

        let errors = state
            .constraints
            .par_iter_mut()
            .filter(|c| c.is_used())
            .map(|c| -> Result<f64> {
                c.compute_before_move(configuration, bc, indices)?;
                let e = c.compute_after_move(&trial, bc)?;
                Ok(c.weight() * e)
            })
            .collect::<Result<Vec<f64>>>()?;
        Ok(errors.iter().sum())
    }

    fn discard_trial(&mut self) {
        for c in self.state.constraints.iter_mut().filter(|c| c.is_used()) {
            c.reject_move();
        }
    }

    fn accept_trial(&mut self, delta: f64) -> bool {
        let probability = acceptance_probability(delta, self.state.settings.temperature);
        if probability >= 1.0 {
            return true;
        }
        if probability <= 0.0 {
            return false;
        }
        self.state.rng.gen::<f64>() < probability
    }

    fn report(&self, start: Instant) {
        let elapsed = start.elapsed().as_secs_f64();
        let counters = &self.state.counters;
        let stats = StepStats {
            step: counters.step,
            generated: counters.generated,
            accepted: counters.accepted,
            rejected: counters.rejected,
            total_error: self.total_standard_error(),
            constraint_errors: self
                .state
                .constraints
                .iter()
                .filter(|c| c.is_used())
                .map(|c| (c.name().to_string(), c.weight() * c.standard_error()))
                .collect(),
            rate: if elapsed > 0.0 { counters.step as f64 / elapsed } else { 0.0 },
        };
        self.emit(SolverEvent::StepUpdate(stats));
    }

    // --- Persistence ---

    fn checkpoint(&mut self, path: &Path) -> Result<()> {
        let previous = self.phase;
        self.phase = Phase::Checkpointing;
        let written = checkpoint::write_checkpoint(path, &self.state);
        self.phase = previous;
        written?;
        info!("Checkpoint at step {} -> {}", self.state.counters.step, path.display());
        self.emit(SolverEvent::Checkpointed {
            step: self.state.counters.step,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Writes the full engine state to `path`.
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.checkpoint(path.as_ref())
    }

    /// Restores an engine from a checkpoint written by [`Engine::save`] or `run`.
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, CheckpointInfo)> {
        let (state, info) = checkpoint::read_checkpoint(path.as_ref())?;
        let n = state.configuration.len();
        for g in &state.groups {
            g.validate(n)
                .map_err(|e| RmcError::Checkpoint(format!("invalid group in checkpoint: {}", e)))?;
        }
        state
            .selector
            .validate(state.groups.len())
            .map_err(|e| RmcError::Checkpoint(format!("invalid selector in checkpoint: {}", e)))?;
        for c in &state.constraints {
            c.validate(&state.configuration)
                .map_err(|e| RmcError::Checkpoint(format!("invalid {} in checkpoint: {}", c.name(), e)))?;
        }
        Ok((
            Self {
                state,
                phase: Phase::Idle,
                stop: StopHandle::default(),
                converged: ConvergenceHandle::default(),
                events: None,
            },
            info,
        ))
    }
}
