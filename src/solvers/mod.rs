use std::path::PathBuf;

use crate::solvers::rmc::RunSummary;

pub mod rmc;

/// Snapshot of run progress, emitted every `report_frequency` steps.
#[derive(Debug, Clone, PartialEq)]
pub struct StepStats {
    pub step: u64,
    pub generated: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub total_error: f64,
    /// (constraint name, weighted committed error) for every used constraint.
    pub constraint_errors: Vec<(String, f64)>,
    /// Steps per second since the run started.
    pub rate: f64,
}

impl StepStats {
    pub fn acceptance_ratio(&self) -> f64 {
        if self.generated == 0 {
            0.0
        } else {
            self.accepted as f64 / self.generated as f64
        }
    }
}

/// Events emitted by the engine to an observer thread.
#[derive(Debug, Clone)]
pub enum SolverEvent {
    /// Diagnostic log message.
    Log(String),

    /// Periodic progress report.
    StepUpdate(StepStats),

    /// A checkpoint was written after `step`.
    Checkpointed { step: u64, path: PathBuf },

    /// The run returned (normally or after a stop request).
    Finished(RunSummary),
}
