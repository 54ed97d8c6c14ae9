use std::collections::VecDeque;
use std::path::PathBuf;

use crate::solvers::rmc::RunSummary;
use crate::solvers::{SolverEvent, StepStats};

// --- Constants ---
const HISTORY_CAPACITY: usize = 1000;
const LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Running,
    Finished,
}

/// Rolling history of a run, fed by `SolverEvent`s.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub error_history: VecDeque<(f64, f64)>,      // (step, total error)
    pub acceptance_history: VecDeque<(f64, f64)>, // (step, acceptance %)
    pub best_error: f64,
    pub latest: Option<StepStats>,
    pub last_checkpoint: Option<(u64, PathBuf)>,
    pub summary: Option<RunSummary>,
    pub logs: VecDeque<String>,
    pub status: WorkerStatus,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            error_history: VecDeque::with_capacity(HISTORY_CAPACITY),
            acceptance_history: VecDeque::with_capacity(HISTORY_CAPACITY),
            best_error: f64::MAX,
            latest: None,
            last_checkpoint: None,
            summary: None,
            logs: VecDeque::with_capacity(LOG_CAPACITY),
            status: WorkerStatus::Idle,
        }
    }

    pub fn ingest(&mut self, stats: &StepStats) {
        if self.error_history.len() >= HISTORY_CAPACITY {
            self.error_history.pop_front();
            self.acceptance_history.pop_front();
        }
        if stats.total_error < self.best_error {
            self.best_error = stats.total_error;
        }

        let x = stats.step as f64;
        self.error_history.push_back((x, stats.total_error));
        self.acceptance_history
            .push_back((x, stats.acceptance_ratio() * 100.0));
        self.latest = Some(stats.clone());
    }

    pub fn handle_event(&mut self, event: SolverEvent) {
        match event {
            SolverEvent::Log(msg) => self.log(msg),

            SolverEvent::StepUpdate(stats) => {
                self.status = WorkerStatus::Running;
                self.ingest(&stats);
            }

            SolverEvent::Checkpointed { step, path } => {
                self.log(format!("Checkpoint at step {}: {}", step, path.display()));
                self.last_checkpoint = Some((step, path));
            }

            SolverEvent::Finished(summary) => {
                self.status = WorkerStatus::Finished;
                self.log(format!(
                    "Run finished after {} steps ({} accepted)",
                    summary.steps, summary.accepted
                ));
                self.summary = Some(summary);
            }
        }
    }

    /// Relative change of the total error over the recorded history.
    pub fn error_trend(&self) -> Option<f64> {
        let (_, first) = *self.error_history.front()?;
        let (_, last) = *self.error_history.back()?;
        if first.abs() < 1e-12 {
            return None;
        }
        Some((last - first) / first)
    }

    fn log(&mut self, msg: impl Into<String>) {
        if self.logs.len() >= LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(msg.into());
    }
}
