use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use log::{info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::filter::LevelFilter;

use rmc_refine::constraints::{TermDefinition, ViolationMode};
use rmc_refine::core::domain::{EngineSettings, Species};
use rmc_refine::engine::generators::MoveGenerator;
use rmc_refine::interface::definition::{
    AtomRecord, ConstraintKind, ConstraintSpec, Grouping, SystemDefinition,
};
use rmc_refine::interface::report::Telemetry;
use rmc_refine::solvers::rmc::{Engine, RunOptions};
use rmc_refine::solvers::SolverEvent;

// --- CLI Definitions ---

#[derive(Parser, Debug)]
#[command(author, version, about = "Reverse Monte Carlo structural refinement", long_about = None)]
struct Args {
    /// JSON system definition; a demo system of diatomic molecules is used when absent
    #[arg(short, long)]
    definition: Option<PathBuf>,

    /// Resume from a checkpoint instead of building a new system
    #[arg(short, long, conflicts_with = "definition")]
    resume: Option<PathBuf>,

    /// Number of trial moves
    #[arg(short = 'n', long, default_value_t = 100_000)]
    steps: usize,

    /// Checkpoint every N steps (0: only at the end)
    #[arg(long, default_value_t = 0)]
    save_frequency: usize,

    /// Checkpoint file
    #[arg(long, default_value = "rmc_checkpoint.json")]
    save_path: PathBuf,

    /// Overrides the seed of a new system
    #[arg(long)]
    seed: Option<u64>,

    /// Stop cooperatively after this many seconds
    #[arg(long)]
    max_seconds: Option<f64>,

    /// Verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Molecules in the demo system
    #[arg(short, long, default_value_t = 64)]
    molecules: usize,

    /// Cubic box edge of the demo system (Angstroms)
    #[arg(short, long, default_value_t = 16.0)]
    box_size: f64,
}

// --- Initialization Helpers ---

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

/// Randomly placed and oriented CO molecules in a cubic box, bonded at
/// 1.13 Å and kept at least 2.8 Å apart.
fn create_demo_system(args: &Args) -> SystemDefinition {
    let carbon = Species::new("C", 6, 12.011, 6.646);
    let oxygen = Species::new("O", 8, 15.999, 5.803);

    let seed = args.seed.unwrap_or(42);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let edge = args.box_size;
    let mut atoms = Vec::with_capacity(args.molecules * 2);
    for m in 0..args.molecules {
        let c = [
            rng.gen_range(0.0..edge),
            rng.gen_range(0.0..edge),
            rng.gen_range(0.0..edge),
        ];
        // Loose initial bonds give the bond constraint something to fix.
        let len = rng.gen_range(0.9..1.5);
        let (theta, phi): (f64, f64) = (
            rng.gen_range(0.0..std::f64::consts::PI),
            rng.gen_range(0.0..std::f64::consts::TAU),
        );
        let o = [
            c[0] + len * theta.sin() * phi.cos(),
            c[1] + len * theta.sin() * phi.sin(),
            c[2] + len * theta.cos(),
        ];
        for (element, name, position) in [("C", "C", c), ("O", "O", o)] {
            atoms.push(AtomRecord {
                element: element.to_string(),
                name: name.to_string(),
                residue: "CO".to_string(),
                molecule: m,
                position,
            });
        }
    }

    let mut bonds = BTreeMap::new();
    bonds.insert(
        "CO".to_string(),
        vec![TermDefinition::new(&["C", "O"], 1.10, 1.16)],
    );

    SystemDefinition {
        species: vec![carbon, oxygen],
        atoms,
        lattice: Some([edge, 0.0, 0.0, 0.0, edge, 0.0, 0.0, 0.0, edge]),
        settings: EngineSettings {
            seed,
            temperature: 0.01,
            report_frequency: 5_000,
        },
        grouping: Grouping::Atoms,
        generator: Some(MoveGenerator::Translation {
            amplitude: (0.0, 0.2),
        }),
        selector: None,
        constraints: vec![
            ConstraintSpec::new(ConstraintKind::Bond { definitions: bonds }),
            ConstraintSpec::new(ConstraintKind::InterMolecularDistance {
                default_distance: 2.8,
                pairs: Vec::new(),
                mode: ViolationMode::Magnitude,
            }),
        ],
    }
}

fn build_engine(args: &Args) -> Result<Engine> {
    if let Some(path) = &args.resume {
        let (engine, meta) = Engine::load(path)
            .with_context(|| format!("Failed to resume from {}", path.display()))?;
        info!(
            "Resumed engine {} at step {} (checkpoint v{}, saved {})",
            engine.id(),
            engine.counters().step,
            meta.format_version,
            meta.saved_at
        );
        if args.seed.is_some() {
            warn!("--seed is ignored when resuming; the checkpointed RNG state is used");
        }
        return Ok(engine);
    }

    let mut system = match &args.definition {
        Some(path) => SystemDefinition::from_file(path)
            .with_context(|| format!("Failed to read system definition {}", path.display()))?,
        None => {
            if !(args.box_size > 0.0) || args.molecules == 0 {
                return Err(anyhow!(
                    "demo system needs a positive box size and at least one molecule"
                ));
            }
            create_demo_system(args)
        }
    };
    if let Some(seed) = args.seed {
        system.settings.seed = seed;
    }
    system
        .build_engine()
        .context("Failed to assemble the RMC engine")
}

// --- Main ---

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut engine = build_engine(&args)?;
    let (tx, rx) = unbounded();
    engine.set_event_sender(tx);
    let stop = engine.stop_handle();

    let options = RunOptions::new(args.steps).save_every(args.save_frequency, &args.save_path);

    let worker = thread::Builder::new()
        .name("Solver-Worker".to_string())
        .spawn(move || -> Result<()> {
            engine.run(&options)?;
            for drift in engine.verify_constraints()? {
                info!(
                    "{}: incremental {:.6e}, recomputed {:.6e}",
                    drift.name, drift.incremental, drift.full
                );
            }
            Ok(())
        })
        .context("Failed to spawn solver thread")?;

    // Event loop: echo progress until the worker hangs up.
    let started = Instant::now();
    let deadline = args
        .max_seconds
        .filter(|s| s.is_finite())
        .map(|s| Duration::from_secs_f64(s.max(0.0)));
    let mut telemetry = Telemetry::new();
    let mut stop_sent = false;

    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                if let SolverEvent::StepUpdate(stats) = &event {
                    info!(
                        "step {:>9} | error {:>12.6} | accepted {:>5.1}% | {:>8.0} steps/s",
                        stats.step,
                        stats.total_error,
                        stats.acceptance_ratio() * 100.0,
                        stats.rate
                    );
                }
                telemetry.handle_event(event);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }

        if let Some(limit) = deadline {
            if !stop_sent && started.elapsed() >= limit {
                info!("Time limit reached; asking the solver to stop");
                stop.request_stop();
                stop_sent = true;
            }
        }
    }

    worker
        .join()
        .map_err(|_| anyhow!("Solver thread panicked"))??;

    if let Some(summary) = &telemetry.summary {
        info!(
            "Done: {} steps, {} accepted, {} rejected, final error {:.6}{}",
            summary.steps,
            summary.accepted,
            summary.rejected,
            summary.total_error,
            if summary.stopped { " (stopped early)" } else { "" }
        );
    }
    if let Some(trend) = telemetry.error_trend() {
        info!("Error changed by {:+.1}% over the reported window", trend * 100.0);
    }
    if let Some((step, path)) = &telemetry.last_checkpoint {
        info!("Last checkpoint: step {} -> {}", step, path.display());
    }
    Ok(())
}
