use std::fs;
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use nalgebra::Point3;

use rmc_refine::constraints::{
    BondConstraint, DefinitionTable, InterMolecularDistanceConstraint, PairDistributionConstraint,
    TermDefinition, ViolationMode,
};
use rmc_refine::core::chemistry::Weighting;
use rmc_refine::core::domain::{Atom, Configuration, EngineSettings};
use rmc_refine::engine::checkpoint::CHECKPOINT_VERSION;
use rmc_refine::engine::constraint::Constraint;
use rmc_refine::engine::generators::MoveGenerator;
use rmc_refine::engine::selectors::GroupSelector;
use rmc_refine::solvers::rmc::{acceptance_probability, ConstraintId, Engine, Phase, RunOptions};
use rmc_refine::solvers::SolverEvent;
use rmc_refine::RmcError;

use crate::common::{cubic_box, dimer_configuration, flat_pdf, random_configuration, two_species};

mod common;

fn settings(seed: u64, temperature: f64) -> EngineSettings {
    EngineSettings {
        seed,
        temperature,
        report_frequency: 0,
    }
}

/// 30 random atoms fitted to a flat g(r) and kept 1.2 Å apart.
fn pdf_engine(seed: u64, temperature: f64) -> Engine {
    let mut engine = Engine::new(random_configuration(30, 3), settings(seed, temperature)).unwrap();
    engine.set_boundary_conditions(cubic_box());
    engine
        .set_all_group_generators(&MoveGenerator::translation(0.0, 0.5).unwrap())
        .unwrap();
    engine
        .add_constraint(PairDistributionConstraint::new(&flat_pdf(), Weighting::AtomicNumber).unwrap())
        .unwrap();
    engine
        .add_constraint(InterMolecularDistanceConstraint::new(1.2, ViolationMode::Magnitude).unwrap())
        .unwrap();
    engine.initialize_used_constraints().unwrap();
    engine
}

fn positions(engine: &Engine) -> Vec<Point3<f64>> {
    engine.configuration().atoms().iter().map(|a| a.position).collect()
}

fn assert_no_drift(engine: &Engine) {
    for drift in engine.verify_constraints().unwrap() {
        assert!(
            drift.abs_diff() <= 1e-9 * drift.full.abs().max(1.0),
            "{} drifted: {} vs {}",
            drift.name,
            drift.incremental,
            drift.full
        );
    }
}

#[test]
fn test_acceptance_probability_is_monotonic() {
    assert_eq!(acceptance_probability(-3.0, 0.0), 1.0);
    assert_eq!(acceptance_probability(-1e-12, 5.0), 1.0);
    assert_eq!(acceptance_probability(0.0, 0.0), 1.0);
    assert_eq!(acceptance_probability(0.1, 0.0), 0.0);
    assert_eq!(acceptance_probability(0.1, -1.0), 0.0);

    let mut last = 1.0;
    for k in 1..50 {
        let p = acceptance_probability(k as f64 * 0.1, 1.0);
        assert!(p < last && p > 0.0);
        last = p;
    }
    assert!((acceptance_probability(1.0, 1.0) - (-1.0f64).exp()).abs() < 1e-15);
}

#[test]
fn test_zero_amplitude_moves_always_accepted() {
    let mut engine = pdf_engine(1, 0.0);
    engine
        .set_all_group_generators(&MoveGenerator::translation(0.0, 0.0).unwrap())
        .unwrap();
    let before = engine.total_standard_error();
    let start = positions(&engine);

    let summary = engine.run(&RunOptions::new(200)).unwrap();
    assert_eq!(summary.steps, 200);
    assert_eq!(summary.accepted, 200);
    assert_eq!(summary.rejected, 0);
    assert_eq!(engine.total_standard_error(), before);
    assert_eq!(positions(&engine), start);
}

#[test]
fn test_quench_never_increases_error() {
    let mut engine = pdf_engine(2, 0.0);
    let mut last = engine.total_standard_error();
    let mut accepted = 0;
    for _ in 0..300 {
        let summary = engine.run(&RunOptions::new(1)).unwrap();
        accepted += summary.accepted;
        assert!(summary.total_error <= last);
        last = summary.total_error;
    }
    assert!(accepted > 0);
    assert_eq!(engine.counters().step, 300);
    assert_no_drift(&engine);
}

#[test]
fn test_incremental_error_tracks_full_recompute() {
    let mut engine = pdf_engine(3, 0.05);
    for _ in 0..5 {
        engine.run(&RunOptions::new(100)).unwrap();
        assert_no_drift(&engine);
    }
    let c = engine.counters();
    assert_eq!(c.accepted + c.rejected, 500);
    assert_eq!(c.generated, 500);
}

#[test]
fn test_bond_refinement_pulls_dimers_into_range() {
    let mut engine = Engine::new(dimer_configuration(8, 2.5), settings(4, 0.0)).unwrap();
    engine.set_boundary_conditions(cubic_box());
    let mut table = DefinitionTable::new();
    table.insert("AB".to_string(), vec![TermDefinition::new(&["A", "B"], 1.0, 1.2)]);
    let bonds = BondConstraint::from_definitions(engine.configuration(), table).unwrap();
    let id = engine.add_constraint(bonds).unwrap();
    engine.initialize_used_constraints().unwrap();

    let initial = engine.total_standard_error();
    assert!((initial - 8.0 * 1.3f64.powi(2)).abs() < 1e-9);

    engine.run(&RunOptions::new(3000)).unwrap();
    assert!(engine.total_standard_error() < 0.1 * initial);
    assert_no_drift(&engine);

    let lengths = engine.constraint(id).unwrap().as_bond().unwrap().bond_lengths();
    assert_eq!(lengths.len(), 8);
}

#[test]
fn test_weights_scale_total_error() {
    let mut engine = pdf_engine(5, 0.0);
    let c0 = engine.constraint(ConstraintId(0)).unwrap().standard_error();
    let c1 = engine.constraint(ConstraintId(1)).unwrap().standard_error();
    engine.set_constraint_weight(ConstraintId(1), 3.0).unwrap();
    assert!((engine.total_standard_error() - (c0 + 3.0 * c1)).abs() <= 1e-12 * (c0 + c1).max(1.0));

    engine.set_constraint_used(ConstraintId(0), false).unwrap();
    assert!((engine.total_standard_error() - 3.0 * c1).abs() <= 1e-12 * c1.max(1.0));
    assert!(engine.set_constraint_weight(ConstraintId(9), 1.0).is_err());
}

#[test]
fn test_reenabled_constraint_is_reinitialized() {
    let mut engine = pdf_engine(6, 0.5);
    engine.set_constraint_used(ConstraintId(0), false).unwrap();
    engine.run(&RunOptions::new(100)).unwrap();
    assert!(!engine.constraints()[0].is_initialized());

    engine.set_constraint_used(ConstraintId(0), true).unwrap();
    engine.run(&RunOptions::new(10)).unwrap();
    assert!(engine.constraints()[0].is_initialized());
    assert_no_drift(&engine);
}

#[test]
fn test_molecule_groups_move_rigidly() {
    let mut engine = Engine::new(dimer_configuration(8, 1.1), settings(7, 1.0)).unwrap();
    engine.set_boundary_conditions(cubic_box());
    engine.reset_groups_as_molecules().unwrap();
    assert_eq!(engine.groups().len(), 8);
    engine
        .set_all_group_generators(
            &MoveGenerator::collector(
                vec![
                    MoveGenerator::translation(0.1, 0.3).unwrap(),
                    MoveGenerator::rotation(30.0).unwrap(),
                    MoveGenerator::rotation_about_axis(2, 30.0).unwrap(),
                ],
                true,
            )
            .unwrap(),
        )
        .unwrap();
    engine.set_group_selector(GroupSelector::defined_order(vec![])).unwrap();
    engine.run(&RunOptions::new(400)).unwrap();

    let bc = cubic_box();
    let atoms = engine.configuration().atoms();
    for m in 0..8 {
        let d = bc.minimum_image_distance(&atoms[2 * m].position, &atoms[2 * m + 1].position);
        assert!((d - 1.1).abs() < 1e-9, "molecule {} bond {}", m, d);
    }
}

#[test]
fn test_selector_must_fit_groups() {
    let mut engine = pdf_engine(8, 0.0);
    assert!(engine.set_group_selector(GroupSelector::weighted(vec![1.0; 3]).unwrap()).is_err());
    engine.set_group_selector(GroupSelector::weighted(vec![1.0; 30]).unwrap()).unwrap();

    // Regrouping leaves 30 single-atom molecules, so the weights still fit.
    engine.reset_groups_as_molecules().unwrap();
    assert_eq!(engine.selector().name(), "Weighted");

    for g in 0..30 {
        engine.set_group_enabled(g, false).unwrap();
    }
    assert!(matches!(
        engine.run(&RunOptions::new(5)),
        Err(RmcError::SelectionExhausted(_))
    ));
    assert_eq!(engine.phase(), Phase::Idle);
}

#[test]
fn test_regroup_rejects_selector_that_no_longer_fits() {
    let mut engine = Engine::new(dimer_configuration(4, 1.1), settings(14, 0.0)).unwrap();
    assert_eq!(engine.groups().len(), 8);
    engine.set_group_selector(GroupSelector::weighted(vec![1.0; 8]).unwrap()).unwrap();

    // Four molecules would leave eight weights for four groups.
    assert!(matches!(
        engine.reset_groups_as_molecules(),
        Err(RmcError::Configuration(_))
    ));
    assert_eq!(engine.groups().len(), 8);
    assert_eq!(engine.selector().name(), "Weighted");

    engine.set_group_selector(GroupSelector::Random).unwrap();
    engine.reset_groups_as_molecules().unwrap();
    assert_eq!(engine.groups().len(), 4);
}

#[test]
fn test_missing_boundary_fails_before_first_step() {
    let config = dimer_configuration(2, 1.5);
    let mut engine = Engine::new(config, settings(9, 0.0)).unwrap();
    engine
        .add_constraint(InterMolecularDistanceConstraint::default())
        .unwrap();
    assert!(matches!(
        engine.run(&RunOptions::new(10)),
        Err(RmcError::Configuration(_))
    ));
    assert_eq!(engine.counters().step, 0);

    // Without used constraints every move is accepted.
    engine.set_constraint_used(ConstraintId(0), false).unwrap();
    let summary = engine.run(&RunOptions::new(10)).unwrap();
    assert_eq!(summary.accepted, 10);
}

#[test]
fn test_checkpoint_resume_is_identical() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut original = pdf_engine(10, 0.05);
    original.run(&RunOptions::new(150)).unwrap();
    original.save(&path).unwrap();

    let (mut resumed, info) = Engine::load(&path).unwrap();
    assert_eq!(info.format_version, CHECKPOINT_VERSION);
    assert_eq!(resumed.id(), original.id());
    assert_eq!(resumed.counters(), original.counters());
    assert_eq!(positions(&resumed), positions(&original));

    let a = original.run(&RunOptions::new(300)).unwrap();
    let b = resumed.run(&RunOptions::new(300)).unwrap();
    assert_eq!(a, b);
    assert_eq!(positions(&resumed), positions(&original));
    assert_eq!(resumed.counters(), original.counters());
}

#[test]
fn test_checkpoint_version_mismatch_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.json");
    std::fs::write(&path, r#"{"format_version": 99, "saved_at": "later", "state": {}}"#).unwrap();
    assert!(matches!(Engine::load(&path), Err(RmcError::Checkpoint(_))));

    std::fs::write(&path, "not a checkpoint").unwrap();
    assert!(matches!(Engine::load(&path), Err(RmcError::Checkpoint(_))));

    let current = format!(r#"{{"format_version": {}, "state": 5}}"#, CHECKPOINT_VERSION);
    std::fs::write(&path, current).unwrap();
    assert!(matches!(Engine::load(&path), Err(RmcError::Checkpoint(_))));
}

#[test]
fn test_periodic_checkpoints_and_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run").join("ckpt.json");

    let mut engine = Engine::new(
        random_configuration(30, 3),
        EngineSettings {
            seed: 11,
            temperature: 0.1,
            report_frequency: 10,
        },
    )
    .unwrap();
    engine.set_boundary_conditions(cubic_box());
    engine
        .add_constraint(InterMolecularDistanceConstraint::new(1.2, ViolationMode::Count).unwrap())
        .unwrap();

    let (tx, rx) = unbounded();
    engine.set_event_sender(tx);
    let summary = engine
        .run(&RunOptions::new(50).save_every(20, &path))
        .unwrap();
    assert_eq!(summary.steps, 50);
    assert!(path.exists());

    let events: Vec<SolverEvent> = rx.try_iter().collect();
    let updates = events.iter().filter(|e| matches!(e, SolverEvent::StepUpdate(_))).count();
    let checkpoints: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            SolverEvent::Checkpointed { step, .. } => Some(*step),
            _ => None,
        })
        .collect();
    assert_eq!(updates, 5);
    assert_eq!(checkpoints, vec![20, 40, 50]);
    assert!(matches!(events.last(), Some(SolverEvent::Finished(_))));

    let (resumed, _) = Engine::load(&path).unwrap();
    assert_eq!(resumed.counters().step, 50);
}

#[test]
fn test_stop_request_ends_run_with_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stopped.json");

    let mut engine = Engine::new(random_configuration(10, 12), settings(12, 0.0)).unwrap();
    engine.set_boundary_conditions(cubic_box());
    let stop = engine.stop_handle();

    let options = RunOptions::new(usize::MAX).save_every(0, &path);
    let worker = thread::spawn(move || {
        let summary = engine.run(&options).unwrap();
        (summary, engine)
    });
    thread::sleep(Duration::from_millis(100));
    stop.request_stop();
    let (summary, mut engine) = worker.join().unwrap();

    assert!(summary.stopped);
    assert!(summary.steps > 0);
    let (saved, _) = Engine::load(&path).unwrap();
    assert_eq!(saved.counters().step, summary.steps as u64);

    // The request is consumed; the next run goes the full distance.
    assert!(!stop.is_stop_requested());
    let next = engine.run(&RunOptions::new(5)).unwrap();
    assert!(!next.stopped);
    assert_eq!(next.steps, 5);
}

#[test]
fn test_failed_checkpoint_leaves_engine_idle() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, b"not a directory").unwrap();
    let path = blocker.join("ckpt.json");

    let mut engine = Engine::new(random_configuration(10, 15), settings(15, 0.0)).unwrap();
    engine.set_boundary_conditions(cubic_box());
    let (tx, rx) = unbounded();
    engine.set_event_sender(tx);

    let result = engine.run(&RunOptions::new(10).save_every(5, &path));
    assert!(matches!(result, Err(RmcError::Io(_))));
    assert_eq!(engine.phase(), Phase::Idle);
    assert_eq!(engine.counters().step, 5);

    let events: Vec<SolverEvent> = rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(e, SolverEvent::Log(_))));
    assert!(!events.iter().any(|e| matches!(e, SolverEvent::Finished(_))));

    // The engine stays usable once the path is fixed.
    let good = dir.path().join("ckpt.json");
    let summary = engine.run(&RunOptions::new(5).save_every(5, &good)).unwrap();
    assert_eq!(summary.steps, 5);
    let (saved, _) = Engine::load(&good).unwrap();
    assert_eq!(saved.counters().step, 10);
}

#[test]
fn test_numeric_failure_aborts_and_keeps_last_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("last_good.json");

    let atoms = vec![Atom::new(0, Point3::new(1.0, 1.0, 1.0), 0)];
    let config = Configuration::new(two_species(), atoms).unwrap();
    let mut engine = Engine::new(config, settings(16, 0.0)).unwrap();
    // Every accepted jump adds f64::MAX along a random direction, so a
    // coordinate soon overflows to infinity.
    engine
        .set_all_group_generators(&MoveGenerator::translation(f64::MAX, f64::MAX).unwrap())
        .unwrap();
    engine.run(&RunOptions::new(1).save_every(1, &path)).unwrap();
    let (tx, rx) = unbounded();
    engine.set_event_sender(tx);

    let result = engine.run(&RunOptions::new(10_000).save_every(1_000_000, &path));
    assert!(matches!(result, Err(RmcError::NumericInstability { .. })));
    assert_eq!(engine.phase(), Phase::Idle);
    assert!(positions(&engine)
        .iter()
        .all(|p| p.coords.iter().all(|c| c.is_finite())));

    let events: Vec<SolverEvent> = rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(e, SolverEvent::Log(_))));
    assert!(!events.iter().any(|e| matches!(e, SolverEvent::Checkpointed { .. })));
    assert!(!events.iter().any(|e| matches!(e, SolverEvent::Finished(_))));

    let (saved, _) = Engine::load(&path).unwrap();
    assert_eq!(saved.counters().step, 1);
    assert!(saved.configuration().position(0).coords.iter().all(|c| c.is_finite()));
}

#[test]
fn test_convergence_handle_ends_recursive_streak() {
    let mut engine = Engine::new(random_configuration(5, 17), settings(17, 0.0)).unwrap();
    engine
        .set_group_selector(
            GroupSelector::recursive(GroupSelector::defined_order(vec![]), usize::MAX).unwrap(),
        )
        .unwrap();
    let start = positions(&engine);

    engine.run(&RunOptions::new(3)).unwrap();
    let after_streak = positions(&engine);
    assert_ne!(after_streak[0], start[0]);
    assert_eq!(&after_streak[1..], &start[1..]);

    // Signalled from another thread while the run holds the engine.
    let handle = engine.convergence_handle();
    let stop = engine.stop_handle();
    let worker = thread::spawn(move || {
        engine.run(&RunOptions::new(usize::MAX)).unwrap();
        engine
    });
    thread::sleep(Duration::from_millis(50));
    handle.signal();
    thread::sleep(Duration::from_millis(50));
    stop.request_stop();
    let engine = worker.join().unwrap();

    assert!(!handle.is_signaled());
    let after_signal = positions(&engine);
    assert_ne!(after_signal[1], after_streak[1]);
    assert_eq!(&after_signal[2..], &start[2..]);
}

#[test]
fn test_configuration_rejects_bad_group_resets() {
    let atoms = vec![
        Atom::new(0, Point3::new(1.0, 1.0, 1.0), 0),
        Atom::new(1, Point3::new(2.0, 1.0, 1.0), 0),
    ];
    let config = Configuration::new(two_species(), atoms).unwrap();
    let mut engine = Engine::new(config, settings(13, 0.0)).unwrap();
    assert!(engine.set_group_generator(0, MoveGenerator::rotation(10.0).unwrap()).is_err());
    engine.reset_groups_as_molecules().unwrap();
    assert!(engine.set_group_generator(0, MoveGenerator::rotation(10.0).unwrap()).is_ok());
    assert!(engine.set_group_generator(5, MoveGenerator::default()).is_err());
    assert!(engine.set_temperature(f64::NAN).is_err());
}
