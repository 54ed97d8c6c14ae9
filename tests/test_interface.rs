use std::path::PathBuf;

use rmc_refine::engine::constraint::Constraint;
use rmc_refine::interface::definition::{ConstraintKind, Grouping, SystemDefinition};
use rmc_refine::interface::report::{Telemetry, WorkerStatus};
use rmc_refine::solvers::rmc::{RunOptions, RunSummary};
use rmc_refine::solvers::{SolverEvent, StepStats};
use rmc_refine::RmcError;

const WATER_PAIR: &str = r#"{
    "species": [
        {"symbol": "O", "atomic_number": 8, "mass": 15.999, "scattering_length": 5.803},
        {"symbol": "H", "atomic_number": 1, "mass": 1.008, "scattering_length": -3.739}
    ],
    "atoms": [
        {"element": "O", "name": "OW", "residue": "HOH", "molecule": 0, "position": [1.0, 1.0, 1.0]},
        {"element": "H", "name": "HW1", "residue": "HOH", "molecule": 0, "position": [1.96, 1.0, 1.0]},
        {"element": "H", "name": "HW2", "residue": "HOH", "molecule": 0, "position": [0.76, 1.93, 1.0]},
        {"element": "O", "name": "OW", "residue": "HOH", "molecule": 1, "position": [4.0, 4.0, 4.0]},
        {"element": "H", "name": "HW1", "residue": "HOH", "molecule": 1, "position": [4.96, 4.0, 4.0]},
        {"element": "H", "name": "HW2", "residue": "HOH", "molecule": 1, "position": [3.76, 4.93, 4.0]}
    ],
    "lattice": [8.0, 0.0, 0.0, 0.0, 8.0, 0.0, 0.0, 0.0, 8.0],
    "settings": {"seed": 3, "temperature": 0.02},
    "grouping": "molecules",
    "generator": {"kind": "Collector", "randomize": true, "collection": [
        {"kind": "Translation", "amplitude": [0.0, 0.3]},
        {"kind": "Rotation", "amplitude": 20.0}
    ]},
    "selector": {"kind": "DefinedOrder", "order": [1, 0]},
    "constraints": [
        {"kind": "Bond", "definitions": {"HOH": [
            {"atoms": ["OW", "HW1"], "lower": 0.9, "upper": 1.0},
            {"atoms": ["OW", "HW2"], "lower": 0.9, "upper": 1.0}
        ]}, "used": false},
        {"kind": "BondsAngle", "definitions": {"HOH": [
            {"atoms": ["OW", "HW1", "HW2"], "lower": 100.0, "upper": 110.0}
        ]}, "used": false},
        {"kind": "InterMolecularDistance", "default_distance": 2.0, "mode": "Count", "weight": 2.0}
    ]
}"#;

#[test]
fn test_definition_builds_engine() {
    let system = SystemDefinition::from_json_str(WATER_PAIR).unwrap();
    assert_eq!(system.grouping, Grouping::Molecules);
    assert_eq!(system.settings.report_frequency, 1000);
    assert!(matches!(
        system.constraints[2].kind,
        ConstraintKind::InterMolecularDistance { .. }
    ));

    let mut engine = system.build_engine().unwrap();
    assert_eq!(engine.configuration().len(), 6);
    assert_eq!(engine.groups().len(), 2);
    assert_eq!(engine.groups()[1].indices(), &[3, 4, 5]);
    assert_eq!(engine.selector().name(), "DefinedOrder");

    let cs = engine.constraints();
    assert_eq!(cs.len(), 3);
    assert!(!cs[0].is_used() && !cs[1].is_used() && cs[2].is_used());
    assert_eq!(cs[2].weight(), 2.0);
    assert!(cs[2].is_initialized());
    assert_eq!(cs[0].as_bond().unwrap().bonds().len(), 4);

    let summary = engine.run(&RunOptions::new(100)).unwrap();
    assert_eq!(summary.steps, 100);
}

#[test]
fn test_definition_round_trips_through_json() {
    let system = SystemDefinition::from_json_str(WATER_PAIR).unwrap();
    let text = system.to_json_string().unwrap();
    assert_eq!(SystemDefinition::from_json_str(&text).unwrap(), system);
}

#[test]
fn test_definition_errors_surface_at_build() {
    let unknown_element = WATER_PAIR.replacen(r#""element": "H""#, r#""element": "Xe""#, 1);
    let system = SystemDefinition::from_json_str(&unknown_element).unwrap();
    assert!(matches!(system.build_engine(), Err(RmcError::Definition(_))));

    let bad_atom_name = WATER_PAIR.replace(r#"["OW", "HW2"]"#, r#"["OW", "HW9"]"#);
    let system = SystemDefinition::from_json_str(&bad_atom_name).unwrap();
    assert!(matches!(system.build_engine(), Err(RmcError::Definition(_))));

    let degenerate = WATER_PAIR.replace(
        "[8.0, 0.0, 0.0, 0.0, 8.0, 0.0, 0.0, 0.0, 8.0]",
        "[8.0, 0.0, 0.0, 16.0, 0.0, 0.0, 0.0, 0.0, 8.0]",
    );
    let system = SystemDefinition::from_json_str(&degenerate).unwrap();
    assert!(matches!(system.build_engine(), Err(RmcError::Configuration(_))));

    let bad_order = WATER_PAIR.replace(r#""order": [1, 0]"#, r#""order": [1, 2]"#);
    let system = SystemDefinition::from_json_str(&bad_order).unwrap();
    assert!(matches!(system.build_engine(), Err(RmcError::Configuration(_))));

    let no_lattice = WATER_PAIR.replace(
        r#""lattice": [8.0, 0.0, 0.0, 0.0, 8.0, 0.0, 0.0, 0.0, 8.0],"#,
        "",
    );
    let system = SystemDefinition::from_json_str(&no_lattice).unwrap();
    assert!(system.lattice.is_none());
    assert!(matches!(system.build_engine(), Err(RmcError::Configuration(_))));

    assert!(matches!(
        SystemDefinition::from_json_str("{\"species\": []"),
        Err(RmcError::Serialization(_))
    ));
}

fn stats(step: u64, total_error: f64, accepted: u64) -> StepStats {
    StepStats {
        step,
        generated: step,
        accepted,
        rejected: step - accepted,
        total_error,
        constraint_errors: vec![("InterMolecularDistanceConstraint".to_string(), total_error)],
        rate: 100.0,
    }
}

#[test]
fn test_telemetry_tracks_progress() {
    let mut telemetry = Telemetry::new();
    assert_eq!(telemetry.status, WorkerStatus::Idle);
    assert!(telemetry.error_trend().is_none());

    telemetry.handle_event(SolverEvent::StepUpdate(stats(100, 8.0, 50)));
    telemetry.handle_event(SolverEvent::StepUpdate(stats(200, 6.0, 100)));
    telemetry.handle_event(SolverEvent::Checkpointed {
        step: 200,
        path: PathBuf::from("ckpt.json"),
    });
    assert_eq!(telemetry.status, WorkerStatus::Running);
    assert_eq!(telemetry.best_error, 6.0);
    assert_eq!(telemetry.error_history.len(), 2);
    assert_eq!(telemetry.acceptance_history[1], (200.0, 50.0));
    assert_eq!(telemetry.error_trend(), Some(-0.25));
    assert_eq!(telemetry.last_checkpoint, Some((200, PathBuf::from("ckpt.json"))));

    let summary = RunSummary {
        steps: 200,
        accepted: 80,
        rejected: 120,
        stopped: false,
        total_error: 6.0,
    };
    telemetry.handle_event(SolverEvent::Finished(summary.clone()));
    assert_eq!(telemetry.status, WorkerStatus::Finished);
    assert_eq!(telemetry.summary, Some(summary));
    assert_eq!(telemetry.logs.len(), 2);
}
