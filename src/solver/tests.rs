use std::sync::Mutex;

use super::*;
use crate::event::{EventFunctions, EventStatus};
use crate::reaction_state::{RateConstant, Reactant, Reaction, SimulationMode, propensity_fn};
use crate::species_state::{SpeciesState, rate_rule_fn};

fn config(seed: u64) -> SolverConfiguration {
    SolverConfiguration {
        random_seed: seed,
        ..SolverConfiguration::default()
    }
}

fn species(initial: &[(&str, f64)]) -> SpeciesState {
    let mut species = SpeciesState::new();
    for (name, value) in initial {
        species.add_species(*name, *value).unwrap();
    }
    species
}

/// Persistent event `t >= start` with delay 2 that increments species 0 and
/// logs its firing time.
fn delayed_counter_model(log: &Arc<Mutex<Vec<f64>>>, start: f64) -> Model {
    let log = Arc::clone(log);
    let event = EventStatus::new(
        0,
        EventFunctions::new(
            move |t, _, _| t >= start,
            move |t, output| {
                log.lock().unwrap().push(t);
                output.species_out[0] += 1.0;
            },
        )
        .with_constant_delay(2.0),
    )
    .with_persistence(true);
    Model::new(
        species(&[("fired", 0.0)]),
        ReactionState::new(),
        ParameterState::default(),
        vec![event],
    )
    .unwrap()
}

fn birth_model(rate: RateConstant, parameters: Vec<f64>) -> Model {
    let mut reactions = ReactionState::new();
    reactions
        .add(Reaction::mass_action(
            "birth",
            SimulationMode::Discrete,
            rate,
            Vec::new(),
            vec![Reactant::new(0, 1)],
        ))
        .unwrap();
    Model::new(
        species(&[("A", 0.0)]),
        reactions,
        ParameterState::new(parameters),
        Vec::new(),
    )
    .unwrap()
}

#[test]
fn persistent_delay_fires_once_at_seven_for_any_step() {
    for step in [0.5_f64, 0.3, 1.7, 10.0] {
        let log = Arc::new(Mutex::new(Vec::new()));
        let model = delayed_counter_model(&log, 5.0);
        let mut solver = HybridSolver::new(&model, config(1)).unwrap();
        while solver.time() < 10.0 {
            let dt = step.min(10.0 - solver.time());
            solver.integrate_forward(dt).unwrap();
        }
        let fired = log.lock().unwrap().clone();
        assert_eq!(fired.len(), 1, "step {}", step);
        assert!((fired[0] - 7.0).abs() < 1e-6, "step {} fired at {}", step, fired[0]);
        assert_eq!(solver.concentrations(), &[1.0]);
        assert!(!solver.event_state().has_active_events());
    }
}

#[test]
fn delayed_event_fires_on_time_late_in_a_run() {
    for step in [0.5_f64, 3.0] {
        let log = Arc::new(Mutex::new(Vec::new()));
        let model = delayed_counter_model(&log, 20_000.0);
        let mut solver = HybridSolver::new(&model, config(1)).unwrap();
        solver.integrate_to(19_999.0).unwrap();
        while solver.time() < 20_010.0 {
            solver.integrate_forward(step).unwrap();
        }
        let fired = log.lock().unwrap().clone();
        assert_eq!(fired.len(), 1, "step {}", step);
        assert!(
            (fired[0] - 20_002.0).abs() < 1e-6,
            "step {} fired at {}",
            step,
            fired[0]
        );
    }
}

#[test]
fn death_process_runs_to_extinction() {
    for seed in 0..20 {
        let mut reactions = ReactionState::new();
        reactions
            .add(Reaction::mass_action(
                "death",
                SimulationMode::Discrete,
                RateConstant::Value(1.0),
                vec![Reactant::new(0, 1)],
                Vec::new(),
            ))
            .unwrap();
        let model = Model::new(
            species(&[("A", 20.0)]),
            reactions,
            ParameterState::default(),
            Vec::new(),
        )
        .unwrap();
        let mut solver = HybridSolver::new(&model, config(seed)).unwrap();
        solver.integrate_forward(200.0).unwrap();
        assert_eq!(solver.concentrations(), &[0.0], "seed {}", seed);
        assert_eq!(solver.reaction_counts(), &[20], "seed {}", seed);
    }
}

#[test]
fn volatile_event_cancelled_by_continuous_crossing() {
    // X rises through 10 at t = 2 and falls back through it at t = 2.5.
    let mut species = species(&[("X", 2.0), ("Y", 0.0)]);
    species
        .diff_equation_mut(0)
        .unwrap()
        .add_rate_rule(rate_rule_fn(|t, _, _| if t < 2.25 { 4.0 } else { -4.0 }));
    let event = EventStatus::new(
        0,
        EventFunctions::new(
            |_, state, _| state[0] > 10.0,
            |_, output| output.species_out[1] = 1.0,
        )
        .with_constant_delay(1.0),
    );
    let model = Model::new(
        species,
        ReactionState::new(),
        ParameterState::default(),
        vec![event],
    )
    .unwrap();
    let mut solver = HybridSolver::new(&model, config(2)).unwrap();

    solver.integrate_to(2.2).unwrap();
    assert!(solver.event_state().is_active(0));
    assert!(solver.event_state().trigger_state(0).unwrap());

    solver.integrate_to(3.0).unwrap();
    assert_eq!(solver.concentrations()[1], 0.0);
    assert!(!solver.event_state().trigger_state(0).unwrap());
    assert!(!solver.event_state().has_active_events());
    assert_eq!(solver.event_state().executed_count(), 0);
    assert!((solver.concentrations()[0] - 8.0).abs() < 1e-3);
}

#[test]
fn discrete_births_match_their_counts() {
    let model = birth_model(RateConstant::Value(10.0), Vec::new());
    let mut solver = HybridSolver::new(&model, config(42)).unwrap();
    solver.integrate_forward(50.0).unwrap();

    let count = solver.reaction_counts()[0];
    assert_eq!(solver.concentrations()[0], count as f64);
    assert!((400..=600).contains(&count), "count {}", count);
    assert!(solver.offsets()[0] < 0.0);
}

#[test]
fn runs_are_reproducible_per_seed() {
    let model = birth_model(RateConstant::Value(3.0), Vec::new());
    let run = |seed: u64| {
        let mut solver = HybridSolver::new(&model, config(seed)).unwrap();
        solver.integrate_forward(5.0).unwrap();
        solver.reaction_counts().to_vec()
    };
    assert_eq!(run(9), run(9));
}

#[test]
fn event_assignment_to_parameters_stops_births() {
    let event = EventStatus::new(
        0,
        EventFunctions::new(|t, _, _| t >= 1.0, |_, output| output.variable_out[0] = 0.0),
    );
    let mut reactions = ReactionState::new();
    reactions
        .add(Reaction::mass_action(
            "birth",
            SimulationMode::Discrete,
            RateConstant::Parameter(0),
            Vec::new(),
            vec![Reactant::new(0, 1)],
        ))
        .unwrap();
    let model = Model::new(
        species(&[("A", 0.0)]),
        reactions,
        ParameterState::new(vec![20.0]),
        vec![event],
    )
    .unwrap();
    let mut solver = HybridSolver::new(&model, config(5)).unwrap();

    solver.integrate_to(1.5).unwrap();
    assert_eq!(solver.parameters().data(), &[0.0]);
    let after_switch = solver.reaction_counts()[0];
    solver.integrate_to(10.0).unwrap();
    assert_eq!(solver.reaction_counts()[0], after_switch);
}

#[test]
fn checkpoint_restores_pending_executions() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let model = delayed_counter_model(&log, 5.0);
    let mut solver = HybridSolver::new(&model, config(1)).unwrap();

    solver.integrate_to(6.0).unwrap();
    assert_eq!(solver.event_state().pending_count(), 1);
    assert_eq!(solver.save_integrator_state(), 6.0);

    solver.integrate_to(8.0).unwrap();
    assert_eq!(solver.concentrations(), &[1.0]);
    assert_eq!(solver.event_state().pending_count(), 0);

    assert_eq!(solver.restore_integrator_state(), 6.0);
    assert_eq!(solver.time(), 6.0);
    assert_eq!(solver.concentrations(), &[0.0]);
    assert_eq!(solver.event_state().pending_count(), 1);

    solver.integrate_to(8.0).unwrap();
    assert_eq!(solver.concentrations(), &[1.0]);
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[test]
fn reinitialize_resets_run() {
    let model = birth_model(RateConstant::Value(5.0), Vec::new());
    let mut solver = HybridSolver::new(&model, config(3)).unwrap();
    let offsets = solver.offsets().to_vec();
    solver.integrate_forward(4.0).unwrap();
    assert!(solver.reaction_counts()[0] > 0);

    solver.reinitialize();
    assert_eq!(solver.time(), 0.0);
    assert_eq!(solver.concentrations(), &[0.0]);
    assert_eq!(solver.reaction_counts(), &[0]);
    assert_eq!(solver.offsets(), offsets.as_slice());
}

#[test]
fn consumed_species_never_go_negative() {
    let mut reactions = ReactionState::new();
    reactions
        .add(Reaction::new(
            "drain",
            SimulationMode::Continuous,
            vec![Reactant::new(0, 1)],
            Vec::new(),
            propensity_fn(|_, _| 1.0),
        ))
        .unwrap();
    let model = Model::new(
        species(&[("A", 1.0)]),
        reactions,
        ParameterState::default(),
        Vec::new(),
    )
    .unwrap();
    let mut solver = HybridSolver::new(&model, config(1)).unwrap();
    solver.integrate_forward(3.0).unwrap();
    assert_eq!(solver.concentrations(), &[0.0]);
}

#[test]
fn invalid_steps_and_failures_are_errors() {
    let model = birth_model(RateConstant::Value(1.0), Vec::new());
    let mut solver = HybridSolver::new(&model, config(1)).unwrap();
    assert!(matches!(
        solver.integrate_forward(-1.0),
        Err(SimError::InvalidArgument(_))
    ));
    assert!(matches!(
        solver.integrate_forward(f64::NAN),
        Err(SimError::InvalidArgument(_))
    ));

    let failing = SolverConfiguration {
        random_seed: 1,
        integrator: IntegratorConfiguration {
            max_step: 1e-4,
            max_num_steps: 3,
            ..IntegratorConfiguration::default()
        },
    };
    let mut solver = HybridSolver::new(&model, failing).unwrap();
    let err = solver.integrate_forward(1.0).unwrap_err();
    assert!(matches!(
        err,
        SimError::Integration(crate::integrator::IntegrationStatus::BadStepSize)
    ));
}

#[test]
fn configuration_is_validated() {
    let model = birth_model(RateConstant::Value(1.0), Vec::new());
    let bad = SolverConfiguration {
        random_seed: 0,
        integrator: IntegratorConfiguration {
            abs_tol: -1.0,
            ..IntegratorConfiguration::default()
        },
    };
    assert!(matches!(
        HybridSolver::new(&model, bad),
        Err(SimError::Configuration(_))
    ));
}
