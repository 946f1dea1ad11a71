use super::*;
use crate::event::EventFunctions;
use crate::reaction_state::{RateConstant, Reactant, Reaction, SimulationMode};

/// Species A and B; a discrete birth of A at rate 1, continuous decay of B,
/// and a discrete birth of B at rate 0.5.
fn mixed_network() -> (Arc<SpeciesState>, Arc<ReactionState>) {
    let mut species = SpeciesState::new();
    species.add_species("A", 0.0).unwrap();
    species.add_species("B", 20.0).unwrap();
    let mut reactions = ReactionState::new();
    reactions
        .add(Reaction::mass_action(
            "birth_a",
            SimulationMode::Discrete,
            RateConstant::Value(1.0),
            Vec::new(),
            vec![Reactant::new(0, 1)],
        ))
        .unwrap();
    reactions
        .add(Reaction::mass_action(
            "decay_b",
            SimulationMode::Continuous,
            RateConstant::Value(0.1),
            vec![Reactant::new(1, 1)],
            Vec::new(),
        ))
        .unwrap();
    reactions
        .add(Reaction::mass_action(
            "birth_b",
            SimulationMode::Discrete,
            RateConstant::Value(0.5),
            Vec::new(),
            vec![Reactant::new(1, 1)],
        ))
        .unwrap();
    species.add_reaction_terms(&reactions).unwrap();
    (Arc::new(species), Arc::new(reactions))
}

/// Single species X decaying continuously at rate `p0`.
fn decay_only(initial: f64) -> (Arc<SpeciesState>, Arc<ReactionState>) {
    let mut species = SpeciesState::new();
    species.add_species("X", initial).unwrap();
    let mut reactions = ReactionState::new();
    reactions
        .add(Reaction::mass_action(
            "decay",
            SimulationMode::Continuous,
            RateConstant::Parameter(0),
            vec![Reactant::new(0, 1)],
            Vec::new(),
        ))
        .unwrap();
    species.add_reaction_terms(&reactions).unwrap();
    (Arc::new(species), Arc::new(reactions))
}

#[test]
fn offsets_start_negative_and_cover_discrete_reactions_only() {
    let (species, reactions) = mixed_network();
    let integrator =
        Integrator::new(species, reactions, IntegratorConfiguration::default(), 7).unwrap();
    assert_eq!(integrator.state().len(), 2 + 2);
    assert_eq!(integrator.discrete_reactions(), &[0, 2]);
    assert!(integrator.offsets().iter().all(|o| o.is_finite() && *o < 0.0));
    assert!(integrator.offset(1).is_none());
    assert_eq!(integrator.concentrations(), &[0.0, 20.0]);
}

#[test]
fn reaction_roots_arrive_in_time_order() {
    let (species, reactions) = mixed_network();
    let rates = [(0usize, 1.0), (2usize, 0.5)];
    let mut integrator =
        Integrator::new(species, reactions, IntegratorConfiguration::default(), 11).unwrap();
    integrator.use_reactions();
    integrator.enable_root_finder();
    assert_eq!(
        integrator.root_table(),
        &[RootTarget::Reaction(0), RootTarget::Reaction(2)]
    );

    let mut predicted: Vec<(ReactionId, f64)> = rates
        .iter()
        .map(|&(id, p)| (id, -integrator.offset(id).unwrap() / p))
        .collect();

    let mut last = 0.0;
    for _ in 0..8 {
        let results = integrator.integrate(1.0e4, &[]);
        assert!(results.is_ok());
        assert!(results.root_found);
        assert!(results.event_roots.is_empty());
        assert_eq!(results.reaction_roots.len(), 1);

        let fired = *results.reaction_roots.iter().next().unwrap();
        let (expected_id, expected_time) = predicted
            .iter()
            .copied()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap();
        assert_eq!(fired, expected_id);
        assert!((results.time - expected_time).abs() < 1e-6);
        assert!(results.time >= last);
        last = results.time;

        assert!(integrator.offset(fired).unwrap() >= 0.0);
        let offset = integrator.redraw_offset(fired).unwrap();
        integrator.refresh_state();
        let rate = rates.iter().find(|(id, _)| *id == fired).unwrap().1;
        for entry in predicted.iter_mut().filter(|(id, _)| *id == fired) {
            entry.1 = results.time - offset / rate;
        }
    }
}

#[test]
fn continuous_decay_is_accurate() {
    let (species, reactions) = decay_only(10.0);
    let mut integrator =
        Integrator::new(species, reactions, IntegratorConfiguration::default(), 1).unwrap();
    let results = integrator.integrate(2.0, &[0.5]);
    assert!(results.is_ok());
    assert!(!results.root_found);
    assert_eq!(results.time, 2.0);
    let expected = 10.0 * (-1.0f64).exp();
    assert!((integrator.concentrations()[0] - expected).abs() < 1e-4);
}

#[test]
fn event_trigger_root_is_located() {
    let (species, reactions) = decay_only(10.0);
    let mut integrator =
        Integrator::new(species, reactions, IntegratorConfiguration::default(), 1).unwrap();
    let event = Arc::new(EventStatus::new(
        0,
        EventFunctions::new(|t, _, _| t >= 5.0, |_, _| {}),
    ));
    integrator.use_events(&[event]).unwrap();
    integrator.enable_root_finder();
    assert_eq!(integrator.root_table(), &[RootTarget::Event(0)]);

    let results = integrator.integrate(10.0, &[0.5]);
    assert!(results.is_ok());
    assert!(results.root_found);
    assert_eq!(results.event_roots.iter().copied().collect::<Vec<_>>(), vec![0]);
    assert!(results.time >= 5.0 && results.time - 5.0 < 1e-6);

    let results = integrator.integrate(10.0, &[0.5]);
    assert!(!results.root_found);
    assert_eq!(results.time, 10.0);

    integrator.disable_root_finder();
    assert!(!integrator.is_root_finder_enabled());
}

#[test]
fn use_events_requires_dense_ids() {
    let (species, reactions) = decay_only(1.0);
    let mut integrator =
        Integrator::new(species, reactions, IntegratorConfiguration::default(), 1).unwrap();
    let event = Arc::new(EventStatus::new(
        4,
        EventFunctions::new(|_, _, _| false, |_, _| {}),
    ));
    assert!(matches!(
        integrator.use_events(&[event]),
        Err(SimError::InvalidArgument(_))
    ));
}

#[test]
fn save_restore_round_trip_is_exact() {
    let (species, reactions) = mixed_network();
    let mut integrator =
        Integrator::new(species, reactions, IntegratorConfiguration::default(), 3).unwrap();
    integrator.integrate(0.3, &[]);
    let state: Vec<u64> = integrator.state().iter().map(|v| v.to_bits()).collect();
    let time = integrator.time();

    assert_eq!(integrator.save_state(), time);
    assert_eq!(integrator.restore_state(), time);
    let restored: Vec<u64> = integrator.state().iter().map(|v| v.to_bits()).collect();
    assert_eq!(state, restored);
    assert_eq!(integrator.time().to_bits(), time.to_bits());

    integrator.integrate(1.0, &[]);
    assert_ne!(integrator.time(), time);
    integrator.restore_state();
    let restored: Vec<u64> = integrator.state().iter().map(|v| v.to_bits()).collect();
    assert_eq!(state, restored);
}

#[test]
fn reinitialize_returns_to_initial_condition() {
    let (species, reactions) = mixed_network();
    let mut integrator =
        Integrator::new(species, reactions, IntegratorConfiguration::default(), 3).unwrap();
    let initial = integrator.state().to_vec();
    integrator.integrate(2.0, &[]);
    integrator.redraw_offset(0).unwrap();
    integrator.reinitialize();
    assert_eq!(integrator.state(), initial.as_slice());
    assert_eq!(integrator.time(), 0.0);
}

#[test]
fn constant_species_take_the_closed_form_path() {
    let mut species = SpeciesState::new();
    species.add_species("A", 0.0).unwrap();
    let mut reactions = ReactionState::new();
    reactions
        .add(Reaction::mass_action(
            "birth",
            SimulationMode::Discrete,
            RateConstant::Value(2.0),
            Vec::new(),
            vec![Reactant::new(0, 1)],
        ))
        .unwrap();
    let mut integrator = Integrator::new(
        Arc::new(species),
        Arc::new(reactions),
        IntegratorConfiguration::default(),
        5,
    )
    .unwrap();
    let start = integrator.offsets()[0];
    let results = integrator.integrate(3.0, &[]);
    assert!(results.is_ok());
    assert_eq!(results.time, 3.0);
    assert!((integrator.offsets()[0] - (start + 6.0)).abs() < 1e-12);
    assert_eq!(integrator.propensities(), &[2.0]);

    let results = integrator.integrate(1.0, &[]);
    assert_eq!(results.status, IntegrationStatus::BadStepSize);
}

#[test]
fn redraw_requires_a_discrete_reaction() {
    let (species, reactions) = mixed_network();
    let mut integrator =
        Integrator::new(species, reactions, IntegratorConfiguration::default(), 3).unwrap();
    assert!(matches!(integrator.redraw_offset(1), Err(SimError::NotFound(_))));
    assert!(matches!(integrator.redraw_offset(9), Err(SimError::NotFound(_))));
    let offset = integrator.redraw_offset(2).unwrap();
    assert_eq!(integrator.offset(2), Some(offset));
}

#[test]
fn offsets_depend_on_seed() {
    let (species, reactions) = mixed_network();
    let a = Integrator::new(
        Arc::clone(&species),
        Arc::clone(&reactions),
        IntegratorConfiguration::default(),
        1,
    )
    .unwrap();
    let b = Integrator::new(
        Arc::clone(&species),
        Arc::clone(&reactions),
        IntegratorConfiguration::default(),
        1,
    )
    .unwrap();
    let c = Integrator::new(species, reactions, IntegratorConfiguration::default(), 2).unwrap();
    assert_eq!(a.offsets(), b.offsets());
    assert_ne!(a.offsets(), c.offsets());
}

#[test]
fn invalid_configuration_is_rejected() {
    let bad = [
        IntegratorConfiguration {
            rel_tol: 0.0,
            ..IntegratorConfiguration::default()
        },
        IntegratorConfiguration {
            abs_tol: f64::NAN,
            ..IntegratorConfiguration::default()
        },
        IntegratorConfiguration {
            max_step: -1.0,
            ..IntegratorConfiguration::default()
        },
        IntegratorConfiguration {
            max_num_steps: 0,
            ..IntegratorConfiguration::default()
        },
    ];
    for config in bad {
        assert!(matches!(config.validate(), Err(SimError::Configuration(_))));
    }

    let (species, reactions) = decay_only(1.0);
    let config = IntegratorConfiguration {
        root_tol: -1.0,
        ..IntegratorConfiguration::default()
    };
    assert!(matches!(
        Integrator::new(Arc::clone(&species), Arc::clone(&reactions), config, 1),
        Err(SimError::Configuration(_))
    ));

    let mut integrator =
        Integrator::new(species, reactions, IntegratorConfiguration::default(), 1).unwrap();
    let config = IntegratorConfiguration {
        max_step: 0.25,
        ..IntegratorConfiguration::default()
    };
    integrator.configure(config.clone()).unwrap();
    assert_eq!(integrator.config(), &config);
}

/// Reports a root on every call without ever installing root functions.
struct PhantomRoots {
    t: f64,
    y: Vec<f64>,
}

impl OdeEngine for PhantomRoots {
    fn reinit(&mut self, t0: f64, y0: &[f64]) {
        self.t = t0;
        self.y = y0.to_vec();
    }

    fn configure(&mut self, _config: &IntegratorConfiguration) {}

    fn root_init(&mut self, _num_roots: usize) {}

    fn solve(&mut self, _system: &dyn OdeSystem, tout: f64) -> Result<EngineReturn, EngineError> {
        self.t = 0.5 * (self.t + tout);
        Ok(EngineReturn::Root)
    }

    fn root_info(&self) -> Result<&[i8], EngineError> {
        Err(EngineError::NoRootFunctions)
    }

    fn time(&self) -> f64 {
        self.t
    }

    fn state(&self) -> &[f64] {
        &self.y
    }
}

#[test]
fn missing_root_information_sets_bad_memory() {
    let (species, reactions) = decay_only(1.0);
    let engine = Box::new(PhantomRoots { t: 0.0, y: Vec::new() });
    let mut integrator = Integrator::with_engine(
        species,
        reactions,
        IntegratorConfiguration::default(),
        1,
        engine,
    )
    .unwrap();

    let results = integrator.integrate(1.0, &[0.5]);
    assert_eq!(results.status, IntegrationStatus::BadMemory);
    assert_eq!(integrator.status(), IntegrationStatus::BadMemory);

    // Failed integrators refuse to advance until restored.
    let results = integrator.integrate(2.0, &[0.5]);
    assert_eq!(results.status, IntegrationStatus::BadMemory);

    integrator.reinitialize();
    assert_eq!(integrator.status(), IntegrationStatus::Ok);
}

#[test]
fn step_failures_map_to_bad_step_size() {
    let (species, reactions) = decay_only(1.0);
    let config = IntegratorConfiguration {
        max_step: 1e-4,
        max_num_steps: 5,
        ..IntegratorConfiguration::default()
    };
    let mut integrator = Integrator::new(species, reactions, config, 1).unwrap();
    let results = integrator.integrate(1.0, &[0.5]);
    assert_eq!(results.status, IntegrationStatus::BadStepSize);
    assert_eq!(
        IntegrationStatus::from(&EngineError::Uninitialized),
        IntegrationStatus::NullPointer
    );
}

#[test]
fn urn_draws_stay_in_open_interval() {
    let mut urn = URNGenerator::new(42);
    for _ in 0..1000 {
        let u = urn.next_uniform();
        assert!(u > 0.0 && u < 1.0);
        assert!(urn.next_offset() < 0.0);
    }
    assert_eq!(urn.seed(), 42);
}
