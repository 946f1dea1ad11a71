use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use rand::distr::Open01;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::SimError;
use crate::engine::{DormandPrince, EngineError, EngineReturn, OdeEngine, OdeSystem};
use crate::event::{EventId, EventStatus};
use crate::reaction_state::{ReactionId, ReactionState};
use crate::species_state::SpeciesState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntegrationStatus {
    Ok,
    NullPointer,
    BadMemory,
    BadStepSize,
}

impl fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntegrationStatus::Ok => "ok",
            IntegrationStatus::NullPointer => "null pointer",
            IntegrationStatus::BadMemory => "bad memory",
            IntegrationStatus::BadStepSize => "bad step size",
        };
        f.write_str(name)
    }
}

impl From<&EngineError> for IntegrationStatus {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::Uninitialized => IntegrationStatus::NullPointer,
            EngineError::NoRootFunctions => IntegrationStatus::BadMemory,
            EngineError::BackwardTarget { .. }
            | EngineError::StepTooSmall { .. }
            | EngineError::TooMuchWork(_) => IntegrationStatus::BadStepSize,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntegratorConfiguration {
    pub rel_tol: f64,
    pub abs_tol: f64,
    /// Upper bound on a single step; zero leaves steps unbounded.
    pub max_step: f64,
    pub max_num_steps: usize,
    /// Width of the time bracket a located root is refined to.
    pub root_tol: f64,
}

impl Default for IntegratorConfiguration {
    fn default() -> Self {
        Self {
            rel_tol: 1e-6,
            abs_tol: 1e-9,
            max_step: 0.0,
            max_num_steps: 100_000,
            root_tol: 1e-10,
        }
    }
}

impl IntegratorConfiguration {
    pub fn validate(&self) -> Result<(), SimError> {
        let positive = [
            ("rel_tol", self.rel_tol),
            ("abs_tol", self.abs_tol),
            ("root_tol", self.root_tol),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(SimError::Configuration(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )));
            }
        }
        if !(self.max_step.is_finite() && self.max_step >= 0.0) {
            return Err(SimError::Configuration(format!(
                "max_step must be non-negative and finite, got {}",
                self.max_step
            )));
        }
        if self.max_num_steps == 0 {
            return Err(SimError::Configuration(
                "max_num_steps must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RootTarget {
    Event(EventId),
    Reaction(ReactionId),
}

#[derive(Clone, Debug)]
pub struct URNGenerator {
    seed: u64,
    rng: ChaCha8Rng,
}

impl URNGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    pub fn next_uniform(&mut self) -> f64 {
        self.rng.sample(Open01)
    }

    #[inline]
    pub fn next_offset(&mut self) -> f64 {
        self.next_uniform().ln()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IntegrationResults {
    pub status: IntegrationStatus,
    pub time: f64,
    pub root_found: bool,
    pub event_roots: BTreeSet<EventId>,
    pub reaction_roots: BTreeSet<ReactionId>,
}

impl IntegrationResults {
    fn new(status: IntegrationStatus, time: f64) -> Self {
        Self {
            status,
            time,
            root_found: false,
            event_roots: BTreeSet::new(),
            reaction_roots: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == IntegrationStatus::Ok
    }
}

#[derive(Clone, Debug, Default)]
struct Checkpoint {
    state: Vec<f64>,
    time: f64,
}

struct HybridSystem<'a> {
    species: &'a SpeciesState,
    reactions: &'a ReactionState,
    parameters: &'a [f64],
    discrete_ids: &'a [ReactionId],
    offset_slots: &'a [Option<usize>],
    events: &'a [Arc<EventStatus>],
    root_table: &'a [RootTarget],
}

impl OdeSystem for HybridSystem<'_> {
    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) {
        let n = self.species.size();
        let (concentrations, _) = y.split_at(n);
        let (d_concentrations, d_offsets) = dydt.split_at_mut(n);
        self.species
            .integrate(t, concentrations, self.parameters, d_concentrations);
        for (out, &reaction_id) in d_offsets.iter_mut().zip(self.discrete_ids) {
            *out = self.reactions.reaction(reaction_id).map_or(0.0, |reaction| {
                reaction.ssa_propensity(concentrations, self.parameters)
            });
        }
    }

    fn roots(&self, t: f64, y: &[f64], gout: &mut [f64]) {
        let n = self.species.size();
        let (concentrations, offsets) = y.split_at(n);
        for (g, target) in gout.iter_mut().zip(self.root_table) {
            *g = match *target {
                RootTarget::Event(event_id) => {
                    let fired = self.events[event_id].trigger(t, concentrations, self.parameters);
                    if fired { 1.0 } else { -1.0 }
                }
                RootTarget::Reaction(reaction_id) => self.offset_slots[reaction_id]
                    .map_or(-1.0, |slot| offsets[slot]),
            };
        }
    }
}

/// Couples the ODE engine to the species and reaction descriptors over a
/// state vector laid out as `[concentrations | discrete reaction offsets]`.
pub struct Integrator {
    species: Arc<SpeciesState>,
    reactions: Arc<ReactionState>,
    config: IntegratorConfiguration,
    engine: Box<dyn OdeEngine>,
    urn: URNGenerator,

    num_species: usize,
    discrete_ids: Vec<ReactionId>,
    offset_slots: Vec<Option<usize>>,

    active_events: Vec<Arc<EventStatus>>,
    active_reactions: Vec<ReactionId>,
    root_table: Vec<RootTarget>,

    initial_state: Vec<f64>,
    state: Vec<f64>,
    time: f64,
    saved: Checkpoint,
    engine_stale: bool,

    propensities: Vec<f64>,
    status: IntegrationStatus,
}

impl Integrator {
    pub fn new(
        species: Arc<SpeciesState>,
        reactions: Arc<ReactionState>,
        config: IntegratorConfiguration,
        seed: u64,
    ) -> Result<Self, SimError> {
        let engine = Box::new(DormandPrince::new(&config));
        Self::with_engine(species, reactions, config, seed, engine)
    }

    pub fn with_engine(
        species: Arc<SpeciesState>,
        reactions: Arc<ReactionState>,
        config: IntegratorConfiguration,
        seed: u64,
        mut engine: Box<dyn OdeEngine>,
    ) -> Result<Self, SimError> {
        config.validate()?;
        reactions.validate(species.size())?;
        engine.configure(&config);

        let num_species = species.size();
        let discrete_ids = reactions.discrete_ids();
        let mut offset_slots = vec![None; reactions.size()];
        for (slot, &reaction_id) in discrete_ids.iter().enumerate() {
            offset_slots[reaction_id] = Some(slot);
        }

        let mut urn = URNGenerator::new(seed);
        let mut initial_state = vec![0.0; num_species + discrete_ids.len()];
        species.initialize(&mut initial_state[..num_species]);
        for offset in &mut initial_state[num_species..] {
            *offset = urn.next_offset();
        }
        engine.reinit(0.0, &initial_state);

        let propensities = vec![0.0; reactions.size()];
        Ok(Self {
            species,
            reactions,
            config,
            engine,
            urn,
            num_species,
            discrete_ids,
            offset_slots,
            active_events: Vec::new(),
            active_reactions: Vec::new(),
            root_table: Vec::new(),
            state: initial_state.clone(),
            saved: Checkpoint {
                state: initial_state.clone(),
                time: 0.0,
            },
            initial_state,
            time: 0.0,
            engine_stale: false,
            propensities,
            status: IntegrationStatus::Ok,
        })
    }

    pub fn species(&self) -> &Arc<SpeciesState> {
        &self.species
    }

    pub fn reactions(&self) -> &Arc<ReactionState> {
        &self.reactions
    }

    pub fn config(&self) -> &IntegratorConfiguration {
        &self.config
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn status(&self) -> IntegrationStatus {
        self.status
    }

    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn concentrations(&self) -> &[f64] {
        &self.state[..self.num_species]
    }

    pub fn concentrations_mut(&mut self) -> &mut [f64] {
        &mut self.state[..self.num_species]
    }

    pub fn offsets(&self) -> &[f64] {
        &self.state[self.num_species..]
    }

    pub fn offset(&self, reaction_id: ReactionId) -> Option<f64> {
        let slot = (*self.offset_slots.get(reaction_id)?)?;
        Some(self.state[self.num_species + slot])
    }

    pub fn discrete_reactions(&self) -> &[ReactionId] {
        &self.discrete_ids
    }

    pub fn propensities(&self) -> &[f64] {
        &self.propensities
    }

    pub fn root_table(&self) -> &[RootTarget] {
        &self.root_table
    }

    pub fn is_root_finder_enabled(&self) -> bool {
        !self.root_table.is_empty()
    }

    pub fn configure(&mut self, config: IntegratorConfiguration) -> Result<(), SimError> {
        config.validate()?;
        self.engine.configure(&config);
        self.config = config;
        Ok(())
    }

    pub fn use_events(&mut self, events: &[Arc<EventStatus>]) -> Result<(), SimError> {
        if let Some((position, event)) = events
            .iter()
            .enumerate()
            .find(|(position, event)| event.id() != *position)
        {
            return Err(SimError::InvalidArgument(format!(
                "event at position {} has id {}; event ids must be dense and ordered",
                position,
                event.id()
            )));
        }
        self.active_events = events.to_vec();
        Ok(())
    }

    pub fn use_reactions(&mut self) {
        self.active_reactions = self.discrete_ids.clone();
    }

    pub fn enable_root_finder(&mut self) {
        self.root_table = self
            .active_events
            .iter()
            .map(|event| RootTarget::Event(event.id()))
            .chain(self.active_reactions.iter().copied().map(RootTarget::Reaction))
            .collect();
        self.engine.root_init(self.root_table.len());
        debug!(roots = self.root_table.len(), "root finder enabled");
    }

    pub fn disable_root_finder(&mut self) {
        self.active_events.clear();
        self.active_reactions.clear();
        self.root_table.clear();
        self.engine.root_init(0);
    }

    pub fn save_state(&mut self) -> f64 {
        self.saved.state.clone_from(&self.state);
        self.saved.time = self.time;
        self.time
    }

    pub fn restore_state(&mut self) -> f64 {
        self.state.clone_from(&self.saved.state);
        self.time = self.saved.time;
        self.status = IntegrationStatus::Ok;
        self.refresh_state();
        self.time
    }

    pub fn refresh_state(&mut self) {
        self.engine.reinit(self.time, &self.state);
        self.engine_stale = false;
    }

    pub fn reinitialize(&mut self) {
        self.state.clone_from(&self.initial_state);
        self.time = 0.0;
        self.saved.state.clone_from(&self.initial_state);
        self.saved.time = 0.0;
        self.status = IntegrationStatus::Ok;
        self.refresh_state();
    }

    pub fn redraw_offset(&mut self, reaction_id: ReactionId) -> Result<f64, SimError> {
        let slot = self
            .offset_slots
            .get(reaction_id)
            .copied()
            .flatten()
            .ok_or_else(|| {
                SimError::NotFound(format!("discrete reaction with id {}", reaction_id))
            })?;
        let offset = self.urn.next_offset();
        self.state[self.num_species + slot] = offset;
        self.engine_stale = true;
        Ok(offset)
    }

    /// Advances towards `t`, stopping early at the first root crossing.
    ///
    /// Species without continuous dynamics and no armed roots take a closed
    /// form path that only advances the offsets.
    pub fn integrate(&mut self, t: f64, parameters: &[f64]) -> IntegrationResults {
        if self.status != IntegrationStatus::Ok {
            return IntegrationResults::new(self.status, self.time);
        }
        if self.species.is_constant() && self.root_table.is_empty() {
            return self.integrate_constant(t, parameters);
        }

        if self.engine_stale {
            self.refresh_state();
        }
        let system = HybridSystem {
            species: &self.species,
            reactions: &self.reactions,
            parameters,
            discrete_ids: &self.discrete_ids,
            offset_slots: &self.offset_slots,
            events: &self.active_events,
            root_table: &self.root_table,
        };
        let outcome = self.engine.solve(&system, t);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => return self.fail(&err),
        };
        self.time = self.engine.time();
        self.state.copy_from_slice(self.engine.state());
        self.reactions.ssa_propensity(
            &self.state[..self.num_species],
            parameters,
            &mut self.propensities,
        );

        let mut results = IntegrationResults::new(IntegrationStatus::Ok, self.time);
        if outcome == EngineReturn::Root {
            let info = match self.engine.root_info() {
                Ok(info) => info,
                Err(err) => return self.fail(&err),
            };
            results.root_found = true;
            for (target, _) in self
                .root_table
                .iter()
                .zip(info)
                .filter(|(_, flag)| **flag != 0)
            {
                match *target {
                    RootTarget::Event(event_id) => {
                        results.event_roots.insert(event_id);
                    }
                    RootTarget::Reaction(reaction_id) => {
                        results.reaction_roots.insert(reaction_id);
                    }
                }
            }
            trace!(
                t = self.time,
                events = ?results.event_roots,
                reactions = ?results.reaction_roots,
                "integration stopped at root"
            );
        }
        results
    }

    pub fn integrate_constant(&mut self, t: f64, parameters: &[f64]) -> IntegrationResults {
        if t < self.time {
            return self.fail(&EngineError::BackwardTarget {
                target: t,
                current: self.time,
            });
        }
        let (concentrations, offsets) = self.state.split_at_mut(self.num_species);
        self.reactions
            .ssa_propensity(concentrations, parameters, &mut self.propensities);
        let tau = t - self.time;
        for (offset, &reaction_id) in offsets.iter_mut().zip(&self.discrete_ids) {
            *offset += self.propensities[reaction_id] * tau;
        }
        self.time = t;
        self.engine_stale = true;
        IntegrationResults::new(IntegrationStatus::Ok, self.time)
    }

    fn fail(&mut self, err: &EngineError) -> IntegrationResults {
        self.status = IntegrationStatus::from(err);
        warn!(t = self.time, status = %self.status, error = %err, "integration failed");
        IntegrationResults::new(self.status, self.time)
    }
}

impl fmt::Debug for Integrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Integrator")
            .field("time", &self.time)
            .field("status", &self.status)
            .field("state", &self.state)
            .field("root_table", &self.root_table)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
