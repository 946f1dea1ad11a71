use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::SimError;
use crate::event_state::EventState;
use crate::integrator::{IntegrationResults, Integrator, IntegratorConfiguration};
use crate::model::Model;
use crate::parameter_state::ParameterState;
use crate::reaction_state::ReactionState;

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfiguration {
    pub random_seed: u64,
    pub integrator: IntegratorConfiguration,
}

impl SolverConfiguration {
    pub fn validate(&self) -> Result<(), SimError> {
        self.integrator.validate()
    }
}

#[derive(Clone, Debug, Default)]
struct SolverCheckpoint {
    event_state: EventState,
    parameters: ParameterState,
    reaction_counts: Vec<u64>,
}

/// Hybrid ODE/stochastic driver for one independent run: advances the
/// integrator, fires discrete reactions at their offset roots and hands
/// every stop to the event scheduler.
#[derive(Debug)]
pub struct HybridSolver {
    integrator: Integrator,
    reactions: Arc<ReactionState>,
    event_state: EventState,
    parameters: ParameterState,
    initial_parameters: ParameterState,
    reaction_counts: Vec<u64>,
    non_negative: Vec<usize>,
    checkpoint: SolverCheckpoint,
}

impl HybridSolver {
    pub fn new(model: &Model, config: SolverConfiguration) -> Result<Self, SimError> {
        config.validate()?;
        let mut integrator = Integrator::new(
            Arc::clone(model.species()),
            Arc::clone(model.reactions()),
            config.integrator,
            config.random_seed,
        )?;
        if !model.events().is_empty() || !integrator.discrete_reactions().is_empty() {
            integrator.use_events(model.events())?;
            integrator.use_reactions();
            integrator.enable_root_finder();
        }

        let parameters = model.parameters().clone();
        let event_state = EventState::from_shared(
            model.events().to_vec(),
            integrator.time(),
            integrator.concentrations(),
            parameters.data(),
        )?;
        let reaction_counts = vec![0; model.n_reactions()];
        let checkpoint = SolverCheckpoint {
            event_state: event_state.clone(),
            parameters: parameters.clone(),
            reaction_counts: reaction_counts.clone(),
        };

        Ok(Self {
            integrator,
            reactions: Arc::clone(model.reactions()),
            event_state,
            initial_parameters: parameters.clone(),
            parameters,
            reaction_counts,
            non_negative: model.non_negative_species().to_vec(),
            checkpoint,
        })
    }

    pub fn time(&self) -> f64 {
        self.integrator.time()
    }

    pub fn concentrations(&self) -> &[f64] {
        self.integrator.concentrations()
    }

    pub fn offsets(&self) -> &[f64] {
        self.integrator.offsets()
    }

    pub fn reaction_counts(&self) -> &[u64] {
        &self.reaction_counts
    }

    pub fn parameters(&self) -> &ParameterState {
        &self.parameters
    }

    pub fn event_state(&self) -> &EventState {
        &self.event_state
    }

    pub fn integrator(&self) -> &Integrator {
        &self.integrator
    }

    pub fn integrate_forward(&mut self, dt: f64) -> Result<(), SimError> {
        if !(dt.is_finite() && dt >= 0.0) {
            return Err(SimError::InvalidArgument(format!(
                "step size must be non-negative and finite, got {}",
                dt
            )));
        }
        self.integrate_to(self.time() + dt)
    }

    /// Advances the run to absolute time `target`, stopping at every
    /// reaction or trigger root and at every delayed event execution.
    pub fn integrate_to(&mut self, target: f64) -> Result<(), SimError> {
        if target < self.time() {
            return Err(SimError::InvalidArgument(format!(
                "target time {} lies before current time {}",
                target,
                self.time()
            )));
        }

        // Executions left due by a restore fire before any advance.
        if self
            .event_state
            .next_scheduled_time()
            .is_some_and(|next| next <= self.time())
        {
            let idle = self.idle_results();
            self.process_stop(&idle)?;
        }

        while self.time() < target {
            let stop = match self.event_state.next_scheduled_time() {
                Some(next) if next > self.time() => next.min(target),
                _ => target,
            };
            let results = self.integrator.integrate(stop, self.parameters.data());
            if !results.is_ok() {
                return Err(SimError::Integration(results.status));
            }
            self.process_stop(&results)?;
        }
        Ok(())
    }

    fn idle_results(&self) -> IntegrationResults {
        IntegrationResults {
            status: self.integrator.status(),
            time: self.time(),
            root_found: false,
            event_roots: Default::default(),
            reaction_roots: Default::default(),
        }
    }

    /// Fires reaction roots, clamps species and evaluates events at the time
    /// the integrator stopped.
    fn process_stop(&mut self, results: &IntegrationResults) -> Result<(), SimError> {
        let mut mutated = false;

        for &reaction_id in &results.reaction_roots {
            let reaction = self.reactions.reaction(reaction_id)?;
            reaction.apply(self.integrator.concentrations_mut());
            self.integrator.redraw_offset(reaction_id)?;
            self.reaction_counts[reaction_id] += 1;
            trace!(reaction_id, t = results.time, "discrete reaction fired");
            mutated = true;
        }

        let concentrations = self.integrator.concentrations_mut();
        for &species in &self.non_negative {
            if concentrations[species] < 0.0 {
                concentrations[species] = 0.0;
                mutated = true;
            }
        }

        if !self.event_state.is_empty() {
            let executed = self.event_state.executed_count();
            self.event_state.evaluate(
                self.integrator.concentrations_mut(),
                self.parameters.data_mut(),
                results.time,
                &results.event_roots,
            )?;
            if self.event_state.executed_count() != executed {
                debug!(
                    t = results.time,
                    executed = self.event_state.executed_count() - executed,
                    "event assignments applied"
                );
                mutated = true;
            }
        }

        if mutated {
            self.integrator.refresh_state();
        }
        Ok(())
    }

    /// Checkpoints the integrator together with the scheduler, parameters
    /// and reaction counts. Returns the checkpoint time.
    pub fn save_integrator_state(&mut self) -> f64 {
        self.checkpoint.event_state.clone_from(&self.event_state);
        self.checkpoint.parameters.copy_from(&self.parameters);
        self.checkpoint
            .reaction_counts
            .clone_from(&self.reaction_counts);
        self.integrator.save_state()
    }

    pub fn restore_integrator_state(&mut self) -> f64 {
        self.event_state.clone_from(&self.checkpoint.event_state);
        self.parameters.copy_from(&self.checkpoint.parameters);
        self.reaction_counts
            .clone_from(&self.checkpoint.reaction_counts);
        self.integrator.restore_state()
    }

    pub fn reinitialize(&mut self) {
        self.integrator.reinitialize();
        self.parameters.copy_from(&self.initial_parameters);
        self.reaction_counts.fill(0);
        self.event_state.reset(
            self.integrator.time(),
            self.integrator.concentrations(),
            self.parameters.data(),
        );
        self.checkpoint.event_state.clone_from(&self.event_state);
        self.checkpoint.parameters.copy_from(&self.parameters);
        self.checkpoint
            .reaction_counts
            .clone_from(&self.reaction_counts);
    }
}

#[cfg(test)]
mod tests;
