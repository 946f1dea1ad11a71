use std::collections::BTreeSet;
use std::sync::Arc;

use crate::SimError;
use crate::event::{EventId, EventStatus};
use crate::parameter_state::ParameterState;
use crate::reaction_state::{ReactionId, ReactionState};
use crate::species_state::SpeciesState;

/// Validated, immutable description of a reaction network shared by every
/// run built from it.
#[derive(Clone, Debug)]
pub struct Model {
    species: Arc<SpeciesState>,
    reactions: Arc<ReactionState>,
    parameters: ParameterState,
    events: Vec<Arc<EventStatus>>,
    non_negative: Vec<usize>,
}

impl Model {
    /// Checks stoichiometry against the species count and event ids for
    /// density, then couples continuous reactions into the species'
    /// differential equations.
    pub fn new(
        mut species: SpeciesState,
        reactions: ReactionState,
        parameters: ParameterState,
        events: Vec<EventStatus>,
    ) -> Result<Self, SimError> {
        reactions.validate(species.size())?;
        for (position, event) in events.iter().enumerate() {
            if event.id() != position {
                return Err(SimError::InvalidArgument(format!(
                    "event at position {} has id {}; event ids must be dense and ordered",
                    position,
                    event.id()
                )));
            }
        }
        species.add_reaction_terms(&reactions)?;

        let non_negative: BTreeSet<usize> = reactions
            .iter()
            .flat_map(|reaction| reaction.change().iter().map(|delta| delta.species))
            .collect();

        Ok(Self {
            species: Arc::new(species),
            reactions: Arc::new(reactions),
            parameters,
            events: events.into_iter().map(Arc::new).collect(),
            non_negative: non_negative.into_iter().collect(),
        })
    }

    pub fn species(&self) -> &Arc<SpeciesState> {
        &self.species
    }

    pub fn reactions(&self) -> &Arc<ReactionState> {
        &self.reactions
    }

    pub fn parameters(&self) -> &ParameterState {
        &self.parameters
    }

    pub fn events(&self) -> &[Arc<EventStatus>] {
        &self.events
    }

    pub fn event(&self, event_id: EventId) -> Result<&Arc<EventStatus>, SimError> {
        self.events
            .get(event_id)
            .ok_or_else(|| SimError::NotFound(format!("event id {}", event_id)))
    }

    pub fn n_species(&self) -> usize {
        self.species.size()
    }

    pub fn n_reactions(&self) -> usize {
        self.reactions.size()
    }

    pub fn species_id(&self, name: &str) -> Result<usize, SimError> {
        self.species.species_id(name)
    }

    pub fn reaction_id(&self, name: &str) -> Result<ReactionId, SimError> {
        self.reactions.reaction_id(name)
    }

    pub fn non_negative_species(&self) -> &[usize] {
        &self.non_negative
    }
}
