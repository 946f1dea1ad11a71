use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::SimError;
use crate::reaction_state::{Propensity, ReactionState, SimulationMode, propensity_fn};

pub trait RateRule: Send + Sync {
    fn evaluate(&self, t: f64, state: &[f64], parameters: &[f64]) -> f64;
}

impl<F> RateRule for F
where
    F: Fn(f64, &[f64], &[f64]) -> f64 + Send + Sync,
{
    #[inline]
    fn evaluate(&self, t: f64, state: &[f64], parameters: &[f64]) -> f64 {
        self(t, state, parameters)
    }
}

pub fn rate_rule_fn<F>(f: F) -> Arc<dyn RateRule>
where
    F: Fn(f64, &[f64], &[f64]) -> f64 + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone, Default)]
pub struct DifferentialEquation {
    formulas: Vec<(f64, Arc<dyn Propensity>)>,
    rate_rules: Vec<Arc<dyn RateRule>>,
}

impl DifferentialEquation {
    pub fn add_formula(&mut self, weight: f64, formula: Arc<dyn Propensity>) {
        self.formulas.push((weight, formula));
    }

    pub fn add_rate_rule(&mut self, rule: Arc<dyn RateRule>) {
        self.rate_rules.push(rule);
    }

    pub fn num_formulas(&self) -> usize {
        self.formulas.len()
    }

    pub fn num_rate_rules(&self) -> usize {
        self.rate_rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty() && self.rate_rules.is_empty()
    }

    pub fn evaluate(&self, t: f64, state: &[f64], parameters: &[f64]) -> f64 {
        let formulas: f64 = self
            .formulas
            .iter()
            .map(|(weight, formula)| weight * formula.evaluate(state, parameters))
            .sum();
        let rules: f64 = self
            .rate_rules
            .iter()
            .map(|rule| rule.evaluate(t, state, parameters))
            .sum();
        formulas + rules
    }
}

impl fmt::Debug for DifferentialEquation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DifferentialEquation")
            .field("formulas", &self.formulas.len())
            .field("rate_rules", &self.rate_rules.len())
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SpeciesState {
    names: Vec<String>,
    initial_values: Vec<f64>,
    equations: Vec<DifferentialEquation>,
    name_index: HashMap<String, usize>,
}

impl SpeciesState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_species(
        &mut self,
        name: impl Into<String>,
        initial_value: f64,
    ) -> Result<usize, SimError> {
        let name = name.into();
        if self.name_index.contains_key(&name) {
            return Err(SimError::InvalidArgument(format!(
                "species '{}' is already defined",
                name
            )));
        }
        let id = self.names.len();
        self.name_index.insert(name.clone(), id);
        self.names.push(name);
        self.initial_values.push(initial_value);
        self.equations.push(DifferentialEquation::default());
        Ok(id)
    }

    pub fn species_id(&self, name: &str) -> Result<usize, SimError> {
        self.name_index
            .get(name)
            .copied()
            .ok_or_else(|| SimError::NotFound(format!("species '{}'", name)))
    }

    pub fn name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn size(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn initial_values(&self) -> &[f64] {
        &self.initial_values
    }

    pub fn diff_equation(&self, id: usize) -> Result<&DifferentialEquation, SimError> {
        self.equations
            .get(id)
            .ok_or_else(|| SimError::NotFound(format!("species id {}", id)))
    }

    pub fn diff_equation_mut(&mut self, id: usize) -> Result<&mut DifferentialEquation, SimError> {
        self.equations
            .get_mut(id)
            .ok_or_else(|| SimError::NotFound(format!("species id {}", id)))
    }

    pub fn num_rate_rules(&self) -> usize {
        self.equations.iter().map(DifferentialEquation::num_rate_rules).sum()
    }

    /// True when no species changes continuously, so integration only
    /// needs to advance the reaction offsets.
    pub fn is_constant(&self) -> bool {
        self.equations.iter().all(DifferentialEquation::is_empty)
    }

    /// Adds a `change × ode_propensity` term for every continuous reaction.
    pub fn add_reaction_terms(&mut self, reactions: &ReactionState) -> Result<(), SimError> {
        for reaction in reactions.iter() {
            if reaction.mode() != SimulationMode::Continuous {
                continue;
            }
            for delta in reaction.change() {
                let reaction = reaction.clone();
                let term =
                    propensity_fn(move |state, params| reaction.ode_propensity(state, params));
                self.diff_equation_mut(delta.species)?
                    .add_formula(delta.delta as f64, term);
            }
        }
        Ok(())
    }

    pub fn initialize(&self, out: &mut [f64]) {
        out[..self.initial_values.len()].copy_from_slice(&self.initial_values);
    }

    pub fn integrate(&self, t: f64, y: &[f64], parameters: &[f64], dydt: &mut [f64]) {
        for (out, equation) in dydt.iter_mut().zip(self.equations.iter()) {
            *out = equation.evaluate(t, y, parameters);
        }
    }
}
