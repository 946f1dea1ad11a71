use meval::{Context, ContextProvider, Expr};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::SimError;

pub type ReactionId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimulationMode {
    Discrete,
    Continuous,
}

pub trait Propensity: Send + Sync {
    fn evaluate(&self, state: &[f64], parameters: &[f64]) -> f64;
}

impl<F> Propensity for F
where
    F: Fn(&[f64], &[f64]) -> f64 + Send + Sync,
{
    #[inline]
    fn evaluate(&self, state: &[f64], parameters: &[f64]) -> f64 {
        self(state, parameters)
    }
}

pub fn propensity_fn<F>(f: F) -> Arc<dyn Propensity>
where
    F: Fn(&[f64], &[f64]) -> f64 + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reactant {
    pub species: usize,
    pub count: u32,
}

impl Reactant {
    pub fn new(species: usize, count: u32) -> Self {
        Self { species, count }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeciesDelta {
    pub species: usize,
    pub delta: i32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RateConstant {
    Value(f64),
    Parameter(usize),
}

impl RateConstant {
    #[inline]
    fn resolve(self, parameters: &[f64]) -> f64 {
        match self {
            RateConstant::Value(value) => value,
            RateConstant::Parameter(idx) => parameters.get(idx).copied().unwrap_or(0.0),
        }
    }
}

/// Mass-action kinetics.
///
/// The stochastic form counts distinct reactant combinations with a falling
/// factorial over whole molecules; the deterministic form uses plain powers
/// of the concentrations.
#[derive(Clone, Debug)]
pub struct MassAction {
    rate: RateConstant,
    reactants: Vec<Reactant>,
    stochastic: bool,
}

impl MassAction {
    pub fn stochastic(rate: RateConstant, reactants: Vec<Reactant>) -> Self {
        Self {
            rate,
            reactants,
            stochastic: true,
        }
    }

    pub fn deterministic(rate: RateConstant, reactants: Vec<Reactant>) -> Self {
        Self {
            rate,
            reactants,
            stochastic: false,
        }
    }
}

impl Propensity for MassAction {
    fn evaluate(&self, state: &[f64], parameters: &[f64]) -> f64 {
        let mut propensity = self.rate.resolve(parameters);
        for reactant in &self.reactants {
            let available = state[reactant.species].max(0.0);
            if self.stochastic {
                let whole = available.floor();
                if whole < reactant.count as f64 {
                    return 0.0;
                }
                propensity *= falling_factorial(whole, reactant.count);
            } else {
                propensity *= available.powi(reactant.count as i32);
            }
        }
        propensity
    }
}

/// Interpreted propensity backed by a `meval` expression.
///
/// Species are referenced as `s<i>` and parameters as `p<i>`.
#[derive(Clone, Debug)]
pub struct ExpressionPropensity {
    expr: Expr,
    species_refs: Vec<usize>,
    parameter_refs: Vec<usize>,
}

impl ExpressionPropensity {
    pub fn parse(source: &str, n_species: usize, n_parameters: usize) -> Result<Self, SimError> {
        let expr = Expr::from_str(source).map_err(|err| {
            SimError::InvalidArgument(format!("expression '{}' parse error: {}", source, err))
        })?;
        let species_refs = collect_refs(source, 's', n_species)?;
        let parameter_refs = collect_refs(source, 'p', n_parameters)?;
        Ok(Self {
            expr,
            species_refs,
            parameter_refs,
        })
    }

    pub fn species_refs(&self) -> &[usize] {
        &self.species_refs
    }

    pub fn parameter_refs(&self) -> &[usize] {
        &self.parameter_refs
    }
}

impl Propensity for ExpressionPropensity {
    fn evaluate(&self, state: &[f64], parameters: &[f64]) -> f64 {
        let ctx = (StateContext { state, parameters }, Context::new());
        self.expr.eval_with_context(ctx).unwrap_or(0.0)
    }
}

struct StateContext<'a> {
    state: &'a [f64],
    parameters: &'a [f64],
}

impl ContextProvider for StateContext<'_> {
    fn get_var(&self, name: &str) -> Option<f64> {
        match parse_indexed_variable(name)? {
            ('s', idx) => self.state.get(idx).map(|value| value.max(0.0)),
            ('p', idx) => self.parameters.get(idx).copied(),
            _ => None,
        }
    }
}

fn parse_indexed_variable(name: &str) -> Option<(char, usize)> {
    let mut chars = name.chars();
    let prefix = chars.next()?.to_ascii_lowercase();
    let digits = chars.as_str();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<usize>().ok().map(|idx| (prefix, idx))
}

fn collect_refs(source: &str, prefix: char, limit: usize) -> Result<Vec<usize>, SimError> {
    let mut refs = Vec::new();
    let bytes = source.as_bytes();
    let lower = prefix as u8;
    let upper = prefix.to_ascii_uppercase() as u8;
    let mut idx = 0;
    while idx < bytes.len() {
        let ch = bytes[idx];
        let starts_word = idx == 0 || !bytes[idx - 1].is_ascii_alphanumeric();
        if (ch == lower || ch == upper) && starts_word {
            let mut end = idx + 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > idx + 1 {
                let digits = &source[idx + 1..end];
                let ref_idx = digits.parse::<usize>().map_err(|_| {
                    SimError::InvalidArgument(format!(
                        "expression '{}' contains invalid index '{}'",
                        source, digits
                    ))
                })?;
                if ref_idx >= limit {
                    return Err(SimError::InvalidArgument(format!(
                        "expression '{}' index {}{} exceeds available count {}",
                        source, prefix, ref_idx, limit
                    )));
                }
                if !refs.contains(&ref_idx) {
                    refs.push(ref_idx);
                }
                idx = end;
                continue;
            }
        }
        idx += 1;
    }
    Ok(refs)
}

#[inline]
fn falling_factorial(value: f64, count: u32) -> f64 {
    match count {
        0 => 1.0,
        1 => value,
        _ if value < count as f64 => 0.0,
        _ => (0..count).fold(1.0, |acc, i| acc * (value - i as f64)),
    }
}

#[derive(Clone)]
pub struct Reaction {
    name: String,
    mode: SimulationMode,
    reactants: Vec<Reactant>,
    products: Vec<Reactant>,
    deltas: Vec<SpeciesDelta>,
    ssa_propensity: Arc<dyn Propensity>,
    ode_propensity: Arc<dyn Propensity>,
}

impl Reaction {
    pub fn new(
        name: impl Into<String>,
        mode: SimulationMode,
        reactants: Vec<Reactant>,
        products: Vec<Reactant>,
        propensity: Arc<dyn Propensity>,
    ) -> Self {
        let deltas = build_reaction_deltas(&reactants, &products);
        Self {
            name: name.into(),
            mode,
            reactants,
            products,
            deltas,
            ode_propensity: Arc::clone(&propensity),
            ssa_propensity: propensity,
        }
    }

    pub fn mass_action(
        name: impl Into<String>,
        mode: SimulationMode,
        rate: RateConstant,
        reactants: Vec<Reactant>,
        products: Vec<Reactant>,
    ) -> Self {
        let ssa = MassAction::stochastic(rate, reactants.clone());
        let ode = MassAction::deterministic(rate, reactants.clone());
        Self::new(name, mode, reactants, products, Arc::new(ssa)).with_ode_propensity(Arc::new(ode))
    }

    pub fn with_ode_propensity(mut self, propensity: Arc<dyn Propensity>) -> Self {
        self.ode_propensity = propensity;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> SimulationMode {
        self.mode
    }

    pub fn reactants(&self) -> &[Reactant] {
        &self.reactants
    }

    pub fn products(&self) -> &[Reactant] {
        &self.products
    }

    pub fn change(&self) -> &[SpeciesDelta] {
        &self.deltas
    }

    #[inline]
    pub fn ssa_propensity(&self, state: &[f64], parameters: &[f64]) -> f64 {
        self.ssa_propensity.evaluate(state, parameters)
    }

    #[inline]
    pub fn ode_propensity(&self, state: &[f64], parameters: &[f64]) -> f64 {
        self.ode_propensity.evaluate(state, parameters)
    }

    pub fn apply(&self, species: &mut [f64]) {
        for delta in &self.deltas {
            species[delta.species] += delta.delta as f64;
        }
    }
}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaction")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("reactants", &self.reactants)
            .field("products", &self.products)
            .finish_non_exhaustive()
    }
}

fn build_reaction_deltas(reactants: &[Reactant], products: &[Reactant]) -> Vec<SpeciesDelta> {
    let mut deltas: Vec<SpeciesDelta> = Vec::new();
    let changes = reactants
        .iter()
        .map(|r| (r.species, -(r.count as i32)))
        .chain(products.iter().map(|p| (p.species, p.count as i32)));
    for (species, delta) in changes {
        match deltas.iter_mut().find(|d| d.species == species) {
            Some(existing) => existing.delta += delta,
            None => deltas.push(SpeciesDelta { species, delta }),
        }
    }
    deltas.retain(|d| d.delta != 0);
    deltas
}

#[derive(Clone, Debug, Default)]
pub struct ReactionState {
    reactions: Vec<Reaction>,
    name_index: HashMap<String, ReactionId>,
}

impl ReactionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, reaction: Reaction) -> Result<ReactionId, SimError> {
        if self.name_index.contains_key(reaction.name()) {
            return Err(SimError::InvalidArgument(format!(
                "reaction '{}' is already defined",
                reaction.name()
            )));
        }
        let id = self.reactions.len();
        self.name_index.insert(reaction.name().to_owned(), id);
        self.reactions.push(reaction);
        Ok(id)
    }

    pub fn size(&self) -> usize {
        self.reactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactions.is_empty()
    }

    pub fn reaction_id(&self, name: &str) -> Result<ReactionId, SimError> {
        self.name_index
            .get(name)
            .copied()
            .ok_or_else(|| SimError::NotFound(format!("reaction '{}'", name)))
    }

    pub fn reaction(&self, id: ReactionId) -> Result<&Reaction, SimError> {
        self.reactions
            .get(id)
            .ok_or_else(|| SimError::NotFound(format!("reaction id {}", id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reaction> {
        self.reactions.iter()
    }

    pub fn mode(&self, id: ReactionId) -> Option<SimulationMode> {
        self.reactions.get(id).map(Reaction::mode)
    }

    pub fn discrete_ids(&self) -> Vec<ReactionId> {
        self.reactions
            .iter()
            .enumerate()
            .filter(|(_, reaction)| reaction.mode == SimulationMode::Discrete)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn ssa_propensity(&self, state: &[f64], parameters: &[f64], propensities: &mut [f64]) {
        for (out, reaction) in propensities.iter_mut().zip(self.reactions.iter()) {
            *out = match reaction.mode {
                SimulationMode::Discrete => reaction.ssa_propensity(state, parameters),
                SimulationMode::Continuous => 0.0,
            };
        }
    }

    pub fn propensity_sum(&self, state: &[f64], parameters: &[f64]) -> f64 {
        self.reactions
            .iter()
            .map(|reaction| reaction.ode_propensity(state, parameters))
            .sum()
    }

    pub(crate) fn validate(&self, n_species: usize) -> Result<(), SimError> {
        for reaction in &self.reactions {
            for participant in reaction.reactants.iter().chain(reaction.products.iter()) {
                if participant.species >= n_species {
                    return Err(SimError::Shape(format!(
                        "reaction '{}' refers to species {} but only {} species exist",
                        reaction.name, participant.species, n_species
                    )));
                }
            }
        }
        Ok(())
    }
}
