//! Hybrid simulation of biochemical reaction networks.
//!
//! Continuous reactions and rate rules are integrated as ODEs while discrete
//! reactions fire stochastically at the roots of their integrated
//! propensities. Triggered, delayed and prioritised events are scheduled on
//! top of the integrator.

pub mod engine;
pub mod event;
pub mod event_state;
pub mod integrator;
pub mod model;
pub mod parameter_state;
pub mod reaction_state;
pub mod simulation;
pub mod solver;
pub mod species_state;

use thiserror::Error;

pub use event::{EventFunctions, EventId, EventOutput, EventStatus};
pub use event_state::EventState;
pub use integrator::{
    IntegrationResults, IntegrationStatus, Integrator, IntegratorConfiguration, URNGenerator,
};
pub use model::Model;
pub use parameter_state::ParameterState;
pub use reaction_state::{
    ExpressionPropensity, RateConstant, Reactant, Reaction, ReactionId, ReactionState,
    SimulationMode,
};
pub use simulation::{
    OutputMode, SimulationOptions, SimulationOutput, TrajectoryRecord, run_ensemble,
    simulate_single,
};
pub use solver::{HybridSolver, SolverConfiguration};
pub use species_state::SpeciesState;

/// Slack applied when comparing scheduled times against the current time.
pub const TIME_EPSILON: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("integration failed: {0}")]
    Integration(IntegrationStatus),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

/// Seed for trajectory `trajectory` of an ensemble started from `seed`.
pub fn derive_seed(seed: Option<u64>, trajectory: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;
    let base = seed.unwrap_or(0xDEADBEEFCAFEBABE);
    let mut z = base ^ (trajectory.wrapping_mul(GOLDEN_GAMMA));
    // SplitMix64
    z = z.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
