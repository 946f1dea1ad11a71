use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::debug;

use crate::integrator::IntegratorConfiguration;
use crate::model::Model;
use crate::solver::{HybridSolver, SolverConfiguration};
use crate::{SimError, TIME_EPSILON, derive_seed};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    Timeseries,
    FinalOnly,
}

#[derive(Clone, Debug)]
pub struct SimulationOptions {
    pub t_end: f64,
    pub t_points: Vec<f64>,
    pub mode: OutputMode,
    pub integrator: IntegratorConfiguration,
}

impl SimulationOptions {
    pub fn new(
        t_end: f64,
        t_points: Vec<f64>,
        mode: Option<&str>,
        integrator: IntegratorConfiguration,
    ) -> Result<Self, SimError> {
        if !(t_end.is_finite() && t_end > 0.0) {
            return Err(SimError::InvalidArgument("t_end must be positive".into()));
        }
        let t_points = parse_t_points(t_points)?;
        let mode = parse_mode(mode, !t_points.is_empty())?;
        integrator.validate()?;
        Ok(Self {
            t_end,
            t_points,
            mode,
            integrator,
        })
    }

    fn n_times(&self) -> usize {
        match self.mode {
            OutputMode::Timeseries => self.t_points.len(),
            OutputMode::FinalOnly => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimulationOutput {
    pub data: Vec<f64>,
    pub reaction_counts: Vec<u64>,
    pub n_traj: usize,
    pub n_species: usize,
    pub n_reactions: usize,
    pub n_times: usize,
    pub mode: OutputMode,
}

impl SimulationOutput {
    pub fn trajectory(&self, traj: usize) -> &[f64] {
        let stride = self.n_times * self.n_species;
        &self.data[traj * stride..(traj + 1) * stride]
    }

    pub fn counts(&self, traj: usize) -> &[u64] {
        &self.reaction_counts[traj * self.n_reactions..(traj + 1) * self.n_reactions]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrajectoryRecord {
    pub states: Vec<f64>,
    pub reaction_counts: Vec<u64>,
}

struct StateRecorder<'a> {
    buffer: &'a mut [f64],
    write_idx: usize,
}

impl<'a> StateRecorder<'a> {
    fn new(buffer: &'a mut [f64]) -> Self {
        Self {
            buffer,
            write_idx: 0,
        }
    }

    fn record(&mut self, state: &[f64]) {
        let end = self.write_idx + state.len();
        debug_assert!(end <= self.buffer.len());
        self.buffer[self.write_idx..end].copy_from_slice(state);
        self.write_idx = end;
    }

    fn len(&self) -> usize {
        self.write_idx
    }
}

/// Simulates `n_trajectories` independent runs of `model` in parallel.
///
/// Trajectory `i` is seeded with `derive_seed(seed, i)`, so results do not
/// depend on the thread count.
pub fn run_ensemble(
    model: &Model,
    options: &SimulationOptions,
    n_trajectories: usize,
    n_threads: Option<usize>,
    seed: Option<u64>,
) -> Result<SimulationOutput, SimError> {
    if n_trajectories == 0 {
        return Err(SimError::InvalidArgument(
            "number of trajectories must be greater than zero".into(),
        ));
    }

    let n_species = model.n_species();
    let n_reactions = model.n_reactions();
    let n_times = options.n_times();
    let stride = n_times * n_species;
    let mut data = vec![0.0; n_trajectories * stride];

    let run = |traj_idx: usize, chunk: &mut [f64]| -> Result<Vec<u64>, SimError> {
        let config = SolverConfiguration {
            random_seed: derive_seed(seed, traj_idx as u64),
            integrator: options.integrator.clone(),
        };
        let solver = simulate_single_into(model, options, config, chunk)?;
        debug!(traj_idx, t = solver.time(), "trajectory finished");
        Ok(solver.reaction_counts().to_vec())
    };

    let mut simulate = || -> Result<Vec<Vec<u64>>, SimError> {
        if stride == 0 {
            (0..n_trajectories)
                .into_par_iter()
                .map(|traj_idx| run(traj_idx, &mut []))
                .collect()
        } else {
            data.par_chunks_mut(stride)
                .enumerate()
                .map(|(traj_idx, chunk)| run(traj_idx, chunk))
                .collect()
        }
    };

    let per_trajectory = match n_threads {
        Some(n) => ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| SimError::ThreadPool(e.to_string()))?
            .install(|| simulate())?,
        None => simulate()?,
    };
    let counts: Vec<u64> = per_trajectory.into_iter().flatten().collect();

    Ok(SimulationOutput {
        data,
        reaction_counts: counts,
        n_traj: n_trajectories,
        n_species,
        n_reactions,
        n_times,
        mode: options.mode,
    })
}

pub fn simulate_single(
    model: &Model,
    options: &SimulationOptions,
    seed: u64,
) -> Result<TrajectoryRecord, SimError> {
    let mut states = vec![0.0; options.n_times() * model.n_species()];
    let config = SolverConfiguration {
        random_seed: seed,
        integrator: options.integrator.clone(),
    };
    let solver = simulate_single_into(model, options, config, &mut states)?;
    Ok(TrajectoryRecord {
        states,
        reaction_counts: solver.reaction_counts().to_vec(),
    })
}

fn simulate_single_into(
    model: &Model,
    options: &SimulationOptions,
    config: SolverConfiguration,
    output: &mut [f64],
) -> Result<HybridSolver, SimError> {
    let mut solver = HybridSolver::new(model, config)?;
    let mut recorder = StateRecorder::new(output);
    let mut next_idx = 0;

    record_due(options, &mut next_idx, &solver, &mut recorder);
    if options.mode == OutputMode::Timeseries {
        while let Some(&tp) = options.t_points.get(next_idx) {
            if tp > options.t_end {
                break;
            }
            solver.integrate_to(tp.max(solver.time()))?;
            record_due(options, &mut next_idx, &solver, &mut recorder);
        }
    }
    if solver.time() < options.t_end {
        solver.integrate_to(options.t_end)?;
    }
    finalize_recording(options, &mut recorder, solver.concentrations());
    Ok(solver)
}

#[inline]
fn record_due(
    options: &SimulationOptions,
    next_idx: &mut usize,
    solver: &HybridSolver,
    recorder: &mut StateRecorder<'_>,
) {
    if options.mode != OutputMode::Timeseries {
        return;
    }
    while let Some(&tp) = options.t_points.get(*next_idx) {
        if solver.time() + TIME_EPSILON >= tp {
            recorder.record(solver.concentrations());
            *next_idx += 1;
        } else {
            break;
        }
    }
}

fn finalize_recording(
    options: &SimulationOptions,
    recorder: &mut StateRecorder<'_>,
    state: &[f64],
) {
    match options.mode {
        OutputMode::Timeseries => {
            let target_len = options.t_points.len() * state.len();
            while recorder.len() < target_len {
                recorder.record(state);
            }
        }
        OutputMode::FinalOnly => {
            if recorder.len() < state.len() {
                recorder.record(state);
            }
        }
    }
}

fn parse_t_points(t_points: Vec<f64>) -> Result<Vec<f64>, SimError> {
    if t_points.iter().any(|tp| !tp.is_finite()) {
        return Err(SimError::InvalidArgument("t_points must be finite".into()));
    }
    if t_points.windows(2).any(|w| w[0] > w[1] + TIME_EPSILON) {
        return Err(SimError::InvalidArgument(
            "t_points must be sorted in ascending order".into(),
        ));
    }
    Ok(t_points)
}

pub fn parse_mode(mode: Option<&str>, has_t_points: bool) -> Result<OutputMode, SimError> {
    match mode {
        Some(m) if m.eq_ignore_ascii_case("final") => Ok(OutputMode::FinalOnly),
        Some(m) if m.eq_ignore_ascii_case("timeseries") => {
            if !has_t_points {
                Err(SimError::InvalidArgument(
                    "timeseries mode requires t_points".into(),
                ))
            } else {
                Ok(OutputMode::Timeseries)
            }
        }
        Some(other) => Err(SimError::InvalidArgument(format!(
            "unrecognized mode '{}'",
            other
        ))),
        None => {
            if has_t_points {
                Ok(OutputMode::Timeseries)
            } else {
                Ok(OutputMode::FinalOnly)
            }
        }
    }
}
