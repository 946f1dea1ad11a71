//! Numerical ODE capability used by the integrator: adaptive stepping to a
//! target time with root detection on a vector of scalar functions of state.

use std::mem;

use thiserror::Error;
use tracing::trace;

use crate::integrator::IntegratorConfiguration;

pub trait OdeSystem {
    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]);

    /// Root functions; a root is a change of `g[i] < 0` between two points.
    fn roots(&self, t: f64, y: &[f64], gout: &mut [f64]);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineReturn {
    Reached,
    Root,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("engine used before being initialised")]
    Uninitialized,
    #[error("root information requested but no root functions are installed")]
    NoRootFunctions,
    #[error("target time {target} lies before current time {current}")]
    BackwardTarget { target: f64, current: f64 },
    #[error("step size collapsed to {step:e} at t = {t}")]
    StepTooSmall { t: f64, step: f64 },
    #[error("more than {0} steps taken before reaching the target time")]
    TooMuchWork(usize),
}

pub trait OdeEngine: Send {
    fn reinit(&mut self, t0: f64, y0: &[f64]);

    fn configure(&mut self, config: &IntegratorConfiguration);

    fn root_init(&mut self, num_roots: usize);

    fn solve(&mut self, system: &dyn OdeSystem, tout: f64) -> Result<EngineReturn, EngineError>;

    /// Per-root direction of the last reported crossing: `1` rising, `-1`
    /// falling, `0` none.
    fn root_info(&self) -> Result<&[i8], EngineError>;

    fn time(&self) -> f64;

    fn state(&self) -> &[f64];
}

const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;

/// Explicit Runge-Kutta 5(4) pair of Dormand and Prince with adaptive step
/// control. Roots are bracketed per accepted step and refined by bisection on
/// a cubic Hermite interpolant of the step.
#[derive(Clone, Debug)]
pub struct DormandPrince {
    t: f64,
    y: Vec<f64>,
    h: f64,
    initialized: bool,
    derivative_valid: bool,
    roots_valid: bool,

    rel_tol: f64,
    abs_tol: f64,
    max_step: f64,
    max_num_steps: usize,
    root_tol: f64,

    num_roots: usize,
    g_prev: Vec<f64>,
    g_new: Vec<f64>,
    g_mid: Vec<f64>,
    root_info: Vec<i8>,

    // k[0] holds f(t, y); after an accepted step k[6] holds f(t + h, y_new).
    k: [Vec<f64>; 7],
    y_stage: Vec<f64>,
    y_new: Vec<f64>,
    y_mid: Vec<f64>,

    accepted_steps: u64,
    rejected_steps: u64,
}

impl Default for DormandPrince {
    fn default() -> Self {
        Self::new(&IntegratorConfiguration::default())
    }
}

impl DormandPrince {
    pub fn new(config: &IntegratorConfiguration) -> Self {
        Self {
            t: 0.0,
            y: Vec::new(),
            h: 0.0,
            initialized: false,
            derivative_valid: false,
            roots_valid: false,
            rel_tol: config.rel_tol,
            abs_tol: config.abs_tol,
            max_step: config.max_step,
            max_num_steps: config.max_num_steps,
            root_tol: config.root_tol,
            num_roots: 0,
            g_prev: Vec::new(),
            g_new: Vec::new(),
            g_mid: Vec::new(),
            root_info: Vec::new(),
            k: Default::default(),
            y_stage: Vec::new(),
            y_new: Vec::new(),
            y_mid: Vec::new(),
            accepted_steps: 0,
            rejected_steps: 0,
        }
    }

    pub fn accepted_steps(&self) -> u64 {
        self.accepted_steps
    }

    pub fn rejected_steps(&self) -> u64 {
        self.rejected_steps
    }

    fn step_cap(&self) -> f64 {
        if self.max_step > 0.0 { self.max_step } else { f64::INFINITY }
    }

    fn weighted_rms(&self, v: &[f64], scale_from: &[f64]) -> f64 {
        if v.is_empty() {
            return 0.0;
        }
        let sum: f64 = v
            .iter()
            .zip(scale_from)
            .map(|(vi, yi)| {
                let sc = self.abs_tol + self.rel_tol * yi.abs();
                (vi / sc).powi(2)
            })
            .sum();
        (sum / v.len() as f64).sqrt()
    }

    fn initial_step(&mut self, system: &dyn OdeSystem, span: f64) -> f64 {
        let d0 = self.weighted_rms(&self.y, &self.y);
        let d1 = self.weighted_rms(&self.k[0], &self.y);
        let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };
        let h0 = h0.min(span);

        for ((stage, yi), fi) in self.y_stage.iter_mut().zip(&self.y).zip(&self.k[0]) {
            *stage = yi + h0 * fi;
        }
        system.rhs(self.t + h0, &self.y_stage, &mut self.k[1]);
        let diff: Vec<f64> = self.k[1]
            .iter()
            .zip(&self.k[0])
            .map(|(a, b)| (a - b) / h0)
            .collect();
        let d2 = self.weighted_rms(&diff, &self.y);

        let h1 = if d1.max(d2) <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(0.2)
        };
        (100.0 * h0).min(h1).min(span).min(self.step_cap())
    }

    fn attempt(&mut self, system: &dyn OdeSystem, h: f64) -> f64 {
        let t = self.t;
        let n = self.y.len();
        let [k1, k2, k3, k4, k5, k6, k7] = &mut self.k;
        let y = &self.y;
        let ys = &mut self.y_stage;

        for i in 0..n {
            ys[i] = y[i] + h * A21 * k1[i];
        }
        system.rhs(t + C2 * h, ys, k2);
        for i in 0..n {
            ys[i] = y[i] + h * (A31 * k1[i] + A32 * k2[i]);
        }
        system.rhs(t + C3 * h, ys, k3);
        for i in 0..n {
            ys[i] = y[i] + h * (A41 * k1[i] + A42 * k2[i] + A43 * k3[i]);
        }
        system.rhs(t + C4 * h, ys, k4);
        for i in 0..n {
            ys[i] = y[i] + h * (A51 * k1[i] + A52 * k2[i] + A53 * k3[i] + A54 * k4[i]);
        }
        system.rhs(t + C5 * h, ys, k5);
        for i in 0..n {
            ys[i] = y[i]
                + h * (A61 * k1[i] + A62 * k2[i] + A63 * k3[i] + A64 * k4[i] + A65 * k5[i]);
        }
        system.rhs(t + h, ys, k6);
        for i in 0..n {
            self.y_new[i] =
                y[i] + h * (B1 * k1[i] + B3 * k3[i] + B4 * k4[i] + B5 * k5[i] + B6 * k6[i]);
        }
        system.rhs(t + h, &self.y_new, k7);

        for i in 0..n {
            ys[i] = h
                * (E1 * k1[i] + E3 * k3[i] + E4 * k4[i] + E5 * k5[i] + E6 * k6[i] + E7 * k7[i]);
        }
        let mut sum = 0.0;
        for i in 0..n {
            let sc = self.abs_tol + self.rel_tol * y[i].abs().max(self.y_new[i].abs());
            sum += (ys[i] / sc).powi(2);
        }
        if n == 0 { 0.0 } else { (sum / n as f64).sqrt() }
    }

    /// Bisects `[t_lo, t_hi]` for the earliest change of root signs relative
    /// to `g_prev`. On return `y_mid` and `g_new` describe the right end of
    /// the final bracket, which is returned.
    fn locate_root(&mut self, system: &dyn OdeSystem, t_lo: f64, t_hi: f64) -> f64 {
        let h = t_hi - t_lo;
        let mut lo = t_lo;
        let mut hi = t_hi;
        self.y_mid.copy_from_slice(&self.y_new);

        while hi - lo > self.root_tol.max(f64::EPSILON * hi.abs()) {
            let mid = 0.5 * (lo + hi);
            let theta = (mid - t_lo) / h;
            hermite(&self.y, &self.k[0], &self.y_new, &self.k[6], h, theta, &mut self.y_stage);
            system.roots(mid, &self.y_stage, &mut self.g_mid);
            if sign_changed(&self.g_prev, &self.g_mid) {
                hi = mid;
                mem::swap(&mut self.g_new, &mut self.g_mid);
                self.y_mid.copy_from_slice(&self.y_stage);
            } else {
                lo = mid;
            }
        }
        hi
    }
}

impl OdeEngine for DormandPrince {
    fn reinit(&mut self, t0: f64, y0: &[f64]) {
        let n = y0.len();
        self.t = t0;
        self.y.clear();
        self.y.extend_from_slice(y0);
        for buffer in self
            .k
            .iter_mut()
            .chain([&mut self.y_stage, &mut self.y_new, &mut self.y_mid])
        {
            buffer.resize(n, 0.0);
        }
        self.h = 0.0;
        self.initialized = true;
        self.derivative_valid = false;
        self.roots_valid = false;
        self.root_info.fill(0);
    }

    fn configure(&mut self, config: &IntegratorConfiguration) {
        self.rel_tol = config.rel_tol;
        self.abs_tol = config.abs_tol;
        self.max_step = config.max_step;
        self.max_num_steps = config.max_num_steps;
        self.root_tol = config.root_tol;
        if self.max_step > 0.0 {
            self.h = self.h.min(self.max_step);
        }
    }

    fn root_init(&mut self, num_roots: usize) {
        self.num_roots = num_roots;
        self.g_prev = vec![0.0; num_roots];
        self.g_new = vec![0.0; num_roots];
        self.g_mid = vec![0.0; num_roots];
        self.root_info = vec![0; num_roots];
        self.roots_valid = false;
    }

    fn solve(&mut self, system: &dyn OdeSystem, tout: f64) -> Result<EngineReturn, EngineError> {
        if !self.initialized {
            return Err(EngineError::Uninitialized);
        }
        if tout < self.t {
            return Err(EngineError::BackwardTarget {
                target: tout,
                current: self.t,
            });
        }
        self.root_info.fill(0);
        if !self.derivative_valid {
            system.rhs(self.t, &self.y, &mut self.k[0]);
            self.derivative_valid = true;
        }
        if self.num_roots > 0 && !self.roots_valid {
            system.roots(self.t, &self.y, &mut self.g_prev);
            self.roots_valid = true;
        }
        if tout == self.t {
            return Ok(EngineReturn::Reached);
        }
        if self.h <= 0.0 {
            self.h = self.initial_step(system, tout - self.t);
        }

        let mut steps = 0;
        loop {
            steps += 1;
            if steps > self.max_num_steps {
                return Err(EngineError::TooMuchWork(self.max_num_steps));
            }

            let mut h = self.h.min(self.step_cap());
            let last = self.t + h >= tout;
            if last {
                h = tout - self.t;
            }

            let err = self.attempt(system, h);
            if err.is_nan() || err > 1.0 {
                self.rejected_steps += 1;
                let factor = if err.is_finite() {
                    (SAFETY * err.powf(-0.2)).max(MIN_FACTOR)
                } else {
                    MIN_FACTOR
                };
                self.h = h * factor;
                if self.h <= 16.0 * f64::EPSILON * self.t.abs().max(1.0) {
                    return Err(EngineError::StepTooSmall {
                        t: self.t,
                        step: self.h,
                    });
                }
                continue;
            }

            self.accepted_steps += 1;
            let factor = if err == 0.0 {
                MAX_FACTOR
            } else {
                (SAFETY * err.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
            };
            let t_new = if last { tout } else { self.t + h };
            // A step shortened to land on `tout` says nothing about the
            // size the next interval can afford.
            if !last || h >= self.h {
                self.h = h * factor;
            }

            if self.num_roots > 0 {
                system.roots(t_new, &self.y_new, &mut self.g_new);
                if sign_changed(&self.g_prev, &self.g_new) {
                    let t_root = self.locate_root(system, self.t, t_new);
                    for ((info, before), after) in
                        self.root_info.iter_mut().zip(&self.g_prev).zip(&self.g_new)
                    {
                        *info = match (*before < 0.0, *after < 0.0) {
                            (true, false) => 1,
                            (false, true) => -1,
                            _ => 0,
                        };
                    }
                    trace!(t = t_root, "root located");
                    self.t = t_root;
                    mem::swap(&mut self.y, &mut self.y_mid);
                    mem::swap(&mut self.g_prev, &mut self.g_new);
                    system.rhs(self.t, &self.y, &mut self.k[0]);
                    return Ok(EngineReturn::Root);
                }
                mem::swap(&mut self.g_prev, &mut self.g_new);
            }

            self.t = t_new;
            mem::swap(&mut self.y, &mut self.y_new);
            self.k.swap(0, 6);
            if last {
                return Ok(EngineReturn::Reached);
            }
        }
    }

    fn root_info(&self) -> Result<&[i8], EngineError> {
        if self.num_roots == 0 {
            return Err(EngineError::NoRootFunctions);
        }
        Ok(&self.root_info)
    }

    fn time(&self) -> f64 {
        self.t
    }

    fn state(&self) -> &[f64] {
        &self.y
    }
}

#[inline]
fn sign_changed(before: &[f64], after: &[f64]) -> bool {
    before
        .iter()
        .zip(after)
        .any(|(b, a)| (*b < 0.0) != (*a < 0.0))
}

/// Cubic Hermite interpolation over one step of size `h` at `theta` in [0, 1].
///
/// Written relative to `y0` so components with no change stay bit-exact.
fn hermite(y0: &[f64], f0: &[f64], y1: &[f64], f1: &[f64], h: f64, theta: f64, out: &mut [f64]) {
    let t2 = theta * theta;
    let t3 = t2 * theta;
    let h10 = t3 - 2.0 * t2 + theta;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    for i in 0..out.len() {
        out[i] = y0[i] + h01 * (y1[i] - y0[i]) + h * (h10 * f0[i] + h11 * f1[i]);
    }
}
