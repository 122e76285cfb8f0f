//! Simulation clock and adaptive timestep control.

use rayon::prelude::*;

use crate::{
    body::Body,
    comm::Comm,
    config::SphConfig,
    constants::MAX_TIMESTEP_HALVINGS,
    error::{Result, SphError},
};

/// Timestep, iteration count and elapsed time of a run.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SimulationState {
    /// Current timestep.
    pub dt: f64,
    /// Number of completed steps.
    pub iteration: u64,
    /// Simulated time.
    pub total_time: f64,
    /// Cap on the halvings of a candidate timestep.
    pub max_halvings: u32,
}

impl SimulationState {
    /// Start a run with timestep `dt`.
    pub fn new(dt: f64) -> Self {
        Self {
            dt,
            iteration: 0,
            total_time: 0.0,
            max_halvings: MAX_TIMESTEP_HALVINGS,
        }
    }

    /// Start a run with the initial timestep and halving cap of `config`.
    pub fn from_config(config: &SphConfig) -> Self {
        Self {
            max_halvings: config.max_timestep_halvings,
            ..Self::new(config.initial_dt)
        }
    }

    /// Halve `candidate` until `accept` holds, at most `max_halvings` times.
    pub fn limit_timestep<F: Fn(f64) -> bool>(&self, candidate: f64, accept: F) -> Result<f64> {
        halve_until(candidate, self.max_halvings, accept)
    }

    /// Complete one step of length `dt`.
    pub fn advance(&mut self) {
        self.iteration += 1;
        self.total_time += self.dt;
    }

    /// Adapt the timestep to the smallest particle timestep of all ranks.
    ///
    /// If the global minimum is below the current timestep, the timestep
    /// drops to the minimum but at least by half. If it is more than twice
    /// the current timestep, the timestep doubles. Returns the new timestep.
    pub fn adapt_timestep<C: Comm>(&mut self, local_min: f64, comm: &C) -> f64 {
        let dtmin = comm.all_reduce(&[local_min], f64::min)[0];

        if !dtmin.is_finite() {
            return self.dt;
        }

        if dtmin < self.dt {
            self.dt = f64::min(dtmin, self.dt / 2.0);
        }

        if dtmin > 2.0 * self.dt {
            self.dt *= 2.0;
        }

        if comm.rank() == 0 {
            tracing::debug!(dt = self.dt, dtmin, iteration = self.iteration, "adapted timestep");
        }

        self.dt
    }
}

/// Smallest timestep of the given particles. Infinite if there are none.
pub fn local_min_dt<const D: usize>(bodies: &[Body<D>]) -> f64 {
    bodies
        .par_iter()
        .map(|body| body.dt)
        .reduce(|| f64::INFINITY, f64::min)
}

/// Halve `candidate` until `accept` holds for it.
///
/// Fails if `accept` rejects the value reached after `cap` halvings.
pub fn halve_until<F: Fn(f64) -> bool>(candidate: f64, cap: u32, accept: F) -> Result<f64> {
    let mut dt = candidate;
    for _ in 0..=cap {
        if accept(dt) {
            return Ok(dt);
        }
        dt *= 0.5;
    }

    Err(SphError::Numerical(format!(
        "no acceptable timestep after {} halvings of {}",
        cap, candidate
    )))
}
