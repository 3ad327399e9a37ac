//! The forgetting-mass schedule.
//!
//! Every mini-batch of fragments is stamped with a global timestep and weighted
//! by the log mass at that timestep. With forgetting factor `f` the per-step
//! log mass obeys
//!
//! ```text
//! m[0] = 0
//! m[t] = m[t - 1] + f * ln(t) - ln((t + 1)^f - 1)
//! ```
//!
//! so that, relative to the newest batch, older batches decay as `t^-f`. A
//! factor of 1.0 gives every batch the same weight.
//!
//! The schedule is prefilled before the first batch and grows on demand if the
//! run outlasts the prefilled range.
use std::sync::Mutex;

use crate::math::log_add;

#[derive(Debug, Default)]
struct Schedule {
    timestep: u64,
    log_masses: Vec<f64>,
    cumulative: Vec<f64>,
}

impl Schedule {
    fn extend_to(&mut self, len: usize, forgetting_factor: f64) {
        if self.log_masses.is_empty() && len > 0 {
            self.log_masses.push(0.0);
            self.cumulative.push(0.0);
        }
        while self.log_masses.len() < len {
            let t = self.log_masses.len() as f64;
            let prev_mass = self.log_masses[self.log_masses.len() - 1];
            let prev_cumulative = self.cumulative[self.cumulative.len() - 1];
            let mass = prev_mass + forgetting_factor * t.ln()
                - ((t + 1.0).powf(forgetting_factor) - 1.0).ln();
            self.log_masses.push(mass);
            self.cumulative.push(log_add(prev_cumulative, mass));
        }
    }
}

/// Shared, explicitly passed schedule of per-batch log weights.
#[derive(Debug)]
pub struct ForgettingMassCalculator {
    forgetting_factor: f64,
    schedule: Mutex<Schedule>,
}

impl ForgettingMassCalculator {
    /// An empty schedule with decay `forgetting_factor`, in (0.5, 1.0]
    pub fn new(forgetting_factor: f64) -> Self {
        Self {
            forgetting_factor,
            schedule: Mutex::new(Schedule::default()),
        }
    }

    /// The decay exponent
    pub fn forgetting_factor(&self) -> f64 {
        self.forgetting_factor
    }

    /// Precompute the first `n` entries of the schedule.
    pub fn prefill(&self, n: usize) {
        let mut schedule = self.lock();
        schedule.extend_to(n, self.forgetting_factor);
        log::debug!(
            "Prefilled forgetting mass schedule with {} timesteps",
            schedule.log_masses.len()
        );
    }

    /// The next timestep to be handed out
    pub fn current_timestep(&self) -> u64 {
        self.lock().timestep
    }

    /// Claim a timestep, returning its log weight and the timestep itself.
    ///
    /// Both values are read under the same lock, and the counter then advances
    /// by one.
    pub fn log_mass_and_timestep(&self) -> (f64, u64) {
        let mut schedule = self.lock();
        let t = schedule.timestep;
        let idx = t as usize;
        if idx >= schedule.log_masses.len() {
            let grow_to = usize::max(idx + 1, schedule.log_masses.len() * 2);
            schedule.extend_to(grow_to, self.forgetting_factor);
        }
        schedule.timestep += 1;
        (schedule.log_masses[idx], t)
    }

    /// Log of the total mass handed out to timesteps `0..=t`
    pub fn cumulative_log_mass_at(&self, t: u64) -> f64 {
        let mut schedule = self.lock();
        let idx = t as usize;
        if idx >= schedule.cumulative.len() {
            schedule.extend_to(idx + 1, self.forgetting_factor);
        }
        schedule.cumulative[idx]
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Schedule> {
        // A poisoned schedule is still consistent: every push completes
        // before the lock is released.
        match self.schedule.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
