//! Collapsed EM and variational Bayes EM over equivalence classes.
//!
//! Once the online phase is over, abundances are refined by batch EM on the
//! collapsed representation. Each iteration is one parallel pass over the
//! classes. Within a pass the input vector is read-only and the output vector
//! is accumulated atomically, then the two are swapped.
//!
//! Iteration stops once every transcript above the cutoff changes by less
//! than the relative tolerance, or after the maximum number of iterations.
//! Alphas at or below the cutoff are then zeroed and the rest renormalised to
//! the number of fragments in the classes.
use rayon::prelude::*;
use statrs::function::gamma::digamma;

use crate::eq_class::{mark_degenerate_classes, update_weights, EqClass};
use crate::error::QuantError;
use crate::math::{atomic_vec, AtomicF64, MIN_WEIGHT};
use crate::transcript::Transcript;

/// Dirichlet prior concentration used by VBEM
pub const PRIOR_ALPHA: f64 = 0.01;
/// Alphas at or below this (plus the prior in VBEM) are truncated to zero
pub const MIN_ALPHA: f64 = 1e-8;
/// Default iteration limit
pub const DEFAULT_MAX_ITER: usize = 1000;
/// Default relative change required for convergence
pub const DEFAULT_REL_DIFF_TOLERANCE: f64 = 0.01;

/// Scale `vec` in place to sum to one. Returns the original sum.
///
/// A vector whose sum is below [`MIN_WEIGHT`] is left untouched.
pub fn normalize(vec: &mut [f64]) -> f64 {
    let sum: f64 = vec.iter().sum();
    if sum < MIN_WEIGHT {
        return sum;
    }
    let inv_sum = 1.0 / sum;
    vec.iter_mut().for_each(|v| *v *= inv_sum);
    sum
}

/// One EM pass: distribute every valid class's count to its members in
/// proportion to `alpha_in[t] * weight`.
///
/// `alpha_out` must start at zero.
pub fn em_update(classes: &[EqClass], alpha_in: &[f64], alpha_out: &[AtomicF64]) {
    classes.par_iter().filter(|c| c.valid).for_each(|class| {
        let count = class.count as f64;
        if class.label.len() == 1 {
            alpha_out[class.label[0] as usize].fetch_add(count);
            return;
        }
        let denom = class.weighted_denom(alpha_in);
        if denom <= MIN_WEIGHT {
            return;
        }
        let inv_denom = count / denom;
        for (tid, w) in class.label.iter().zip(class.weights.iter()) {
            let v = alpha_in[*tid as usize] * w;
            if !v.is_nan() {
                alpha_out[*tid as usize].fetch_add(v * inv_denom);
            }
        }
    });
}

/// One VBEM pass.
///
/// Members are weighted by `exp(digamma(alpha_in[t]) - digamma(sum(alpha_in)))`
/// instead of `alpha_in[t]`, and every output is reseeded with `prior_alpha`
/// first. `exp_theta` is scratch space of the same length as `alpha_in`.
pub fn vbem_update(
    classes: &[EqClass],
    alpha_in: &[f64],
    alpha_out: &[AtomicF64],
    exp_theta: &mut [f64],
    prior_alpha: f64,
) {
    let alpha_sum: f64 = alpha_in.iter().sum();
    let log_norm = digamma(alpha_sum);

    exp_theta
        .par_iter_mut()
        .zip(alpha_out.par_iter())
        .enumerate()
        .for_each(|(i, (theta, out))| {
            *theta = if alpha_in[i] > MIN_WEIGHT {
                (digamma(alpha_in[i]) - log_norm).exp()
            } else {
                0.0
            };
            out.store(prior_alpha);
        });

    let exp_theta: &[f64] = exp_theta;
    classes.par_iter().filter(|c| c.valid).for_each(|class| {
        let count = class.count as f64;
        if class.label.len() == 1 {
            alpha_out[class.label[0] as usize].fetch_add(count);
            return;
        }
        let denom: f64 = class
            .label
            .iter()
            .zip(class.weights.iter())
            .filter(|(tid, _)| exp_theta[**tid as usize] > 0.0)
            .map(|(tid, w)| exp_theta[*tid as usize] * w)
            .sum();
        if denom <= MIN_WEIGHT {
            return;
        }
        let inv_denom = count / denom;
        for (tid, w) in class.label.iter().zip(class.weights.iter()) {
            let theta = exp_theta[*tid as usize];
            if theta > 0.0 {
                alpha_out[*tid as usize].fetch_add(theta * w * inv_denom);
            }
        }
    });
}

/// Settings for [`run_em`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmOptions {
    /// Use VBEM rather than EM
    pub use_vbem: bool,
    /// Iteration limit
    pub max_iter: usize,
    /// Relative change below which a transcript has converged
    pub rel_diff_tolerance: f64,
    /// VBEM prior concentration
    pub prior_alpha: f64,
}

impl Default for EmOptions {
    fn default() -> Self {
        Self {
            use_vbem: false,
            max_iter: DEFAULT_MAX_ITER,
            rel_diff_tolerance: DEFAULT_REL_DIFF_TOLERANCE,
            prior_alpha: PRIOR_ALPHA,
        }
    }
}

impl EmOptions {
    /// Alphas at or below this are ignored by the convergence check and
    /// truncated at the end
    pub fn cutoff(&self) -> f64 {
        if self.use_vbem {
            self.prior_alpha + MIN_ALPHA
        } else {
            MIN_ALPHA
        }
    }
}

/// Outcome of [`run_em`]
#[derive(Debug, Clone, PartialEq)]
pub struct EmResult {
    /// Final alphas, before truncation
    pub alphas: Vec<f64>,
    /// Passes made
    pub iterations: usize,
    /// Whether the tolerance was met before the iteration limit
    pub converged: bool,
    /// Largest relative change in the last pass
    pub max_rel_diff: f64,
}

/// Iterate EM (or VBEM) from `alphas` until convergence or `max_iter`.
pub fn run_em(classes: &[EqClass], mut alphas: Vec<f64>, opts: &EmOptions) -> EmResult {
    let n = alphas.len();
    let cutoff = opts.cutoff();
    let alphas_prime = atomic_vec(n, 0.0);
    let mut exp_theta = vec![0.0; n];

    let mut iterations = 0;
    let mut converged = false;
    let mut max_rel_diff = f64::NEG_INFINITY;
    while iterations < opts.max_iter && !converged {
        if opts.use_vbem {
            vbem_update(
                classes,
                &alphas,
                &alphas_prime,
                &mut exp_theta,
                opts.prior_alpha,
            );
        } else {
            em_update(classes, &alphas, &alphas_prime);
        }

        converged = true;
        max_rel_diff = f64::NEG_INFINITY;
        for (alpha, prime) in alphas.iter_mut().zip(alphas_prime.iter()) {
            let next = prime.load();
            if *alpha > cutoff {
                let rel_diff = (*alpha - next).abs() / next;
                max_rel_diff = f64::max(max_rel_diff, rel_diff);
                if rel_diff > opts.rel_diff_tolerance {
                    converged = false;
                }
            }
            *alpha = next;
            prime.store(0.0);
        }

        if iterations % 100 == 0 {
            log::info!("iteration = {iterations} | max rel diff. = {max_rel_diff}");
        }
        iterations += 1;
    }
    log::info!("iteration = {iterations} | max rel diff. = {max_rel_diff}");

    EmResult {
        alphas,
        iterations,
        converged,
        max_rel_diff,
    }
}

/// Summary of an optimizer run
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeSummary {
    /// EM passes made
    pub iterations: usize,
    /// Whether the tolerance was met
    pub converged: bool,
    /// Classes excluded as degenerate
    pub num_degenerate: usize,
    /// Sum of the final estimated counts
    pub total_count: f64,
}

/// Final abundance estimation from equivalence classes
#[derive(Debug, Clone, Default)]
pub struct CollapsedEmOptimizer {
    opts: EmOptions,
    no_eff_len_correction: bool,
}

impl CollapsedEmOptimizer {
    /// New optimizer
    pub fn new(opts: EmOptions, no_eff_len_correction: bool) -> Self {
        Self {
            opts,
            no_eff_len_correction,
        }
    }

    /// Estimate abundances and write them to `transcripts`.
    ///
    /// Every transcript in at least one class is marked active and starts from
    /// an equal share of `total_frags`. Class weights are refreshed from the
    /// current effective lengths and degenerate classes are excluded before
    /// iterating.
    ///
    /// # Errors
    /// [`QuantError::NoActiveTranscripts`] if no class names a transcript, and
    /// [`QuantError::InsufficientMass`] if nothing is left after truncation.
    pub fn optimize(
        &self,
        transcripts: &mut [Transcript],
        classes: &mut [EqClass],
        total_frags: f64,
    ) -> Result<OptimizeSummary, QuantError> {
        let mut in_class = vec![false; transcripts.len()];
        for class in classes.iter() {
            for tid in &class.label {
                in_class[*tid as usize] = true;
            }
        }
        let num_active = in_class.iter().filter(|a| **a).count();
        log::info!("Optimizing over {} equivalence classes", classes.len());
        if num_active == 0 {
            log::error!("It seems that no transcripts are expressed; something is likely wrong!");
            return Err(QuantError::NoActiveTranscripts);
        }
        for (t, active) in transcripts.iter().zip(in_class.iter()) {
            if *active {
                t.set_active(true);
            }
        }

        let scale = total_frags / num_active as f64;
        let alphas: Vec<f64> = in_class
            .iter()
            .map(|active| if *active { scale } else { 0.0 })
            .collect();

        update_weights(classes, transcripts, self.no_eff_len_correction);
        let num_degenerate = mark_degenerate_classes(classes, &alphas);
        log::info!("Marked {num_degenerate} weighted equivalence classes as degenerate");

        let result = run_em(classes, alphas, &self.opts);
        let mut alphas = result.alphas;

        let cutoff = self.opts.cutoff();
        alphas.iter_mut().for_each(|a| {
            if *a <= cutoff {
                *a = 0.0;
            }
        });
        let alpha_sum: f64 = alphas.iter().sum();
        if alpha_sum < MIN_WEIGHT {
            log::error!("Total alpha weight was too small! Make sure the reads map to the reference.");
            return Err(QuantError::InsufficientMass(alpha_sum));
        }

        let total: f64 = classes
            .iter()
            .filter(|c| c.valid)
            .map(|c| c.count as f64)
            .sum();
        let count_scale = if total > 0.0 { total / alpha_sum } else { 1.0 };
        for (t, alpha) in transcripts.iter_mut().zip(alphas.iter()) {
            t.est_count = alpha * count_scale;
            t.projected_mass = alpha / alpha_sum;
        }

        Ok(OptimizeSummary {
            iterations: result.iterations,
            converged: result.converged,
            num_degenerate,
            total_count: alpha_sum * count_scale,
        })
    }
}
