//! Online fragment length distribution.
//!
//! A log-space histogram over lengths `0..=max_val`. It starts from a
//! discretised normal prior scaled by `alpha`. Each observation is smoothed
//! with a binomial kernel centred on the observed length before it is
//! log-added into the histogram. Normalisation is lazy: [`pmf`] and [`mean`]
//! divide by the running total when they are queried.
//!
//! All bins and totals are [`AtomicF64`] cells, so any number of workers can
//! call [`add_val`] concurrently.
//!
//! [`pmf`]: FragmentLengthDistribution::pmf
//! [`mean`]: FragmentLengthDistribution::mean
//! [`add_val`]: FragmentLengthDistribution::add_val
use std::sync::atomic::{AtomicUsize, Ordering};

use statrs::distribution::{Binomial, ContinuousCDF, Discrete, Normal};

use crate::error::QuantError;
use crate::math::{atomic_vec, log_add, AtomicF64, LOG_0};

/// Weight of the prior relative to one observation
pub const DEFAULT_FLD_ALPHA: f64 = 1.0;
/// Longest fragment tracked, longer fragments fall in the last bin
pub const DEFAULT_FLD_MAX: usize = 800;
/// Prior mean fragment length
pub const DEFAULT_FLD_MEAN: f64 = 200.0;
/// Prior standard deviation of fragment length
pub const DEFAULT_FLD_SD: f64 = 80.0;
/// Trials in the smoothing kernel
pub const DEFAULT_KERNEL_N: u64 = 4;
/// Success probability of the smoothing kernel
pub const DEFAULT_KERNEL_P: f64 = 0.5;

/// Histogram of fragment lengths, in log space
#[derive(Debug)]
pub struct FragmentLengthDistribution {
    hist: Vec<AtomicF64>,
    kernel: Vec<f64>,
    tot: AtomicF64,
    sum: AtomicF64,
    min: AtomicUsize,
}

impl FragmentLengthDistribution {
    /// Build the prior histogram.
    ///
    /// Bin `i` receives `alpha * (Phi(i + 0.5) - Phi(i - 0.5))` for a normal with
    /// the given mean and standard deviation. Bins whose prior underflows get
    /// `epsilon` instead, so that no length has zero probability.
    pub fn new(
        alpha: f64,
        max_val: usize,
        prior_mu: f64,
        prior_sigma: f64,
        kernel_n: u64,
        kernel_p: f64,
    ) -> Result<Self, QuantError> {
        if alpha <= 0.0 || max_val == 0 {
            return Err(QuantError::InvalidDistribution(format!(
                "alpha ({alpha}) and max length ({max_val}) must be positive"
            )));
        }
        let norm = Normal::new(prior_mu, prior_sigma)
            .map_err(|e| QuantError::InvalidDistribution(e.to_string()))?;
        let binom = Binomial::new(kernel_p, kernel_n)
            .map_err(|e| QuantError::InvalidDistribution(e.to_string()))?;

        let kernel: Vec<f64> = (0..=kernel_n).map(|k| binom.pmf(k).ln()).collect();

        let hist = atomic_vec(max_val + 1, LOG_0);
        let log_alpha = alpha.ln();
        let log_eps = f64::EPSILON.ln();
        let mut tot = LOG_0;
        let mut sum = LOG_0;
        for (i, bin) in hist.iter().enumerate() {
            let x = i as f64;
            let norm_mass = norm.cdf(x + 0.5) - norm.cdf(x - 0.5);
            let mass = if norm_mass > 0.0 {
                log_alpha + norm_mass.ln()
            } else {
                log_eps
            };
            bin.store(mass);
            sum = log_add(sum, x.ln() + mass);
            tot = log_add(tot, mass);
        }

        Ok(Self {
            hist,
            kernel,
            tot: AtomicF64::new(tot),
            sum: AtomicF64::new(sum),
            min: AtomicUsize::new(max_val),
        })
    }

    /// Add one observation of `len` with weight `log_mass`.
    ///
    /// Lengths above [`max_val`](Self::max_val) are counted in the last bin. A
    /// length of zero is ignored.
    pub fn add_val(&self, len: usize, log_mass: f64) {
        if len == 0 {
            return;
        }
        let len = usize::min(len, self.max_val());
        let half = self.kernel.len() / 2;
        for (i, k) in self.kernel.iter().enumerate() {
            let pos = len + i;
            if pos < half + 1 {
                continue;
            }
            let bin = pos - half;
            if bin >= self.hist.len() {
                break;
            }
            let k_mass = log_mass + k;
            self.hist[bin].log_add_assign(k_mass);
            self.sum.log_add_assign((bin as f64).ln() + k_mass);
            self.tot.log_add_assign(k_mass);
        }
        self.min.fetch_min(len, Ordering::AcqRel);
    }

    /// Log probability of a fragment of length `len`, clamped to `1..=max_val`
    pub fn pmf(&self, len: usize) -> f64 {
        let len = len.clamp(1, self.max_val());
        self.hist[len].load() - self.tot.load()
    }

    /// Log of the mean fragment length
    pub fn mean(&self) -> f64 {
        self.sum.load() - self.tot.load()
    }

    /// Shortest length observed so far, `max_val` before any observation
    pub fn min_val(&self) -> usize {
        self.min.load(Ordering::Acquire)
    }

    /// Longest representable length
    pub fn max_val(&self) -> usize {
        self.hist.len() - 1
    }

    /// Normalised probabilities for every length `0..=max_val`
    pub fn to_probs(&self) -> Vec<f64> {
        let tot = self.tot.load();
        self.hist.iter().map(|b| (b.load() - tot).exp()).collect()
    }
}
