//! Per-transcript state shared by every worker.
//!
//! Mass is held in log space and accumulated with lock-free log-sum-exp. The
//! effective length is cached and only recomputed when enough new fragments
//! have been observed, because the computation is linear in transcript length.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::frag_len_dist::FragmentLengthDistribution;
use crate::math::{log_add, AtomicF64, LOG_0};

/// Default per-base prior on transcript abundance
pub const DEFAULT_PER_BASE_PRIOR: f64 = 0.05;

/// Observations between effective length recomputations
pub const EFF_LEN_UPDATE_INTERVAL: u64 = 250_000;

/// A reference transcript and its running abundance estimate
#[derive(Debug)]
pub struct Transcript {
    /// Index into the reference
    pub id: u32,
    /// Name from the reference FASTA
    pub name: String,
    /// Length in bases
    pub ref_length: u32,
    log_per_base_prior: f64,
    prior_mass: f64,
    mass: AtomicF64,
    shared_count: AtomicF64,
    unique_count: AtomicU64,
    total_count: AtomicU64,
    last_timestep_updated: AtomicU64,
    cached_eff_len: AtomicF64,
    last_update: AtomicU64,
    active: AtomicBool,
    /// Estimated number of reads, set by the optimizer
    pub est_count: f64,
    /// Relative abundance, set by the optimizer
    pub projected_mass: f64,
}

impl Transcript {
    /// New transcript with a per-base prior of `alpha`
    pub fn new(id: u32, name: &str, ref_length: u32, alpha: f64) -> Self {
        let len = ref_length as f64;
        Self {
            id,
            name: name.to_string(),
            ref_length,
            log_per_base_prior: alpha.ln(),
            prior_mass: (alpha * len).ln(),
            mass: AtomicF64::new(LOG_0),
            shared_count: AtomicF64::new(0.0),
            unique_count: AtomicU64::new(0),
            total_count: AtomicU64::new(0),
            last_timestep_updated: AtomicU64::new(0),
            cached_eff_len: AtomicF64::new(len.ln()),
            last_update: AtomicU64::new(0),
            active: AtomicBool::new(ref_length > 0),
            est_count: 0.0,
            projected_mass: 0.0,
        }
    }

    /// Log mass, optionally including the prior pseudo-mass
    pub fn mass(&self, with_prior: bool) -> f64 {
        if with_prior {
            log_add(self.prior_mass, self.mass.load())
        } else {
            self.mass.load()
        }
    }

    /// Log-add `log_mass` to the running mass
    pub fn add_mass(&self, log_mass: f64) {
        self.mass.log_add_assign(log_mass);
    }

    /// Fragments that mapped only to this transcript
    pub fn unique_count(&self) -> u64 {
        self.unique_count.load(Ordering::Relaxed)
    }

    /// All fragments that had this transcript as a candidate
    pub fn total_count(&self) -> u64 {
        self.total_count.load(Ordering::Relaxed)
    }

    /// Add to the unique count
    pub fn add_unique_count(&self, n: u64) {
        self.unique_count.fetch_add(n, Ordering::Relaxed);
    }

    /// Add to the total count
    pub fn add_total_count(&self, n: u64) {
        self.total_count.fetch_add(n, Ordering::Relaxed);
    }

    /// Fractional reads shared with other transcripts
    pub fn shared_count(&self) -> f64 {
        self.shared_count.load()
    }

    /// Add to the shared count
    pub fn add_shared_count(&self, count: f64) {
        self.shared_count.fetch_add(count);
    }

    /// Ratio of unique to ambiguous observations.
    ///
    /// Returns `None` if every observation was unique, as the ratio is then
    /// unbounded.
    pub fn unique_update_fraction(&self) -> Option<f64> {
        let unique = self.unique_count();
        let ambiguous = self.total_count().saturating_sub(unique);
        if ambiguous == 0 {
            None
        } else {
            Some(unique as f64 / ambiguous as f64)
        }
    }

    /// Record that this transcript was touched at `timestep`
    pub fn set_last_timestep_updated(&self, timestep: u64) {
        self.last_timestep_updated
            .fetch_max(timestep, Ordering::AcqRel);
    }

    /// Most recent timestep recorded by [`set_last_timestep_updated`](Self::set_last_timestep_updated)
    pub fn last_timestep_updated(&self) -> u64 {
        self.last_timestep_updated.load(Ordering::Acquire)
    }

    /// Whether this transcript can receive mass
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Mark the transcript as (in)active
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Per-base prior in linear space
    pub fn per_base_prior(&self) -> f64 {
        self.log_per_base_prior.exp()
    }

    /// Compute the log effective length against the current fragment length model.
    ///
    /// Sums, over every fragment length `l` from the shortest observed up to
    /// `min(ref_length, max_val)`, the probability of `l` times the number of
    /// start positions `ref_length - l + 1`. A transcript shorter than the mean
    /// fragment length keeps its own length, as does one with no feasible
    /// fragment length.
    pub fn update_effective_length(&self, fld: &FragmentLengthDistribution) -> f64 {
        let ref_len = self.ref_length as f64;
        let log_length = ref_len.ln();
        if log_length < fld.mean() {
            return log_length;
        }
        let max_len = usize::min(self.ref_length as usize, fld.max_val());
        let mut eff_len = LOG_0;
        for l in fld.min_val()..=max_len {
            eff_len = log_add(eff_len, fld.pmf(l) + (ref_len - l as f64 + 1.0).ln());
        }
        if eff_len == LOG_0 {
            log_length
        } else {
            eff_len
        }
    }

    /// Log effective length, recomputed if it is stale.
    ///
    /// A recomputation happens the first time this is called, when at least
    /// [`EFF_LEN_UPDATE_INTERVAL`] observations have passed since the last one,
    /// or when `curr_obs` has just crossed `burn_in_obs`.
    pub fn get_effective_length(
        &self,
        fld: &FragmentLengthDistribution,
        curr_obs: u64,
        burn_in_obs: u64,
    ) -> f64 {
        let last = self.last_update.load(Ordering::Acquire);
        if last == 0
            || curr_obs.saturating_sub(last) >= EFF_LEN_UPDATE_INTERVAL
            || (last < burn_in_obs && curr_obs > burn_in_obs)
        {
            let eff_len = self.update_effective_length(fld);
            self.cached_eff_len.store(eff_len);
            self.last_update.store(curr_obs, Ordering::Release);
            eff_len
        } else {
            self.cached_eff_len.load()
        }
    }

    /// Replace the cached log effective length
    pub fn set_cached_effective_length(&self, log_eff_len: f64) {
        self.cached_eff_len.store(log_eff_len);
    }

    /// The cached log effective length, without any recomputation
    pub fn cached_effective_length(&self) -> f64 {
        self.cached_eff_len.load()
    }
}
