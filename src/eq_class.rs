//! Equivalence classes of fragments.
//!
//! Fragments with exactly the same set of candidate transcripts are collapsed
//! into one class, keyed by the sorted transcript ids (the label), carrying
//! the number of fragments seen. The table is written concurrently by the
//! online engine and then turned into a flat vector of [`EqClass`] for the
//! optimizer.
//!
//! Writes are spread across several [`Mutex`]-protected [`hashbrown::HashMap`]
//! shards, selected by an [`ahash`] hash of the label, to keep contention low.
use std::hash::BuildHasher;
use std::sync::Mutex;

use hashbrown::HashMap;

use crate::math::MIN_WEIGHT;
use crate::transcript::Transcript;

const DEFAULT_SHARDS: usize = 64;

/// One equivalence class, as consumed by the optimizer
#[derive(Debug, Clone, PartialEq)]
pub struct EqClass {
    /// Sorted transcript ids
    pub label: Vec<u32>,
    /// Fragments in the class
    pub count: u64,
    /// Per-member weight, the reciprocal of effective length
    pub weights: Vec<f64>,
    /// False once the class has been marked degenerate
    pub valid: bool,
}

impl EqClass {
    /// A valid class with unit weights
    pub fn new(label: Vec<u32>, count: u64) -> Self {
        let weights = vec![1.0; label.len()];
        Self {
            label,
            count,
            weights,
            valid: true,
        }
    }

    /// A valid class with the given weights
    pub fn with_weights(label: Vec<u32>, count: u64, weights: Vec<f64>) -> Self {
        Self {
            label,
            count,
            weights,
            valid: true,
        }
    }

    /// `sum_i alpha[label[i]] * weights[i]`, skipping NaN terms
    pub fn weighted_denom(&self, alphas: &[f64]) -> f64 {
        self.label
            .iter()
            .zip(self.weights.iter())
            .map(|(tid, w)| alphas[*tid as usize] * w)
            .filter(|v| !v.is_nan())
            .sum()
    }
}

/// Concurrent map from label to fragment count
#[derive(Debug)]
pub struct EquivalenceClassTable {
    shards: Vec<Mutex<HashMap<Vec<u32>, u64>>>,
    hasher: ahash::RandomState,
}

impl Default for EquivalenceClassTable {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl EquivalenceClassTable {
    /// Empty table split into `n_shards` shards
    pub fn new(n_shards: usize) -> Self {
        let n_shards = usize::max(n_shards, 1);
        Self {
            shards: (0..n_shards).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: ahash::RandomState::new(),
        }
    }

    /// Add `count` fragments to the class `label`.
    ///
    /// `label` must be sorted and free of duplicates. Empty labels are ignored.
    pub fn add_group(&self, label: Vec<u32>, count: u64) {
        if label.is_empty() {
            return;
        }
        let shard = (BuildHasher::hash_one(&self.hasher, &label) as usize) % self.shards.len();
        let mut map = match self.shards[shard].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *map.entry(label).or_insert(0) += count;
    }

    /// Number of distinct classes
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| match s.lock() {
                Ok(guard) => guard.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            })
            .sum()
    }

    /// True if no class has been added
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into a vector of classes sorted by label, with unit weights
    pub fn into_classes(self) -> Vec<EqClass> {
        let mut classes: Vec<EqClass> = self
            .shards
            .into_iter()
            .flat_map(|s| {
                let map = match s.into_inner() {
                    Ok(map) => map,
                    Err(poisoned) => poisoned.into_inner(),
                };
                map.into_iter()
            })
            .map(|(label, count)| EqClass::new(label, count))
            .collect();
        classes.sort_unstable_by(|a, b| a.label.cmp(&b.label));
        classes
    }
}

/// Set every class weight to `1 / effective length` of its member.
///
/// With `no_eff_len_correction` the reference length is used instead. A
/// non-positive length gives a weight of 1.
pub fn update_weights(
    classes: &mut [EqClass],
    transcripts: &[Transcript],
    no_eff_len_correction: bool,
) {
    let eff_lens: Vec<f64> = transcripts
        .iter()
        .map(|t| effective_length(t, no_eff_len_correction))
        .collect();
    for class in classes.iter_mut() {
        class.weights.clear();
        class.weights.extend(class.label.iter().map(|tid| {
            let el = eff_lens[*tid as usize];
            if el <= 0.0 {
                1.0
            } else {
                1.0 / el
            }
        }));
    }
}

/// Linear effective length used to weight classes
pub fn effective_length(transcript: &Transcript, no_eff_len_correction: bool) -> f64 {
    if no_eff_len_correction {
        transcript.ref_length as f64
    } else {
        transcript.cached_effective_length().exp()
    }
}

/// Flag every class whose weighted denominator under `alphas` is numerically
/// zero. Returns the number of classes flagged.
pub fn mark_degenerate_classes(classes: &mut [EqClass], alphas: &[f64]) -> usize {
    let mut n_dropped = 0;
    for class in classes.iter_mut() {
        let denom = class.weighted_denom(alphas);
        if denom <= MIN_WEIGHT {
            log::debug!(
                "Dropping weighted eq class {:?}: count = {}, alphas = {:?}, weights = {:?}",
                class.label,
                class.count,
                class
                    .label
                    .iter()
                    .map(|t| alphas[*t as usize])
                    .collect::<Vec<f64>>(),
                class.weights
            );
            class.valid = false;
            n_dropped += 1;
        }
    }
    n_dropped
}
