//! Online assignment of fragments to transcripts.
//!
//! [`OnlineEngine::process_mini_batch`] is called by every worker on its own
//! batch of alignment groups. For each fragment it scores every candidate
//! from the current transcript mass, the fragment length model and the
//! library compatibility prior, normalises those scores and log-adds them,
//! weighted by the batch's forgetting mass, back onto the transcripts. All
//! shared state is updated without locks except the cluster forest and the
//! equivalence class shards.
//!
//! Outside the first round, mass banking can replace the replay of uniquely
//! mapped fragments (which are then not cached) with a correction that
//! credits each transcript with mass in proportion to its historical ratio of
//! unique to ambiguous fragments.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hashbrown::HashMap;
use rand::Rng;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;

use crate::alignment::{log_align_format_prob, AlignmentGroup, MAX_LIB_TYPE_ID};
use crate::cluster_forest::ClusterForest;
use crate::eq_class::EquivalenceClassTable;
use crate::forgetting_mass::ForgettingMassCalculator;
use crate::frag_len_dist::FragmentLengthDistribution;
use crate::math::{log_add, log_sub, LOG_0, LOG_1};
use crate::quantify::ReadLibrary;
use crate::transcript::Transcript;
use crate::QuantOpts;

/// Shared state touched by every worker in a round
pub struct OnlineEngine<'a> {
    /// Reference transcripts
    pub transcripts: &'a [Transcript],
    /// Per-batch weights
    pub fm_calc: &'a ForgettingMassCalculator,
    /// Transcripts linked by ambiguous fragments
    pub cluster_forest: &'a ClusterForest,
    /// Fragment length model
    pub fld: &'a FragmentLengthDistribution,
    /// Classes built during the first round
    pub eq_table: &'a EquivalenceClassTable,
    /// Run options
    pub opts: &'a QuantOpts,
    /// Fragments assigned over all rounds
    pub num_assigned: &'a AtomicU64,
    /// Set once `opts.num_burnin_frags` have been assigned
    pub burned_in: &'a AtomicBool,
}

impl<'a> OnlineEngine<'a> {
    /// Log mass owed to each transcript in `batch` under mass banking.
    ///
    /// A transcript with unique fragments is owed the forgetting mass handed
    /// out since the start of the round, scaled by its unique to ambiguous
    /// ratio and spread over the number of timesteps it was dormant.
    fn banked_mass(
        &self,
        batch: &[AlignmentGroup],
        first_timestep_of_round: u64,
        current_timestep: u64,
    ) -> HashMap<u32, f64> {
        let mut hit_info: HashMap<u32, f64> = HashMap::new();
        let starting_mass = self.fm_calc.cumulative_log_mass_at(first_timestep_of_round);
        for group in batch {
            for aln in group.alignments() {
                let tid = aln.transcript_id;
                let Some(txp) = self.transcripts.get(tid as usize) else {
                    log::warn!("Invalid transcript ID [{tid}] encountered");
                    continue;
                };
                hit_info.entry(tid).or_insert_with(|| {
                    if txp.unique_count() == 0 {
                        return LOG_0;
                    }
                    let Some(fraction) = txp.unique_update_fraction() else {
                        return LOG_0;
                    };
                    let dormant_interval =
                        (current_timestep - first_timestep_of_round + 1) as f64;
                    let current_mass = self.fm_calc.cumulative_log_mass_at(current_timestep);
                    log_sub(current_mass, starting_mass) + fraction.ln() - dormant_interval.ln()
                });
            }
        }
        hit_info
    }

    /// Assign one batch of fragments.
    ///
    /// Counts, equivalence classes and library format counts are only updated
    /// in the initial round. The fragment length model is only updated before
    /// burn-in. Crossing the burn-in threshold refreshes every transcript's
    /// effective length, once.
    pub fn process_mini_batch(
        &self,
        lib: &ReadLibrary,
        first_timestep_of_round: u64,
        batch: &mut [AlignmentGroup],
        rng: &mut ChaCha20Rng,
        initial_round: bool,
    ) {
        let opts = self.opts;
        let use_mass_banking = !initial_round && opts.use_mass_banking;
        let update_counts = initial_round;
        let burned_in = self.burned_in.load(Ordering::Acquire);
        let expected_format = lib.format();

        let (log_forgetting_mass, current_timestep) = self.fm_calc.log_mass_and_timestep();
        let hit_info = if use_mass_banking {
            self.banked_mass(batch, first_timestep_of_round, current_timestep)
        } else {
            HashMap::new()
        };
        let banked = |tid: u32| hit_info.get(&tid).copied().unwrap_or(LOG_0);

        let mut lib_type_counts = vec![0u64; MAX_LIB_TYPE_ID as usize + 1];
        let mut num_incompatible = 0u64;
        let mut num_invalid = 0u64;
        let mut local_assigned = 0u64;
        let mut observed: Vec<u32> = Vec::new();

        for group in batch.iter_mut() {
            if group.is_empty() {
                continue;
            }
            let mut sum_of_align_probs = LOG_0;
            observed.clear();

            for aln in group.alignments_mut() {
                let tid = aln.transcript_id;
                let Some(transcript) = self.transcripts.get(tid as usize) else {
                    log::warn!("Invalid transcript ID [{tid}] encountered");
                    num_invalid += 1;
                    aln.log_prob = LOG_0;
                    continue;
                };

                let log_ref_length = if opts.no_effective_length_correction || !burned_in {
                    (transcript.ref_length as f64).ln()
                } else {
                    transcript.get_effective_length(
                        self.fld,
                        self.num_assigned.load(Ordering::Relaxed),
                        opts.num_burnin_frags,
                    )
                };

                let mut transcript_log_count = transcript.mass(initial_round);
                if use_mass_banking && transcript.unique_count() > 0 {
                    transcript_log_count = log_add(transcript_log_count, banked(tid));
                }

                if transcript_log_count == LOG_0 {
                    aln.log_prob = LOG_0;
                    continue;
                }

                let log_frag_prob = if opts.no_frag_length_dist || aln.frag_len == 0 {
                    LOG_1
                } else {
                    self.fld.pmf(aln.frag_len as usize)
                };

                let compatible = aln.lib_format.is_compatible_with(&expected_format);
                if !compatible {
                    num_incompatible += 1;
                }
                let log_align_compat_prob = if opts.use_read_compat {
                    log_align_format_prob(
                        &aln.lib_format,
                        &expected_format,
                        opts.log_incompat_prior,
                    )
                } else {
                    LOG_1
                };
                lib_type_counts[aln.lib_format.format_id() as usize] += 1;

                aln.log_prob = (transcript_log_count - log_ref_length)
                    + log_frag_prob
                    + log_align_compat_prob;
                sum_of_align_probs = log_add(sum_of_align_probs, aln.log_prob);

                if update_counts && !observed.contains(&tid) {
                    transcript.add_total_count(1);
                    observed.push(tid);
                }
            }

            if sum_of_align_probs == LOG_0 {
                log::debug!("0 probability fragment encountered; skipping");
                continue;
            }
            local_assigned += 1;

            // transcripts that can explain the fragment
            let mut label: Vec<u32> = group
                .alignments()
                .iter()
                .filter(|a| a.log_prob != LOG_0)
                .map(|a| a.transcript_id)
                .collect();
            label.sort_unstable();
            label.dedup();
            let transcript_unique = label.len() == 1;

            for aln in group.alignments_mut() {
                if aln.log_prob == LOG_0 {
                    continue;
                }
                aln.log_prob -= sum_of_align_probs;
                let transcript = &self.transcripts[aln.transcript_id as usize];

                let mut new_mass = log_forgetting_mass + aln.log_prob;
                if use_mass_banking && transcript.unique_count() > 0 {
                    new_mass = log_add(new_mass, banked(aln.transcript_id));
                }
                transcript.add_mass(new_mass);
                transcript.set_last_timestep_updated(current_timestep);
                if update_counts && !transcript_unique {
                    transcript.add_shared_count(aln.log_prob.exp());
                }

                if !burned_in && aln.frag_len > 0 && rng.gen::<f64>() < aln.log_prob.exp() {
                    self.fld.add_val(aln.frag_len as usize, log_forgetting_mass);
                }
            }

            if let Some(&first_tid) = label.first() {
                if !transcript_unique {
                    self.cluster_forest.merge_clusters(&label);
                } else if update_counts {
                    self.transcripts[first_tid as usize].add_unique_count(1);
                }
                self.cluster_forest
                    .update_cluster(first_tid, 1, log_forgetting_mass, update_counts);
            }

            if initial_round {
                self.eq_table.add_group(label, 1);
            }
        }

        let total_assigned = self.num_assigned.fetch_add(local_assigned, Ordering::AcqRel)
            + local_assigned;
        if total_assigned >= opts.num_burnin_frags
            && self
                .burned_in
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            log::info!("Burn-in complete after {total_assigned} fragments, fixing effective lengths");
            self.transcripts.par_iter().for_each(|t| {
                t.get_effective_length(self.fld, total_assigned, opts.num_burnin_frags);
            });
        }

        if initial_round {
            lib.update_lib_type_counts(&lib_type_counts, num_incompatible);
            lib.add_invalid_hits(num_invalid);
        }
    }
}
