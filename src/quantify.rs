//! Read libraries, the experiment they belong to, and the round loop that
//! drives online assignment to the required number of observations.
//!
//! The first round maps every library with its [`Aligner`], running the
//! online engine on a pool of worker threads while a writer thread spools the
//! mapping cache to disk. Later rounds replay the cache (or re-read the input
//! when the cache is disabled). Once enough fragments have been observed the
//! equivalence classes built in the first round go to the
//! [`CollapsedEmOptimizer`].
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crossbeam_channel::Sender;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use crate::aligner::Aligner;
use crate::alignment::{AlignmentGroup, LibraryFormat, MAX_LIB_TYPE_ID};
use crate::aln_cache::{write_alignment_cache, CacheFile, GroupQueue, ReplayStream};
use crate::cluster_forest::ClusterForest;
use crate::eq_class::{EqClass, EquivalenceClassTable};
use crate::error::QuantError;
use crate::forgetting_mass::ForgettingMassCalculator;
use crate::frag_len_dist::{
    FragmentLengthDistribution, DEFAULT_FLD_ALPHA, DEFAULT_FLD_MAX, DEFAULT_FLD_MEAN,
    DEFAULT_FLD_SD, DEFAULT_KERNEL_N, DEFAULT_KERNEL_P,
};
use crate::online::OnlineEngine;
use crate::optimizer::{CollapsedEmOptimizer, EmOptions, PRIOR_ALPHA};
use crate::transcript::Transcript;
use crate::QuantOpts;

/// Upper limit on the number of prefilled forgetting mass timesteps
const MAX_PREFILL: usize = 1_000_000;

/// One sequencing library and its aligner
pub struct ReadLibrary {
    name: String,
    format: LibraryFormat,
    aligner: Mutex<Box<dyn Aligner>>,
    lib_type_counts: Vec<AtomicU64>,
    num_incompatible: AtomicU64,
    num_invalid: AtomicU64,
    first_pass_observed: AtomicU64,
    first_pass_assigned: AtomicU64,
}

impl ReadLibrary {
    /// A library of expected format `format`, read through `aligner`
    pub fn new(name: &str, format: LibraryFormat, aligner: Box<dyn Aligner>) -> Self {
        Self {
            name: name.to_string(),
            format,
            aligner: Mutex::new(aligner),
            lib_type_counts: (0..=MAX_LIB_TYPE_ID).map(|_| AtomicU64::new(0)).collect(),
            num_incompatible: AtomicU64::new(0),
            num_invalid: AtomicU64::new(0),
            first_pass_observed: AtomicU64::new(0),
            first_pass_assigned: AtomicU64::new(0),
        }
    }

    /// Library name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Expected library format
    pub fn format(&self) -> LibraryFormat {
        self.format
    }

    /// Add per-format alignment counts from one batch
    pub fn update_lib_type_counts(&self, counts: &[u64], num_incompatible: u64) {
        for (total, n) in self.lib_type_counts.iter().zip(counts) {
            if *n > 0 {
                total.fetch_add(*n, Ordering::Relaxed);
            }
        }
        self.num_incompatible
            .fetch_add(num_incompatible, Ordering::Relaxed);
    }

    /// Alignments seen in the first round, indexed by format id
    pub fn lib_type_counts(&self) -> Vec<u64> {
        self.lib_type_counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// First-round alignments whose format did not match the library
    pub fn num_incompatible(&self) -> u64 {
        self.num_incompatible.load(Ordering::Relaxed)
    }

    /// Count first-round hits on transcript ids outside the reference
    pub fn add_invalid_hits(&self, n: u64) {
        if n > 0 {
            self.num_invalid.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// First-round hits dropped as inconsistent with the reference, by the
    /// aligner or by the engine
    pub fn num_invalid_hits(&self) -> u64 {
        self.num_invalid.load(Ordering::Relaxed) + self.aligner().num_dropped_hits()
    }

    /// Fragments read from this library in the first round
    pub fn first_pass_observed(&self) -> u64 {
        self.first_pass_observed.load(Ordering::Relaxed)
    }

    /// Fragments assigned from this library in the first round
    pub fn first_pass_assigned(&self) -> u64 {
        self.first_pass_assigned.load(Ordering::Relaxed)
    }

    fn aligner(&self) -> MutexGuard<'_, Box<dyn Aligner>> {
        match self.aligner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Rewind the aligner, false if the input cannot be read again
    pub fn rewind(&self) -> bool {
        self.aligner().rewind()
    }
}

/// Transcripts, libraries and the models learned from them
pub struct ReadExperiment {
    transcripts: Vec<Transcript>,
    libraries: Vec<ReadLibrary>,
    cluster_forest: ClusterForest,
    fld: FragmentLengthDistribution,
    eq_table: EquivalenceClassTable,
    eq_classes: Vec<EqClass>,
}

impl ReadExperiment {
    /// Set up an experiment with a prior-only fragment length distribution
    pub fn new(
        transcripts: Vec<Transcript>,
        libraries: Vec<ReadLibrary>,
    ) -> Result<Self, QuantError> {
        let fld = FragmentLengthDistribution::new(
            DEFAULT_FLD_ALPHA,
            DEFAULT_FLD_MAX,
            DEFAULT_FLD_MEAN,
            DEFAULT_FLD_SD,
            DEFAULT_KERNEL_N,
            DEFAULT_KERNEL_P,
        )?;
        let cluster_forest = ClusterForest::new(transcripts.len());
        Ok(Self {
            transcripts,
            libraries,
            cluster_forest,
            fld,
            eq_table: EquivalenceClassTable::default(),
            eq_classes: Vec::new(),
        })
    }

    /// Reference transcripts
    pub fn transcripts(&self) -> &[Transcript] {
        &self.transcripts
    }

    /// Read libraries
    pub fn libraries(&self) -> &[ReadLibrary] {
        &self.libraries
    }

    /// Transcript clusters
    pub fn cluster_forest(&self) -> &ClusterForest {
        &self.cluster_forest
    }

    /// Learned fragment length distribution
    pub fn fld(&self) -> &FragmentLengthDistribution {
        &self.fld
    }

    /// Classes being built in the first round
    pub fn eq_table(&self) -> &EquivalenceClassTable {
        &self.eq_table
    }

    /// Classes handed to the optimizer, empty before it has run
    pub fn eq_classes(&self) -> &[EqClass] {
        &self.eq_classes
    }

    /// Fragments read in the first round, over all libraries
    pub fn num_observed_frags_in_first_pass(&self) -> u64 {
        self.libraries.iter().map(|l| l.first_pass_observed()).sum()
    }

    /// Fragments assigned in the first round, over all libraries
    pub fn num_assigned_frags_in_first_pass(&self) -> u64 {
        self.libraries.iter().map(|l| l.first_pass_assigned()).sum()
    }

    /// Fraction of first-round fragments that were assigned
    pub fn mapping_rate(&self) -> f64 {
        let observed = self.num_observed_frags_in_first_pass();
        if observed == 0 {
            0.0
        } else {
            self.num_assigned_frags_in_first_pass() as f64 / observed as f64
        }
    }

    /// Rewind every library. Only true if all of them could be rewound.
    pub fn reset(&self) -> bool {
        self.libraries.iter().all(|l| l.rewind())
    }
}

/// Counters describing a finished run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuantSummary {
    /// Fragments observed over all rounds
    pub num_observed: u64,
    /// Fragments assigned over all rounds
    pub num_assigned: u64,
    /// Fragments read in the first round
    pub first_pass_observed: u64,
    /// Fragments assigned in the first round
    pub first_pass_assigned: u64,
    /// `first_pass_assigned / first_pass_observed`
    pub mapping_rate: f64,
    /// Rounds run
    pub rounds: u32,
    /// True if the loop ended before the required observations were reached
    pub stopped_early: bool,
    /// Equivalence classes passed to the optimizer
    pub num_eq_classes: usize,
    /// Classes excluded as degenerate
    pub num_degenerate: usize,
    /// Optimizer passes
    pub em_iterations: usize,
    /// Whether the optimizer met its tolerance
    pub em_converged: bool,
}

// Shared by every worker of one library in one round
struct RoundContext<'a> {
    engine: &'a OnlineEngine<'a>,
    lib: &'a ReadLibrary,
    opts: &'a QuantOpts,
    num_observed: &'a AtomicU64,
    first_timestep: u64,
    initial_round: bool,
    abort: &'a AtomicBool,
    progress: &'a ProgressBar,
}

impl<'a> RoundContext<'a> {
    fn process(&self, batch: &mut [AlignmentGroup], rng: &mut ChaCha20Rng) {
        let n = batch.len() as u64;
        self.num_observed.fetch_add(n, Ordering::Relaxed);
        self.progress.inc(n);
        self.engine.process_mini_batch(
            self.lib,
            self.first_timestep,
            batch,
            rng,
            self.initial_round,
        );
    }

    fn worker_rng(&self, worker: usize, round: u32) -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(
            self.opts
                .seed
                .wrapping_add((round as u64) << 32)
                .wrapping_add(worker as u64),
        )
    }
}

// Map fragments with the library's aligner and assign them. Every group
// goes to `completed` if caching, otherwise straight back to the pool.
fn online_worker(
    ctx: &RoundContext,
    pool: &GroupQueue,
    completed: Option<Sender<AlignmentGroup>>,
    mut rng: ChaCha20Rng,
) -> Result<u64, QuantError> {
    let mini_batch = ctx.opts.mini_batch_size;
    let mut batch: Vec<AlignmentGroup> = Vec::with_capacity(mini_batch);
    let mut local_observed = 0;
    while !ctx.abort.load(Ordering::Relaxed) {
        while batch.len() < mini_batch {
            match pool.pop() {
                Some(group) => batch.push(group),
                None => break,
            }
        }
        let aligned = ctx.lib.aligner().align_batch(&mut batch);
        let filled = match aligned {
            Ok(n) => n,
            Err(e) => {
                ctx.abort.store(true, Ordering::Relaxed);
                batch.drain(..).for_each(|g| pool.push(g));
                return Err(e);
            }
        };
        if filled == 0 {
            break;
        }
        for group in batch[..filled].iter_mut() {
            if group.size() > ctx.opts.max_read_occs {
                group.clear();
            }
        }
        ctx.process(&mut batch[..filled], &mut rng);
        local_observed += filled as u64;

        for group in batch.drain(..filled) {
            match &completed {
                Some(tx) => {
                    if let Err(returned) = tx.send(group) {
                        pool.push(returned.into_inner());
                    }
                }
                None => pool.push(group),
            }
        }
    }
    batch.drain(..).for_each(|g| pool.push(g));
    Ok(local_observed)
}

// Assign groups replayed from the mapping cache until the stream ends.
fn replay_worker(ctx: &RoundContext, stream: &ReplayStream, mut rng: ChaCha20Rng) -> u64 {
    let mini_batch = ctx.opts.mini_batch_size;
    let mut batch: Vec<AlignmentGroup> = Vec::with_capacity(mini_batch);
    let mut local_observed = 0;
    loop {
        while batch.len() < mini_batch {
            match stream.groups.recv() {
                Ok(group) => batch.push(group),
                Err(_) => break,
            }
        }
        if batch.is_empty() {
            break;
        }
        ctx.process(&mut batch, &mut rng);
        local_observed += batch.len() as u64;
        for group in batch.drain(..) {
            let _ = stream.recycle.send(group);
        }
    }
    local_observed
}

// One pass of the aligner over a library. Returns the fragments read and,
// if a cache path was given, the number of groups written to it.
fn process_read_library(
    ctx: &RoundContext,
    round: u32,
    cache_path: Option<&Path>,
    num_required: u64,
    struct_cache_size: usize,
) -> Result<(u64, u64), QuantError> {
    let pool = GroupQueue::with_groups(struct_cache_size);
    let cache_unique = !ctx.opts.use_mass_banking;

    std::thread::scope(|s| {
        let (completed_tx, completed_rx) = crossbeam_channel::unbounded();
        let writer = cache_path.map(|path| {
            let pool_tx = pool.sender();
            let num_observed = ctx.num_observed;
            s.spawn(move || {
                write_alignment_cache(
                    path,
                    completed_rx,
                    pool_tx,
                    cache_unique,
                    num_observed,
                    num_required,
                )
            })
        });

        let workers: Vec<_> = (0..ctx.opts.threads)
            .map(|i| {
                let completed = writer.as_ref().map(|_| completed_tx.clone());
                let rng = ctx.worker_rng(i, round);
                let pool = &pool;
                s.spawn(move || online_worker(ctx, pool, completed, rng))
            })
            .collect();
        drop(completed_tx);

        let mut observed = 0;
        let mut first_err = None;
        for worker in workers {
            match worker.join() {
                Ok(Ok(n)) => observed += n,
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(QuantError::InvalidOptions(
                        "a mapping worker panicked".to_string(),
                    ));
                }
            }
        }
        let num_written = match writer.map(|w| w.join()) {
            Some(Ok(result)) => result?,
            Some(Err(_)) => {
                return Err(QuantError::CacheWrite {
                    path: cache_path.map(Path::to_path_buf).unwrap_or_default(),
                    msg: "writer thread panicked".to_string(),
                })
            }
            None => 0,
        };
        match first_err {
            Some(e) => Err(e),
            None => Ok((observed, num_written)),
        }
    })
}

// One replay of a library's mapping cache. Returns the groups processed.
fn process_cached_alignments(
    ctx: &RoundContext,
    round: u32,
    cache_file: &mut CacheFile,
    struct_cache_size: usize,
) -> Result<u64, QuantError> {
    let stream = cache_file.populate(struct_cache_size)?;
    let observed = std::thread::scope(|s| {
        let workers: Vec<_> = (0..ctx.opts.threads)
            .map(|i| {
                let rng = ctx.worker_rng(i, round);
                let stream = &stream;
                s.spawn(move || replay_worker(ctx, stream, rng))
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap_or(0))
            .sum::<u64>()
    });
    drop(stream);
    cache_file.flush()?;
    Ok(observed)
}

fn progress_bar(verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} processed {pos} fragments [{elapsed}]")
    {
        bar.set_style(style);
    }
    bar
}

/// Run rounds of online assignment until `opts.num_required_frags` fragments
/// have been observed, then estimate abundances.
///
/// Mapping caches are written to `output_dir` and deleted before returning.
/// If the input cannot be read again, or a round observes nothing, the loop
/// stops early with a warning and abundances are estimated from what was
/// seen.
///
/// # Errors
/// Aligner, cache and I/O errors, and the fatal optimizer conditions
/// [`QuantError::NoActiveTranscripts`] and [`QuantError::InsufficientMass`].
pub fn quantify_library(
    experiment: &mut ReadExperiment,
    opts: &QuantOpts,
    output_dir: &Path,
) -> Result<QuantSummary, QuantError> {
    let num_required = opts.num_required_frags;
    let mini_batch = usize::max(opts.mini_batch_size, 1);
    let struct_cache_size = opts.threads * mini_batch * 10;

    let fm_calc = ForgettingMassCalculator::new(opts.forgetting_factor);
    let prefill = usize::min(num_required as usize / mini_batch + 2 * opts.threads + 1, MAX_PREFILL);
    fm_calc.prefill(prefill);

    let num_observed = AtomicU64::new(0);
    let num_assigned = AtomicU64::new(0);
    let burned_in = AtomicBool::new(false);
    let abort = AtomicBool::new(false);
    let progress = progress_bar(opts.verbose);

    let mut cache_files: Vec<CacheFile> = Vec::new();
    let mut summary = QuantSummary::default();
    let mut round: u32 = 0;
    let mut num_prev_observed = 0;

    let result = (|| -> Result<(), QuantError> {
        while num_observed.load(Ordering::Relaxed) < num_required {
            let initial_round = round == 0;
            let prev_observed = num_observed.load(Ordering::Relaxed);
            if !initial_round {
                let did_reset = !opts.disable_mapping_cache || experiment.reset();
                if !did_reset {
                    log::warn!(
                        "One of the read libraries can't be read more than once. Observed only \
                         {prev_observed} fragments when at least {num_required} were wanted. \
                         Re-run with the reads in a regular file to use all of them."
                    );
                    summary.stopped_early = true;
                    break;
                }
                if !opts.disable_mapping_cache
                    && prev_observed - num_prev_observed <= opts.mapping_cache_memory_limit
                    && round < 2
                {
                    cache_files.iter_mut().for_each(|cf| cf.set_in_memory(true));
                }
                num_prev_observed = prev_observed;
            }

            let engine = OnlineEngine {
                transcripts: &experiment.transcripts,
                fm_calc: &fm_calc,
                cluster_forest: &experiment.cluster_forest,
                fld: &experiment.fld,
                eq_table: &experiment.eq_table,
                opts,
                num_assigned: &num_assigned,
                burned_in: &burned_in,
            };

            if initial_round || opts.disable_mapping_cache {
                for (lib_idx, lib) in experiment.libraries.iter().enumerate() {
                    let assigned_before = num_assigned.load(Ordering::Relaxed);
                    let ctx = RoundContext {
                        engine: &engine,
                        lib,
                        opts,
                        num_observed: &num_observed,
                        first_timestep: fm_calc.current_timestep(),
                        initial_round,
                        abort: &abort,
                        progress: &progress,
                    };
                    let cache_path = (initial_round && !opts.disable_mapping_cache)
                        .then(|| output_dir.join(format!("alnCache_{lib_idx}.bin")));
                    // registered first so a failed round still removes it
                    if let Some(path) = &cache_path {
                        cache_files.push(CacheFile::new(path.clone(), 0));
                    }
                    let (observed, num_written) = process_read_library(
                        &ctx,
                        round,
                        cache_path.as_deref(),
                        num_required,
                        struct_cache_size,
                    )?;
                    if initial_round {
                        let assigned = num_assigned.load(Ordering::Relaxed) - assigned_before;
                        lib.first_pass_observed.store(observed, Ordering::Relaxed);
                        lib.first_pass_assigned.store(assigned, Ordering::Relaxed);
                        log::info!(
                            "Library {}: {observed} fragments, {assigned} assigned",
                            lib.name()
                        );
                        if let Some(cf) = cache_files.get_mut(lib_idx) {
                            cf.set_num_written(num_written);
                        }
                    }
                }
            } else {
                for (lib, cache_file) in experiment.libraries.iter().zip(cache_files.iter_mut()) {
                    let ctx = RoundContext {
                        engine: &engine,
                        lib,
                        opts,
                        num_observed: &num_observed,
                        first_timestep: fm_calc.current_timestep(),
                        initial_round,
                        abort: &abort,
                        progress: &progress,
                    };
                    let prior_assigned = num_assigned.load(Ordering::Relaxed);
                    let prior_observed = num_observed.load(Ordering::Relaxed);
                    process_cached_alignments(&ctx, round, cache_file, struct_cache_size)?;
                    if opts.use_mass_banking {
                        // every first-round fragment counts once per round
                        num_assigned.store(
                            prior_assigned + lib.first_pass_assigned(),
                            Ordering::Relaxed,
                        );
                        num_observed.store(
                            prior_observed + lib.first_pass_assigned(),
                            Ordering::Relaxed,
                        );
                    }
                }
            }

            round += 1;
            let observed_now = num_observed.load(Ordering::Relaxed);
            log::info!(
                "At end of round {}: observed {observed_now} total fragments ({} in most recent \
                 round), {} assigned",
                round - 1,
                observed_now - prev_observed,
                num_assigned.load(Ordering::Relaxed)
            );
            if observed_now == prev_observed {
                log::warn!("No fragments were observed in round {}, stopping", round - 1);
                summary.stopped_early = true;
                break;
            }
        }
        Ok(())
    })();
    progress.finish_and_clear();

    for cf in cache_files.iter_mut() {
        if let Err(e) = cf.clear() {
            log::warn!("Could not remove mapping cache {}: {e}", cf.path().display());
        }
    }
    result?;

    summary.rounds = round;
    summary.num_observed = num_observed.load(Ordering::Relaxed);
    summary.num_assigned = num_assigned.load(Ordering::Relaxed);
    summary.first_pass_observed = experiment.num_observed_frags_in_first_pass();
    summary.first_pass_assigned = experiment.num_assigned_frags_in_first_pass();
    summary.mapping_rate = experiment.mapping_rate();
    log::info!("Overall mapping rate = {:.4}%", summary.mapping_rate * 100.0);

    let mut classes = std::mem::take(&mut experiment.eq_table).into_classes();
    summary.num_eq_classes = classes.len();
    let optimizer = CollapsedEmOptimizer::new(
        EmOptions {
            use_vbem: opts.use_vbopt,
            max_iter: opts.max_em_iter,
            rel_diff_tolerance: opts.em_rel_diff_tolerance,
            prior_alpha: PRIOR_ALPHA,
        },
        opts.no_effective_length_correction,
    );
    let em = optimizer.optimize(
        &mut experiment.transcripts,
        &mut classes,
        summary.first_pass_assigned as f64,
    )?;
    summary.num_degenerate = em.num_degenerate;
    summary.em_iterations = em.iterations;
    summary.em_converged = em.converged;
    experiment.eq_classes = classes;

    Ok(summary)
}
