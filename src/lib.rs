//! Streaming estimation of transcript abundances from RNA-seq fragments.
//!
//! `streamquant` takes the candidate alignments of every sequenced fragment
//! (the transcripts it could have come from, with a score, an inferred
//! fragment length and the orientation it was seen in) and estimates how many
//! fragments each transcript produced.
//!
//! ## Details
//!
//! Estimation happens in two stages.
//!
//! Fragments are first assigned online, in mini-batches, across a pool of
//! worker threads. Each fragment's candidates are weighted by the mass their
//! transcripts have accumulated so far, corrected for effective length and
//! fragment length probability, and the fragment's unit of mass is split
//! between them. Later batches carry more weight than earlier ones following
//! a forgetting schedule, so early noisy estimates are washed out. If the
//! input is smaller than the number of observations wanted, the fragments
//! are replayed from a mapping cache (in memory when small, on disk
//! otherwise) until enough have been seen.
//!
//! While the first pass runs, fragments are also collapsed into equivalence
//! classes: sets of transcripts with a count of fragments compatible with
//! exactly that set. Once the online phase ends, the classes are given to a
//! collapsed EM (or variational Bayes EM) optimizer seeded from the online
//! estimates, which produces the final counts.
//!
//! A fragment length distribution and per-transcript effective lengths are
//! learned during a burn-in period and fixed afterwards.
//!
//! # Usage
//!
//! Read mapping happens upstream. Hits are given as text, one fragment per
//! line, each hit a comma-separated `transcript,format,score,frag_len`:
//! ```text
//! txA,IU,0.95,250 txB,IU,0.81,248
//! txC,U,1.0,0
//! ```
//! A line with no hits is a fragment that did not map.
//!
//! ## streamquant quant
//!
//! ```bash
//! streamquant quant -t transcripts.fa -l IU -o out sample_1.hits sample_2.hits
//! ```
//! Each hit file is one library. With `-f` a file list of
//! `name\tlib_type\thits` lines can be given instead, and `-` reads a single
//! library from stdin (which cannot be replayed, so only one pass is made).
//!
//! Results are written to the output directory:
//! - `quant.sf`: per transcript length, effective length, relative abundance
//!   and estimated number of reads.
//! - `lib_format_counts.txt`: formats seen in each library and how many
//!   alignments disagreed with the expected library type. Hits on transcripts
//!   missing from the reference are dropped and counted here too.
//! - `libParams/flenDist.txt`: the learned fragment length distribution.
//! - `quant_summary.txt`: observation counts, mapping rate and optimizer
//!   status.
//!
//! Progress is shown with `-v`. Warnings (for example when the input could
//! not be read as many times as wanted) are always shown.
//!
//! ### Main options
//!
//! - `-n` the number of fragments to observe. If this is more than the input
//!   contains, rounds are repeated from the mapping cache.
//! - `--forgetting-factor` in (0.5, 1]. Smaller values forget early batches
//!   faster.
//! - `--use-vbopt` to use variational Bayes EM in the final optimization.
//! - `--use-mass-banking` to leave uniquely mapping fragments out of the
//!   mapping cache and credit their transcripts by ratio in later rounds.
//! - `--disable-mapping-cache` to re-read the input every round.
//! - `--threads` worker threads for assignment and optimization.
//!
//! # API usage
//!
//! ```rust
//! use streamquant::aligner::VecAligner;
//! use streamquant::alignment::{Alignment, AlignmentGroup, LibraryFormat};
//! use streamquant::quantify::{quantify_library, ReadExperiment, ReadLibrary};
//! use streamquant::transcript::{Transcript, DEFAULT_PER_BASE_PRIOR};
//! use streamquant::QuantOpts;
//!
//! let format = LibraryFormat::parse("U").unwrap();
//! let transcripts = vec![
//!     Transcript::new(0, "txA", 1000, DEFAULT_PER_BASE_PRIOR),
//!     Transcript::new(1, "txB", 1000, DEFAULT_PER_BASE_PRIOR),
//! ];
//! // Half the fragments are unique to txA, half could be either
//! let groups: Vec<AlignmentGroup> = (0..100)
//!     .map(|i| {
//!         let mut group = AlignmentGroup::new();
//!         group.push(Alignment::new(0, format, 1.0, 0));
//!         if i % 2 == 0 {
//!             group.push(Alignment::new(1, format, 1.0, 0));
//!         }
//!         group
//!     })
//!     .collect();
//! let library = ReadLibrary::new("sample", format, Box::new(VecAligner::new(groups)));
//! let mut experiment = ReadExperiment::new(transcripts, vec![library]).unwrap();
//!
//! let opts = QuantOpts {
//!     num_required_frags: 300,
//!     ..Default::default()
//! };
//! let cache_dir = std::env::temp_dir().join("streamquant_api_example");
//! std::fs::create_dir_all(&cache_dir).unwrap();
//! let summary = quantify_library(&mut experiment, &opts, &cache_dir).unwrap();
//!
//! assert!(summary.num_observed >= 300);
//! let est: Vec<f64> = experiment.transcripts().iter().map(|t| t.est_count).collect();
//! assert!(est[0] > est[1]);
//! ```
//!
//! To write the output tables see [`output::write_outputs`].

#![warn(missing_docs)]
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub mod math;

pub mod error;
use crate::error::QuantError;

pub mod forgetting_mass;
pub mod frag_len_dist;
pub mod transcript;

pub mod cluster_forest;
pub mod eq_class;
pub mod optimizer;

pub mod alignment;
pub mod aligner;
pub mod aln_cache;

pub mod online;
pub mod quantify;
use crate::quantify::{quantify_library, ReadExperiment};

pub mod output;
use crate::output::write_outputs;

pub mod cli;
use crate::cli::*;

pub mod io_utils;
use crate::io_utils::*;

/// Options controlling a quantification run
#[derive(Debug, Clone, PartialEq)]
pub struct QuantOpts {
    /// Fragments to observe over all rounds
    pub num_required_frags: u64,
    /// Forgetting factor, in (0.5, 1]
    pub forgetting_factor: f64,
    /// Fragments assigned before the fragment length model and effective
    /// lengths are fixed
    pub num_burnin_frags: u64,
    /// Minimum score for a hit to be kept
    pub coverage_threshold: f64,
    /// Fragments with more hits than this are discarded
    pub max_read_occs: usize,
    /// Apply the library compatibility prior
    pub use_read_compat: bool,
    /// Log prior probability of an alignment incompatible with the library
    pub log_incompat_prior: f64,
    /// Re-read the input every round instead of replaying a cache
    pub disable_mapping_cache: bool,
    /// Replay from memory if a round observed at most this many fragments
    pub mapping_cache_memory_limit: u64,
    /// Leave unique fragments out of the cache and credit them by ratio
    pub use_mass_banking: bool,
    /// Use VBEM for the final optimization
    pub use_vbopt: bool,
    /// Optimizer iteration limit
    pub max_em_iter: usize,
    /// Optimizer relative tolerance
    pub em_rel_diff_tolerance: f64,
    /// Use transcript lengths rather than effective lengths
    pub no_effective_length_correction: bool,
    /// Ignore fragment lengths when scoring
    pub no_frag_length_dist: bool,
    /// Fragments per mini-batch
    pub mini_batch_size: usize,
    /// Worker threads
    pub threads: usize,
    /// Seed for fragment length sampling
    pub seed: u64,
    /// Show a progress spinner
    pub verbose: bool,
}

impl Default for QuantOpts {
    fn default() -> Self {
        Self {
            num_required_frags: DEFAULT_REQUIRED_FRAGS,
            forgetting_factor: DEFAULT_FORGETTING_FACTOR,
            num_burnin_frags: DEFAULT_BURNIN_FRAGS,
            coverage_threshold: DEFAULT_COVERAGE,
            max_read_occs: DEFAULT_MAX_READ_OCCS,
            use_read_compat: false,
            log_incompat_prior: DEFAULT_INCOMPAT_PRIOR.ln(),
            disable_mapping_cache: false,
            mapping_cache_memory_limit: DEFAULT_MAPPING_CACHE_MEMORY_LIMIT,
            use_mass_banking: false,
            use_vbopt: false,
            max_em_iter: DEFAULT_MAX_EM_ITER,
            em_rel_diff_tolerance: DEFAULT_EM_REL_TOL,
            no_effective_length_correction: false,
            no_frag_length_dist: false,
            mini_batch_size: DEFAULT_MINI_BATCH,
            threads: 1,
            seed: DEFAULT_SEED,
            verbose: false,
        }
    }
}

impl QuantOpts {
    /// Check options that are only invalid in combination
    pub fn validate(&self) -> Result<(), QuantError> {
        if self.no_frag_length_dist && !self.no_effective_length_correction {
            return Err(QuantError::InvalidOptions(
                "disabling the fragment length distribution requires disabling effective length \
                 correction"
                    .to_string(),
            ));
        }
        if self.forgetting_factor <= 0.5 || self.forgetting_factor > 1.0 {
            return Err(QuantError::InvalidOptions(format!(
                "forgetting factor {} is not in (0.5, 1.0]",
                self.forgetting_factor
            )));
        }
        if self.threads == 0 || self.mini_batch_size == 0 {
            return Err(QuantError::InvalidOptions(
                "threads and mini-batch size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// Everything `quant` does after argument parsing
fn run_quant(
    transcripts_file: &str,
    inputs: &[InputLibrary],
    output: &str,
    opts: &QuantOpts,
) -> Result<(), QuantError> {
    opts.validate()?;
    let output_dir = Path::new(output);
    std::fs::create_dir_all(output_dir)?;

    log::info!("Reading transcripts");
    let (transcripts, name_to_id) = read_transcripts(transcripts_file)?;
    let libraries = build_libraries(inputs, Arc::new(name_to_id), opts.coverage_threshold)?;
    let mut experiment = ReadExperiment::new(transcripts, libraries)?;

    let summary = quantify_library(&mut experiment, opts, output_dir)?;
    if summary.stopped_early {
        log::warn!(
            "Stopped after {} of {} requested fragments",
            summary.num_observed,
            opts.num_required_frags
        );
    }
    write_outputs(
        output_dir,
        &experiment,
        &summary,
        opts.no_effective_length_correction,
    )
}

/// Size the global rayon pool used by the optimizer and effective length
/// updates. Only the first call in a process has any effect.
pub fn init_thread_pool(threads: usize) {
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
    {
        log::warn!("Could not set up thread pool: {e}");
    }
}

#[doc(hidden)]
pub fn main() {
    let args = cli_args();
    let level = if args.verbose {
        log::Level::Info
    } else {
        log::Level::Warn
    };
    if let Err(e) = simple_logger::init_with_level(level) {
        eprintln!("Could not start logger: {e}");
    }

    eprintln!("streamquant: streaming transcript quantification");
    let start = Instant::now();
    let result = match &args.command {
        Commands::Quant {
            transcripts,
            hits_files,
            file_list,
            lib_type,
            output,
            num_required_obs,
            forgetting_factor,
            num_burnin_frags,
            coverage,
            max_read_occs,
            incompat_prior,
            use_read_compat,
            disable_mapping_cache,
            mapping_cache_memory_limit,
            use_mass_banking,
            use_vbopt,
            max_em_iter,
            em_rel_tol,
            no_effective_length_correction,
            no_frag_length_dist,
            mini_batch_size,
            seed,
            threads,
        } => {
            let opts = QuantOpts {
                num_required_frags: *num_required_obs,
                forgetting_factor: *forgetting_factor,
                num_burnin_frags: *num_burnin_frags,
                coverage_threshold: *coverage,
                max_read_occs: *max_read_occs,
                use_read_compat: *use_read_compat,
                log_incompat_prior: incompat_prior.ln(),
                disable_mapping_cache: *disable_mapping_cache,
                mapping_cache_memory_limit: *mapping_cache_memory_limit,
                use_mass_banking: *use_mass_banking,
                use_vbopt: *use_vbopt,
                max_em_iter: *max_em_iter,
                em_rel_diff_tolerance: *em_rel_tol,
                no_effective_length_correction: *no_effective_length_correction,
                no_frag_length_dist: *no_frag_length_dist,
                mini_batch_size: *mini_batch_size,
                threads: *threads,
                seed: *seed,
                verbose: args.verbose,
            };
            init_thread_pool(*threads);
            get_input_list(file_list, hits_files, lib_type)
                .and_then(|inputs| run_quant(transcripts, &inputs, output, &opts))
        }
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
    let end = Instant::now();
    eprintln!("streamquant done in {}s", end.duration_since(start).as_secs());
    log::info!("Complete");
}
