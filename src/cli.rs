use clap::{ArgGroup, Parser, Subcommand};

extern crate num_cpus;

/// Default fragments to observe before stopping
pub const DEFAULT_REQUIRED_FRAGS: u64 = 50_000_000;
/// Default forgetting factor
pub const DEFAULT_FORGETTING_FACTOR: f64 = 0.65;
/// Default fragments assigned before auxiliary models are fixed
pub const DEFAULT_BURNIN_FRAGS: u64 = 5_000_000;
/// Default minimum hit score
pub const DEFAULT_COVERAGE: f64 = 0.70;
/// Default limit on hits per fragment
pub const DEFAULT_MAX_READ_OCCS: usize = 100;
/// Default prior probability of an incompatible alignment
pub const DEFAULT_INCOMPAT_PRIOR: f64 = 1e-5;
/// Default fragments kept in memory when replaying the mapping cache
pub const DEFAULT_MAPPING_CACHE_MEMORY_LIMIT: u64 = 5_000_000;
/// Default EM iteration limit
pub const DEFAULT_MAX_EM_ITER: usize = 1000;
/// Default EM relative tolerance
pub const DEFAULT_EM_REL_TOL: f64 = 0.01;
/// Default fragments per mini-batch
pub const DEFAULT_MINI_BATCH: usize = 1000;
/// Default library type
pub const DEFAULT_LIB_TYPE: &str = "IU";
/// Default random seed
pub const DEFAULT_SEED: u64 = 42;

fn zero_to_one(s: &str) -> Result<f64, String> {
    let f: f64 = s
        .parse()
        .map_err(|_| format!("`{}` isn't a valid probability", s))?;
    if !(0.0..=1.0).contains(&f) {
        Err("Value must be between 0 and 1 (inclusive)".to_string())
    } else {
        Ok(f)
    }
}

fn valid_forgetting_factor(s: &str) -> Result<f64, String> {
    let f: f64 = s
        .parse()
        .map_err(|_| format!("`{}` isn't a valid forgetting factor", s))?;
    if f <= 0.5 || f > 1.0 {
        Err("Forgetting factor must be in (0.5, 1.0]".to_string())
    } else {
        Ok(f)
    }
}

fn valid_cpus(s: &str) -> Result<usize, String> {
    let threads: usize = s
        .parse()
        .map_err(|_| format!("`{}` isn't a valid number of cores", s))?;
    let max_threads = num_cpus::get();
    if threads < 1 || threads > max_threads {
        Err(format!("Threads must be between 1 and {}", max_threads))
    } else {
        Ok(threads)
    }
}

fn positive(s: &str) -> Result<usize, String> {
    let n: usize = s
        .parse()
        .map_err(|_| format!("`{}` isn't a valid count", s))?;
    if n == 0 {
        Err("Value must be at least 1".to_string())
    } else {
        Ok(n)
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Show progress messages
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(group(
        ArgGroup::new("input")
            .required(true)
            .args(["hits_files", "file_list"]),
    ))]
    /// Estimate transcript abundances from precomputed hits
    Quant {
        /// Transcript FASTA file
        #[arg(short = 't', long)]
        transcripts: String,

        /// Hit files, one per library (`-` for stdin)
        #[arg(group = "input")]
        hits_files: Option<Vec<String>>,

        /// File listing libraries (tab separated name, library type, hits file)
        #[arg(short, group = "input")]
        file_list: Option<String>,

        /// Library type of the hit files (U, SF, SR, IU, ISF, ISR, OU, OSF, OSR, MU, MSF, MSR)
        #[arg(short, long, default_value_t = DEFAULT_LIB_TYPE.to_string())]
        lib_type: String,

        /// Output directory
        #[arg(short)]
        output: String,

        /// Fragments to observe, replaying the input as needed
        #[arg(short = 'n', long, default_value_t = DEFAULT_REQUIRED_FRAGS)]
        num_required_obs: u64,

        /// Forgetting factor of the online updates
        #[arg(long, value_parser = valid_forgetting_factor, default_value_t = DEFAULT_FORGETTING_FACTOR)]
        forgetting_factor: f64,

        /// Fragments assigned before the fragment length model and effective lengths are fixed
        #[arg(long, default_value_t = DEFAULT_BURNIN_FRAGS)]
        num_burnin_frags: u64,

        /// Minimum score for a hit to be kept
        #[arg(short, long, value_parser = zero_to_one, default_value_t = DEFAULT_COVERAGE)]
        coverage: f64,

        /// Fragments with more hits than this are discarded
        #[arg(long, value_parser = positive, default_value_t = DEFAULT_MAX_READ_OCCS)]
        max_read_occs: usize,

        /// Prior probability of an alignment incompatible with the library type
        #[arg(long, value_parser = zero_to_one, default_value_t = DEFAULT_INCOMPAT_PRIOR)]
        incompat_prior: f64,

        /// Penalise alignments incompatible with the library type
        #[arg(long, default_value_t = false)]
        use_read_compat: bool,

        /// Re-read the input every round instead of caching mappings
        #[arg(long, default_value_t = false)]
        disable_mapping_cache: bool,

        /// Replay the mapping cache from memory if a round saw at most this many fragments
        #[arg(long, default_value_t = DEFAULT_MAPPING_CACHE_MEMORY_LIMIT)]
        mapping_cache_memory_limit: u64,

        /// Only cache ambiguous fragments and credit unique ones by ratio
        #[arg(long, default_value_t = false)]
        use_mass_banking: bool,

        /// Use variational Bayes EM rather than EM
        #[arg(long, default_value_t = false)]
        use_vbopt: bool,

        /// Maximum EM iterations
        #[arg(long, value_parser = positive, default_value_t = DEFAULT_MAX_EM_ITER)]
        max_em_iter: usize,

        /// Relative change at which EM has converged
        #[arg(long, default_value_t = DEFAULT_EM_REL_TOL)]
        em_rel_tol: f64,

        /// Use transcript lengths rather than effective lengths
        #[arg(long, default_value_t = false)]
        no_effective_length_correction: bool,

        /// Ignore fragment lengths when scoring alignments
        #[arg(long, default_value_t = false)]
        no_frag_length_dist: bool,

        /// Fragments per mini-batch
        #[arg(long, value_parser = positive, default_value_t = DEFAULT_MINI_BATCH)]
        mini_batch_size: usize,

        /// Seed for fragment length sampling
        #[arg(long, default_value_t = DEFAULT_SEED)]
        seed: u64,

        /// Number of CPU threads
        #[arg(long, value_parser = valid_cpus, default_value_t = 1)]
        threads: usize,
    },
}

pub fn cli_args() -> Args {
    Args::parse()
}
