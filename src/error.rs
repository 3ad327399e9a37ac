//! Errors returned by the quantification pipeline.
//!
//! Per-fragment and per-class conditions (zero probability fragments,
//! degenerate equivalence classes) are not errors. They are counted and logged
//! where they happen.
use std::path::PathBuf;

/// Everything that can stop a quantification run.
#[derive(Debug, thiserror::Error)]
pub enum QuantError {
    /// Reading or writing a file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding a cache record failed
    #[error("Could not write alignment cache {path:?}: {msg}")]
    CacheWrite { path: PathBuf, msg: String },

    /// Decoding a cache record failed
    #[error("Could not read alignment cache {path:?}: {msg}")]
    CacheRead { path: PathBuf, msg: String },

    /// A hit line could not be parsed
    #[error("Malformed hit record at {source_name}:{line}: {msg}")]
    MalformedHit {
        source_name: String,
        line: usize,
        msg: String,
    },

    /// The reference FASTA could not be read
    #[error("Could not parse reference {path:?}: {msg}")]
    Reference { path: PathBuf, msg: String },

    /// A library type string was not recognised
    #[error(
        "Invalid library format '{0}'. Expected one of U, SF, SR, IU, ISF, ISR, OU, OSF, OSR, \
         MU, MSF, MSR"
    )]
    InvalidLibraryFormat(String),

    /// Option values are inconsistent
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Fragment length model parameters are out of range
    #[error("Could not build fragment length distribution: {0}")]
    InvalidDistribution(String),

    /// No transcript can receive mass
    #[error("No active transcripts: every transcript has zero length or no mapping")]
    NoActiveTranscripts,

    /// Total abundance after truncation is numerically zero
    #[error(
        "Total estimated mass ({0:e}) is too small to continue. Check that reads are \
         mapping to the reference"
    )]
    InsufficientMass(f64),
}
