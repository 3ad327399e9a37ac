//! Candidate alignments for one fragment, and the library format model.
//!
//! A library format is the combination of read type, relative mate
//! orientation and strandedness. It packs into one byte:
//!
//! ```text
//! format_id = read_type | orientation << 1 | strandedness << 3
//! ```
//!
//! Library types are written the usual way, e.g. `U`, `SF`, `ISR`, `MU`.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::QuantError;
use crate::math::LOG_1;

/// Single or paired-end reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadType {
    /// One read per fragment
    SingleEnd = 0,
    /// Two mates per fragment
    PairedEnd = 1,
}

/// Relative orientation of the mates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadOrientation {
    /// Mates on the same strand (M)
    Same = 0,
    /// Mates point away from each other (O)
    Away = 1,
    /// Mates point towards each other (I)
    Toward = 2,
    /// Single-end reads
    None = 3,
}

/// Which strand the read (or first mate) comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadStrandedness {
    /// Sense
    S = 0,
    /// Antisense
    A = 1,
    /// First mate sense, second antisense
    SA = 2,
    /// First mate antisense, second sense
    AS = 3,
    /// Unstranded
    U = 4,
}

/// Read type, orientation and strandedness of a library or of one alignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub struct LibraryFormat {
    /// Single or paired
    pub read_type: ReadType,
    /// Mate orientation
    pub orientation: ReadOrientation,
    /// Strand
    pub strandedness: ReadStrandedness,
}

/// Largest value [`LibraryFormat::format_id`] can return
pub const MAX_LIB_TYPE_ID: u8 = 1 | (3 << 1) | (4 << 3);

impl LibraryFormat {
    /// Build from the three components
    pub fn new(
        read_type: ReadType,
        orientation: ReadOrientation,
        strandedness: ReadStrandedness,
    ) -> Self {
        Self {
            read_type,
            orientation,
            strandedness,
        }
    }

    /// Compact one-byte encoding
    pub fn format_id(&self) -> u8 {
        (self.read_type as u8) | ((self.orientation as u8) << 1) | ((self.strandedness as u8) << 3)
    }

    /// Inverse of [`format_id`](Self::format_id)
    pub fn from_id(id: u8) -> Option<Self> {
        let read_type = match id & 0x1 {
            0 => ReadType::SingleEnd,
            _ => ReadType::PairedEnd,
        };
        let orientation = match (id >> 1) & 0x3 {
            0 => ReadOrientation::Same,
            1 => ReadOrientation::Away,
            2 => ReadOrientation::Toward,
            _ => ReadOrientation::None,
        };
        let strandedness = match id >> 3 {
            0 => ReadStrandedness::S,
            1 => ReadStrandedness::A,
            2 => ReadStrandedness::SA,
            3 => ReadStrandedness::AS,
            4 => ReadStrandedness::U,
            _ => return None,
        };
        Some(Self::new(read_type, orientation, strandedness))
    }

    /// Parse a library type string such as `ISR`
    pub fn parse(lib_type: &str) -> Result<Self, QuantError> {
        use ReadOrientation as O;
        use ReadStrandedness as S;
        use ReadType::*;
        let format = match lib_type {
            "U" => Self::new(SingleEnd, O::None, S::U),
            "SF" => Self::new(SingleEnd, O::None, S::S),
            "SR" => Self::new(SingleEnd, O::None, S::A),
            "IU" => Self::new(PairedEnd, O::Toward, S::U),
            "ISF" => Self::new(PairedEnd, O::Toward, S::SA),
            "ISR" => Self::new(PairedEnd, O::Toward, S::AS),
            "OU" => Self::new(PairedEnd, O::Away, S::U),
            "OSF" => Self::new(PairedEnd, O::Away, S::SA),
            "OSR" => Self::new(PairedEnd, O::Away, S::AS),
            "MU" => Self::new(PairedEnd, O::Same, S::U),
            "MSF" => Self::new(PairedEnd, O::Same, S::S),
            "MSR" => Self::new(PairedEnd, O::Same, S::A),
            _ => return Err(QuantError::InvalidLibraryFormat(lib_type.to_string())),
        };
        Ok(format)
    }

    /// Whether an alignment of format `self` fits a library of format `expected`
    pub fn is_compatible_with(&self, expected: &Self) -> bool {
        self.read_type == expected.read_type
            && self.orientation == expected.orientation
            && (expected.strandedness == ReadStrandedness::U
                || expected.strandedness == self.strandedness)
    }
}

impl fmt::Display for LibraryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ReadOrientation as O;
        use ReadStrandedness as S;
        let orient = match self.orientation {
            O::Same => "M",
            O::Away => "O",
            O::Toward => "I",
            O::None => "",
        };
        let strand = match self.strandedness {
            S::U => "U",
            S::S | S::SA => "SF",
            S::A | S::AS => "SR",
        };
        write!(f, "{orient}{strand}")
    }
}

impl From<LibraryFormat> for u8 {
    fn from(format: LibraryFormat) -> u8 {
        format.format_id()
    }
}

impl TryFrom<u8> for LibraryFormat {
    type Error = String;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Self::from_id(id).ok_or_else(|| format!("invalid library format id {id}"))
    }
}

/// Log probability that an alignment of format `observed` arose from a
/// library of format `expected`
pub fn log_align_format_prob(
    observed: &LibraryFormat,
    expected: &LibraryFormat,
    log_incompat_prior: f64,
) -> f64 {
    if observed.is_compatible_with(expected) {
        LOG_1
    } else {
        log_incompat_prior
    }
}

/// One candidate placement of a fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alignment {
    /// Index of the target transcript
    pub transcript_id: u32,
    /// Format the fragment showed on this transcript
    pub lib_format: LibraryFormat,
    /// Coverage score in [0, 1]
    pub score: f64,
    /// Inferred fragment length, 0 if unknown
    pub frag_len: u32,
    /// Working log probability, not persisted
    #[serde(skip)]
    pub log_prob: f64,
}

impl Alignment {
    /// New alignment with a zero working probability
    pub fn new(transcript_id: u32, lib_format: LibraryFormat, score: f64, frag_len: u32) -> Self {
        Self {
            transcript_id,
            lib_format,
            score,
            frag_len,
            log_prob: 0.0,
        }
    }
}

/// All candidate alignments of one fragment.
///
/// Groups are recycled through queues, so [`clear`](Self::clear) keeps the
/// allocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignmentGroup {
    alignments: Vec<Alignment>,
}

impl AlignmentGroup {
    /// An empty group
    pub fn new() -> Self {
        Self::default()
    }

    /// Group holding `alignments`
    pub fn from_alignments(alignments: Vec<Alignment>) -> Self {
        Self { alignments }
    }

    /// Candidates
    pub fn alignments(&self) -> &[Alignment] {
        &self.alignments
    }

    /// Candidates, mutably
    pub fn alignments_mut(&mut self) -> &mut [Alignment] {
        &mut self.alignments
    }

    /// Append a candidate
    pub fn push(&mut self, aln: Alignment) {
        self.alignments.push(aln);
    }

    /// Drop all candidates, keeping capacity
    pub fn clear(&mut self) {
        self.alignments.clear();
    }

    /// Number of candidates
    pub fn size(&self) -> usize {
        self.alignments.len()
    }

    /// True if there are no candidates
    pub fn is_empty(&self) -> bool {
        self.alignments.is_empty()
    }

    /// True if every candidate is on the same transcript
    pub fn is_uniquely_mapped(&self) -> bool {
        match self.alignments.split_first() {
            Some((first, rest)) => rest
                .iter()
                .all(|a| a.transcript_id == first.transcript_id),
            None => false,
        }
    }
}
