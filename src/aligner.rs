//! Sources of candidate alignments.
//!
//! Read mapping itself happens outside this crate. An [`Aligner`] hands over
//! its results one batch of fragments at a time, filling recycled
//! [`AlignmentGroup`]s in place.
//!
//! [`HitsFileAligner`] reads precomputed hits, one fragment per line:
//!
//! ```text
//! # comment
//! txA,IU,0.95,250 txB,IU,0.81,248
//! txC,U,1.0,0
//! ```
//!
//! Each whitespace-separated field is `transcript,format,score,frag_len`. An
//! empty line is a fragment with no hits. Hits on transcripts missing from the
//! reference are dropped and counted.
use std::fs::File;
use std::io::{stdin, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::alignment::{Alignment, AlignmentGroup, LibraryFormat};
use crate::error::QuantError;

/// Produces candidate alignments for a stream of fragments
pub trait Aligner: Send {
    /// Fill up to `groups.len()` groups with the next fragments.
    ///
    /// Each group is cleared before it is filled. Returns how many groups were
    /// filled, zero once the source is exhausted.
    fn align_batch(&mut self, groups: &mut [AlignmentGroup]) -> Result<usize, QuantError>;

    /// Go back to the first fragment. Returns false if the source cannot be
    /// read again.
    fn rewind(&mut self) -> bool;

    /// Hits dropped during the first pass because they named a transcript
    /// missing from the reference
    fn num_dropped_hits(&self) -> u64 {
        0
    }
}

/// Aligner over groups already in memory
#[derive(Debug, Clone, Default)]
pub struct VecAligner {
    groups: Vec<AlignmentGroup>,
    pos: usize,
    rewindable: bool,
}

impl VecAligner {
    /// A rewindable source over `groups`
    pub fn new(groups: Vec<AlignmentGroup>) -> Self {
        Self {
            groups,
            pos: 0,
            rewindable: true,
        }
    }

    /// A source over `groups` that can only be read once
    pub fn single_pass(groups: Vec<AlignmentGroup>) -> Self {
        Self {
            groups,
            pos: 0,
            rewindable: false,
        }
    }
}

impl Aligner for VecAligner {
    fn align_batch(&mut self, groups: &mut [AlignmentGroup]) -> Result<usize, QuantError> {
        let mut filled = 0;
        for group in groups.iter_mut() {
            let Some(src) = self.groups.get(self.pos) else {
                break;
            };
            group.clear();
            for aln in src.alignments() {
                group.push(aln.clone());
            }
            self.pos += 1;
            filled += 1;
        }
        Ok(filled)
    }

    fn rewind(&mut self) -> bool {
        if self.rewindable {
            self.pos = 0;
        }
        self.rewindable
    }
}

/// Aligner over a file of precomputed hits
pub struct HitsFileAligner {
    path: Option<PathBuf>,
    reader: Box<dyn BufRead + Send>,
    name_to_id: Arc<HashMap<String, u32>>,
    coverage_threshold: f64,
    line_no: usize,
    line: String,
    first_pass: bool,
    num_unknown: u64,
}

impl HitsFileAligner {
    /// Open `path`, or stdin if it is `-`.
    ///
    /// Hits scoring below `coverage_threshold` are dropped. Transcript names are
    /// resolved with `name_to_id`.
    pub fn new(
        path: &str,
        name_to_id: Arc<HashMap<String, u32>>,
        coverage_threshold: f64,
    ) -> Result<Self, QuantError> {
        let (path, reader) = if path == "-" {
            (None, Box::new(BufReader::new(stdin())) as Box<dyn BufRead + Send>)
        } else {
            let file = File::open(path)?;
            (
                Some(PathBuf::from(path)),
                Box::new(BufReader::new(file)) as Box<dyn BufRead + Send>,
            )
        };
        Ok(Self {
            path,
            reader,
            name_to_id,
            coverage_threshold,
            line_no: 0,
            line: String::new(),
            first_pass: true,
            num_unknown: 0,
        })
    }

    fn source_name(&self) -> String {
        match &self.path {
            Some(p) => p.display().to_string(),
            None => "stdin".to_string(),
        }
    }

    fn malformed(&self, msg: String) -> QuantError {
        QuantError::MalformedHit {
            source_name: self.source_name(),
            line: self.line_no,
            msg,
        }
    }

    // None if the hit names an unknown transcript
    fn parse_hit(&mut self, field: &str) -> Result<Option<Alignment>, QuantError> {
        let parts: Vec<&str> = field.split(',').collect();
        if parts.len() != 4 {
            return Err(self.malformed(format!(
                "expected transcript,format,score,frag_len but got '{field}'"
            )));
        }
        let Some(&transcript_id) = self.name_to_id.get(parts[0]) else {
            if self.first_pass {
                if self.num_unknown == 0 {
                    log::warn!(
                        "{} line {}: transcript {} is not in the reference, dropping hits to \
                         unknown transcripts",
                        self.source_name(),
                        self.line_no,
                        parts[0]
                    );
                }
                self.num_unknown += 1;
            }
            return Ok(None);
        };
        let lib_format = LibraryFormat::parse(parts[1])?;
        let score: f64 = parts[2]
            .parse()
            .map_err(|_| self.malformed(format!("`{}` isn't a valid score", parts[2])))?;
        let frag_len: u32 = parts[3]
            .parse()
            .map_err(|_| self.malformed(format!("`{}` isn't a valid fragment length", parts[3])))?;
        Ok(Some(Alignment::new(transcript_id, lib_format, score, frag_len)))
    }

    // Reads the next non-comment line into self.line. Returns false at EOF.
    fn next_line(&mut self) -> Result<bool, QuantError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(false);
            }
            self.line_no += 1;
            if !self.line.starts_with('#') {
                return Ok(true);
            }
        }
    }
}

impl Aligner for HitsFileAligner {
    fn align_batch(&mut self, groups: &mut [AlignmentGroup]) -> Result<usize, QuantError> {
        let mut filled = 0;
        for group in groups.iter_mut() {
            if !self.next_line()? {
                break;
            }
            group.clear();
            let line = std::mem::take(&mut self.line);
            for field in line.split_whitespace() {
                match self.parse_hit(field)? {
                    Some(aln) if aln.score >= self.coverage_threshold => group.push(aln),
                    _ => (),
                }
            }
            self.line = line;
            filled += 1;
        }
        Ok(filled)
    }

    fn rewind(&mut self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        match File::open(path) {
            Ok(file) => {
                self.reader = Box::new(BufReader::new(file));
                self.line_no = 0;
                self.first_pass = false;
                true
            }
            Err(e) => {
                log::warn!("Could not reopen {}: {e}", path.display());
                false
            }
        }
    }

    fn num_dropped_hits(&self) -> u64 {
        self.num_unknown
    }
}
