//! Common helper functions for parsing file input
//!
//! The reference transcripts are read with [`needletail`], and the read
//! libraries are assembled from either a list of hit files given on the
//! command line or a file list.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::str;
use std::sync::Arc;

use hashbrown::HashMap;
use needletail::{parse_fastx_file, parser::Format};
use regex::Regex;

use crate::aligner::HitsFileAligner;
use crate::alignment::LibraryFormat;
use crate::error::QuantError;
use crate::quantify::ReadLibrary;
use crate::transcript::{Transcript, DEFAULT_PER_BASE_PRIOR};

/// Library name, library type and hits file
pub type InputLibrary = (String, String, String);

/// Load reference transcripts from a (multi-)FASTA file.
///
/// Transcript ids follow file order. The name is the first word of each
/// header. Also returns a map from name to id.
pub fn read_transcripts(
    filename: &str,
) -> Result<(Vec<Transcript>, HashMap<String, u32>), QuantError> {
    let reference_err = |msg: String| QuantError::Reference {
        path: filename.into(),
        msg,
    };
    let mut reader = parse_fastx_file(filename).map_err(|e| reference_err(e.to_string()))?;

    let mut transcripts = Vec::new();
    let mut name_to_id = HashMap::new();
    while let Some(record) = reader.next() {
        let seqrec = record.map_err(|e| reference_err(e.to_string()))?;
        if seqrec.format() == Format::Fastq {
            return Err(reference_err(
                "transcripts must be given as FASTA, not FASTQ".to_string(),
            ));
        }
        let name = str::from_utf8(seqrec.id())
            .map_err(|e| reference_err(e.to_string()))?
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            return Err(reference_err(format!(
                "record {} has no name",
                transcripts.len() + 1
            )));
        }
        let id = transcripts.len() as u32;
        if name_to_id.insert(name.clone(), id).is_some() {
            return Err(reference_err(format!("duplicate transcript name {name}")));
        }
        transcripts.push(Transcript::new(
            id,
            &name,
            seqrec.num_bases() as u32,
            DEFAULT_PER_BASE_PRIOR,
        ));
    }

    if transcripts.is_empty() {
        return Err(reference_err("no transcripts found".to_string()));
    }
    log::info!("Read {} transcripts from {filename}", transcripts.len());
    Ok((transcripts, name_to_id))
}

/// Name each hits file after its file name, with the extension removed.
///
/// If this cannot be parsed then the full filename is used.
pub fn read_input_hits(hits_files: &[String], lib_type: &str) -> Vec<InputLibrary> {
    // matches the file name (no extension) in a full path
    let re_path = Regex::new(r"^.+/(.+)\.(?i:hits|txt|tsv)$").ok();
    // matches the file name (no extension) with no path
    let re_name = Regex::new(r"^(.+)\.(?i:hits|txt|tsv)$").ok();
    hits_files
        .iter()
        .map(|file| {
            let caps = re_path
                .as_ref()
                .and_then(|re| re.captures(file))
                .or_else(|| re_name.as_ref().and_then(|re| re.captures(file)));
            let name = match caps {
                Some(capture) => capture[1].to_string(),
                None => file.to_string(),
            };
            (name, lib_type.to_string(), file.to_string())
        })
        .collect()
}

/// Obtain a list of libraries from command line input.
///
/// If `file_list` is provided, read each line as `name\tlib_type\thits`, or
/// `name\thits` to use `lib_type`. Blank lines are skipped.
///
/// Otherwise `hits_files` are used with [`read_input_hits`].
pub fn get_input_list(
    file_list: &Option<String>,
    hits_files: &Option<Vec<String>>,
    lib_type: &str,
) -> Result<Vec<InputLibrary>, QuantError> {
    match file_list {
        Some(list) => {
            let f = BufReader::new(File::open(list)?);
            let mut input_files = Vec::new();
            for (line_no, line) in f.lines().enumerate() {
                let line = line?;
                let fields: Vec<&str> = line.split_whitespace().collect();
                match fields.len() {
                    0 => continue,
                    2 => input_files.push((
                        fields[0].to_string(),
                        lib_type.to_string(),
                        fields[1].to_string(),
                    )),
                    3 => input_files.push((
                        fields[0].to_string(),
                        fields[1].to_string(),
                        fields[2].to_string(),
                    )),
                    _ => {
                        return Err(QuantError::InvalidOptions(format!(
                            "unable to parse line {} of {list}",
                            line_no + 1
                        )))
                    }
                }
            }
            Ok(input_files)
        }
        None => match hits_files {
            Some(files) if !files.is_empty() => Ok(read_input_hits(files, lib_type)),
            _ => Err(QuantError::InvalidOptions(
                "no hit files given".to_string(),
            )),
        },
    }
}

/// Open a [`HitsFileAligner`] for every library.
///
/// Only one library may be read from stdin.
pub fn build_libraries(
    inputs: &[InputLibrary],
    name_to_id: Arc<HashMap<String, u32>>,
    coverage_threshold: f64,
) -> Result<Vec<ReadLibrary>, QuantError> {
    if inputs.iter().filter(|(_, _, path)| path == "-").count() > 1 {
        return Err(QuantError::InvalidOptions(
            "stdin can only be used for one library".to_string(),
        ));
    }
    inputs
        .iter()
        .map(|(name, lib_type, path)| {
            let format = LibraryFormat::parse(lib_type)?;
            let aligner = HitsFileAligner::new(path, Arc::clone(&name_to_id), coverage_threshold)?;
            log::info!("Library {name}: {path} ({format})");
            Ok(ReadLibrary::new(name, format, Box::new(aligner)))
        })
        .collect()
}

