//! Output tables written at the end of a run.
//!
//! * `quant.sf`: one row per transcript with its length, effective length,
//!   relative abundance and estimated read count.
//! * `lib_format_counts.txt`: per library, how many first-round alignments
//!   showed each library format.
//! * `libParams/flenDist.txt`: the learned fragment length distribution.
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::alignment::LibraryFormat;
use crate::eq_class::effective_length;
use crate::error::QuantError;
use crate::frag_len_dist::FragmentLengthDistribution;
use crate::quantify::{QuantSummary, ReadExperiment, ReadLibrary};
use crate::transcript::Transcript;

/// Abundance table, tab separated with a header
pub fn write_quant_table<W: Write>(
    out: &mut W,
    transcripts: &[Transcript],
    no_eff_len_correction: bool,
) -> std::io::Result<()> {
    writeln!(out, "Name\tLength\tEffectiveLength\tMass\tNumReads")?;
    for t in transcripts {
        writeln!(
            out,
            "{}\t{}\t{:.3}\t{:.6e}\t{:.3}",
            t.name,
            t.ref_length,
            effective_length(t, no_eff_len_correction),
            t.projected_mass,
            t.est_count
        )?;
    }
    Ok(())
}

/// Library format counts for one library
pub fn write_lib_format_counts<W: Write>(out: &mut W, lib: &ReadLibrary) -> std::io::Result<()> {
    let counts = lib.lib_type_counts();
    let total: u64 = counts.iter().sum();
    writeln!(out, "library\t{}", lib.name())?;
    writeln!(out, "expected_format\t{}", lib.format())?;
    writeln!(out, "total_alignments\t{total}")?;
    writeln!(out, "num_incompatible\t{}", lib.num_incompatible())?;
    writeln!(out, "num_invalid_hits\t{}", lib.num_invalid_hits())?;
    for (id, count) in counts.iter().enumerate() {
        if *count == 0 {
            continue;
        }
        if let Some(format) = LibraryFormat::from_id(id as u8) {
            writeln!(out, "{format}\t{count}")?;
        }
    }
    Ok(())
}

/// Probabilities of every fragment length from 0, tab separated on one line
pub fn write_fld<W: Write>(out: &mut W, fld: &FragmentLengthDistribution) -> std::io::Result<()> {
    let probs: Vec<String> = fld.to_probs().iter().map(|p| format!("{p:.6e}")).collect();
    writeln!(out, "{}", probs.join("\t"))
}

/// Summary counters as `key\tvalue` lines
pub fn write_summary<W: Write>(out: &mut W, summary: &QuantSummary) -> std::io::Result<()> {
    writeln!(out, "num_observed\t{}", summary.num_observed)?;
    writeln!(out, "num_assigned\t{}", summary.num_assigned)?;
    writeln!(out, "first_pass_observed\t{}", summary.first_pass_observed)?;
    writeln!(out, "first_pass_assigned\t{}", summary.first_pass_assigned)?;
    writeln!(out, "mapping_rate\t{:.6}", summary.mapping_rate)?;
    writeln!(out, "rounds\t{}", summary.rounds)?;
    writeln!(out, "stopped_early\t{}", summary.stopped_early)?;
    writeln!(out, "num_eq_classes\t{}", summary.num_eq_classes)?;
    writeln!(out, "num_degenerate\t{}", summary.num_degenerate)?;
    writeln!(out, "em_iterations\t{}", summary.em_iterations)?;
    writeln!(out, "em_converged\t{}", summary.em_converged)
}

/// Write every output table under `output_dir`
pub fn write_outputs(
    output_dir: &Path,
    experiment: &ReadExperiment,
    summary: &QuantSummary,
    no_eff_len_correction: bool,
) -> Result<(), QuantError> {
    create_dir_all(output_dir.join("libParams"))?;

    let mut quant = BufWriter::new(File::create(output_dir.join("quant.sf"))?);
    write_quant_table(&mut quant, experiment.transcripts(), no_eff_len_correction)?;
    quant.flush()?;

    let mut lib_counts = BufWriter::new(File::create(output_dir.join("lib_format_counts.txt"))?);
    for lib in experiment.libraries() {
        write_lib_format_counts(&mut lib_counts, lib)?;
    }
    lib_counts.flush()?;

    let mut fld = BufWriter::new(File::create(
        output_dir.join("libParams").join("flenDist.txt"),
    )?);
    write_fld(&mut fld, experiment.fld())?;
    fld.flush()?;

    let mut summary_out = BufWriter::new(File::create(output_dir.join("quant_summary.txt"))?);
    write_summary(&mut summary_out, summary)?;
    summary_out.flush()?;

    log::info!("Wrote results to {}", output_dir.display());
    Ok(())
}
