use std::sync::Arc;

use assert_fs::TempDir;

use streamquant::aligner::VecAligner;
use streamquant::alignment::AlignmentGroup;
use streamquant::alignment::LibraryFormat;
use streamquant::error::QuantError;
use streamquant::io_utils::{build_libraries, read_transcripts};
use streamquant::output::write_outputs;
use streamquant::quantify::*;
use streamquant::transcript::{Transcript, DEFAULT_PER_BASE_PRIOR};
use streamquant::QuantOpts;

pub mod common;
use crate::common::*;

#[cfg(test)]
use pretty_assertions::assert_eq;

// Half the fragments unique to the first transcript, half shared with the second
fn shared_groups(n: usize) -> Vec<AlignmentGroup> {
    (0..n)
        .map(|i| {
            if i % 2 == 0 {
                group_of(&[0])
            } else {
                group_of(&[0, 1])
            }
        })
        .collect()
}

fn experiment(groups: Vec<AlignmentGroup>, rewindable: bool) -> ReadExperiment {
    let transcripts = vec![
        Transcript::new(0, "txA", 1000, DEFAULT_PER_BASE_PRIOR),
        Transcript::new(1, "txB", 1000, DEFAULT_PER_BASE_PRIOR),
        Transcript::new(2, "txC", 1000, DEFAULT_PER_BASE_PRIOR),
    ];
    let aligner = if rewindable {
        VecAligner::new(groups)
    } else {
        VecAligner::single_pass(groups)
    };
    let format = LibraryFormat::parse("U").unwrap();
    let library = ReadLibrary::new("sample", format, Box::new(aligner));
    ReadExperiment::new(transcripts, vec![library]).unwrap()
}

fn est_counts(experiment: &ReadExperiment) -> Vec<f64> {
    experiment.transcripts().iter().map(|t| t.est_count).collect()
}

#[test]
fn single_round() {
    let dir = TempDir::new().unwrap();
    let mut exp = experiment(shared_groups(100), true);
    let opts = QuantOpts {
        num_required_frags: 100,
        ..Default::default()
    };
    let summary = quantify_library(&mut exp, &opts, dir.path()).unwrap();

    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.num_observed, 100);
    assert_eq!(summary.num_assigned, 100);
    assert_eq!(summary.first_pass_observed, 100);
    assert_eq!(summary.first_pass_assigned, 100);
    assert_eq!(summary.mapping_rate, 1.0);
    assert_eq!(summary.num_eq_classes, 2);
    assert!(!summary.stopped_early);

    let counts = est_counts(&exp);
    assert!(counts[0] > counts[1]);
    assert_eq!(counts[2], 0.0);
    assert!((counts.iter().sum::<f64>() - 100.0).abs() < 1e-6);
    assert_eq!(exp.eq_classes().len(), 2);

    // the mapping cache is removed
    assert!(!dir.path().join("alnCache_0.bin").exists());
}

#[test]
fn replays_until_required() {
    let dir = TempDir::new().unwrap();
    let mut exp = experiment(shared_groups(100), true);
    let opts = QuantOpts {
        num_required_frags: 1000,
        mini_batch_size: 16,
        ..Default::default()
    };
    let summary = quantify_library(&mut exp, &opts, dir.path()).unwrap();

    assert_eq!(summary.rounds, 10);
    assert_eq!(summary.num_observed, 1000);
    assert_eq!(summary.num_assigned, 1000);
    // counts come from the first pass only
    assert_eq!(summary.first_pass_observed, 100);
    assert!((est_counts(&exp).iter().sum::<f64>() - 100.0).abs() < 1e-6);

    let clusters = exp.cluster_forest().clusters();
    assert_eq!(clusters[0].members, vec![0, 1]);
    assert_eq!(clusters[0].count, 100);
    assert!(!dir.path().join("alnCache_0.bin").exists());
}

#[test]
fn replays_from_disk() {
    let dir = TempDir::new().unwrap();
    let mut exp = experiment(shared_groups(60), true);
    let opts = QuantOpts {
        num_required_frags: 240,
        mapping_cache_memory_limit: 10,
        mini_batch_size: 7,
        ..Default::default()
    };
    let summary = quantify_library(&mut exp, &opts, dir.path()).unwrap();
    assert_eq!(summary.rounds, 4);
    assert_eq!(summary.num_observed, 240);
    assert!(est_counts(&exp)[0] > est_counts(&exp)[1]);
}

#[test]
fn rereads_without_cache() {
    let dir = TempDir::new().unwrap();
    let mut exp = experiment(shared_groups(100), true);
    let opts = QuantOpts {
        num_required_frags: 250,
        disable_mapping_cache: true,
        ..Default::default()
    };
    let summary = quantify_library(&mut exp, &opts, dir.path()).unwrap();
    assert_eq!(summary.rounds, 3);
    assert_eq!(summary.num_observed, 300);
    assert!(!summary.stopped_early);
    assert!(!dir.path().join("alnCache_0.bin").exists());
}

#[test]
fn single_pass_source_stops_early() {
    let dir = TempDir::new().unwrap();
    let mut exp = experiment(shared_groups(100), false);
    let opts = QuantOpts {
        num_required_frags: 1000,
        disable_mapping_cache: true,
        ..Default::default()
    };
    let summary = quantify_library(&mut exp, &opts, dir.path()).unwrap();
    assert!(summary.stopped_early);
    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.num_observed, 100);
    // abundances are still estimated
    assert!(est_counts(&exp)[0] > 0.0);
}

#[test]
fn mass_banking_reconciles_counts() {
    let dir = TempDir::new().unwrap();
    let mut exp = experiment(shared_groups(100), true);
    let opts = QuantOpts {
        num_required_frags: 300,
        use_mass_banking: true,
        ..Default::default()
    };
    let summary = quantify_library(&mut exp, &opts, dir.path()).unwrap();

    // every round counts each first-pass fragment exactly once
    assert_eq!(summary.rounds, 3);
    assert_eq!(summary.first_pass_assigned, 100);
    assert_eq!(summary.num_assigned, 300);
    assert_eq!(summary.num_observed, 300);
    assert!(est_counts(&exp)[0] > est_counts(&exp)[1]);
}

#[test]
fn threaded_workers() {
    let dir = TempDir::new().unwrap();
    let mut exp = experiment(shared_groups(500), true);
    let opts = QuantOpts {
        num_required_frags: 1500,
        threads: 4,
        mini_batch_size: 8,
        ..Default::default()
    };
    let summary = quantify_library(&mut exp, &opts, dir.path()).unwrap();
    assert!(summary.num_observed >= 1500);
    assert_eq!(summary.first_pass_observed, 500);
    assert_eq!(summary.first_pass_assigned, 500);
    let counts = est_counts(&exp);
    assert!(counts[0] > counts[1]);
    assert!((counts.iter().sum::<f64>() - 500.0).abs() < 1e-6);
}

#[test]
fn too_many_hits_discarded() {
    let dir = TempDir::new().unwrap();
    let mut groups = shared_groups(40);
    groups.extend((0..10).map(|_| group_of(&[0, 1, 2])));
    let mut exp = experiment(groups, true);
    let opts = QuantOpts {
        num_required_frags: 50,
        max_read_occs: 2,
        ..Default::default()
    };
    let summary = quantify_library(&mut exp, &opts, dir.path()).unwrap();
    assert_eq!(summary.first_pass_observed, 50);
    assert_eq!(summary.first_pass_assigned, 40);
    assert!((summary.mapping_rate - 0.8).abs() < 1e-12);
    assert_eq!(est_counts(&exp)[2], 0.0);
}

#[test]
fn nothing_maps() {
    let dir = TempDir::new().unwrap();
    let mut exp = experiment(vec![AlignmentGroup::new(); 20], true);
    let opts = QuantOpts {
        num_required_frags: 100,
        ..Default::default()
    };
    assert!(matches!(
        quantify_library(&mut exp, &opts, dir.path()),
        Err(QuantError::NoActiveTranscripts)
    ));

    // an empty library stops after one round rather than looping
    let mut exp = experiment(Vec::new(), true);
    assert!(matches!(
        quantify_library(&mut exp, &opts, dir.path()),
        Err(QuantError::NoActiveTranscripts)
    ));
}

#[test]
fn inconsistent_options() {
    let opts = QuantOpts {
        no_frag_length_dist: true,
        ..Default::default()
    };
    assert!(matches!(opts.validate(), Err(QuantError::InvalidOptions(_))));

    let opts = QuantOpts {
        no_frag_length_dist: true,
        no_effective_length_correction: true,
        ..Default::default()
    };
    assert!(opts.validate().is_ok());

    let opts = QuantOpts {
        forgetting_factor: 0.5,
        ..Default::default()
    };
    assert!(opts.validate().is_err());
}

#[test]
fn output_tables() {
    let dir = TempDir::new().unwrap();
    let mut exp = experiment(shared_groups(100), true);
    let opts = QuantOpts {
        num_required_frags: 200,
        ..Default::default()
    };
    let summary = quantify_library(&mut exp, &opts, dir.path()).unwrap();
    write_outputs(dir.path(), &exp, &summary, false).unwrap();

    let quant_sf = std::fs::read_to_string(dir.path().join("quant.sf")).unwrap();
    assert_eq!(
        quant_sf.lines().next().unwrap(),
        "Name\tLength\tEffectiveLength\tMass\tNumReads"
    );
    let rows = quant_rows(&quant_sf);
    assert_eq!(
        rows.iter().map(|r| r.0.as_str()).collect::<Vec<&str>>(),
        vec!["txA", "txB", "txC"]
    );
    assert_eq!(rows[0].1, 1000);
    assert!((rows.iter().map(|r| r.4).sum::<f64>() - 100.0).abs() < 0.01);

    let lib_counts = std::fs::read_to_string(dir.path().join("lib_format_counts.txt")).unwrap();
    assert!(lib_counts.contains("expected_format\tU"));
    assert!(lib_counts.contains("total_alignments\t150"));
    assert!(lib_counts.contains("num_incompatible\t0"));

    assert!(dir.path().join("libParams").join("flenDist.txt").exists());
    let summary_out = std::fs::read_to_string(dir.path().join("quant_summary.txt")).unwrap();
    assert!(summary_out.contains("rounds\t2"));
}

#[test]
fn failed_round_removes_cache() {
    let sandbox = TestSetup::setup();
    let (transcripts, name_to_id) =
        read_transcripts(&sandbox.file_string("transcripts.fa", TestDir::Input)).unwrap();
    let inputs = vec![(
        "malformed".to_string(),
        "IU".to_string(),
        sandbox.file_string("malformed.hits", TestDir::Input),
    )];
    let libraries = build_libraries(&inputs, Arc::new(name_to_id), 0.7).unwrap();
    let mut exp = ReadExperiment::new(transcripts, libraries).unwrap();
    let out_dir = sandbox.file_path("out", TestDir::Output);
    std::fs::create_dir_all(&out_dir).unwrap();

    let opts = QuantOpts {
        num_required_frags: 10,
        ..Default::default()
    };
    assert!(matches!(
        quantify_library(&mut exp, &opts, &out_dir),
        Err(QuantError::MalformedHit { .. })
    ));
    assert_eq!(false, sandbox.file_exists("out/alnCache_0.bin"));
}
