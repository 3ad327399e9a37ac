use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use streamquant::aligner::VecAligner;
use streamquant::alignment::{Alignment, AlignmentGroup, LibraryFormat};
use streamquant::cluster_forest::ClusterForest;
use streamquant::eq_class::EquivalenceClassTable;
use streamquant::forgetting_mass::ForgettingMassCalculator;
use streamquant::frag_len_dist::*;
use streamquant::math::LOG_0;
use streamquant::online::OnlineEngine;
use streamquant::quantify::ReadLibrary;
use streamquant::transcript::{Transcript, DEFAULT_PER_BASE_PRIOR};
use streamquant::QuantOpts;

pub mod common;
use crate::common::*;

#[cfg(test)]
use pretty_assertions::assert_eq;

struct Fixture {
    transcripts: Vec<Transcript>,
    fm_calc: ForgettingMassCalculator,
    cluster_forest: ClusterForest,
    fld: FragmentLengthDistribution,
    eq_table: EquivalenceClassTable,
    num_assigned: AtomicU64,
    burned_in: AtomicBool,
    lib: ReadLibrary,
}

impl Fixture {
    fn new(lengths: &[u32], lib_type: &str) -> Self {
        let transcripts: Vec<Transcript> = lengths
            .iter()
            .enumerate()
            .map(|(i, len)| Transcript::new(i as u32, &format!("tx{i}"), *len, DEFAULT_PER_BASE_PRIOR))
            .collect();
        let fm_calc = ForgettingMassCalculator::new(0.65);
        fm_calc.prefill(16);
        let fld = FragmentLengthDistribution::new(
            DEFAULT_FLD_ALPHA,
            DEFAULT_FLD_MAX,
            DEFAULT_FLD_MEAN,
            DEFAULT_FLD_SD,
            DEFAULT_KERNEL_N,
            DEFAULT_KERNEL_P,
        )
        .unwrap();
        let format = LibraryFormat::parse(lib_type).unwrap();
        Self {
            cluster_forest: ClusterForest::new(transcripts.len()),
            transcripts,
            fm_calc,
            fld,
            eq_table: EquivalenceClassTable::default(),
            num_assigned: AtomicU64::new(0),
            burned_in: AtomicBool::new(false),
            lib: ReadLibrary::new("lib", format, Box::new(VecAligner::new(Vec::new()))),
        }
    }

    fn engine<'a>(&'a self, opts: &'a QuantOpts) -> OnlineEngine<'a> {
        OnlineEngine {
            transcripts: &self.transcripts,
            fm_calc: &self.fm_calc,
            cluster_forest: &self.cluster_forest,
            fld: &self.fld,
            eq_table: &self.eq_table,
            opts,
            num_assigned: &self.num_assigned,
            burned_in: &self.burned_in,
        }
    }
}

#[test]
fn unique_fragments() {
    let fixture = Fixture::new(&[1000, 1000], "U");
    let opts = QuantOpts::default();
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    let mut batch = vec![group_of(&[0]), group_of(&[0]), group_of(&[0, 0])];

    let before = fixture.transcripts[1].mass(false);
    fixture
        .engine(&opts)
        .process_mini_batch(&fixture.lib, 0, &mut batch, &mut rng, true);

    let a = &fixture.transcripts[0];
    assert_eq!(a.unique_count(), 3);
    assert_eq!(a.total_count(), 3);
    assert_eq!(a.shared_count(), 0.0);
    assert!(a.mass(false) > LOG_0);
    assert_eq!(fixture.transcripts[1].mass(false), before);
    assert_eq!(fixture.num_assigned.load(Ordering::Relaxed), 3);

    let classes = fixture.eq_table.into_classes();
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0].label, vec![0]);
    assert_eq!(classes[0].count, 3);
}

#[test]
fn ambiguous_fragments() {
    let fixture = Fixture::new(&[1000, 1000, 1000], "U");
    let opts = QuantOpts::default();
    let mut rng = ChaCha20Rng::seed_from_u64(2);
    let mut batch = vec![group_of(&[0, 1]), group_of(&[1, 0]), group_of(&[2])];
    fixture
        .engine(&opts)
        .process_mini_batch(&fixture.lib, 0, &mut batch, &mut rng, true);

    // normalised per fragment
    for group in &batch {
        let total: f64 = group.alignments().iter().map(|a| a.log_prob.exp()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
    let shared = fixture.transcripts[0].shared_count() + fixture.transcripts[1].shared_count();
    assert!((shared - 2.0).abs() < 1e-9);
    assert_eq!(fixture.transcripts[0].total_count(), 2);
    assert_eq!(fixture.transcripts[0].unique_count(), 0);
    assert_eq!(fixture.transcripts[2].unique_count(), 1);
    assert_eq!(fixture.transcripts[0].last_timestep_updated(), 0);

    let clusters = fixture.cluster_forest.clusters();
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[0].members, vec![0, 1]);
    assert_eq!(clusters[0].count, 2);
    assert_eq!(clusters[1].members, vec![2]);

    let classes = fixture.eq_table.into_classes();
    assert_eq!(classes.len(), 2);
    assert_eq!(classes[0].label, vec![0, 1]);
    assert_eq!(classes[0].count, 2);
}

#[test]
fn zero_probability_fragment_skipped() {
    let fixture = Fixture::new(&[0, 500], "U");
    let opts = QuantOpts::default();
    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let mut batch = vec![group_of(&[0]), AlignmentGroup::new(), group_of(&[1])];
    fixture
        .engine(&opts)
        .process_mini_batch(&fixture.lib, 0, &mut batch, &mut rng, true);

    assert_eq!(fixture.num_assigned.load(Ordering::Relaxed), 1);
    assert_eq!(fixture.transcripts[0].mass(false), LOG_0);
    assert_eq!(fixture.transcripts[0].unique_count(), 0);

    let classes = fixture.eq_table.into_classes();
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0].label, vec![1]);
}

#[test]
fn later_rounds_leave_counts() {
    let fixture = Fixture::new(&[1000, 1000], "U");
    let opts = QuantOpts::default();
    let mut rng = ChaCha20Rng::seed_from_u64(4);
    let engine = fixture.engine(&opts);

    let mut batch = vec![group_of(&[0]), group_of(&[0, 1])];
    engine.process_mini_batch(&fixture.lib, 0, &mut batch, &mut rng, true);
    let mass_after_first = fixture.transcripts[0].mass(false);

    let mut batch = vec![group_of(&[0]), group_of(&[0, 1])];
    engine.process_mini_batch(&fixture.lib, 1, &mut batch, &mut rng, false);

    assert_eq!(fixture.transcripts[0].unique_count(), 1);
    assert_eq!(fixture.transcripts[0].total_count(), 2);
    assert!(fixture.transcripts[0].mass(false) > mass_after_first);
    assert_eq!(fixture.transcripts[0].last_timestep_updated(), 1);
    assert_eq!(fixture.eq_table.len(), 2);
    assert_eq!(fixture.num_assigned.load(Ordering::Relaxed), 4);
}

#[test]
fn burn_in_fixes_models() {
    let fixture = Fixture::new(&[1000, 1000], "IU");
    let opts = QuantOpts {
        num_burnin_frags: 4,
        ..Default::default()
    };
    let mut rng = ChaCha20Rng::seed_from_u64(5);
    let format = LibraryFormat::parse("IU").unwrap();
    let engine = fixture.engine(&opts);

    let mut batch: Vec<AlignmentGroup> = (0..4)
        .map(|_| AlignmentGroup::from_alignments(vec![Alignment::new(0, format, 1.0, 150)]))
        .collect();
    engine.process_mini_batch(&fixture.lib, 0, &mut batch, &mut rng, true);

    assert!(fixture.burned_in.load(Ordering::Relaxed));
    assert_eq!(fixture.fld.min_val(), 150);
    // the learned distribution now favours the observed length
    assert!(fixture.fld.pmf(150) > fixture.fld.pmf(400));

    let probs_at_burn_in = fixture.fld.to_probs();
    let mut batch: Vec<AlignmentGroup> = (0..4)
        .map(|_| AlignmentGroup::from_alignments(vec![Alignment::new(1, format, 1.0, 300)]))
        .collect();
    engine.process_mini_batch(&fixture.lib, 0, &mut batch, &mut rng, true);
    assert_eq!(fixture.fld.to_probs(), probs_at_burn_in);
}

#[test]
fn library_format_counts() {
    let fixture = Fixture::new(&[1000, 1000], "ISR");
    let opts = QuantOpts {
        use_read_compat: true,
        ..Default::default()
    };
    let mut rng = ChaCha20Rng::seed_from_u64(6);
    let isr = LibraryFormat::parse("ISR").unwrap();
    let isf = LibraryFormat::parse("ISF").unwrap();
    let mut batch = vec![AlignmentGroup::from_alignments(vec![
        Alignment::new(0, isr, 1.0, 0),
        Alignment::new(1, isf, 1.0, 0),
    ])];
    fixture
        .engine(&opts)
        .process_mini_batch(&fixture.lib, 0, &mut batch, &mut rng, true);

    assert_eq!(fixture.lib.num_incompatible(), 1);
    let counts = fixture.lib.lib_type_counts();
    assert_eq!(counts[isr.format_id() as usize], 1);
    assert_eq!(counts[isf.format_id() as usize], 1);

    // the incompatible candidate is down-weighted by the prior
    let probs: Vec<f64> = batch[0].alignments().iter().map(|a| a.log_prob.exp()).collect();
    assert!(probs[0] > 0.99);
    assert!(probs[1] < 0.01);
}

#[test]
fn mass_banking_without_ambiguity() {
    let fixture = Fixture::new(&[1000, 1000], "U");
    let opts = QuantOpts {
        use_mass_banking: true,
        ..Default::default()
    };
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let engine = fixture.engine(&opts);

    let mut batch = vec![group_of(&[0]), group_of(&[0]), group_of(&[1])];
    engine.process_mini_batch(&fixture.lib, 0, &mut batch, &mut rng, true);
    assert_eq!(fixture.transcripts[0].unique_update_fraction(), None);

    // no ambiguous history, so banking adds nothing beyond the batch itself
    let mass_before = fixture.transcripts[0].mass(false);
    let mut batch = vec![group_of(&[0])];
    engine.process_mini_batch(&fixture.lib, 1, &mut batch, &mut rng, false);
    assert!(fixture.transcripts[0].mass(false) > mass_before);
    assert!(fixture.transcripts[0].mass(false).is_finite());
}

#[test]
fn unknown_transcript_id_skipped() {
    let fixture = Fixture::new(&[1000, 1000], "U");
    let opts = QuantOpts::default();
    let mut rng = ChaCha20Rng::seed_from_u64(8);
    let mut batch = vec![group_of(&[99, 0]), group_of(&[99]), group_of(&[1, 99, 0])];
    fixture
        .engine(&opts)
        .process_mini_batch(&fixture.lib, 0, &mut batch, &mut rng, true);

    // the out-of-range hit is dropped, the rest of its fragment is kept
    assert_eq!(fixture.num_assigned.load(Ordering::Relaxed), 2);
    assert_eq!(fixture.lib.num_invalid_hits(), 3);
    assert_eq!(batch[0].alignments()[0].log_prob, LOG_0);
    assert!((batch[0].alignments()[1].log_prob - 0.0).abs() < 1e-12);
    assert_eq!(fixture.transcripts[0].unique_count(), 1);
    assert_eq!(fixture.transcripts[0].total_count(), 2);

    let clusters = fixture.cluster_forest.clusters();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].members, vec![0, 1]);
    assert_eq!(clusters[0].count, 2);

    let classes = fixture.eq_table.into_classes();
    assert_eq!(
        classes.iter().map(|c| c.label.clone()).collect::<Vec<Vec<u32>>>(),
        vec![vec![0], vec![0, 1]]
    );
}
