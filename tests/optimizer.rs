use streamquant::eq_class::{mark_degenerate_classes, EqClass};
use streamquant::error::QuantError;
use streamquant::math::atomic_vec;
use streamquant::optimizer::*;
use streamquant::transcript::{Transcript, DEFAULT_PER_BASE_PRIOR};

#[cfg(test)]
use pretty_assertions::assert_eq;

fn abc_classes() -> Vec<EqClass> {
    vec![
        EqClass::new(vec![0], 50),
        EqClass::with_weights(vec![0, 1], 30, vec![0.01, 0.005]),
        EqClass::new(vec![2], 20),
    ]
}

fn abc_transcripts() -> Vec<Transcript> {
    vec![
        Transcript::new(0, "A", 100, DEFAULT_PER_BASE_PRIOR),
        Transcript::new(1, "B", 200, DEFAULT_PER_BASE_PRIOR),
        Transcript::new(2, "C", 300, DEFAULT_PER_BASE_PRIOR),
    ]
}

#[test]
fn normalize_twice() {
    let mut v = vec![3.0, 1.0, 4.0, 2.0];
    let sum = normalize(&mut v);
    assert_eq!(sum, 10.0);
    let once = v.clone();
    let sum = normalize(&mut v);
    assert!((sum - 1.0).abs() < 1e-12);
    for (a, b) in once.iter().zip(v.iter()) {
        assert!((a - b).abs() < 1e-12);
    }

    // too small to scale
    let mut zeros = vec![0.0; 3];
    assert_eq!(normalize(&mut zeros), 0.0);
    assert_eq!(zeros, vec![0.0; 3]);
}

#[test]
fn em_update_conserves_counts() {
    let classes = vec![EqClass::with_weights(
        vec![0, 1, 2],
        30,
        vec![0.5, 0.25, 1.0],
    )];
    let alpha_in = vec![2.0, 7.0, 1.0];
    let alpha_out = atomic_vec(3, 0.0);
    em_update(&classes, &alpha_in, &alpha_out);
    let total: f64 = alpha_out.iter().map(|a| a.load()).sum();
    assert!((total - 30.0).abs() < 1e-9);

    // shares follow alpha * weight: 1.0, 1.75, 1.0
    let out: Vec<f64> = alpha_out.iter().map(|a| a.load()).collect();
    assert!((out[0] - 30.0 * 1.0 / 3.75).abs() < 1e-9);
    assert!((out[1] - 30.0 * 1.75 / 3.75).abs() < 1e-9);
    assert!((out[2] - 30.0 * 1.0 / 3.75).abs() < 1e-9);
}

#[test]
fn single_member_class_is_not_split() {
    let classes = vec![EqClass::new(vec![1], 12), EqClass::new(vec![0, 1], 4)];
    let alpha_in = vec![0.0, 5.0];
    let alpha_out = atomic_vec(2, 0.0);
    em_update(&classes, &alpha_in, &alpha_out);
    assert_eq!(alpha_out[0].load(), 0.0);
    assert_eq!(alpha_out[1].load(), 16.0);
}

#[test]
fn two_transcript_fixed_point() {
    // a = 30 + 60 a / (a + b), b = 10 + 60 b / (a + b) => a = 75, b = 25
    let classes = vec![
        EqClass::new(vec![0], 30),
        EqClass::new(vec![1], 10),
        EqClass::new(vec![0, 1], 60),
    ];
    let opts = EmOptions {
        rel_diff_tolerance: 1e-6,
        ..Default::default()
    };
    let result = run_em(&classes, vec![50.0, 50.0], &opts);
    assert!(result.converged);
    assert!((result.alphas[0] - 75.0).abs() < 1e-3);
    assert!((result.alphas[1] - 25.0).abs() < 1e-3);

    // one more pass barely moves it
    let again = run_em(
        &classes,
        result.alphas.clone(),
        &EmOptions {
            max_iter: 1,
            ..opts
        },
    );
    for (before, after) in result.alphas.iter().zip(again.alphas.iter()) {
        assert!((before - after).abs() / after < 1e-6);
    }
}

#[test]
fn vbem_adds_prior() {
    let classes = vec![
        EqClass::new(vec![0], 30),
        EqClass::new(vec![1], 10),
        EqClass::new(vec![0, 1], 60),
    ];
    let opts = EmOptions {
        use_vbem: true,
        rel_diff_tolerance: 1e-6,
        ..Default::default()
    };
    let result = run_em(&classes, vec![50.0, 50.0], &opts);
    assert!(result.converged);
    let total: f64 = result.alphas.iter().sum();
    assert!((total - (100.0 + 2.0 * PRIOR_ALPHA)).abs() < 1e-6);
    assert!(result.alphas[0] > result.alphas[1]);
    assert_eq!(opts.cutoff(), PRIOR_ALPHA + MIN_ALPHA);
}

#[test]
fn abc_scenario() {
    let classes = abc_classes();
    let opts = EmOptions {
        rel_diff_tolerance: 1e-3,
        ..Default::default()
    };
    let init = vec![100.0 / 3.0; 3];
    let result = run_em(&classes, init, &opts);
    let mut alphas = result.alphas;
    assert!(alphas[0] > alphas[1]);
    assert!((alphas.iter().sum::<f64>() - 100.0).abs() < 1e-6);
    assert!((alphas[2] - 20.0).abs() < 1e-9);

    normalize(&mut alphas);
    assert!((alphas.iter().sum::<f64>() - 1.0).abs() < 1e-12);
}

#[test]
fn degenerate_class_contributes_nothing() {
    let mut classes = vec![
        EqClass::new(vec![0, 1], 40),
        EqClass::new(vec![2], 5),
        EqClass::new(vec![1, 2], 10),
    ];
    let alphas = vec![0.0, 0.0, 3.0];
    let n_dropped = mark_degenerate_classes(&mut classes, &alphas);
    assert_eq!(n_dropped, 1);
    assert_eq!(
        classes.iter().map(|c| c.valid).collect::<Vec<bool>>(),
        vec![false, true, true]
    );

    let alpha_out = atomic_vec(3, 0.0);
    em_update(&classes, &alphas, &alpha_out);
    assert_eq!(alpha_out[0].load(), 0.0);
    assert_eq!(alpha_out[1].load(), 0.0);
    assert!((alpha_out[2].load() - 15.0).abs() < 1e-12);
}

#[test]
fn optimize_transcripts() {
    let mut transcripts = abc_transcripts();
    let mut classes = vec![
        EqClass::new(vec![0], 50),
        EqClass::new(vec![0, 1], 30),
        EqClass::new(vec![2], 20),
    ];
    let optimizer = CollapsedEmOptimizer::new(
        EmOptions {
            rel_diff_tolerance: 1e-3,
            ..Default::default()
        },
        false,
    );
    let summary = optimizer
        .optimize(&mut transcripts, &mut classes, 100.0)
        .unwrap();
    assert_eq!(summary.num_degenerate, 0);
    assert!((summary.total_count - 100.0).abs() < 1e-6);

    // weights follow effective length, which starts at the reference length
    assert!((classes[1].weights[0] - 0.01).abs() < 1e-12);
    assert!((classes[1].weights[1] - 0.005).abs() < 1e-12);

    let counts: Vec<f64> = transcripts.iter().map(|t| t.est_count).collect();
    assert!(counts[0] > counts[1]);
    assert!((counts.iter().sum::<f64>() - 100.0).abs() < 1e-6);
    let mass: f64 = transcripts.iter().map(|t| t.projected_mass).sum();
    assert!((mass - 1.0).abs() < 1e-9);
}

#[test]
fn optimize_failures() {
    let optimizer = CollapsedEmOptimizer::new(EmOptions::default(), true);

    let mut transcripts = abc_transcripts();
    let mut no_classes: Vec<EqClass> = Vec::new();
    assert!(matches!(
        optimizer.optimize(&mut transcripts, &mut no_classes, 10.0),
        Err(QuantError::NoActiveTranscripts)
    ));

    let mut classes = abc_classes();
    assert!(matches!(
        optimizer.optimize(&mut transcripts, &mut classes, 0.0),
        Err(QuantError::InsufficientMass(_))
    ));
}
