use kestrel::Shape;
use kestrel::threshold::{ThresholdParams, Thresholder, precompute_threshold};

fn params(pattern_size: usize, window_size: usize, k: u8, errors: usize) -> ThresholdParams {
    ThresholdParams {
        pattern_size,
        window_size,
        shape: Shape::ungapped(k).unwrap(),
        errors,
        tau: 0.9999,
    }
}

#[test]
fn window_equals_span_closed_form() {
    // p + 1 - (e + 1) * k, floored at zero.
    let table = precompute_threshold(&params(100, 20, 20, 2));
    assert_eq!(table.values, vec![41]);
    assert_eq!(table.get(0), 41);
    assert_eq!(table.get(500), 41);

    let degenerate = precompute_threshold(&params(40, 20, 20, 3));
    assert_eq!(table.n_min, 0);
    assert_eq!(degenerate.values, vec![0]);
}

#[test]
fn table_covers_expected_range() {
    let table = precompute_threshold(&params(50, 24, 20, 1));
    // n ranges from (p-k+1)/(w-k+1) to p-w+1.
    assert_eq!(table.n_min, 31 / 5);
    assert_eq!(table.values.len(), 27 - 31 / 5 + 1);
    for (i, &t) in table.values.iter().enumerate() {
        assert!(t <= table.n_min + i, "threshold above minimizer count");
    }
}

#[test]
fn zero_errors_demand_every_minimizer() {
    let table = precompute_threshold(&params(50, 24, 20, 0));
    for (i, &t) in table.values.iter().enumerate() {
        assert_eq!(t, table.n_min + i);
    }
}

#[test]
fn threshold_non_increasing_in_errors() {
    let tables: Vec<_> = (0..3)
        .map(|e| precompute_threshold(&params(50, 24, 20, e)))
        .collect();
    for pair in tables.windows(2) {
        assert_eq!(pair[0].n_min, pair[1].n_min);
        for (more_strict, less_strict) in pair[0].values.iter().zip(&pair[1].values) {
            assert!(less_strict <= more_strict);
        }
    }
}

#[test]
fn fraction_thresholder() {
    let t = Thresholder::new(params(50, 24, 20, 0), Some(0.5), None).unwrap();
    assert_eq!(t.get(10), 5);
    assert_eq!(t.get(11), 6);
    assert!(Thresholder::new(params(50, 24, 20, 0), Some(1.5), None).is_err());
}

#[test]
fn memoized_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let p = params(50, 24, 20, 1);
    let first = Thresholder::new(p, None, Some(dir.path())).unwrap();

    let memo: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(memo.len(), 1);
    assert!(memo[0].starts_with("threshold_p50_w24_s") && memo[0].ends_with(".bin"));

    let second = Thresholder::new(p, None, Some(dir.path())).unwrap();
    match (&first, &second) {
        (Thresholder::Table(a), Thresholder::Table(b)) => assert_eq!(a, b),
        other => panic!("expected tables, got {other:?}"),
    }
}

#[test]
fn rejects_bad_parameters() {
    assert!(Thresholder::new(params(50, 24, 20, 0), Some(2.0), None).is_err());
    // Pattern shorter than the window.
    assert!(Thresholder::new(params(20, 24, 20, 0), None, None).is_err());
    // Window shorter than the shape span.
    assert!(Thresholder::new(params(50, 10, 20, 0), None, None).is_err());
    let mut bad_tau = params(50, 24, 20, 0);
    bad_tau.tau = 1.0;
    assert!(Thresholder::new(bad_tau, None, None).is_err());
}
