use pulselab::sweep::{Interpolation, Sweep, SweepRange};

#[test]
fn test_linear_endpoints_exact() {
    let r = SweepRange::linear(2.8e9, 2.94e9, 8);
    let v = r.values();
    assert_eq!(v.len(), 8);
    assert_eq!(v[0], 2.8e9);
    assert_eq!(v[7], 2.94e9);
    for w in v.windows(2) {
        assert!(w[1] > w[0], "sweep must be monotonic: {:?}", v);
    }
}

#[test]
fn test_linear_midpoints() {
    let r = SweepRange::linear(0.0, 10.0, 11);
    for (i, x) in r.values().into_iter().enumerate() {
        assert!((x - i as f64).abs() < 1e-12);
    }
}

#[test]
fn test_single_step_is_start() {
    let r = SweepRange::linear(-3.0, 7.0, 1);
    assert_eq!(r.values(), vec![-3.0]);
    assert_eq!(r.value_at(5), -3.0);
}

#[test]
fn test_descending_sweep() {
    let r = SweepRange::linear(1.0, -1.0, 3);
    assert_eq!(r.values(), vec![1.0, 0.0, -1.0]);
}

#[test]
fn test_geometric_constant_ratio() {
    let r = SweepRange::linear(1.0, 1000.0, 4).with_rule(Interpolation::Geometric);
    assert!(r.validate().is_ok());
    let v = r.values();
    assert_eq!(v[0], 1.0);
    assert_eq!(v[3], 1000.0);
    assert!((v[1] - 10.0).abs() < 1e-9);
    assert!((v[2] - 100.0).abs() < 1e-9);
}

#[test]
fn test_geometric_needs_same_sign() {
    let r = SweepRange::linear(-1.0, 10.0, 4).with_rule(Interpolation::Geometric);
    assert!(r.validate().is_err());
    let r = SweepRange::linear(0.0, 10.0, 4).with_rule(Interpolation::Geometric);
    assert!(r.validate().is_err());
}

#[test]
fn test_validate_rejects_nonsense() {
    assert!(SweepRange::linear(0.0, 1.0, 0).validate().is_err());
    assert!(SweepRange::linear(f64::NAN, 1.0, 3).validate().is_err());
    assert!(SweepRange::linear(0.0, f64::INFINITY, 3).validate().is_err());
}

#[test]
fn test_explicit_list() {
    let s = Sweep::List(vec![5.0, 1.0, 3.0]);
    // Values come back in the order given, unsorted.
    assert_eq!(s.value_at(0), 5.0);
    assert_eq!(s.value_at(1), 1.0);
    assert_eq!(s.value_at(2), 3.0);
}
