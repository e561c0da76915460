//! CallSet semantics: range merging, idempotence, oracle cross-checks.

use std::collections::BTreeSet;

use retrace_trim::CallSet;

#[test]
fn test_adjacent_inserts_merge() {
    let mut set = CallSet::new();
    set.add(5);
    set.add(6);
    assert!(set.contains(5));
    assert!(set.contains(6));
    assert!(!set.contains(4));
    assert!(!set.contains(7));
    assert_eq!(set.range_count(), 1, "5 and 6 must merge into one range");
}

#[test]
fn test_gap_fill_bridges_two_ranges() {
    let mut set = CallSet::new();
    set.add(3);
    set.add(5);
    assert_eq!(set.range_count(), 2);

    set.add(4);
    assert_eq!(set.range_count(), 1, "filling the gap must merge [3,3] and [5,5]");
    for call_no in 3..=5 {
        assert!(set.contains(call_no));
    }
    assert!(!set.contains(2));
    assert!(!set.contains(6));
}

#[test]
fn test_reinsert_is_idempotent() {
    let mut set = CallSet::new();
    set.add(10);
    set.add(11);
    set.add(12);
    assert_eq!(set.range_count(), 1);

    set.add(11);
    set.add(10);
    set.add(12);
    assert_eq!(set.range_count(), 1);
    assert!(set.contains(11));
}

#[test]
fn test_extend_downward() {
    let mut set = CallSet::new();
    set.add(100);
    set.add(99);
    assert_eq!(set.range_count(), 1);
    assert!(set.contains(99));
    assert!(set.contains(100));
    assert!(!set.contains(98));
}

#[test]
fn test_zero_and_boundaries() {
    let mut set = CallSet::new();
    assert!(!set.contains(0));
    set.add(0);
    assert!(set.contains(0));
    set.add(1);
    assert_eq!(set.range_count(), 1);
    assert!(!set.contains(2));
}

#[test]
fn test_empty_set() {
    let set = CallSet::new();
    assert!(set.is_empty());
    assert_eq!(set.range_count(), 0);
    assert!(!set.contains(42));
}

/// Deterministic LCG, the same generator the container tests use for
/// reproducible data.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0
    }
}

#[test]
fn test_membership_matches_btreeset_oracle() {
    let mut rng = Lcg(0xC0FFEE);
    let mut set = CallSet::with_seed(1);
    let mut oracle = BTreeSet::new();

    // Bursty, partly out-of-order inserts, the trimming workload shape.
    let mut base = 0u64;
    for _ in 0..400 {
        base += rng.next() % 7;
        for offset in 0..(rng.next() % 5) {
            let call_no = base + offset;
            set.add(call_no);
            oracle.insert(call_no);
        }
    }
    // Scattered point inserts.
    for _ in 0..500 {
        let call_no = rng.next() % 2048;
        set.add(call_no);
        oracle.insert(call_no);
    }

    for call_no in 0..2600 {
        assert_eq!(
            set.contains(call_no),
            oracle.contains(&call_no),
            "membership diverged at {call_no}"
        );
    }

    // Range count must equal the number of runs of consecutive numbers.
    let mut runs = 0;
    let mut prev: Option<u64> = None;
    for &call_no in &oracle {
        if prev != Some(call_no.wrapping_sub(1)) {
            runs += 1;
        }
        prev = Some(call_no);
    }
    assert_eq!(set.range_count(), runs);
}

#[test]
fn test_add_range_and_oracle() {
    let mut rng = Lcg(0xFACADE);
    let mut set = CallSet::with_seed(2);
    let mut oracle = BTreeSet::new();

    for _ in 0..200 {
        let first = rng.next() % 1000;
        let last = first + rng.next() % 20;
        set.add_range(first, last);
        for call_no in first..=last {
            oracle.insert(call_no);
        }
    }

    for call_no in 0..1100 {
        assert_eq!(
            set.contains(call_no),
            oracle.contains(&call_no),
            "membership diverged at {call_no}"
        );
    }
}

#[test]
fn test_from_spec_syntax() {
    let set = CallSet::from_spec("1,4-9,100-").unwrap();
    assert_eq!(set.range_count(), 3);
    assert!(set.contains(1));
    assert!(!set.contains(2));
    assert!(set.contains(4));
    assert!(set.contains(9));
    assert!(!set.contains(10));
    assert!(!set.contains(99));
    assert!(set.contains(100));
    assert!(set.contains(1_000_000_000));
    assert!(set.contains(u64::MAX));

    assert!(CallSet::from_spec("9-4").is_err());
    assert!(CallSet::from_spec("x").is_err());
    assert!(CallSet::from_spec("").unwrap().is_empty());
}

#[test]
fn test_same_seed_same_shape() {
    let inserts: Vec<u64> = (0..300).map(|i| (i * 37) % 997).collect();
    let mut a = CallSet::with_seed(99);
    let mut b = CallSet::with_seed(99);
    for &call_no in &inserts {
        a.add(call_no);
        b.add(call_no);
    }
    assert_eq!(a.range_count(), b.range_count());
    for call_no in 0..1000 {
        assert_eq!(a.contains(call_no), b.contains(call_no));
    }
}
