use kestrel::sketch::{self, adjust_seed, minimizers, reverse_complement};
use kestrel::{InterleavedBloomFilter, Shape};
use proptest::prelude::*;

/// Every canonical spaced-hash a sequence contains, by direct enumeration.
fn naive_canonical_hashes(seq: &[u8], shape: Shape) -> Vec<u64> {
    let span = shape.span();
    let seed = adjust_seed(shape.weight());
    let mut out = Vec::new();
    'outer: for window in seq.windows(span) {
        let mut fwd = 0u64;
        let mut rc = 0u64;
        for (i, &b) in window.iter().enumerate() {
            let Some(v) = sketch::map_base(b) else {
                continue 'outer;
            };
            fwd = (fwd << 2) | u64::from(v);
            rc |= u64::from(v ^ 0b11) << (2 * i);
        }
        out.push((shape.extract(fwd) ^ seed).min(shape.extract(rc) ^ seed));
    }
    out.sort_unstable();
    out.dedup();
    out
}

fn sorted_set(mut v: Vec<u64>) -> Vec<u64> {
    v.sort_unstable();
    v.dedup();
    v
}

proptest! {
    #[test]
    fn prop_sketch_deterministic(
        k in 2usize..=10,
        extra in 0usize..6,
        seq in prop::collection::vec(prop::sample::select(b"ACGTN".to_vec()), 0..200),
    ) {
        let shape = Shape::ungapped(k as u8).unwrap();
        let window = k + extra;
        prop_assert_eq!(minimizers(&seq, shape, window), minimizers(&seq, shape, window));
    }

    #[test]
    fn prop_strand_invariant(
        k in 2usize..=10,
        extra in 0usize..6,
        seq in prop::collection::vec(prop::sample::select(b"ACGTN".to_vec()), 0..200),
    ) {
        let shape = Shape::ungapped(k as u8).unwrap();
        let window = k + extra;
        let rc = reverse_complement(&seq);
        prop_assert_eq!(
            sorted_set(minimizers(&seq, shape, window)),
            sorted_set(minimizers(&rc, shape, window))
        );
    }

    #[test]
    fn prop_minimizers_subset_of_kmer_hashes(
        k in 2usize..=10,
        extra in 0usize..6,
        seq in prop::collection::vec(prop::sample::select(b"ACGTN".to_vec()), 0..200),
    ) {
        let shape = Shape::ungapped(k as u8).unwrap();
        let all = naive_canonical_hashes(&seq, shape);
        for hash in minimizers(&seq, shape, k + extra) {
            prop_assert!(all.binary_search(&hash).is_ok());
        }
    }

    #[test]
    fn prop_window_equals_span_covers_all_kmers(
        k in 2usize..=10,
        seq in prop::collection::vec(prop::sample::select(b"ACGT".to_vec()), 0..120),
    ) {
        // With one k-mer per window nothing is skipped, only collapsed.
        let shape = Shape::ungapped(k as u8).unwrap();
        prop_assert_eq!(
            sorted_set(minimizers(&seq, shape, k)),
            naive_canonical_hashes(&seq, shape)
        );
    }

    #[test]
    fn prop_ibf_no_false_negatives(
        bins in 1usize..80,
        values in prop::collection::vec(any::<u64>(), 1..120),
    ) {
        let mut ibf = InterleavedBloomFilter::new(bins, 2048, 3);
        for (i, &v) in values.iter().enumerate() {
            ibf.emplace(v, i % bins);
        }
        for (i, &v) in values.iter().enumerate() {
            prop_assert!(ibf.contains(&[v], 1).contains(&(i % bins)));
        }
    }
}
