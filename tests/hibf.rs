use kestrel::hibf::NO_USER_BIN;
use kestrel::{HierarchicalIbf, InterleavedBloomFilter, MembershipAgent};

fn hashes(seed: u64, n: usize) -> Vec<u64> {
    let mut state = seed | 1;
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            state
        })
        .collect()
}

/// Root with one merge bin (-> child holding user bins 0,1) and a leaf bin
/// (user bin 2). `merge_consistent` controls whether the merge bin actually
/// contains the child's content.
fn two_level(values: &[(Vec<u64>, usize)], merge_consistent: bool) -> HierarchicalIbf {
    let mut root = InterleavedBloomFilter::new(2, 4096, 2);
    let mut child = InterleavedBloomFilter::new(2, 4096, 2);
    for (hashes, user_bin) in values {
        for &h in hashes {
            match user_bin {
                0 | 1 => {
                    child.emplace(h, *user_bin);
                    if merge_consistent {
                        root.emplace(h, 0);
                    }
                }
                _ => root.emplace(h, 1),
            }
        }
    }
    HierarchicalIbf {
        ibfs: vec![root, child],
        next_ibf_id: vec![vec![1, 0], vec![1, 1]],
        user_bin_index: vec![vec![NO_USER_BIN, 2], vec![0, 1]],
    }
}

#[test]
fn resolves_user_bins_through_merge_bins() {
    let bins = vec![
        (hashes(3, 80), 0usize),
        (hashes(5, 80), 1),
        (hashes(7, 80), 2),
    ];
    let hibf = two_level(&bins, true);
    let mut agent = MembershipAgent::new(&hibf);
    for (query, user_bin) in &bins {
        assert_eq!(agent.membership(query, query.len()), &[*user_bin]);
    }
}

#[test]
fn merge_bin_below_threshold_prunes_subtree() {
    let bins = vec![(hashes(3, 80), 0usize)];
    let hibf = two_level(&bins, false);
    let mut agent = MembershipAgent::new(&hibf);
    // The child holds every hash, but the root merge bin never clears the
    // threshold, so the subtree is not visited.
    assert_eq!(agent.membership(&bins[0].0, bins[0].0.len()), &[] as &[usize]);
}

#[test]
fn empty_query_matches_nothing() {
    let hibf = two_level(&[(hashes(3, 10), 0)], true);
    let mut agent = MembershipAgent::new(&hibf);
    assert!(agent.membership(&[], 0).is_empty());
}

#[test]
fn results_are_sorted_and_deduplicated() {
    // One user bin split across both child bins.
    let values = hashes(11, 80);
    let mut root = InterleavedBloomFilter::new(1, 4096, 2);
    let mut child = InterleavedBloomFilter::new(2, 4096, 2);
    for (i, &h) in values.iter().enumerate() {
        root.emplace(h, 0);
        child.emplace(h, i % 2);
    }
    let hibf = HierarchicalIbf {
        ibfs: vec![root, child],
        next_ibf_id: vec![vec![1], vec![1, 1]],
        user_bin_index: vec![vec![NO_USER_BIN], vec![0, 0]],
    };
    let mut agent = MembershipAgent::new(&hibf);
    // Each half clears the halved threshold; the split bin reports once.
    assert_eq!(agent.membership(&values, values.len() / 4), &[0]);
}
