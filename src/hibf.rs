//! Hierarchical interleaved Bloom filter: a tree of IBFs in which a
//! technical bin either holds (part of) one user bin or points at a child
//! IBF holding the union of several user bins.

use crate::ibf::{CountingAgent, InterleavedBloomFilter};

/// Sentinel for technical bins without a user bin (merge bins, padding).
pub const NO_USER_BIN: i64 = -1;

/// A DAG of IBFs, root at index 0.
///
/// `next_ibf_id[l][t]` is the child IBF index when bin `t` of IBF `l` merges
/// lower user bins, else `l` itself. `user_bin_index[l][t]` is the user bin
/// id when `t` is a leaf split bin, else [`NO_USER_BIN`].
#[derive(Clone, PartialEq, Debug, Default)]
pub struct HierarchicalIbf {
    pub ibfs: Vec<InterleavedBloomFilter>,
    pub next_ibf_id: Vec<Vec<usize>>,
    pub user_bin_index: Vec<Vec<i64>>,
}

impl HierarchicalIbf {
    pub fn ibf_count(&self) -> usize {
        self.ibfs.len()
    }

    /// Number of distinct user bins addressed by the tree.
    pub fn user_bin_count(&self) -> usize {
        self.user_bin_index
            .iter()
            .flatten()
            .filter(|&&ub| ub != NO_USER_BIN)
            .map(|&ub| ub as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Per-worker traversal state answering membership queries against one HIBF.
pub struct MembershipAgent<'a> {
    hibf: &'a HierarchicalIbf,
    // One counting scratch per recursion depth; IBF geometries differ per level.
    scratch: Vec<CountingAgent>,
    result: Vec<usize>,
}

impl<'a> MembershipAgent<'a> {
    pub fn new(hibf: &'a HierarchicalIbf) -> Self {
        MembershipAgent {
            hibf,
            scratch: Vec::new(),
            result: Vec::new(),
        }
    }

    /// User bins with at least `threshold` of `hashes`, ascending and
    /// deduplicated. A merge bin below the threshold prunes its whole
    /// subtree.
    pub fn membership(&mut self, hashes: &[u64], threshold: usize) -> &[usize] {
        self.result.clear();
        if !hashes.is_empty() {
            self.recurse(0, 0, hashes, threshold);
        }
        self.result.sort_unstable();
        self.result.dedup();
        &self.result
    }

    fn recurse(&mut self, ibf_id: usize, depth: usize, hashes: &[u64], threshold: usize) {
        if self.scratch.len() <= depth {
            self.scratch.push(CountingAgent::default());
        }
        let mut agent = std::mem::take(&mut self.scratch[depth]);
        let counts = agent.count(&self.hibf.ibfs[ibf_id], hashes);

        let mut descend = Vec::new();
        for (bin, &count) in counts.iter().enumerate() {
            if usize::from(count) < threshold {
                continue;
            }
            let next = self.hibf.next_ibf_id[ibf_id][bin];
            if next == ibf_id {
                let ub = self.hibf.user_bin_index[ibf_id][bin];
                if ub != NO_USER_BIN {
                    self.result.push(ub as usize);
                }
            } else {
                descend.push(next);
            }
        }
        self.scratch[depth] = agent;

        for next in descend {
            self.recurse(next, depth + 1, hashes, threshold);
        }
    }
}
