//! The persisted index: sketching parameters, user-bin paths, and either a
//! flat or a hierarchical interleaved Bloom filter.

use crate::hibf::HierarchicalIbf;
use crate::ibf::InterleavedBloomFilter;
use crate::shape::Shape;

/// Flat or hierarchical filter body.
#[derive(Clone, PartialEq, Debug)]
pub enum IndexData {
    Ibf(InterleavedBloomFilter),
    Hibf(HierarchicalIbf),
}

/// A finalized, read-only index. All query workers share one instance.
#[derive(Clone, PartialEq, Debug)]
pub struct Index {
    window_size: u64,
    shape: Shape,
    parts: u8,
    bin_path: Vec<Vec<String>>,
    fpr: f64,
    data: IndexData,
}

impl Index {
    /// Current archive version; other versions are rejected.
    pub const VERSION: u32 = 2;

    pub fn new(
        window_size: u64,
        shape: Shape,
        parts: u8,
        bin_path: Vec<Vec<String>>,
        fpr: f64,
        data: IndexData,
    ) -> Self {
        Index {
            window_size,
            shape,
            parts,
            bin_path,
            fpr,
            data,
        }
    }

    #[inline]
    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn parts(&self) -> u8 {
        self.parts
    }

    pub fn bin_path(&self) -> &[Vec<String>] {
        &self.bin_path
    }

    #[inline]
    pub fn fpr(&self) -> f64 {
        self.fpr
    }

    #[inline]
    pub fn is_hibf(&self) -> bool {
        matches!(self.data, IndexData::Hibf(_))
    }

    #[inline]
    pub fn data(&self) -> &IndexData {
        &self.data
    }

    /// Number of user bins addressable by query results.
    pub fn user_bin_count(&self) -> usize {
        match &self.data {
            IndexData::Ibf(ibf) => ibf.bin_count(),
            IndexData::Hibf(hibf) => hibf.user_bin_count(),
        }
    }
}
