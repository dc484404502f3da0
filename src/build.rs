//! Index construction: flat interleaved Bloom filters from a bin list,
//! hierarchical ones from a layout file, bottom-up.

use crate::error::{Error, Result};
use crate::hibf::{HierarchicalIbf, NO_USER_BIN};
use crate::ibf::{self, InterleavedBloomFilter};
use crate::index::{Index, IndexData};
use crate::layout::{self, Layout, UserBinRecord};
use crate::prepare::{MinimiserHeader, read_minimiser_header};
use crate::shape::Shape;
use crate::sketch;

use hashbrown::HashSet;
use nohash_hasher::BuildNoHashHasher;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// K-mer hash accumulator; values are already hashes, so identity hashing.
pub type KmerSet = HashSet<u64, BuildNoHashHasher<u64>>;

/// Build-time configuration.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub shape: Shape,
    pub window_size: usize,
    pub fpr: f64,
    /// Fixed hash-function count; derived from the sizing when `None`.
    pub hash_count: Option<usize>,
    pub threads: usize,
    pub parts: u8,
}

impl BuildConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size < self.shape.span() {
            return Err(Error::Config(format!(
                "window ({}) smaller than shape span ({})",
                self.window_size,
                self.shape.span()
            )));
        }
        if !(self.fpr > 0.0 && self.fpr < 1.0) {
            return Err(Error::Config(format!("fpr must be in (0,1), got {}", self.fpr)));
        }
        if self.threads == 0 {
            return Err(Error::Config("thread count must be positive".into()));
        }
        if self.parts == 0 {
            return Err(Error::Config("parts must be positive".into()));
        }
        Ok(())
    }

    fn bin_size_for(&self, max_bin_kmers: usize) -> (usize, usize) {
        match self.hash_count {
            Some(h) => (ibf::bin_size_for_hash_count(max_bin_kmers, self.fpr, h), h.clamp(1, 5)),
            None => {
                let bits = ibf::bin_size_in_bits(max_bin_kmers, self.fpr);
                (bits, ibf::optimal_hash_count(bits, max_bin_kmers))
            }
        }
    }
}

/// Build the index described by `cfg.input` and write the archive(s).
/// Layout files (leading `#`) yield an HIBF, plain bin lists a flat IBF,
/// optionally split into `parts` files.
pub fn run_build(cfg: &BuildConfig) -> Result<()> {
    cfg.validate()?;
    rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.threads)
        .build_global()
        .ok();

    if layout::is_layout_file(&cfg.input)? {
        if cfg.parts != 1 {
            return Err(Error::Config("layout builds do not support --parts".into()));
        }
        let layout = layout::parse_layout(&cfg.input)?;
        let index = build_hibf(&layout, cfg)?;
        index.write_to(&cfg.output)?;
    } else {
        let bins = parse_bin_list(&cfg.input)?;
        if cfg.parts == 1 {
            build_flat(&bins, cfg)?.write_to(&cfg.output)?;
        } else {
            for (part, index) in build_flat_parts(&bins, cfg)?.into_iter().enumerate() {
                index.write_to(&part_path(&cfg.output, part))?;
            }
        }
    }
    Ok(())
}

/// `<output>_<part>` naming for partitioned indices.
pub fn part_path(output: &Path, part: usize) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(format!("_{part}"));
    PathBuf::from(name)
}

/// One user bin per line; `;` separates multiple files of one bin.
pub fn parse_bin_list(path: &Path) -> Result<Vec<Vec<PathBuf>>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut bins = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::io(path, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        bins.push(line.split(';').map(|p| PathBuf::from(p.trim())).collect());
    }
    if bins.is_empty() {
        return Err(Error::Input(format!("{}: no input bins", path.display())));
    }
    Ok(bins)
}

// ---- Flat IBF ----

/// Build a single flat IBF over `bins`, sized from the largest bin.
pub fn build_flat(bins: &[Vec<PathBuf>], cfg: &BuildConfig) -> Result<Index> {
    // Sizing pass: the max bin determines the per-bin bit budget.
    let counts: Vec<usize> = bins
        .par_iter()
        .map(|files| bin_cardinality(files, cfg))
        .collect::<Result<_>>()?;
    let max_count = counts.iter().copied().max().unwrap_or(0);
    if max_count == 0 {
        return Err(Error::Input("no minimizers in any input bin".into()));
    }
    let (bin_size, hash_count) = cfg.bin_size_for(max_count);
    let mut ibf = InterleavedBloomFilter::new(bins.len(), bin_size, hash_count);

    // Fill pass: sketch a block of bins in parallel, insert sequentially.
    let block_len = cfg.threads.max(1);
    for (block_index, block) in bins.chunks(block_len).enumerate() {
        let block_start = block_index * block_len;
        let sets: Vec<KmerSet> = block
            .par_iter()
            .map(|files| {
                let mut kmers = KmerSet::default();
                compute_kmers_for_files(files, cfg, &mut kmers)?;
                Ok(kmers)
            })
            .collect::<Result<_>>()?;
        for (offset, kmers) in sets.iter().enumerate() {
            for &hash in kmers {
                ibf.emplace(hash, block_start + offset);
            }
        }
    }

    Ok(Index::new(
        cfg.window_size as u64,
        cfg.shape,
        cfg.parts,
        bin_paths(bins),
        cfg.fpr,
        IndexData::Ibf(ibf),
    ))
}

/// Split user bins into `cfg.parts` contiguous groups and build one flat
/// index per group; queries union hits over the parts.
pub fn build_flat_parts(bins: &[Vec<PathBuf>], cfg: &BuildConfig) -> Result<Vec<Index>> {
    let parts = usize::from(cfg.parts);
    if parts > bins.len() {
        return Err(Error::Config("more parts than user bins".into()));
    }
    let groups: Vec<_> = bins.chunks(bins.len().div_ceil(parts)).collect();
    // Rounding can merge the tail; the archives record the real file count.
    let mut cfg = cfg.clone();
    cfg.parts = groups.len() as u8;
    groups.into_iter().map(|group| build_flat(group, &cfg)).collect()
}

fn bin_paths(bins: &[Vec<PathBuf>]) -> Vec<Vec<String>> {
    bins.iter()
        .map(|files| files.iter().map(|p| p.display().to_string()).collect())
        .collect()
}

/// Distinct-minimizer count of one bin, without retaining the set for
/// preprocessed inputs.
fn bin_cardinality(files: &[PathBuf], cfg: &BuildConfig) -> Result<usize> {
    let mut preprocessed = 0usize;
    let mut rest = KmerSet::default();
    for file in files {
        if is_minimiser_file(file) {
            preprocessed += checked_header(file, cfg)?.count;
        } else {
            sketch_file_into(file, cfg, &mut rest)?;
        }
    }
    Ok(preprocessed + rest.len())
}

/// Read a preprocessed file's header and reject parameter mismatches.
fn checked_header(minimiser_file: &Path, cfg: &BuildConfig) -> Result<MinimiserHeader> {
    let header = read_minimiser_header(minimiser_file)?;
    if header.shape != cfg.shape || header.window_size != cfg.window_size {
        return Err(Error::Config(format!(
            "{}: preprocessed with shape {} window {}, build requests shape {} window {}",
            minimiser_file.display(),
            header.shape,
            header.window_size,
            cfg.shape,
            cfg.window_size
        )));
    }
    Ok(header)
}

// ---- Hierarchical IBF ----

/// Arena node of the build tree; children are arena indices.
#[derive(Debug, Default)]
struct BuildNode {
    parent_bin_index: usize,
    max_bin_index: usize,
    number_of_technical_bins: usize,
    favourite_child: Option<usize>,
    children: Vec<usize>,
    /// Record indices into the layout, max-bin record first.
    records: Vec<usize>,
}

struct BuildTree {
    nodes: Vec<BuildNode>,
}

impl BuildTree {
    fn from_layout(layout: &Layout) -> Result<Self> {
        let mut nodes = Vec::new();
        let root_max = layout
            .max_bins
            .iter()
            .find(|m| m.path.is_empty())
            .ok_or_else(|| Error::Layout("missing root max-bin annotation".into()))?;
        nodes.push(BuildNode {
            max_bin_index: root_max.max_bin,
            ..BuildNode::default()
        });

        // Parents precede children once sorted by path length.
        let mut merged: Vec<_> = layout.max_bins.iter().filter(|m| !m.path.is_empty()).collect();
        merged.sort_by_key(|m| m.path.len());
        let mut tree = BuildTree { nodes };
        for max_bin in merged {
            let parent = tree.walk(&max_bin.path[..max_bin.path.len() - 1])?;
            let bin_in_parent = *max_bin.path.last().expect("non-empty path");
            let id = tree.nodes.len();
            tree.nodes.push(BuildNode {
                parent_bin_index: bin_in_parent,
                max_bin_index: max_bin.max_bin,
                ..BuildNode::default()
            });
            tree.nodes[parent].children.push(id);
        }

        for record in &layout.user_bins {
            let depth = record.bin_indices.len();
            let node = tree.walk(&record.bin_indices[..depth - 1])?;
            if record.final_bin_index() == tree.nodes[node].max_bin_index {
                tree.nodes[node].records.insert(0, record.user_bin);
            } else {
                tree.nodes[node].records.push(record.user_bin);
            }
        }

        for id in 0..tree.nodes.len() {
            let max_bin_index = tree.nodes[id].max_bin_index;
            let mut bins = 0usize;
            let children = tree.nodes[id].children.clone();
            for child in children {
                let bin = tree.nodes[child].parent_bin_index;
                bins = bins.max(bin + 1);
                if bin == max_bin_index {
                    tree.nodes[id].favourite_child = Some(child);
                }
            }
            for &r in &tree.nodes[id].records {
                let record = &layout.user_bins[r];
                bins = bins.max(record.final_bin_index() + record.final_bin_count());
            }
            if bins == 0 {
                return Err(Error::Layout("empty IBF node in layout".into()));
            }
            let first_is_max = tree.nodes[id]
                .records
                .first()
                .is_some_and(|&r| layout.user_bins[r].final_bin_index() == max_bin_index);
            if tree.nodes[id].favourite_child.is_none() && !first_is_max {
                return Err(Error::Layout(format!(
                    "no record or merged bin occupies max bin {max_bin_index}"
                )));
            }
            tree.nodes[id].number_of_technical_bins = bins;
        }
        Ok(tree)
    }

    /// Resolve a path of bin indices from the root to an arena node.
    fn walk(&self, path: &[usize]) -> Result<usize> {
        let mut node = 0usize;
        for &bin in path {
            node = self.nodes[node]
                .children
                .iter()
                .copied()
                .find(|&c| self.nodes[c].parent_bin_index == bin)
                .ok_or_else(|| {
                    Error::Layout(format!("merged bin {bin} referenced before definition"))
                })?;
        }
        Ok(node)
    }
}

struct HibfState<'a> {
    layout: &'a Layout,
    cfg: &'a BuildConfig,
    ibfs: Vec<Option<InterleavedBloomFilter>>,
    next_ibf_id: Vec<Vec<usize>>,
    user_bin_index: Vec<Vec<i64>>,
}

impl HibfState<'_> {
    fn request_slot(&mut self) -> usize {
        self.ibfs.push(None);
        self.next_ibf_id.push(Vec::new());
        self.user_bin_index.push(Vec::new());
        self.ibfs.len() - 1
    }
}

/// Build an HIBF from a parsed layout.
pub fn build_hibf(layout: &Layout, cfg: &BuildConfig) -> Result<Index> {
    let tree = BuildTree::from_layout(layout)?;
    let mut state = HibfState {
        layout,
        cfg,
        ibfs: Vec::with_capacity(tree.nodes.len()),
        next_ibf_id: Vec::with_capacity(tree.nodes.len()),
        user_bin_index: Vec::with_capacity(tree.nodes.len()),
    };
    let mut root_kmers = KmerSet::default();
    let root_pos = hierarchical_build(&tree, &mut state, &mut root_kmers, 0, true)?;
    debug_assert_eq!(root_pos, 0);

    let hibf = HierarchicalIbf {
        ibfs: state.ibfs.into_iter().map(|s| s.expect("slot filled")).collect(),
        next_ibf_id: state.next_ibf_id,
        user_bin_index: state.user_bin_index,
    };
    let bin_path = layout
        .user_bins
        .iter()
        .map(|r| r.files.iter().map(|p| p.display().to_string()).collect())
        .collect();
    Ok(Index::new(
        cfg.window_size as u64,
        cfg.shape,
        1,
        bin_path,
        cfg.fpr,
        IndexData::Hibf(hibf),
    ))
}

/// Post-order build of one node; returns the slot its IBF landed in.
fn hierarchical_build(
    tree: &BuildTree,
    state: &mut HibfState<'_>,
    parent_kmers: &mut KmerSet,
    node_id: usize,
    is_root: bool,
) -> Result<usize> {
    let node = &tree.nodes[node_id];
    let cfg = state.cfg;
    let ibf_pos = state.request_slot();
    let ntb = node.number_of_technical_bins;
    let mut ibf_positions = vec![ibf_pos; ntb];
    let mut filename_indices = vec![NO_USER_BIN; ntb];
    let mut kmers = KmerSet::default();

    // Initialise from the max bin: either a merged child or the first record.
    let max_bin_tbs = match node.favourite_child {
        Some(child) => {
            let child_pos = hierarchical_build(tree, state, &mut kmers, child, false)?;
            ibf_positions[node.max_bin_index] = child_pos;
            1
        }
        None => {
            let record = &state.layout.user_bins[node.records[0]];
            compute_kmers(record, cfg, &mut kmers)?;
            update_user_bins(&mut filename_indices, record);
            record.final_bin_count()
        }
    };

    let mut ibf = construct_ibf(&kmers, max_bin_tbs, ntb, node.max_bin_index, cfg);
    if !is_root {
        parent_kmers.extend(kmers.iter().copied());
    }
    kmers.clear(); // keep the memory peak flat

    // Remaining merged children.
    for &child in &node.children {
        if node.favourite_child == Some(child) {
            continue;
        }
        let mut child_kmers = KmerSet::default();
        let child_pos = hierarchical_build(tree, state, &mut child_kmers, child, false)?;
        let bin = tree.nodes[child].parent_bin_index;
        ibf_positions[bin] = child_pos;
        insert_into_ibf(&child_kmers, 1, bin, &mut ibf);
        if !is_root {
            parent_kmers.extend(child_kmers.iter().copied());
        }
    }

    // Remaining split records (the first one is done unless a child was max).
    let start = if node.favourite_child.is_some() { 0 } else { 1 };
    for &r in &node.records[start..] {
        let record = &state.layout.user_bins[r];
        if is_root && record.final_bin_count() == 1 {
            // Stream straight from the files; nothing above needs the set.
            stream_into_ibf(record, cfg, &mut ibf)?;
        } else {
            compute_kmers(record, cfg, &mut kmers)?;
            insert_into_ibf(&kmers, record.final_bin_count(), record.final_bin_index(), &mut ibf);
            if !is_root {
                parent_kmers.extend(kmers.iter().copied());
            }
        }
        update_user_bins(&mut filename_indices, record);
        kmers.clear();
    }

    state.ibfs[ibf_pos] = Some(ibf);
    state.next_ibf_id[ibf_pos] = ibf_positions;
    state.user_bin_index[ibf_pos] = filename_indices;
    Ok(ibf_pos)
}

/// Size an IBF from its max bin's load and insert those k-mers.
fn construct_ibf(
    kmers: &KmerSet,
    max_bin_tbs: usize,
    bin_count: usize,
    max_bin_index: usize,
    cfg: &BuildConfig,
) -> InterleavedBloomFilter {
    let kmers_per_bin = kmers.len().div_ceil(max_bin_tbs.max(1)).max(1);
    let (bin_size, hash_count) = cfg.bin_size_for(kmers_per_bin);
    let mut ibf = InterleavedBloomFilter::new(bin_count, bin_size, hash_count);
    insert_into_ibf(kmers, max_bin_tbs, max_bin_index, &mut ibf);
    ibf
}

/// Insert a k-mer set into `number_of_bins` adjacent technical bins by
/// naive even chunking of the set's iteration order.
fn insert_into_ibf(
    kmers: &KmerSet,
    number_of_bins: usize,
    bin_index: usize,
    ibf: &mut InterleavedBloomFilter,
) {
    let chunk_size = kmers.len() / number_of_bins.max(1) + 1;
    for (i, &hash) in kmers.iter().enumerate() {
        ibf.emplace(hash, bin_index + i / chunk_size);
    }
}

fn update_user_bins(filename_indices: &mut [i64], record: &UserBinRecord) {
    let start = record.final_bin_index();
    for slot in &mut filename_indices[start..start + record.final_bin_count()] {
        *slot = record.user_bin as i64;
    }
}

// ---- K-mer input ----

pub(crate) fn is_minimiser_file(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "minimiser")
}

/// Union the minimizer content of all of a record's files into `out`.
fn compute_kmers(record: &UserBinRecord, cfg: &BuildConfig, out: &mut KmerSet) -> Result<()> {
    compute_kmers_for_files(&record.files, cfg, out)
}

fn compute_kmers_for_files(files: &[PathBuf], cfg: &BuildConfig, out: &mut KmerSet) -> Result<()> {
    for file in files {
        if is_minimiser_file(file) {
            checked_header(file, cfg)?;
            stream_minimiser_file(file, |hash| {
                out.insert(hash);
            })?;
        } else {
            sketch_file_into(file, cfg, out)?;
        }
    }
    Ok(())
}

/// Root-level single-bin records skip the set entirely.
fn stream_into_ibf(
    record: &UserBinRecord,
    cfg: &BuildConfig,
    ibf: &mut InterleavedBloomFilter,
) -> Result<()> {
    let bin = record.final_bin_index();
    for file in &record.files {
        if is_minimiser_file(file) {
            checked_header(file, cfg)?;
            stream_minimiser_file(file, |hash| ibf.emplace(hash, bin))?;
        } else {
            let mut buffer = Vec::new();
            for_each_fastx_record(file, |_, seq| {
                buffer.clear();
                sketch::minimizers_into(seq, cfg.shape, cfg.window_size, &mut buffer);
                for &hash in &buffer {
                    ibf.emplace(hash, bin);
                }
            })?;
        }
    }
    Ok(())
}

fn sketch_file_into(file: &Path, cfg: &BuildConfig, out: &mut KmerSet) -> Result<()> {
    let mut buffer = Vec::new();
    for_each_fastx_record(file, |_, seq| {
        buffer.clear();
        sketch::minimizers_into(seq, cfg.shape, cfg.window_size, &mut buffer);
        out.extend(buffer.iter().copied());
    })
}

/// Raw little-endian u64 stream; a trailing partial word is a format error.
pub(crate) fn stream_minimiser_file(path: &Path, mut f: impl FnMut(u64)) -> Result<()> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut word = [0u8; 8];
    loop {
        let n = read_full(&mut reader, &mut word).map_err(|e| Error::io(path, e))?;
        match n {
            0 => return Ok(()),
            8 => f(u64::from_le_bytes(word)),
            _ => {
                return Err(Error::Input(format!(
                    "{}: truncated minimizer file",
                    path.display()
                )));
            }
        }
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Stream `(id, sequence)` records of a FASTA/FASTQ file (gzip transparent).
pub(crate) fn for_each_fastx_record(
    path: &Path,
    mut f: impl FnMut(&[u8], &[u8]),
) -> Result<()> {
    let mut reader = needletail::parse_fastx_file(path)
        .map_err(|e| Error::Input(format!("{}: {e}", path.display())))?;
    while let Some(record) = reader.next() {
        let record = record.map_err(|e| Error::Input(format!("{}: {e}", path.display())))?;
        f(record.id(), &record.seq());
    }
    Ok(())
}
