//! Minimizer preprocessing: turn each input sequence file into a
//! `<stem>.minimiser` hash dump plus a `<stem>.header` describing the
//! sketching parameters, the applied occurrence cutoff, and how many hashes
//! were stored.
//!
//! Header format, whitespace-separated on one line:
//! `<shape> <window> <cutoff> <count>`.

use byteorder::{LittleEndian as LE, WriteBytesExt};
use hashbrown::HashMap;
use nohash_hasher::BuildNoHashHasher;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::sketch;

/// Occurrence cutoffs by input size, after halving uncompressed sizes; the
/// curve stems from compressed read sets.
const CUTOFF_BOUNDS: [u64; 4] = [314_572_800, 524_288_000, 1_073_741_824, 3_221_225_472];
const CUTOFFS: [u64; 4] = [1, 3, 10, 20];
const CUTOFF_MAX: u64 = 50;

#[derive(Clone, Debug)]
pub struct PrepareConfig {
    pub bin_file: PathBuf,
    pub output_dir: PathBuf,
    pub shape: Shape,
    pub window_size: usize,
    pub threads: usize,
    pub enable_cutoffs: bool,
}

impl PrepareConfig {
    fn validate(&self) -> Result<()> {
        if self.window_size < self.shape.span() {
            return Err(Error::Config(format!(
                "window ({}) smaller than shape span ({})",
                self.window_size,
                self.shape.span()
            )));
        }
        if self.threads == 0 {
            return Err(Error::Config("thread count must be positive".into()));
        }
        Ok(())
    }
}

/// Sidecar metadata of a `.minimiser` file.
#[derive(Clone, Debug)]
pub struct MinimiserHeader {
    pub shape: Shape,
    pub window_size: usize,
    pub cutoff: u64,
    pub count: usize,
}

/// Preprocess every file listed in `cfg.bin_file`, in parallel.
pub fn run_prepare(cfg: &PrepareConfig) -> Result<()> {
    cfg.validate()?;
    rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.threads)
        .build_global()
        .ok();
    std::fs::create_dir_all(&cfg.output_dir).map_err(|e| Error::io(&cfg.output_dir, e))?;

    let files = parse_file_list(&cfg.bin_file)?;
    files.par_iter().try_for_each(|file| prepare_file(file, cfg))
}

/// All files named in a bin list, flattened (`;` separates files per line).
fn parse_file_list(path: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut files = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::io(path, e))?;
        for part in line.split(';') {
            let part = part.trim();
            if !part.is_empty() {
                files.push(PathBuf::from(part));
            }
        }
    }
    if files.is_empty() {
        return Err(Error::Input(format!("{}: no input files", path.display())));
    }
    Ok(files)
}

fn prepare_file(input: &Path, cfg: &PrepareConfig) -> Result<()> {
    let cutoff = if cfg.enable_cutoffs { cutoff_for(input)? } else { 0 };

    let mut occurrences: HashMap<u64, u16, BuildNoHashHasher<u64>> = HashMap::default();
    let mut buffer = Vec::new();
    crate::build::for_each_fastx_record(input, |_, seq| {
        buffer.clear();
        sketch::minimizers_into(seq, cfg.shape, cfg.window_size, &mut buffer);
        for &hash in &buffer {
            let count = occurrences.entry(hash).or_insert(0);
            *count = count.saturating_add(1);
        }
    })?;

    let mut survivors: Vec<u64> = occurrences
        .iter()
        .filter(|&(_, &count)| u64::from(count) > cutoff)
        .map(|(&hash, _)| hash)
        .collect();
    survivors.sort_unstable();

    let minimiser_path = cfg.output_dir.join(output_name(input, "minimiser"));
    let file = File::create(&minimiser_path).map_err(|e| Error::io(&minimiser_path, e))?;
    let mut w = BufWriter::new(file);
    for &hash in &survivors {
        w.write_u64::<LE>(hash).map_err(|e| Error::io(&minimiser_path, e))?;
    }
    w.flush().map_err(|e| Error::io(&minimiser_path, e))?;

    let header_path = cfg.output_dir.join(output_name(input, "header"));
    let mut h = File::create(&header_path).map_err(|e| Error::io(&header_path, e))?;
    writeln!(
        h,
        "{} {} {} {}",
        cfg.shape,
        cfg.window_size,
        cutoff,
        survivors.len()
    )
    .map_err(|e| Error::io(&header_path, e))
}

/// Size-based cutoff; uncompressed inputs count half their bytes.
fn cutoff_for(path: &Path) -> Result<u64> {
    let bytes = std::fs::metadata(path).map_err(|e| Error::io(path, e))?.len();
    let compressed = path.extension().is_some_and(|e| e == "gz");
    let effective = if compressed { bytes } else { bytes / 2 };
    for (bound, cutoff) in CUTOFF_BOUNDS.iter().zip(CUTOFFS) {
        if effective <= *bound {
            return Ok(cutoff);
        }
    }
    Ok(CUTOFF_MAX)
}

/// `reads.fq.gz` becomes `reads.<ext>`.
fn output_name(input: &Path, ext: &str) -> PathBuf {
    let name = input.file_name().unwrap_or_default().to_string_lossy();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => name,
    };
    PathBuf::from(format!("{stem}.{ext}"))
}

/// Read the `.header` sidecar of a `.minimiser` file.
pub fn read_minimiser_header(minimiser_path: &Path) -> Result<MinimiserHeader> {
    let header_path = minimiser_path.with_extension("header");
    let mut text = String::new();
    File::open(&header_path)
        .and_then(|mut f| f.read_to_string(&mut text))
        .map_err(|e| Error::io(&header_path, e))?;

    let mut fields = text.split_whitespace();
    let parse_failure = || Error::Input(format!("{}: malformed header", header_path.display()));
    let shape = Shape::parse(fields.next().ok_or_else(parse_failure)?)?;
    let window_size = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(parse_failure)?;
    let cutoff = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(parse_failure)?;
    let count = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(parse_failure)?;
    Ok(MinimiserHeader {
        shape,
        window_size,
        cutoff,
        count,
    })
}
