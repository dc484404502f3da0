//! Probabilistic minimizer-count thresholds.
//!
//! For a query of `pattern_size` bases sketched with a given shape and
//! window, the table answers: given that the query produced `n` minimizers,
//! how many of them must hit a bin before the bin counts as containing the
//! query, such that a true source bin is reported with probability `tau`
//! under `errors` sequencing errors.
//!
//! Thresholds for `window > span` are model-based; at zero errors that
//! configuration is conservative (it demands all minimizers) and recall is
//! reduced. `window == span` uses the exact lemma-based closed form.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::sketch::minimizer_positions;

/// Fixed seed for the indirect-error simulation; results are reproducible
/// across processes, which the on-disk memo relies on.
const MODEL_SEED: u64 = 0x1D2B_8284_D988_C4D0;

/// Random sequences drawn per error position when estimating indirect
/// destruction.
const SEQUENCES_PER_POSITION: usize = 100;

#[derive(Clone, Copy, Debug)]
pub struct ThresholdParams {
    pub pattern_size: usize,
    pub window_size: usize,
    pub shape: Shape,
    pub errors: usize,
    pub tau: f64,
}

impl ThresholdParams {
    fn validate(&self) -> Result<()> {
        if self.window_size < self.shape.span() {
            return Err(Error::Config(format!(
                "window ({}) smaller than shape span ({})",
                self.window_size,
                self.shape.span()
            )));
        }
        if self.pattern_size < self.window_size {
            return Err(Error::Config(format!(
                "pattern size ({}) smaller than window ({})",
                self.pattern_size, self.window_size
            )));
        }
        if !(self.tau > 0.0 && self.tau < 1.0) {
            return Err(Error::Config(format!("tau must be in (0,1), got {}", self.tau)));
        }
        Ok(())
    }
}

/// Minimum minimizer matches as a function of the query's minimizer count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThresholdTable {
    /// Smallest minimizer count the table covers; lookups clamp into range.
    pub n_min: usize,
    pub values: Vec<usize>,
}

impl ThresholdTable {
    #[inline]
    pub fn get(&self, n: usize) -> usize {
        let i = n.saturating_sub(self.n_min).min(self.values.len() - 1);
        self.values[i]
    }
}

/// Per-query threshold policy used by the search pipeline.
#[derive(Clone, Debug)]
pub enum Thresholder {
    /// Fixed fraction of the query's minimizer count.
    Fraction(f64),
    /// Precomputed probabilistic table.
    Table(ThresholdTable),
}

impl Thresholder {
    /// Build from search options: an explicit fraction wins, otherwise the
    /// table is computed (or loaded from `memo_dir` when present there).
    pub fn new(
        params: ThresholdParams,
        fraction: Option<f64>,
        memo_dir: Option<&Path>,
    ) -> Result<Self> {
        if let Some(f) = fraction {
            if !(0.0..=1.0).contains(&f) {
                return Err(Error::Config(format!("threshold must be in [0,1], got {f}")));
            }
            return Ok(Thresholder::Fraction(f));
        }
        params.validate()?;
        if let Some(dir) = memo_dir {
            let memo = memo_path(dir, &params);
            if memo.exists() {
                return Ok(Thresholder::Table(read_table(&memo)?));
            }
            let table = precompute_threshold(&params);
            write_table(&memo, &table)?;
            return Ok(Thresholder::Table(table));
        }
        Ok(Thresholder::Table(precompute_threshold(&params)))
    }

    /// Required matches for a query with `n > 0` minimizers.
    #[inline]
    pub fn get(&self, n: usize) -> usize {
        match self {
            Thresholder::Fraction(f) => (f * n as f64).ceil() as usize,
            Thresholder::Table(table) => table.get(n),
        }
    }
}

/// Compute the threshold table for one parameter tuple.
pub fn precompute_threshold(params: &ThresholdParams) -> ThresholdTable {
    let span = params.shape.span();
    let p = params.pattern_size;
    let e = params.errors;

    if params.window_size == span {
        // Every k-mer is its own window: the classic k-mer lemma.
        let value = (p + 1).saturating_sub((e + 1) * span);
        return ThresholdTable {
            n_min: 0,
            values: vec![value],
        };
    }

    let kmers_per_window = params.window_size - span + 1;
    let kmers_per_pattern = p - span + 1;
    let n_min = kmers_per_pattern / kmers_per_window;
    let n_max = p - params.window_size + 1;

    let indirect_errors =
        destroyed_indirectly_by_error(p, params.window_size, params.shape);

    let mut values = Vec::with_capacity(n_max - n_min + 1);
    for n in n_min..=n_max {
        let q = n as f64 / kmers_per_pattern as f64;
        let proba = one_error_model(span, q, kmers_per_pattern, &indirect_errors);
        let mut proba_error = enumerate_all_errors(e, n.max(1), &proba);

        let sum: f64 = proba_error.iter().sum();
        if sum > 0.0 {
            for x in &mut proba_error {
                *x /= sum;
            }
        }

        let mut cumulative = 0.0;
        let mut threshold = 0;
        for (i, &mass) in proba_error.iter().enumerate() {
            cumulative += mass;
            if cumulative >= params.tau {
                threshold = n - i;
                break;
            }
        }
        values.push(threshold);
    }
    ThresholdTable { n_min, values }
}

/// Probability distribution of the number of minimizers destroyed by a
/// single error at a uniformly random position.
///
/// Direct destruction is binomial over the k-mers covering the error, each a
/// minimizer with probability `q`; the per-position indirect expectation is
/// folded in as a two-point distribution on its floor and ceiling.
fn one_error_model(
    span: usize,
    q: f64,
    kmers_per_pattern: usize,
    indirect_errors: &[f64],
) -> Vec<f64> {
    let mut proba = vec![0.0; span + 2];
    let weight = 1.0 / kmers_per_pattern as f64;

    for i in 0..kmers_per_pattern {
        let lo = i.saturating_sub(span - 1);
        let hi = i.min(kmers_per_pattern - 1);
        let covered = hi - lo + 1;

        let mut direct = binomial_distribution(covered, q);
        let indirect = indirect_errors[i];
        let whole = indirect.floor() as usize;
        let frac = indirect.fract();
        if whole > 0 || frac > 0.0 {
            direct = shift_distribution(&direct, whole, frac);
        }
        if proba.len() < direct.len() {
            proba.resize(direct.len(), 0.0);
        }
        for (j, &mass) in direct.iter().enumerate() {
            proba[j] += weight * mass;
        }
    }
    proba
}

fn binomial_distribution(n: usize, q: f64) -> Vec<f64> {
    let mut dist = vec![0.0; n + 1];
    dist[0] = 1.0;
    // Iterated Bernoulli convolution; n is at most the shape span.
    for _ in 0..n {
        for j in (1..dist.len()).rev() {
            dist[j] = dist[j] * (1.0 - q) + dist[j - 1] * q;
        }
        dist[0] *= 1.0 - q;
    }
    dist
}

/// Convolve with `{whole: 1-frac, whole+1: frac}`.
fn shift_distribution(dist: &[f64], whole: usize, frac: f64) -> Vec<f64> {
    let mut out = vec![0.0; dist.len() + whole + 1];
    for (j, &mass) in dist.iter().enumerate() {
        out[j + whole] += mass * (1.0 - frac);
        out[j + whole + 1] += mass * frac;
    }
    out
}

/// Distribution of minimizers destroyed by `errors` independent errors,
/// truncated at `n` outcomes. The truncation is exact for every index below
/// `n`: higher intermediate terms cannot flow back down.
fn enumerate_all_errors(errors: usize, n: usize, proba: &[f64]) -> Vec<f64> {
    let mut dist = vec![0.0; n];
    dist[0] = 1.0;
    for _ in 0..errors {
        let mut next = vec![0.0; n];
        for (i, &mass) in dist.iter().enumerate() {
            if mass == 0.0 {
                continue;
            }
            for (j, &step) in proba.iter().enumerate() {
                if i + j >= n {
                    break;
                }
                next[i + j] += mass * step;
            }
        }
        dist = next;
    }
    dist
}

/// Expected number of minimizers destroyed by an error at each position
/// without the error touching their k-mer, estimated by seeded simulation.
fn destroyed_indirectly_by_error(
    pattern_size: usize,
    window_size: usize,
    shape: Shape,
) -> Vec<f64> {
    let span = shape.span();
    let kmers_per_pattern = pattern_size - span + 1;
    let mut rng = StdRng::seed_from_u64(MODEL_SEED);
    let mut result = vec![0.0; kmers_per_pattern];

    for (epos, slot) in result.iter_mut().enumerate() {
        let mut destroyed_total = 0usize;
        for _ in 0..SEQUENCES_PER_POSITION {
            let mut seq: Vec<u8> = (0..pattern_size).map(|_| rng.gen_range(0..4u8)).collect();
            let before = minimizer_positions(&seq, shape, window_size);
            seq[epos] = (seq[epos] + rng.gen_range(1..4u8)) & 0b11;
            let after = minimizer_positions(&seq, shape, window_size);

            for start in 0..kmers_per_pattern {
                let covers = start <= epos && epos < start + span;
                if before[start] && !after[start] && !covers {
                    destroyed_total += 1;
                }
            }
        }
        *slot = destroyed_total as f64 / SEQUENCES_PER_POSITION as f64;
    }
    result
}

// ---- Disk memoization ----

fn memo_path(dir: &Path, params: &ThresholdParams) -> PathBuf {
    dir.join(format!(
        "threshold_p{}_w{}_s{}_e{}_tau{}.bin",
        params.pattern_size, params.window_size, params.shape, params.errors, params.tau
    ))
}

fn write_table(path: &Path, table: &ThresholdTable) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut w = BufWriter::new(file);
    (|| {
        w.write_u64::<LE>(table.n_min as u64)?;
        w.write_u64::<LE>(table.values.len() as u64)?;
        for &v in &table.values {
            w.write_u64::<LE>(v as u64)?;
        }
        w.flush()
    })()
    .map_err(|e| Error::io(path, e))
}

fn read_table(path: &Path) -> Result<ThresholdTable> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut r = BufReader::new(file);
    (|| {
        let n_min = r.read_u64::<LE>()? as usize;
        let len = r.read_u64::<LE>()? as usize;
        let mut values = Vec::with_capacity(len.min(1 << 24));
        for _ in 0..len {
            values.push(r.read_u64::<LE>()? as usize);
        }
        Ok::<_, std::io::Error>(ThresholdTable { n_min, values })
    })()
    .map_err(|e| Error::io(path, e))
    .and_then(|t| {
        if t.values.is_empty() {
            Err(Error::Format(format!("{}: empty threshold table", path.display())))
        } else {
            Ok(t)
        }
    })
}
