use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use kestrel::build::BuildConfig;
use kestrel::prepare::PrepareConfig;
use kestrel::search::SearchConfig;
use kestrel::shape::Shape;

/// Minimizer-sketched (hierarchical) interleaved Bloom filter search.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Precompute per-file minimizers for later index builds.
    Prepare(PrepareArgs),
    /// Build a flat or hierarchical index from a bin list or layout file.
    Build(BuildArgs),
    /// Query an index with sequencing reads.
    Search(SearchArgs),
}

#[derive(Args, Debug)]
struct SketchArgs {
    /// K-mer size (contiguous k-mer; <= 32)
    #[arg(short = 'k', long)]
    kmer: Option<u8>,

    /// Spaced-seed shape as a 0/1 string, leftmost position first.
    /// Mutually exclusive with --kmer.
    #[arg(long)]
    shape: Option<String>,

    /// Window size in bases (defaults to the shape span)
    #[arg(short = 'w', long)]
    window: Option<usize>,
}

impl SketchArgs {
    fn resolve(&self) -> anyhow::Result<(Shape, usize)> {
        let shape = match (&self.kmer, &self.shape) {
            (Some(_), Some(_)) => bail!("--kmer and --shape are mutually exclusive"),
            (Some(k), None) => Shape::ungapped(*k)?,
            (None, Some(s)) => Shape::parse(s)?,
            (None, None) => Shape::ungapped(20)?,
        };
        let window = self.window.unwrap_or(shape.span());
        Ok((shape, window))
    }
}

#[derive(Args, Debug)]
struct PrepareArgs {
    /// File listing the input sequence files, one bin per line
    bin_file: PathBuf,

    /// Output directory for .minimiser/.header files
    #[arg(short, long)]
    output: PathBuf,

    #[command(flatten)]
    sketch: SketchArgs,

    /// Worker threads
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Derive occurrence cutoffs from the input file sizes
    #[arg(long, default_value_t = false)]
    enable_cutoffs: bool,
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Bin list (one user bin per line) or layout file (with # header)
    input: PathBuf,

    /// Output index path
    #[arg(short, long)]
    output: PathBuf,

    /// Target false-positive rate per bin
    #[arg(long, default_value_t = 0.05)]
    fpr: f64,

    /// Fixed number of hash functions (1..=5; derived from fpr if omitted)
    #[arg(long)]
    hash: Option<usize>,

    #[command(flatten)]
    sketch: SketchArgs,

    /// Worker threads
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Split a flat index into this many part files
    #[arg(long, default_value_t = 1)]
    parts: u8,
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// Index produced by kestrel build
    #[arg(long)]
    index: PathBuf,

    /// Query reads (FASTA/FASTQ, optionally gzipped)
    #[arg(long)]
    query: PathBuf,

    /// Output file for per-query hit lines
    #[arg(short, long)]
    output: PathBuf,

    /// Number of tolerated errors per query
    #[arg(short, long, default_value_t = 0)]
    error: usize,

    /// Fixed fraction of minimizers that must hit, instead of the
    /// probabilistic threshold
    #[arg(long)]
    threshold: Option<f64>,

    /// Expect a hierarchical index
    #[arg(long, default_value_t = false)]
    hibf: bool,

    /// Worker threads
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Query length the threshold is computed for (defaults to the median
    /// read length)
    #[arg(long)]
    pattern_size: Option<usize>,

    /// Probability that the threshold captures a true match
    #[arg(long, default_value_t = 0.9999)]
    tau: f64,
}

fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Prepare(args) => {
            let (shape, window_size) = args.sketch.resolve()?;
            kestrel::prepare::run_prepare(&PrepareConfig {
                bin_file: args.bin_file,
                output_dir: args.output,
                shape,
                window_size,
                threads: args.threads,
                enable_cutoffs: args.enable_cutoffs,
            })
            .context("prepare failed")?;
        }
        Command::Build(args) => {
            let (shape, window_size) = args.sketch.resolve()?;
            kestrel::build::run_build(&BuildConfig {
                input: args.input,
                output: args.output,
                shape,
                window_size,
                fpr: args.fpr,
                hash_count: args.hash,
                threads: args.threads,
                parts: args.parts,
            })
            .context("build failed")?;
        }
        Command::Search(args) => {
            kestrel::search::run_search(&SearchConfig {
                index_file: args.index,
                query_file: args.query,
                output_file: args.output,
                errors: args.error,
                threshold: args.threshold,
                tau: args.tau,
                pattern_size: args.pattern_size,
                threads: args.threads,
                expect_hibf: args.hibf,
            })
            .context("search failed")?;
        }
    }
    Ok(())
}
