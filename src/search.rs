//! Query pipeline: stream records in large chunks, sketch and look them up
//! on a work-stealing pool, and write per-query hit lines through a
//! synchronized writer.
//!
//! Within one worker, lines appear in input order; across workers there is
//! no ordering. The set of emitted lines is independent of the thread count.

use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::build::part_path;
use crate::error::{Error, Result};
use crate::hibf::MembershipAgent;
use crate::ibf::CountingAgent;
use crate::index::{Index, IndexData};
use crate::sketch;
use crate::threshold::{ThresholdParams, Thresholder};

/// Records held in memory per streaming chunk.
const RECORDS_PER_CHUNK: usize = 10 * (1 << 20);

const OUTPUT_HEADER: &str = "#QUERY_NAME\tUSER_BINS\n";

#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub index_file: PathBuf,
    pub query_file: PathBuf,
    pub output_file: PathBuf,
    pub errors: usize,
    /// Fixed threshold fraction; replaces the probabilistic table.
    pub threshold: Option<f64>,
    pub tau: f64,
    /// Defaults to the median record length of the first chunk.
    pub pattern_size: Option<usize>,
    pub threads: usize,
    /// Require the index to be hierarchical.
    pub expect_hibf: bool,
}

impl SearchConfig {
    fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::Config("thread count must be positive".into()));
        }
        if self.threshold.is_some() && self.errors != 0 {
            return Err(Error::Config(
                "--threshold and --error are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

struct QueryRecord {
    id: String,
    seq: Vec<u8>,
}

/// Nanosecond counters merged from per-worker timers at worker end.
#[derive(Default)]
struct SearchTimers {
    sketch: AtomicU64,
    lookup: AtomicU64,
    format: AtomicU64,
}

#[derive(Default)]
struct LocalTimers {
    sketch: u64,
    lookup: u64,
    format: u64,
}

impl LocalTimers {
    #[inline]
    fn time<T>(slot: &mut u64, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let value = f();
        *slot += start.elapsed().as_nanos() as u64;
        value
    }

    fn merge_into(self, shared: &SearchTimers) {
        shared.sketch.fetch_add(self.sketch, Ordering::Relaxed);
        shared.lookup.fetch_add(self.lookup, Ordering::Relaxed);
        shared.format.fetch_add(self.format, Ordering::Relaxed);
    }
}

struct SyncOut {
    writer: Mutex<BufWriter<File>>,
}

impl SyncOut {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(OUTPUT_HEADER.as_bytes())
            .map_err(|e| Error::io(path, e))?;
        Ok(SyncOut {
            writer: Mutex::new(writer),
        })
    }

    fn write(&self, line: &str) {
        let mut writer = self.writer.lock().expect("output lock poisoned");
        writer
            .write_all(line.as_bytes())
            .expect("write to query output failed");
    }

    fn finish(self, path: &Path) -> Result<()> {
        let mut writer = self.writer.into_inner().expect("output lock poisoned");
        writer.flush().map_err(|e| Error::io(path, e))
    }
}

/// Run a search; the output file is fully written or removed.
pub fn run_search(cfg: &SearchConfig) -> Result<()> {
    let result = search_impl(cfg);
    if result.is_err() {
        let _ = std::fs::remove_file(&cfg.output_file);
    }
    result
}

fn search_impl(cfg: &SearchConfig) -> Result<()> {
    cfg.validate()?;
    rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.threads)
        .build_global()
        .ok();

    let first_part = first_part_file(&cfg.index_file)?;
    let partitioned = first_part != cfg.index_file;
    // Deserialize the index while the first chunk of queries is read.
    let loader_path = first_part.clone();
    let loader = std::thread::spawn(move || Index::read_from(&loader_path));

    let mut reader = needletail::parse_fastx_file(&cfg.query_file)
        .map_err(|e| Error::Input(format!("{}: {e}", cfg.query_file.display())))?;
    let mut chunk = read_chunk(&mut reader, &cfg.query_file)?;

    let index = loader.join().expect("index loader thread panicked")?;
    if cfg.expect_hibf && !index.is_hibf() {
        return Err(Error::Config(format!(
            "{}: index is not hierarchical",
            cfg.index_file.display()
        )));
    }
    let part_files: Vec<PathBuf> = if partitioned {
        (0..usize::from(index.parts().max(1)))
            .map(|p| part_path(&cfg.index_file, p))
            .collect()
    } else {
        vec![first_part]
    };

    let out = SyncOut::create(&cfg.output_file)?;
    if chunk.is_empty() {
        out.finish(&cfg.output_file)?;
        return Ok(());
    }
    let thresholder = make_thresholder(cfg, &index, &chunk)?;
    let timers = SearchTimers::default();

    while !chunk.is_empty() {
        if part_files.len() == 1 {
            process_chunk(&chunk, &index, &thresholder, cfg.threads, &out, &timers);
        } else {
            process_chunk_partitioned(&chunk, &index, &part_files, cfg, &thresholder, &out, &timers)?;
        }
        chunk = read_chunk(&mut reader, &cfg.query_file)?;
    }

    out.finish(&cfg.output_file)?;
    report_timers(&timers);
    Ok(())
}

/// The index file itself, or `<index>_0` when the build was partitioned.
fn first_part_file(index_file: &Path) -> Result<PathBuf> {
    if index_file.exists() {
        return Ok(index_file.to_path_buf());
    }
    let first = part_path(index_file, 0);
    if first.exists() {
        return Ok(first);
    }
    Err(Error::io(
        index_file,
        std::io::Error::new(std::io::ErrorKind::NotFound, "index not found"),
    ))
}

fn make_thresholder(cfg: &SearchConfig, index: &Index, chunk: &[QueryRecord]) -> Result<Thresholder> {
    let pattern_size = match cfg.pattern_size {
        Some(p) => p,
        None => median_length(chunk),
    };
    let memo_dir = cfg
        .index_file
        .parent()
        .map(|d| if d.as_os_str().is_empty() { Path::new(".") } else { d });
    Thresholder::new(
        ThresholdParams {
            pattern_size,
            window_size: index.window_size() as usize,
            shape: index.shape(),
            errors: cfg.errors,
            tau: cfg.tau,
        },
        cfg.threshold,
        memo_dir,
    )
}

fn median_length(records: &[QueryRecord]) -> usize {
    let mut lengths: Vec<usize> = records.iter().map(|r| r.seq.len()).collect();
    if lengths.is_empty() {
        return 0;
    }
    lengths.sort_unstable();
    lengths[lengths.len() / 2]
}

fn read_chunk(
    reader: &mut Box<dyn needletail::parser::FastxReader>,
    path: &Path,
) -> Result<Vec<QueryRecord>> {
    let mut records = Vec::new();
    while records.len() < RECORDS_PER_CHUNK {
        let Some(record) = reader.next() else { break };
        let record = record.map_err(|e| Error::Input(format!("{}: {e}", path.display())))?;
        records.push(QueryRecord {
            id: String::from_utf8_lossy(record.id()).into_owned(),
            seq: record.seq().into_owned(),
        });
    }
    Ok(records)
}

/// Hit bins for one sketched query, ascending.
fn query_bins<'a>(
    index: &'a Index,
    minimizers: &[u64],
    threshold: usize,
    counting: &mut CountingAgent,
    membership: &mut Option<MembershipAgent<'a>>,
) -> Vec<usize> {
    match index.data() {
        IndexData::Ibf(ibf) => counting
            .count(ibf, minimizers)
            .iter()
            .enumerate()
            .filter(|&(_, &c)| usize::from(c) >= threshold)
            .map(|(bin, _)| bin)
            .collect(),
        IndexData::Hibf(hibf) => {
            let agent = membership.get_or_insert_with(|| MembershipAgent::new(hibf));
            agent.membership(minimizers, threshold).to_vec()
        }
    }
}

fn format_line(line: &mut String, id: &str, bins: &[usize]) {
    line.clear();
    line.push_str(id);
    line.push('\t');
    for (i, bin) in bins.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&bin.to_string());
    }
    line.push('\n');
}

/// Dynamic dispatch of `threads × threads` record slices over the pool.
fn worker_chunk_size(len: usize, threads: usize) -> usize {
    len.div_ceil(threads * threads).max(1)
}

fn process_chunk(
    records: &[QueryRecord],
    index: &Index,
    thresholder: &Thresholder,
    threads: usize,
    out: &SyncOut,
    timers: &SearchTimers,
) {
    let chunk_size = worker_chunk_size(records.len(), threads);
    records.par_chunks(chunk_size).for_each(|slice| {
        let mut local = LocalTimers::default();
        let mut counting = CountingAgent::default();
        let mut membership = None;
        let mut minimizers = Vec::new();
        let mut line = String::new();

        for record in slice {
            minimizers.clear();
            LocalTimers::time(&mut local.sketch, || {
                sketch::minimizers_into(
                    &record.seq,
                    index.shape(),
                    index.window_size() as usize,
                    &mut minimizers,
                );
            });

            let bins = if minimizers.is_empty() {
                Vec::new()
            } else {
                let threshold = thresholder.get(minimizers.len());
                LocalTimers::time(&mut local.lookup, || {
                    query_bins(index, &minimizers, threshold, &mut counting, &mut membership)
                })
            };

            LocalTimers::time(&mut local.format, || {
                format_line(&mut line, &record.id, &bins);
                out.write(&line);
            });
        }
        local.merge_into(timers);
    });
}

/// Partitioned indices: one pass per part, per-query hit sets unioned with
/// global user-bin offsets before anything is written.
fn process_chunk_partitioned(
    records: &[QueryRecord],
    first: &Index,
    part_files: &[PathBuf],
    cfg: &SearchConfig,
    thresholder: &Thresholder,
    out: &SyncOut,
    timers: &SearchTimers,
) -> Result<()> {
    let mut hits: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
    let mut offset = 0usize;

    for (p, path) in part_files.iter().enumerate() {
        let loaded;
        let part = if p == 0 {
            first
        } else {
            loaded = Index::read_from(path)?;
            &loaded
        };
        collect_part_hits(records, part, thresholder, cfg.threads, offset, &mut hits, timers);
        offset += part.bin_path().len();
    }

    let chunk_size = worker_chunk_size(records.len(), cfg.threads);
    records
        .par_chunks(chunk_size)
        .zip(hits.par_chunks_mut(chunk_size))
        .for_each(|(slice, slots)| {
            let mut line = String::new();
            for (record, bins) in slice.iter().zip(slots) {
                bins.sort_unstable();
                bins.dedup();
                format_line(&mut line, &record.id, bins);
                out.write(&line);
            }
        });
    Ok(())
}

fn collect_part_hits(
    records: &[QueryRecord],
    part: &Index,
    thresholder: &Thresholder,
    threads: usize,
    offset: usize,
    hits: &mut [Vec<usize>],
    timers: &SearchTimers,
) {
    let chunk_size = worker_chunk_size(records.len(), threads);
    records
        .par_chunks(chunk_size)
        .zip(hits.par_chunks_mut(chunk_size))
        .for_each(|(slice, slots)| {
            let mut local = LocalTimers::default();
            let mut counting = CountingAgent::default();
            let mut membership = None;
            let mut minimizers = Vec::new();

            for (record, slot) in slice.iter().zip(slots) {
                minimizers.clear();
                LocalTimers::time(&mut local.sketch, || {
                    sketch::minimizers_into(
                        &record.seq,
                        part.shape(),
                        part.window_size() as usize,
                        &mut minimizers,
                    );
                });
                if minimizers.is_empty() {
                    continue;
                }
                let threshold = thresholder.get(minimizers.len());
                let bins = LocalTimers::time(&mut local.lookup, || {
                    query_bins(part, &minimizers, threshold, &mut counting, &mut membership)
                });
                slot.extend(bins.into_iter().map(|b| b + offset));
            }
            local.merge_into(timers);
        });
}

fn report_timers(timers: &SearchTimers) {
    let secs = |ns: &AtomicU64| ns.load(Ordering::Relaxed) as f64 / 1e9;
    eprintln!(
        "[kestrel] timings: sketch {:.3}s, filter lookup {:.3}s, output {:.3}s (cpu time across workers)",
        secs(&timers.sketch),
        secs(&timers.lookup),
        secs(&timers.format)
    );
}
