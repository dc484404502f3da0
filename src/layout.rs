//! Layout files describe how user bins are packed into the IBF tree. They
//! are produced by the external layout optimizer and consumed verbatim.
//!
//! ```text
//! #HIGH_LEVEL_IBF max_bin_id:6
//! #MERGED_BIN_6 max_bin_id:0
//! #MERGED_BIN_6;2 max_bin_id:3
//! #FILES	BIN_INDICES	NUMBER_OF_BINS
//! a.fa	0	2
//! b.fa;b2.fa	6;2;0	1;1;3
//! ```
//!
//! `MERGED_BIN` paths are bin indices from the root; `BIN_INDICES` is the
//! full path of a user bin, `NUMBER_OF_BINS` the per-level split widths.
//! User bin ids are assigned in record order. Lines starting with `##` are
//! configuration remarks and ignored.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

const ROOT_TAG: &str = "#HIGH_LEVEL_IBF";
const MERGED_TAG: &str = "#MERGED_BIN_";
const COLUMNS_TAG: &str = "#FILES";

/// Max-bin annotation for one IBF of the tree; an empty path is the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaxBin {
    pub path: Vec<usize>,
    pub max_bin: usize,
}

/// One user bin: its input files and its root-to-leaf placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserBinRecord {
    pub user_bin: usize,
    pub files: Vec<PathBuf>,
    pub bin_indices: Vec<usize>,
    pub number_of_bins: Vec<usize>,
}

impl UserBinRecord {
    /// Bin index within the IBF the record finally lands in.
    pub fn final_bin_index(&self) -> usize {
        *self.bin_indices.last().expect("record has a placement")
    }

    /// Number of adjacent technical bins the record is split across.
    pub fn final_bin_count(&self) -> usize {
        *self.number_of_bins.last().expect("record has a placement")
    }
}

#[derive(Clone, Debug, Default)]
pub struct Layout {
    pub max_bins: Vec<MaxBin>,
    pub user_bins: Vec<UserBinRecord>,
}

/// A layout file starts with a `#` header; a plain bin list does not.
pub fn is_layout_file(path: &Path) -> Result<bool> {
    let mut first = [0u8; 1];
    let n = File::open(path)
        .and_then(|mut f| f.read(&mut first))
        .map_err(|e| Error::io(path, e))?;
    Ok(n == 1 && first[0] == b'#')
}

pub fn parse_layout(path: &Path) -> Result<Layout> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut layout = Layout::default();
    let mut saw_root = false;
    let mut in_records = false;

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| Error::io(path, e))?;
        let line = line.trim_end();
        if line.is_empty() || line.starts_with("##") {
            continue;
        }
        let fail = |msg: String| Error::Layout(format!("{}:{}: {msg}", path.display(), lineno + 1));

        if let Some(rest) = line.strip_prefix(ROOT_TAG) {
            layout.max_bins.push(MaxBin {
                path: Vec::new(),
                max_bin: parse_max_bin(rest).ok_or_else(|| fail("bad max_bin_id".into()))?,
            });
            saw_root = true;
        } else if let Some(rest) = line.strip_prefix(MERGED_TAG) {
            let (path_part, tail) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| fail("missing max_bin_id".into()))?;
            layout.max_bins.push(MaxBin {
                path: parse_usize_list(path_part)
                    .ok_or_else(|| fail(format!("bad merged-bin path {path_part:?}")))?,
                max_bin: parse_max_bin(tail).ok_or_else(|| fail("bad max_bin_id".into()))?,
            });
        } else if line.starts_with(COLUMNS_TAG) {
            in_records = true;
        } else if line.starts_with('#') {
            return Err(fail(format!("unknown header line {line:?}")));
        } else {
            if !in_records {
                return Err(fail("record before column header".into()));
            }
            let mut columns = line.split('\t');
            let (Some(files), Some(bins), Some(counts)) =
                (columns.next(), columns.next(), columns.next())
            else {
                return Err(fail("expected three tab-separated columns".into()));
            };
            let record = UserBinRecord {
                user_bin: layout.user_bins.len(),
                files: files.split(';').map(PathBuf::from).collect(),
                bin_indices: parse_usize_list(bins)
                    .ok_or_else(|| fail(format!("bad bin indices {bins:?}")))?,
                number_of_bins: parse_usize_list(counts)
                    .ok_or_else(|| fail(format!("bad bin counts {counts:?}")))?,
            };
            if record.bin_indices.is_empty()
                || record.bin_indices.len() != record.number_of_bins.len()
            {
                return Err(fail("bin indices and counts must align".into()));
            }
            if record.number_of_bins.iter().any(|&n| n == 0) {
                return Err(fail("zero-width split".into()));
            }
            layout.user_bins.push(record);
        }
    }

    if !saw_root {
        return Err(Error::Layout(format!(
            "{}: missing {ROOT_TAG} header",
            path.display()
        )));
    }
    if layout.user_bins.is_empty() {
        return Err(Error::Layout(format!("{}: no user bins", path.display())));
    }
    Ok(layout)
}

fn parse_max_bin(s: &str) -> Option<usize> {
    s.trim().strip_prefix("max_bin_id:")?.trim().parse().ok()
}

fn parse_usize_list(s: &str) -> Option<Vec<usize>> {
    s.split(';').map(|p| p.trim().parse().ok()).collect()
}
