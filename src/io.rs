//! On-disk index archive. All integers are little-endian; payload words are
//! dumped as raw casts.
//!
//! Layout, in order: `u32` version, `u64` window size, shape (`u8` span +
//! `u64` mask), `u8` parts, `u8` compressed flag (must be 0), bin paths,
//! `f64` fpr, `u8` hierarchical flag, then the filter body.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::hibf::HierarchicalIbf;
use crate::ibf::InterleavedBloomFilter;
use crate::index::{Index, IndexData};
use crate::shape::Shape;

impl Index {
    /// Serialize to `path`. Deterministic; `read_from` restores an equal
    /// index.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut w = BufWriter::new(file);
        self.write(&mut w).map_err(|e| Error::io(path, e))?;
        w.flush().map_err(|e| Error::io(path, e))
    }

    /// Deserialize an archive written by [`Index::write_to`].
    pub fn read_from(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut r = BufReader::new(file);
        Index::read(&mut r).map_err(|e| match e {
            ReadError::Io(source) => Error::io(path, source),
            ReadError::Format(msg) => Error::Format(format!("{}: {msg}", path.display())),
        })
    }

    fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<LE>(Index::VERSION)?;
        w.write_u64::<LE>(self.window_size())?;
        w.write_u8(self.shape().span() as u8)?;
        w.write_u64::<LE>(self.shape().mask())?;
        w.write_u8(self.parts())?;
        w.write_u8(0)?; // compressed flag, reserved
        write_bin_paths(w, self.bin_path())?;
        w.write_f64::<LE>(self.fpr())?;
        w.write_u8(self.is_hibf() as u8)?;
        match self.data() {
            IndexData::Ibf(ibf) => write_ibf(w, ibf),
            IndexData::Hibf(hibf) => write_hibf(w, hibf),
        }
    }

    fn read<R: Read>(r: &mut R) -> std::result::Result<Self, ReadError> {
        let version = r.read_u32::<LE>()?;
        if version != Index::VERSION {
            return Err(ReadError::Format(format!(
                "unsupported index version {version} (expected {})",
                Index::VERSION
            )));
        }
        let window_size = r.read_u64::<LE>()?;
        let span = r.read_u8()?;
        let mask = r.read_u64::<LE>()?;
        let shape = Shape::new(mask, span)
            .map_err(|e| ReadError::Format(format!("bad shape: {e}")))?;
        if window_size < shape.span() as u64 {
            return Err(ReadError::Format(format!(
                "window ({window_size}) smaller than shape span ({})",
                shape.span()
            )));
        }
        let parts = r.read_u8()?;
        if r.read_u8()? != 0 {
            return Err(ReadError::Format("compressed indices are not supported".into()));
        }
        let bin_path = read_bin_paths(r)?;
        let fpr = r.read_f64::<LE>()?;
        let data = if r.read_u8()? != 0 {
            IndexData::Hibf(read_hibf(r)?)
        } else {
            IndexData::Ibf(read_ibf(r)?)
        };
        Ok(Index::new(window_size, shape, parts, bin_path, fpr, data))
    }
}

enum ReadError {
    Io(std::io::Error),
    Format(String),
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        ReadError::Io(e)
    }
}

// Deserialized sizes are validated before allocation to keep corrupt
// archives from requesting absurd buffers.
const MAX_LEN: u64 = 1 << 40;

fn checked_len(len: u64, what: &str) -> std::result::Result<usize, ReadError> {
    if len > MAX_LEN {
        return Err(ReadError::Format(format!("corrupt {what} length {len}")));
    }
    Ok(len as usize)
}

fn write_bin_paths<W: Write>(w: &mut W, paths: &[Vec<String>]) -> std::io::Result<()> {
    w.write_u64::<LE>(paths.len() as u64)?;
    for bin in paths {
        w.write_u64::<LE>(bin.len() as u64)?;
        for path in bin {
            w.write_u64::<LE>(path.len() as u64)?;
            w.write_all(path.as_bytes())?;
        }
    }
    Ok(())
}

fn read_bin_paths<R: Read>(r: &mut R) -> std::result::Result<Vec<Vec<String>>, ReadError> {
    let outer = checked_len(r.read_u64::<LE>()?, "bin path table")?;
    let mut paths = Vec::with_capacity(outer.min(1024));
    for _ in 0..outer {
        let inner = checked_len(r.read_u64::<LE>()?, "bin path entry")?;
        let mut bin = Vec::with_capacity(inner.min(1024));
        for _ in 0..inner {
            let len = checked_len(r.read_u64::<LE>()?, "path string")?;
            let mut bytes = vec![0u8; len];
            r.read_exact(&mut bytes)?;
            bin.push(
                String::from_utf8(bytes)
                    .map_err(|_| ReadError::Format("non-UTF-8 bin path".into()))?,
            );
        }
        paths.push(bin);
    }
    Ok(paths)
}

fn write_ibf<W: Write>(w: &mut W, ibf: &InterleavedBloomFilter) -> std::io::Result<()> {
    w.write_u64::<LE>(ibf.bin_count() as u64)?;
    w.write_u64::<LE>(ibf.bin_size() as u64)?;
    w.write_u64::<LE>(ibf.hash_count() as u64)?;
    w.write_u64::<LE>(ibf.words().len() as u64)?;
    w.write_all(bytemuck::cast_slice::<u64, u8>(ibf.words()))
}

fn read_ibf<R: Read>(r: &mut R) -> std::result::Result<InterleavedBloomFilter, ReadError> {
    let bin_count = checked_len(r.read_u64::<LE>()?, "bin count")?;
    let bin_size = checked_len(r.read_u64::<LE>()?, "bin size")?;
    let hash_count = checked_len(r.read_u64::<LE>()?, "hash count")?;
    let words = checked_len(r.read_u64::<LE>()?, "bit matrix")?;
    let mut data = vec![0u64; words];
    r.read_exact(bytemuck::cast_slice_mut::<u64, u8>(&mut data))?;
    InterleavedBloomFilter::from_parts(bin_count, bin_size, hash_count, data)
        .ok_or_else(|| ReadError::Format("bit matrix does not match its geometry".into()))
}

fn write_hibf<W: Write>(w: &mut W, hibf: &HierarchicalIbf) -> std::io::Result<()> {
    w.write_u64::<LE>(hibf.ibfs.len() as u64)?;
    for ibf in &hibf.ibfs {
        write_ibf(w, ibf)?;
    }
    write_nested(w, &hibf.next_ibf_id, |w, &v| w.write_u64::<LE>(v as u64))?;
    write_nested(w, &hibf.user_bin_index, |w, &v| w.write_i64::<LE>(v))
}

fn read_hibf<R: Read>(r: &mut R) -> std::result::Result<HierarchicalIbf, ReadError> {
    let count = checked_len(r.read_u64::<LE>()?, "IBF vector")?;
    let mut ibfs = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        ibfs.push(read_ibf(r)?);
    }
    let next_ibf_id: Vec<Vec<usize>> =
        read_nested(r, |r| Ok(r.read_u64::<LE>()? as usize))?;
    let user_bin_index: Vec<Vec<i64>> = read_nested(r, |r| Ok(r.read_i64::<LE>()?))?;
    if next_ibf_id.len() != ibfs.len() || user_bin_index.len() != ibfs.len() {
        return Err(ReadError::Format("index arrays do not match IBF vector".into()));
    }
    for (l, ids) in next_ibf_id.iter().enumerate() {
        if ids.len() != ibfs[l].bin_count() || ids.iter().any(|&id| id >= ibfs.len()) {
            return Err(ReadError::Format("dangling child IBF reference".into()));
        }
    }
    Ok(HierarchicalIbf {
        ibfs,
        next_ibf_id,
        user_bin_index,
    })
}

fn write_nested<W: Write, T>(
    w: &mut W,
    rows: &[Vec<T>],
    mut write_one: impl FnMut(&mut W, &T) -> std::io::Result<()>,
) -> std::io::Result<()> {
    w.write_u64::<LE>(rows.len() as u64)?;
    for row in rows {
        w.write_u64::<LE>(row.len() as u64)?;
        for v in row {
            write_one(w, v)?;
        }
    }
    Ok(())
}

fn read_nested<R: Read, T>(
    r: &mut R,
    mut read_one: impl FnMut(&mut R) -> std::result::Result<T, ReadError>,
) -> std::result::Result<Vec<Vec<T>>, ReadError> {
    let outer = checked_len(r.read_u64::<LE>()?, "index array")?;
    let mut rows = Vec::with_capacity(outer.min(1024));
    for _ in 0..outer {
        let inner = checked_len(r.read_u64::<LE>()?, "index row")?;
        let mut row = Vec::with_capacity(inner.min(1 << 20));
        for _ in 0..inner {
            row.push(read_one(r)?);
        }
        rows.push(row);
    }
    Ok(rows)
}
