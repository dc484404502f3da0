use kestrel::hibf::NO_USER_BIN;
use kestrel::{HierarchicalIbf, Index, IndexData, InterleavedBloomFilter, Shape};

fn flat_index() -> Index {
    let mut ibf = InterleavedBloomFilter::new(5, 1024, 3);
    for v in 0..200u64 {
        ibf.emplace(v.wrapping_mul(0x9E3779B97F4A7C15), (v % 5) as usize);
    }
    Index::new(
        24,
        Shape::ungapped(20).unwrap(),
        1,
        (0..5).map(|i| vec![format!("bin{i}.fa")]).collect(),
        0.05,
        IndexData::Ibf(ibf),
    )
}

fn hierarchical_index() -> Index {
    let mut child = InterleavedBloomFilter::new(2, 512, 2);
    let mut root = InterleavedBloomFilter::new(3, 512, 2);
    for v in 0..64u64 {
        let h = v.wrapping_mul(0x2545F4914F6CDD1D);
        child.emplace(h, (v % 2) as usize);
        root.emplace(h, 0);
        root.emplace(h.rotate_left(17), 2);
    }
    let hibf = HierarchicalIbf {
        ibfs: vec![root, child],
        next_ibf_id: vec![vec![1, 0, 0], vec![1, 1]],
        user_bin_index: vec![vec![NO_USER_BIN, 2, 3], vec![0, 1]],
    };
    Index::new(
        24,
        Shape::ungapped(20).unwrap(),
        1,
        (0..4).map(|i| vec![format!("bin{i}.fa")]).collect(),
        0.05,
        IndexData::Hibf(hibf),
    )
}

#[test]
fn flat_round_trip_is_bit_exact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flat.index");
    let index = flat_index();
    index.write_to(&path).unwrap();
    assert_eq!(Index::read_from(&path).unwrap(), index);
}

#[test]
fn hierarchical_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.index");
    let index = hierarchical_index();
    index.write_to(&path).unwrap();
    let restored = Index::read_from(&path).unwrap();
    assert_eq!(restored, index);
    assert!(restored.is_hibf());
    assert_eq!(restored.user_bin_count(), 4);
}

#[test]
fn wrong_version_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("old.index");
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 64]);
    std::fs::write(&path, bytes).unwrap();

    let err = Index::read_from(&path).unwrap_err();
    assert!(err.to_string().contains("version"), "{err}");
}

#[test]
fn compressed_flag_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("compressed.index");
    flat_index().write_to(&path).unwrap();

    // Version, window, shape span + mask, parts precede the flag.
    let flag_offset = 4 + 8 + 1 + 8 + 1;
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[flag_offset] = 1;
    std::fs::write(&path, bytes).unwrap();

    let err = Index::read_from(&path).unwrap_err();
    assert!(err.to_string().contains("compressed"), "{err}");
}

#[test]
fn truncated_archive_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.index");
    flat_index().write_to(&path).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    assert!(Index::read_from(&path).is_err());
}

#[test]
fn missing_file_names_the_path() {
    let err = Index::read_from(std::path::Path::new("/nonexistent/kestrel.index")).unwrap_err();
    assert!(err.to_string().contains("kestrel.index"), "{err}");
}
