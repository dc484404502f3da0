use kestrel::layout::{is_layout_file, parse_layout};
use std::fs;
use std::path::PathBuf;

fn write(name: &str, text: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    fs::write(&path, text).unwrap();
    (dir, path)
}

const SAMPLE: &str = "\
##version:1.0\n\
#HIGH_LEVEL_IBF max_bin_id:6\n\
#MERGED_BIN_6 max_bin_id:0\n\
#MERGED_BIN_6;2 max_bin_id:3\n\
#FILES\tBIN_INDICES\tNUMBER_OF_BINS\n\
a.fa\t0\t2\n\
b.fa;b2.fa\t6;2;3\t1;1;4\n\
c.fa\t6;0\t1;1\n";

#[test]
fn parses_headers_and_records() {
    let (_dir, path) = write("layout.txt", SAMPLE);
    assert!(is_layout_file(&path).unwrap());

    let layout = parse_layout(&path).unwrap();
    assert_eq!(layout.max_bins.len(), 3);
    assert_eq!(layout.max_bins[0].path, Vec::<usize>::new());
    assert_eq!(layout.max_bins[0].max_bin, 6);
    assert_eq!(layout.max_bins[2].path, vec![6, 2]);
    assert_eq!(layout.max_bins[2].max_bin, 3);

    assert_eq!(layout.user_bins.len(), 3);
    let split = &layout.user_bins[0];
    assert_eq!(split.user_bin, 0);
    assert_eq!(split.final_bin_index(), 0);
    assert_eq!(split.final_bin_count(), 2);

    let nested = &layout.user_bins[1];
    assert_eq!(nested.files.len(), 2);
    assert_eq!(nested.bin_indices, vec![6, 2, 3]);
    assert_eq!(nested.number_of_bins, vec![1, 1, 4]);
}

#[test]
fn plain_bin_lists_are_not_layouts() {
    let (_dir, path) = write("bins.txt", "a.fa\nb.fa\n");
    assert!(!is_layout_file(&path).unwrap());
}

#[test]
fn missing_root_header_is_rejected() {
    let (_dir, path) = write(
        "layout.txt",
        "#MERGED_BIN_0 max_bin_id:0\n#FILES\tBIN_INDICES\tNUMBER_OF_BINS\na.fa\t0;0\t1;1\n",
    );
    let err = parse_layout(&path).unwrap_err();
    assert!(err.to_string().contains("HIGH_LEVEL_IBF"), "{err}");
}

#[test]
fn misaligned_columns_are_rejected() {
    let (_dir, path) = write(
        "layout.txt",
        "#HIGH_LEVEL_IBF max_bin_id:0\n#FILES\tBIN_INDICES\tNUMBER_OF_BINS\na.fa\t0;1\t1\n",
    );
    assert!(parse_layout(&path).is_err());
}

#[test]
fn records_require_the_column_header() {
    let (_dir, path) = write("layout.txt", "#HIGH_LEVEL_IBF max_bin_id:0\na.fa\t0\t1\n");
    assert!(parse_layout(&path).is_err());
}

#[test]
fn zero_width_split_is_rejected() {
    let (_dir, path) = write(
        "layout.txt",
        "#HIGH_LEVEL_IBF max_bin_id:0\n#FILES\tBIN_INDICES\tNUMBER_OF_BINS\na.fa\t0\t0\n",
    );
    assert!(parse_layout(&path).is_err());
}

#[test]
fn undefined_merged_bin_fails_the_build() {
    // The record descends into bin 1, but only merged bin 0 is declared.
    let (dir, path) = write(
        "layout.txt",
        "#HIGH_LEVEL_IBF max_bin_id:0\n\
         #MERGED_BIN_0 max_bin_id:0\n\
         #FILES\tBIN_INDICES\tNUMBER_OF_BINS\n\
         a.fa\t0;0\t1;1\n\
         b.fa\t1;0\t1;1\n",
    );
    let layout = parse_layout(&path).unwrap();
    let cfg = kestrel::build::BuildConfig {
        input: path,
        output: dir.path().join("out.index"),
        shape: kestrel::Shape::ungapped(19).unwrap(),
        window_size: 19,
        fpr: 0.05,
        hash_count: None,
        threads: 1,
        parts: 1,
    };
    let err = kestrel::build::build_hibf(&layout, &cfg).unwrap_err();
    assert!(err.to_string().contains("merged bin"), "{err}");
}
