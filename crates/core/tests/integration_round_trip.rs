//! Round-trip tests: serialize a tree, materialize it elsewhere, diff the two

use shellstudy_core::diff::{diff, DiffOptions};
use shellstudy_core::snapshot::{
    materialize, serialize, FsNode, SnapshotOptions, DEFAULT_INLINE_LIMIT,
};
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use tempfile::TempDir;

fn build_tree(root: &std::path::Path) {
    fs::create_dir_all(root.join("website/css")).unwrap();
    fs::create_dir_all(root.join("empty")).unwrap();
    fs::write(root.join("website/index.html"), "<html/>").unwrap();
    fs::write(root.join("website/css/site.css"), "body { margin: 0 }").unwrap();
    fs::write(root.join("logo.bin"), [0u8, 159, 146, 150, 255]).unwrap();
    fs::write(root.join("run.sh"), "#!/bin/sh\necho hi\n").unwrap();
    fs::set_permissions(root.join("run.sh"), fs::Permissions::from_mode(0o755)).unwrap();
    fs::set_permissions(root.join("empty"), fs::Permissions::from_mode(0o700)).unwrap();
    symlink("website/index.html", root.join("home.html")).unwrap();
}

#[test]
fn test_materialized_copy_has_no_differences() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("source");
    build_tree(&source);

    let options = SnapshotOptions::default();
    let tree = serialize(&source, &options).unwrap();

    let target = tmp.path().join("target");
    let report = materialize(&tree, &target);
    assert!(report.is_success(), "{:?}", report.failures);

    let copy = serialize(&target, &options).unwrap();
    let compare_all = DiffOptions {
        compare_owner: true,
        compare_modified: true,
    };
    let delta = diff(&copy, &tree, &compare_all);
    assert!(
        !delta.has_differences,
        "{:?}",
        delta.differences().collect::<Vec<_>>()
    );

    assert_eq!(
        fs::read_link(target.join("home.html")).unwrap(),
        std::path::PathBuf::from("website/index.html")
    );
    assert_eq!(fs::read(target.join("logo.bin")).unwrap(), vec![0u8, 159, 146, 150, 255]);
}

#[test]
fn test_files_above_inline_limit_round_trip() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("source");
    fs::create_dir_all(&source).unwrap();
    let big: Vec<u8> = (0..2 * DEFAULT_INLINE_LIMIT).map(|i| (i % 251) as u8).collect();
    fs::write(source.join("big.log"), &big).unwrap();

    let tree = serialize(&source, &SnapshotOptions::default()).unwrap();
    let target = tmp.path().join("target");
    let report = materialize(&tree, &target);
    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(fs::read(target.join("big.log")).unwrap(), big);

    let copy = serialize(&target, &SnapshotOptions::diff_only()).unwrap();
    assert!(!diff(&copy, &tree, &DiffOptions::default()).has_differences);
}

#[test]
fn test_json_round_trip_preserves_tree() {
    let tmp = TempDir::new().unwrap();
    build_tree(tmp.path());

    let tree = serialize(tmp.path(), &SnapshotOptions::default()).unwrap();
    let json = tree.to_json_string().unwrap();
    assert!(json.contains("\"0755\""));
    assert_eq!(FsNode::from_json_str(&json).unwrap(), tree);
}

#[test]
fn test_large_files_compare_by_hash() {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("source");
    fs::create_dir_all(&source).unwrap();
    fs::write(source.join("big.txt"), "x".repeat(64)).unwrap();

    let tree = serialize(&source, &SnapshotOptions { inline_limit: Some(16) }).unwrap();
    let big = tree.child("big.txt").unwrap();
    assert!(big.content.is_none());
    assert!(big.hash.is_some());

    let other = tmp.path().join("other");
    fs::create_dir_all(&other).unwrap();
    fs::write(other.join("big.txt"), "y".repeat(64)).unwrap();
    let changed = serialize(&other, &SnapshotOptions { inline_limit: Some(16) }).unwrap();

    let delta = diff(&changed, &tree, &DiffOptions::default());
    assert!(delta.has_differences);
}
