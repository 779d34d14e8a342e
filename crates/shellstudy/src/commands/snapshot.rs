//! Snapshot and materialize commands

use super::{print_json, ExitCode};
use anyhow::{Context, Result};
use shellstudy_core::snapshot::{self, FsNode, SnapshotOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Serialize `dir` and print the tree
#[instrument]
pub async fn execute_snapshot(dir: &Path, inline_limit: Option<u64>) -> Result<()> {
    let root = dir.to_path_buf();
    let options = SnapshotOptions { inline_limit };
    let tree = tokio::task::spawn_blocking(move || snapshot::serialize(&root, &options)).await??;
    debug!("Serialized {} entries", tree.paths().len());
    print_json(&tree)
}

/// Recreate the tree stored in `tree_file` under `dir`; exits 1 when any entry failed
#[instrument]
pub async fn execute_materialize(tree_file: &Path, dir: &Path) -> Result<()> {
    let tree = read_tree_file(tree_file)?;
    let root: PathBuf = dir.to_path_buf();
    let report = tokio::task::spawn_blocking(move || snapshot::materialize(&tree, &root)).await?;
    print_json(&report)?;

    if !report.is_success() {
        warn!("{} entries could not be materialized", report.failures.len());
        return Err(ExitCode(1).into());
    }
    Ok(())
}

pub(crate) fn read_tree_file(path: &Path) -> Result<FsNode> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tree file {}", path.display()))?;
    FsNode::from_json_str(&json).with_context(|| format!("Invalid tree file {}", path.display()))
}
