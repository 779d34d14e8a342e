//! Diff command
//!
//! Either side may be a live directory or a JSON tree produced by
//! `shellstudy snapshot`.

use super::print_json;
use super::snapshot::read_tree_file;
use anyhow::{Context, Result};
use shellstudy_core::diff::{annotate, diff, observed_paths, DiffOptions};
use shellstudy_core::snapshot::{self, FsNode, SnapshotOptions};
use shellstudy_core::task::TaskType;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct DiffArgs {
    pub current: PathBuf,
    pub goal: PathBuf,
    pub task_type: Option<TaskType>,
    /// Command transcript to highlight paths from
    pub output_file: Option<PathBuf>,
    pub home: String,
    pub compare_owner: bool,
    pub compare_modified: bool,
}

#[instrument(skip(args))]
pub async fn execute_diff(args: DiffArgs) -> Result<()> {
    let current = load_tree(&args.current).await?;
    let goal = load_tree(&args.goal).await?;

    let options = DiffOptions {
        compare_owner: args.compare_owner,
        compare_modified: args.compare_modified,
    };
    let mut delta = diff(&current, &goal, &options);

    if let Some(task_type) = args.task_type {
        let observed = match &args.output_file {
            Some(path) => {
                let output = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read transcript {}", path.display()))?;
                observed_paths(&output, &args.home)
            }
            None => Vec::new(),
        };
        debug!("Transcript refers to {} paths", observed.len());
        annotate(&mut delta, task_type, &observed);
    }

    print_json(&delta)
}

async fn load_tree(path: &Path) -> Result<FsNode> {
    if path.is_dir() {
        let root = path.to_path_buf();
        let tree = tokio::task::spawn_blocking(move || {
            snapshot::serialize(&root, &SnapshotOptions::diff_only())
        })
        .await??;
        Ok(tree)
    } else {
        read_tree_file(path)
    }
}
