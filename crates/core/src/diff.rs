//! Filesystem diff engine
//!
//! Structural comparison of two [`FsNode`] trees plus the helpers that tie a
//! delta to what the participant just looked at in their shell.

use crate::snapshot::{join_rel, FsNode, NodeKind};
use crate::task::TaskType;
use serde::{Deserialize, Serialize};

/// Attribute that differs between current and goal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Kind,
    Size,
    Content,
    Permissions,
    Owner,
    Group,
    Modified,
    LinkTarget,
}

/// Per-path comparison result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    /// Present in the goal only
    Missing,
    /// Present in the current tree only
    Extra,
    Mismatch { attributes: Vec<Attribute> },
    Match,
}

/// UI marker for entries that appeared in the latest command output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Highlight {
    Found,
    Referenced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    /// Path relative to the compared roots
    pub path: String,
    pub kind: NodeKind,
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight: Option<Highlight>,
}

impl DeltaEntry {
    pub fn is_difference(&self) -> bool {
        self.status != EntryStatus::Match
    }
}

/// Result of comparing two trees
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub entries: Vec<DeltaEntry>,
    pub has_differences: bool,
}

impl Delta {
    pub fn entry(&self, path: &str) -> Option<&DeltaEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn differences(&self) -> impl Iterator<Item = &DeltaEntry> {
        self.entries.iter().filter(|e| e.is_difference())
    }
}

/// Optional attributes taken into account by [`diff`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffOptions {
    /// Compare owner and group ids
    #[serde(default)]
    pub compare_owner: bool,
    /// Compare modification times
    #[serde(default)]
    pub compare_modified: bool,
}

/// Compare `current` against `goal`.
///
/// Roots are matched by their children; root names may differ. Entries come
/// out depth-first, goal order first, then current-only entries. Descendants
/// of a missing or extra directory carry the same status. An attribute is only
/// compared when the goal node states it.
pub fn diff(current: &FsNode, goal: &FsNode, options: &DiffOptions) -> Delta {
    let mut entries = Vec::new();
    compare_children(current, goal, "", options, &mut entries);
    let has_differences = entries.iter().any(DeltaEntry::is_difference);
    Delta {
        entries,
        has_differences,
    }
}

fn compare_children(
    current: &FsNode,
    goal: &FsNode,
    prefix: &str,
    options: &DiffOptions,
    entries: &mut Vec<DeltaEntry>,
) {
    for goal_child in &goal.children {
        let path = join_rel(prefix, &goal_child.name);
        match current.child(&goal_child.name) {
            Some(current_child) => compare_node(current_child, goal_child, &path, options, entries),
            None => push_subtree(goal_child, &path, EntryStatus::Missing, entries),
        }
    }

    for current_child in &current.children {
        if goal.child(&current_child.name).is_none() {
            let path = join_rel(prefix, &current_child.name);
            push_subtree(current_child, &path, EntryStatus::Extra, entries);
        }
    }
}

fn compare_node(
    current: &FsNode,
    goal: &FsNode,
    path: &str,
    options: &DiffOptions,
    entries: &mut Vec<DeltaEntry>,
) {
    if current.kind != goal.kind {
        entries.push(DeltaEntry {
            path: path.to_string(),
            kind: current.kind,
            status: EntryStatus::Mismatch {
                attributes: vec![Attribute::Kind],
            },
            highlight: None,
        });
        return;
    }

    let attributes = compare_attributes(current, goal, options);
    entries.push(DeltaEntry {
        path: path.to_string(),
        kind: current.kind,
        status: if attributes.is_empty() {
            EntryStatus::Match
        } else {
            EntryStatus::Mismatch { attributes }
        },
        highlight: None,
    });

    if current.is_dir() {
        compare_children(current, goal, path, options, entries);
    }
}

fn compare_attributes(current: &FsNode, goal: &FsNode, options: &DiffOptions) -> Vec<Attribute> {
    fn differs<T: PartialEq>(goal: &Option<T>, current: &Option<T>) -> bool {
        matches!(goal, Some(g) if current.as_ref() != Some(g))
    }

    let mut attributes = Vec::new();

    if goal.kind == NodeKind::File {
        if differs(&goal.size, &current.size) {
            attributes.push(Attribute::Size);
        }
        if let Some(goal_digest) = goal.content_digest() {
            if current.content_digest().as_ref() != Some(&goal_digest) {
                attributes.push(Attribute::Content);
            }
        }
    }
    if differs(&goal.permissions, &current.permissions) {
        attributes.push(Attribute::Permissions);
    }
    if options.compare_owner {
        if differs(&goal.owner, &current.owner) {
            attributes.push(Attribute::Owner);
        }
        if differs(&goal.group, &current.group) {
            attributes.push(Attribute::Group);
        }
    }
    if options.compare_modified && differs(&goal.modified, &current.modified) {
        attributes.push(Attribute::Modified);
    }
    if goal.kind == NodeKind::Symlink && differs(&goal.link_target, &current.link_target) {
        attributes.push(Attribute::LinkTarget);
    }

    attributes
}

fn push_subtree(node: &FsNode, path: &str, status: EntryStatus, entries: &mut Vec<DeltaEntry>) {
    entries.push(DeltaEntry {
        path: path.to_string(),
        kind: node.kind,
        status: status.clone(),
        highlight: None,
    });
    for child in &node.children {
        push_subtree(child, &join_rel(path, &child.name), status.clone(), entries);
    }
}

/// Mark entries whose path appears in `observed`.
///
/// File-search tasks mark them `found`, the others `referenced`. Completion
/// (`has_differences`) is left untouched.
pub fn annotate(delta: &mut Delta, task_type: TaskType, observed: &[String]) {
    let highlight = match task_type {
        TaskType::FileSearch => Highlight::Found,
        TaskType::Stdout | TaskType::FilesystemChange => Highlight::Referenced,
    };
    for entry in &mut delta.entries {
        if observed.iter().any(|p| p == &entry.path) {
            entry.highlight = Some(highlight);
        }
    }
}

/// Home-relative paths listed in a command transcript.
///
/// The first line is the echoed command and the last line is the next prompt
/// (`user@host:<cwd>$ `); every line in between is treated as listing output.
/// A long-listing line (`ls -l`) contributes its last token, a single-token
/// line contributes itself, anything else is ignored. `.` and `./` are
/// discarded, a leading `./` is stripped, and relative paths are resolved
/// against the prompt's working directory. Paths outside `home_dir` are
/// dropped.
pub fn observed_paths(output: &str, home_dir: &str) -> Vec<String> {
    let home = home_dir.trim_end_matches('/');
    let lines: Vec<&str> = output.split('\n').collect();
    if lines.len() < 3 {
        return Vec::new();
    }

    let cwd = prompt_directory(lines[lines.len() - 1], home);
    let mut paths = Vec::new();

    for line in &lines[1..lines.len() - 1] {
        let Some(token) = listed_path(line) else {
            continue;
        };
        if token == "." || token == "./" {
            continue;
        }
        let token = token.strip_prefix("./").unwrap_or(token);
        let absolute = if token.starts_with('/') {
            token.to_string()
        } else if token == "~" || token.starts_with("~/") {
            format!("{}{}", home, &token[1..])
        } else {
            format!("{}/{}", cwd, token)
        };
        if let Some(rel) = home_relative(&absolute, home) {
            if !rel.is_empty() && !paths.contains(&rel) {
                paths.push(rel);
            }
        }
    }

    paths
}

fn listed_path(line: &str) -> Option<&str> {
    let line = line.trim_end_matches('\r').trim();
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [] => None,
        [single] => Some(single),
        [mode, ..] if is_mode_string(mode) => {
            // `name -> target` for symlinks
            match tokens.iter().position(|t| *t == "->") {
                Some(arrow) if arrow > 1 => Some(tokens[arrow - 1]),
                _ => tokens.last().copied(),
            }
        }
        _ => None,
    }
}

fn is_mode_string(token: &str) -> bool {
    let mut chars = token.chars();
    let Some(file_type) = chars.next() else {
        return false;
    };
    let rest: Vec<char> = chars.collect();
    "-dlcbps".contains(file_type)
        && (rest.len() == 9 || (rest.len() == 10 && matches!(rest[9], '.' | '+' | '@')))
        && rest[..9].iter().all(|c| "rwxsStT-".contains(*c))
}

/// Absolute working directory shown in a `user@host:<dir>$ ` prompt
fn prompt_directory(prompt: &str, home: &str) -> String {
    let body = prompt.trim_end_matches('\r').trim_end();
    let body = body
        .strip_suffix('$')
        .or_else(|| body.strip_suffix('#'))
        .unwrap_or(body);
    let Some((_, dir)) = body.split_once(':') else {
        return home.to_string();
    };
    let dir = dir.trim();

    if dir.is_empty() || dir == "~" {
        home.to_string()
    } else if let Some(rest) = dir.strip_prefix("~/") {
        format!("{}/{}", home, rest)
    } else if dir.starts_with('/') {
        dir.to_string()
    } else {
        format!("{}/{}", home, dir)
    }
}

/// Normalise `.`/`..` and strip the home prefix; `None` outside home
fn home_relative(absolute: &str, home: &str) -> Option<String> {
    let mut stack: Vec<&str> = Vec::new();
    for part in absolute.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    let normalized = format!("/{}", stack.join("/"));

    if normalized == home {
        Some(String::new())
    } else {
        normalized
            .strip_prefix(home)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(|rest| rest.trim_end_matches('/').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goal() -> FsNode {
        FsNode::directory(
            "home",
            vec![
                FsNode::directory(
                    "website",
                    vec![FsNode::file("index.html", "<html/>").with_permissions(0o644)],
                ),
                FsNode::file("notes.txt", "todo"),
            ],
        )
    }

    #[test]
    fn test_identical_trees_match() {
        let delta = diff(&goal(), &goal(), &DiffOptions::default());
        assert!(!delta.has_differences);
        assert_eq!(delta.entries.len(), 3);
        assert!(delta.entries.iter().all(|e| e.status == EntryStatus::Match));
    }

    #[test]
    fn test_missing_and_extra_subtrees() {
        let current = FsNode::directory(
            "other-root-name",
            vec![
                FsNode::file("notes.txt", "todo"),
                FsNode::directory("tmp", vec![FsNode::file("scratch", "")]),
            ],
        );
        let delta = diff(&current, &goal(), &DiffOptions::default());
        assert!(delta.has_differences);

        assert_eq!(delta.entry("website").unwrap().status, EntryStatus::Missing);
        assert_eq!(
            delta.entry("website/index.html").unwrap().status,
            EntryStatus::Missing
        );
        assert_eq!(delta.entry("tmp").unwrap().status, EntryStatus::Extra);
        assert_eq!(delta.entry("tmp/scratch").unwrap().status, EntryStatus::Extra);
        assert_eq!(delta.entry("notes.txt").unwrap().status, EntryStatus::Match);
    }

    #[test]
    fn test_attribute_mismatch() {
        let current = FsNode::directory(
            "home",
            vec![
                FsNode::directory(
                    "website",
                    vec![FsNode::file("index.html", "<html></html>").with_permissions(0o600)],
                ),
                FsNode::file("notes.txt", "todo"),
            ],
        );
        let delta = diff(&current, &goal(), &DiffOptions::default());
        assert_eq!(
            delta.entry("website/index.html").unwrap().status,
            EntryStatus::Mismatch {
                attributes: vec![Attribute::Size, Attribute::Content, Attribute::Permissions]
            }
        );
    }

    #[test]
    fn test_kind_mismatch_stops_descent() {
        let current = FsNode::directory(
            "home",
            vec![FsNode::file("website", ""), FsNode::file("notes.txt", "todo")],
        );
        let delta = diff(&current, &goal(), &DiffOptions::default());
        assert_eq!(
            delta.entry("website").unwrap().status,
            EntryStatus::Mismatch {
                attributes: vec![Attribute::Kind]
            }
        );
        assert!(delta.entry("website/index.html").is_none());
    }

    #[test]
    fn test_unstated_goal_attributes_are_ignored() {
        let mut loose = FsNode::bare_file_for_test("notes.txt");
        loose.permissions = Some(0o644);
        let goal = FsNode::directory("home", vec![loose]);
        let current = FsNode::directory(
            "home",
            vec![FsNode::file("notes.txt", "anything")
                .with_permissions(0o644)
                .with_modified(1)],
        );
        assert!(!diff(&current, &goal, &DiffOptions::default()).has_differences);
    }

    #[test]
    fn test_owner_and_modified_only_when_enabled() {
        let mut goal_file = FsNode::file("a", "x").with_modified(100);
        goal_file.owner = Some(1000);
        let mut current_file = FsNode::file("a", "x").with_modified(200);
        current_file.owner = Some(0);
        let goal = FsNode::directory("g", vec![goal_file]);
        let current = FsNode::directory("c", vec![current_file]);

        assert!(!diff(&current, &goal, &DiffOptions::default()).has_differences);

        let strict = DiffOptions {
            compare_owner: true,
            compare_modified: true,
        };
        assert_eq!(
            diff(&current, &goal, &strict).entry("a").unwrap().status,
            EntryStatus::Mismatch {
                attributes: vec![Attribute::Owner, Attribute::Modified]
            }
        );
    }

    #[test]
    fn test_annotate_marks_without_changing_completion() {
        let mut delta = diff(&goal(), &goal(), &DiffOptions::default());
        annotate(
            &mut delta,
            TaskType::FileSearch,
            &["website/index.html".to_string(), "nowhere".to_string()],
        );
        assert_eq!(
            delta.entry("website/index.html").unwrap().highlight,
            Some(Highlight::Found)
        );
        assert_eq!(delta.entry("notes.txt").unwrap().highlight, None);
        assert!(!delta.has_differences);

        annotate(&mut delta, TaskType::FilesystemChange, &["notes.txt".to_string()]);
        assert_eq!(
            delta.entry("notes.txt").unwrap().highlight,
            Some(Highlight::Referenced)
        );
    }

    #[test]
    fn test_observed_paths_from_find() {
        let output = "find . -name '*.html'\n.\n./website/index.html\n./website/about.html\nme@box:~$ ";
        assert_eq!(
            observed_paths(output, "/home/me"),
            vec!["website/index.html", "website/about.html"]
        );
    }

    #[test]
    fn test_observed_paths_from_long_listing_in_subdir() {
        let output = "ls -l\ntotal 8\n-rw-r--r-- 1 me me 12 Jan  1 10:00 index.html\nlrwxrwxrwx 1 me me 10 Jan  1 10:00 latest -> index.html\ndrwxr-xr-x 2 me me 4096 Jan  1 10:00 css\nme@box:~/website$ ";
        assert_eq!(
            observed_paths(output, "/home/me/"),
            vec!["website/index.html", "website/latest", "website/css"]
        );
    }

    #[test]
    fn test_observed_paths_edge_cases() {
        assert!(observed_paths("ls\nme@box:~$ ", "/home/me").is_empty());
        assert!(observed_paths("", "/home/me").is_empty());

        let output = "ls ..\n../../etc\n/home/me/notes.txt\n~/website\nme@box:/home/me/website$ ";
        assert_eq!(
            observed_paths(output, "/home/me"),
            vec!["notes.txt", "website"]
        );
    }

    impl FsNode {
        fn bare_file_for_test(name: &str) -> FsNode {
            let mut node = FsNode::file(name, "");
            node.size = None;
            node.hash = None;
            node.content = None;
            node
        }
    }
}
