//! Filesystem snapshot codec
//!
//! Converts between an on-disk directory tree and [`FsNode`], a serializable
//! tree used both to seed a sandbox's home directory and as the input of the
//! diff engine.
//!
//! ## JSON shape
//!
//! ```json
//! {
//!   "name": "home",
//!   "kind": "directory",
//!   "permissions": "0755",
//!   "children": [
//!     { "name": "notes.txt", "kind": "file", "size": 6, "content": { "text": "hello\n" } }
//!   ]
//! }
//! ```
//!
//! Every attribute except `name` and `kind` is optional so that hand-written
//! goal trees only state what they care about.

use crate::errors::{Result, SnapshotError};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

/// Inline limit used by [`SnapshotOptions::diff_only`] (1 MiB)
pub const DEFAULT_INLINE_LIMIT: u64 = 1024 * 1024;

/// Type of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Symlink => "symlink",
        }
    }
}

/// Inline file content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileContent {
    /// UTF-8 text stored verbatim
    Text(String),
    /// Arbitrary bytes, base64 encoded
    Base64(String),
}

impl FileContent {
    fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self::Text(text),
            Err(err) => Self::Base64(
                base64::engine::general_purpose::STANDARD.encode(err.into_bytes()),
            ),
        }
    }

    /// Decode the content into raw bytes
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, base64::DecodeError> {
        match self {
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Base64(encoded) => base64::engine::general_purpose::STANDARD.decode(encoded),
        }
    }
}

/// One node of a serialized directory tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsNode {
    /// Entry name (last path component)
    pub name: String,
    /// Entry type
    pub kind: NodeKind,
    /// Size in bytes (files only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Numeric owner id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<u32>,
    /// Numeric group id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<u32>,
    /// Permission bits (`mode & 0o7777`), written as an octal string
    #[serde(default, skip_serializing_if = "Option::is_none", with = "octal_mode")]
    pub permissions: Option<u32>,
    /// Modification time in seconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<i64>,
    /// Inline content (files only, absent above the inline limit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<FileContent>,
    /// Lowercase hex SHA-256 of the file content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Symlink target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// Directory entries, ordered by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FsNode>,
}

impl FsNode {
    fn bare(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: None,
            owner: None,
            group: None,
            permissions: None,
            modified: None,
            content: None,
            hash: None,
            link_target: None,
            children: Vec::new(),
        }
    }

    /// Directory node with the given children
    pub fn directory(name: impl Into<String>, children: Vec<FsNode>) -> Self {
        let mut node = Self::bare(name, NodeKind::Directory);
        node.children = children;
        node
    }

    /// Text file node; size and hash are derived from the content
    pub fn file(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let mut node = Self::bare(name, NodeKind::File);
        node.size = Some(text.len() as u64);
        node.hash = Some(sha256_hex(text.as_bytes()));
        node.content = Some(FileContent::Text(text));
        node
    }

    /// Symlink node
    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut node = Self::bare(name, NodeKind::Symlink);
        node.link_target = Some(target.into());
        node
    }

    pub fn with_permissions(mut self, mode: u32) -> Self {
        self.permissions = Some(mode & 0o7777);
        self
    }

    pub fn with_modified(mut self, secs: i64) -> Self {
        self.modified = Some(secs);
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Direct child by name
    pub fn child(&self, name: &str) -> Option<&FsNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Descendant by `/`-separated path relative to this node; `""` is the node itself
    pub fn find(&self, path: &str) -> Option<&FsNode> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(self, |node, part| node.child(part))
    }

    /// Content digest: the recorded hash, or one computed from inline content
    pub fn content_digest(&self) -> Option<String> {
        if let Some(hash) = &self.hash {
            return Some(hash.clone());
        }
        let bytes = self.content.as_ref()?.to_bytes().ok()?;
        Some(sha256_hex(&bytes))
    }

    /// Relative paths of all descendants, depth-first in child order
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(self, "", &mut out);
        out
    }

    /// Parse a tree from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SnapshotError::Json(e).into())
    }

    /// Render the tree as pretty JSON
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| SnapshotError::Json(e).into())
    }
}

fn collect_paths(node: &FsNode, prefix: &str, out: &mut Vec<String>) {
    for child in &node.children {
        let path = join_rel(prefix, &child.name);
        out.push(path.clone());
        collect_paths(child, &path, out);
    }
}

pub(crate) fn join_rel(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Options controlling [`serialize`]
///
/// The default embeds every file so the tree can be materialized again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotOptions {
    /// Files larger than this are recorded by hash only; `None` embeds all
    pub inline_limit: Option<u64>,
}

impl SnapshotOptions {
    /// Hash-only above [`DEFAULT_INLINE_LIMIT`]; the tree is fit for diffing
    /// but not for materializing
    pub fn diff_only() -> Self {
        Self {
            inline_limit: Some(DEFAULT_INLINE_LIMIT),
        }
    }

    fn inlines(&self, len: u64) -> bool {
        self.inline_limit.map_or(true, |limit| len <= limit)
    }
}

/// Serialize the directory tree rooted at `root`.
///
/// Children are sorted by name, so two calls over the same disk state yield
/// identical trees. Sockets, fifos and device nodes are skipped with a warning.
#[instrument(skip(options))]
pub fn serialize(root: &Path, options: &SnapshotOptions) -> Result<FsNode> {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "/".to_string());

    match read_node(root, name, options)? {
        Some(node) => Ok(node),
        None => Err(SnapshotError::Unsupported {
            path: root.display().to_string(),
        }
        .into()),
    }
}

fn read_node(path: &Path, name: String, options: &SnapshotOptions) -> Result<Option<FsNode>> {
    let meta = fs::symlink_metadata(path).map_err(|e| SnapshotError::io(path, e))?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        let target = fs::read_link(path).map_err(|e| SnapshotError::io(path, e))?;
        return Ok(Some(FsNode::symlink(
            name,
            target.to_string_lossy().to_string(),
        )));
    }

    let mut node = if file_type.is_dir() {
        let entries = fs::read_dir(path).and_then(|dir| dir.collect::<std::io::Result<Vec<_>>>());
        directory_node(path, name, entries, options)?
    } else if file_type.is_file() {
        file_node(path, name, fs::read(path), options)
    } else {
        warn!("Skipping unsupported filesystem entry: {}", path.display());
        return Ok(None);
    };

    node.modified = meta
        .modified()
        .ok()
        .map(system_time_to_secs);
    apply_unix_metadata(&mut node, &meta);

    Ok(Some(node))
}

/// Unreadable directories are recorded without children
fn directory_node(
    path: &Path,
    name: String,
    entries: std::io::Result<Vec<fs::DirEntry>>,
    options: &SnapshotOptions,
) -> Result<FsNode> {
    let mut entries = match entries {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot list {}, recording metadata only: {}", path.display(), e);
            return Ok(FsNode::directory(name, Vec::new()));
        }
    };
    entries.sort_by_key(|entry| entry.file_name());

    let mut children = Vec::with_capacity(entries.len());
    for entry in entries {
        let child_name = entry.file_name().to_string_lossy().to_string();
        if let Some(child) = read_node(&entry.path(), child_name, options)? {
            children.push(child);
        }
    }
    Ok(FsNode::directory(name, children))
}

/// Unreadable files are recorded without content or hash
fn file_node(
    path: &Path,
    name: String,
    bytes: std::io::Result<Vec<u8>>,
    options: &SnapshotOptions,
) -> FsNode {
    let mut node = FsNode::bare(name, NodeKind::File);
    let bytes = match bytes {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Cannot read {}, recording metadata only: {}", path.display(), e);
            return node;
        }
    };
    node.size = Some(bytes.len() as u64);
    node.hash = Some(sha256_hex(&bytes));
    if options.inlines(bytes.len() as u64) {
        node.content = Some(FileContent::from_bytes(bytes));
    }
    node
}

#[cfg(unix)]
fn apply_unix_metadata(node: &mut FsNode, meta: &fs::Metadata) {
    use std::os::unix::fs::MetadataExt;
    node.permissions = Some(meta.mode() & 0o7777);
    node.owner = Some(meta.uid());
    node.group = Some(meta.gid());
}

#[cfg(not(unix))]
fn apply_unix_metadata(_node: &mut FsNode, _meta: &fs::Metadata) {}

fn system_time_to_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

pub(crate) fn secs_to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// A single entry that could not be written by [`materialize`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeFailure {
    /// Path relative to the materialization root
    pub path: String,
    pub reason: String,
}

/// Outcome of [`materialize`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeReport {
    /// Number of entries created or overwritten
    pub created: usize,
    pub failures: Vec<MaterializeFailure>,
}

impl MaterializeReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, path: &str, reason: impl std::fmt::Display) {
        debug!("Failed to materialize {}: {}", path, reason);
        self.failures.push(MaterializeFailure {
            path: path.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Recreate the children of `tree` under `root`.
///
/// `root` is created if missing; the root node's own name and attributes are
/// not applied (the target directory keeps its identity). Entries are written
/// depth-first; attributes of a directory are applied after its children so
/// restrictive modes don't block the writes beneath them. A failing entry is
/// recorded in the report and the walk continues with its siblings.
#[instrument(skip(tree))]
pub fn materialize(tree: &FsNode, root: &Path) -> MaterializeReport {
    let mut report = MaterializeReport::default();

    if let Err(e) = fs::create_dir_all(root) {
        report.fail("", e);
        return report;
    }

    for child in &tree.children {
        write_node(child, root, "", &mut report);
    }

    debug!(
        created = report.created,
        failures = report.failures.len(),
        "Materialized filesystem tree"
    );
    report
}

fn write_node(node: &FsNode, parent: &Path, prefix: &str, report: &mut MaterializeReport) {
    let rel = join_rel(prefix, &node.name);
    if node.name.is_empty() || node.name == "." || node.name == ".." || node.name.contains('/') {
        report.fail(&rel, format!("invalid entry name '{}'", node.name));
        return;
    }
    let path = parent.join(&node.name);

    match node.kind {
        NodeKind::Directory => {
            if let Err(e) = fs::create_dir_all(&path) {
                report.fail(&rel, e);
                return;
            }
            report.created += 1;
            for child in &node.children {
                write_node(child, &path, &rel, report);
            }
            apply_attributes(node, &path, &rel, report);
        }
        NodeKind::File => {
            let bytes = match node.content.as_ref().map(FileContent::to_bytes) {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    report.fail(&rel, format!("undecodable content: {}", e));
                    return;
                }
                None => {
                    report.fail(&rel, "no inline content recorded");
                    return;
                }
            };
            if let Err(e) = fs::write(&path, bytes) {
                report.fail(&rel, e);
                return;
            }
            report.created += 1;
            apply_attributes(node, &path, &rel, report);
        }
        NodeKind::Symlink => {
            let Some(target) = node.link_target.as_deref() else {
                report.fail(&rel, "symlink without target");
                return;
            };
            if fs::symlink_metadata(&path).is_ok() {
                if let Err(e) = fs::remove_file(&path) {
                    report.fail(&rel, e);
                    return;
                }
            }
            match create_symlink(target, &path) {
                Ok(()) => report.created += 1,
                Err(e) => report.fail(&rel, e),
            }
        }
    }
}

#[cfg(unix)]
fn create_symlink(target: &str, path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(not(unix))]
fn create_symlink(_target: &str, _path: &Path) -> std::io::Result<()> {
    Err(std::io::Error::other("symlinks are only supported on unix"))
}

/// Modification time first (needs a readable handle), then owner, then mode.
fn apply_attributes(node: &FsNode, path: &Path, rel: &str, report: &mut MaterializeReport) {
    if let Some(secs) = node.modified {
        let result = fs::File::open(path).and_then(|f| f.set_modified(secs_to_system_time(secs)));
        if let Err(e) = result {
            report.fail(rel, format!("set modified time: {}", e));
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        if node.owner.is_some() || node.group.is_some() {
            let needs_chown = match fs::metadata(path) {
                Ok(meta) => {
                    node.owner.is_some_and(|uid| uid != meta.uid())
                        || node.group.is_some_and(|gid| gid != meta.gid())
                }
                Err(_) => true,
            };
            if needs_chown {
                if let Err(e) = std::os::unix::fs::chown(path, node.owner, node.group) {
                    report.fail(rel, format!("set owner: {}", e));
                }
            }
        }

        if let Some(mode) = node.permissions {
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
                report.fail(rel, format!("set permissions: {}", e));
            }
        }
    }
}

/// Remove every entry below `root`, keeping `root` itself
pub fn clear_directory(root: &Path) -> Result<()> {
    let entries = fs::read_dir(root).map_err(|e| SnapshotError::io(root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SnapshotError::io(root, e))?;
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .map(|t| t.is_dir())
            .map_err(|e| SnapshotError::io(&path, e))?;
        let removed = if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| SnapshotError::io(&path, e))?;
    }
    Ok(())
}

mod octal_mode {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mode: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
        match mode {
            Some(mode) => serializer.serialize_str(&format!("{:04o}", mode)),
            None => serializer.serialize_none(),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Number(mode)) => Ok(Some(mode & 0o7777)),
            Some(Raw::Text(text)) => {
                let digits = text.trim_start_matches("0o");
                u32::from_str_radix(digits, 8)
                    .map(|mode| Some(mode & 0o7777))
                    .map_err(|_| de::Error::custom(format!("invalid octal mode '{}'", text)))
            }
        }
    }
}
