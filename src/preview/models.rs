use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{PreviewError, PreviewResult};

/// Identifies the repository snapshot to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    /// Parse `owner/repo` or a GitHub URL into a reference on `branch`.
    pub fn parse(spec: &str, branch: &str) -> Option<Self> {
        let slug = super::github::parse_owner_repo_from_url(spec).or_else(|| {
            let parts: Vec<&str> = spec.trim().split('/').collect();
            (parts.len() == 2 && parts.iter().all(|p| !p.is_empty())).then(|| spec.trim().to_string())
        })?;
        let (owner, repo) = slug.split_once('/')?;
        if branch.trim().is_empty() {
            return None;
        }
        Some(Self::new(owner, repo, branch.trim()))
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.branch)
    }
}

/// Hosting-service access token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Blob,
    Tree,
    Commit,
    /// Any kind the hosting API adds later. Never selected.
    #[serde(other)]
    Other,
}

/// One item of a remote repository snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub sha: String,
}

impl TreeEntry {
    pub fn blob(path: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Blob,
            sha: sha.into(),
        }
    }

    pub fn is_blob(&self) -> bool {
        self.kind == EntryKind::Blob
    }

    /// Final `/`-separated segment of the path.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// In-memory file tree mounted into the execution environment.
///
/// Serializes as `{"file": {"contents": ..}}` or
/// `{"directory": {"children": {name: node}}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileNode {
    File { contents: String },
    Directory { children: BTreeMap<String, FileNode> },
}

impl Default for FileNode {
    fn default() -> Self {
        Self::empty_dir()
    }
}

impl FileNode {
    pub fn empty_dir() -> Self {
        Self::Directory {
            children: BTreeMap::new(),
        }
    }

    /// Insert `contents` at the `/`-separated `path`, creating directories
    /// on the way. A path that would turn a file into a directory (or the
    /// reverse), or that names an existing file twice, is rejected.
    pub fn insert(&mut self, path: &str, contents: String) -> PreviewResult<()> {
        let segments = split_path(path)?;
        let (leaf, parents) = segments
            .split_last()
            .ok_or_else(|| conflict(path, "empty path"))?;

        let mut current = self;
        for (depth, segment) in parents.iter().enumerate() {
            let children = match current {
                FileNode::Directory { children } => children,
                FileNode::File { .. } => {
                    return Err(conflict(
                        &segments[..depth].join("/"),
                        "file is also used as a directory",
                    ));
                }
            };
            current = children
                .entry((*segment).to_string())
                .or_insert_with(FileNode::empty_dir);
        }

        let children = match current {
            FileNode::Directory { children } => children,
            FileNode::File { .. } => {
                return Err(conflict(
                    &parents.join("/"),
                    "file is also used as a directory",
                ));
            }
        };
        match children.get(*leaf) {
            Some(FileNode::Directory { .. }) => {
                Err(conflict(path, "directory is also used as a file"))
            }
            Some(FileNode::File { .. }) => Err(conflict(path, "duplicate file entry")),
            None => {
                children.insert((*leaf).to_string(), FileNode::File { contents });
                Ok(())
            }
        }
    }

    /// Look up a node by `/`-separated path. The empty path is `self`.
    pub fn get(&self, path: &str) -> Option<&FileNode> {
        let mut current = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match current {
                FileNode::Directory { children } => current = children.get(segment)?,
                FileNode::File { .. } => return None,
            }
        }
        Some(current)
    }

    pub fn contents(&self) -> Option<&str> {
        match self {
            FileNode::File { contents } => Some(contents),
            FileNode::Directory { .. } => None,
        }
    }

    /// All file paths below this node, depth-first in name order.
    pub fn file_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(self, String::new(), &mut out);
        out
    }
}

fn collect_paths(node: &FileNode, prefix: String, out: &mut Vec<String>) {
    match node {
        FileNode::File { .. } => out.push(prefix),
        FileNode::Directory { children } => {
            for (name, child) in children {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", prefix, name)
                };
                collect_paths(child, path, out);
            }
        }
    }
}

fn split_path(path: &str) -> PreviewResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments
        .iter()
        .any(|s| s.is_empty() || *s == "." || *s == "..")
    {
        return Err(conflict(path, "path has an empty or relative segment"));
    }
    Ok(segments)
}

fn conflict(path: &str, reason: &str) -> PreviewError {
    PreviewError::TreeConflict {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Name-only view of the lifecycle state, as exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Idle,
    Cloning,
    Installing,
    Running,
    Error,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Cloning => "cloning",
            Self::Installing => "installing",
            Self::Running => "running",
            Self::Error => "error",
        }
    }

    /// Whether `deploy()` is accepted in this phase.
    pub fn accepts_deploy(&self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device emulation used to size the preview surface. Display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    #[default]
    Desktop,
    Tablet,
    Mobile,
}

impl DeviceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Tablet => "tablet",
            Self::Mobile => "mobile",
        }
    }
}

impl FromStr for DeviceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "desktop" => Ok(Self::Desktop),
            "tablet" => Ok(Self::Tablet),
            "mobile" => Ok(Self::Mobile),
            _ => Err(format!("Invalid device mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewAddress {
    pub url: String,
    pub port: u16,
    pub device_mode: DeviceMode,
}

/// Read-only view of the controller handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: LifecyclePhase,
    pub preview: Option<PreviewAddress>,
    pub error: Option<String>,
    pub device_mode: DeviceMode,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: LifecyclePhase::Idle,
            preview: None,
            error: None,
            device_mode: DeviceMode::default(),
        }
    }
}
