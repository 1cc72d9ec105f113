//! Which tree entries are worth fetching.
//!
//! `SelectionPolicy::select` returns a lazy iterator over the accepted
//! entries. Manifest files are always yielded; every other blob must carry an
//! allow-listed extension, avoid the exclude globs, and fit under
//! `max_files`. Once the cap is hit the iterator keeps scanning, but only for
//! manifests.

use glob::Pattern;

use super::models::TreeEntry;

pub const DEFAULT_MAX_FILES: usize = 200;

pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "js", "jsx", "mjs", "cjs", "ts", "tsx", "mts", "cts", "json", "html", "htm", "css", "scss",
    "sass", "less", "vue", "svelte", "astro", "md", "mdx", "txt", "svg", "yml", "yaml", "toml",
    "graphql", "gql",
];

pub const DEFAULT_MANIFESTS: &[&str] = &["package.json"];

pub const DEFAULT_EXCLUDES: &[&str] = &[
    "node_modules/**",
    "**/node_modules/**",
    ".git/**",
    "dist/**",
    "build/**",
    ".next/**",
    "coverage/**",
];

#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    pub max_files: usize,
    extensions: Vec<String>,
    manifests: Vec<String>,
    excludes: Vec<Pattern>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            manifests: DEFAULT_MANIFESTS.iter().map(|s| s.to_string()).collect(),
            excludes: DEFAULT_EXCLUDES
                .iter()
                .filter_map(|p| Pattern::new(p).ok())
                .collect(),
        }
    }
}

impl SelectionPolicy {
    /// Build a policy, rejecting malformed exclude globs.
    pub fn new(
        max_files: usize,
        extensions: &[String],
        manifests: &[String],
        excludes: &[String],
    ) -> anyhow::Result<Self> {
        let excludes = excludes
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| anyhow::anyhow!("Invalid exclude pattern '{}': {}", p, e))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            max_files,
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            manifests: manifests.to_vec(),
            excludes,
        })
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn is_manifest(&self, entry: &TreeEntry) -> bool {
        let name = entry.file_name();
        self.manifests.iter().any(|m| m == name)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excludes.iter().any(|p| p.matches(path))
    }

    pub fn has_allowed_extension(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            }
            _ => false,
        }
    }

    /// Whether a non-manifest blob passes the allow-list and excludes.
    fn is_candidate(&self, entry: &TreeEntry) -> bool {
        !self.is_excluded(&entry.path) && self.has_allowed_extension(&entry.path)
    }

    pub fn select<'a>(&'a self, entries: &'a [TreeEntry]) -> Selection<'a> {
        Selection {
            policy: self,
            entries: entries.iter(),
            taken: 0,
        }
    }
}

/// One accepted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selected<'a> {
    pub entry: &'a TreeEntry,
    pub manifest: bool,
}

#[derive(Debug, Clone)]
pub struct Selection<'a> {
    policy: &'a SelectionPolicy,
    entries: std::slice::Iter<'a, TreeEntry>,
    taken: usize,
}

impl Selection<'_> {
    /// Number of non-manifest files yielded so far.
    pub fn taken(&self) -> usize {
        self.taken
    }

    pub fn cap_reached(&self) -> bool {
        self.taken >= self.policy.max_files
    }
}

impl<'a> Iterator for Selection<'a> {
    type Item = Selected<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.entries.by_ref() {
            if !entry.is_blob() {
                continue;
            }
            if self.policy.is_manifest(entry) {
                return Some(Selected {
                    entry,
                    manifest: true,
                });
            }
            if self.taken < self.policy.max_files && self.policy.is_candidate(entry) {
                self.taken += 1;
                return Some(Selected {
                    entry,
                    manifest: false,
                });
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.entries.size_hint().1)
    }
}
