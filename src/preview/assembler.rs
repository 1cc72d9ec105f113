//! Source Assembler: fetch the selected blobs and build the File Node tree.
//!
//! Fetches run one at a time, in listing order. Any failed blob aborts the
//! whole assembly so a half-built tree is never mounted.

use tracing::debug;

use super::github::HostingApi;
use super::models::{Credential, FileNode, RepoRef, TreeEntry};
use super::selection::SelectionPolicy;
use crate::errors::PreviewResult;

/// Result of a successful assembly.
#[derive(Debug)]
pub struct Assembly {
    pub root: FileNode,
    /// Every file inserted, manifests included.
    pub files_fetched: usize,
    pub manifests: usize,
    /// Whether the non-manifest cap cut the selection short.
    pub capped: bool,
}

/// Progress for one blob, emitted just before it is fetched.
#[derive(Debug, Clone, Copy)]
pub struct FetchProgress<'a> {
    pub index: usize,
    pub path: &'a str,
    pub manifest: bool,
}

pub async fn assemble(
    api: &dyn HostingApi,
    credential: &Credential,
    repo: &RepoRef,
    entries: &[TreeEntry],
    policy: &SelectionPolicy,
    mut on_fetch: impl FnMut(FetchProgress<'_>),
) -> PreviewResult<Assembly> {
    let mut root = FileNode::empty_dir();
    let mut files_fetched = 0;
    let mut manifests = 0;

    let mut selection = policy.select(entries);
    for selected in selection.by_ref() {
        let entry = selected.entry;
        on_fetch(FetchProgress {
            index: files_fetched + 1,
            path: &entry.path,
            manifest: selected.manifest,
        });
        let contents = api.get_blob(credential, repo, &entry.sha).await?;
        root.insert(&entry.path, contents)?;
        files_fetched += 1;
        if selected.manifest {
            manifests += 1;
        }
    }

    let capped = selection.cap_reached()
        && entries
            .iter()
            .filter(|e| e.is_blob() && !policy.is_manifest(e))
            .filter(|e| !policy.is_excluded(&e.path) && policy.has_allowed_extension(&e.path))
            .count()
            > policy.max_files;

    debug!(repo = %repo, files = files_fetched, manifests, capped, "Assembled source tree");
    Ok(Assembly {
        root,
        files_fetched,
        manifests,
        capped,
    })
}
