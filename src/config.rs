//! Configuration for forge-preview, read from `.forge/preview.toml`.
//!
//! Layered: file, then environment, then CLI flags (applied by the command
//! layer). A missing file means defaults.
//!
//! ```toml
//! [github]
//! api_url = "https://api.github.com"
//! token = "ghp_..."
//!
//! [selection]
//! max_files = 200
//! extensions = ["js", "ts", "json", "css", "html"]
//! manifests = ["package.json"]
//! exclude = ["node_modules/**", "dist/**"]
//!
//! [commands]
//! install = ["npm", "install"]
//! start = ["npm", "run", "dev"]
//!
//! [runtime]
//! workspace_root = "/tmp"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 3142
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::preview::github::DEFAULT_API_URL;
use crate::preview::orchestrator::{CommandSpec, ProcessOrchestrator};
use crate::preview::selection::{
    DEFAULT_EXCLUDES, DEFAULT_EXTENSIONS, DEFAULT_MANIFESTS, DEFAULT_MAX_FILES, SelectionPolicy,
};

pub const CONFIG_FILE: &str = "preview.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct GithubSection {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionSection {
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_manifests")]
    pub manifests: Vec<String>,
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,
}

fn default_max_files() -> usize {
    DEFAULT_MAX_FILES
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_extensions() -> Vec<String> {
    to_strings(DEFAULT_EXTENSIONS)
}

fn default_manifests() -> Vec<String> {
    to_strings(DEFAULT_MANIFESTS)
}

fn default_excludes() -> Vec<String> {
    to_strings(DEFAULT_EXCLUDES)
}

impl Default for SelectionSection {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            extensions: default_extensions(),
            manifests: default_manifests(),
            exclude: default_excludes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandsSection {
    #[serde(default = "default_install")]
    pub install: Vec<String>,
    #[serde(default = "default_start")]
    pub start: Vec<String>,
}

fn default_install() -> Vec<String> {
    to_strings(&["npm", "install"])
}

fn default_start() -> Vec<String> {
    to_strings(&["npm", "run", "dev"])
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            install: default_install(),
            start: default_start(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RuntimeSection {
    /// Parent directory for per-session workspaces. Defaults to the
    /// system temp directory.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3142
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// The complete preview.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PreviewConfig {
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub selection: SelectionSection,
    #[serde(default)]
    pub commands: CommandsSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub server: ServerSection,
}

impl PreviewConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse preview.toml")
    }

    /// Load `<forge_dir>/preview.toml`, or defaults if it does not exist.
    pub fn load_or_default(forge_dir: &Path) -> Result<Self> {
        let config_path = forge_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// File config for `project_dir` with process environment overrides.
    pub fn resolve(project_dir: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(&project_dir.join(".forge"))?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `GITHUB_TOKEN`, `FORGE_PREVIEW_API_URL`,
    /// `FORGE_PREVIEW_MAX_FILES` and `FORGE_PREVIEW_WORKSPACE`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(token) = lookup("GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
        if let Some(url) = lookup("FORGE_PREVIEW_API_URL") {
            self.github.api_url = Some(url);
        }
        if let Some(max) = lookup("FORGE_PREVIEW_MAX_FILES") {
            self.selection.max_files = max
                .trim()
                .parse()
                .with_context(|| format!("FORGE_PREVIEW_MAX_FILES must be a number, got '{}'", max))?;
        }
        if let Some(dir) = lookup("FORGE_PREVIEW_WORKSPACE") {
            self.runtime.workspace_root = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn api_url(&self) -> &str {
        self.github.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.runtime
            .workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn selection_policy(&self) -> Result<SelectionPolicy> {
        SelectionPolicy::new(
            self.selection.max_files,
            &self.selection.extensions,
            &self.selection.manifests,
            &self.selection.exclude,
        )
    }

    pub fn orchestrator(&self) -> Result<ProcessOrchestrator> {
        let install = CommandSpec::from_argv(&self.commands.install).context("Invalid [commands] install")?;
        let start = CommandSpec::from_argv(&self.commands.start).context("Invalid [commands] start")?;
        Ok(ProcessOrchestrator::new(install, start))
    }
}
