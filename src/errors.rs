//! Typed error hierarchy for the preview orchestrator.
//!
//! `PreviewError` covers every failure a deploy cycle can hit. Each variant
//! maps onto one class of the taxonomy the lifecycle controller reacts to:
//! - `Auth`: hosting credential expired or rejected
//! - `Fetch`: tree or blob retrieval failed
//! - `Provision`: the sandboxed runtime could not be obtained (fatal)
//! - `Install`: dependency installation exited non-zero
//! - `TreeConflict`: the remote tree is malformed (file/directory clash)
//! - `Runtime`: anything the environment reported, surfaced verbatim

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("GitHub session expired, please reconnect: {0}")]
    Auth(String),

    #[error("Failed to fetch {what}: {message}")]
    Fetch { what: String, message: String },

    #[error("Sandboxed runtime unavailable: {0}")]
    Provision(String),

    #[error("Dependency install exited with code {exit_code}")]
    Install { exit_code: i32 },

    #[error("Conflicting paths in repository tree at '{path}': {reason}")]
    TreeConflict { path: String, reason: String },

    #[error("{0}")]
    Runtime(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PreviewError {
    pub fn fetch(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Fetch {
            what: what.into(),
            message: message.to_string(),
        }
    }

    /// A provisioning failure disables every later deploy in the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Provision(_))
    }

    /// Single-line text shown in the error banner.
    pub fn banner(&self) -> String {
        match self {
            Self::Auth(_) => "Your GitHub session has expired. Please sign in again.".to_string(),
            other => other.to_string(),
        }
    }
}

pub type PreviewResult<T> = Result<T, PreviewError>;
