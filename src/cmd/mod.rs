//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `deploy` | `Deploy`         |
//! | `serve`  | `Serve`          |

pub mod deploy;
pub mod serve;

pub use deploy::cmd_deploy;
pub use serve::cmd_serve;

use std::sync::Arc;

use anyhow::Result;
use forge_preview::config::PreviewConfig;
use forge_preview::preview::PreviewController;
use forge_preview::preview::github::GitHubClient;
use forge_preview::preview::local::LocalRuntime;

/// Wire the GitHub client and the local runtime into a controller.
pub fn build_controller(config: &PreviewConfig) -> Result<PreviewController> {
    let hosting = Arc::new(GitHubClient::new(config.api_url()));
    // Dev servers must not pop their own browser tabs
    let runtime = Arc::new(LocalRuntime::new(config.workspace_root()).with_env("BROWSER", "none"));
    Ok(PreviewController::new(
        hosting,
        runtime,
        config.selection_policy()?,
        config.orchestrator()?,
    ))
}
