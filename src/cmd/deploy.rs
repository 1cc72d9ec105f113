//! Foreground deploy: `forge-preview deploy <owner/repo>`.

use anyhow::{Context, Result, bail};
use tokio::sync::broadcast;

use forge_preview::config::PreviewConfig;
use forge_preview::preview::github::is_valid_github_token;
use forge_preview::preview::models::Credential;
use forge_preview::preview::ws::PreviewEvent;
use forge_preview::preview::{DeployOutcome, DeployRequest, LifecyclePhase, RepoRef};
use forge_preview::ui::ConsoleView;

use super::build_controller;

pub async fn cmd_deploy(config: &PreviewConfig, repo: &str, branch: &str, open: bool) -> Result<()> {
    let repo = RepoRef::parse(repo, branch)
        .with_context(|| format!("Invalid repository '{}': expected owner/repo or a GitHub URL", repo))?;
    let token = config.github.token.clone().context(
        "No GitHub token. Pass --token, set GITHUB_TOKEN, or add [github] token to .forge/preview.toml",
    )?;

    let view = ConsoleView::new();
    if !is_valid_github_token(&token) {
        view.warning("GitHub token does not have a recognized prefix (ghp_, github_pat_, ...)");
    }

    let controller = build_controller(config)?;
    // Subscribe first so the whole cycle is seen
    let mut events = controller.subscribe_events();

    match controller.deploy(DeployRequest {
        repo,
        credential: Credential::new(token),
    }) {
        DeployOutcome::Started { .. } => {}
        DeployOutcome::Rejected { phase } => bail!("A deploy is already in progress ({})", phase),
        DeployOutcome::Disabled { reason } => bail!("Deploys are disabled: {}", reason),
    }

    let mut last_phase = LifecyclePhase::Idle;
    let mut opened = false;
    let mut last_seq = 0;
    let result = loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                controller.stop();
                view.success("Stopped");
                break Ok(());
            }
            event = events.recv() => event,
        };
        let json = match event {
            Ok(json) => json,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Terminal fell behind, replaying from the console");
                for entry in controller.console().entries_since(last_seq) {
                    last_seq = entry.seq;
                    view.entry(&entry);
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break Ok(()),
        };
        let event: PreviewEvent = match serde_json::from_str(&json) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable event");
                continue;
            }
        };
        match event {
            PreviewEvent::ConsoleAppended { entry } => {
                // Entries at or below last_seq were printed by a replay
                if entry.seq > last_seq {
                    last_seq = entry.seq;
                    view.entry(&entry);
                }
            }
            PreviewEvent::PreviewReady { preview } => {
                view.preview_ready(&preview);
                if open && !opened {
                    opened = true;
                    if let Err(e) = open::that(&preview.url) {
                        view.warning(&format!("Failed to open browser: {}", e));
                    }
                }
            }
            PreviewEvent::StateChanged { snapshot } => {
                if snapshot.state != last_phase {
                    last_phase = snapshot.state;
                    view.phase(snapshot.state);
                }
                if snapshot.state == LifecyclePhase::Error {
                    let banner = snapshot.error.unwrap_or_else(|| "Deploy failed".to_string());
                    view.error(&banner);
                    break Err(anyhow::anyhow!(banner));
                }
            }
            PreviewEvent::ConsoleCleared | PreviewEvent::Resync { .. } => {}
        }
    };

    controller.shutdown();
    result
}
