//! HTTP control surface: `forge-preview serve`.

use anyhow::Result;

use forge_preview::config::PreviewConfig;
use forge_preview::preview::server::{ServerConfig, start_server};

use super::build_controller;

pub async fn cmd_serve(config: &PreviewConfig, open: bool, dev: bool) -> Result<()> {
    let controller = build_controller(config)?;

    if open {
        let url = format!("http://localhost:{}/api/status", config.server.port);
        tokio::spawn(async move {
            // Let the listener bind first
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
            if let Err(e) = open::that(&url) {
                tracing::warn!(error = %e, "Failed to open browser");
            }
        });
    }

    start_server(
        ServerConfig {
            host: config.server.host.clone(),
            port: config.server.port,
            permissive_cors: dev,
            default_token: config.github.token.clone(),
        },
        controller,
    )
    .await
}
