use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::api::{self, AppState};
use super::controller::PreviewController;

/// Configuration for the preview server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allow cross-origin requests, for a UI served from another port.
    pub permissive_cors: bool,
    pub default_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3142,
            permissive_cors: false,
            default_token: None,
        }
    }
}

/// Build the full application router: REST API plus the event socket.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Serve until Ctrl-C, then tear the preview session down.
pub async fn start_server(config: ServerConfig, controller: PreviewController) -> Result<()> {
    let state = Arc::new(AppState {
        controller: controller.clone(),
        default_token: config.default_token,
    });

    let mut app = build_router(state);
    if config.permissive_cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "Preview server listening");
    println!("Forge Preview running at http://{}", local_addr);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    controller.shutdown();
    println!("Server shut down gracefully.");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
