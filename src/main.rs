use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use forge_preview::config::PreviewConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "forge-preview")]
#[command(version, about = "Fetch a repository branch, install it, run its dev server, and stream the console")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Diagnostic log format (logs go to stderr)
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Directory holding `.forge/preview.toml` and `.env`
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// GitHub API base URL. Overrides config and FORGE_PREVIEW_API_URL.
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Cap on non-manifest files fetched per deploy
    #[arg(long, global = true)]
    pub max_files: Option<usize>,

    /// Parent directory for preview workspaces
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    /// GitHub token. Overrides config and GITHUB_TOKEN.
    #[arg(long, global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy one repository in the foreground and stream its console
    Deploy {
        /// `owner/repo` or a GitHub URL
        repo: String,

        #[arg(short, long, default_value = "main")]
        branch: String,

        /// Open the preview in a browser once it is ready
        #[arg(long)]
        open: bool,
    },
    /// Serve the HTTP/WebSocket control surface
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,

        /// Open the status page in a browser after the server starts
        #[arg(long)]
        open: bool,

        /// Enable permissive CORS for a UI served from another origin
        #[arg(long)]
        dev: bool,
    },
}

fn init_tracing(verbose: bool, format: LogFormat) -> Result<()> {
    let default_level = if verbose { "forge_preview=debug" } else { "forge_preview=info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("Invalid log filter")?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

impl Cli {
    /// Fold flag overrides into the file + environment configuration.
    fn apply_overrides(&self, config: &mut PreviewConfig) {
        if let Some(url) = &self.api_url {
            config.github.api_url = Some(url.clone());
        }
        if let Some(max) = self.max_files {
            config.selection.max_files = max;
        }
        if let Some(dir) = &self.workspace {
            config.runtime.workspace_root = Some(dir.clone());
        }
        if let Some(token) = &self.token {
            config.github.token = Some(token.clone());
        }
        if let Commands::Serve { port, host, .. } = &self.command {
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(host) = host {
                config.server.host = host.clone();
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format)?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    if let Err(e) = dotenvy::from_path(project_dir.join(".env"))
        && !e.not_found()
    {
        tracing::warn!(error = %e, "Failed to load .env");
    }

    let mut config = PreviewConfig::resolve(&project_dir)?;
    cli.apply_overrides(&mut config);

    match &cli.command {
        Commands::Deploy { repo, branch, open } => {
            cmd::cmd_deploy(&config, repo, branch, *open).await?;
        }
        Commands::Serve { open, dev, .. } => {
            cmd::cmd_serve(&config, *open, *dev).await?;
        }
    }

    Ok(())
}
