use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

mod config;
mod error;
mod tools;
mod utils;

use config::Config;
use tools::{Tool, ToolSet, YtDlpTool};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lease a tool, downloading it if needed, and print its version and path
    Lease {
        #[arg(value_enum)]
        tool: Tool,
    },
    /// Purge old versions, then check both tools for updates
    Update,
    /// Delete every cached version except the newest one that isn't in use
    Purge,
    /// Download media with yt-dlp
    Download {
        url: String,

        /// Directory to download into (defaults to the current directory)
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Keep only the audio track
        #[arg(long)]
        audio_only: bool,
    },
}

fn get_config_path(args: &Args) -> Option<PathBuf> {
    if let Some(path) = &args.config {
        return Some(path.clone());
    }

    if let Ok(path) = std::env::var("TOOLCACHE_CONFIG") {
        return Some(PathBuf::from(path));
    }

    if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
        let config_path = PathBuf::from(xdg_config_home)
            .join("toolcache")
            .join("config.toml");
        if config_path.exists() {
            return Some(config_path);
        }
    }

    if let Some(home) = dirs::home_dir() {
        let config_path = home.join(".config").join("toolcache").join("config.toml");
        if config_path.exists() {
            return Some(config_path);
        }
    }

    None
}

/// Cancels the token on Ctrl-C so in-flight waits give up cleanly.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling...");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = get_config_path(&args);
    let config = match &config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if config.get_logging_format() == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match &config_path {
        Some(path) => info!("Loaded config from: {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    let tools = ToolSet::from_config(&config)?;
    let cancel = cancel_on_ctrl_c();

    let outcome = run(&tools, args.command, &cancel).await;
    tools.dispose();
    outcome
}

async fn run(tools: &ToolSet, command: Command, cancel: &CancellationToken) -> Result<()> {
    match command {
        Command::Lease { tool } => {
            let resolver = tools.resolver(tool);
            let lease = resolver.lease_tool(cancel).await?;
            let path = lease.file_path()?;
            info!("Leased {} {}", resolver.name(), lease.version());

            if tool == Tool::YtDlp {
                match YtDlpTool::new(path, lease.directory()?).version().await {
                    Ok(version) => info!("✅ yt-dlp is available, version: {}", version),
                    Err(e) => warn!("❌ yt-dlp is not runnable: {:#}", e),
                }
            }

            println!("{} {}", lease.version(), path.display());
        }
        Command::Update => {
            tools.check_for_tool_updates(cancel).await?;
            info!("Tools are up to date");
        }
        Command::Purge => tools.purge_old_versions(),
        Command::Download {
            url,
            dest,
            audio_only,
        } => {
            let dest = match dest {
                Some(dest) => std::path::absolute(dest)?,
                None => std::env::current_dir()?,
            };
            let result = tools.download(&url, &dest, audio_only, cancel).await?;
            if !result.success {
                anyhow::bail!(
                    "yt-dlp failed with exit code {}: {}",
                    result.exit_code,
                    result.message.unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
