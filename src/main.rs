mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use thiserror::Error;

use console_sync::config::load_config;
use console_sync::logging::init_tracing;
use console_sync::{AuthError, Console, FetchError};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("not logged in; run `console-sync login` first")]
    NotLoggedIn,
    #[error("{0}")]
    Usage(String),
    #[error("settings error: {0}")]
    Settings(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(name = "console-sync")]
#[command(about = "Management console core for a proxy server", long_about = None)]
struct Cli {
    /// Enable debug logging (RUST_LOG still wins)
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Log in to a management endpoint and remember the session
    Login {
        /// Endpoint, e.g. `127.0.0.1:8317`; defaults to settings.management.api_base
        #[arg(long)]
        api_base: Option<String>,
        /// Management key; defaults to $CONSOLE_SYNC_MANAGEMENT_KEY
        #[arg(long)]
        key: Option<String>,
    },
    /// Forget the credential and the restore marker
    Logout,
    /// Show the current session (restoring it if possible)
    Status,
    /// Restore the session and warm every feature store
    Preload,
    /// Print the server config
    Config {
        /// Bypass the freshness window
        #[arg(long)]
        refresh: bool,
    },
    /// Per-account load statistics and recent rates from the usage endpoint
    Usage(UsageArgs),
    /// Manage local settings (~/.console-sync/config.toml)
    Settings {
        #[command(subcommand)]
        cmd: SettingsCommand,
    },
}

#[derive(clap::Args, Debug)]
pub struct UsageArgs {
    /// Trailing window for per-minute rates; defaults to settings.usage.rate_window_minutes
    #[arg(long)]
    pub window_minutes: Option<u64>,
    /// Print machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    /// Write a commented config.toml template
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print the settings file path and effective values
    Show,
}

async fn build_console() -> Result<Console> {
    let mut settings = load_config().await?;
    settings.apply_env_overrides();
    Console::from_settings(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(if cli.verbose { "debug" } else { "info" });

    match cli.command {
        Command::Settings { cmd } => commands::config::handle_settings_cmd(cmd).await?,
        Command::Login { api_base, key } => {
            commands::session::handle_login(&build_console().await?, api_base, key).await?
        }
        Command::Logout => commands::session::handle_logout(&build_console().await?),
        Command::Status => commands::session::handle_status(&build_console().await?).await?,
        Command::Preload => commands::session::handle_preload(&build_console().await?).await?,
        Command::Config { refresh } => {
            commands::config::handle_config_show(&build_console().await?, refresh).await?
        }
        Command::Usage(args) => {
            commands::usage::handle_usage_cmd(&build_console().await?, args).await?
        }
    }

    Ok(())
}
