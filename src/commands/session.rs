use console_sync::Console;
use console_sync::logging::mask_secret;
use console_sync::preload::GuardOutcome;
use console_sync::session::ConnectionStatus;
use owo_colors::OwoColorize;

use crate::{CliError, CliResult};

/// Make sure the console holds a live session, restoring the persisted one if needed.
pub async fn ensure_session(console: &Console) -> CliResult<()> {
    if console.session.is_authenticated() {
        return Ok(());
    }
    if console.session.restore_session().await {
        Ok(())
    } else {
        Err(CliError::NotLoggedIn)
    }
}

pub async fn handle_login(
    console: &Console,
    api_base: Option<String>,
    key: Option<String>,
) -> CliResult<()> {
    let api_base = api_base
        .or_else(|| console.settings.management.api_base.clone())
        .or_else(|| {
            let endpoint = console.session.snapshot().endpoint_base;
            (!endpoint.is_empty()).then_some(endpoint)
        })
        .ok_or_else(|| {
            CliError::Usage(
                "no endpoint given: pass --api-base or set management.api_base".to_string(),
            )
        })?;
    let key = key
        .or_else(|| std::env::var("CONSOLE_SYNC_MANAGEMENT_KEY").ok())
        .ok_or_else(|| {
            CliError::Usage(
                "no management key given: pass --key or set CONSOLE_SYNC_MANAGEMENT_KEY"
                    .to_string(),
            )
        })?;

    let session = console.session.login(&api_base, &key).await?;
    println!("{} {}", "Logged in to".green(), session.endpoint_base);
    println!(
        "  server version: {}",
        session.server_version.as_deref().unwrap_or("-")
    );
    if let Some(date) = session.server_build_date.as_deref() {
        println!("  build date: {}", date);
    }
    Ok(())
}

pub fn handle_logout(console: &Console) {
    console.session.logout();
    println!("Logged out; endpoint kept for the next login.");
}

pub async fn handle_status(console: &Console) -> CliResult<()> {
    if !console.session.is_authenticated() && console.session.has_persisted_session() {
        console.session.restore_session().await;
    }
    let s = console.session.snapshot();
    let status = match s.connection_status {
        ConnectionStatus::Connected => "connected".green().to_string(),
        ConnectionStatus::Connecting => "connecting".yellow().to_string(),
        ConnectionStatus::Disconnected => "disconnected".dimmed().to_string(),
        ConnectionStatus::Error => "error".red().to_string(),
    };
    println!("{}", "Session".bold());
    println!("  status: {}", status);
    println!("  authenticated: {}", s.is_authenticated);
    println!(
        "  endpoint: {}",
        if s.endpoint_base.is_empty() {
            "-"
        } else {
            s.endpoint_base.as_str()
        }
    );
    println!("  key: {}", mask_secret(&s.credential));
    println!("  server version: {}", s.server_version.as_deref().unwrap_or("-"));
    if let Some(err) = s.connection_error.as_deref() {
        println!("  last error: {}", err.red());
    }
    Ok(())
}

pub async fn handle_preload(console: &Console) -> CliResult<()> {
    let orchestrator = console.orchestrator();
    match orchestrator.enter_protected_view().await {
        GuardOutcome::Redirect => Err(CliError::NotLoggedIn),
        GuardOutcome::Ready(report) => {
            for name in &report.loaded {
                println!("  {} {}", "ok".green(), name);
            }
            for (name, err) in &report.failed {
                println!("  {} {}: {}", "failed".red(), name, err);
            }
            Ok(())
        }
    }
}
