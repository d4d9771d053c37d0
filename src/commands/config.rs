use console_sync::Console;
use console_sync::config::{config_file_path, init_config_toml, load_config};

use crate::commands::session::ensure_session;
use crate::{CliError, CliResult, SettingsCommand};

pub async fn handle_settings_cmd(cmd: SettingsCommand) -> CliResult<()> {
    match cmd {
        SettingsCommand::Init { force } => {
            let path = init_config_toml(force)
                .await
                .map_err(|e| CliError::Settings(e.to_string()))?;
            println!("Wrote TOML settings template to {:?}", path);
        }
        SettingsCommand::Show => {
            let mut cfg = load_config()
                .await
                .map_err(|e| CliError::Settings(e.to_string()))?;
            cfg.apply_env_overrides();
            println!("Settings file: {:?}", config_file_path());
            let text = toml::to_string_pretty(&cfg).map_err(|e| CliError::Settings(e.to_string()))?;
            println!("{text}");
            println!("storage: {:?}", cfg.storage_path());
        }
    }
    Ok(())
}

pub async fn handle_config_show(console: &Console, refresh: bool) -> CliResult<()> {
    ensure_session(console).await?;
    let value = console.config.fetch_config(refresh).await?;
    let text = serde_json::to_string_pretty(value.as_ref())
        .map_err(|e| CliError::Other(e.into()))?;
    println!("{text}");
    Ok(())
}
