use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

pub const DEFAULT_FRESHNESS_MS: u64 = 30_000;
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RATE_WINDOW_MINUTES: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ManagementSettings {
    /// Endpoint used by `login` when none is passed on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheSettings {
    /// How long a fetched config stays fresh (milliseconds).
    pub freshness_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            freshness_ms: DEFAULT_FRESHNESS_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthSettings {
    /// Timeout of the login request (milliseconds).
    pub timeout_ms: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_AUTH_TIMEOUT_MS,
        }
    }
}

impl AuthSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UsageSettings {
    /// Trailing window for per-minute rates.
    pub rate_window_minutes: u64,
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self {
            rate_window_minutes: DEFAULT_RATE_WINDOW_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct StorageSettings {
    /// Session storage file; defaults to `~/.console-sync/storage.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AppConfig {
    /// Optional config schema version for future migrations
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub management: ManagementSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub usage: UsageSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl AppConfig {
    pub fn storage_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| console_home_dir().join("storage.json"))
    }

    /// Apply `CONSOLE_SYNC_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("CONSOLE_SYNC_API_BASE")
            && !v.trim().is_empty()
        {
            self.management.api_base = Some(v.trim().to_string());
        }
        if let Some(ms) = env::var("CONSOLE_SYNC_FRESHNESS_MS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            self.cache.freshness_ms = ms;
        }
    }
}

/// Home directory for config, storage and logs. `CONSOLE_SYNC_HOME` overrides it.
pub fn console_home_dir() -> PathBuf {
    if let Ok(dir) = env::var("CONSOLE_SYNC_HOME")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".console-sync")
}

fn config_json_path() -> PathBuf {
    console_home_dir().join("config.json")
}

fn config_toml_path() -> PathBuf {
    console_home_dir().join("config.toml")
}

fn config_toml_backup_path() -> PathBuf {
    console_home_dir().join("config.toml.bak")
}

/// Return the primary config file path that will be used by `load_config()`.
pub fn config_file_path() -> PathBuf {
    let toml_path = config_toml_path();
    if toml_path.exists() {
        toml_path
    } else if config_json_path().exists() {
        config_json_path()
    } else {
        toml_path
    }
}

const CONFIG_VERSION: u32 = 1;

fn ensure_config_version(cfg: &mut AppConfig) {
    if cfg.version.is_none() {
        cfg.version = Some(CONFIG_VERSION);
    }
}

const CONFIG_TOML_DOC_HEADER: &str = r#"# console-sync config.toml
#
# Generate a commented template with `console-sync settings init`.
"#;

const CONFIG_TOML_TEMPLATE: &str = r#"# console-sync config.toml
#
# If `config.toml` exists it takes precedence over `config.json`.
#
# Paths:
# - Linux/macOS: ~/.console-sync/config.toml
# - Windows:     %USERPROFILE%\.console-sync\config.toml
# - Set CONSOLE_SYNC_HOME to relocate the whole directory.

version = 1

[management]
# Default management endpoint for `console-sync login`.
# A bare host gets `http://`; a trailing `/v0/management` is stripped.
# api_base = "http://127.0.0.1:8317"

[cache]
# A fetched config is served from memory for this long (milliseconds).
freshness_ms = 30000

[auth]
# Timeout of the login request (milliseconds).
timeout_ms = 10000

[usage]
# Trailing window used for requests/tokens per minute.
rate_window_minutes = 30

[storage]
# Where the session record is persisted.
# path = "/home/me/.console-sync/storage.json"
"#;

pub async fn init_config_toml(force: bool) -> Result<PathBuf> {
    let dir = console_home_dir();
    fs::create_dir_all(&dir).await?;
    let path = config_toml_path();
    let backup_path = config_toml_backup_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config.toml already exists at {:?}; use --force to overwrite",
            path
        );
    }

    if path.exists()
        && let Err(err) = fs::copy(&path, &backup_path).await
    {
        warn!("failed to backup {:?} to {:?}: {}", path, backup_path, err);
    }

    let tmp_path = dir.join("config.toml.tmp");
    fs::write(&tmp_path, CONFIG_TOML_TEMPLATE.as_bytes()).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(path)
}

pub async fn load_config() -> Result<AppConfig> {
    let toml_path = config_toml_path();
    if toml_path.exists() {
        let text = fs::read_to_string(&toml_path).await?;
        let mut cfg = toml::from_str::<AppConfig>(&text)
            .with_context(|| format!("failed to parse {:?}", toml_path))?;
        ensure_config_version(&mut cfg);
        return Ok(cfg);
    }

    let json_path = config_json_path();
    if json_path.exists() {
        let bytes = fs::read(&json_path).await?;
        let mut cfg = serde_json::from_slice::<AppConfig>(&bytes)
            .with_context(|| format!("failed to parse {:?}", json_path))?;
        ensure_config_version(&mut cfg);
        return Ok(cfg);
    }

    let mut cfg = AppConfig::default();
    ensure_config_version(&mut cfg);
    Ok(cfg)
}

pub async fn save_config(cfg: &AppConfig) -> Result<()> {
    let mut cfg = cfg.clone();
    ensure_config_version(&mut cfg);

    let dir = console_home_dir();
    fs::create_dir_all(&dir).await?;
    let toml_path = config_toml_path();
    let json_path = config_json_path();
    let (path, data) = if toml_path.exists() || !json_path.exists() {
        let body = toml::to_string_pretty(&cfg)?;
        let text = format!("{CONFIG_TOML_DOC_HEADER}\n{body}");
        (toml_path, text.into_bytes())
    } else {
        (json_path, serde_json::to_vec_pretty(&cfg)?)
    };

    if path.exists() {
        let backup_path = path.with_extension(format!(
            "{}.bak",
            path.extension().and_then(|e| e.to_str()).unwrap_or("cfg")
        ));
        if let Err(err) = fs::copy(&path, &backup_path).await {
            warn!("failed to backup {:?} to {:?}: {}", path, backup_path, err);
        }
    }

    let tmp_path = dir.join("config.tmp");
    fs::write(&tmp_path, &data).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(())
}
