use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use crate::config::console_home_dir;

fn env_bool(key: &str) -> bool {
    let Ok(v) = std::env::var(key) else {
        return false;
    };
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Mask a secret for display: keep a short prefix/suffix, hide the rest.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.trim().chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_level`. With `CONSOLE_SYNC_LOG_FILE=1` log lines are also
/// written to a daily-rotated file under `~/.console-sync/logs`.
pub fn init_tracing(default_level: &str) {
    static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if env_bool("CONSOLE_SYNC_LOG_FILE") {
        let dir = console_home_dir().join("logs");
        let appender = tracing_appender::rolling::daily(dir, "console-sync.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr.and(writer))
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init();
    }
}
