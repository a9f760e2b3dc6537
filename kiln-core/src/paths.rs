//! Path helpers shared by the CLI and core.

use std::path::PathBuf;

/// Directory containing the running executable, or "." when it cannot be
/// resolved. Carried in terminal state events.
pub fn exe_dir() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_string_lossy().to_string()))
        .unwrap_or_else(|| ".".to_string())
}

/// Location of the Docker CLI credential store.
///
/// Resolution order:
/// 1. `DOCKER_CONFIG` environment variable
/// 2. `~/.docker/config.json`
pub fn docker_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }

    dirs::home_dir().map(|h| h.join(".docker").join("config.json"))
}

/// Default run-report location for a command.
pub fn default_report_path(command: &str) -> String {
    format!("{}.report.json", command)
}
