//! File logging. Nothing is written to the terminal so agent output stays
//! clean; set `RUST_LOG=debug` for command lines and state transitions.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const APP_DIR: &str = "agentcage";
const LOG_FILE: &str = "agentcage.log";

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn init() -> Result<()> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let state_home = std::env::var_os("XDG_STATE_HOME").map(PathBuf::from);
    let log_path = match log_path(state_home.as_deref(), home::home_dir().as_deref()) {
        Some(path) => path,
        None => std::env::current_dir()?.join(LOG_FILE),
    };
    let (directory, file_name) = split_path(&log_path)?;
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create log directory at {}", directory.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(rolling::never(directory, file_name));
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")
}

/// `$XDG_STATE_HOME/agentcage/agentcage.log`, else
/// `~/.local/state/agentcage/agentcage.log`.
fn log_path(state_home: Option<&Path>, home: Option<&Path>) -> Option<PathBuf> {
    if let Some(state_home) = state_home
        && !state_home.as_os_str().is_empty()
    {
        return Some(state_home.join(APP_DIR).join(LOG_FILE));
    }
    home.map(|home| home.join(".local").join("state").join(APP_DIR).join(LOG_FILE))
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name"))?;
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((dir, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_prefers_xdg_state_home() {
        let path = log_path(Some(Path::new("/state")), Some(Path::new("/home/me")));
        assert_eq!(path, Some(PathBuf::from("/state/agentcage/agentcage.log")));
    }

    #[test]
    fn test_log_path_falls_back_to_home() {
        let expected = PathBuf::from("/home/me/.local/state/agentcage/agentcage.log");
        assert_eq!(log_path(None, Some(Path::new("/home/me"))), Some(expected.clone()));
        assert_eq!(log_path(Some(Path::new("")), Some(Path::new("/home/me"))), Some(expected));
        assert_eq!(log_path(None, None), None);
    }

    #[test]
    fn test_split_path() {
        let (dir, file) = split_path(Path::new("/state/agentcage/agentcage.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/state/agentcage"));
        assert_eq!(file, "agentcage.log");
    }
}
