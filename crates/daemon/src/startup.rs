//! Startup checks module for autotranscode
//!
//! Provides preflight checks to verify the environment before the daemon
//! starts processing:
//! - A processing command is configured and `sh` can run it
//! - The timeout and output extension are usable
//! - Watched directories exist
//! - The queue directory is writable

use crate::config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("No processing command configured")]
    MissingCommand,

    #[error("Shell not available: {0}")]
    ShellUnavailable(String),

    #[error("Timeout must be positive, got {0} hours")]
    InvalidTimeout(f64),

    #[error("Invalid output extension '{0}'")]
    InvalidExtension(String),

    #[error("Watch directory '{}' is not a directory", .0.display())]
    WatchDirectory(PathBuf),

    #[error("Queue directory '{path}' is not writable: {source}")]
    QueueDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Require a non-blank processing command.
pub fn check_command_configured(cfg: &Config) -> Result<(), StartupError> {
    if cfg.processing.command.trim().is_empty() {
        return Err(StartupError::MissingCommand);
    }
    Ok(())
}

/// Check that `sh -c true` runs; every job command goes through it.
pub fn check_shell_available() -> Result<(), StartupError> {
    let status = Command::new("sh")
        .arg("-c")
        .arg("true")
        .status()
        .map_err(|e| StartupError::ShellUnavailable(format!("failed to run sh: {}", e)))?;

    if !status.success() {
        return Err(StartupError::ShellUnavailable(format!(
            "sh -c true exited with {}",
            status
        )));
    }
    Ok(())
}

pub fn check_timeout(cfg: &Config) -> Result<(), StartupError> {
    let hours = cfg.processing.timeout_hours;
    if !hours.is_finite() || hours <= 0.0 {
        return Err(StartupError::InvalidTimeout(hours));
    }
    Ok(())
}

/// The extension must be a bare suffix such as `mp4`.
pub fn check_output_extension(cfg: &Config) -> Result<(), StartupError> {
    let ext = &cfg.processing.output_extension;
    let valid = !ext.is_empty()
        && ext
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(StartupError::InvalidExtension(ext.clone()));
    }
    Ok(())
}

pub fn check_watch_directories(cfg: &Config) -> Result<(), StartupError> {
    match cfg.watch.directories.iter().find(|dir| !dir.is_dir()) {
        Some(dir) => Err(StartupError::WatchDirectory(dir.clone())),
        None => Ok(()),
    }
}

/// Create the store directory and prove a file can be written in it.
pub fn check_queue_directory(store_dir: &Path) -> Result<(), StartupError> {
    let io_err = |source| StartupError::QueueDirectory {
        path: store_dir.to_path_buf(),
        source,
    };

    fs::create_dir_all(store_dir).map_err(io_err)?;
    let probe = store_dir.join(".write-probe");
    fs::write(&probe, b"").map_err(io_err)?;
    fs::remove_file(&probe).map_err(io_err)?;
    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. Command configured
/// 2. Shell availability
/// 3. Timeout and output extension
/// 4. Watch directories
/// 5. Queue directory
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_command_configured(cfg)?;
    check_shell_available()?;
    check_timeout(cfg)?;
    check_output_extension(cfg)?;
    check_watch_directories(cfg)?;
    check_queue_directory(&cfg.queue.store_dir())?;
    Ok(())
}
