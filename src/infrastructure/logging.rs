//! Logging system configuration and initialization
//!
//! - Console and file output (file writer is non-blocking)
//! - Level and per-module filters from the config file, `RUST_LOG` wins when set
//! - Optional JSON format for the file layer
//! - Log files stored next to the executable, previous file rotated on start

#![allow(clippy::uninlined_format_args)]

use anyhow::{Result, anyhow};
use chrono::Local;
use lazy_static::lazy_static;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{Subscriber, info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;

const LOG_FILE_NAME: &str = "incident-sync.log";

// Keeps the non-blocking writer alive for the process lifetime
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> =
        Mutex::new(Vec::new());
}

/// Local wall-clock timestamps; the retention sweep is scheduled in local time too
struct LocalTimeFormatter;

impl FormatTime for LocalTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f %:z"))
    }
}

/// Get the log directory relative to the executable location
pub fn get_log_directory() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    exe_dir.join("logs")
}

/// Initialize the logging system with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(LoggingConfig::default())
}

/// Build the filter: `RUST_LOG` if present, otherwise level + module filters
fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| anyhow!("Invalid log level '{}': {}", config.level, e))?;

    // Dependencies stay quiet unless TRACE is requested explicitly
    if !config.level.to_lowercase().contains("trace") {
        for (module, level) in &config.module_filters {
            match format!("{}={}", module, level).parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => warn!("Ignoring log filter {}={}: {}", module, level, e),
            }
        }
    }

    Ok(filter)
}

/// Rotate an existing log file by renaming it with its modification timestamp
fn rotate_existing_log_file(log_dir: &Path, log_file_name: &str) -> Result<()> {
    let log_file_path = log_dir.join(log_file_name);
    if !log_file_path.exists() {
        return Ok(());
    }

    let metadata = std::fs::metadata(&log_file_path)
        .map_err(|e| anyhow!("Failed to get log file metadata: {}", e))?;
    let file_time = metadata
        .modified()
        .unwrap_or_else(|_| std::time::SystemTime::now());
    let datetime: chrono::DateTime<Local> = file_time.into();

    let file_stem = log_file_name.trim_end_matches(".log");
    let timestamped_name = format!("{}.{}.log", file_stem, datetime.format("%Y%m%dT%H%M%S"));
    let timestamped_path = log_dir.join(&timestamped_name);

    std::fs::rename(&log_file_path, &timestamped_path).map_err(|e| {
        anyhow!(
            "Failed to rotate log file {} to {}: {}",
            log_file_path.display(),
            timestamped_path.display(),
            e
        )
    })?;

    Ok(())
}

/// Initialize logging with custom configuration
///
/// # Environment Variable Override
/// ```bash
/// # Show all SQL queries
/// RUST_LOG="debug,sqlx::query=debug" incident-sync
///
/// # Only errors from dependencies
/// RUST_LOG="info,sqlx=error,reqwest=error,hyper=error" incident-sync
/// ```
pub fn init_logging_with_config(config: LoggingConfig) -> Result<()> {
    let log_dir = get_log_directory();
    let env_filter = build_env_filter(&config)?;
    let registry = Registry::default().with(env_filter);

    if !config.file_output {
        if !config.console_output {
            return Err(anyhow!("No logging output configured"));
        }
        registry.with(console_layer(true)).try_init()?;
        info!("Logging system initialized (console only), level: {}", config.level);
        return Ok(());
    }

    std::fs::create_dir_all(&log_dir)
        .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;
    rotate_existing_log_file(&log_dir, LOG_FILE_NAME)?;
    if config.auto_cleanup_logs {
        cleanup_old_logs(&log_dir, config.max_files)?;
    }

    let file_appender = rolling::never(&log_dir, LOG_FILE_NAME);
    let (file_writer, file_guard) = non_blocking(file_appender);
    LOG_GUARDS
        .lock()
        .map_err(|_| anyhow!("Log guard registry poisoned"))?
        .push(file_guard);

    if config.json_format {
        let file_layer = fmt::Layer::new()
            .json()
            .with_writer(file_writer)
            .with_timer(LocalTimeFormatter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false);
        registry
            .with(file_layer)
            .with(console_layer(config.console_output))
            .try_init()?;
    } else {
        let file_layer = fmt::Layer::new()
            .with_writer(file_writer)
            .with_timer(LocalTimeFormatter)
            .with_target(true)
            .with_ansi(false);
        registry
            .with(file_layer)
            .with(console_layer(config.console_output))
            .try_init()?;
    }

    info!("Logging system initialized");
    info!("Log directory: {:?}", log_dir);
    info!("Log level: {}", config.level);
    info!("JSON format: {}", config.json_format);
    info!("Console output: {}", config.console_output);

    Ok(())
}

/// Stdout layer, built for whichever subscriber stack it ends up on
fn console_layer<S>(enabled: bool) -> Option<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    enabled.then(|| {
        fmt::Layer::new()
            .with_writer(std::io::stdout)
            .with_timer(LocalTimeFormatter)
            .with_target(false)
    })
}

/// Log system information for diagnostics
pub fn log_system_info() {
    info!("=== Incident Sync System Information ===");
    info!("Application version: {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}", std::env::consts::OS);
    info!("Architecture: {}", std::env::consts::ARCH);
    if let Ok(current_dir) = std::env::current_dir() {
        info!("Working directory: {:?}", current_dir);
    }
    info!("Log directory: {:?}", get_log_directory());
    info!("=========================================");
}

/// Keep the newest `max_files` log files, remove the rest
fn cleanup_old_logs(log_dir: &Path, max_files: u32) -> Result<()> {
    let mut log_files = Vec::new();

    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.ends_with(".log"));
        if !path.is_file() || !is_log {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            log_files.push((path, modified));
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(max_files as usize) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert!(!config.level.is_empty());
        assert!(config.console_output);
        assert!(config.file_output);
    }

    #[test]
    fn test_log_directory_creation() {
        let log_dir = get_log_directory();
        assert!(log_dir.to_string_lossy().ends_with("logs"));
    }

    #[test]
    fn console_layer_stacks_over_a_file_layer() {
        let subscriber = Registry::default()
            .with(EnvFilter::new("info"))
            .with(fmt::Layer::new().with_writer(std::io::sink).with_ansi(false))
            .with(console_layer(true));
        tracing::subscriber::with_default(subscriber, || info!("console and file layers active"));

        let console_only = Registry::default()
            .with(EnvFilter::new("info"))
            .with(console_layer(false));
        tracing::subscriber::with_default(console_only, || info!("console disabled"));
    }

    #[test]
    fn rotation_and_cleanup_keep_newest_files() -> Result<()> {
        let dir = tempdir()?;
        for name in ["a.log", "b.log", "c.log", "notes.txt"] {
            std::fs::write(dir.path().join(name), name)?;
        }
        std::fs::write(dir.path().join(LOG_FILE_NAME), "current")?;

        rotate_existing_log_file(dir.path(), LOG_FILE_NAME)?;
        assert!(!dir.path().join(LOG_FILE_NAME).exists());

        cleanup_old_logs(dir.path(), 2)?;
        let remaining_logs = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".log"))
            .count();
        assert_eq!(remaining_logs, 2);
        assert!(dir.path().join("notes.txt").exists());
        Ok(())
    }
}
