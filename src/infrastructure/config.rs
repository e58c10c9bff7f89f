//! Configuration infrastructure
//!
//! Configuration is a JSON file under the user config directory, created with
//! defaults on first run, with environment overrides layered on top:
//! `INCIDENT_SYNC__SOURCE__PASSWORD=...`, `INCIDENT_SYNC__POLLING__PRIMARY_INTERVAL_SECS=15`.

#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::info;

/// Environment variable that points at an explicit config file
pub const CONFIG_PATH_ENV: &str = "INCIDENT_SYNC_CONFIG";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "INCIDENT_SYNC";

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// External source and its credentials
    pub source: SourceConfig,

    /// Poll intervals and login ceiling
    pub polling: PollingConfig,

    /// Retention horizons of the daily sweep
    pub retention: RetentionConfig,

    /// Live stream / ingest HTTP surface
    pub live: LiveConfig,

    /// Member-facing output filtering
    pub members: MemberConfig,

    pub database: DatabaseConfig,

    pub logging: LoggingConfig,
}

/// External source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Base URL of the source, e.g. `https://www.leitstellenspiel.de`
    pub base_url: String,

    pub email: String,

    pub password: String,

    /// Page that carries the mission lists
    pub home_path: String,

    pub login_path: String,

    /// Detail page template; `{id}` is replaced by the external id
    pub mission_detail_path: String,

    /// JSON endpoint with alliance stats and members
    pub alliance_info_path: String,

    /// Element only present while logged in
    pub auth_probe_selector: String,

    pub request_timeout_seconds: u64,

    pub user_agent: String,
}

/// Poll scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub primary_interval_secs: u64,

    pub alliance_stats_interval_secs: u64,

    pub members_interval_secs: u64,

    /// Consecutive failed logins before the scheduler gives up
    pub max_login_attempts: u32,

    pub login_retry_delay_ms: u64,
}

/// Retention / aggregation sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Incidents not seen for this long are removed
    pub incident_horizon_days: i64,

    /// Activity log rows older than this are removed
    pub activity_horizon_days: i64,

    /// Stat rows older than this are collapsed to one row per org and day
    pub stats_downsample_after_days: i64,

    /// Local wall-clock hour of the daily run (0-23)
    pub run_at_hour: u32,
}

/// Live-update and ingest surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub bind_address: String,

    pub heartbeat_interval_secs: u64,

    /// Upper bound for one write to one subscriber
    pub sink_timeout_ms: u64,

    /// Buffered events per subscriber
    pub sink_buffer: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberConfig {
    /// Member ids or names omitted from member-facing outputs
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx URL; empty means `<app data dir>/database/incidents.db`
    pub url: String,

    pub max_connections: u32,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted logs
    pub json_format: bool,

    /// Enable console output
    pub console_output: bool,

    /// Enable file output
    pub file_output: bool,

    /// Number of log files to keep (older files will be deleted)
    pub max_files: u32,

    /// Enable automatic log cleanup on startup
    pub auto_cleanup_logs: bool,

    /// Module-specific log level filters (e.g., "sqlx": "warn", "reqwest": "info")
    pub module_filters: HashMap<String, String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::BASE_URL.to_string(),
            email: String::new(),
            password: String::new(),
            home_path: defaults::HOME_PATH.to_string(),
            login_path: defaults::LOGIN_PATH.to_string(),
            mission_detail_path: defaults::MISSION_DETAIL_PATH.to_string(),
            alliance_info_path: defaults::ALLIANCE_INFO_PATH.to_string(),
            auth_probe_selector: defaults::AUTH_PROBE_SELECTOR.to_string(),
            request_timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
            user_agent: defaults::USER_AGENT.to_string(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            primary_interval_secs: defaults::PRIMARY_INTERVAL_SECS,
            alliance_stats_interval_secs: defaults::ALLIANCE_STATS_INTERVAL_SECS,
            members_interval_secs: defaults::MEMBERS_INTERVAL_SECS,
            max_login_attempts: defaults::MAX_LOGIN_ATTEMPTS,
            login_retry_delay_ms: defaults::LOGIN_RETRY_DELAY_MS,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            incident_horizon_days: defaults::INCIDENT_HORIZON_DAYS,
            activity_horizon_days: defaults::ACTIVITY_HORIZON_DAYS,
            stats_downsample_after_days: defaults::STATS_DOWNSAMPLE_AFTER_DAYS,
            run_at_hour: defaults::RETENTION_RUN_AT_HOUR,
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            bind_address: defaults::BIND_ADDRESS.to_string(),
            heartbeat_interval_secs: defaults::HEARTBEAT_INTERVAL_SECS,
            sink_timeout_ms: defaults::SINK_TIMEOUT_MS,
            sink_buffer: defaults::SINK_BUFFER,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: defaults::DB_MAX_CONNECTIONS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            max_files: defaults::LOG_MAX_FILES,
            auto_cleanup_logs: defaults::LOG_AUTO_CLEANUP,
            module_filters: {
                let mut filters = HashMap::new();
                filters.insert("sqlx".to_string(), "warn".to_string());
                filters.insert("reqwest".to_string(), "info".to_string());
                filters.insert("hyper".to_string(), "warn".to_string());
                filters.insert("axum".to_string(), "info".to_string());
                filters.insert("tokio".to_string(), "info".to_string());
                filters
            },
        }
    }
}

impl SourceConfig {
    /// Resolve a path or absolute URL against `base_url`
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        }
    }

    pub fn home_url(&self) -> String {
        self.url(&self.home_path)
    }

    pub fn login_url(&self) -> String {
        self.url(&self.login_path)
    }

    pub fn mission_detail_url(&self, external_id: &str) -> String {
        self.url(&self.mission_detail_path.replace("{id}", external_id))
    }

    pub fn alliance_info_url(&self) -> String {
        self.url(&self.alliance_info_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl PollingConfig {
    pub fn primary_interval(&self) -> Duration {
        Duration::from_secs(self.primary_interval_secs)
    }

    pub fn alliance_stats_interval(&self) -> Duration {
        Duration::from_secs(self.alliance_stats_interval_secs)
    }

    pub fn members_interval(&self) -> Duration {
        Duration::from_secs(self.members_interval_secs)
    }

    pub fn login_retry_delay(&self) -> Duration {
        Duration::from_millis(self.login_retry_delay_ms)
    }
}

impl LiveConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}

impl AppConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        match url::Url::parse(self.source.base_url.trim()) {
            Ok(base) if matches!(base.scheme(), "http" | "https") => {}
            Ok(base) => problems.push(format!(
                "source.base_url must use http or https, got {}",
                base.scheme()
            )),
            Err(e) => problems.push(format!("source.base_url is not a valid URL: {}", e)),
        }
        for (name, value) in [
            ("polling.primary_interval_secs", self.polling.primary_interval_secs),
            ("polling.alliance_stats_interval_secs", self.polling.alliance_stats_interval_secs),
            ("polling.members_interval_secs", self.polling.members_interval_secs),
            ("live.heartbeat_interval_secs", self.live.heartbeat_interval_secs),
            ("live.sink_timeout_ms", self.live.sink_timeout_ms),
        ] {
            if value == 0 {
                problems.push(format!("{} must be greater than zero", name));
            }
        }
        if self.polling.max_login_attempts == 0 {
            problems.push("polling.max_login_attempts must be at least 1".to_string());
        }
        if self.live.sink_buffer == 0 {
            problems.push("live.sink_buffer must be at least 1".to_string());
        }
        for (name, days) in [
            ("retention.incident_horizon_days", self.retention.incident_horizon_days),
            ("retention.activity_horizon_days", self.retention.activity_horizon_days),
            ("retention.stats_downsample_after_days", self.retention.stats_downsample_after_days),
        ] {
            if !(1..=defaults::MAX_RETENTION_DAYS).contains(&days) {
                problems.push(format!(
                    "{} must be within 1..={}, got {}",
                    name,
                    defaults::MAX_RETENTION_DAYS,
                    days
                ));
            }
        }
        if self.retention.run_at_hour > 23 {
            problems.push(format!(
                "retention.run_at_hour must be within 0..=23, got {}",
                self.retention.run_at_hour
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Invalid configuration: {}", problems.join("; ")))
        }
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("incident-sync");

        Ok(config_dir)
    }

    /// Get application data directory
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join("incident-sync");

        Ok(data_dir)
    }

    /// Config manager for the default location, or `INCIDENT_SYNC_CONFIG` when set
    pub fn new() -> Result<Self> {
        let config_path = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => PathBuf::from(path),
            None => Self::get_config_dir()?.join("incident_sync_config.json"),
        };

        Ok(Self { config_path })
    }

    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Load the file (creating it with defaults on first run) plus environment overrides
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("🎉 Configuration file not found, creating default: {:?}", self.config_path);
            self.save_config(&AppConfig::default()).await?;
        }

        let settings = config::Config::builder()
            .add_source(
                config::File::from(self.config_path.as_path())
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("members.excluded"),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {:?}", self.config_path))?;

        let mut app_config: AppConfig = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        if app_config.database.url.is_empty() {
            app_config.database.url = Self::default_database_url();
        }

        app_config.validate()?;
        info!("Loaded configuration from: {:?}", self.config_path);
        Ok(app_config)
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn default_database_url() -> String {
        let data_dir = Self::get_app_data_dir().unwrap_or_else(|_| PathBuf::from("."));
        let db_path = data_dir.join("database").join("incidents.db");
        format!("sqlite:{}", db_path.display())
    }
}

/// Default configuration values
pub mod defaults {
    pub const BASE_URL: &str = "https://www.leitstellenspiel.de";
    pub const HOME_PATH: &str = "/";
    pub const LOGIN_PATH: &str = "/users/sign_in";
    pub const MISSION_DETAIL_PATH: &str = "/missions/{id}";
    pub const ALLIANCE_INFO_PATH: &str = "/api/allianceinfo";
    pub const AUTH_PROBE_SELECTOR: &str = "a[href=\"/users/sign_out\"]";
    pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;
    pub const USER_AGENT: &str = "incident-sync/0.2 (+unattended mission tracker)";

    /// Primary mission sync every 10 seconds
    pub const PRIMARY_INTERVAL_SECS: u64 = 10;

    /// Alliance stat snapshot every 5 minutes
    pub const ALLIANCE_STATS_INTERVAL_SECS: u64 = 300;

    /// Member presence every minute
    pub const MEMBERS_INTERVAL_SECS: u64 = 60;

    pub const MAX_LOGIN_ATTEMPTS: u32 = 3;
    pub const LOGIN_RETRY_DELAY_MS: u64 = 2000;

    pub const INCIDENT_HORIZON_DAYS: i64 = 7;
    pub const ACTIVITY_HORIZON_DAYS: i64 = 30;
    pub const STATS_DOWNSAMPLE_AFTER_DAYS: i64 = 7;
    pub const MAX_RETENTION_DAYS: i64 = 36_500;
    pub const RETENTION_RUN_AT_HOUR: u32 = 4;

    pub const BIND_ADDRESS: &str = "0.0.0.0:3000";
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
    pub const SINK_TIMEOUT_MS: u64 = 2000;
    pub const SINK_BUFFER: usize = 256;

    pub const DB_MAX_CONNECTIONS: u32 = 5;

    // Log configuration defaults
    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = true;
    pub const LOG_MAX_FILES: u32 = 5;
    pub const LOG_AUTO_CLEANUP: bool = true;
}
