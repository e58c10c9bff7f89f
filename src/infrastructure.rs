//! Infrastructure layer: storage, browser session, parsing, live fan-out and HTTP
//!
//! Everything that touches the outside world lives here; the application
//! layer only sees these types through their async methods.

pub mod alliance_repository;
pub mod browser;
pub mod config;
pub mod database_connection;
pub mod http_browser;
pub mod http_server;
pub mod incident_repository;
pub mod live_broadcaster;
pub mod logging;
pub mod parsing;
pub mod parsing_error;
pub mod sync_error;

// Re-export commonly used items
pub use alliance_repository::AllianceRepository;
pub use browser::{BrowserHandle, BrowserSession};
pub use config::{AppConfig, ConfigManager};
pub use database_connection::DatabaseConnection;
pub use http_browser::{HttpBrowserSession, HttpClientConfig};
pub use http_server::AppState;
pub use incident_repository::IncidentRepository;
pub use live_broadcaster::{LiveBroadcaster, Subscription};
pub use logging::{get_log_directory, init_logging, init_logging_with_config};
pub use parsing::{MissionDetailParser, MissionListParser};
pub use parsing_error::ParsingError;
pub use sync_error::{SyncError, SyncResult};
