//! Error taxonomy of the synchronization pipeline
//!
//! - transient external-source errors: logged, the cycle continues or the tick is skipped
//! - session loss: handled by a bounded re-login
//! - authentication exhaustion: fatal, stops the scheduler
//! - persistence errors: abort the current cycle, the next tick retries

use thiserror::Error;

use super::parsing_error::ParsingError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error(transparent)]
    Parsing(#[from] ParsingError),

    #[error("Authenticated session lost")]
    SessionLost,

    #[error("Authentication failed {attempts} times in a row, giving up")]
    AuthenticationExhausted { attempts: u32 },

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Browser handle is closed")]
    BrowserClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn navigation(url: &str, message: impl ToString) -> Self {
        Self::Navigation {
            url: url.to_string(),
            message: message.to_string(),
        }
    }

    /// Errors that must stop the scheduler
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationExhausted { .. } | Self::BrowserClosed | Self::Config(_)
        )
    }

    /// Errors that only skip the current item or tick
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Navigation { .. } | Self::Parsing(_) | Self::SessionLost)
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
