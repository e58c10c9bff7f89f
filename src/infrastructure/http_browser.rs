//! Cookie-keeping HTTP implementation of [`BrowserSession`]
//!
//! The "rendered page" is the HTML document served for a URL. Cookies set
//! by the login form persist in the client's cookie store.

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::infrastructure::browser::BrowserSession;
use crate::infrastructure::config::SourceConfig;
use crate::infrastructure::parsing_error::ParsingError;
use crate::infrastructure::sync_error::{SyncError, SyncResult};

/// Configuration for HTTP client behavior
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    pub user_agent: String,
    /// Whether to follow redirects
    pub follow_redirects: bool,
}

impl HttpClientConfig {
    pub fn from_source_config(source: &SourceConfig) -> Self {
        Self {
            timeout_seconds: source.request_timeout_seconds,
            user_agent: source.user_agent.clone(),
            follow_redirects: true,
        }
    }
}

pub struct HttpBrowserSession {
    client: Client,
    current_url: Option<String>,
}

impl HttpBrowserSession {
    pub fn with_config(config: &HttpClientConfig) -> SyncResult<Self> {
        let client = ClientBuilder::new()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(&config.user_agent)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            })
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            current_url: None,
        })
    }

    pub fn from_source_config(source: &SourceConfig) -> SyncResult<Self> {
        Self::with_config(&HttpClientConfig::from_source_config(source))
    }

    /// Current page, if any page was loaded yet
    pub fn current_url(&self) -> Option<&str> {
        self.current_url.as_deref()
    }

    async fn read_document(&mut self, url: &str, response: Response) -> SyncResult<String> {
        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(SyncError::SessionLost);
        }
        if !status.is_success() {
            return Err(SyncError::navigation(url, format!("HTTP {status}")));
        }

        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::navigation(url, format!("Failed to read response body: {e}")))?;
        if body.is_empty() {
            return Err(SyncError::navigation(url, "Empty response"));
        }

        debug!("Loaded {} ({} bytes)", final_url, body.len());
        self.current_url = Some(final_url);
        Ok(body)
    }
}

#[async_trait]
impl BrowserSession for HttpBrowserSession {
    async fn navigate(&mut self, url: &str) -> SyncResult<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::navigation(url, e))?;
        self.read_document(url, response).await
    }

    async fn submit_form(&mut self, url: &str, fields: Vec<(String, String)>) -> SyncResult<String> {
        let response = self
            .client
            .post(url)
            .form(&fields)
            .send()
            .await
            .map_err(|e| SyncError::navigation(url, e))?;
        self.read_document(url, response).await
    }

    async fn fetch_json(&mut self, url: &str) -> SyncResult<Value> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| SyncError::navigation(url, e))?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(SyncError::SessionLost);
        }
        if !status.is_success() {
            return Err(SyncError::navigation(url, format!("HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SyncError::navigation(url, format!("Failed to read response body: {e}")))?;
        serde_json::from_str(&body).map_err(|e| {
            SyncError::Parsing(ParsingError::UnexpectedPayload {
                message: format!("{url}: {e}"),
            })
        })
    }

    async fn reload(&mut self) -> SyncResult<String> {
        let url = self
            .current_url
            .clone()
            .ok_or_else(|| SyncError::navigation("about:blank", "No page loaded yet"))?;
        info!("Reloading {}", url);
        self.navigate(&url).await
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.current_url = None;
        Ok(())
    }
}
