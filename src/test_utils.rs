//! Test utilities for incident-sync
//!
//! Provides a throwaway SQLite database and a scripted stand-in for the
//! external site that behaves like the real one: a login form, an
//! authenticated main page with mission lists, detail pages and the
//! alliance JSON endpoint.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::infrastructure::browser::BrowserSession;
use crate::infrastructure::config::SourceConfig;
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::sync_error::{SyncError, SyncResult};

pub const BASE_URL: &str = "https://site.test";

/// Test database in its own temporary directory
pub struct TestDatabase {
    _dir: TempDir,
    pub connection: DatabaseConnection,
}

impl TestDatabase {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("test.db").display());
        let connection = DatabaseConnection::new(&url).await.unwrap();
        connection.migrate().await.unwrap();
        Self { _dir: dir, connection }
    }

    pub fn pool(&self) -> SqlitePool {
        self.connection.pool().clone()
    }
}

pub fn source_config() -> SourceConfig {
    SourceConfig {
        base_url: BASE_URL.to_string(),
        email: "dispatcher@example.org".to_string(),
        password: "secret".to_string(),
        ..SourceConfig::default()
    }
}

/// Mutable state of the scripted site
#[derive(Default)]
pub struct SiteState {
    pub logged_in: bool,
    pub accept_credentials: bool,
    /// Inner HTML of the page body when logged in
    pub mission_lists: String,
    pub detail_pages: HashMap<String, String>,
    pub alliance_info: Value,
    /// URLs whose next request fails with a navigation error
    pub fail_once: HashSet<String>,
    /// Answer pages other than the login form with 401/403 while logged out
    pub refuse_when_logged_out: bool,
    pub requests: Vec<String>,
    pub logins: usize,
    pub closed: bool,
}

#[derive(Clone, Default)]
pub struct FakeSite {
    pub state: Arc<Mutex<SiteState>>,
}

impl FakeSite {
    pub fn new(accept_credentials: bool) -> Self {
        let site = Self::default();
        site.state.lock().unwrap().accept_credentials = accept_credentials;
        site
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SiteState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn session(&self) -> Box<dyn BrowserSession> {
        Box::new(FakeSession {
            site: self.clone(),
            current_url: None,
        })
    }

    pub fn requests_to(&self, path: &str) -> usize {
        let url = format!("{BASE_URL}{path}");
        self.with(|s| s.requests.iter().filter(|r| **r == url).count())
    }
}

pub struct FakeSession {
    site: FakeSite,
    current_url: Option<String>,
}

impl FakeSession {
    fn render(&self, url: &str) -> SyncResult<String> {
        self.site.with(|s| {
            s.requests.push(url.to_string());
            if s.fail_once.remove(url) {
                return Err(SyncError::navigation(url, "scripted failure"));
            }

            let path = url.strip_prefix(BASE_URL).unwrap_or(url);
            if path == "/users/sign_in" {
                return Ok(r#"<html><form><input type="hidden" name="authenticity_token" value="tok123"></form></html>"#.to_string());
            }
            if !s.logged_in && s.refuse_when_logged_out {
                return Err(SyncError::SessionLost);
            }
            if !s.logged_in {
                return Ok("<html><body><a href=\"/users/sign_in\">Login</a></body></html>".to_string());
            }
            if path == "/" {
                return Ok(format!(
                    r#"<html><body><a href="/users/sign_out">Logout</a>{}</body></html>"#,
                    s.mission_lists
                ));
            }
            if let Some(id) = path.strip_prefix("/missions/") {
                return s
                    .detail_pages
                    .get(id)
                    .cloned()
                    .ok_or_else(|| SyncError::navigation(url, "HTTP 404 Not Found"));
            }
            Err(SyncError::navigation(url, "HTTP 404 Not Found"))
        })
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&mut self, url: &str) -> SyncResult<String> {
        let page = self.render(url)?;
        self.current_url = Some(url.to_string());
        Ok(page)
    }

    async fn submit_form(&mut self, url: &str, fields: Vec<(String, String)>) -> SyncResult<String> {
        self.site.with(|s| {
            s.requests.push(url.to_string());
            s.logins += 1;
            let has_token = fields.iter().any(|(k, v)| k == "authenticity_token" && v == "tok123");
            let has_password = fields.iter().any(|(k, v)| k == "user[password]" && !v.is_empty());
            if s.accept_credentials && has_token && has_password {
                s.logged_in = true;
            }
        });
        self.navigate(&format!("{BASE_URL}/")).await
    }

    async fn fetch_json(&mut self, url: &str) -> SyncResult<Value> {
        self.site.with(|s| {
            s.requests.push(url.to_string());
            if s.fail_once.remove(url) {
                return Err(SyncError::navigation(url, "scripted failure"));
            }
            if !s.logged_in {
                return Err(SyncError::SessionLost);
            }
            Ok(s.alliance_info.clone())
        })
    }

    async fn reload(&mut self) -> SyncResult<String> {
        let url = self
            .current_url
            .clone()
            .ok_or_else(|| SyncError::navigation("about:blank", "No page loaded yet"))?;
        self.navigate(&url).await
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.site.with(|s| s.closed = true);
        Ok(())
    }
}

/// One mission sidebar entry in the markup of the main page
pub fn mission_entry(id: &str, color: &str, title: &str) -> String {
    format!(
        r#"<div class="missionSideBarEntry" mission_id="{id}" mission_type_id="1" latitude="50.1" longitude="8.6">
             <div class="mission_panel_{color}">
               <a id="mission_caption_{id}">{title}, <span id="mission_address_{id}">Zeil 1, Frankfurt</span></a>
             </div>
           </div>"#
    )
}

pub fn mission_list(entries: &[String]) -> String {
    format!(r#"<div id="mission_list">{}</div>"#, entries.concat())
}
