//! Authenticated session upkeep
//!
//! Probes the main page for an element that only exists while logged in and
//! runs the login form when it is missing. Consecutive login failures are
//! counted over the process lifetime; the counter resets on any success and
//! reaching the ceiling is fatal.

use scraper::{Html, Selector};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::infrastructure::browser::BrowserHandle;
use crate::infrastructure::config::{PollingConfig, SourceConfig};
use crate::infrastructure::parsing::compile_selector;
use crate::infrastructure::sync_error::{SyncError, SyncResult};

pub struct SessionManager {
    browser: BrowserHandle,
    source: SourceConfig,
    max_attempts: u32,
    retry_delay: Duration,
    consecutive_failures: AtomicU32,
    /// Only one caller runs the probe/login flow at a time
    auth_lock: Mutex<()>,
    auth_probe: Selector,
    csrf_input: Selector,
    csrf_meta: Selector,
}

impl SessionManager {
    pub fn new(browser: BrowserHandle, source: &SourceConfig, polling: &PollingConfig) -> SyncResult<Self> {
        Ok(Self {
            browser,
            source: source.clone(),
            max_attempts: polling.max_login_attempts.max(1),
            retry_delay: polling.login_retry_delay(),
            consecutive_failures: AtomicU32::new(0),
            auth_lock: Mutex::new(()),
            auth_probe: compile_selector(&source.auth_probe_selector)
                .map_err(|e| SyncError::Config(format!("source.auth_probe_selector: {e}")))?,
            csrf_input: compile_selector("input[name=\"authenticity_token\"]")?,
            csrf_meta: compile_selector("meta[name=\"csrf-token\"]")?,
        })
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Make sure the shared browser session is logged in.
    ///
    /// - `Ok(true)`: authenticated (possibly after logging in)
    /// - `Ok(false)`: the probe failed transiently; try again next tick. A
    ///   refused session (401/403) is not transient and leads to a login.
    /// - `Err(AuthenticationExhausted)`: the failure ceiling was reached
    pub async fn ensure_authenticated(&self) -> SyncResult<bool> {
        let _guard = self.auth_lock.lock().await;

        match self.probe().await {
            Ok(true) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                return Ok(true);
            }
            Ok(false) => info!("Session is not authenticated, logging in"),
            Err(SyncError::SessionLost) => info!("Source refused the session, logging in"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Authentication probe failed: {}", e);
                return Ok(false);
            }
        }

        loop {
            let attempt = self.consecutive_failures() + 1;
            if attempt > self.max_attempts {
                return Err(self.exhausted());
            }

            match self.login().await {
                Ok(true) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    info!("Login succeeded (attempt {}/{})", attempt, self.max_attempts);
                    return Ok(true);
                }
                Ok(false) => warn!("Login attempt {}/{} was rejected", attempt, self.max_attempts),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Login attempt {}/{} failed: {}", attempt, self.max_attempts, e),
            }

            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= self.max_attempts {
                return Err(self.exhausted());
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    fn exhausted(&self) -> SyncError {
        let attempts = self.consecutive_failures();
        error!("Giving up after {} consecutive failed logins", attempts);
        SyncError::AuthenticationExhausted { attempts }
    }

    async fn probe(&self) -> SyncResult<bool> {
        let document = self.browser.navigate(&self.source.home_url()).await?;
        Ok(self.is_authenticated_page(&document))
    }

    async fn login(&self) -> SyncResult<bool> {
        let login_url = self.source.login_url();
        let login_page = self.browser.navigate(&login_url).await?;
        if self.is_authenticated_page(&login_page) {
            debug!("Login page reports an existing session");
            return Ok(true);
        }

        let mut fields = Vec::with_capacity(4);
        match self.csrf_token(&login_page) {
            Some(token) => fields.push(("authenticity_token".to_string(), token)),
            None => debug!("Login page carries no CSRF token"),
        }
        fields.push(("user[email]".to_string(), self.source.email.clone()));
        fields.push(("user[password]".to_string(), self.source.password.clone()));
        fields.push(("user[remember_me]".to_string(), "1".to_string()));

        self.browser.submit_form(&login_url, fields).await?;
        self.probe().await
    }

    fn is_authenticated_page(&self, document: &str) -> bool {
        Html::parse_document(document)
            .select(&self.auth_probe)
            .next()
            .is_some()
    }

    fn csrf_token(&self, document: &str) -> Option<String> {
        let html = Html::parse_document(document);
        let token = html
            .select(&self.csrf_input)
            .find_map(|el| el.value().attr("value"))
            .or_else(|| html.select(&self.csrf_meta).find_map(|el| el.value().attr("content")))
            .map(ToString::to_string);
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeSite, source_config};

    fn polling(max_login_attempts: u32) -> PollingConfig {
        PollingConfig {
            max_login_attempts,
            login_retry_delay_ms: 1,
            ..PollingConfig::default()
        }
    }

    fn manager(site: &FakeSite, attempts: u32) -> SessionManager {
        let (browser, _worker) = BrowserHandle::spawn(site.session());
        SessionManager::new(browser, &source_config(), &polling(attempts)).unwrap()
    }

    #[tokio::test]
    async fn already_authenticated_needs_no_login() {
        let site = FakeSite::new(true);
        site.with(|s| s.logged_in = true);
        let session = manager(&site, 3);

        assert!(session.ensure_authenticated().await.unwrap());
        assert_eq!(site.with(|s| s.logins), 0);
    }

    #[tokio::test]
    async fn logs_in_with_csrf_token_when_logged_out() {
        let site = FakeSite::new(true);
        let session = manager(&site, 3);

        assert!(session.ensure_authenticated().await.unwrap());
        assert_eq!(site.with(|s| s.logins), 1);
        assert!(site.with(|s| s.logged_in));
        assert_eq!(session.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn rejected_credentials_exhaust_after_ceiling() {
        let site = FakeSite::new(false);
        let session = manager(&site, 3);

        let err = session.ensure_authenticated().await.unwrap_err();

        assert!(matches!(err, SyncError::AuthenticationExhausted { attempts: 3 }));
        assert!(err.is_fatal());
        assert_eq!(site.with(|s| s.logins), 3);
    }

    #[tokio::test]
    async fn transient_probe_failure_skips_without_counting() {
        let site = FakeSite::new(true);
        site.with(|s| {
            s.fail_once.insert(format!("{}/", crate::test_utils::BASE_URL));
        });
        let session = manager(&site, 3);

        assert!(!session.ensure_authenticated().await.unwrap());
        assert_eq!(session.consecutive_failures(), 0);
        assert!(session.ensure_authenticated().await.unwrap());
    }

    #[tokio::test]
    async fn refused_session_on_probe_triggers_login() {
        let site = FakeSite::new(true);
        site.with(|s| s.refuse_when_logged_out = true);
        let session = manager(&site, 3);

        assert!(session.ensure_authenticated().await.unwrap());
        assert_eq!(site.with(|s| s.logins), 1);
        assert_eq!(session.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn refused_session_with_bad_credentials_reaches_ceiling() {
        let site = FakeSite::new(false);
        site.with(|s| s.refuse_when_logged_out = true);
        let session = manager(&site, 2);

        let err = session.ensure_authenticated().await.unwrap_err();

        assert!(matches!(err, SyncError::AuthenticationExhausted { attempts: 2 }));
        assert_eq!(site.with(|s| s.logins), 2);
    }

    #[tokio::test]
    async fn success_resets_the_failure_counter() {
        let site = FakeSite::new(false);
        let session = manager(&site, 3);
        // The login page fails once, then credentials are accepted
        site.with(|s| {
            s.fail_once.insert(format!("{}/users/sign_in", crate::test_utils::BASE_URL));
            s.accept_credentials = true;
        });

        assert!(session.ensure_authenticated().await.unwrap());
        assert_eq!(session.consecutive_failures(), 0);
        assert_eq!(site.with(|s| s.logins), 1);
    }
}
