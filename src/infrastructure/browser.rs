//! Browser capability and the single operation queue in front of it
//!
//! The authenticated session is one shared resource. It is owned by a single
//! worker task; everything else talks to it through a cloneable
//! [`BrowserHandle`] that sends commands over an mpsc channel and awaits a
//! oneshot reply. Operations are therefore executed strictly one at a time,
//! in the order they were submitted.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::infrastructure::sync_error::{SyncError, SyncResult};

/// Queue depth of pending browser operations
const COMMAND_BUFFER: usize = 32;

/// "Render page, read DOM, submit form, navigate"
#[async_trait]
pub trait BrowserSession: Send {
    /// Load a page and return its document
    async fn navigate(&mut self, url: &str) -> SyncResult<String>;

    /// Post a form and return the document the server answered with
    async fn submit_form(&mut self, url: &str, fields: Vec<(String, String)>) -> SyncResult<String>;

    /// Fetch a JSON endpoint with the session's cookies
    async fn fetch_json(&mut self, url: &str) -> SyncResult<Value>;

    /// Reload the current page
    async fn reload(&mut self) -> SyncResult<String>;

    async fn close(&mut self) -> SyncResult<()>;
}

type Reply<T> = oneshot::Sender<SyncResult<T>>;

/// One queued operation
pub enum BrowserCommand {
    Navigate { url: String, reply: Reply<String> },
    SubmitForm { url: String, fields: Vec<(String, String)>, reply: Reply<String> },
    FetchJson { url: String, reply: Reply<Value> },
    Reload { reply: Reply<String> },
    Shutdown { reply: oneshot::Sender<()> },
}

impl BrowserCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::SubmitForm { .. } => "submit_form",
            Self::FetchJson { .. } => "fetch_json",
            Self::Reload { .. } => "reload",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

/// Cloneable front of the browser worker
#[derive(Clone)]
pub struct BrowserHandle {
    sender: mpsc::Sender<BrowserCommand>,
}

impl BrowserHandle {
    /// Move the session into its worker task
    pub fn spawn(session: Box<dyn BrowserSession>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        let worker = tokio::spawn(run_worker(session, receiver));
        (Self { sender }, worker)
    }

    pub async fn navigate(&self, url: &str) -> SyncResult<String> {
        let url = url.to_string();
        self.request(|reply| BrowserCommand::Navigate { url, reply }).await
    }

    pub async fn submit_form(&self, url: &str, fields: Vec<(String, String)>) -> SyncResult<String> {
        let url = url.to_string();
        self.request(|reply| BrowserCommand::SubmitForm { url, fields, reply })
            .await
    }

    pub async fn fetch_json(&self, url: &str) -> SyncResult<Value> {
        let url = url.to_string();
        self.request(|reply| BrowserCommand::FetchJson { url, reply }).await
    }

    pub async fn reload(&self) -> SyncResult<String> {
        self.request(|reply| BrowserCommand::Reload { reply }).await
    }

    /// Close the session and stop the worker. Later calls fail with `BrowserClosed`.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.sender.send(BrowserCommand::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> BrowserCommand) -> SyncResult<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(command(reply))
            .await
            .map_err(|_| SyncError::BrowserClosed)?;
        response.await.map_err(|_| SyncError::BrowserClosed)?
    }
}

async fn run_worker(mut session: Box<dyn BrowserSession>, mut receiver: mpsc::Receiver<BrowserCommand>) {
    info!("Browser worker started");

    while let Some(command) = receiver.recv().await {
        debug!("Browser operation: {}", command.name());
        match command {
            BrowserCommand::Navigate { url, reply } => {
                let _ = reply.send(session.navigate(&url).await);
            }
            BrowserCommand::SubmitForm { url, fields, reply } => {
                let _ = reply.send(session.submit_form(&url, fields).await);
            }
            BrowserCommand::FetchJson { url, reply } => {
                let _ = reply.send(session.fetch_json(&url).await);
            }
            BrowserCommand::Reload { reply } => {
                let _ = reply.send(session.reload().await);
            }
            BrowserCommand::Shutdown { reply } => {
                receiver.close();
                close_session(session.as_mut()).await;
                let _ = reply.send(());
                info!("Browser worker stopped");
                return;
            }
        }
    }

    // Every handle was dropped without an explicit shutdown
    close_session(session.as_mut()).await;
    info!("Browser worker stopped");
}

async fn close_session(session: &mut dyn BrowserSession) {
    if let Err(e) = session.close().await {
        warn!("Failed to close browser session cleanly: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Probe {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        closed: AtomicUsize,
    }

    struct SlowSession {
        probe: Arc<Probe>,
    }

    impl SlowSession {
        async fn work(&self, url: &str) -> SyncResult<String> {
            let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("<html>{url}</html>"))
        }
    }

    #[async_trait]
    impl BrowserSession for SlowSession {
        async fn navigate(&mut self, url: &str) -> SyncResult<String> {
            self.work(url).await
        }

        async fn submit_form(&mut self, url: &str, _fields: Vec<(String, String)>) -> SyncResult<String> {
            self.work(url).await
        }

        async fn fetch_json(&mut self, url: &str) -> SyncResult<Value> {
            self.work(url).await.map(|html| Value::String(html))
        }

        async fn reload(&mut self) -> SyncResult<String> {
            Err(SyncError::navigation("about:blank", "nothing to reload"))
        }

        async fn close(&mut self) -> SyncResult<()> {
            self.probe.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_callers_are_serialized() {
        let probe = Arc::new(Probe::default());
        let (handle, _worker) = BrowserHandle::spawn(Box::new(SlowSession { probe: probe.clone() }));

        let calls = (0..8).map(|i| {
            let handle = handle.clone();
            async move { handle.navigate(&format!("https://x/{i}")).await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_errors_are_returned_to_the_caller() {
        let probe = Arc::new(Probe::default());
        let (handle, _worker) = BrowserHandle::spawn(Box::new(SlowSession { probe }));

        let err = handle.reload().await.unwrap_err();
        assert!(matches!(err, SyncError::Navigation { .. }));
    }

    #[tokio::test]
    async fn calls_after_shutdown_fail_with_browser_closed() {
        let probe = Arc::new(Probe::default());
        let (handle, worker) = BrowserHandle::spawn(Box::new(SlowSession { probe: probe.clone() }));

        handle.shutdown().await;
        worker.await.unwrap();

        assert_eq!(probe.closed.load(Ordering::SeqCst), 1);
        assert!(handle.is_closed());
        assert!(matches!(
            handle.navigate("https://x").await,
            Err(SyncError::BrowserClosed)
        ));
    }
}
