//! Incident Sync - unattended incident synchronization
//!
//! Keeps an authenticated session to a browser-rendered mission source,
//! extracts the current incidents on a fixed interval, reconciles them
//! against SQLite and streams every change to live subscribers over SSE.

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;

#[cfg(test)]
pub mod test_utils;

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use application::{PollScheduler, SyncServices};
use infrastructure::http_server::{self, AppState};
use infrastructure::logging::log_system_info;
use infrastructure::{
    BrowserHandle, ConfigManager, DatabaseConnection, HttpBrowserSession, LiveBroadcaster,
    init_logging_with_config,
};

/// Run the pipeline until Ctrl-C or a fatal scheduler error
pub async fn run() -> anyhow::Result<()> {
    let config = ConfigManager::new()?.load_config().await?;
    init_logging_with_config(config.logging.clone())?;
    log_system_info();

    let database =
        DatabaseConnection::with_max_connections(&config.database.url, config.database.max_connections)
            .await?;
    database.migrate().await?;

    let session = HttpBrowserSession::from_source_config(&config.source)?;
    let (browser, browser_worker) = BrowserHandle::spawn(Box::new(session));
    let broadcaster = Arc::new(LiveBroadcaster::from_config(&config.live));
    let services = SyncServices::build(&config, database.pool(), browser.clone(), broadcaster.clone())?;

    let token = CancellationToken::new();
    let heartbeat = broadcaster
        .clone()
        .spawn_heartbeat(config.live.heartbeat_interval(), token.clone());

    let listener = TcpListener::bind(&config.live.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.live.bind_address))?;
    let server = tokio::spawn(http_server::serve(
        listener,
        AppState {
            broadcaster,
            ingest: services.ingest.clone(),
            shutdown: token.clone(),
        },
    ));

    let retention = services.retention.clone().spawn(token.clone());
    let scheduler = Arc::new(PollScheduler::new(&services, config.polling.clone(), token.clone()));
    let mut scheduler_task = tokio::spawn(scheduler.run());

    let scheduler_result = tokio::select! {
        result = &mut scheduler_task => result,
        Ok(()) = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            token.cancel();
            scheduler_task.await
        }
    };

    // Stop everything else, then release the browser session
    token.cancel();
    for (name, task) in [("heartbeat", heartbeat), ("retention", retention)] {
        if let Err(e) = task.await {
            warn!("The {} task ended abnormally: {}", name, e);
        }
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server failed: {}", e),
        Err(e) => error!("HTTP server task ended abnormally: {}", e),
    }
    browser.shutdown().await;
    if let Err(e) = browser_worker.await {
        warn!("Browser worker ended abnormally: {}", e);
    }
    database.pool().close().await;

    scheduler_result??;
    info!("Incident sync stopped");
    Ok(())
}
