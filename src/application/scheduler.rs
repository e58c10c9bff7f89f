//! Poll scheduler
//!
//! Three independent loops share one browser handle: the primary incident
//! cycle, alliance stats and member presence. Each loop ticks immediately at
//! start and then at its configured interval. A primary tick that fires while
//! the previous cycle is still running is dropped, never queued.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::SyncServices;
use crate::application::alliance_sync::AllianceSync;
use crate::application::extractor::{Extractor, Snapshot, detail_targets};
use crate::application::reconciler::Reconciler;
use crate::application::session_manager::SessionManager;
use crate::infrastructure::browser::BrowserHandle;
use crate::infrastructure::config::PollingConfig;
use crate::infrastructure::live_broadcaster::LiveBroadcaster;
use crate::infrastructure::parsing::ExtractionStats;
use crate::infrastructure::sync_error::{SyncError, SyncResult};

/// How long shutdown waits for an in-flight primary cycle before abandoning it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CycleReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub details_merged: usize,
    pub elapsed_ms: u64,
    pub stats: ExtractionStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The previous cycle was still running
    Skipped,
    /// No authenticated session this tick; the next tick tries again
    NotAuthenticated,
    /// Extraction or persistence failed; nothing was deleted
    ExtractionFailed,
    Completed(CycleReport),
}

#[derive(Debug, Clone, Copy)]
enum AuxJob {
    AllianceStats,
    Members,
}

impl AuxJob {
    const fn name(self) -> &'static str {
        match self {
            Self::AllianceStats => "alliance stats",
            Self::Members => "members",
        }
    }
}

/// Clears the running flag when the cycle ends, including on error or abort
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PollScheduler {
    session: Arc<SessionManager>,
    extractor: Arc<Extractor>,
    reconciler: Arc<Reconciler>,
    alliance: Arc<AllianceSync>,
    broadcaster: Arc<LiveBroadcaster>,
    browser: BrowserHandle,
    polling: PollingConfig,
    running: AtomicBool,
    token: CancellationToken,
    fatal: Mutex<Option<SyncError>>,
}

impl PollScheduler {
    pub fn new(services: &SyncServices, polling: PollingConfig, token: CancellationToken) -> Self {
        Self {
            session: services.session.clone(),
            extractor: services.extractor.clone(),
            reconciler: services.reconciler.clone(),
            alliance: services.alliance.clone(),
            broadcaster: services.broadcaster.clone(),
            browser: services.browser.clone(),
            polling,
            running: AtomicBool::new(false),
            token,
            fatal: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn try_begin(&self) -> Option<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunningGuard(&self.running))
    }

    /// Drive all three loops until the token is cancelled or a fatal error occurs
    pub async fn run(self: Arc<Self>) -> SyncResult<()> {
        info!(
            "Poll scheduler starting (primary {:?}, stats {:?}, members {:?})",
            self.polling.primary_interval(),
            self.polling.alliance_stats_interval(),
            self.polling.members_interval()
        );

        let primary = tokio::spawn(Arc::clone(&self).primary_loop());
        let stats = tokio::spawn(Arc::clone(&self).aux_loop(AuxJob::AllianceStats));
        let members = tokio::spawn(Arc::clone(&self).aux_loop(AuxJob::Members));

        for (name, result) in [
            ("primary", primary.await),
            ("alliance stats", stats.await),
            ("members", members.await),
        ] {
            if let Err(e) = result {
                error!("The {} loop ended abnormally: {}", name, e);
            }
        }

        match self.fatal.lock().await.take() {
            Some(e) => {
                error!("Poll scheduler stopped: {}", e);
                Err(e)
            }
            None => {
                info!("Poll scheduler stopped");
                Ok(())
            }
        }
    }

    async fn primary_loop(self: Arc<Self>) {
        let mut ticker = time::interval(self.polling.primary_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                _ = ticker.tick() => {
                    in_flight.retain(|handle| !handle.is_finished());
                    let scheduler = Arc::clone(&self);
                    in_flight.push(tokio::spawn(async move {
                        match scheduler.run_primary_tick().await {
                            Ok(outcome) => debug!("Primary tick: {:?}", outcome_label(&outcome)),
                            Err(e) => scheduler.fail(e).await,
                        }
                    }));
                }
            }
        }

        for handle in in_flight {
            let abort = handle.abort_handle();
            if time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("Abandoning in-flight primary cycle at shutdown");
                abort.abort();
            }
        }
    }

    async fn aux_loop(self: Arc<Self>, job: AuxJob) {
        let period = match job {
            AuxJob::AllianceStats => self.polling.alliance_stats_interval(),
            AuxJob::Members => self.polling.members_interval(),
        };
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                _ = ticker.tick() => {
                    let result = match job {
                        AuxJob::AllianceStats => self.alliance.sync_stats().await.map(|_| ()),
                        AuxJob::Members => self.alliance.sync_members().await.map(|_| ()),
                    };
                    match result {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() => {
                            self.fail(e).await;
                            break;
                        }
                        Err(e) => warn!("Skipping {} tick: {}", job.name(), e),
                    }
                }
            }
        }
    }

    /// One primary cycle: authenticate, extract, reconcile, broadcast, then
    /// fetch details and publish deletions.
    ///
    /// Only fatal errors are returned as `Err`.
    pub async fn run_primary_tick(&self) -> SyncResult<TickOutcome> {
        let Some(_guard) = self.try_begin() else {
            debug!("Previous primary cycle still running, dropping tick");
            return Ok(TickOutcome::Skipped);
        };

        if !self.session.ensure_authenticated().await? {
            return Ok(TickOutcome::NotAuthenticated);
        }

        match self.primary_cycle().await {
            Ok(report) => Ok(TickOutcome::Completed(report)),
            Err(e) if e.is_fatal() => Err(e),
            Err(SyncError::SessionLost) => {
                warn!("Session lost during the primary cycle, re-login on next tick");
                Ok(TickOutcome::NotAuthenticated)
            }
            Err(e) => {
                warn!("Primary cycle failed: {}", e);
                self.recover().await;
                Ok(TickOutcome::ExtractionFailed)
            }
        }
    }

    async fn primary_cycle(&self) -> SyncResult<CycleReport> {
        let started = Instant::now();

        let snapshot = self.extractor.extract_snapshot().await?;
        let changes = self.reconciler.reconcile(&snapshot).await?;
        self.broadcaster.publish_all(changes.upsert_events()).await;

        let merged = self.merge_details(&snapshot).await;
        if let Some(event) = changes.deleted_event() {
            self.broadcaster.publish(event).await;
        }
        let details_merged = merged?;

        let report = CycleReport {
            created: changes.created.len(),
            updated: changes.updated.len(),
            deleted: changes.deleted.len(),
            unchanged: changes.unchanged,
            skipped: snapshot.stats.skipped,
            details_merged,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            stats: snapshot.stats,
        };
        info!(
            "Primary cycle: {} created, {} updated, {} deleted, {} unchanged, {} details in {} ms",
            report.created,
            report.updated,
            report.deleted,
            report.unchanged,
            report.details_merged,
            report.elapsed_ms
        );
        Ok(report)
    }

    async fn merge_details(&self, snapshot: &Snapshot) -> SyncResult<usize> {
        let details = self
            .extractor
            .extract_details(detail_targets(&snapshot.records))
            .await?;

        let mut merged = 0;
        for (external_id, page) in &details {
            if self.reconciler.merge_page_details(external_id, page).await? {
                merged += 1;
            }
        }
        Ok(merged)
    }

    /// Reload the current page once; errors are swallowed
    async fn recover(&self) {
        if let Err(e) = self.browser.reload().await {
            debug!("Reload after failed cycle also failed: {}", e);
        }
    }

    async fn fail(&self, e: SyncError) {
        error!("Fatal scheduler error: {}", e);
        let mut fatal = self.fatal.lock().await;
        if fatal.is_none() {
            *fatal = Some(e);
        }
        self.token.cancel();
    }
}

fn outcome_label(outcome: &TickOutcome) -> &'static str {
    match outcome {
        TickOutcome::Skipped => "skipped",
        TickOutcome::NotAuthenticated => "not authenticated",
        TickOutcome::ExtractionFailed => "extraction failed",
        TickOutcome::Completed(_) => "completed",
    }
}
