//! Application layer module
//!
//! Session upkeep, extraction, reconciliation and the pollers that drive them,
//! plus the ingest boundary and the retention sweep.

pub mod alliance_sync;
pub mod extractor;
pub mod ingest;
pub mod reconciler;
pub mod retention;
pub mod scheduler;
pub mod session_manager;

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::infrastructure::alliance_repository::AllianceRepository;
use crate::infrastructure::browser::BrowserHandle;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::incident_repository::IncidentRepository;
use crate::infrastructure::live_broadcaster::LiveBroadcaster;
use crate::infrastructure::sync_error::SyncResult;

pub use alliance_sync::{AllianceInfo, AllianceSync, MemberSyncReport};
pub use extractor::{Extractor, Snapshot, detail_targets};
pub use ingest::{FieldIssue, IngestError, IngestService, IngestSummary};
pub use reconciler::Reconciler;
pub use retention::{RetentionReport, RetentionSweep, next_run_after, stats_to_discard};
pub use scheduler::{CycleReport, PollScheduler, TickOutcome};
pub use session_manager::SessionManager;

/// Every service of the pipeline, wired to one browser handle, one pool and
/// one broadcaster
#[derive(Clone)]
pub struct SyncServices {
    pub browser: BrowserHandle,
    pub broadcaster: Arc<LiveBroadcaster>,
    pub session: Arc<SessionManager>,
    pub extractor: Arc<Extractor>,
    pub reconciler: Arc<Reconciler>,
    pub alliance: Arc<AllianceSync>,
    pub ingest: Arc<IngestService>,
    pub retention: Arc<RetentionSweep>,
}

impl SyncServices {
    pub fn build(
        config: &AppConfig,
        pool: &SqlitePool,
        browser: BrowserHandle,
        broadcaster: Arc<LiveBroadcaster>,
    ) -> SyncResult<Self> {
        let incidents = IncidentRepository::new(pool.clone());
        let alliance_repository = AllianceRepository::new(pool.clone());

        let reconciler = Arc::new(Reconciler::new(incidents.clone()));
        let session = Arc::new(SessionManager::new(browser.clone(), &config.source, &config.polling)?);
        let extractor = Arc::new(Extractor::new(browser.clone(), &config.source)?);
        let alliance = Arc::new(AllianceSync::new(
            browser.clone(),
            &config.source,
            &config.members,
            alliance_repository.clone(),
            broadcaster.clone(),
        ));
        let ingest = Arc::new(IngestService::new(reconciler.clone(), broadcaster.clone()));
        let retention = Arc::new(RetentionSweep::new(
            reconciler.clone(),
            alliance_repository,
            config.retention.clone(),
        ));

        Ok(Self {
            browser,
            broadcaster,
            session,
            extractor,
            reconciler,
            alliance,
            ingest,
            retention,
        })
    }
}
