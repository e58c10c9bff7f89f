//! Snapshot extraction from the rendered mission page
//!
//! All page loads go through the [`BrowserHandle`] queue. Parsed documents
//! are confined to synchronous parser calls.

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::incident::{ExtractedIncident, IncidentCategory, PageDetails};
use crate::infrastructure::browser::BrowserHandle;
use crate::infrastructure::config::SourceConfig;
use crate::infrastructure::parsing::{
    ContextualParser, DetailParseContext, ExtractionStats, ListParseContext, MissionDetailParser,
    MissionListParser, compile_selector,
};
use crate::infrastructure::sync_error::{SyncError, SyncResult};

/// Records observed in one extraction cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub records: Vec<ExtractedIncident>,
    pub stats: ExtractionStats,
    /// The page showed its list containers and every entry was readable, so
    /// an incident missing from `records` is really gone
    pub complete: bool,
    pub captured_at: DateTime<Utc>,
}

pub struct Extractor {
    browser: BrowserHandle,
    source: SourceConfig,
    auth_probe: Selector,
    list_parser: MissionListParser,
    detail_parser: MissionDetailParser,
}

impl Extractor {
    pub fn new(browser: BrowserHandle, source: &SourceConfig) -> SyncResult<Self> {
        Ok(Self {
            browser,
            auth_probe: compile_selector(&source.auth_probe_selector)
                .map_err(|e| SyncError::Config(format!("source.auth_probe_selector: {e}")))?,
            source: source.clone(),
            list_parser: MissionListParser::new()?,
            detail_parser: MissionDetailParser::new()?,
        })
    }

    /// Load the main page and read every configured mission list
    pub async fn extract_snapshot(&self) -> SyncResult<Snapshot> {
        let started = Instant::now();
        let url = self.source.home_url();
        let document = self.browser.navigate(&url).await?;
        let captured_at = Utc::now();

        let mut page = {
            let html = Html::parse_document(&document);
            if html.select(&self.auth_probe).next().is_none() {
                return Err(SyncError::SessionLost);
            }
            self.list_parser
                .parse_with_context(&html, &ListParseContext { extracted_at: captured_at })?
        };
        page.stats.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(
            "Extracted {} missions from {} lists ({} skipped, {} duplicates, {} malformed) in {} ms",
            page.stats.total,
            page.stats.containers_found,
            page.stats.skipped,
            page.stats.duplicates,
            page.stats.malformed,
            page.stats.elapsed_ms
        );
        debug!("Per source: {:?}, per category: {:?}", page.stats.by_source, page.stats.by_category);

        let complete = page.stats.containers_found > 0 && page.stats.malformed == 0;
        if !complete {
            warn!("{} unreadable entries, snapshot will not drive deletion", page.stats.malformed);
        }

        Ok(Snapshot {
            records: page.records,
            stats: page.stats,
            complete,
            captured_at,
        })
    }

    /// Visit the detail page of every emergency/planned target, one at a time.
    ///
    /// Per-target failures are logged and skipped. Only errors that make the
    /// browser unusable end the pass early.
    pub async fn extract_details<'a, I>(&self, targets: I) -> SyncResult<Vec<(String, PageDetails)>>
    where
        I: IntoIterator<Item = (&'a str, IncidentCategory)>,
    {
        let mut details = Vec::new();
        let mut failures = 0usize;

        for (external_id, category) in targets {
            if !category.wants_details() {
                continue;
            }

            match self.fetch_details(external_id).await {
                Ok(page) => details.push((external_id.to_string(), page)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Skipping details of mission {}: {}", external_id, e);
                    failures += 1;
                }
            }
        }

        debug!("Fetched {} detail pages ({} failed)", details.len(), failures);
        Ok(details)
    }

    async fn fetch_details(&self, external_id: &str) -> SyncResult<PageDetails> {
        let document = self
            .browser
            .navigate(&self.source.mission_detail_url(external_id))
            .await?;
        let context = DetailParseContext {
            external_id: external_id.to_string(),
            fetched_at: Utc::now(),
        };
        Ok(self.detail_parser.parse_document(&document, &context)?)
    }
}

/// Detail targets of a snapshot
pub fn detail_targets(records: &[ExtractedIncident]) -> impl Iterator<Item = (&str, IncidentCategory)> {
    records.iter().map(|r| (r.external_id.as_str(), r.category))
}
