//! Diff of extracted records against the incident store
//!
//! The reconciler is the only writer of the `incidents` table. Write passes
//! are serialized by a lock so that the scheduler and the ingest endpoint
//! never race on the same id.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::application::extractor::Snapshot;
use crate::domain::change_set::ChangeSet;
use crate::domain::incident::{ExtractedIncident, Incident, PageDetails};
use crate::infrastructure::incident_repository::IncidentRepository;
use crate::infrastructure::sync_error::SyncResult;

pub struct Reconciler {
    incidents: IncidentRepository,
    write_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(incidents: IncidentRepository) -> Self {
        Self {
            incidents,
            write_lock: Mutex::new(()),
        }
    }

    /// Upsert every snapshot record, then delete what the snapshot no longer lists.
    ///
    /// Deletion runs only for a complete snapshot and only after all upserts
    /// of the pass have been written.
    pub async fn reconcile(&self, snapshot: &Snapshot) -> SyncResult<ChangeSet> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        let mut changes = self.upsert_locked(&snapshot.records, now).await?;

        if snapshot.complete {
            let present: HashSet<&str> = snapshot
                .records
                .iter()
                .map(|r| r.external_id.as_str())
                .collect();
            let gone: Vec<String> = self
                .incidents
                .all_ids()
                .await?
                .into_iter()
                .filter(|id| !present.contains(id.as_str()))
                .collect();

            if !gone.is_empty() {
                let removed = self.incidents.delete_by_ids(&gone).await?;
                debug!("Deleted {} incidents no longer listed", removed);
                changes.deleted = gone;
            }
        } else {
            warn!(
                "Snapshot of {} records is incomplete, skipping deletion",
                snapshot.records.len()
            );
        }

        info!(
            "Reconciled snapshot: {} created, {} updated, {} deleted, {} unchanged",
            changes.created.len(),
            changes.updated.len(),
            changes.deleted.len(),
            changes.unchanged
        );
        Ok(changes)
    }

    /// Upsert without deletion, used by the ingest boundary
    pub async fn upsert_records(&self, records: &[ExtractedIncident]) -> SyncResult<ChangeSet> {
        let _guard = self.write_lock.lock().await;
        self.upsert_locked(records, Utc::now()).await
    }

    /// Detail path: never advances `updated_at` and emits nothing.
    /// Returns whether the incident still exists.
    pub async fn merge_page_details(&self, external_id: &str, details: &PageDetails) -> SyncResult<bool> {
        let _guard = self.write_lock.lock().await;
        self.incidents.update_page_details(external_id, details).await
    }

    /// Retention path: drop incidents not seen since `cutoff`. Emits nothing.
    pub async fn delete_not_seen_since(&self, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        let _guard = self.write_lock.lock().await;
        self.incidents.delete_not_seen_since(cutoff).await
    }

    async fn upsert_locked(&self, records: &[ExtractedIncident], now: DateTime<Utc>) -> SyncResult<ChangeSet> {
        let mut changes = ChangeSet::default();

        for record in records {
            match self.incidents.find_by_external_id(&record.external_id).await? {
                None => {
                    let incident = Incident::first_seen(record, now);
                    self.incidents.insert(&incident).await?;
                    changes.created.push(incident);
                }
                Some(mut incident) => {
                    let changed = incident.observe(record, now);
                    self.incidents.update(&incident).await?;
                    if changed {
                        changes.updated.push(incident);
                    } else {
                        changes.unchanged += 1;
                    }
                }
            }
        }

        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::incident::{IncidentCategory, IncidentSource, IncidentStatus, ListContext};
    use crate::infrastructure::database_connection::DatabaseConnection;
    use crate::infrastructure::parsing::ExtractionStats;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Reconciler, IncidentRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("reconcile.db").display());
        let db = DatabaseConnection::new(&url).await.unwrap();
        db.migrate().await.unwrap();
        let repo = IncidentRepository::new(db.pool().clone());
        (dir, Reconciler::new(repo.clone()), repo)
    }

    fn record(id: &str, status: IncidentStatus) -> ExtractedIncident {
        ExtractedIncident {
            external_id: id.to_string(),
            title: "Person in Notlage".to_string(),
            type_code: Some("3".to_string()),
            status,
            source: IncidentSource::Own,
            category: IncidentCategory::Emergency,
            coordinates: None,
            address: Some("Marktplatz 2".to_string()),
            list_context: ListContext::default(),
        }
    }

    fn snapshot(records: Vec<ExtractedIncident>) -> Snapshot {
        Snapshot {
            records,
            stats: ExtractionStats::default(),
            complete: true,
            captured_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn status_change_is_one_update() {
        let (_dir, reconciler, repo) = setup().await;
        reconciler
            .reconcile(&snapshot(vec![record("A", IncidentStatus::Unclaimed)]))
            .await
            .unwrap();
        let before = repo.find_by_external_id("A").await.unwrap().unwrap();

        let changes = reconciler
            .reconcile(&snapshot(vec![record("A", IncidentStatus::InProgress)]))
            .await
            .unwrap();

        assert!(changes.created.is_empty());
        assert_eq!(changes.updated.len(), 1);
        let after = repo.find_by_external_id("A").await.unwrap().unwrap();
        assert_eq!(after.status, IncidentStatus::InProgress);
        assert!(after.updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn same_snapshot_twice_is_idempotent_but_refreshes_last_seen() {
        let (_dir, reconciler, repo) = setup().await;
        let snap = snapshot(vec![record("A", IncidentStatus::EnRoute), record("B", IncidentStatus::Unclaimed)]);

        let first = reconciler.reconcile(&snap).await.unwrap();
        let seen_first = repo.find_by_external_id("A").await.unwrap().unwrap();
        let second = reconciler.reconcile(&snap).await.unwrap();
        let seen_second = repo.find_by_external_id("A").await.unwrap().unwrap();

        assert_eq!(first.created.len(), 2);
        assert!(second.updated.is_empty() && second.created.is_empty() && second.deleted.is_empty());
        assert_eq!(second.unchanged, 2);
        assert_eq!(seen_second.updated_at, seen_first.updated_at);
        assert!(seen_second.last_seen_at > seen_first.last_seen_at);
    }

    #[tokio::test]
    async fn subset_snapshot_deletes_exactly_the_missing_ids() {
        let (_dir, reconciler, repo) = setup().await;
        reconciler
            .reconcile(&snapshot(vec![
                record("A", IncidentStatus::Unclaimed),
                record("B", IncidentStatus::Unclaimed),
                record("C", IncidentStatus::Unclaimed),
            ]))
            .await
            .unwrap();

        let changes = reconciler
            .reconcile(&snapshot(vec![record("B", IncidentStatus::Unclaimed)]))
            .await
            .unwrap();

        let mut deleted = changes.deleted.clone();
        deleted.sort();
        assert_eq!(deleted, vec!["A".to_string(), "C".to_string()]);
        assert!(changes.updated.is_empty());
        assert_eq!(repo.all_ids().await.unwrap(), vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn genuine_empty_snapshot_deletes_everything() {
        let (_dir, reconciler, _repo) = setup().await;
        reconciler
            .reconcile(&snapshot(vec![record("A", IncidentStatus::Unclaimed)]))
            .await
            .unwrap();

        let changes = reconciler.reconcile(&snapshot(vec![])).await.unwrap();

        assert_eq!(changes.deleted, vec!["A".to_string()]);
        assert!(changes.deleted_event().is_some());
    }

    #[tokio::test]
    async fn incomplete_snapshot_never_deletes() {
        let (_dir, reconciler, repo) = setup().await;
        reconciler
            .reconcile(&snapshot(vec![record("A", IncidentStatus::Unclaimed)]))
            .await
            .unwrap();

        let mut failed = snapshot(vec![]);
        failed.complete = false;
        let changes = reconciler.reconcile(&failed).await.unwrap();

        assert!(changes.deleted.is_empty());
        assert_eq!(repo.all_ids().await.unwrap(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn detail_merge_does_not_count_as_update() {
        let (_dir, reconciler, repo) = setup().await;
        let snap = snapshot(vec![record("A", IncidentStatus::EnRoute)]);
        reconciler.reconcile(&snap).await.unwrap();
        let before = repo.find_by_external_id("A").await.unwrap().unwrap();

        let details = PageDetails { at_scene: vec!["Lea".into()], ..PageDetails::default() };
        assert!(reconciler.merge_page_details("A", &details).await.unwrap());
        let changes = reconciler.reconcile(&snap).await.unwrap();

        let after = repo.find_by_external_id("A").await.unwrap().unwrap();
        assert!(changes.updated.is_empty());
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.page_details, Some(details));
    }
}
