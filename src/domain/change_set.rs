//! Result of one reconciliation pass

use chrono::Utc;
use serde::Serialize;

use super::events::{BATCH_UPSERT_KIND, IncidentAction, LiveEvent};
use super::incident::Incident;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ChangeSet {
    pub created: Vec<Incident>,
    pub updated: Vec<Incident>,
    pub deleted: Vec<String>,
    /// Records reported without any tracked change
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn upsert_count(&self) -> usize {
        self.created.len() + self.updated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upsert_count() == 0 && self.deleted.is_empty()
    }

    /// Events for the created/updated part of the set.
    ///
    /// A single change goes out as one `incident` event, several changes are
    /// folded into one `batch` event.
    pub fn upsert_events(&self) -> Vec<LiveEvent> {
        let timestamp = Utc::now();
        match (self.created.as_slice(), self.updated.as_slice()) {
            ([], []) => Vec::new(),
            ([incident], []) => vec![LiveEvent::Incident {
                action: IncidentAction::Created,
                incident: incident.clone(),
                timestamp,
            }],
            ([], [incident]) => vec![LiveEvent::Incident {
                action: IncidentAction::Updated,
                incident: incident.clone(),
                timestamp,
            }],
            (created, updated) => vec![LiveEvent::Batch {
                kind: BATCH_UPSERT_KIND,
                created: created.len(),
                updated: updated.len(),
                incidents: created.iter().chain(updated).cloned().collect(),
                timestamp,
            }],
        }
    }

    pub fn deleted_event(&self) -> Option<LiveEvent> {
        (!self.deleted.is_empty()).then(|| LiveEvent::deleted(self.deleted.clone()))
    }
}
