//! Producer-side upsert boundary
//!
//! Accepts one incident object or an array of them. The whole batch is
//! validated before anything is written; a batch with any issue is rejected
//! as a unit.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::application::reconciler::Reconciler;
use crate::domain::incident::{
    Coordinates, ExtractedIncident, IncidentCategory, IncidentSource, IncidentStatus, ListContext,
};
use crate::infrastructure::live_broadcaster::LiveBroadcaster;
use crate::infrastructure::sync_error::SyncError;

/// One field-level problem of a submitted record
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldIssue {
    pub index: usize,
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    fn new(index: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            index,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Batch contains no records")]
    EmptyBatch,

    #[error("Body must be an incident object or an array of incident objects")]
    MalformedBody,

    #[error("{} field issue(s) in submitted batch", .0.len())]
    Validation(Vec<FieldIssue>),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Submitted record; every field is optional so that validation can report
/// all issues at once instead of failing on the first one
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IncidentInput {
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub type_code: Option<String>,
    pub status: Option<String>,
    pub source: Option<String>,
    pub category: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub list_context: Option<ListContext>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub created: usize,
    pub updated: usize,
}

pub struct IngestService {
    reconciler: Arc<Reconciler>,
    broadcaster: Arc<LiveBroadcaster>,
}

impl IngestService {
    pub fn new(reconciler: Arc<Reconciler>, broadcaster: Arc<LiveBroadcaster>) -> Self {
        Self { reconciler, broadcaster }
    }

    pub async fn ingest(&self, body: Value) -> Result<IngestSummary, IngestError> {
        let records = parse_batch(body)?;
        debug!("Ingesting {} validated records", records.len());

        let changes = self.reconciler.upsert_records(&records).await?;
        self.broadcaster.publish_all(changes.upsert_events()).await;

        let summary = IngestSummary {
            created: changes.created.len(),
            updated: changes.updated.len(),
        };
        info!(
            "Ingested {} records: {} created, {} updated",
            records.len(),
            summary.created,
            summary.updated
        );
        Ok(summary)
    }
}

/// Turn a request body into validated records without touching storage
pub fn parse_batch(body: Value) -> Result<Vec<ExtractedIncident>, IngestError> {
    let items = match body {
        Value::Array(items) if items.is_empty() => return Err(IngestError::EmptyBatch),
        Value::Array(items) => items,
        item @ Value::Object(_) => vec![item],
        _ => return Err(IngestError::MalformedBody),
    };

    let mut issues = Vec::new();
    let mut records = Vec::with_capacity(items.len());
    let mut seen_ids = HashSet::new();

    for (index, item) in items.into_iter().enumerate() {
        if !item.is_object() {
            issues.push(FieldIssue::new(index, "record", "must be an object"));
            continue;
        }
        let input: IncidentInput = match serde_json::from_value(item) {
            Ok(input) => input,
            Err(e) => {
                issues.push(FieldIssue::new(index, "record", e.to_string()));
                continue;
            }
        };

        match validate(index, input) {
            Ok(record) => {
                if !seen_ids.insert(record.external_id.clone()) {
                    issues.push(FieldIssue::new(index, "external_id", "duplicate id within batch"));
                    continue;
                }
                records.push(record);
            }
            Err(mut record_issues) => issues.append(&mut record_issues),
        }
    }

    if issues.is_empty() {
        Ok(records)
    } else {
        Err(IngestError::Validation(issues))
    }
}

fn validate(index: usize, input: IncidentInput) -> Result<ExtractedIncident, Vec<FieldIssue>> {
    let mut issues = Vec::new();

    let external_id = required_text(index, "external_id", input.external_id, &mut issues);
    let title = required_text(index, "title", input.title, &mut issues);
    let status = tag(index, "status", input.status, IncidentStatus::Unclaimed, &mut issues);
    let source = tag(index, "source", input.source, IncidentSource::Own, &mut issues);
    let category = tag(index, "category", input.category, IncidentCategory::Emergency, &mut issues);

    let coordinates = match (input.latitude, input.longitude) {
        (None, None) => None,
        (Some(latitude), Some(longitude)) => {
            if !(-90.0..=90.0).contains(&latitude) {
                issues.push(FieldIssue::new(index, "latitude", "must be within [-90, 90]"));
            }
            if !(-180.0..=180.0).contains(&longitude) {
                issues.push(FieldIssue::new(index, "longitude", "must be within [-180, 180]"));
            }
            Some(Coordinates { latitude, longitude })
        }
        (Some(_), None) => {
            issues.push(FieldIssue::new(index, "longitude", "required when latitude is given"));
            None
        }
        (None, Some(_)) => {
            issues.push(FieldIssue::new(index, "latitude", "required when longitude is given"));
            None
        }
    };

    if !issues.is_empty() {
        return Err(issues);
    }

    Ok(ExtractedIncident {
        external_id,
        title,
        type_code: non_blank(input.type_code),
        status,
        source,
        category,
        coordinates,
        address: non_blank(input.address),
        list_context: input.list_context.unwrap_or_default(),
    })
}

fn required_text(index: usize, field: &str, value: Option<String>, issues: &mut Vec<FieldIssue>) -> String {
    match non_blank(value) {
        Some(text) => text,
        None => {
            issues.push(FieldIssue::new(index, field, "must not be empty"));
            String::new()
        }
    }
}

fn tag<T: FromStr>(
    index: usize,
    field: &str,
    value: Option<String>,
    default: T,
    issues: &mut Vec<FieldIssue>,
) -> T
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = value else {
        return default;
    };
    T::from_str(raw.trim()).unwrap_or_else(|e| {
        issues.push(FieldIssue::new(index, field, e.to_string()));
        default
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
