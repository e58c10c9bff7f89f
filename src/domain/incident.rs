//! Incident entity and its value objects
//!
//! An incident is one externally sourced mission with a stable `external_id`.
//! Tracked fields drive `updated_at`; the detail payload (list context and
//! detail-page fields) is carried alongside but never counts as a change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status derived from the list panel colour
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Red panel: nobody has dispatched yet
    Unclaimed,
    /// Yellow panel: units are driving
    EnRoute,
    /// Green panel: units are at the scene
    InProgress,
}

impl IncidentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unclaimed => "unclaimed",
            Self::EnRoute => "en_route",
            Self::InProgress => "in_progress",
        }
    }

    /// Map a panel colour (`red`, `yellow`, `green`) to a status
    pub fn from_panel_color(color: &str) -> Option<Self> {
        match color.trim().to_ascii_lowercase().as_str() {
            "red" => Some(Self::Unclaimed),
            "yellow" => Some(Self::EnRoute),
            "green" => Some(Self::InProgress),
            _ => None,
        }
    }
}

/// Which origin list the incident was read from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSource {
    Own,
    OwnShared,
    Alliance,
    AllianceEvent,
}

impl IncidentSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Own => "own",
            Self::OwnShared => "own_shared",
            Self::Alliance => "alliance",
            Self::AllianceEvent => "alliance_event",
        }
    }
}

/// Category tag of an incident
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum IncidentCategory {
    Emergency,
    Planned,
    Event,
}

impl IncidentCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::Planned => "planned",
            Self::Event => "event",
        }
    }

    /// Categories whose detail page is visited after each primary cycle
    pub const fn wants_details(self) -> bool {
        matches!(self, Self::Emergency | Self::Planned)
    }
}

/// Error returned when a stored or submitted tag is not part of the closed set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} tag: {value}")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! impl_tag_conversions {
    ($ty:ty, $kind:literal, [$($variant:path),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = UnknownTag;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == $variant.as_str() {
                        return Ok($variant);
                    }
                )+
                Err(UnknownTag { kind: $kind, value: s.to_string() })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_tag_conversions!(
    IncidentStatus,
    "status",
    [IncidentStatus::Unclaimed, IncidentStatus::EnRoute, IncidentStatus::InProgress]
);
impl_tag_conversions!(
    IncidentSource,
    "source",
    [
        IncidentSource::Own,
        IncidentSource::OwnShared,
        IncidentSource::Alliance,
        IncidentSource::AllianceEvent,
    ]
);
impl_tag_conversions!(
    IncidentCategory,
    "category",
    [IncidentCategory::Emergency, IncidentCategory::Planned, IncidentCategory::Event]
);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Context read from the mission list entry itself
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ListContext {
    pub panel_color: Option<String>,
    pub shared: bool,
    pub missing_resources: Option<String>,
    pub patient_count: Option<u32>,
    pub countdown_seconds: Option<i64>,
    pub progress_percent: Option<f64>,
    pub extracted_at: Option<DateTime<Utc>>,
}

/// Fields read from the per-incident detail page
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageDetails {
    pub countdown_seconds: Option<i64>,
    pub duration: Option<String>,
    pub driving: Vec<String>,
    pub at_scene: Vec<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// One record as observed in a single extraction cycle (or submitted via ingest)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedIncident {
    pub external_id: String,
    pub title: String,
    pub type_code: Option<String>,
    pub status: IncidentStatus,
    pub source: IncidentSource,
    pub category: IncidentCategory,
    pub coordinates: Option<Coordinates>,
    pub address: Option<String>,
    pub list_context: ListContext,
}

/// The comparable field set; any difference advances `updated_at`
#[derive(Debug, PartialEq)]
pub struct TrackedFields<'a> {
    pub title: &'a str,
    pub type_code: Option<&'a str>,
    pub status: IncidentStatus,
    pub source: IncidentSource,
    pub category: IncidentCategory,
    pub coordinates: Option<Coordinates>,
    pub address: Option<&'a str>,
}

impl ExtractedIncident {
    pub fn tracked(&self) -> TrackedFields<'_> {
        TrackedFields {
            title: &self.title,
            type_code: self.type_code.as_deref(),
            status: self.status,
            source: self.source,
            category: self.category,
            coordinates: self.coordinates,
            address: self.address.as_deref(),
        }
    }
}

/// Persisted incident
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    pub external_id: String,
    pub title: String,
    pub type_code: Option<String>,
    pub status: IncidentStatus,
    pub source: IncidentSource,
    pub category: IncidentCategory,
    pub coordinates: Option<Coordinates>,
    pub address: Option<String>,
    pub list_context: Option<ListContext>,
    pub page_details: Option<PageDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Incident {
    /// Build a freshly observed incident; all three timestamps are `now`
    pub fn first_seen(record: &ExtractedIncident, now: DateTime<Utc>) -> Self {
        Self {
            external_id: record.external_id.clone(),
            title: record.title.clone(),
            type_code: record.type_code.clone(),
            status: record.status,
            source: record.source,
            category: record.category,
            coordinates: record.coordinates,
            address: record.address.clone(),
            list_context: Some(record.list_context.clone()),
            page_details: None,
            created_at: now,
            updated_at: now,
            last_seen_at: now,
        }
    }

    pub fn tracked(&self) -> TrackedFields<'_> {
        TrackedFields {
            title: &self.title,
            type_code: self.type_code.as_deref(),
            status: self.status,
            source: self.source,
            category: self.category,
            coordinates: self.coordinates,
            address: self.address.as_deref(),
        }
    }

    /// Apply a new observation.
    ///
    /// Returns `true` when a tracked field changed, in which case `updated_at`
    /// moves to `now`. `last_seen_at` and the list context are refreshed either way.
    pub fn observe(&mut self, record: &ExtractedIncident, now: DateTime<Utc>) -> bool {
        let changed = self.tracked() != record.tracked();
        if changed {
            self.title.clone_from(&record.title);
            self.type_code.clone_from(&record.type_code);
            self.status = record.status;
            self.source = record.source;
            self.category = record.category;
            self.coordinates = record.coordinates;
            self.address.clone_from(&record.address);
            self.updated_at = now;
        }
        self.list_context = Some(record.list_context.clone());
        self.last_seen_at = now;
        changed
    }
}
