//! Event types for the live-update stream
//!
//! Every variant carries its emission timestamp. The SSE event name is taken
//! from [`LiveEvent::event_name`], the data line is the JSON of the variant.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::alliance::{AllianceMember, AllianceStat, MemberCounts, StatDelta};
use super::incident::Incident;

/// Whether a single incident event is a creation or an update
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IncidentAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    /// Sent once to a sink right after it subscribes
    Connected {
        subscriber_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        subscribers: usize,
        timestamp: DateTime<Utc>,
    },
    Incident {
        action: IncidentAction,
        incident: Incident,
        timestamp: DateTime<Utc>,
    },
    /// Several incidents changed in one cycle
    Batch {
        kind: &'static str,
        created: usize,
        updated: usize,
        incidents: Vec<Incident>,
        timestamp: DateTime<Utc>,
    },
    Deleted {
        ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    AllianceStats {
        stat: AllianceStat,
        delta_24h: Option<StatDelta>,
        timestamp: DateTime<Utc>,
    },
    Members {
        members: Vec<AllianceMember>,
        counts: MemberCounts,
        timestamp: DateTime<Utc>,
    },
}

pub const BATCH_UPSERT_KIND: &str = "batch_upsert";

impl LiveEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            LiveEvent::Connected { .. } => "connected",
            LiveEvent::Heartbeat { .. } => "heartbeat",
            LiveEvent::Incident { .. } => "incident",
            LiveEvent::Batch { .. } => "batch",
            LiveEvent::Deleted { .. } => "deleted",
            LiveEvent::AllianceStats { .. } => "alliance_stats",
            LiveEvent::Members { .. } => "members",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LiveEvent::Connected { timestamp, .. }
            | LiveEvent::Heartbeat { timestamp, .. }
            | LiveEvent::Incident { timestamp, .. }
            | LiveEvent::Batch { timestamp, .. }
            | LiveEvent::Deleted { timestamp, .. }
            | LiveEvent::AllianceStats { timestamp, .. }
            | LiveEvent::Members { timestamp, .. } => *timestamp,
        }
    }

    pub fn heartbeat(subscribers: usize) -> Self {
        LiveEvent::Heartbeat {
            subscribers,
            timestamp: Utc::now(),
        }
    }

    pub fn deleted(ids: Vec<String>) -> Self {
        LiveEvent::Deleted {
            ids,
            timestamp: Utc::now(),
        }
    }
}
