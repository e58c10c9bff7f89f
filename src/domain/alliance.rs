//! Alliance aggregate statistics and membership presence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Immutable point of the alliance statistics time series
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllianceStat {
    pub id: i64,
    pub org_id: i64,
    pub org_name: String,
    pub rank: Option<i64>,
    pub credits_total: i64,
    pub member_count: i64,
    pub members_online: i64,
    pub captured_at: DateTime<Utc>,
}

/// Values of a stat row before it is inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewAllianceStat {
    pub org_id: i64,
    pub org_name: String,
    pub rank: Option<i64>,
    pub credits_total: i64,
    pub member_count: i64,
    pub members_online: i64,
    pub captured_at: DateTime<Utc>,
}

/// Change of a stat row compared with the 24h baseline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatDelta {
    pub credits: i64,
    /// Positive when the alliance climbed (rank number went down)
    pub rank: Option<i64>,
    pub baseline_captured_at: DateTime<Utc>,
}

impl StatDelta {
    pub fn between(current: &AllianceStat, baseline: &AllianceStat) -> Self {
        Self {
            credits: current.credits_total - baseline.credits_total,
            rank: match (current.rank, baseline.rank) {
                (Some(now), Some(then)) => Some(then - now),
                _ => None,
            },
            baseline_captured_at: baseline.captured_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllianceMember {
    pub member_id: String,
    pub name: String,
    pub roles: Vec<String>,
    pub online: bool,
    pub role_flags: BTreeMap<String, bool>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_online_at: Option<DateTime<Utc>>,
}

/// Member as reported by one poll
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedMember {
    pub member_id: String,
    pub name: String,
    pub roles: Vec<String>,
    pub online: bool,
    pub role_flags: BTreeMap<String, bool>,
}

impl ObservedMember {
    /// Whether this observation flips the stored online state.
    ///
    /// A member seen for the first time counts as a transition only when online,
    /// so the activity log never starts with a redundant "offline" row.
    pub fn is_transition_from(&self, previous: Option<&AllianceMember>) -> bool {
        match previous {
            Some(stored) => stored.online != self.online,
            None => self.online,
        }
    }
}

/// One row of the activity log, appended on online transitions only
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberActivity {
    pub id: i64,
    pub member_id: String,
    pub online: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberCounts {
    pub total: usize,
    pub online: usize,
}

impl MemberCounts {
    pub fn of(members: &[AllianceMember]) -> Self {
        Self {
            total: members.len(),
            online: members.iter().filter(|m| m.online).count(),
        }
    }
}

/// Members hidden from every member-facing output.
///
/// An entry matches a member by exact id or by case-insensitive name.
#[derive(Debug, Clone, Default)]
pub struct MemberExclusions {
    ids: HashSet<String>,
    names: HashSet<String>,
}

impl MemberExclusions {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut exclusions = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            exclusions.ids.insert(entry.to_string());
            exclusions.names.insert(entry.to_lowercase());
        }
        exclusions
    }

    pub fn excludes(&self, member_id: &str, name: &str) -> bool {
        self.ids.contains(member_id) || self.names.contains(&name.trim().to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(online: bool) -> AllianceMember {
        let now = Utc::now();
        AllianceMember {
            member_id: "42".into(),
            name: "Kathi".into(),
            roles: vec![],
            online,
            role_flags: BTreeMap::new(),
            first_seen_at: now,
            last_seen_at: now,
            last_online_at: None,
        }
    }

    fn observed(online: bool) -> ObservedMember {
        ObservedMember {
            member_id: "42".into(),
            name: "Kathi".into(),
            roles: vec![],
            online,
            role_flags: BTreeMap::new(),
        }
    }

    #[test]
    fn transition_detection() {
        assert!(observed(true).is_transition_from(None));
        assert!(!observed(false).is_transition_from(None));
        assert!(!observed(true).is_transition_from(Some(&stored(true))));
        assert!(observed(false).is_transition_from(Some(&stored(true))));
    }

    #[test]
    fn exclusions_match_id_exactly_and_name_case_insensitively() {
        let exclusions = MemberExclusions::new(["1001", "Leitstelle Bot", " "]);
        assert!(exclusions.excludes("1001", "someone"));
        assert!(exclusions.excludes("7", "leitstelle bot"));
        assert!(exclusions.excludes("7", "LEITSTELLE BOT"));
        assert!(!exclusions.excludes("10011", "someone else"));
    }

    #[test]
    fn delta_against_baseline() {
        let now = Utc::now();
        let mk = |credits, rank| AllianceStat {
            id: 0,
            org_id: 1,
            org_name: "Nord".into(),
            rank,
            credits_total: credits,
            member_count: 10,
            members_online: 2,
            captured_at: now,
        };
        let delta = StatDelta::between(&mk(1_500, Some(40)), &mk(1_000, Some(45)));
        assert_eq!(delta.credits, 500);
        assert_eq!(delta.rank, Some(5));
    }
}
