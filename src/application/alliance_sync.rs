//! Alliance statistics and member presence pollers
//!
//! Both read the same JSON endpoint through the shared browser session.

use chrono::{Duration, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::alliance::{
    AllianceMember, AllianceStat, MemberCounts, MemberExclusions, NewAllianceStat, ObservedMember,
    StatDelta,
};
use crate::domain::events::LiveEvent;
use crate::infrastructure::alliance_repository::AllianceRepository;
use crate::infrastructure::browser::BrowserHandle;
use crate::infrastructure::config::{MemberConfig, SourceConfig};
use crate::infrastructure::live_broadcaster::LiveBroadcaster;
use crate::infrastructure::parsing_error::ParsingError;
use crate::infrastructure::sync_error::{SyncError, SyncResult};

/// Payload of the alliance info endpoint; unknown fields are ignored
#[derive(Debug, Clone, Deserialize)]
pub struct AllianceInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub rank: Option<i64>,
    #[serde(default)]
    pub credits_total: i64,
    #[serde(default)]
    pub user_count: i64,
    #[serde(default)]
    pub user_online_count: i64,
    #[serde(default)]
    pub users: Vec<AllianceUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllianceUser {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub role_flags: BTreeMap<String, bool>,
}

impl From<AllianceUser> for ObservedMember {
    fn from(user: AllianceUser) -> Self {
        Self {
            member_id: user.id,
            name: user.name,
            roles: user.roles,
            online: user.online,
            role_flags: user.role_flags,
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(text) => text,
        Id::Number(number) => number.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberSyncReport {
    pub members: Vec<AllianceMember>,
    pub counts: MemberCounts,
    pub transitions: usize,
    pub excluded: usize,
}

pub struct AllianceSync {
    browser: BrowserHandle,
    info_url: String,
    repository: AllianceRepository,
    broadcaster: Arc<LiveBroadcaster>,
    exclusions: MemberExclusions,
}

impl AllianceSync {
    pub fn new(
        browser: BrowserHandle,
        source: &SourceConfig,
        members: &MemberConfig,
        repository: AllianceRepository,
        broadcaster: Arc<LiveBroadcaster>,
    ) -> Self {
        Self {
            browser,
            info_url: source.alliance_info_url(),
            repository,
            broadcaster,
            exclusions: MemberExclusions::new(&members.excluded),
        }
    }

    pub async fn fetch_info(&self) -> SyncResult<AllianceInfo> {
        let payload: Value = self.browser.fetch_json(&self.info_url).await?;
        serde_json::from_value(payload).map_err(|e| {
            SyncError::Parsing(ParsingError::UnexpectedPayload {
                message: format!("alliance info: {e}"),
            })
        })
    }

    /// Append one stat row and broadcast it with its 24h delta
    pub async fn sync_stats(&self) -> SyncResult<(AllianceStat, Option<StatDelta>)> {
        let info = self.fetch_info().await?;
        let now = Utc::now();

        let stat = self
            .repository
            .insert_stat(&NewAllianceStat {
                org_id: info.id,
                org_name: info.name,
                rank: info.rank,
                credits_total: info.credits_total,
                member_count: info.user_count,
                members_online: info.user_online_count,
                captured_at: now,
            })
            .await?;

        let day_ago = now - Duration::hours(24);
        let baseline = match self.repository.latest_stat_at_or_before(stat.org_id, day_ago).await? {
            Some(row) => Some(row),
            None => self.repository.earliest_stat_since(stat.org_id, day_ago).await?,
        };
        let delta = baseline
            .filter(|row| row.id != stat.id)
            .map(|row| StatDelta::between(&stat, &row));

        info!(
            "Alliance stats: {} credits, rank {:?}, {}/{} online (24h delta {:?})",
            stat.credits_total,
            stat.rank,
            stat.members_online,
            stat.member_count,
            delta.as_ref().map(|d| d.credits)
        );

        self.broadcaster
            .publish(LiveEvent::AllianceStats {
                stat: stat.clone(),
                delta_24h: delta.clone(),
                timestamp: Utc::now(),
            })
            .await;

        Ok((stat, delta))
    }

    /// Upsert the visible members and broadcast the list with counts
    pub async fn sync_members(&self) -> SyncResult<MemberSyncReport> {
        let info = self.fetch_info().await?;
        let now = Utc::now();

        let mut members = Vec::with_capacity(info.users.len());
        let mut transitions = 0;
        let mut excluded = 0;

        for user in info.users {
            if self.exclusions.excludes(&user.id, &user.name) {
                excluded += 1;
                continue;
            }
            let upsert = self
                .repository
                .upsert_member_with_activity(&ObservedMember::from(user), now)
                .await?;
            if upsert.transitioned {
                debug!(
                    "Member {} is now {}",
                    upsert.member.name,
                    if upsert.member.online { "online" } else { "offline" }
                );
                transitions += 1;
            }
            members.push(upsert.member);
        }

        let counts = MemberCounts::of(&members);
        info!(
            "Members: {} online of {} ({} transitions, {} excluded)",
            counts.online, counts.total, transitions, excluded
        );

        self.broadcaster
            .publish(LiveEvent::Members {
                members: members.clone(),
                counts,
                timestamp: Utc::now(),
            })
            .await;

        Ok(MemberSyncReport {
            members,
            counts,
            transitions,
            excluded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeSite, TestDatabase, source_config};
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn info(online_ids: &[i64]) -> Value {
        let users: Vec<Value> = [(1, "Anna"), (2, "Ben"), (3, "Leitstelle Bot")]
            .iter()
            .map(|(id, name)| {
                json!({
                    "id": id,
                    "name": name,
                    "roles": ["member"],
                    "online": online_ids.contains(id),
                    "role_flags": {"admin": false},
                    "caption": "ignored"
                })
            })
            .collect();
        json!({
            "id": 900,
            "name": "Wache Süd",
            "rank": 310,
            "credits_total": 5_000_000,
            "user_count": 3,
            "user_online_count": online_ids.len(),
            "users": users
        })
    }

    async fn setup(payload: Value) -> (TestDatabase, FakeSite, AllianceSync, Arc<LiveBroadcaster>) {
        let db = TestDatabase::new().await;
        let site = FakeSite::new(true);
        site.with(|s| {
            s.logged_in = true;
            s.alliance_info = payload;
        });
        let (browser, _worker) = BrowserHandle::spawn(site.session());
        let broadcaster = Arc::new(LiveBroadcaster::new(StdDuration::from_millis(100), 16));
        let members = MemberConfig {
            excluded: vec!["leitstelle bot".to_string()],
        };
        let sync = AllianceSync::new(
            browser,
            &source_config(),
            &members,
            AllianceRepository::new(db.pool()),
            broadcaster.clone(),
        );
        (db, site, sync, broadcaster)
    }

    #[tokio::test]
    async fn first_stat_has_no_delta_and_is_broadcast() {
        let (_db, _site, sync, broadcaster) = setup(info(&[1])).await;
        let mut sub = broadcaster.subscribe().await;
        sub.receiver.recv().await; // connected

        let (stat, delta) = sync.sync_stats().await.unwrap();

        assert_eq!(stat.org_id, 900);
        assert_eq!(stat.credits_total, 5_000_000);
        assert!(delta.is_none());
        assert!(matches!(sub.receiver.recv().await, Some(LiveEvent::AllianceStats { .. })));
    }

    #[tokio::test]
    async fn delta_against_day_old_row() {
        let (db, _site, sync, _broadcaster) = setup(info(&[1])).await;
        let repo = AllianceRepository::new(db.pool());
        repo.insert_stat(&NewAllianceStat {
            org_id: 900,
            org_name: "Wache Süd".into(),
            rank: Some(320),
            credits_total: 4_000_000,
            member_count: 3,
            members_online: 0,
            captured_at: Utc::now() - Duration::hours(26),
        })
        .await
        .unwrap();

        let (_, delta) = sync.sync_stats().await.unwrap();

        let delta = delta.unwrap();
        assert_eq!(delta.credits, 1_000_000);
        assert_eq!(delta.rank, Some(10));
    }

    #[tokio::test]
    async fn members_are_filtered_and_transitions_deduplicated() {
        let (db, site, sync, _broadcaster) = setup(info(&[1])).await;

        let first = sync.sync_members().await.unwrap();
        let second = sync.sync_members().await.unwrap();

        assert_eq!(first.counts, MemberCounts { total: 2, online: 1 });
        assert_eq!(first.excluded, 1);
        assert_eq!(first.transitions, 1);
        assert_eq!(second.transitions, 0);

        let repo = AllianceRepository::new(db.pool());
        assert_eq!(repo.activity_for("1").await.unwrap().len(), 1);
        assert!(repo.find_member("3").await.unwrap().is_none());

        site.with(|s| s.alliance_info = info(&[2]));
        let third = sync.sync_members().await.unwrap();
        assert_eq!(third.transitions, 2);
        assert_eq!(third.counts.online, 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_parsing_error() {
        let (_db, _site, sync, _broadcaster) = setup(json!({"unexpected": true})).await;
        assert!(matches!(sync.sync_members().await, Err(SyncError::Parsing(_))));
    }
}
