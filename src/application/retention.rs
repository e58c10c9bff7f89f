//! Daily retention and downsampling sweep

use chrono::{DateTime, Days, Duration, Local, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::application::reconciler::Reconciler;
use crate::domain::alliance::AllianceStat;
use crate::infrastructure::alliance_repository::AllianceRepository;
use crate::infrastructure::config::RetentionConfig;
use crate::infrastructure::sync_error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RetentionReport {
    pub incidents_deleted: u64,
    pub activity_deleted: u64,
    pub stats_deleted: u64,
}

/// Next occurrence of `hour:00` strictly after `now`, in `now`'s time zone.
///
/// A wall-clock hour skipped by a DST change resolves to the following hour.
pub fn next_run_after<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> Option<DateTime<Tz>> {
    let today = now.date_naive();
    let candidate = at_hour(&now.timezone(), today, hour)?;
    if candidate > *now {
        return Some(candidate);
    }
    at_hour(&now.timezone(), today.checked_add_days(Days::new(1))?, hour)
}

fn at_hour<Tz: TimeZone>(tz: &Tz, date: NaiveDate, hour: u32) -> Option<DateTime<Tz>> {
    let local = date.and_hms_opt(hour, 0, 0)?;
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
}

/// `now` minus `days`, or a config error when the horizon is not positive
/// or falls outside the representable range
pub fn horizon_cutoff(now: DateTime<Utc>, days: i64, name: &str) -> SyncResult<DateTime<Utc>> {
    if days < 1 {
        return Err(SyncError::Config(format!("retention.{name} must be at least 1, got {days}")));
    }
    Duration::try_days(days)
        .and_then(|horizon| now.checked_sub_signed(horizon))
        .ok_or_else(|| SyncError::Config(format!("retention.{name} is out of range: {days}")))
}

/// Ids of stat rows to delete so that each (org, UTC day) keeps only its latest row
pub fn stats_to_discard(stats: &[AllianceStat]) -> Vec<i64> {
    let mut latest: HashMap<(i64, NaiveDate), &AllianceStat> = HashMap::new();
    for stat in stats {
        let key = (stat.org_id, stat.captured_at.date_naive());
        latest
            .entry(key)
            .and_modify(|kept| {
                if (stat.captured_at, stat.id) > (kept.captured_at, kept.id) {
                    *kept = stat;
                }
            })
            .or_insert(stat);
    }

    let mut discard: Vec<i64> = stats
        .iter()
        .filter(|stat| {
            latest
                .get(&(stat.org_id, stat.captured_at.date_naive()))
                .is_some_and(|kept| kept.id != stat.id)
        })
        .map(|stat| stat.id)
        .collect();
    discard.sort_unstable();
    discard
}

pub struct RetentionSweep {
    reconciler: Arc<Reconciler>,
    alliance: AllianceRepository,
    config: RetentionConfig,
}

impl RetentionSweep {
    pub fn new(reconciler: Arc<Reconciler>, alliance: AllianceRepository, config: RetentionConfig) -> Self {
        Self {
            reconciler,
            alliance,
            config,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> SyncResult<RetentionReport> {
        let incident_cutoff = horizon_cutoff(now, self.config.incident_horizon_days, "incident_horizon_days")?;
        let activity_cutoff = horizon_cutoff(now, self.config.activity_horizon_days, "activity_horizon_days")?;
        let stats_cutoff = horizon_cutoff(
            now,
            self.config.stats_downsample_after_days,
            "stats_downsample_after_days",
        )?;

        let incidents_deleted = self.reconciler.delete_not_seen_since(incident_cutoff).await?;
        let activity_deleted = self.alliance.delete_activity_older_than(activity_cutoff).await?;

        let old_stats = self.alliance.stats_older_than(stats_cutoff).await?;
        let stats_deleted = self.alliance.delete_stats(&stats_to_discard(&old_stats)).await?;

        let report = RetentionReport {
            incidents_deleted,
            activity_deleted,
            stats_deleted,
        };
        info!(
            "Retention sweep: {} incidents, {} activity rows, {} stat rows removed",
            report.incidents_deleted, report.activity_deleted, report.stats_deleted
        );
        Ok(report)
    }

    /// Run daily at the configured local hour until cancelled. A failed run is
    /// logged and the next day is scheduled as usual.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Local::now();
                let Some(next) = next_run_after(&now, self.config.run_at_hour) else {
                    error!("Cannot schedule retention sweep at hour {}", self.config.run_at_hour);
                    return;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                info!("Next retention sweep at {}", next.format("%Y-%m-%d %H:%M"));

                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Retention sweep stopped");
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }

                if let Err(e) = self.run_once(Utc::now()).await {
                    error!("Retention sweep failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alliance::{NewAllianceStat, ObservedMember};
    use crate::domain::incident::{
        ExtractedIncident, Incident, IncidentCategory, IncidentSource, IncidentStatus, ListContext,
    };
    use crate::infrastructure::incident_repository::IncidentRepository;
    use crate::test_utils::TestDatabase;
    use chrono::FixedOffset;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, HashSet};

    fn stat(id: i64, org_id: i64, captured_at: DateTime<Utc>) -> AllianceStat {
        AllianceStat {
            id,
            org_id,
            org_name: "Wache".into(),
            rank: None,
            credits_total: id * 100,
            member_count: 1,
            members_online: 0,
            captured_at,
        }
    }

    fn utc(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn next_run_is_today_when_hour_is_ahead() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 5, 1, 1, 30, 0).unwrap();
        let next = next_run_after(&now, 3).unwrap();
        assert_eq!(next, tz.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap());
    }

    #[test]
    fn next_run_is_tomorrow_when_hour_has_passed() {
        let tz = FixedOffset::east_opt(0).unwrap();
        for (h, m) in [(3, 0), (23, 59)] {
            let now = tz.with_ymd_and_hms(2024, 12, 31, h, m, 0).unwrap();
            let next = next_run_after(&now, 3).unwrap();
            assert_eq!(next, tz.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap());
        }
    }

    #[test]
    fn invalid_hour_cannot_be_scheduled() {
        assert!(next_run_after(&Utc::now(), 24).is_none());
    }

    #[test]
    fn cutoff_lies_in_the_past() {
        let now = utc(10, 12);
        assert_eq!(horizon_cutoff(now, 7, "incident_horizon_days").unwrap(), utc(3, 12));
    }

    #[rstest::rstest]
    #[case(0)]
    #[case(-1)]
    #[case(i64::MAX)]
    #[case(i64::MIN)]
    fn unusable_horizon_is_a_config_error(#[case] days: i64) {
        let err = horizon_cutoff(utc(10, 12), days, "incident_horizon_days").unwrap_err();
        assert!(matches!(err, SyncError::Config(ref msg) if msg.contains("incident_horizon_days")));
    }

    #[test]
    fn keeps_latest_row_per_org_and_day() {
        // t=1 and t=2 on day one, t=3 on day two
        let stats = vec![stat(1, 7, utc(1, 1)), stat(2, 7, utc(1, 2)), stat(3, 7, utc(2, 3))];
        assert_eq!(stats_to_discard(&stats), vec![1]);
    }

    #[test]
    fn orgs_are_downsampled_independently() {
        let stats = vec![stat(1, 7, utc(1, 1)), stat(2, 8, utc(1, 1)), stat(3, 8, utc(1, 5))];
        assert_eq!(stats_to_discard(&stats), vec![2]);
    }

    proptest! {
        #[test]
        fn exactly_one_latest_row_survives_per_group(
            rows in prop::collection::vec((1i64..4, 0i64..(5 * 24 * 60)), 0..40)
        ) {
            let base = utc(1, 0);
            let stats: Vec<AllianceStat> = rows
                .iter()
                .enumerate()
                .map(|(i, (org, minutes))| stat(i as i64 + 1, *org, base + Duration::minutes(*minutes)))
                .collect();

            let discard: HashSet<i64> = stats_to_discard(&stats).into_iter().collect();
            let kept: Vec<&AllianceStat> = stats.iter().filter(|s| !discard.contains(&s.id)).collect();

            let groups: HashSet<(i64, NaiveDate)> =
                stats.iter().map(|s| (s.org_id, s.captured_at.date_naive())).collect();
            prop_assert_eq!(kept.len(), groups.len());

            for survivor in kept {
                let key = (survivor.org_id, survivor.captured_at.date_naive());
                let newest = stats
                    .iter()
                    .filter(|s| (s.org_id, s.captured_at.date_naive()) == key)
                    .map(|s| s.captured_at)
                    .max();
                prop_assert_eq!(Some(survivor.captured_at), newest);
            }
        }
    }

    #[tokio::test]
    async fn sweep_prunes_each_table_by_its_horizon() {
        let db = TestDatabase::new().await;
        let incidents = IncidentRepository::new(db.pool());
        let alliance = AllianceRepository::new(db.pool());
        let now = Utc::now();

        for (id, seen) in [("old", now - Duration::days(10)), ("fresh", now)] {
            let record = ExtractedIncident {
                external_id: id.into(),
                title: "Rauchentwicklung".into(),
                type_code: None,
                status: IncidentStatus::Unclaimed,
                source: IncidentSource::Own,
                category: IncidentCategory::Emergency,
                coordinates: None,
                address: None,
                list_context: ListContext::default(),
            };
            incidents.insert(&Incident::first_seen(&record, seen)).await.unwrap();
        }

        let member = ObservedMember {
            member_id: "5".into(),
            name: "Jo".into(),
            roles: vec![],
            online: true,
            role_flags: BTreeMap::new(),
        };
        alliance
            .upsert_member_with_activity(&member, now - Duration::days(40))
            .await
            .unwrap();

        let old_day = (now - Duration::days(60)).date_naive();
        for hour in [1, 2] {
            let captured_at = old_day.and_hms_opt(hour, 0, 0).unwrap().and_utc();
            alliance
                .insert_stat(&NewAllianceStat {
                    org_id: 1,
                    org_name: "Wache".into(),
                    rank: Some(1),
                    credits_total: 10,
                    member_count: 1,
                    members_online: 1,
                    captured_at,
                })
                .await
                .unwrap();
        }

        let config = RetentionConfig {
            incident_horizon_days: 7,
            activity_horizon_days: 30,
            stats_downsample_after_days: 30,
            run_at_hour: 3,
        };
        let sweep = RetentionSweep::new(Arc::new(Reconciler::new(incidents.clone())), alliance.clone(), config);
        let report = sweep.run_once(now).await.unwrap();

        assert_eq!(
            report,
            RetentionReport {
                incidents_deleted: 1,
                activity_deleted: 1,
                stats_deleted: 1
            }
        );
        assert_eq!(incidents.all_ids().await.unwrap(), vec!["fresh".to_string()]);
        let remaining = alliance.list_stats(1).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].captured_at.time().format("%H").to_string(), "02");

        let again = sweep.run_once(now).await.unwrap();
        assert_eq!(again, RetentionReport::default());
    }

    #[tokio::test]
    async fn negative_horizon_deletes_nothing() {
        let db = TestDatabase::new().await;
        let incidents = IncidentRepository::new(db.pool());
        let now = Utc::now();
        let record = ExtractedIncident {
            external_id: "live".into(),
            title: "Verkehrsunfall".into(),
            type_code: None,
            status: IncidentStatus::Unclaimed,
            source: IncidentSource::Own,
            category: IncidentCategory::Emergency,
            coordinates: None,
            address: None,
            list_context: ListContext::default(),
        };
        incidents.insert(&Incident::first_seen(&record, now)).await.unwrap();

        let config = RetentionConfig {
            incident_horizon_days: -1,
            ..RetentionConfig::default()
        };
        let sweep = RetentionSweep::new(
            Arc::new(Reconciler::new(incidents.clone())),
            AllianceRepository::new(db.pool()),
            config,
        );

        assert!(matches!(sweep.run_once(now).await, Err(SyncError::Config(_))));
        assert_eq!(incidents.all_ids().await.unwrap(), vec!["live".to_string()]);
    }
}
