//! Repository for alliance statistics, members and the member activity log

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use crate::domain::alliance::{
    AllianceMember, AllianceStat, MemberActivity, NewAllianceStat, ObservedMember,
};
use crate::infrastructure::sync_error::SyncResult;

const STAT_COLUMNS: &str =
    "id, org_id, org_name, rank, credits_total, member_count, members_online, captured_at";
const MEMBER_COLUMNS: &str =
    "member_id, name, roles, online, role_flags, first_seen_at, last_seen_at, last_online_at";

#[derive(Clone)]
pub struct AllianceRepository {
    pool: Arc<SqlitePool>,
}

/// Outcome of one member upsert
#[derive(Debug, Clone, PartialEq)]
pub struct MemberUpsert {
    pub member: AllianceMember,
    pub created: bool,
    /// An activity row was appended
    pub transitioned: bool,
}

impl AllianceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    // ===============================
    // STATISTICS
    // ===============================

    /// Append one immutable stat point
    pub async fn insert_stat(&self, stat: &NewAllianceStat) -> SyncResult<AllianceStat> {
        let result = sqlx::query(
            r#"
            INSERT INTO alliance_stats
            (org_id, org_name, rank, credits_total, member_count, members_online, captured_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(stat.org_id)
        .bind(&stat.org_name)
        .bind(stat.rank)
        .bind(stat.credits_total)
        .bind(stat.member_count)
        .bind(stat.members_online)
        .bind(stat.captured_at)
        .execute(&*self.pool)
        .await?;

        Ok(AllianceStat {
            id: result.last_insert_rowid(),
            org_id: stat.org_id,
            org_name: stat.org_name.clone(),
            rank: stat.rank,
            credits_total: stat.credits_total,
            member_count: stat.member_count,
            members_online: stat.members_online,
            captured_at: stat.captured_at,
        })
    }

    pub async fn latest_stat_at_or_before(
        &self,
        org_id: i64,
        at: DateTime<Utc>,
    ) -> SyncResult<Option<AllianceStat>> {
        let row = sqlx::query(&format!(
            "SELECT {STAT_COLUMNS} FROM alliance_stats
             WHERE org_id = ? AND captured_at <= ?
             ORDER BY captured_at DESC, id DESC LIMIT 1"
        ))
        .bind(org_id)
        .bind(at)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(stat_from_row).transpose()
    }

    pub async fn earliest_stat_since(
        &self,
        org_id: i64,
        since: DateTime<Utc>,
    ) -> SyncResult<Option<AllianceStat>> {
        let row = sqlx::query(&format!(
            "SELECT {STAT_COLUMNS} FROM alliance_stats
             WHERE org_id = ? AND captured_at >= ?
             ORDER BY captured_at ASC, id ASC LIMIT 1"
        ))
        .bind(org_id)
        .bind(since)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(stat_from_row).transpose()
    }

    pub async fn stats_older_than(&self, cutoff: DateTime<Utc>) -> SyncResult<Vec<AllianceStat>> {
        let rows = sqlx::query(&format!(
            "SELECT {STAT_COLUMNS} FROM alliance_stats WHERE captured_at < ? ORDER BY org_id, captured_at"
        ))
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(stat_from_row).collect()
    }

    pub async fn list_stats(&self, org_id: i64) -> SyncResult<Vec<AllianceStat>> {
        let rows = sqlx::query(&format!(
            "SELECT {STAT_COLUMNS} FROM alliance_stats WHERE org_id = ? ORDER BY captured_at"
        ))
        .bind(org_id)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(stat_from_row).collect()
    }

    /// Delete stat rows by id in one transaction
    pub async fn delete_stats(&self, ids: &[i64]) -> SyncResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM alliance_stats WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        Ok(removed)
    }

    // ===============================
    // MEMBERS
    // ===============================

    pub async fn find_member(&self, member_id: &str) -> SyncResult<Option<AllianceMember>> {
        let row = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM alliance_members WHERE member_id = ?"
        ))
        .bind(member_id)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(member_from_row).transpose()
    }

    pub async fn list_members(&self) -> SyncResult<Vec<AllianceMember>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM alliance_members ORDER BY name COLLATE NOCASE, member_id"
        ))
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(member_from_row).collect()
    }

    /// Upsert one member and, on an online transition, append to the activity log.
    ///
    /// Both writes share one transaction.
    pub async fn upsert_member_with_activity(
        &self,
        observed: &ObservedMember,
        now: DateTime<Utc>,
    ) -> SyncResult<MemberUpsert> {
        let mut tx = self.pool.begin().await?;

        let previous = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM alliance_members WHERE member_id = ?"
        ))
        .bind(&observed.member_id)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(member_from_row)
        .transpose()?;

        let transitioned = observed.is_transition_from(previous.as_ref());
        let member = AllianceMember {
            member_id: observed.member_id.clone(),
            name: observed.name.clone(),
            roles: observed.roles.clone(),
            online: observed.online,
            role_flags: observed.role_flags.clone(),
            first_seen_at: previous.as_ref().map_or(now, |p| p.first_seen_at),
            last_seen_at: now,
            last_online_at: if observed.online {
                Some(now)
            } else {
                previous.as_ref().and_then(|p| p.last_online_at)
            },
        };

        sqlx::query(
            r#"
            INSERT INTO alliance_members
            (member_id, name, roles, online, role_flags, first_seen_at, last_seen_at, last_online_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(member_id) DO UPDATE SET
                name = excluded.name,
                roles = excluded.roles,
                online = excluded.online,
                role_flags = excluded.role_flags,
                last_seen_at = excluded.last_seen_at,
                last_online_at = excluded.last_online_at
            "#,
        )
        .bind(&member.member_id)
        .bind(&member.name)
        .bind(serde_json::to_string(&member.roles)?)
        .bind(member.online)
        .bind(serde_json::to_string(&member.role_flags)?)
        .bind(member.first_seen_at)
        .bind(member.last_seen_at)
        .bind(member.last_online_at)
        .execute(&mut *tx)
        .await?;

        if transitioned {
            sqlx::query(
                "INSERT INTO member_activity_log (member_id, online, recorded_at) VALUES (?, ?, ?)",
            )
            .bind(&member.member_id)
            .bind(member.online)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(MemberUpsert {
            member,
            created: previous.is_none(),
            transitioned,
        })
    }

    // ===============================
    // ACTIVITY LOG
    // ===============================

    pub async fn activity_for(&self, member_id: &str) -> SyncResult<Vec<MemberActivity>> {
        let rows = sqlx::query(
            "SELECT id, member_id, online, recorded_at FROM member_activity_log
             WHERE member_id = ? ORDER BY recorded_at, id",
        )
        .bind(member_id)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(MemberActivity {
                    id: row.try_get("id")?,
                    member_id: row.try_get("member_id")?,
                    online: row.try_get("online")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    pub async fn delete_activity_older_than(&self, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM member_activity_log WHERE recorded_at < ?")
            .bind(cutoff)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn stat_from_row(row: &SqliteRow) -> SyncResult<AllianceStat> {
    Ok(AllianceStat {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        org_name: row.try_get("org_name")?,
        rank: row.try_get("rank")?,
        credits_total: row.try_get("credits_total")?,
        member_count: row.try_get("member_count")?,
        members_online: row.try_get("members_online")?,
        captured_at: row.try_get("captured_at")?,
    })
}

fn member_from_row(row: &SqliteRow) -> SyncResult<AllianceMember> {
    let roles: String = row.try_get("roles")?;
    let role_flags: String = row.try_get("role_flags")?;

    Ok(AllianceMember {
        member_id: row.try_get("member_id")?,
        name: row.try_get("name")?,
        roles: serde_json::from_str(&roles)?,
        online: row.try_get("online")?,
        role_flags: serde_json::from_str(&role_flags)?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        last_online_at: row.try_get("last_online_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database_connection::DatabaseConnection;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, AllianceRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("alliance.db").display());
        let db = DatabaseConnection::new(&url).await.unwrap();
        db.migrate().await.unwrap();
        (dir, AllianceRepository::new(db.pool().clone()))
    }

    fn stat(credits: i64, captured_at: DateTime<Utc>) -> NewAllianceStat {
        NewAllianceStat {
            org_id: 77,
            org_name: "Rettungsverbund Nord".into(),
            rank: Some(120),
            credits_total: credits,
            member_count: 40,
            members_online: 6,
            captured_at,
        }
    }

    fn observed(online: bool) -> ObservedMember {
        ObservedMember {
            member_id: "501".into(),
            name: "Jonas".into(),
            roles: vec!["admin".into()],
            online,
            role_flags: BTreeMap::from([("admin".to_string(), true)]),
        }
    }

    #[tokio::test]
    async fn stat_baseline_queries() {
        let (_dir, repo) = setup().await;
        let now = Utc::now();
        repo.insert_stat(&stat(100, now - Duration::hours(30))).await.unwrap();
        repo.insert_stat(&stat(200, now - Duration::hours(25))).await.unwrap();
        repo.insert_stat(&stat(300, now - Duration::hours(2))).await.unwrap();

        let before = repo
            .latest_stat_at_or_before(77, now - Duration::hours(24))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.credits_total, 200);

        let since = repo
            .earliest_stat_since(77, now - Duration::hours(24))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(since.credits_total, 300);

        assert!(repo.latest_stat_at_or_before(78, now).await.unwrap().is_none());
        assert_eq!(repo.stats_older_than(now - Duration::hours(24)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn repeated_online_observation_logs_one_transition() {
        let (_dir, repo) = setup().await;
        let t0 = Utc::now();

        let first = repo.upsert_member_with_activity(&observed(true), t0).await.unwrap();
        let second = repo
            .upsert_member_with_activity(&observed(true), t0 + Duration::seconds(60))
            .await
            .unwrap();

        assert!(first.created && first.transitioned);
        assert!(!second.created && !second.transitioned);
        assert_eq!(repo.activity_for("501").await.unwrap().len(), 1);

        let stored = repo.find_member("501").await.unwrap().unwrap();
        assert_eq!(stored.first_seen_at, t0);
        assert_eq!(stored.last_online_at, Some(t0 + Duration::seconds(60)));
    }

    #[tokio::test]
    async fn going_offline_keeps_last_online_at() {
        let (_dir, repo) = setup().await;
        let t0 = Utc::now();
        repo.upsert_member_with_activity(&observed(true), t0).await.unwrap();

        let offline = repo
            .upsert_member_with_activity(&observed(false), t0 + Duration::seconds(60))
            .await
            .unwrap();

        assert!(offline.transitioned);
        assert_eq!(offline.member.last_online_at, Some(t0));
        let log = repo.activity_for("501").await.unwrap();
        assert_eq!(log.iter().map(|a| a.online).collect::<Vec<_>>(), vec![true, false]);
    }

    #[tokio::test]
    async fn activity_retention() {
        let (_dir, repo) = setup().await;
        let now = Utc::now();
        repo.upsert_member_with_activity(&observed(true), now - Duration::days(40))
            .await
            .unwrap();
        repo.upsert_member_with_activity(&observed(false), now).await.unwrap();

        let removed = repo
            .delete_activity_older_than(now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.activity_for("501").await.unwrap().len(), 1);
    }
}
