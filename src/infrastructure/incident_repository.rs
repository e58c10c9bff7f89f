//! Repository for the `incidents` table
//!
//! Tags are stored as their snake_case text, the list context and page details
//! as JSON documents. The tracked-field update path and the page-details path
//! are separate statements so that detail merges never move `updated_at`.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use crate::domain::incident::{Coordinates, Incident, ListContext, PageDetails};
use crate::infrastructure::sync_error::{SyncError, SyncResult};

const SELECT_COLUMNS: &str = r#"
    SELECT external_id, title, type_code, status, source, category, latitude, longitude,
           address, list_context, page_details, created_at, updated_at, last_seen_at
    FROM incidents
"#;

#[derive(Clone)]
pub struct IncidentRepository {
    pool: Arc<SqlitePool>,
}

impl IncidentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn find_by_external_id(&self, external_id: &str) -> SyncResult<Option<Incident>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE external_id = ?"))
            .bind(external_id)
            .fetch_optional(&*self.pool)
            .await?;

        row.as_ref().map(incident_from_row).transpose()
    }

    pub async fn insert(&self, incident: &Incident) -> SyncResult<()> {
        let list_context = incident
            .list_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let page_details = incident
            .page_details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO incidents
            (external_id, title, type_code, status, source, category, latitude, longitude,
             address, list_context, page_details, created_at, updated_at, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&incident.external_id)
        .bind(&incident.title)
        .bind(&incident.type_code)
        .bind(incident.status.as_str())
        .bind(incident.source.as_str())
        .bind(incident.category.as_str())
        .bind(incident.coordinates.map(|c| c.latitude))
        .bind(incident.coordinates.map(|c| c.longitude))
        .bind(&incident.address)
        .bind(list_context)
        .bind(page_details)
        .bind(incident.created_at)
        .bind(incident.updated_at)
        .bind(incident.last_seen_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Write tracked fields, `updated_at`, `last_seen_at` and the list context.
    /// `created_at` and the page details are left alone.
    pub async fn update(&self, incident: &Incident) -> SyncResult<()> {
        let list_context = incident
            .list_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            UPDATE incidents
            SET title = ?, type_code = ?, status = ?, source = ?, category = ?,
                latitude = ?, longitude = ?, address = ?, list_context = ?,
                updated_at = ?, last_seen_at = ?
            WHERE external_id = ?
            "#,
        )
        .bind(&incident.title)
        .bind(&incident.type_code)
        .bind(incident.status.as_str())
        .bind(incident.source.as_str())
        .bind(incident.category.as_str())
        .bind(incident.coordinates.map(|c| c.latitude))
        .bind(incident.coordinates.map(|c| c.longitude))
        .bind(&incident.address)
        .bind(list_context)
        .bind(incident.updated_at)
        .bind(incident.last_seen_at)
        .bind(&incident.external_id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Replace the page details of one incident. Returns whether the row exists.
    pub async fn update_page_details(
        &self,
        external_id: &str,
        details: &PageDetails,
    ) -> SyncResult<bool> {
        let result = sqlx::query("UPDATE incidents SET page_details = ? WHERE external_id = ?")
            .bind(serde_json::to_string(details)?)
            .bind(external_id)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn all_ids(&self) -> SyncResult<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT external_id FROM incidents ORDER BY external_id")
            .fetch_all(&*self.pool)
            .await?;
        Ok(ids)
    }

    pub async fn list_all(&self) -> SyncResult<Vec<Incident>> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY created_at, external_id"))
            .fetch_all(&*self.pool)
            .await?;
        rows.iter().map(incident_from_row).collect()
    }

    /// Delete the given ids in one transaction, returning the number of removed rows
    pub async fn delete_by_ids(&self, external_ids: &[String]) -> SyncResult<u64> {
        if external_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for external_id in external_ids {
            removed += sqlx::query("DELETE FROM incidents WHERE external_id = ?")
                .bind(external_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        Ok(removed)
    }

    /// Retention: drop incidents whose `last_seen_at` is older than `cutoff`
    pub async fn delete_not_seen_since(&self, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM incidents WHERE last_seen_at < ?")
            .bind(cutoff)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn decode_error(e: impl std::error::Error + Send + Sync + 'static) -> SyncError {
    SyncError::Persistence(sqlx::Error::Decode(Box::new(e)))
}

fn incident_from_row(row: &SqliteRow) -> SyncResult<Incident> {
    let status: String = row.try_get("status")?;
    let source: String = row.try_get("source")?;
    let category: String = row.try_get("category")?;
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    let list_context: Option<String> = row.try_get("list_context")?;
    let page_details: Option<String> = row.try_get("page_details")?;

    Ok(Incident {
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        type_code: row.try_get("type_code")?,
        status: status.parse().map_err(decode_error)?,
        source: source.parse().map_err(decode_error)?,
        category: category.parse().map_err(decode_error)?,
        coordinates: latitude
            .zip(longitude)
            .map(|(latitude, longitude)| Coordinates { latitude, longitude }),
        address: row.try_get("address")?,
        list_context: list_context
            .map(|json| serde_json::from_str::<ListContext>(&json))
            .transpose()?,
        page_details: page_details
            .map(|json| serde_json::from_str::<PageDetails>(&json))
            .transpose()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}
