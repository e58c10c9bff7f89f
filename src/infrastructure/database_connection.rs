// Database connection and pool management
// This module handles SQLite database connections using sqlx

use anyhow::Result;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::path::Path;
use tracing::info;

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_max_connections(database_url, 5).await
    }

    pub async fn with_max_connections(database_url: &str, max_connections: u32) -> Result<Self> {
        let db_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        // Create the database file (and its directory) if it doesn't exist
        if !Path::new(db_path).exists() {
            if let Some(parent) = Path::new(db_path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::File::create(db_path).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to database: {}", db_path);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        let create_incidents_sql = r#"
            CREATE TABLE IF NOT EXISTS incidents (
                external_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                type_code TEXT,
                status TEXT NOT NULL,
                source TEXT NOT NULL,
                category TEXT NOT NULL,
                latitude REAL,
                longitude REAL,
                address TEXT,
                list_context TEXT,
                page_details TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                last_seen_at DATETIME NOT NULL
            )
        "#;

        let create_alliance_stats_sql = r#"
            CREATE TABLE IF NOT EXISTS alliance_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id INTEGER NOT NULL,
                org_name TEXT NOT NULL,
                rank INTEGER,
                credits_total INTEGER NOT NULL,
                member_count INTEGER NOT NULL,
                members_online INTEGER NOT NULL,
                captured_at DATETIME NOT NULL
            )
        "#;

        let create_members_sql = r#"
            CREATE TABLE IF NOT EXISTS alliance_members (
                member_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                roles TEXT NOT NULL DEFAULT '[]',
                online BOOLEAN NOT NULL DEFAULT 0,
                role_flags TEXT NOT NULL DEFAULT '{}',
                first_seen_at DATETIME NOT NULL,
                last_seen_at DATETIME NOT NULL,
                last_online_at DATETIME
            )
        "#;

        let create_activity_sql = r#"
            CREATE TABLE IF NOT EXISTS member_activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                member_id TEXT NOT NULL,
                online BOOLEAN NOT NULL,
                recorded_at DATETIME NOT NULL
            )
        "#;

        let create_indexes_sql = r#"
            CREATE INDEX IF NOT EXISTS idx_incidents_last_seen_at ON incidents (last_seen_at);
            CREATE INDEX IF NOT EXISTS idx_alliance_stats_org_captured ON alliance_stats (org_id, captured_at);
            CREATE INDEX IF NOT EXISTS idx_member_activity_member_recorded ON member_activity_log (member_id, recorded_at);
        "#;

        sqlx::query(create_incidents_sql).execute(&self.pool).await?;
        sqlx::query(create_alliance_stats_sql).execute(&self.pool).await?;
        sqlx::query(create_members_sql).execute(&self.pool).await?;
        sqlx::query(create_activity_sql).execute(&self.pool).await?;
        sqlx::raw_sql(create_indexes_sql).execute(&self.pool).await?;

        info!("Database schema is up to date");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_database_connection_creates_missing_file() -> Result<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("nested").join("test.db");
        let database_url = format!("sqlite:{}", db_path.display());

        let db = DatabaseConnection::new(&database_url).await?;

        assert!(!db.pool().is_closed());
        assert!(db_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_database_migration() -> Result<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("test_migration.db");
        let database_url = format!("sqlite:{}", db_path.display());

        let db = DatabaseConnection::new(&database_url).await?;
        db.migrate().await?;
        // Running twice must be harmless
        db.migrate().await?;

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await?;

        assert_eq!(
            tables,
            vec!["alliance_members", "alliance_stats", "incidents", "member_activity_log"]
        );
        Ok(())
    }
}
