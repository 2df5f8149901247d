//! # Local Database
//!
//! SQLite-backed durable storage for the client engine: the mutation queue,
//! the reconciliation map, a mirror of pulled entities, and sync metadata
//! (most importantly the per-workspace checkpoint).
//!
//! The database is the crash-recovery point. An enqueue only returns once
//! its row is committed, and no submission is assumed to have succeeded
//! until the server acknowledged it, so a restart resumes cleanly from
//! whatever the queue holds.

pub mod schema;

use crate::shared::entity::{EntityFields, EntityId, EntityRecord, EntityType};
use crate::shared::{now_rfc3339, SyncError, Tombstone};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Result type for local database operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Local database connection manager
#[derive(Debug)]
pub struct LocalDatabase {
    pool: SqlitePool,
}

impl LocalDatabase {
    /// Open (or create) the database at `path` and initialize the schema.
    /// Uses WAL mode for better concurrency.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::transient(format!("create data dir: {}", e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Open the database at the platform-specific default location
    pub async fn open_default() -> Result<Self> {
        Self::open(Self::default_path()).await
    }

    /// In-memory database for tests. A single connection keeps every
    /// statement on the same in-memory instance.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Platform-specific default database path
    fn default_path() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
        path.push("tidemark");
        path.push("local.db");
        path
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in schema::ALL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Connection pool reference, used by the queue for its transactions
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- sync metadata -------------------------------------------------

    /// Set a sync metadata value
    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO sync_metadata (key, value, updated_at)
             VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a sync metadata value
    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM sync_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    /// Checkpoint of the last fully-applied delta pull for a workspace
    pub async fn get_checkpoint(&self, workspace_id: Uuid) -> Result<Option<String>> {
        self.get_metadata(&format!("checkpoint:{}", workspace_id)).await
    }

    /// Advance the checkpoint. Only call after a `has_more = false` pull
    /// has been durably applied.
    pub async fn set_checkpoint(&self, workspace_id: Uuid, synced_at: &str) -> Result<()> {
        self.set_metadata(&format!("checkpoint:{}", workspace_id), synced_at)
            .await
    }

    // ---- reconciliation map --------------------------------------------

    /// Persist a temp id resolution
    pub async fn record_temp_id(&self, temp_id: &str, real_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO temp_id_map (temp_id, real_id, resolved_at)
             VALUES (?, ?, ?)",
        )
        .bind(temp_id)
        .bind(real_id)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load every recorded temp id resolution
    pub async fn load_temp_id_map(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT temp_id, real_id FROM temp_id_map")
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push((row.try_get("temp_id")?, row.try_get("real_id")?));
        }
        Ok(entries)
    }

    // ---- entity mirror -------------------------------------------------

    /// Upsert a pulled entity into the local mirror
    pub async fn upsert_entity(&self, record: &EntityRecord) -> Result<()> {
        let fields = serde_json::to_string(&record.fields)?;
        sqlx::query(
            "INSERT OR REPLACE INTO entities
                 (entity_type, entity_id, workspace_id, fields, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.entity_type().as_str())
        .bind(&record.id)
        .bind(record.workspace_id.to_string())
        .bind(fields)
        .bind(&record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply a tombstone to the local mirror
    pub async fn remove_entity(&self, tombstone: &Tombstone) -> Result<()> {
        sqlx::query("DELETE FROM entities WHERE entity_type = ? AND entity_id = ?")
            .bind(tombstone.entity_type.as_str())
            .bind(&tombstone.entity_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a locally mirrored entity by id (confirmed local delete)
    pub async fn remove_entity_by_id(&self, entity_type: EntityType, id: &EntityId) -> Result<()> {
        sqlx::query("DELETE FROM entities WHERE entity_type = ? AND entity_id = ?")
            .bind(entity_type.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load the full mirror, used to seed the optimistic cache on startup
    pub async fn load_entities(&self) -> Result<Vec<EntityRecord>> {
        let rows = sqlx::query(
            "SELECT entity_id, workspace_id, fields, updated_at FROM entities",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let workspace: String = row.try_get("workspace_id")?;
            let fields_json: String = row.try_get("fields")?;
            let fields: EntityFields = serde_json::from_str(&fields_json)?;
            records.push(EntityRecord {
                id: row.try_get("entity_id")?,
                workspace_id: Uuid::parse_str(&workspace)
                    .map_err(|e| SyncError::validation(format!("bad workspace id: {}", e)))?,
                updated_at: row.try_get("updated_at")?,
                fields,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::entity::CategoryFields;

    fn record(workspace: Uuid, id: &str) -> EntityRecord {
        EntityRecord {
            id: id.to_string(),
            workspace_id: workspace,
            updated_at: now_rfc3339(),
            fields: EntityFields::Category(CategoryFields {
                name: "Pantry".to_string(),
                parent_id: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let db = LocalDatabase::in_memory().await.unwrap();

        db.set_metadata("k", "v1").await.unwrap();
        assert_eq!(db.get_metadata("k").await.unwrap(), Some("v1".to_string()));

        db.set_metadata("k", "v2").await.unwrap();
        assert_eq!(db.get_metadata("k").await.unwrap(), Some("v2".to_string()));
        assert_eq!(db.get_metadata("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checkpoint_per_workspace() {
        let db = LocalDatabase::in_memory().await.unwrap();
        let ws_a = Uuid::new_v4();
        let ws_b = Uuid::new_v4();

        assert_eq!(db.get_checkpoint(ws_a).await.unwrap(), None);
        db.set_checkpoint(ws_a, "2026-01-01T00:00:00.000000Z").await.unwrap();

        assert_eq!(
            db.get_checkpoint(ws_a).await.unwrap().as_deref(),
            Some("2026-01-01T00:00:00.000000Z")
        );
        assert_eq!(db.get_checkpoint(ws_b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entity_mirror_round_trip() {
        let db = LocalDatabase::in_memory().await.unwrap();
        let ws = Uuid::new_v4();

        db.upsert_entity(&record(ws, "a")).await.unwrap();
        db.upsert_entity(&record(ws, "b")).await.unwrap();
        // Upsert of the same id replaces, not duplicates
        db.upsert_entity(&record(ws, "a")).await.unwrap();

        let loaded = db.load_entities().await.unwrap();
        assert_eq!(loaded.len(), 2);

        db.remove_entity(&Tombstone {
            entity_type: EntityType::Category,
            entity_id: "a".to_string(),
            workspace_id: ws,
            deleted_at: now_rfc3339(),
        })
        .await
        .unwrap();

        let loaded = db.load_entities().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "b");
    }

    #[tokio::test]
    async fn test_temp_id_map_persists() {
        let db = LocalDatabase::in_memory().await.unwrap();
        db.record_temp_id("tmp-1", "real-1").await.unwrap();
        db.record_temp_id("tmp-2", "real-2").await.unwrap();

        let mut entries = db.load_temp_id_map().await.unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("tmp-1".to_string(), "real-1".to_string()),
                ("tmp-2".to_string(), "real-2".to_string()),
            ]
        );
    }
}
