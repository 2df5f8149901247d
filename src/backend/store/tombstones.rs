//! # Tombstone Queries
//!
//! Read and maintenance access to the tombstone log. Tombstones are what
//! lets a client that was offline across a deletion still learn about it,
//! so they are only pruned once older than the longest supported offline
//! window.

use crate::backend::store::EntityStore;
use crate::shared::delta::Tombstone;
use crate::shared::entity::EntityType;
use crate::shared::SyncError;
use chrono::{Duration, SecondsFormat, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

/// Tombstone log access
#[derive(Debug, Clone)]
pub struct TombstoneStore {
    pool: SqlitePool,
}

impl TombstoneStore {
    pub fn new(store: &EntityStore) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    /// Tombstones in a workspace deleted after `since`, restricted to the
    /// given entity types, oldest first
    pub async fn list_since(
        &self,
        workspace_id: Uuid,
        since: &str,
        entity_types: &[EntityType],
    ) -> Result<Vec<Tombstone>, SyncError> {
        Self::fetch_since(&self.pool, workspace_id, since, entity_types).await
    }

    /// Executor-generic variant, so the delta service can read tombstones
    /// inside the same snapshot transaction as the entity rows
    pub(crate) async fn fetch_since<'e, E>(
        executor: E,
        workspace_id: Uuid,
        since: &str,
        entity_types: &[EntityType],
    ) -> Result<Vec<Tombstone>, SyncError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let rows = sqlx::query(
            "SELECT entity_type, entity_id, deleted_at FROM tombstones
             WHERE workspace_id = ? AND deleted_at > ?
             ORDER BY deleted_at ASC, entity_id ASC",
        )
        .bind(workspace_id.to_string())
        .bind(since)
        .fetch_all(executor)
        .await?;

        let mut tombstones = Vec::new();
        for row in rows {
            let type_name: String = row.try_get("entity_type")?;
            let Some(entity_type) = EntityType::parse(&type_name) else {
                continue;
            };
            if !entity_types.contains(&entity_type) {
                continue;
            }
            tombstones.push(Tombstone {
                entity_type,
                entity_id: row.try_get("entity_id")?,
                workspace_id,
                deleted_at: row.try_get("deleted_at")?,
            });
        }
        Ok(tombstones)
    }

    /// Drop tombstones older than the retention window
    pub async fn prune_older_than(&self, retention_days: i64) -> Result<u64, SyncError> {
        let cutoff = (Utc::now() - Duration::days(retention_days))
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        let result = sqlx::query("DELETE FROM tombstones WHERE deleted_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            info!(pruned = result.rows_affected(), "tombstones pruned");
        }
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<u64, SyncError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tombstones")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::entity::{mint_temp_id, CategoryFields, EntityFields};
    use crate::shared::mutation::{MutationOperation, SubmitMutationRequest};
    use pretty_assertions::assert_eq;

    async fn store_with_deleted_category(ws: Uuid) -> (EntityStore, String) {
        let store = EntityStore::in_memory().await.unwrap();
        let (created, _) = store
            .apply_mutation(&SubmitMutationRequest {
                mutation_id: Uuid::new_v4(),
                workspace_id: ws,
                operation: MutationOperation::Create,
                entity_type: EntityType::Category,
                entity_id: mint_temp_id(),
                payload: Some(EntityFields::Category(CategoryFields {
                    name: "Doomed".to_string(),
                    parent_id: None,
                })),
                base_updated_at: None,
            })
            .await
            .unwrap();
        store
            .apply_mutation(&SubmitMutationRequest {
                mutation_id: Uuid::new_v4(),
                workspace_id: ws,
                operation: MutationOperation::Delete,
                entity_type: EntityType::Category,
                entity_id: created.entity_id.clone(),
                payload: None,
                base_updated_at: None,
            })
            .await
            .unwrap();
        (store, created.entity_id)
    }

    #[tokio::test]
    async fn test_list_since_windows_and_filters() {
        let ws = Uuid::new_v4();
        let (store, deleted_id) = store_with_deleted_category(ws).await;
        let tombstones = TombstoneStore::new(&store);

        let all = tombstones
            .list_since(ws, "1970-01-01T00:00:00.000000Z", &EntityType::all())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].entity_id, deleted_id);

        // Window after the deletion sees nothing
        let none = tombstones
            .list_since(ws, "2999-01-01T00:00:00.000000Z", &EntityType::all())
            .await
            .unwrap();
        assert!(none.is_empty());

        // Type filter excludes it
        let filtered = tombstones
            .list_since(ws, "1970-01-01T00:00:00.000000Z", &[EntityType::Product])
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn test_prune_respects_retention() {
        let ws = Uuid::new_v4();
        let (store, _) = store_with_deleted_category(ws).await;
        let tombstones = TombstoneStore::new(&store);

        // A fresh tombstone survives a long retention window
        assert_eq!(tombstones.prune_older_than(90).await.unwrap(), 0);
        assert_eq!(tombstones.count().await.unwrap(), 1);

        // Retention of zero days prunes everything older than "now"
        assert_eq!(tombstones.prune_older_than(0).await.unwrap(), 1);
        assert_eq!(tombstones.count().await.unwrap(), 0);
    }
}
