//! # Entity Store
//!
//! Server-side source of truth: workspace-scoped entities, tombstones for
//! deletions, and the applied-mutation journal that makes submission
//! idempotent. Every mutation applies in a single transaction; the recorded
//! outcome is returned verbatim when the same mutation id is submitted
//! again, so a client that crashed before receiving an acknowledgement can
//! always resend safely.

pub mod tombstones;

use crate::shared::delta::{ChangeEvent, ChangeKind};
use crate::shared::entity::{is_temp_id, EntityFields, EntityRecord, EntityType};
use crate::shared::mutation::{
    MutationOperation, SubmitMutationRequest, SubmitMutationResponse,
};
use crate::shared::{now_rfc3339, SyncError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS entities (
        workspace_id TEXT NOT NULL,
        entity_type  TEXT NOT NULL,
        entity_id    TEXT NOT NULL,
        fields       TEXT NOT NULL,
        updated_at   TEXT NOT NULL,
        PRIMARY KEY (workspace_id, entity_type, entity_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_entities_updated
        ON entities (workspace_id, entity_type, updated_at)",
    "CREATE TABLE IF NOT EXISTS tombstones (
        workspace_id TEXT NOT NULL,
        entity_type  TEXT NOT NULL,
        entity_id    TEXT NOT NULL,
        deleted_at   TEXT NOT NULL,
        PRIMARY KEY (workspace_id, entity_type, entity_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_tombstones_deleted
        ON tombstones (workspace_id, deleted_at)",
    "CREATE TABLE IF NOT EXISTS applied_mutations (
        mutation_id  TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        response     TEXT NOT NULL,
        applied_at   TEXT NOT NULL
    )",
];

/// Workspace-scoped entity storage
#[derive(Debug, Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

impl EntityStore {
    /// Open (or create) the store at `path`
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests
    pub async fn in_memory() -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply one submitted mutation in a single transaction.
    ///
    /// Returns the response plus the change event to fan out; the event is
    /// `None` when the submission was an idempotent replay or a delete of
    /// an already-deleted entity, since no state changed.
    pub async fn apply_mutation(
        &self,
        request: &SubmitMutationRequest,
    ) -> Result<(SubmitMutationResponse, Option<ChangeEvent>), SyncError> {
        let mut tx = self.pool.begin().await?;
        let workspace = request.workspace_id.to_string();

        // Idempotency: a replayed mutation id returns the recorded outcome
        // and has no further effect
        let replay = sqlx::query(
            "SELECT response FROM applied_mutations WHERE mutation_id = ?",
        )
        .bind(request.mutation_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = replay {
            let stored: String = row.try_get("response")?;
            let response: SubmitMutationResponse = serde_json::from_str(&stored)?;
            debug!(mutation = %request.mutation_id, "idempotent replay");
            return Ok((response, None));
        }

        Self::validate(request)?;

        let (response, event) = match (request.operation, &request.payload) {
            (MutationOperation::Create, Some(payload)) => {
                Self::apply_create(&mut tx, request, payload, &workspace).await?
            }
            (MutationOperation::Update, Some(payload)) => {
                Self::apply_update(&mut tx, request, payload, &workspace).await?
            }
            (MutationOperation::Delete, _) => {
                Self::apply_delete(&mut tx, request, &workspace).await?
            }
            // validate() already rejected a missing payload
            (_, None) => return Err(SyncError::validation("payload is required")),
        };

        sqlx::query(
            "INSERT INTO applied_mutations (mutation_id, workspace_id, response, applied_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(request.mutation_id.to_string())
        .bind(&workspace)
        .bind(serde_json::to_string(&response)?)
        .bind(now_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((response, event))
    }

    fn validate(request: &SubmitMutationRequest) -> Result<(), SyncError> {
        match request.operation {
            MutationOperation::Create | MutationOperation::Update => {
                let Some(payload) = &request.payload else {
                    return Err(SyncError::validation("payload is required"));
                };
                if payload.entity_type() != request.entity_type {
                    return Err(SyncError::validation(
                        "payload entity type does not match the request",
                    ));
                }
                if payload.display_name().trim().is_empty() {
                    return Err(SyncError::validation("name must not be empty"));
                }
                if let Some(temp) = payload.temp_references().first() {
                    return Err(SyncError::validation(format!(
                        "unresolved placeholder reference: {}",
                        temp
                    )));
                }
            }
            MutationOperation::Delete => {}
        }
        if request.operation != MutationOperation::Create && is_temp_id(&request.entity_id) {
            return Err(SyncError::validation(format!(
                "unresolved placeholder target: {}",
                request.entity_id
            )));
        }
        Ok(())
    }

    async fn apply_create(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        request: &SubmitMutationRequest,
        payload: &EntityFields,
        workspace: &str,
    ) -> Result<(SubmitMutationResponse, Option<ChangeEvent>), SyncError> {
        let entity_id = Uuid::new_v4().to_string();
        let updated_at = now_rfc3339();

        sqlx::query(
            "INSERT INTO entities (workspace_id, entity_type, entity_id, fields, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(workspace)
        .bind(request.entity_type.as_str())
        .bind(&entity_id)
        .bind(serde_json::to_string(payload)?)
        .bind(&updated_at)
        .execute(&mut **tx)
        .await?;

        let record = EntityRecord {
            id: entity_id.clone(),
            workspace_id: request.workspace_id,
            updated_at: updated_at.clone(),
            fields: payload.clone(),
        };
        Ok((
            SubmitMutationResponse {
                entity_id: entity_id.clone(),
                updated_at,
                entity: Some(record),
            },
            Some(ChangeEvent {
                kind: ChangeKind::Created,
                entity_type: request.entity_type,
                entity_id,
            }),
        ))
    }

    async fn apply_update(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        request: &SubmitMutationRequest,
        payload: &EntityFields,
        workspace: &str,
    ) -> Result<(SubmitMutationResponse, Option<ChangeEvent>), SyncError> {
        let current = sqlx::query(
            "SELECT updated_at FROM entities
             WHERE workspace_id = ? AND entity_type = ? AND entity_id = ?",
        )
        .bind(workspace)
        .bind(request.entity_type.as_str())
        .bind(&request.entity_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(current) = current else {
            // Distinguish "deleted while you were offline" from "never existed"
            let tombstoned = sqlx::query(
                "SELECT 1 FROM tombstones
                 WHERE workspace_id = ? AND entity_type = ? AND entity_id = ?",
            )
            .bind(workspace)
            .bind(request.entity_type.as_str())
            .bind(&request.entity_id)
            .fetch_optional(&mut **tx)
            .await?;
            return if tombstoned.is_some() {
                Err(SyncError::conflict("entity was deleted on the server"))
            } else {
                Err(SyncError::validation("unknown entity"))
            };
        };

        let current_updated_at: String = current.try_get("updated_at")?;
        if let Some(base) = &request.base_updated_at {
            if *base != current_updated_at {
                return Err(SyncError::conflict(
                    "entity was modified on the server since the client's base state",
                ));
            }
        }

        let updated_at = now_rfc3339();
        sqlx::query(
            "UPDATE entities SET fields = ?, updated_at = ?
             WHERE workspace_id = ? AND entity_type = ? AND entity_id = ?",
        )
        .bind(serde_json::to_string(payload)?)
        .bind(&updated_at)
        .bind(workspace)
        .bind(request.entity_type.as_str())
        .bind(&request.entity_id)
        .execute(&mut **tx)
        .await?;

        let record = EntityRecord {
            id: request.entity_id.clone(),
            workspace_id: request.workspace_id,
            updated_at: updated_at.clone(),
            fields: payload.clone(),
        };
        Ok((
            SubmitMutationResponse {
                entity_id: request.entity_id.clone(),
                updated_at,
                entity: Some(record),
            },
            Some(ChangeEvent {
                kind: ChangeKind::Updated,
                entity_type: request.entity_type,
                entity_id: request.entity_id.clone(),
            }),
        ))
    }

    async fn apply_delete(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        request: &SubmitMutationRequest,
        workspace: &str,
    ) -> Result<(SubmitMutationResponse, Option<ChangeEvent>), SyncError> {
        let existing = sqlx::query(
            "SELECT 1 FROM entities
             WHERE workspace_id = ? AND entity_type = ? AND entity_id = ?",
        )
        .bind(workspace)
        .bind(request.entity_type.as_str())
        .bind(&request.entity_id)
        .fetch_optional(&mut **tx)
        .await?;

        if existing.is_none() {
            let tombstone = sqlx::query(
                "SELECT deleted_at FROM tombstones
                 WHERE workspace_id = ? AND entity_type = ? AND entity_id = ?",
            )
            .bind(workspace)
            .bind(request.entity_type.as_str())
            .bind(&request.entity_id)
            .fetch_optional(&mut **tx)
            .await?;
            return match tombstone {
                // Deleting an already-deleted entity is success, not an
                // error, and produces no new event
                Some(row) => {
                    let deleted_at: String = row.try_get("deleted_at")?;
                    Ok((
                        SubmitMutationResponse {
                            entity_id: request.entity_id.clone(),
                            updated_at: deleted_at,
                            entity: None,
                        },
                        None,
                    ))
                }
                None => Err(SyncError::validation("unknown entity")),
            };
        }

        let deleted_at = now_rfc3339();
        sqlx::query(
            "DELETE FROM entities
             WHERE workspace_id = ? AND entity_type = ? AND entity_id = ?",
        )
        .bind(workspace)
        .bind(request.entity_type.as_str())
        .bind(&request.entity_id)
        .execute(&mut **tx)
        .await?;
        sqlx::query(
            "INSERT OR REPLACE INTO tombstones
                 (workspace_id, entity_type, entity_id, deleted_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(workspace)
        .bind(request.entity_type.as_str())
        .bind(&request.entity_id)
        .bind(&deleted_at)
        .execute(&mut **tx)
        .await?;

        Ok((
            SubmitMutationResponse {
                entity_id: request.entity_id.clone(),
                updated_at: deleted_at,
                entity: None,
            },
            Some(ChangeEvent {
                kind: ChangeKind::Deleted,
                entity_type: request.entity_type,
                entity_id: request.entity_id.clone(),
            }),
        ))
    }

    /// Fetch one entity
    pub async fn get_entity(
        &self,
        workspace_id: Uuid,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<EntityRecord>, SyncError> {
        let row = sqlx::query(
            "SELECT entity_id, fields, updated_at FROM entities
             WHERE workspace_id = ? AND entity_type = ? AND entity_id = ?",
        )
        .bind(workspace_id.to_string())
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let fields: String = row.try_get("fields")?;
            Ok(EntityRecord {
                id: row.try_get("entity_id")?,
                workspace_id,
                updated_at: row.try_get("updated_at")?,
                fields: serde_json::from_str(&fields)?,
            })
        })
        .transpose()
    }

    /// Entities of one type changed after `modified_since` (or all of them
    /// for a full sync), oldest first, at most `fetch` rows. Takes an
    /// executor so the delta service can run several of these inside one
    /// snapshot transaction.
    ///
    /// `after_id` is the paging tie-break: rows are ordered by
    /// `(updated_at, entity_id)`, and passing the last applied pair keeps
    /// records sharing an `updated_at` from being skipped when a page limit
    /// cuts between them.
    pub(crate) async fn changed_entities<'e, E>(
        executor: E,
        workspace_id: Uuid,
        entity_type: EntityType,
        modified_since: Option<&str>,
        after_id: Option<&str>,
        fetch: u32,
    ) -> Result<Vec<EntityRecord>, SyncError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let rows = match (modified_since, after_id) {
            (Some(since), Some(after)) => {
                sqlx::query(
                    "SELECT entity_id, fields, updated_at FROM entities
                     WHERE workspace_id = ? AND entity_type = ?
                       AND (updated_at > ? OR (updated_at = ? AND entity_id > ?))
                     ORDER BY updated_at ASC, entity_id ASC
                     LIMIT ?",
                )
                .bind(workspace_id.to_string())
                .bind(entity_type.as_str())
                .bind(since)
                .bind(since)
                .bind(after)
                .bind(fetch as i64)
                .fetch_all(executor)
                .await?
            }
            (Some(since), None) => {
                sqlx::query(
                    "SELECT entity_id, fields, updated_at FROM entities
                     WHERE workspace_id = ? AND entity_type = ? AND updated_at > ?
                     ORDER BY updated_at ASC, entity_id ASC
                     LIMIT ?",
                )
                .bind(workspace_id.to_string())
                .bind(entity_type.as_str())
                .bind(since)
                .bind(fetch as i64)
                .fetch_all(executor)
                .await?
            }
            (None, _) => {
                sqlx::query(
                    "SELECT entity_id, fields, updated_at FROM entities
                     WHERE workspace_id = ? AND entity_type = ?
                     ORDER BY updated_at ASC, entity_id ASC
                     LIMIT ?",
                )
                .bind(workspace_id.to_string())
                .bind(entity_type.as_str())
                .bind(fetch as i64)
                .fetch_all(executor)
                .await?
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let fields: String = row.try_get("fields")?;
            records.push(EntityRecord {
                id: row.try_get("entity_id")?,
                workspace_id,
                updated_at: row.try_get("updated_at")?,
                fields: serde_json::from_str(&fields)?,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::entity::{mint_temp_id, CategoryFields, EntityFields};
    use pretty_assertions::assert_eq;

    fn create_request(ws: Uuid, name: &str) -> SubmitMutationRequest {
        SubmitMutationRequest {
            mutation_id: Uuid::new_v4(),
            workspace_id: ws,
            operation: MutationOperation::Create,
            entity_type: EntityType::Category,
            entity_id: mint_temp_id(),
            payload: Some(EntityFields::Category(CategoryFields {
                name: name.to_string(),
                parent_id: None,
            })),
            base_updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_real_id() {
        let store = EntityStore::in_memory().await.unwrap();
        let ws = Uuid::new_v4();

        let (response, event) = store.apply_mutation(&create_request(ws, "Drinks")).await.unwrap();
        assert!(!is_temp_id(&response.entity_id));
        assert_eq!(event.unwrap().kind, ChangeKind::Created);

        let stored = store
            .get_entity(ws, EntityType::Category, &response.entity_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.fields.display_name(), "Drinks");
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = EntityStore::in_memory().await.unwrap();
        let ws = Uuid::new_v4();
        let request = create_request(ws, "Drinks");

        let (first, first_event) = store.apply_mutation(&request).await.unwrap();
        let (second, second_event) = store.apply_mutation(&request).await.unwrap();

        // Same outcome, exactly one entity, no duplicate event
        assert_eq!(first.entity_id, second.entity_id);
        assert_eq!(first.updated_at, second.updated_at);
        assert!(first_event.is_some());
        assert!(second_event.is_none());
        assert_eq!(
            EntityStore::changed_entities(store.pool(), ws, EntityType::Category, None, None, 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stale_base_state_conflicts() {
        let store = EntityStore::in_memory().await.unwrap();
        let ws = Uuid::new_v4();
        let (created, _) = store.apply_mutation(&create_request(ws, "Drinks")).await.unwrap();

        let update = |base: Option<String>| SubmitMutationRequest {
            mutation_id: Uuid::new_v4(),
            workspace_id: ws,
            operation: MutationOperation::Update,
            entity_type: EntityType::Category,
            entity_id: created.entity_id.clone(),
            payload: Some(EntityFields::Category(CategoryFields {
                name: "Beverages".to_string(),
                parent_id: None,
            })),
            base_updated_at: base,
        };

        // First update against the current base succeeds
        let (updated, _) = store
            .apply_mutation(&update(Some(created.updated_at.clone())))
            .await
            .unwrap();
        // Second update against the now-stale base conflicts
        let error = store
            .apply_mutation(&update(Some(created.updated_at.clone())))
            .await
            .unwrap_err();
        assert!(matches!(error, SyncError::Conflict { .. }));
        assert_ne!(updated.updated_at, created.updated_at);
    }

    #[tokio::test]
    async fn test_update_of_deleted_entity_conflicts() {
        let store = EntityStore::in_memory().await.unwrap();
        let ws = Uuid::new_v4();
        let (created, _) = store.apply_mutation(&create_request(ws, "Drinks")).await.unwrap();

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

        let error = store
            .apply_mutation(&SubmitMutationRequest {
                mutation_id: Uuid::new_v4(),
                workspace_id: ws,
                operation: MutationOperation::Update,
                entity_type: EntityType::Category,
                entity_id: created.entity_id.clone(),
                payload: Some(EntityFields::Category(CategoryFields {
                    name: "Renamed".to_string(),
                    parent_id: None,
                })),
                base_updated_at: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(error, SyncError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_double_delete_is_idempotent_success() {
        let store = EntityStore::in_memory().await.unwrap();
        let ws = Uuid::new_v4();
        let (created, _) = store.apply_mutation(&create_request(ws, "Drinks")).await.unwrap();

        let delete = || SubmitMutationRequest {
            mutation_id: Uuid::new_v4(),
            workspace_id: ws,
            operation: MutationOperation::Delete,
            entity_type: EntityType::Category,
            entity_id: created.entity_id.clone(),
            payload: None,
            base_updated_at: None,
        };

        let (_, first_event) = store.apply_mutation(&delete()).await.unwrap();
        assert!(first_event.is_some());

        let (second, second_event) = store.apply_mutation(&delete()).await.unwrap();
        assert_eq!(second.entity_id, created.entity_id);
        assert!(second_event.is_none());
    }

    #[tokio::test]
    async fn test_empty_name_is_rejected() {
        let store = EntityStore::in_memory().await.unwrap();
        let error = store
            .apply_mutation(&create_request(Uuid::new_v4(), "  "))
            .await
            .unwrap_err();
        assert!(matches!(error, SyncError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_temp_reference_in_payload_is_rejected() {
        let store = EntityStore::in_memory().await.unwrap();
        let ws = Uuid::new_v4();
        let mut request = create_request(ws, "Drinks");
        request.payload = Some(EntityFields::Category(CategoryFields {
            name: "Drinks".to_string(),
            parent_id: Some(mint_temp_id()),
        }));

        let error = store.apply_mutation(&request).await.unwrap_err();
        assert!(matches!(error, SyncError::Validation { .. }));
    }
}
