//! # Mutation Queue
//!
//! Durable, ordered log of not-yet-confirmed write operations. Every entry
//! survives process restarts; `enqueue` returns only once the row is
//! committed, so a crash immediately after a user action never silently
//! loses the mutation.
//!
//! The queue is a single-writer structure: all enqueue / status / rewrite
//! operations serialize on one lock so a UI-triggered enqueue and a
//! background drain can never interleave into a corrupt state. The queue is
//! constructed around an injected [`LocalDatabase`]; there is no
//! module-level singleton, so independent queues (per test, per profile)
//! coexist freely.

use crate::client::local_db::LocalDatabase;
use crate::shared::entity::{EntityFields, EntityId, EntityType};
use crate::shared::mutation::{
    BlockReason, FailureReason, MutationOperation, MutationStatus, QueuedMutation,
};
use crate::shared::{now_rfc3339, SyncError};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Input to [`MutationQueue::enqueue`]
#[derive(Debug, Clone)]
pub struct NewMutation {
    pub operation: MutationOperation,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub payload: Option<EntityFields>,
    pub depends_on: Vec<EntityId>,
    pub base_updated_at: Option<String>,
}

/// Counts surfaced to the hosting UI for sync status display
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub sending: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.sending + self.failed + self.blocked
    }
}

/// Durable mutation queue backed by the local database
#[derive(Debug)]
pub struct MutationQueue {
    db: Arc<LocalDatabase>,
    /// Serializes all mutating operations (single-writer invariant)
    writer: Mutex<()>,
}

impl MutationQueue {
    pub fn new(db: Arc<LocalDatabase>) -> Self {
        Self {
            db,
            writer: Mutex::new(()),
        }
    }

    /// Append a mutation. Returns the persisted entry once the row is
    /// durably committed.
    pub async fn enqueue(&self, new: NewMutation) -> Result<QueuedMutation> {
        let _guard = self.writer.lock().await;

        let mutation = QueuedMutation {
            id: Uuid::new_v4(),
            operation: new.operation,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            payload: new.payload,
            depends_on: new.depends_on,
            base_updated_at: new.base_updated_at,
            enqueued_at: now_rfc3339(),
            retry_count: 0,
            next_attempt_at: None,
            status: MutationStatus::Pending,
            fail_reason: None,
            block_reason: None,
            last_error: None,
        };

        let payload = match &mutation.payload {
            Some(p) => Some(serde_json::to_string(p)?),
            None => None,
        };
        let depends_on = serde_json::to_string(&mutation.depends_on)?;

        sqlx::query(
            "INSERT INTO mutation_queue
                 (id, operation, entity_type, entity_id, payload, depends_on,
                  base_updated_at, enqueued_at, retry_count, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(mutation.id.to_string())
        .bind(mutation.operation.as_str())
        .bind(mutation.entity_type.as_str())
        .bind(&mutation.entity_id)
        .bind(payload)
        .bind(depends_on)
        .bind(&mutation.base_updated_at)
        .bind(&mutation.enqueued_at)
        .bind(mutation.status.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(mutation)
    }

    /// Fetch a single entry
    pub async fn get(&self, id: Uuid) -> Result<Option<QueuedMutation>> {
        let row = sqlx::query("SELECT * FROM mutation_queue WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;

        row.map(|r| Self::row_to_mutation(&r)).transpose()
    }

    /// Every entry that has not completed, in enqueue order. This is the
    /// resolver's input: pending and blocked entries are candidates, failed
    /// entries carry the blocking information.
    pub async fn list_unsettled(&self) -> Result<Vec<QueuedMutation>> {
        let rows = sqlx::query(
            "SELECT * FROM mutation_queue
             WHERE status IN ('pending', 'sending', 'failed', 'blocked')
             ORDER BY enqueued_at ASC, id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(Self::row_to_mutation).collect()
    }

    /// Pending entries only, in enqueue order
    pub async fn list_pending(&self) -> Result<Vec<QueuedMutation>> {
        let rows = sqlx::query(
            "SELECT * FROM mutation_queue
             WHERE status = 'pending'
             ORDER BY enqueued_at ASC, id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(Self::row_to_mutation).collect()
    }

    /// Failed entries with payload and reason intact, for inspection
    pub async fn list_failed(&self) -> Result<Vec<QueuedMutation>> {
        let rows = sqlx::query(
            "SELECT * FROM mutation_queue
             WHERE status = 'failed'
             ORDER BY enqueued_at ASC, id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(Self::row_to_mutation).collect()
    }

    /// Reset `sending` entries back to `pending`. Called on startup and at
    /// the top of a drain cycle: an entry stuck in `sending` means a crash
    /// mid-submission, and the idempotency key makes re-sending safe.
    pub async fn recover_in_flight(&self) -> Result<u64> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query(
            "UPDATE mutation_queue SET status = 'pending' WHERE status = 'sending'",
        )
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Transition an entry to `sending`
    pub async fn mark_sending(&self, id: Uuid) -> Result<()> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            "UPDATE mutation_queue
             SET status = 'sending', block_reason = NULL, fail_reason = NULL
             WHERE id = ?",
        )
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Acknowledge success: the entry leaves the durable queue entirely
    pub async fn mark_done_and_remove(&self, id: Uuid) -> Result<()> {
        let _guard = self.writer.lock().await;
        sqlx::query("DELETE FROM mutation_queue WHERE id = ?")
            .bind(id.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Transient failure: back to `pending` behind a backoff gate
    pub async fn defer(
        &self,
        id: Uuid,
        retry_count: u32,
        next_attempt_at: &str,
        error: &str,
    ) -> Result<()> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            "UPDATE mutation_queue
             SET status = 'pending', retry_count = ?, next_attempt_at = ?,
                 last_error = ?, fail_reason = NULL, block_reason = NULL
             WHERE id = ?",
        )
        .bind(retry_count as i64)
        .bind(next_attempt_at)
        .bind(error)
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Terminal failure with a classified reason
    pub async fn set_failed(&self, id: Uuid, reason: FailureReason, error: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            "UPDATE mutation_queue
             SET status = 'failed', fail_reason = ?, last_error = ?,
                 block_reason = NULL, next_attempt_at = NULL
             WHERE id = ?",
        )
        .bind(reason.as_str())
        .bind(error)
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Derived blocked state (failed or cyclic dependency)
    pub async fn set_blocked(&self, id: Uuid, reason: BlockReason) -> Result<()> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            "UPDATE mutation_queue
             SET status = 'blocked', block_reason = ?
             WHERE id = ? AND status IN ('pending', 'blocked')",
        )
        .bind(reason.as_str())
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// A previously blocked entry whose blocker is gone becomes pending
    pub async fn reactivate(&self, id: Uuid) -> Result<()> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            "UPDATE mutation_queue
             SET status = 'pending', block_reason = NULL
             WHERE id = ? AND status = 'blocked'",
        )
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// User-requested retry of a failed entry: back to pending with a fresh
    /// attempt budget
    pub async fn retry_failed(&self, id: Uuid) -> Result<()> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            "UPDATE mutation_queue
             SET status = 'pending', fail_reason = NULL, last_error = NULL,
                 retry_count = 0, next_attempt_at = NULL
             WHERE id = ? AND status = 'failed'",
        )
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// User-requested discard; returns the removed entry if it existed
    pub async fn discard(&self, id: Uuid) -> Result<Option<QueuedMutation>> {
        let _guard = self.writer.lock().await;
        let existing = sqlx::query("SELECT * FROM mutation_queue WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        let existing = existing.map(|r| Self::row_to_mutation(&r)).transpose()?;

        if existing.is_some() {
            sqlx::query("DELETE FROM mutation_queue WHERE id = ?")
                .bind(id.to_string())
                .execute(self.db.pool())
                .await?;
        }
        Ok(existing)
    }

    /// Rewrite a resolved temp id everywhere it appears: target ids,
    /// dependency lists, and every declared payload reference field. Runs
    /// in one transaction so no entry can ever be read (and sent) with a
    /// stale temp reference. Also records the resolution durably.
    pub async fn rewrite_temp_id(&self, temp_id: &str, real_id: &str) -> Result<usize> {
        let _guard = self.writer.lock().await;
        let mut tx = self.db.pool().begin().await?;

        let rows = sqlx::query("SELECT * FROM mutation_queue")
            .fetch_all(&mut *tx)
            .await?;

        let mut rewritten = 0;
        for row in &rows {
            let mut mutation = Self::row_to_mutation(row)?;
            let mut changed = false;

            if mutation.entity_id == temp_id {
                mutation.entity_id = real_id.to_string();
                changed = true;
            }
            for dep in mutation.depends_on.iter_mut() {
                if dep == temp_id {
                    *dep = real_id.to_string();
                    changed = true;
                }
            }
            if let Some(payload) = mutation.payload.as_mut() {
                if payload.rewrite_references(temp_id, real_id) > 0 {
                    changed = true;
                }
            }

            if changed {
                let payload = match &mutation.payload {
                    Some(p) => Some(serde_json::to_string(p)?),
                    None => None,
                };
                sqlx::query(
                    "UPDATE mutation_queue
                     SET entity_id = ?, depends_on = ?, payload = ?
                     WHERE id = ?",
                )
                .bind(&mutation.entity_id)
                .bind(serde_json::to_string(&mutation.depends_on)?)
                .bind(payload)
                .bind(mutation.id.to_string())
                .execute(&mut *tx)
                .await?;
                rewritten += 1;
            }
        }

        sqlx::query(
            "INSERT OR REPLACE INTO temp_id_map (temp_id, real_id, resolved_at)
             VALUES (?, ?, ?)",
        )
        .bind(temp_id)
        .bind(real_id)
        .bind(now_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rewritten)
    }

    /// Status counts for sync-status display
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM mutation_queue GROUP BY status",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "pending" => stats.pending = n as usize,
                "sending" => stats.sending = n as usize,
                "failed" => stats.failed = n as usize,
                "blocked" => stats.blocked = n as usize,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Remove failed entries older than `max_age_hours`
    pub async fn prune_failed(&self, max_age_hours: i64) -> Result<u64> {
        let _guard = self.writer.lock().await;
        let cutoff = (chrono::Utc::now() - chrono::Duration::hours(max_age_hours))
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        let result = sqlx::query(
            "DELETE FROM mutation_queue WHERE status = 'failed' AND enqueued_at < ?",
        )
        .bind(cutoff)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    fn row_to_mutation(row: &SqliteRow) -> Result<QueuedMutation> {
        let id: String = row.try_get("id")?;
        let operation: String = row.try_get("operation")?;
        let entity_type: String = row.try_get("entity_type")?;
        let status: String = row.try_get("status")?;
        let payload: Option<String> = row.try_get("payload")?;
        let depends_on: String = row.try_get("depends_on")?;
        let fail_reason: Option<String> = row.try_get("fail_reason")?;
        let block_reason: Option<String> = row.try_get("block_reason")?;
        let retry_count: i64 = row.try_get("retry_count")?;

        Ok(QueuedMutation {
            id: Uuid::parse_str(&id)
                .map_err(|e| SyncError::validation(format!("bad mutation id: {}", e)))?,
            operation: MutationOperation::parse(&operation)
                .ok_or_else(|| SyncError::validation(format!("bad operation: {}", operation)))?,
            entity_type: EntityType::parse(&entity_type)
                .ok_or_else(|| SyncError::validation(format!("bad entity type: {}", entity_type)))?,
            entity_id: row.try_get("entity_id")?,
            payload: payload.map(|p| serde_json::from_str(&p)).transpose()?,
            depends_on: serde_json::from_str(&depends_on)?,
            base_updated_at: row.try_get("base_updated_at")?,
            enqueued_at: row.try_get("enqueued_at")?,
            retry_count: retry_count as u32,
            next_attempt_at: row.try_get("next_attempt_at")?,
            status: MutationStatus::parse(&status)
                .ok_or_else(|| SyncError::validation(format!("bad status: {}", status)))?,
            fail_reason: fail_reason.as_deref().and_then(FailureReason::parse),
            block_reason: block_reason.as_deref().and_then(BlockReason::parse),
            last_error: row.try_get("last_error")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::entity::{mint_temp_id, CategoryFields, ProductFields};
    use pretty_assertions::assert_eq;

    async fn queue() -> MutationQueue {
        MutationQueue::new(Arc::new(LocalDatabase::in_memory().await.unwrap()))
    }

    fn category_create(temp_id: &str, parent: Option<String>) -> NewMutation {
        NewMutation {
            operation: MutationOperation::Create,
            entity_type: EntityType::Category,
            entity_id: temp_id.to_string(),
            payload: Some(EntityFields::Category(CategoryFields {
                name: "Drinks".to_string(),
                parent_id: parent.clone(),
            })),
            depends_on: parent.into_iter().collect(),
            base_updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_durable_and_ordered() {
        let queue = queue().await;

        let a = queue.enqueue(category_create(&mint_temp_id(), None)).await.unwrap();
        let b = queue.enqueue(category_create(&mint_temp_id(), None)).await.unwrap();

        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, a.id);
        assert_eq!(pending[1].id, b.id);
        assert_eq!(pending[0].status, MutationStatus::Pending);
    }

    #[tokio::test]
    async fn test_done_leaves_the_queue() {
        let queue = queue().await;
        let m = queue.enqueue(category_create(&mint_temp_id(), None)).await.unwrap();

        queue.mark_sending(m.id).await.unwrap();
        queue.mark_done_and_remove(m.id).await.unwrap();

        assert_eq!(queue.get(m.id).await.unwrap(), None);
        assert_eq!(queue.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_failure_lifecycle() {
        let queue = queue().await;
        let m = queue.enqueue(category_create(&mint_temp_id(), None)).await.unwrap();

        queue
            .set_failed(m.id, FailureReason::Conflict, "changed on server")
            .await
            .unwrap();

        let failed = queue.list_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].fail_reason, Some(FailureReason::Conflict));
        assert_eq!(failed[0].last_error.as_deref(), Some("changed on server"));
        // Payload stays inspectable
        assert!(failed[0].payload.is_some());

        queue.retry_failed(m.id).await.unwrap();
        let again = queue.get(m.id).await.unwrap().unwrap();
        assert_eq!(again.status, MutationStatus::Pending);
        assert_eq!(again.retry_count, 0);
        assert_eq!(again.fail_reason, None);
    }

    #[tokio::test]
    async fn test_blocked_and_reactivate() {
        let queue = queue().await;
        let m = queue.enqueue(category_create(&mint_temp_id(), None)).await.unwrap();

        queue.set_blocked(m.id, BlockReason::FailedDependency).await.unwrap();
        let blocked = queue.get(m.id).await.unwrap().unwrap();
        assert_eq!(blocked.status, MutationStatus::Blocked);
        assert_eq!(blocked.block_reason, Some(BlockReason::FailedDependency));

        queue.reactivate(m.id).await.unwrap();
        let pending = queue.get(m.id).await.unwrap().unwrap();
        assert_eq!(pending.status, MutationStatus::Pending);
        assert_eq!(pending.block_reason, None);
    }

    #[tokio::test]
    async fn test_rewrite_temp_id_covers_every_reference() {
        let queue = queue().await;
        let t1 = mint_temp_id();
        let t2 = mint_temp_id();

        // Create with temp id t1
        queue.enqueue(category_create(&t1, None)).await.unwrap();
        // Child category referencing t1 as parent
        queue.enqueue(category_create(&t2, Some(t1.clone()))).await.unwrap();
        // Product with t1 embedded as a foreign-key-like payload field
        queue
            .enqueue(NewMutation {
                operation: MutationOperation::Create,
                entity_type: EntityType::Product,
                entity_id: mint_temp_id(),
                payload: Some(EntityFields::Product(ProductFields {
                    name: "Cold brew".to_string(),
                    category_id: Some(t1.clone()),
                    price_cents: 450,
                    sku: None,
                })),
                depends_on: vec![t1.clone()],
                base_updated_at: None,
            })
            .await
            .unwrap();

        let rewritten = queue.rewrite_temp_id(&t1, "real-1").await.unwrap();
        assert_eq!(rewritten, 3);

        // No entry anywhere still mentions t1
        for m in queue.list_unsettled().await.unwrap() {
            assert_ne!(m.entity_id, t1);
            assert!(!m.depends_on.contains(&t1));
            if let Some(p) = &m.payload {
                assert!(!p.reference_fields().iter().any(|r| **r == t1));
            }
        }

        // The resolution itself was recorded durably
        let map = queue.db.load_temp_id_map().await.unwrap();
        assert!(map.contains(&(t1, "real-1".to_string())));
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let queue = queue().await;
        let a = queue.enqueue(category_create(&mint_temp_id(), None)).await.unwrap();
        let b = queue.enqueue(category_create(&mint_temp_id(), None)).await.unwrap();
        queue.enqueue(category_create(&mint_temp_id(), None)).await.unwrap();

        queue.set_failed(a.id, FailureReason::Validation, "bad").await.unwrap();
        queue.set_blocked(b.id, BlockReason::CyclicDependency).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.total(), 3);
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");

        let temp = mint_temp_id();
        {
            let db = Arc::new(LocalDatabase::open(&path).await.unwrap());
            let queue = MutationQueue::new(db);
            queue.enqueue(category_create(&temp, None)).await.unwrap();
        }

        let db = Arc::new(LocalDatabase::open(&path).await.unwrap());
        let queue = MutationQueue::new(db);
        let pending = queue.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, temp);
    }

    #[tokio::test]
    async fn test_discard_removes_entry() {
        let queue = queue().await;
        let m = queue.enqueue(category_create(&mint_temp_id(), None)).await.unwrap();
        queue.set_failed(m.id, FailureReason::Validation, "bad").await.unwrap();

        let removed = queue.discard(m.id).await.unwrap();
        assert_eq!(removed.unwrap().id, m.id);
        assert_eq!(queue.get(m.id).await.unwrap(), None);
        assert_eq!(queue.discard(m.id).await.unwrap(), None);
    }
}
