//! # Delta Puller
//!
//! Drives incremental pulls: sends the stored checkpoint, applies the
//! returned records and tombstones to the local mirror and the optimistic
//! cache, and advances the checkpoint only once every type's backlog is
//! drained. A crash mid-pull therefore re-pulls an already-applied window;
//! upserts and tombstone deletes are idempotent, so the duplicate work is
//! harmless and nothing is ever skipped.
//!
//! Each entity type pages independently on a `(updated_at, entity_id)`
//! cursor. The compound cursor is what keeps records sharing a timestamp
//! from being skipped when a page limit cuts between them, and paging one
//! type at a time keeps a truncated type's window from being dragged past
//! its remaining records by another type's newer timestamps.

use crate::client::cache::OptimisticCache;
use crate::client::local_db::LocalDatabase;
use crate::client::reconciliation::ReconciliationMap;
use crate::client::transport::SyncTransport;
use crate::shared::delta::{DeltaRequest, DeltaResult};
use crate::shared::entity::EntityType;
use crate::shared::SyncError;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Upper bound on pages consumed in one pull cycle; a backlog larger than
/// this finishes on subsequent cycles
const MAX_PAGES_PER_CYCLE: u32 = 32;

/// Outcome of one pull cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub pages: u32,
    pub records: usize,
    pub tombstones: usize,
    /// False when the cycle hit the page bound before draining the backlog;
    /// the checkpoint stays put and the next cycle resumes
    pub checkpoint_advanced: bool,
}

/// Pulls deltas and applies them locally
pub struct DeltaPuller {
    db: Arc<LocalDatabase>,
    cache: Arc<OptimisticCache>,
    recon: Arc<ReconciliationMap>,
    transport: Arc<dyn SyncTransport>,
    workspace_id: Uuid,
    entity_types: Vec<EntityType>,
    limit: Option<u32>,
}

impl DeltaPuller {
    pub fn new(
        db: Arc<LocalDatabase>,
        cache: Arc<OptimisticCache>,
        recon: Arc<ReconciliationMap>,
        transport: Arc<dyn SyncTransport>,
        workspace_id: Uuid,
        entity_types: Vec<EntityType>,
        limit: Option<u32>,
    ) -> Self {
        Self {
            db,
            cache,
            recon,
            transport,
            workspace_id,
            entity_types,
            limit,
        }
    }

    /// Run one pull cycle, paging each entity type until its backlog is
    /// drained or the cycle's page bound is hit
    pub async fn pull_once(&self) -> Result<PullSummary, SyncError> {
        let checkpoint = self.db.get_checkpoint(self.workspace_id).await?;
        let mut summary = PullSummary::default();
        let mut next_checkpoint: Option<String> = None;

        let entity_types = if self.entity_types.is_empty() {
            EntityType::all().to_vec()
        } else {
            self.entity_types.clone()
        };

        for entity_type in entity_types {
            let mut cursor = checkpoint.clone();
            let mut after_id: Option<String> = None;

            loop {
                if summary.pages >= MAX_PAGES_PER_CYCLE {
                    warn!(
                        workspace = %self.workspace_id,
                        pages = summary.pages,
                        "pull cycle hit page bound with backlog remaining"
                    );
                    return Ok(summary);
                }

                let delta = self
                    .transport
                    .pull(&DeltaRequest {
                        workspace_id: self.workspace_id,
                        modified_since: cursor.clone(),
                        entity_types: vec![entity_type],
                        limit: self.limit,
                        after_id: after_id.clone(),
                    })
                    .await?;

                summary.pages += 1;
                summary.records += delta.record_count();
                summary.tombstones += delta.tombstones.len();

                self.apply(&delta).await?;

                if !delta.has_more {
                    // The earliest per-type synced_at is the safe shared
                    // checkpoint: nothing any type still owes can be older
                    next_checkpoint = match next_checkpoint {
                        Some(existing) if existing <= delta.synced_at => Some(existing),
                        _ => Some(delta.synced_at),
                    };
                    break;
                }

                match Self::last_applied(&delta) {
                    Some((at, id)) => {
                        cursor = Some(at);
                        after_id = Some(id);
                    }
                    None => {
                        // A has_more page with no records cannot progress;
                        // leave the checkpoint for the next cycle
                        warn!(
                            workspace = %self.workspace_id,
                            entity_type = %entity_type,
                            "truncated delta page carried no records"
                        );
                        return Ok(summary);
                    }
                }
            }
        }

        if let Some(synced_at) = next_checkpoint {
            // Durable checkpoint moves only after every type's final page
            // is applied
            self.db.set_checkpoint(self.workspace_id, &synced_at).await?;
            summary.checkpoint_advanced = true;
            debug!(
                workspace = %self.workspace_id,
                pages = summary.pages,
                records = summary.records,
                tombstones = summary.tombstones,
                "delta pull complete"
            );
        }
        Ok(summary)
    }

    async fn apply(&self, delta: &DeltaResult) -> Result<(), SyncError> {
        for records in delta.changed.values() {
            for record in records {
                self.db.upsert_entity(record).await?;
            }
        }
        for tombstone in &delta.tombstones {
            // A tombstone for an entity this client never saw is a no-op
            self.db.remove_entity(tombstone).await?;
        }
        self.cache.apply_delta(delta, &self.recon);
        Ok(())
    }

    /// Compound cursor of the newest record on the page
    fn last_applied(delta: &DeltaResult) -> Option<(String, String)> {
        delta
            .changed
            .values()
            .flatten()
            .map(|r| (r.updated_at.clone(), r.id.clone()))
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::entity::{CategoryFields, EntityFields, EntityRecord};
    use crate::shared::mutation::{SubmitMutationRequest, SubmitMutationResponse};
    use crate::shared::now_rfc3339;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    /// Serves a scripted sequence of delta pages and records the requests
    struct ScriptedTransport {
        pages: Mutex<VecDeque<DeltaResult>>,
        requests: Mutex<Vec<DeltaRequest>>,
    }

    impl ScriptedTransport {
        fn new(pages: Vec<DeltaResult>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SyncTransport for ScriptedTransport {
        async fn submit(
            &self,
            _request: &SubmitMutationRequest,
        ) -> Result<SubmitMutationResponse, SyncError> {
            Err(SyncError::transient("not scripted"))
        }

        async fn pull(&self, request: &DeltaRequest) -> Result<DeltaResult, SyncError> {
            self.requests.lock().unwrap().push(request.clone());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| SyncError::transient("no more pages"))
        }
    }

    fn record(ws: Uuid, id: &str, updated_at: &str) -> EntityRecord {
        EntityRecord {
            id: id.to_string(),
            workspace_id: ws,
            updated_at: updated_at.to_string(),
            fields: EntityFields::Category(CategoryFields {
                name: id.to_string(),
                parent_id: None,
            }),
        }
    }

    fn page(ws: Uuid, ids: &[(&str, &str)], has_more: bool) -> DeltaResult {
        let mut changed = BTreeMap::new();
        changed.insert(
            EntityType::Category,
            ids.iter().map(|(id, at)| record(ws, id, at)).collect(),
        );
        DeltaResult {
            changed,
            tombstones: Vec::new(),
            synced_at: now_rfc3339(),
            has_more,
        }
    }

    async fn puller_with_transport(
        ws: Uuid,
        transport: Arc<ScriptedTransport>,
    ) -> (DeltaPuller, Arc<LocalDatabase>, Arc<OptimisticCache>) {
        let db = Arc::new(LocalDatabase::in_memory().await.unwrap());
        let cache = Arc::new(OptimisticCache::new());
        let puller = DeltaPuller::new(
            db.clone(),
            cache.clone(),
            Arc::new(ReconciliationMap::new()),
            transport,
            ws,
            vec![EntityType::Category],
            None,
        );
        (puller, db, cache)
    }

    async fn puller_with_pages(
        ws: Uuid,
        pages: Vec<DeltaResult>,
    ) -> (DeltaPuller, Arc<LocalDatabase>, Arc<OptimisticCache>) {
        puller_with_transport(ws, Arc::new(ScriptedTransport::new(pages))).await
    }

    #[tokio::test]
    async fn test_multi_page_pull_advances_checkpoint_at_the_end() {
        let ws = Uuid::new_v4();
        let final_synced_at;
        let pages = {
            let first = page(
                ws,
                &[("a", "2026-01-01T00:00:01.000000Z"), ("b", "2026-01-01T00:00:02.000000Z")],
                true,
            );
            let last = page(ws, &[("c", "2026-01-01T00:00:03.000000Z")], false);
            final_synced_at = last.synced_at.clone();
            vec![first, last]
        };
        let (puller, db, cache) = puller_with_pages(ws, pages).await;

        let summary = puller.pull_once().await.unwrap();
        assert_eq!(summary.pages, 2);
        assert_eq!(summary.records, 3);
        assert!(summary.checkpoint_advanced);

        assert_eq!(
            db.get_checkpoint(ws).await.unwrap(),
            Some(final_synced_at)
        );
        assert_eq!(cache.list(EntityType::Category).len(), 3);
        assert_eq!(db.load_entities().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cursor_carries_the_equal_timestamp_tie_break() {
        let ws = Uuid::new_v4();
        let shared_at = "2026-01-01T00:00:05.000000Z";
        let pages = vec![
            page(ws, &[("a", shared_at), ("b", shared_at)], true),
            page(ws, &[("c", shared_at)], false),
        ];
        let transport = Arc::new(ScriptedTransport::new(pages));
        let (puller, db, _cache) = puller_with_transport(ws, transport.clone()).await;

        let summary = puller.pull_once().await.unwrap();
        assert_eq!(summary.records, 3);
        assert!(summary.checkpoint_advanced);
        assert_eq!(db.load_entities().await.unwrap().len(), 3);

        // The second request must carry both halves of the cursor, or the
        // strict timestamp window would skip "c"
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].modified_since.as_deref(), Some(shared_at));
        assert_eq!(requests[1].after_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_failed_pull_leaves_checkpoint_untouched() {
        let ws = Uuid::new_v4();
        // First page applies, the second pull errors (no pages left)
        let pages = vec![page(ws, &[("a", "2026-01-01T00:00:01.000000Z")], true)];
        let (puller, db, _cache) = puller_with_pages(ws, pages).await;

        let result = puller.pull_once().await;
        assert!(result.is_err());
        assert_eq!(db.get_checkpoint(ws).await.unwrap(), None);
        // The applied page is still locally durable; re-pulling it later is
        // an idempotent upsert
        assert_eq!(db.load_entities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_for_unknown_entity_is_a_noop() {
        let ws = Uuid::new_v4();
        let delta = DeltaResult {
            changed: BTreeMap::new(),
            tombstones: vec![crate::shared::Tombstone {
                entity_type: EntityType::Category,
                entity_id: "never-seen".to_string(),
                workspace_id: ws,
                deleted_at: now_rfc3339(),
            }],
            synced_at: now_rfc3339(),
            has_more: false,
        };
        let (puller, db, _cache) = puller_with_pages(ws, vec![delta]).await;

        let summary = puller.pull_once().await.unwrap();
        assert_eq!(summary.tombstones, 1);
        assert!(summary.checkpoint_advanced);
        assert!(db.load_entities().await.unwrap().is_empty());
    }
}
