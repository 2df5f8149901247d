//! # Delta Sync Service
//!
//! Serves the incremental pull protocol. A request carries the client's
//! checkpoint; the response is every entity changed after it, tombstones
//! for deletions in the same window, a fresh `synced_at`, and a `has_more`
//! flag when a per-type limit truncated the result.

pub mod handlers;

use crate::backend::store::tombstones::TombstoneStore;
use crate::backend::store::EntityStore;
use crate::shared::delta::{effective_limit, DeltaRequest, DeltaResult};
use crate::shared::entity::EntityType;
use crate::shared::SyncError;
use chrono::{Duration, SecondsFormat, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// How far `synced_at` trails the server clock. A mutation stamps its
/// `updated_at` inside its own transaction, so one that commits just after
/// this pull's snapshot began can carry a timestamp earlier than the
/// response time; without the lag it would fall outside every later window.
/// Writes inside the overlap are re-delivered, which the client's
/// idempotent upserts absorb.
const SYNCED_AT_LAG_SECS: i64 = 1;

/// Answers delta pulls against the entity store
#[derive(Debug, Clone)]
pub struct DeltaSyncService {
    store: EntityStore,
}

impl DeltaSyncService {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    /// Serve one pull
    pub async fn pull(&self, request: &DeltaRequest) -> Result<DeltaResult, SyncError> {
        let entity_types: Vec<EntityType> = if request.entity_types.is_empty() {
            EntityType::all().to_vec()
        } else {
            request.entity_types.clone()
        };
        let limit = effective_limit(request.limit);

        // Captured before the reads and lagged behind the clock: a write
        // racing this pull may be both included here and re-sent next
        // window, never neither
        let synced_at = (Utc::now() - Duration::seconds(SYNCED_AT_LAG_SECS))
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        // All reads share one transaction so the response is a single
        // point-in-time view across entity types and tombstones
        let mut tx = self.store.pool().begin().await?;

        let mut changed = BTreeMap::new();
        let mut has_more = false;
        for entity_type in &entity_types {
            // One extra row detects truncation without a COUNT query
            let mut records = EntityStore::changed_entities(
                &mut *tx,
                request.workspace_id,
                *entity_type,
                request.modified_since.as_deref(),
                request.after_id.as_deref(),
                limit + 1,
            )
            .await?;
            if records.len() > limit as usize {
                records.truncate(limit as usize);
                has_more = true;
            }
            if !records.is_empty() {
                changed.insert(*entity_type, records);
            }
        }

        // Full syncs return current state only; deletions are invisible by
        // construction since nothing older exists on the client
        let tombstones = match &request.modified_since {
            Some(since) => {
                TombstoneStore::fetch_since(
                    &mut *tx,
                    request.workspace_id,
                    since,
                    &entity_types,
                )
                .await?
            }
            None => Vec::new(),
        };
        tx.commit().await?;

        let result = DeltaResult {
            changed,
            tombstones,
            synced_at,
            has_more,
        };
        debug!(
            workspace = %request.workspace_id,
            records = result.record_count(),
            tombstones = result.tombstones.len(),
            has_more = result.has_more,
            full_sync = request.modified_since.is_none(),
            "delta pull served"
        );
        Ok(result)
    }
}
