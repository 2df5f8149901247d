//! # Delta Sync Wire Types
//!
//! Incremental pull protocol: the client sends its checkpoint (the
//! `synced_at` of the last fully-applied pull) and receives everything that
//! changed after it, including tombstones for deletions that happened while
//! the client was offline. Omitting the checkpoint requests a full sync,
//! which returns current entities only and no tombstones.
//!
//! The protocol is the authoritative, self-healing channel; change events
//! ([`ChangeEvent`]) are only advisory wake-up hints.

use crate::shared::entity::{EntityId, EntityRecord, EntityType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default per-type record limit for a single pull
pub const DEFAULT_PULL_LIMIT: u32 = 500;

/// Hard cap on the per-type record limit
pub const MAX_PULL_LIMIT: u32 = 1000;

/// Resolve a requested limit to the effective one
pub fn effective_limit(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_PULL_LIMIT).clamp(1, MAX_PULL_LIMIT)
}

/// Parameters of one delta pull
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaRequest {
    pub workspace_id: Uuid,
    /// Checkpoint; `None` requests a full sync
    pub modified_since: Option<String>,
    /// Requested entity types; empty means all syncable types
    pub entity_types: Vec<EntityType>,
    /// Per-type record limit, defaulted and capped by [`effective_limit`]
    pub limit: Option<u32>,
    /// Paging tie-break: with `modified_since` set to the `updated_at` of
    /// the last applied record, only records after `(modified_since,
    /// after_id)` in `(updated_at, entity_id)` order are returned. Without
    /// it, equal timestamps straddling a page limit would be skipped when
    /// the window moves past their timestamp. Ignored on full syncs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_id: Option<EntityId>,
}

/// Durable record of a deletion
///
/// Tombstones are append-only and retained at least as long as the longest
/// supported offline duration, so any client whose checkpoint predates the
/// deletion still observes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub workspace_id: Uuid,
    pub deleted_at: String,
}

/// Result of one delta pull
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaResult {
    /// Changed records per entity type
    pub changed: BTreeMap<EntityType, Vec<EntityRecord>>,
    /// Deletions after the checkpoint; empty on full syncs
    pub tombstones: Vec<Tombstone>,
    /// Server clock at response time; becomes the next checkpoint once a
    /// `has_more = false` pull has been durably applied
    pub synced_at: String,
    /// True when any requested type hit its limit; the caller must re-pull
    /// with the same checkpoint before advancing it
    pub has_more: bool,
}

impl DeltaResult {
    /// Total changed records across all types
    pub fn record_count(&self) -> usize {
        self.changed.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0 && self.tombstones.is_empty()
    }
}

/// What kind of change a notification describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Minimal change notification fanned out to connected workspace clients
///
/// Delivery is best-effort and at-most-once; correctness never depends on
/// an event arriving, it only prompts an earlier delta pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_effective_limit_defaults_and_caps() {
        assert_eq!(effective_limit(None), DEFAULT_PULL_LIMIT);
        assert_eq!(effective_limit(Some(50)), 50);
        assert_eq!(effective_limit(Some(10_000)), MAX_PULL_LIMIT);
        assert_eq!(effective_limit(Some(0)), 1);
    }

    #[test]
    fn test_delta_result_counts() {
        let mut changed = BTreeMap::new();
        changed.insert(EntityType::Category, Vec::new());
        let result = DeltaResult {
            changed,
            tombstones: Vec::new(),
            synced_at: "2026-01-01T00:00:00.000000Z".to_string(),
            has_more: false,
        };
        assert_eq!(result.record_count(), 0);
        assert!(result.is_empty());
    }

    #[test]
    fn test_change_event_wire_shape() {
        let event = ChangeEvent {
            kind: ChangeKind::Deleted,
            entity_type: EntityType::Product,
            entity_id: "abc".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deleted");
        assert_eq!(json["entity_type"], "product");
        assert_eq!(json["entity_id"], "abc");
    }
}
