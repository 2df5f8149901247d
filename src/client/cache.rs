//! # Optimistic Cache
//!
//! Read model the UI queries. Two layers: a confirmed layer fed by delta
//! pulls and submission acknowledgements, and a pending overlay fed by
//! enqueued-but-unconfirmed mutations. Reads merge the overlay over the
//! confirmed layer, so local writes are visible immediately while the
//! confirmed layer never contains anything the server did not acknowledge.

use crate::client::reconciliation::ReconciliationMap;
use crate::shared::delta::DeltaResult;
use crate::shared::entity::{EntityFields, EntityId, EntityRecord, EntityType};
use std::collections::HashMap;
use std::sync::RwLock;

type Key = (EntityType, EntityId);

/// One pending, unconfirmed local write
#[derive(Debug, Clone, PartialEq)]
enum PendingOverlay {
    Upsert(EntityFields),
    Delete,
}

/// Merged read result: the entity as the UI should currently see it
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    pub id: EntityId,
    pub fields: EntityFields,
    /// True when the visible state includes an unconfirmed local write
    pub pending: bool,
}

/// Two-layer optimistic read cache
#[derive(Debug, Default)]
pub struct OptimisticCache {
    confirmed: RwLock<HashMap<Key, EntityRecord>>,
    overlay: RwLock<HashMap<Key, PendingOverlay>>,
}

impl OptimisticCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the confirmed layer, typically from the local mirror on startup
    pub fn seed(&self, records: Vec<EntityRecord>) {
        let mut confirmed = self.confirmed.write().unwrap_or_else(|e| e.into_inner());
        for record in records {
            confirmed.insert((record.entity_type(), record.id.clone()), record);
        }
    }

    /// Record an unconfirmed local create or update
    pub fn overlay_upsert(&self, id: &str, fields: EntityFields) {
        self.overlay
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((fields.entity_type(), id.to_string()), PendingOverlay::Upsert(fields));
    }

    /// Record an unconfirmed local delete
    pub fn overlay_delete(&self, entity_type: EntityType, id: &str) {
        self.overlay
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((entity_type, id.to_string()), PendingOverlay::Delete);
    }

    /// Drop a pending overlay entry without confirming it (discarded
    /// mutation); the confirmed layer shows through again
    pub fn rollback(&self, entity_type: EntityType, id: &str) {
        self.overlay
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(entity_type, id.to_string()));
    }

    /// A mutation was acknowledged: install the server record and clear its
    /// overlay entry
    pub fn confirm(&self, record: EntityRecord) {
        let key = (record.entity_type(), record.id.clone());
        self.overlay
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        self.confirmed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, record);
    }

    /// A delete was acknowledged: the entity is gone from both layers
    pub fn confirm_delete(&self, entity_type: EntityType, id: &str) {
        let key = (entity_type, id.to_string());
        self.overlay
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        self.confirmed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }

    /// Re-key overlay entries from a resolved temp id to the real id and
    /// rewrite any reference fields that still carry the temp id
    pub fn rewrite_temp_id(&self, temp_id: &str, real_id: &str) {
        let mut overlay = self.overlay.write().unwrap_or_else(|e| e.into_inner());

        let rekey: Vec<Key> = overlay
            .keys()
            .filter(|(_, id)| id == temp_id)
            .cloned()
            .collect();
        for (ty, _) in rekey {
            if let Some(entry) = overlay.remove(&(ty, temp_id.to_string())) {
                overlay.insert((ty, real_id.to_string()), entry);
            }
        }

        for entry in overlay.values_mut() {
            if let PendingOverlay::Upsert(fields) = entry {
                fields.rewrite_references(temp_id, real_id);
            }
        }
    }

    /// Apply one delta pull: records land in the confirmed layer, tombstones
    /// clear both layers. An overlay entry still keyed by a temp id that the
    /// reconciliation map resolves to an incoming record is stale and dropped.
    pub fn apply_delta(&self, delta: &DeltaResult, recon: &ReconciliationMap) {
        {
            let mut confirmed = self.confirmed.write().unwrap_or_else(|e| e.into_inner());
            for records in delta.changed.values() {
                for record in records {
                    confirmed.insert((record.entity_type(), record.id.clone()), record.clone());
                }
            }
            for tombstone in &delta.tombstones {
                confirmed.remove(&(tombstone.entity_type, tombstone.entity_id.clone()));
            }
        }

        let mut overlay = self.overlay.write().unwrap_or_else(|e| e.into_inner());
        for tombstone in &delta.tombstones {
            overlay.remove(&(tombstone.entity_type, tombstone.entity_id.clone()));
        }
        overlay.retain(|(ty, id), _| {
            let resolved = recon.resolve_id(id);
            if resolved == *id {
                return true;
            }
            // Keep unless the resolved record arrived in this delta
            !delta
                .changed
                .get(ty)
                .map(|records| records.iter().any(|r| r.id == resolved))
                .unwrap_or(false)
        });
    }

    /// The confirmed `updated_at` for an entity, used as the base state a
    /// queued update or delete declares to the server
    pub fn confirmed_updated_at(&self, entity_type: EntityType, id: &str) -> Option<String> {
        self.confirmed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(entity_type, id.to_string()))
            .map(|record| record.updated_at.clone())
    }

    /// Merged read of one entity
    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<CachedEntity> {
        let key = (entity_type, id.to_string());
        let overlay = self.overlay.read().unwrap_or_else(|e| e.into_inner());
        match overlay.get(&key) {
            Some(PendingOverlay::Delete) => None,
            Some(PendingOverlay::Upsert(fields)) => Some(CachedEntity {
                id: id.to_string(),
                fields: fields.clone(),
                pending: true,
            }),
            None => self
                .confirmed
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&key)
                .map(|record| CachedEntity {
                    id: record.id.clone(),
                    fields: record.fields.clone(),
                    pending: false,
                }),
        }
    }

    /// Merged listing of one entity type, sorted by id for stable output
    pub fn list(&self, entity_type: EntityType) -> Vec<CachedEntity> {
        let overlay = self.overlay.read().unwrap_or_else(|e| e.into_inner());
        let confirmed = self.confirmed.read().unwrap_or_else(|e| e.into_inner());

        let mut merged: HashMap<&EntityId, CachedEntity> = HashMap::new();
        for ((ty, id), record) in confirmed.iter() {
            if *ty == entity_type {
                merged.insert(
                    id,
                    CachedEntity {
                        id: record.id.clone(),
                        fields: record.fields.clone(),
                        pending: false,
                    },
                );
            }
        }
        for ((ty, id), entry) in overlay.iter() {
            if *ty != entity_type {
                continue;
            }
            match entry {
                PendingOverlay::Delete => {
                    merged.remove(id);
                }
                PendingOverlay::Upsert(fields) => {
                    merged.insert(
                        id,
                        CachedEntity {
                            id: id.clone(),
                            fields: fields.clone(),
                            pending: true,
                        },
                    );
                }
            }
        }

        let mut entities: Vec<CachedEntity> = merged.into_values().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        entities
    }

    /// Number of pending overlay entries, surfaced in sync status
    pub fn pending_count(&self) -> usize {
        self.overlay.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
