//! # Temp Id Reconciliation
//!
//! In-memory view of the temp id -> real id map. The durable copy lives in
//! the local database; this structure is the fast lookup path the cache and
//! puller use when deciding whether an incoming record corresponds to an
//! optimistic entry keyed by a temp id.

use crate::client::local_db::LocalDatabase;
use crate::shared::entity::{is_temp_id, EntityFields, EntityId};
use crate::shared::SyncError;
use std::collections::HashMap;
use std::sync::RwLock;

/// Temp id -> server-assigned id lookup
#[derive(Debug, Default)]
pub struct ReconciliationMap {
    entries: RwLock<HashMap<String, String>>,
}

impl ReconciliationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the durable map from the local database, so resolutions from
    /// previous sessions survive restarts.
    pub async fn load(db: &LocalDatabase) -> Result<Self, SyncError> {
        let entries = db.load_temp_id_map().await?.into_iter().collect();
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Record a resolution
    pub fn insert(&self, temp_id: &str, real_id: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(temp_id.to_string(), real_id.to_string());
    }

    /// Look up the real id for a temp id, if resolved
    pub fn resolve(&self, temp_id: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(temp_id)
            .cloned()
    }

    /// Map any id to its canonical form: temp ids become their real id when
    /// resolved, everything else passes through unchanged
    pub fn resolve_id(&self, id: &str) -> String {
        if is_temp_id(id) {
            self.resolve(id).unwrap_or_else(|| id.to_string())
        } else {
            id.to_string()
        }
    }

    /// Rewrite every resolved temp reference in a payload in place,
    /// returning how many fields changed
    pub fn apply_to_fields(&self, fields: &mut EntityFields) -> usize {
        let temps: Vec<EntityId> = fields.temp_references();
        let mut rewritten = 0;
        for temp in temps {
            if let Some(real) = self.resolve(&temp) {
                rewritten += fields.rewrite_references(&temp, &real);
            }
        }
        rewritten
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::entity::{mint_temp_id, CategoryFields};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolve_id_passes_real_ids_through() {
        let map = ReconciliationMap::new();
        let temp = mint_temp_id();
        map.insert(&temp, "real-1");

        assert_eq!(map.resolve_id(&temp), "real-1");
        assert_eq!(map.resolve_id("real-9"), "real-9");
        // Unresolved temp ids stay as-is
        let other = mint_temp_id();
        assert_eq!(map.resolve_id(&other), other);
    }

    #[test]
    fn test_apply_to_fields_rewrites_resolved_references() {
        let map = ReconciliationMap::new();
        let temp = mint_temp_id();
        map.insert(&temp, "real-1");

        let mut fields = EntityFields::Category(CategoryFields {
            name: "Frozen".to_string(),
            parent_id: Some(temp),
        });
        assert_eq!(map.apply_to_fields(&mut fields), 1);
        assert!(fields.temp_references().is_empty());
    }

    #[tokio::test]
    async fn test_load_from_database() {
        let db = LocalDatabase::in_memory().await.unwrap();
        db.record_temp_id("tmp-a", "real-a").await.unwrap();

        let map = ReconciliationMap::load(&db).await.unwrap();
        assert_eq!(map.resolve("tmp-a").as_deref(), Some("real-a"));
        assert_eq!(map.len(), 1);
    }
}
