//! # Entity Payload Schemas
//!
//! Tidemark syncs three workspace-scoped entity types: categories (which
//! form a hierarchy through `parent_id`), products (which reference a
//! category), and customers. Payloads are a serde-tagged enum so the engine
//! can treat them opaquely while each variant still declares exactly which
//! of its fields may carry a temp-id reference. That declaration is what
//! makes the reconciliation rewrite mechanical: the queue and cache never
//! need entity-specific knowledge to replace a temp id.
//!
//! Ids are strings. Entities created offline carry a `tmp-` prefixed UUID
//! until the server assigns a real id.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity identifier (a plain UUID string, or a `tmp-` prefixed placeholder
/// for entities created offline)
pub type EntityId = String;

/// Prefix marking a client-generated placeholder id
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Mint a fresh temp id, unique for the life of the client session
pub fn mint_temp_id() -> EntityId {
    format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4())
}

/// Whether an id is a not-yet-reconciled placeholder
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Syncable entity types
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Category,
    Product,
    Customer,
}

impl EntityType {
    /// All syncable types, in the order delta pulls default to
    pub fn all() -> [EntityType; 3] {
        [EntityType::Category, EntityType::Product, EntityType::Customer]
    }

    /// Stable name used in URLs, database columns and wire maps
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Category => "category",
            EntityType::Product => "product",
            EntityType::Customer => "customer",
        }
    }

    /// Parse a type name, returning `None` for unknown names
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "category" => Some(EntityType::Category),
            "product" => Some(EntityType::Product),
            "customer" => Some(EntityType::Customer),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category fields; `parent_id` may reference another category, including
/// one that only exists as a temp id so far
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryFields {
    pub name: String,
    pub parent_id: Option<EntityId>,
}

/// Product fields; `category_id` may reference a not-yet-synced category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductFields {
    pub name: String,
    pub category_id: Option<EntityId>,
    pub price_cents: i64,
    pub sku: Option<String>,
}

/// Customer fields; no reference fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerFields {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Entity payload, tagged by entity type
///
/// This is the opaque payload shape carried by mutations and entity records.
/// The engine only ever touches it through [`EntityFields::entity_type`],
/// the declared reference-field accessors, and serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "data", rename_all = "snake_case")]
pub enum EntityFields {
    Category(CategoryFields),
    Product(ProductFields),
    Customer(CustomerFields),
}

impl EntityFields {
    /// The entity type this payload belongs to
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityFields::Category(_) => EntityType::Category,
            EntityFields::Product(_) => EntityType::Product,
            EntityFields::Customer(_) => EntityType::Customer,
        }
    }

    /// Display name, used for the minimal validation the engine itself needs
    pub fn display_name(&self) -> &str {
        match self {
            EntityFields::Category(f) => &f.name,
            EntityFields::Product(f) => &f.name,
            EntityFields::Customer(f) => &f.name,
        }
    }

    /// Mutable access to every field declared as able to hold an entity
    /// reference (and therefore a temp id)
    pub fn reference_fields_mut(&mut self) -> Vec<&mut EntityId> {
        match self {
            EntityFields::Category(f) => f.parent_id.iter_mut().collect(),
            EntityFields::Product(f) => f.category_id.iter_mut().collect(),
            EntityFields::Customer(_) => Vec::new(),
        }
    }

    /// Read access to every declared reference field
    pub fn reference_fields(&self) -> Vec<&EntityId> {
        match self {
            EntityFields::Category(f) => f.parent_id.iter().collect(),
            EntityFields::Product(f) => f.category_id.iter().collect(),
            EntityFields::Customer(_) => Vec::new(),
        }
    }

    /// Temp ids currently present in reference fields
    pub fn temp_references(&self) -> Vec<EntityId> {
        self.reference_fields()
            .into_iter()
            .filter(|id| is_temp_id(id))
            .cloned()
            .collect()
    }

    /// Replace every occurrence of `temp_id` in reference fields with
    /// `real_id`, returning how many fields were rewritten
    pub fn rewrite_references(&mut self, temp_id: &str, real_id: &str) -> usize {
        let mut rewritten = 0;
        for field in self.reference_fields_mut() {
            if field == temp_id {
                *field = real_id.to_string();
                rewritten += 1;
            }
        }
        rewritten
    }
}

/// A materialized entity: id, owning workspace, payload, and the server
/// modification timestamp the delta protocol orders by
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub workspace_id: Uuid,
    pub updated_at: String,
    #[serde(flatten)]
    pub fields: EntityFields,
}

impl EntityRecord {
    pub fn entity_type(&self) -> EntityType {
        self.fields.entity_type()
    }

    /// Whether this record's id or any reference field mentions `id`
    pub fn references(&self, id: &str) -> bool {
        self.id == id || self.fields.reference_fields().iter().any(|r| *r == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_temp_id_shape() {
        let id = mint_temp_id();
        assert!(is_temp_id(&id));
        assert!(!is_temp_id("0b2e9f1c-6c5d-4f7e-9a1b-000000000000"));
    }

    #[test]
    fn test_entity_type_names_round_trip() {
        for ty in EntityType::all() {
            assert_eq!(EntityType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(EntityType::parse("invoice"), None);
    }

    #[test]
    fn test_category_declares_parent_reference() {
        let temp = mint_temp_id();
        let fields = EntityFields::Category(CategoryFields {
            name: "Beverages".to_string(),
            parent_id: Some(temp.clone()),
        });
        assert_eq!(fields.temp_references(), vec![temp]);
    }

    #[test]
    fn test_customer_declares_no_references() {
        let fields = EntityFields::Customer(CustomerFields {
            name: "Ada".to_string(),
            email: None,
            phone: None,
        });
        assert!(fields.reference_fields().is_empty());
    }

    #[test]
    fn test_rewrite_references_replaces_temp_id() {
        let temp = mint_temp_id();
        let mut fields = EntityFields::Product(ProductFields {
            name: "Espresso".to_string(),
            category_id: Some(temp.clone()),
            price_cents: 350,
            sku: None,
        });

        let rewritten = fields.rewrite_references(&temp, "real-id");
        assert_eq!(rewritten, 1);
        assert!(fields.temp_references().is_empty());
        assert_eq!(fields.reference_fields(), vec![&"real-id".to_string()]);

        // Rewriting an id that does not appear is a no-op
        assert_eq!(fields.rewrite_references(&temp, "other"), 0);
    }

    #[test]
    fn test_payload_serde_is_tagged_by_entity_type() {
        let fields = EntityFields::Category(CategoryFields {
            name: "Snacks".to_string(),
            parent_id: None,
        });
        let json = serde_json::to_value(&fields).unwrap();
        assert_eq!(json["entity_type"], "category");
        assert_eq!(json["data"]["name"], "Snacks");

        let back: EntityFields = serde_json::from_value(json).unwrap();
        assert_eq!(back, fields);
    }
}
