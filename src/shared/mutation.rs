//! # Mutation Shapes
//!
//! A [`QueuedMutation`] is one durable entry in the client's mutation queue:
//! a create, update, or delete that has not yet been confirmed by the
//! server. The same module defines the submission wire types the backend
//! accepts, so both sides agree on the contract byte for byte.
//!
//! Status lifecycle:
//!
//! ```text
//! pending -> sending -> done (removed from the durable queue)
//!    |          |
//!    |          +-> pending (transient failure, backoff gate set)
//!    |          +-> failed  (conflict, validation, or retries exhausted)
//!    +-> blocked (a dependency failed, or a dependency cycle was detected)
//! ```

use crate::shared::entity::{is_temp_id, EntityFields, EntityId, EntityRecord, EntityType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Write operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOperation {
    Create,
    Update,
    Delete,
}

impl MutationOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOperation::Create => "create",
            MutationOperation::Update => "update",
            MutationOperation::Delete => "delete",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "create" => Some(MutationOperation::Create),
            "update" => Some(MutationOperation::Update),
            "delete" => Some(MutationOperation::Delete),
            _ => None,
        }
    }
}

/// Queue entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Waiting to be sent
    Pending,
    /// Submission in flight
    Sending,
    /// Terminally failed; inspectable until the user retries or discards it
    Failed,
    /// Excluded from sending because a dependency failed or is cyclic
    Blocked,
    /// Acknowledged by the server
    Done,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Sending => "sending",
            MutationStatus::Failed => "failed",
            MutationStatus::Blocked => "blocked",
            MutationStatus::Done => "done",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "pending" => Some(MutationStatus::Pending),
            "sending" => Some(MutationStatus::Sending),
            "failed" => Some(MutationStatus::Failed),
            "blocked" => Some(MutationStatus::Blocked),
            "done" => Some(MutationStatus::Done),
            _ => None,
        }
    }
}

/// Why a mutation is `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Transient,
    Conflict,
    Validation,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Transient => "transient",
            FailureReason::Conflict => "conflict",
            FailureReason::Validation => "validation",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "transient" => Some(FailureReason::Transient),
            "conflict" => Some(FailureReason::Conflict),
            "validation" => Some(FailureReason::Validation),
            _ => None,
        }
    }
}

/// Why a mutation is `blocked`
///
/// `FailedDependency` is a derived state that clears when the blocking
/// mutation is discarded or retried. `CyclicDependency` signals a
/// data-integrity bug in the dependency graph and is never auto-resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockReason {
    FailedDependency,
    CyclicDependency,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::FailedDependency => "failed-dependency",
            BlockReason::CyclicDependency => "cyclic-dependency",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "failed-dependency" => Some(BlockReason::FailedDependency),
            "cyclic-dependency" => Some(BlockReason::CyclicDependency),
            _ => None,
        }
    }
}

/// One durable entry in the client mutation queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Client-local stable id; doubles as the server-side idempotency key
    pub id: Uuid,
    pub operation: MutationOperation,
    pub entity_type: EntityType,
    /// Target entity id; the temp id itself for a `create`, and possibly a
    /// temp id for an update/delete aimed at an offline-created entity
    pub entity_id: EntityId,
    /// Entity payload; `None` for deletes
    pub payload: Option<EntityFields>,
    /// Temp ids of other mutations this one's payload or target references
    pub depends_on: Vec<EntityId>,
    /// The `updated_at` the client last saw for the target, letting the
    /// server detect concurrent modification; `None` for creates
    pub base_updated_at: Option<String>,
    pub enqueued_at: String,
    pub retry_count: u32,
    /// Backoff gate; the drainer skips this entry until the timestamp passes
    pub next_attempt_at: Option<String>,
    pub status: MutationStatus,
    pub fail_reason: Option<FailureReason>,
    pub block_reason: Option<BlockReason>,
    pub last_error: Option<String>,
}

impl QueuedMutation {
    /// The temp id this mutation produces, if it is an offline create
    pub fn produced_temp_id(&self) -> Option<&str> {
        if self.operation == MutationOperation::Create && is_temp_id(&self.entity_id) {
            Some(&self.entity_id)
        } else {
            None
        }
    }

    /// Whether the backoff gate allows sending at `now`
    pub fn is_ready_at(&self, now: &str) -> bool {
        match &self.next_attempt_at {
            Some(at) => at.as_str() <= now,
            None => true,
        }
    }

    /// Whether any temp id remains in the target or payload references
    pub fn has_unresolved_temp_ids(&self) -> bool {
        if is_temp_id(&self.entity_id) && self.operation != MutationOperation::Create {
            return true;
        }
        self.payload
            .as_ref()
            .map(|p| !p.temp_references().is_empty())
            .unwrap_or(false)
    }
}

/// Submission request accepted by `POST /api/workspaces/{id}/mutations`
///
/// `mutation_id` is the idempotency key: submitting the same id twice
/// produces exactly one server-side effect, with the recorded outcome
/// returned on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitMutationRequest {
    pub mutation_id: Uuid,
    pub workspace_id: Uuid,
    pub operation: MutationOperation,
    pub entity_type: EntityType,
    /// Target id with temp ids already resolved (server-assigned ids only);
    /// ignored for creates, which are assigned a fresh id
    pub entity_id: EntityId,
    pub payload: Option<EntityFields>,
    pub base_updated_at: Option<String>,
}

/// Successful submission outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitMutationResponse {
    /// Server-assigned id (for creates this is the real id the temp id
    /// reconciles to)
    pub entity_id: EntityId,
    pub updated_at: String,
    /// The created/updated entity; `None` for deletes
    pub entity: Option<EntityRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::entity::{mint_temp_id, CategoryFields};
    use crate::shared::now_rfc3339;
    use pretty_assertions::assert_eq;

    fn category_create(temp_id: &str) -> QueuedMutation {
        QueuedMutation {
            id: Uuid::new_v4(),
            operation: MutationOperation::Create,
            entity_type: EntityType::Category,
            entity_id: temp_id.to_string(),
            payload: Some(EntityFields::Category(CategoryFields {
                name: "Drinks".to_string(),
                parent_id: None,
            })),
            depends_on: Vec::new(),
            base_updated_at: None,
            enqueued_at: now_rfc3339(),
            retry_count: 0,
            next_attempt_at: None,
            status: MutationStatus::Pending,
            fail_reason: None,
            block_reason: None,
            last_error: None,
        }
    }

    #[test]
    fn test_create_produces_temp_id() {
        let temp = mint_temp_id();
        let mutation = category_create(&temp);
        assert_eq!(mutation.produced_temp_id(), Some(temp.as_str()));

        let mut update = mutation.clone();
        update.operation = MutationOperation::Update;
        assert_eq!(update.produced_temp_id(), None);
    }

    #[test]
    fn test_backoff_gate() {
        let temp = mint_temp_id();
        let mut mutation = category_create(&temp);
        assert!(mutation.is_ready_at("2026-01-01T00:00:00.000000Z"));

        mutation.next_attempt_at = Some("2099-01-01T00:00:00.000000Z".to_string());
        assert!(!mutation.is_ready_at(&now_rfc3339()));
    }

    #[test]
    fn test_unresolved_temp_ids() {
        let parent = mint_temp_id();
        let temp = mint_temp_id();
        let mut mutation = category_create(&temp);

        // A create targeting its own temp id is fine
        assert!(!mutation.has_unresolved_temp_ids());

        // A temp reference in the payload is not
        mutation.payload = Some(EntityFields::Category(CategoryFields {
            name: "Sodas".to_string(),
            parent_id: Some(parent.clone()),
        }));
        assert!(mutation.has_unresolved_temp_ids());

        // Neither is an update still aimed at a temp target
        let mut update = category_create(&temp);
        update.operation = MutationOperation::Update;
        assert!(update.has_unresolved_temp_ids());
    }

    #[test]
    fn test_status_names_round_trip() {
        for status in [
            MutationStatus::Pending,
            MutationStatus::Sending,
            MutationStatus::Failed,
            MutationStatus::Blocked,
            MutationStatus::Done,
        ] {
            assert_eq!(MutationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            BlockReason::parse("cyclic-dependency"),
            Some(BlockReason::CyclicDependency)
        );
    }
}
