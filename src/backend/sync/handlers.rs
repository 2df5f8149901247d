//! HTTP handlers for the sync protocol: mutation submission and delta pull.

use crate::backend::error::ApiError;
use crate::backend::realtime::ChangeBroadcaster;
use crate::backend::server::state::AppState;
use crate::backend::store::EntityStore;
use crate::backend::sync::DeltaSyncService;
use crate::shared::delta::{DeltaRequest, DeltaResult};
use crate::shared::entity::EntityType;
use crate::shared::mutation::{SubmitMutationRequest, SubmitMutationResponse};
use crate::shared::SyncError;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

/// Query parameters of `GET /api/workspaces/{workspace_id}/delta`
#[derive(Debug, Deserialize)]
pub struct DeltaParams {
    /// Checkpoint; omitted for a full sync
    pub modified_since: Option<String>,
    /// Comma-separated entity type names; omitted means all types
    pub entity_types: Option<String>,
    pub limit: Option<u32>,
    /// Paging tie-break: last applied entity id at the checkpoint timestamp
    pub after_id: Option<String>,
}

fn parse_entity_types(raw: Option<&str>) -> Result<Vec<EntityType>, SyncError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            EntityType::parse(name)
                .ok_or_else(|| SyncError::validation(format!("unknown entity type: {}", name)))
        })
        .collect()
}

/// `POST /api/workspaces/{workspace_id}/mutations`
pub async fn submit_mutation(
    Path(workspace_id): Path<Uuid>,
    State(store): State<EntityStore>,
    State(broadcaster): State<ChangeBroadcaster>,
    Json(request): Json<SubmitMutationRequest>,
) -> Result<Json<SubmitMutationResponse>, ApiError> {
    if request.workspace_id != workspace_id {
        return Err(SyncError::validation("workspace id mismatch").into());
    }

    let (response, event) = store.apply_mutation(&request).await?;
    if let Some(event) = event {
        broadcaster.publish(workspace_id, &event).await;
    }
    Ok(Json(response))
}

/// `GET /api/workspaces/{workspace_id}/delta`
pub async fn pull_delta(
    Path(workspace_id): Path<Uuid>,
    Query(params): Query<DeltaParams>,
    State(service): State<DeltaSyncService>,
) -> Result<Json<DeltaResult>, ApiError> {
    let entity_types = parse_entity_types(params.entity_types.as_deref())?;
    let result = service
        .pull(&DeltaRequest {
            workspace_id,
            modified_since: params.modified_since,
            entity_types,
            limit: params.limit,
            after_id: params.after_id,
        })
        .await?;
    Ok(Json(result))
}

/// `GET /health`
pub async fn health(State(_state): State<AppState>) -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_entity_types() {
        assert_eq!(parse_entity_types(None).unwrap(), Vec::<EntityType>::new());
        assert_eq!(
            parse_entity_types(Some("category,product")).unwrap(),
            vec![EntityType::Category, EntityType::Product]
        );
        assert_eq!(
            parse_entity_types(Some(" customer ")).unwrap(),
            vec![EntityType::Customer]
        );
        assert!(parse_entity_types(Some("invoice")).is_err());
    }
}
