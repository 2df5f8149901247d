//! Shared application state handed to every request handler.

use crate::backend::realtime::ChangeBroadcaster;
use crate::backend::store::EntityStore;
use crate::backend::sync::DeltaSyncService;
use axum::extract::FromRef;

/// State shared across all routes
#[derive(Clone)]
pub struct AppState {
    pub store: EntityStore,
    pub delta: DeltaSyncService,
    pub broadcaster: ChangeBroadcaster,
}

impl AppState {
    pub fn new(store: EntityStore) -> Self {
        let delta = DeltaSyncService::new(store.clone());
        Self {
            store,
            delta,
            broadcaster: ChangeBroadcaster::new(),
        }
    }
}

impl FromRef<AppState> for EntityStore {
    fn from_ref(state: &AppState) -> Self {
        state.store.clone()
    }
}

impl FromRef<AppState> for DeltaSyncService {
    fn from_ref(state: &AppState) -> Self {
        state.delta.clone()
    }
}

impl FromRef<AppState> for ChangeBroadcaster {
    fn from_ref(state: &AppState) -> Self {
        state.broadcaster.clone()
    }
}
