//! Server assembly: store, state, router and the maintenance task.

use crate::backend::routes::router::build_router;
use crate::backend::server::config::ServerConfig;
use crate::backend::server::state::AppState;
use crate::backend::store::tombstones::TombstoneStore;
use crate::backend::store::EntityStore;
use crate::shared::SyncError;
use axum::Router;
use std::time::Duration;
use tracing::{error, info};

/// Interval between maintenance sweeps (tombstone pruning, dead
/// subscriber cleanup)
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Build the application: open the store, assemble state and routes, and
/// spawn the periodic maintenance task
pub async fn create_app(config: &ServerConfig) -> Result<(Router, AppState), SyncError> {
    let store = EntityStore::connect(&config.database_path).await?;
    info!(path = %config.database_path.display(), "entity store opened");

    let state = AppState::new(store);
    spawn_maintenance(&state, config.tombstone_retention_days);

    let router = build_router(state.clone());
    Ok((router, state))
}

fn spawn_maintenance(state: &AppState, tombstone_retention_days: i64) {
    let tombstones = TombstoneStore::new(&state.store);
    let broadcaster = state.broadcaster.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = tombstones.prune_older_than(tombstone_retention_days).await {
                error!(error = %err, "tombstone pruning failed");
            }
            broadcaster.cleanup_closed().await;
        }
    });
}
