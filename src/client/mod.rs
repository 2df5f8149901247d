//! # Client Sync Engine
//!
//! Offline-first client: every write lands in a durable local queue and an
//! optimistic cache first, then a background loop replays the queue against
//! the server in dependency order, reconciles temp ids, and pulls deltas to
//! converge on server state.
//!
//! [`SyncEngine`] is the facade the hosting application talks to; the
//! submodules behind it each own one concern:
//!
//! - [`queue`] - durable mutation queue
//! - [`resolver`] - dependency-aware replay planning
//! - [`drainer`] - chain replay, retry and failure classification
//! - [`reconciliation`] - temp id resolution
//! - [`cache`] - optimistic read model
//! - [`puller`] - incremental delta pulls
//! - [`scheduler`] - background cadence
//! - [`transport`] - how the server is reached

pub mod cache;
pub mod drainer;
pub mod local_db;
pub mod puller;
pub mod queue;
pub mod reconciliation;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod transport;

pub use cache::{CachedEntity, OptimisticCache};
pub use drainer::{DrainSummary, DrainerState, SyncDrainer};
pub use local_db::LocalDatabase;
pub use puller::{DeltaPuller, PullSummary};
pub use queue::{MutationQueue, NewMutation, QueueStats};
pub use reconciliation::ReconciliationMap;
pub use retry::RetryPolicy;
pub use scheduler::SyncScheduler;
pub use transport::{HttpTransport, SyncTransport};

use crate::shared::delta::ChangeEvent;
use crate::shared::entity::{is_temp_id, mint_temp_id, EntityFields, EntityId, EntityType};
use crate::shared::mutation::{MutationOperation, QueuedMutation};
use crate::shared::SyncError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_id: Uuid,
    /// Entity types this client syncs; defaults to all of them
    pub entity_types: Vec<EntityType>,
    /// Per-type delta page size; `None` uses the server default
    pub pull_limit: Option<u32>,
    pub retry: RetryPolicy,
    /// Base interval of the background loop
    pub sync_interval: Duration,
}

impl SyncConfig {
    pub fn new(workspace_id: Uuid) -> Self {
        Self {
            workspace_id,
            entity_types: EntityType::all().to_vec(),
            pull_limit: None,
            retry: RetryPolicy::default(),
            sync_interval: Duration::from_secs(30),
        }
    }
}

/// Combined outcome of one sync cycle (push then pull)
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub drain: DrainSummary,
    pub pull: PullSummary,
}

/// Snapshot of engine state for status display
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub queue: QueueStats,
    /// Entities currently shown from the pending overlay
    pub pending_entities: usize,
    pub drainer: DrainerState,
}

/// Facade over the whole client engine
pub struct SyncEngine {
    config: SyncConfig,
    db: Arc<LocalDatabase>,
    queue: Arc<MutationQueue>,
    cache: Arc<OptimisticCache>,
    recon: Arc<ReconciliationMap>,
    drainer: SyncDrainer,
    puller: DeltaPuller,
    scheduler: SyncScheduler,
}

impl SyncEngine {
    /// Build an engine over an opened local database and a transport.
    /// Reloads the reconciliation map and seeds the cache from the local
    /// mirror, so reads work before the first network round trip.
    pub async fn new(
        db: Arc<LocalDatabase>,
        transport: Arc<dyn SyncTransport>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let recon = Arc::new(ReconciliationMap::load(&db).await?);
        let cache = Arc::new(OptimisticCache::new());
        cache.seed(db.load_entities().await?);

        let queue = Arc::new(MutationQueue::new(db.clone()));
        queue.recover_in_flight().await?;

        let drainer = SyncDrainer::new(
            queue.clone(),
            db.clone(),
            cache.clone(),
            recon.clone(),
            transport.clone(),
            config.retry.clone(),
            config.workspace_id,
        );
        let puller = DeltaPuller::new(
            db.clone(),
            cache.clone(),
            recon.clone(),
            transport,
            config.workspace_id,
            config.entity_types.clone(),
            config.pull_limit,
        );
        let scheduler = SyncScheduler::new(config.sync_interval);

        Ok(Self {
            config,
            db,
            queue,
            cache,
            recon,
            drainer,
            puller,
            scheduler,
        })
    }

    // ---- local writes --------------------------------------------------

    /// Create an entity locally. Returns the temp id the caller can use
    /// immediately; it reconciles to the server-assigned id on sync.
    pub async fn create(&self, mut fields: EntityFields) -> Result<EntityId, SyncError> {
        // References the caller still holds as temp ids may already be
        // reconciled; resolve them now so only live temp ids become
        // dependencies
        self.recon.apply_to_fields(&mut fields);
        let temp_id = mint_temp_id();
        let depends_on = fields.temp_references();

        self.queue
            .enqueue(NewMutation {
                operation: MutationOperation::Create,
                entity_type: fields.entity_type(),
                entity_id: temp_id.clone(),
                payload: Some(fields.clone()),
                depends_on,
                base_updated_at: None,
            })
            .await?;
        self.cache.overlay_upsert(&temp_id, fields);
        Ok(temp_id)
    }

    /// Update an entity locally; `id` may still be a temp id
    pub async fn update(&self, id: &str, mut fields: EntityFields) -> Result<(), SyncError> {
        // A temp id whose create was already acknowledged resolves here,
        // so the queued entry targets the server-assigned id directly
        let id = self.recon.resolve_id(id);
        self.recon.apply_to_fields(&mut fields);

        let entity_type = fields.entity_type();
        let mut depends_on = fields.temp_references();
        if is_temp_id(&id) {
            depends_on.push(id.clone());
        }

        self.queue
            .enqueue(NewMutation {
                operation: MutationOperation::Update,
                entity_type,
                entity_id: id.clone(),
                payload: Some(fields.clone()),
                depends_on,
                base_updated_at: self.cache.confirmed_updated_at(entity_type, &id),
            })
            .await?;
        self.cache.overlay_upsert(&id, fields);
        Ok(())
    }

    /// Delete an entity locally; `id` may still be a temp id
    pub async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), SyncError> {
        let id = self.recon.resolve_id(id);
        let depends_on = if is_temp_id(&id) {
            vec![id.clone()]
        } else {
            Vec::new()
        };

        self.queue
            .enqueue(NewMutation {
                operation: MutationOperation::Delete,
                entity_type,
                entity_id: id.clone(),
                payload: None,
                depends_on,
                base_updated_at: self.cache.confirmed_updated_at(entity_type, &id),
            })
            .await?;
        self.cache.overlay_delete(entity_type, &id);
        Ok(())
    }

    // ---- reads ---------------------------------------------------------

    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<CachedEntity> {
        // Reads through a temp id keep working after reconciliation
        let id = self.recon.resolve_id(id);
        self.cache.get(entity_type, &id)
    }

    pub fn list(&self, entity_type: EntityType) -> Vec<CachedEntity> {
        self.cache.list(entity_type)
    }

    /// Canonical id for any id the caller holds (temp ids resolve once the
    /// create is acknowledged)
    pub fn resolve_id(&self, id: &str) -> String {
        self.recon.resolve_id(id)
    }

    // ---- sync ----------------------------------------------------------

    /// One full sync cycle: push the queue, then pull deltas
    pub async fn sync_now(&self) -> Result<SyncReport, SyncError> {
        let drain = self.drainer.drain().await?;
        let pull = self.puller.pull_once().await?;
        Ok(SyncReport { drain, pull })
    }

    /// A change notification arrived; pull sooner than scheduled
    pub async fn notify_change(&self, event: &ChangeEvent) {
        debug!(
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            "change notification received"
        );
        self.scheduler.request_immediate().await;
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        Ok(SyncStatus {
            queue: self.queue.stats().await?,
            pending_entities: self.cache.pending_count(),
            drainer: self.drainer.state().await,
        })
    }

    // ---- failed mutation workflow --------------------------------------

    /// Failed mutations, payloads and reasons intact
    pub async fn failed_mutations(&self) -> Result<Vec<QueuedMutation>, SyncError> {
        self.queue.list_failed().await
    }

    /// Drop a failed mutation and roll its optimistic effect back; blocked
    /// dependents become eligible again on the next drain cycle
    pub async fn discard_failed(&self, id: Uuid) -> Result<bool, SyncError> {
        let Some(discarded) = self.queue.discard(id).await? else {
            return Ok(false);
        };
        self.cache
            .rollback(discarded.entity_type, &discarded.entity_id);
        Ok(true)
    }

    /// Re-queue a failed mutation with a fresh retry budget
    pub async fn retry_failed(&self, id: Uuid) -> Result<(), SyncError> {
        self.queue.retry_failed(id).await
    }

    // ---- background loop -----------------------------------------------

    /// Spawn the background sync loop. `events` carries change
    /// notifications (from the server's event stream or any other source);
    /// closing it stops the loop.
    pub fn spawn_background(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<ChangeEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = engine
                    .scheduler
                    .time_until_next_sync()
                    .await
                    .max(Duration::from_millis(250));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    event = events.recv() => match event {
                        Some(event) => engine.notify_change(&event).await,
                        None => break,
                    },
                }

                if engine.scheduler.should_sync().await {
                    let online = match engine.sync_now().await {
                        Ok(_) => true,
                        Err(error) => {
                            warn!(error = %error, "background sync cycle failed");
                            !error.is_transient()
                        }
                    };
                    engine.scheduler.record_sync(online).await;
                }
            }
            debug!("background sync loop stopped");
        })
    }

    pub fn workspace_id(&self) -> Uuid {
        self.config.workspace_id
    }

    pub fn database(&self) -> &Arc<LocalDatabase> {
        &self.db
    }
}
