//! # Queue Drainer
//!
//! Replays the durable mutation queue against the server. Each drain cycle
//! snapshots the unsettled queue, asks the resolver for a plan, persists the
//! derived blocked states, then replays the independent chains concurrently
//! while keeping each chain strictly sequential.
//!
//! A create acknowledgement triggers reconciliation before the chain moves
//! on: the temp id is mapped to the server-assigned id, every queue entry,
//! overlay entry and payload reference is rewritten, and only then is the
//! next mutation in the chain considered. No mutation is ever submitted
//! while it still carries a temp id the server has not assigned.

use crate::client::cache::OptimisticCache;
use crate::client::local_db::LocalDatabase;
use crate::client::queue::MutationQueue;
use crate::client::reconciliation::ReconciliationMap;
use crate::client::resolver;
use crate::client::retry::RetryPolicy;
use crate::client::transport::SyncTransport;
use crate::shared::entity::is_temp_id;
use crate::shared::mutation::{
    BlockReason, FailureReason, MutationOperation, MutationStatus, QueuedMutation,
    SubmitMutationRequest,
};
use crate::shared::{now_rfc3339, SyncError};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the drainer is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainerState {
    Idle,
    Draining,
    /// Mutations remain but all are behind backoff gates
    WaitingRetry,
}

/// Outcome of one drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Acknowledged and removed from the queue
    pub sent: usize,
    /// Newly marked failed
    pub failed: usize,
    /// Newly marked blocked (failed or cyclic dependency)
    pub blocked: usize,
    /// Left pending behind a backoff gate or unresolved reference
    pub deferred: usize,
    /// True when another drain cycle was already running
    pub skipped: bool,
}

/// What happened to one chain in one pass
#[derive(Debug, Default)]
struct ChainOutcome {
    sent: usize,
    failed: usize,
    deferred: usize,
}

/// Replays the mutation queue in dependency order
pub struct SyncDrainer {
    queue: Arc<MutationQueue>,
    db: Arc<LocalDatabase>,
    cache: Arc<OptimisticCache>,
    recon: Arc<ReconciliationMap>,
    transport: Arc<dyn SyncTransport>,
    policy: RetryPolicy,
    workspace_id: Uuid,
    state: RwLock<DrainerState>,
    /// Held for the duration of a drain cycle; `try_lock` failure means a
    /// cycle is already running
    drain_guard: Mutex<()>,
}

impl SyncDrainer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<MutationQueue>,
        db: Arc<LocalDatabase>,
        cache: Arc<OptimisticCache>,
        recon: Arc<ReconciliationMap>,
        transport: Arc<dyn SyncTransport>,
        policy: RetryPolicy,
        workspace_id: Uuid,
    ) -> Self {
        Self {
            queue,
            db,
            cache,
            recon,
            transport,
            policy,
            workspace_id,
            state: RwLock::new(DrainerState::Idle),
            drain_guard: Mutex::new(()),
        }
    }

    pub async fn state(&self) -> DrainerState {
        *self.state.read().await
    }

    /// Run one drain cycle. Passes repeat until a pass makes no progress,
    /// so a create acknowledged early in the cycle can unlock chains that
    /// were waiting on its temp id.
    pub async fn drain(&self) -> Result<DrainSummary, SyncError> {
        let Ok(_guard) = self.drain_guard.try_lock() else {
            return Ok(DrainSummary {
                skipped: true,
                ..DrainSummary::default()
            });
        };
        *self.state.write().await = DrainerState::Draining;

        let result = self.drain_locked().await;

        // The state settles even when the cycle aborts on a local fault
        *self.state.write().await = match &result {
            Ok(summary) if summary.deferred > 0 => DrainerState::WaitingRetry,
            _ => DrainerState::Idle,
        };
        if let Ok(summary) = &result {
            if summary.sent + summary.failed + summary.blocked > 0 {
                info!(
                    sent = summary.sent,
                    failed = summary.failed,
                    blocked = summary.blocked,
                    deferred = summary.deferred,
                    "drain cycle finished"
                );
            }
        }
        result
    }

    async fn drain_locked(&self) -> Result<DrainSummary, SyncError> {
        // Entries stranded in `sending` by a crash are safe to resend; the
        // mutation id doubles as the server-side idempotency key
        self.queue.recover_in_flight().await?;

        let mut summary = DrainSummary::default();
        loop {
            let snapshot = self.queue.list_unsettled().await?;
            if snapshot.is_empty() {
                break;
            }
            let plan = resolver::resolve(&snapshot);
            let status_by_id: HashMap<Uuid, MutationStatus> =
                snapshot.iter().map(|m| (m.id, m.status)).collect();

            // Persist derived states before sending anything
            for id in &plan.blocked {
                if status_by_id.get(id) != Some(&MutationStatus::Blocked) {
                    summary.blocked += 1;
                }
                self.queue.set_blocked(*id, BlockReason::FailedDependency).await?;
            }
            for id in &plan.cyclic {
                if status_by_id.get(id) != Some(&MutationStatus::Blocked) {
                    summary.blocked += 1;
                    warn!(mutation = %id, "dependency cycle detected in mutation queue");
                }
                self.queue.set_blocked(*id, BlockReason::CyclicDependency).await?;
            }
            // Previously blocked entries whose blocker is gone become
            // pending again
            for id in &plan.order {
                if status_by_id.get(id) == Some(&MutationStatus::Blocked) {
                    self.queue.reactivate(*id).await?;
                }
            }

            if plan.chains.is_empty() {
                break;
            }

            debug!(
                chains = plan.chains.len(),
                sendable = plan.order.len(),
                "replaying mutation chains"
            );
            let outcomes = join_all(
                plan.chains
                    .iter()
                    .map(|chain| self.replay_chain(chain)),
            )
            .await;

            let mut pass_sent = 0;
            let mut pass_failed = 0;
            for outcome in outcomes {
                let outcome = outcome?;
                pass_sent += outcome.sent;
                pass_failed += outcome.failed;
                summary.sent += outcome.sent;
                summary.failed += outcome.failed;
                summary.deferred += outcome.deferred;
            }
            // A pass with failures still warrants another resolve so the
            // dependents of what just failed get their blocked state
            // persisted within this cycle
            if pass_sent == 0 && pass_failed == 0 {
                break;
            }
        }

        Ok(summary)
    }

    /// Replay one chain in order, stopping at the first mutation that
    /// cannot be sent; anything after it in the chain waits for the next
    /// cycle
    async fn replay_chain(&self, chain: &[Uuid]) -> Result<ChainOutcome, SyncError> {
        let mut outcome = ChainOutcome::default();
        let now = now_rfc3339();

        for &id in chain {
            // Refetch: an earlier acknowledgement in this chain may have
            // rewritten this entry's temp references
            let Some(mut mutation) = self.queue.get(id).await? else {
                continue;
            };
            if mutation.status != MutationStatus::Pending {
                continue;
            }
            // An entry enqueued after its reference was reconciled missed
            // the acknowledgement-time rewrite; apply the map now, before
            // readiness is judged
            if mutation.has_unresolved_temp_ids()
                && self.rewrite_reconciled_references(&mutation).await?
            {
                match self.queue.get(id).await? {
                    Some(fresh) => mutation = fresh,
                    None => continue,
                }
            }
            if !mutation.is_ready_at(&now) {
                outcome.deferred += 1;
                break;
            }
            if mutation.has_unresolved_temp_ids() {
                // A temp id with no producer left in the queue; it can only
                // resolve through a future rewrite, never by sending
                warn!(
                    mutation = %mutation.id,
                    entity = %mutation.entity_id,
                    "deferring mutation with unresolvable temp reference"
                );
                outcome.deferred += 1;
                break;
            }

            self.queue.mark_sending(id).await?;
            match self.submit_one(&mutation).await {
                Ok(()) => outcome.sent += 1,
                Err(error) => {
                    self.handle_failure(&mutation, &error, &mut outcome).await?;
                    break;
                }
            }
        }
        Ok(outcome)
    }

    /// Rewrite any temp id in this mutation that the reconciliation map
    /// already resolves, durably across the queue and the cache. Returns
    /// whether anything changed.
    async fn rewrite_reconciled_references(
        &self,
        mutation: &QueuedMutation,
    ) -> Result<bool, SyncError> {
        let mut temps = Vec::new();
        if mutation.operation != MutationOperation::Create && is_temp_id(&mutation.entity_id) {
            temps.push(mutation.entity_id.clone());
        }
        if let Some(payload) = &mutation.payload {
            temps.extend(payload.temp_references());
        }

        let mut rewritten = false;
        for temp in temps {
            if let Some(real) = self.recon.resolve(&temp) {
                self.queue.rewrite_temp_id(&temp, &real).await?;
                self.cache.rewrite_temp_id(&temp, &real);
                rewritten = true;
            }
        }
        Ok(rewritten)
    }

    async fn submit_one(&self, mutation: &QueuedMutation) -> Result<(), SyncError> {
        let request = SubmitMutationRequest {
            mutation_id: mutation.id,
            workspace_id: self.workspace_id,
            operation: mutation.operation,
            entity_type: mutation.entity_type,
            entity_id: mutation.entity_id.clone(),
            payload: mutation.payload.clone(),
            base_updated_at: mutation.base_updated_at.clone(),
        };

        let response = self.transport.submit(&request).await?;

        if let Some(temp_id) = mutation.produced_temp_id() {
            // Reconcile before anything else in the chain is considered
            self.recon.insert(temp_id, &response.entity_id);
            self.queue.rewrite_temp_id(temp_id, &response.entity_id).await?;
            self.cache.rewrite_temp_id(temp_id, &response.entity_id);
            debug!(temp = %temp_id, real = %response.entity_id, "temp id reconciled");
        }

        match mutation.operation {
            MutationOperation::Delete => {
                self.cache
                    .confirm_delete(mutation.entity_type, &response.entity_id);
                self.db
                    .remove_entity_by_id(mutation.entity_type, &response.entity_id)
                    .await?;
            }
            MutationOperation::Create | MutationOperation::Update => {
                if let Some(entity) = response.entity {
                    self.db.upsert_entity(&entity).await?;
                    self.cache.confirm(entity);
                }
            }
        }

        self.queue.mark_done_and_remove(mutation.id).await?;
        Ok(())
    }

    async fn handle_failure(
        &self,
        mutation: &QueuedMutation,
        error: &SyncError,
        outcome: &mut ChainOutcome,
    ) -> Result<(), SyncError> {
        match error {
            SyncError::Transient { .. } => {
                let attempts = mutation.retry_count + 1;
                if self.policy.should_retry(attempts) {
                    let gate = self.policy.next_attempt_at(attempts);
                    self.queue
                        .defer(mutation.id, attempts, &gate, &error.to_string())
                        .await?;
                    outcome.deferred += 1;
                    debug!(
                        mutation = %mutation.id,
                        attempts,
                        next_attempt = %gate,
                        "transient failure, retry scheduled"
                    );
                } else {
                    self.queue
                        .set_failed(mutation.id, FailureReason::Transient, &error.to_string())
                        .await?;
                    outcome.failed += 1;
                    warn!(mutation = %mutation.id, "retry budget exhausted");
                }
            }
            SyncError::Conflict { .. } => {
                // Never auto-retried; the user decides
                self.queue
                    .set_failed(mutation.id, FailureReason::Conflict, &error.to_string())
                    .await?;
                outcome.failed += 1;
                warn!(mutation = %mutation.id, error = %error, "conflict rejected by server");
            }
            SyncError::Validation { .. } => {
                self.queue
                    .set_failed(mutation.id, FailureReason::Validation, &error.to_string())
                    .await?;
                outcome.failed += 1;
                warn!(mutation = %mutation.id, error = %error, "mutation rejected as invalid");
            }
            // Local faults abort the cycle; the queue is untouched beyond
            // the sending mark, which the next cycle resets
            SyncError::Storage(_) | SyncError::Serialization(_) => {
                self.queue
                    .defer(mutation.id, mutation.retry_count, &now_rfc3339(), &error.to_string())
                    .await?;
                return Err(SyncError::transient(error.to_string()));
            }
        }
        Ok(())
    }
}
