//! Per-workspace change event fan-out.
//!
//! Each subscriber gets its own bounded channel. Publishing never waits and
//! never fails the mutation that triggered it: a full channel drops the
//! event for that subscriber (at-most-once delivery), a closed channel
//! drops the subscriber.

use crate::shared::delta::ChangeEvent;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};
use uuid::Uuid;

/// Events buffered per subscriber before drops begin
pub const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Fan-out of change events to connected workspace clients
#[derive(Debug, Clone, Default)]
pub struct ChangeBroadcaster {
    workspaces: Arc<Mutex<HashMap<Uuid, Vec<mpsc::Sender<ChangeEvent>>>>>,
}

impl ChangeBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one workspace
    pub async fn subscribe(&self, workspace_id: Uuid) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        self.workspaces
            .lock()
            .await
            .entry(workspace_id)
            .or_default()
            .push(tx);
        debug!(workspace = %workspace_id, "change subscriber registered");
        rx
    }

    /// Publish an event to every subscriber of the workspace. Non-blocking;
    /// slow subscribers lose events, disconnected subscribers are removed.
    pub async fn publish(&self, workspace_id: Uuid, event: &ChangeEvent) {
        let mut workspaces = self.workspaces.lock().await;
        let Some(subscribers) = workspaces.get_mut(&workspace_id) else {
            return;
        };

        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                // Event dropped; the subscriber's next delta pull catches up
                trace!(workspace = %workspace_id, "subscriber buffer full, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if subscribers.is_empty() {
            workspaces.remove(&workspace_id);
        }
    }

    /// Current subscriber count for a workspace
    pub async fn subscriber_count(&self, workspace_id: Uuid) -> usize {
        self.workspaces
            .lock()
            .await
            .get(&workspace_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop channels whose receiver is gone; called periodically so idle
    /// workspaces do not accumulate dead senders
    pub async fn cleanup_closed(&self) {
        let mut workspaces = self.workspaces.lock().await;
        workspaces.retain(|_, subscribers| {
            subscribers.retain(|tx| !tx.is_closed());
            !subscribers.is_empty()
        });
    }
}
