//! # Sync Scheduler
//!
//! Decides when the background loop runs a sync cycle. The cadence adapts
//! to connectivity (offline clients poll much less often) and a change
//! notification can request an immediate cycle, collapsing the usual
//! interval to "as soon as possible".

use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Interval multiplier applied while the transport looks offline
const OFFLINE_BACKOFF_FACTOR: u32 = 10;

/// Background sync cadence controller
#[derive(Debug)]
pub struct SyncScheduler {
    last_sync: RwLock<Option<Instant>>,
    base_interval: Duration,
    /// Whether the last transport attempt succeeded
    online: RwLock<bool>,
    /// Set by a change notification; consumed by the next `should_sync`
    immediate_requested: RwLock<bool>,
}

impl SyncScheduler {
    pub fn new(base_interval: Duration) -> Self {
        Self {
            last_sync: RwLock::new(None),
            base_interval,
            online: RwLock::new(true),
            immediate_requested: RwLock::new(false),
        }
    }

    /// Effective interval given current connectivity
    pub async fn current_interval(&self) -> Duration {
        if *self.online.read().await {
            self.base_interval
        } else {
            self.base_interval * OFFLINE_BACKOFF_FACTOR
        }
    }

    /// Ask for a sync cycle ahead of schedule (change event received, user
    /// pressed "sync now", connectivity restored)
    pub async fn request_immediate(&self) {
        *self.immediate_requested.write().await = true;
    }

    /// Whether a sync cycle is due now; consumes any pending immediate hint
    pub async fn should_sync(&self) -> bool {
        {
            let mut immediate = self.immediate_requested.write().await;
            if *immediate {
                *immediate = false;
                return true;
            }
        }

        let last_sync = *self.last_sync.read().await;
        match last_sync {
            Some(at) => at.elapsed() >= self.current_interval().await,
            None => true,
        }
    }

    /// Record a completed sync cycle and whether the transport was reachable
    pub async fn record_sync(&self, online: bool) {
        *self.last_sync.write().await = Some(Instant::now());
        *self.online.write().await = online;
    }

    /// Time until the next scheduled cycle (zero when one is already due)
    pub async fn time_until_next_sync(&self) -> Duration {
        if *self.immediate_requested.read().await {
            return Duration::ZERO;
        }
        let last_sync = *self.last_sync.read().await;
        let interval = self.current_interval().await;
        match last_sync {
            Some(at) => interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }
}
