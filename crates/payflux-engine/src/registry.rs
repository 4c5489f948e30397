use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Tracks which flows have a live run loop and hands out the per-flow
/// lock that serializes all state mutation for a flow. The run loop
/// and the control plane take the same lock, so a flow's record is
/// never written from two places at once.
pub struct RuntimeRegistry {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    active: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// The serialization lock for a flow, created on first use.
    pub fn lock_for(&self, flow_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(flow_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Claim the run loop for a flow. Returns false if a loop already
    /// owns it, in which case the caller must not start another.
    pub fn activate(&self, flow_id: &str) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.insert(flow_id.to_string())
    }

    /// Release the run loop claim when a loop exits.
    pub fn release(&self, flow_id: &str) {
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.remove(flow_id);
        }
        // Prune the lock entry once nobody else holds a clone.
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(flow_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(flow_id);
            }
        }
    }

    pub fn is_active(&self, flow_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.contains(flow_id)
    }

    pub fn active_count(&self) -> usize {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.len()
    }

    /// Token observed by run loops at step boundaries.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal all run loops to stop at their next step boundary.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait until every run loop has released its claim.
    pub async fn drain(&self) {
        while self.active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
