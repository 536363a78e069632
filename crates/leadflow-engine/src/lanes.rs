use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use leadflow_core::types::LeadId;

/// Per-lead single-writer locks.
///
/// Every advancement of a lead's cursors runs while holding its lane, so an
/// inbound message, a timer and a manual action on the same lead never
/// interleave. Different leads proceed in parallel.
#[derive(Default)]
pub struct LeadLocks {
    lanes: Mutex<HashMap<LeadId, Arc<AsyncMutex<()>>>>,
}

impl LeadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `lead`.
    pub async fn lock(&self, lead: &LeadId) -> OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            // Drop lanes nobody holds or waits on
            lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
            lanes.entry(lead.clone()).or_default().clone()
        };
        lane.lock_owned().await
    }

    /// Number of lanes currently tracked.
    pub fn len(&self) -> usize {
        self.lanes.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
