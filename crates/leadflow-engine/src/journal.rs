use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use leadflow_core::event::EventBus;
use leadflow_core::traits::FlowStore;
use leadflow_core::types::{Cursor, CursorLogEntry, EngineEvent};

/// Appends cursor activity to the store's log and publishes it on the bus.
#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn FlowStore>,
    events: Arc<EventBus>,
}

impl Journal {
    pub fn new(store: Arc<dyn FlowStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    /// Record one transition. Log write failures are reported, not propagated.
    pub fn record(
        &self,
        cursor: &Cursor,
        kind: &str,
        detail: impl Into<String>,
        at: DateTime<Utc>,
        event: EngineEvent,
    ) {
        let entry = CursorLogEntry::new(cursor, kind, detail, at);
        if let Err(e) = self.store.append_log(&entry) {
            warn!(cursor_id = %cursor.id, kind, error = %e, "Failed to append cursor log");
        }
        self.events.publish(event);
    }

    pub fn publish(&self, event: EngineEvent) {
        self.events.publish(event);
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}
