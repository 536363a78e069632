use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use leadflow_core::error::Result;
use leadflow_core::traits::FlowStore;
use leadflow_core::types::{Cursor, CursorId, CursorState, LeadId};

/// A timer registered for a waiting cursor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DueEntry {
    pub due_at: DateTime<Utc>,
    pub cursor_id: CursorId,
}

/// Wake sources for waiting cursors: "wake at T" and "wake on a message for
/// lead L".
///
/// Both are answered from persisted cursors, so a cursor put to sleep by any
/// engine instance sharing the store is found. The in-process heap only
/// remembers timers this instance has seen, to size the runner's sleep; its
/// entries may be stale and never decide a wake.
pub struct Scheduler {
    store: Arc<dyn FlowStore>,
    timers: Mutex<BinaryHeap<Reverse<DueEntry>>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self {
            store,
            timers: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Remember the due time of a waiting cursor. Anything else is ignored.
    pub fn schedule(&self, cursor: &Cursor) {
        if cursor.state != CursorState::WaitingForEvent {
            return;
        }
        if let Some(due_at) = cursor.due_at() {
            self.timers().push(Reverse(DueEntry {
                due_at,
                cursor_id: cursor.id.clone(),
            }));
        }
    }

    /// Waiting cursors due at or before `now`, earliest first. Cached timers
    /// up to `now` are dropped.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<Cursor>> {
        {
            let mut timers = self.timers();
            while timers.peek().is_some_and(|Reverse(e)| e.due_at <= now) {
                timers.pop();
            }
        }
        self.store.due_cursors(now)
    }

    /// Cursors of `lead` subscribed to inbound messages.
    pub fn interested(&self, lead: &LeadId) -> Result<Vec<Cursor>> {
        self.store.listening_cursors(lead)
    }

    /// Earliest cached due time (may belong to a stale entry).
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.timers().peek().map(|Reverse(e)| e.due_at)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers().len()
    }

    pub fn clear(&self) {
        self.timers().clear();
    }

    fn timers(&self) -> MutexGuard<'_, BinaryHeap<Reverse<DueEntry>>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
