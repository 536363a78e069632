use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Outbound channel: sends content to a contact.
///
/// An `Err` is a failed delivery; the engine retries with backoff.
pub trait MessageDispatcher: Send + Sync + 'static {
    /// Dispatcher name for logs (e.g., "webhook", "dry-run").
    fn name(&self) -> &str;

    fn send<'a>(
        &'a self,
        contact: &'a ContactId,
        payload: &'a OutboundPayload,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Read/append access to a contact's message history.
pub trait MessageStore: Send + Sync + 'static {
    /// Most recent inbound message with `timestamp >= since`.
    ///
    /// Returns `ContactNotFound` when the contact no longer exists.
    fn last_inbound_since(
        &self,
        contact: &ContactId,
        since: DateTime<Utc>,
    ) -> Result<Option<MessageEvent>>;

    /// Whether any inbound message has `timestamp >= since`.
    fn has_inbound_since(&self, contact: &ContactId, since: DateTime<Utc>) -> Result<bool>;

    /// Record a message in the contact's history.
    fn record_message(&self, message: &MessageEvent) -> Result<()>;
}

/// Persistence for flows, leads and cursors, addressed by id.
///
/// Lead stage writes must only come from the stage transition coordinator.
pub trait FlowStore: Send + Sync + 'static {
    fn load_sequence(&self, id: &SequenceId) -> Result<Option<Sequence>>;

    fn load_pipeline(&self, product_id: &str) -> Result<Option<Pipeline>>;

    fn load_lead(&self, id: &LeadId) -> Result<Option<Lead>>;

    fn leads_for_contact(&self, contact: &ContactId) -> Result<Vec<Lead>>;

    /// Insert or update a lead record.
    fn save_lead(&self, lead: &Lead) -> Result<()>;

    /// Insert a new cursor. Fails with `ActiveCursorExists` if the lead
    /// already has a non-terminal cursor and `cursor` is itself active.
    fn insert_cursor(&self, cursor: &Cursor) -> Result<()>;

    fn update_cursor(&self, cursor: &Cursor) -> Result<()>;

    fn load_cursor(&self, id: &CursorId) -> Result<Option<Cursor>>;

    /// The lead's single non-terminal cursor, if any.
    fn active_cursor(&self, lead: &LeadId) -> Result<Option<Cursor>>;

    /// All cursors of a lead, newest first.
    fn cursors_for_lead(&self, lead: &LeadId) -> Result<Vec<Cursor>>;

    /// Cursors currently in the given state.
    fn cursors_in_state(&self, state: CursorState) -> Result<Vec<Cursor>>;

    /// Waiting cursors whose wall-clock due time is at or before `now`,
    /// earliest first.
    fn due_cursors(&self, now: DateTime<Utc>) -> Result<Vec<Cursor>>;

    /// Waiting cursors of `lead` that listen for inbound messages.
    fn listening_cursors(&self, lead: &LeadId) -> Result<Vec<Cursor>>;

    fn append_log(&self, entry: &CursorLogEntry) -> Result<()>;

    fn load_log(&self, cursor: &CursorId) -> Result<Vec<CursorLogEntry>>;
}
