use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use leadflow_core::config::{AppConfig, EngineConfig};
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::event::EventBus;
use leadflow_core::traits::{FlowStore, MessageDispatcher, MessageStore};
use leadflow_core::types::*;

use crate::coordinator::{StageTransitionCoordinator, Transition};
use crate::cursor::{self, InboundDecision};
use crate::dispatch::RetryingDispatcher;
use crate::executor::{DriveOutcome, StepExecutor};
use crate::journal::Journal;
use crate::lanes::LeadLocks;
use crate::scheduler::Scheduler;

/// Counts from a `recover` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Waiting cursors whose timers and subscriptions were re-registered.
    pub rescheduled: usize,
    /// Cursors found `Running` and driven again from their current step.
    pub redriven: usize,
}

/// The flow execution engine.
///
/// All operations take an explicit `now`, so callers control the clock.
/// Work on one lead is serialized through its lane; different leads are
/// independent.
pub struct FlowEngine {
    store: Arc<dyn FlowStore>,
    messages: Arc<dyn MessageStore>,
    executor: StepExecutor,
    coordinator: StageTransitionCoordinator,
    scheduler: Scheduler,
    locks: LeadLocks,
    journal: Journal,
    config: EngineConfig,
}

impl FlowEngine {
    pub fn new(
        store: Arc<dyn FlowStore>,
        messages: Arc<dyn MessageStore>,
        dispatcher: Arc<dyn MessageDispatcher>,
        event_bus: Arc<EventBus>,
        config: &AppConfig,
    ) -> Self {
        let journal = Journal::new(store.clone(), event_bus);
        let executor = StepExecutor::new(
            store.clone(),
            messages.clone(),
            RetryingDispatcher::new(dispatcher, config.dispatch.clone()),
            journal.clone(),
            config.engine.max_steps_per_run,
        );
        let coordinator =
            StageTransitionCoordinator::new(store.clone(), journal.clone(), config.engine.reentry);
        let scheduler = Scheduler::new(store.clone());

        Self {
            store,
            messages,
            executor,
            coordinator,
            scheduler,
            locks: LeadLocks::new(),
            journal,
            config: config.engine.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.journal.events().subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Exposed operations
    // -----------------------------------------------------------------------

    /// Start `sequence_id` for a lead, stopping any cursor it already has.
    pub async fn assign_sequence(
        &self,
        lead_id: &LeadId,
        sequence_id: &SequenceId,
        now: DateTime<Utc>,
    ) -> Result<CursorStatus> {
        let _lane = self.locks.lock(lead_id).await;
        let transition = self.coordinator.assign(lead_id, sequence_id, now)?;
        let settled = self.apply(transition, now).await?;
        settled
            .map(|c| c.status())
            .ok_or_else(|| LeadflowError::CursorNotFound(format!("lead {}", lead_id)))
    }

    /// Move a lead to a stage. Returns the status of the cursor started by
    /// the move, after it ran to its first wait or end.
    pub async fn move_lead_to_stage(
        &self,
        lead_id: &LeadId,
        stage_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CursorStatus>> {
        let _lane = self.locks.lock(lead_id).await;
        let transition = self.coordinator.move_lead(
            lead_id,
            stage_name,
            &format!("moved to stage {}", stage_name),
            now,
        )?;
        Ok(self.apply(transition, now).await?.map(|c| c.status()))
    }

    /// Enter a new lead into its pipeline's protected entry stage.
    pub async fn enroll_lead(&self, lead: &Lead, now: DateTime<Utc>) -> Result<Option<CursorStatus>> {
        let _lane = self.locks.lock(&lead.id).await;
        let transition = self.coordinator.enroll(lead, now)?;
        Ok(self.apply(transition, now).await?.map(|c| c.status()))
    }

    /// Suspend a running or waiting cursor until `resume`.
    pub async fn pause(&self, cursor_id: &CursorId, now: DateTime<Utc>) -> Result<CursorStatus> {
        let lead_id = self.lead_of(cursor_id)?;
        let _lane = self.locks.lock(&lead_id).await;
        let mut cursor = self.load_cursor(cursor_id)?;

        cursor::transition(&mut cursor, CursorState::Paused, now)?;
        self.store.update_cursor(&cursor)?;
        self.journal.record(
            &cursor,
            "paused",
            "",
            now,
            EngineEvent::CursorPaused {
                cursor_id: cursor.id.clone(),
            },
        );
        info!(cursor_id = %cursor.id, position = cursor.position, "Cursor paused");
        Ok(cursor.status())
    }

    /// Re-enter `Running` at the same position and execute from there.
    pub async fn resume(&self, cursor_id: &CursorId, now: DateTime<Utc>) -> Result<CursorStatus> {
        let lead_id = self.lead_of(cursor_id)?;
        let _lane = self.locks.lock(&lead_id).await;
        let mut cursor = self.load_cursor(cursor_id)?;

        if cursor.state != CursorState::Paused {
            return Err(LeadflowError::InvalidTransition {
                from: cursor.state.to_string(),
                to: CursorState::Running.to_string(),
            });
        }
        cursor::transition(&mut cursor, CursorState::Running, now)?;
        self.store.update_cursor(&cursor)?;
        self.journal.record(
            &cursor,
            "resumed",
            "",
            now,
            EngineEvent::CursorResumed {
                cursor_id: cursor.id.clone(),
            },
        );
        info!(cursor_id = %cursor.id, position = cursor.position, "Cursor resumed");

        let cursor = self.settle(cursor, now).await?;
        Ok(cursor.status())
    }

    /// Terminate a cursor. Irreversible.
    pub async fn stop(&self, cursor_id: &CursorId, now: DateTime<Utc>) -> Result<CursorStatus> {
        let lead_id = self.lead_of(cursor_id)?;
        let _lane = self.locks.lock(&lead_id).await;
        let mut cursor = self.load_cursor(cursor_id)?;

        cursor::stop(&mut cursor, "stopped manually", now)?;
        self.store.update_cursor(&cursor)?;
        self.journal.record(
            &cursor,
            "stopped",
            "stopped manually",
            now,
            EngineEvent::CursorStopped {
                cursor_id: cursor.id.clone(),
                reason: "stopped manually".into(),
            },
        );
        info!(cursor_id = %cursor.id, "Cursor stopped");
        Ok(cursor.status())
    }

    /// Record an inbound message and notify cursors listening on its contact's
    /// leads. Returns how many cursors woke up.
    pub async fn handle_inbound(&self, message: &MessageEvent) -> Result<usize> {
        self.messages.record_message(message)?;
        if message.direction != Direction::Inbound {
            return Ok(0);
        }

        let leads = self.store.leads_for_contact(&message.contact_id)?;
        let mut woken = 0;
        for lead in leads {
            let _lane = self.locks.lock(&lead.id).await;
            for cursor in self.scheduler.interested(&lead.id)? {
                match self.notify(&cursor.id, message).await {
                    Ok(true) => woken += 1,
                    Ok(false) => {}
                    Err(e) => error!(
                        cursor_id = %cursor.id,
                        lead_id = %lead.id,
                        error = %e,
                        "Failed to process inbound message"
                    ),
                }
            }
        }
        debug!(contact_id = %message.contact_id, woken, "Inbound message processed");
        Ok(woken)
    }

    /// Wake every waiting cursor whose timer fired at or before `now`,
    /// whichever engine instance put it to sleep.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.scheduler.due(now)?;
        let mut woken = 0;
        for cursor in due {
            let _lane = self.locks.lock(&cursor.lead_id).await;
            match self.fire(&cursor.id, now).await {
                Ok(true) => woken += 1,
                Ok(false) => {}
                Err(e) => error!(
                    cursor_id = %cursor.id,
                    lead_id = %cursor.lead_id,
                    error = %e,
                    "Failed to wake cursor"
                ),
            }
        }
        Ok(woken)
    }

    /// Re-seed the timer cache from the store and re-drive cursors a crash
    /// left in `Running`.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let waiting = self.store.cursors_in_state(CursorState::WaitingForEvent)?;
        self.scheduler.clear();
        for cursor in &waiting {
            self.scheduler.schedule(cursor);
        }

        let running = self.store.cursors_in_state(CursorState::Running)?;
        let mut redriven = 0;
        for cursor in running {
            let _lane = self.locks.lock(&cursor.lead_id).await;
            // Re-read under the lane
            let Some(cursor) = self.store.load_cursor(&cursor.id)? else {
                continue;
            };
            if cursor.state != CursorState::Running {
                continue;
            }
            let cursor_id = cursor.id.clone();
            match self.settle(cursor, now).await {
                Ok(_) => redriven += 1,
                Err(e) => error!(cursor_id = %cursor_id, error = %e, "Failed to re-drive cursor"),
            }
        }

        let report = RecoveryReport {
            rescheduled: waiting.len(),
            redriven,
        };
        info!(rescheduled = report.rescheduled, redriven = report.redriven, "Engine recovered");
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Read model
    // -----------------------------------------------------------------------

    pub fn status(&self, cursor_id: &CursorId) -> Result<CursorStatus> {
        Ok(self.load_cursor(cursor_id)?.status())
    }

    /// All cursors of a lead, newest first.
    pub fn lead_cursors(&self, lead_id: &LeadId) -> Result<Vec<CursorStatus>> {
        Ok(self
            .store
            .cursors_for_lead(lead_id)?
            .iter()
            .map(Cursor::status)
            .collect())
    }

    pub fn active_cursor(&self, lead_id: &LeadId) -> Result<Option<CursorStatus>> {
        Ok(self.store.active_cursor(lead_id)?.map(|c| c.status()))
    }

    pub fn log(&self, cursor_id: &CursorId) -> Result<Vec<CursorLogEntry>> {
        self.store.load_log(cursor_id)
    }

    /// Earliest pending timer, if any.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.scheduler.next_due()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn load_cursor(&self, cursor_id: &CursorId) -> Result<Cursor> {
        self.store
            .load_cursor(cursor_id)?
            .ok_or_else(|| LeadflowError::CursorNotFound(cursor_id.to_string()))
    }

    fn lead_of(&self, cursor_id: &CursorId) -> Result<LeadId> {
        Ok(self.load_cursor(cursor_id)?.lead_id)
    }

    fn load_sequence(&self, sequence_id: &SequenceId) -> Result<Sequence> {
        self.store
            .load_sequence(sequence_id)?
            .ok_or_else(|| LeadflowError::SequenceNotFound(sequence_id.to_string()))
    }

    /// Unschedule a stopped cursor and run a started one.
    async fn apply(&self, transition: Transition, now: DateTime<Utc>) -> Result<Option<Cursor>> {
        match transition.started {
            Some(started) => self.settle(started, now).await.map(Some),
            None => Ok(None),
        }
    }

    /// Drive a `Running` cursor until it waits or ends, following stage
    /// handoffs. Returns the last cursor touched.
    async fn settle(&self, mut cursor: Cursor, now: DateTime<Utc>) -> Result<Cursor> {
        let mut handoffs = 0usize;

        loop {
            let sequence = match self.load_sequence(&cursor.sequence_id) {
                Ok(sequence) => sequence,
                Err(e) => {
                    self.executor.fail(&mut cursor, e.to_string(), now)?;
                    return Ok(cursor);
                }
            };

            match self.executor.drive(&mut cursor, &sequence, now).await? {
                DriveOutcome::Waiting => {
                    self.scheduler.schedule(&cursor);
                    return Ok(cursor);
                }
                DriveOutcome::Finished => return Ok(cursor),
                DriveOutcome::HandOff { target_stage } => {
                    handoffs += 1;
                    if handoffs > self.config.max_handoffs {
                        self.executor.fail(&mut cursor, "handoff limit exceeded", now)?;
                        return Ok(cursor);
                    }

                    let reason = format!("stage_change to {}", target_stage);
                    let transition =
                        match self
                            .coordinator
                            .move_lead(&cursor.lead_id, &target_stage, &reason, now)
                        {
                            Ok(t) => t,
                            Err(e) => {
                                warn!(cursor_id = %cursor.id, stage = %target_stage, error = %e, "Handoff failed");
                                self.executor.fail(&mut cursor, e.to_string(), now)?;
                                return Ok(cursor);
                            }
                        };

                    if !transition.changed {
                        // Re-entry ignored: the step is a no-op
                        if !self.executor.advance(&mut cursor, &sequence, now)? {
                            return Ok(cursor);
                        }
                        continue;
                    }

                    match transition.started {
                        Some(started) => cursor = started,
                        None => {
                            return Ok(transition.stopped.unwrap_or(cursor));
                        }
                    }
                }
            }
        }
    }

    /// React to an inbound message for one interested cursor.
    async fn notify(&self, cursor_id: &CursorId, message: &MessageEvent) -> Result<bool> {
        let Some(mut cursor) = self.store.load_cursor(cursor_id)? else {
            debug!(cursor_id = %cursor_id, "Stale subscription: cursor gone");
            return Ok(false);
        };
        let Some(wait) = cursor
            .wait
            .clone()
            .filter(|_| cursor.state == CursorState::WaitingForEvent)
        else {
            debug!(cursor_id = %cursor.id, state = %cursor.state, "Stale subscription, ignoring");
            return Ok(false);
        };

        let Some(sequence) = self.pause_sequence(&mut cursor, message.timestamp)? else {
            return Ok(false);
        };
        let Some(StepKind::Pause(pause)) = sequence.step(cursor.position).map(|s| &s.kind) else {
            return Ok(false);
        };

        match cursor::on_inbound(pause, &wait, message) {
            InboundDecision::Ignore => Ok(false),
            InboundDecision::Reschedule(next) => {
                let due_at = next.due_at;
                cursor.wait = Some(next);
                cursor.updated_at = message.timestamp;
                self.store.update_cursor(&cursor)?;
                self.scheduler.schedule(&cursor);
                self.journal.record(
                    &cursor,
                    "rescheduled",
                    due_at.map(|d| format!("due {}", d.to_rfc3339())).unwrap_or_default(),
                    message.timestamp,
                    EngineEvent::CursorWaiting {
                        cursor_id: cursor.id.clone(),
                        due_at,
                    },
                );
                debug!(cursor_id = %cursor.id, due_at = ?due_at, "Wait rescheduled by inbound message");
                Ok(false)
            }
            InboundDecision::Wake => {
                self.wake(cursor, &sequence, "inbound message", message.timestamp)
                    .await?;
                Ok(true)
            }
        }
    }

    /// Fire a due timer if the cursor, re-read under its lane, is still due.
    async fn fire(&self, cursor_id: &CursorId, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut cursor) = self.store.load_cursor(cursor_id)? else {
            debug!(cursor_id = %cursor_id, "Stale timer: cursor gone");
            return Ok(false);
        };
        if !cursor::is_due(&cursor, now) {
            debug!(
                cursor_id = %cursor.id,
                state = %cursor.state,
                "Stale timer, ignoring"
            );
            return Ok(false);
        }

        let Some(sequence) = self.pause_sequence(&mut cursor, now)? else {
            return Ok(false);
        };
        self.wake(cursor, &sequence, "timer", now).await?;
        Ok(true)
    }

    /// Load the sequence of a waiting cursor and check it still sits on a
    /// pause step. A missing sequence or a position that is no longer a pause
    /// stops the cursor with a failure record and yields `None`.
    fn pause_sequence(&self, cursor: &mut Cursor, now: DateTime<Utc>) -> Result<Option<Sequence>> {
        let sequence = match self.load_sequence(&cursor.sequence_id) {
            Ok(sequence) => sequence,
            Err(e @ LeadflowError::SequenceNotFound(_)) => {
                warn!(cursor_id = %cursor.id, error = %e, "Waiting cursor lost its sequence");
                self.executor.fail(cursor, e.to_string(), now)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match sequence.step(cursor.position).map(|s| &s.kind) {
            Some(StepKind::Pause(_)) => Ok(Some(sequence)),
            _ => {
                let reason = format!("position {} is not a pause step", cursor.position);
                warn!(cursor_id = %cursor.id, reason = %reason, "Waiting cursor cannot resume");
                self.executor.fail(cursor, reason, now)?;
                Ok(None)
            }
        }
    }

    /// End a wait: back to `Running`, past the pause step, then settle.
    async fn wake(
        &self,
        mut cursor: Cursor,
        sequence: &Sequence,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Cursor> {
        cursor::transition(&mut cursor, CursorState::Running, now)?;
        self.journal.record(
            &cursor,
            "woken",
            reason,
            now,
            EngineEvent::CursorWoken {
                cursor_id: cursor.id.clone(),
                reason: reason.to_string(),
            },
        );
        info!(cursor_id = %cursor.id, reason, "Cursor woken");

        if !self.executor.advance(&mut cursor, sequence, now)? {
            return Ok(cursor);
        }
        self.settle(cursor, now).await
    }
}
