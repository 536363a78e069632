use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::{FlowStore, MessageStore};
use leadflow_core::types::*;

use crate::condition::ConditionEvaluator;
use crate::cursor;
use crate::dispatch::RetryingDispatcher;
use crate::graph::{Next, StepGraph};
use crate::journal::Journal;

/// How a run of a cursor ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Suspended in `WaitingForEvent` on a pause step.
    Waiting,
    /// Reached `Completed`, or `Stopped` on a failure.
    Finished,
    /// A stage_change step asks for the lead to move. The cursor is still
    /// `Running` at that step.
    HandOff { target_stage: String },
}

/// Executes steps for a `Running` cursor until it waits, ends, or hands off.
pub struct StepExecutor {
    store: Arc<dyn FlowStore>,
    messages: Arc<dyn MessageStore>,
    dispatcher: RetryingDispatcher,
    journal: Journal,
    max_steps_per_run: usize,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn FlowStore>,
        messages: Arc<dyn MessageStore>,
        dispatcher: RetryingDispatcher,
        journal: Journal,
        max_steps_per_run: usize,
    ) -> Self {
        Self {
            store,
            messages,
            dispatcher,
            journal,
            max_steps_per_run: max_steps_per_run.max(1),
        }
    }

    /// Run `cursor` through `sequence` starting at its current position.
    ///
    /// Every step boundary is persisted, so a crash resumes at the step that
    /// was executing.
    pub async fn drive(
        &self,
        cursor: &mut Cursor,
        sequence: &Sequence,
        now: DateTime<Utc>,
    ) -> Result<DriveOutcome> {
        if cursor.state != CursorState::Running {
            return Err(LeadflowError::InvalidTransition {
                from: cursor.state.to_string(),
                to: CursorState::Running.to_string(),
            });
        }

        let graph = StepGraph::new(sequence);
        let mut executed = 0usize;

        loop {
            if executed >= self.max_steps_per_run {
                warn!(
                    cursor_id = %cursor.id,
                    position = cursor.position,
                    max_steps = self.max_steps_per_run,
                    "Step budget exhausted, stopping cursor"
                );
                self.fail(cursor, "step budget exhausted", now)?;
                return Ok(DriveOutcome::Finished);
            }

            let Some(step) = graph.step(cursor.position) else {
                self.fail(
                    cursor,
                    format!("position {} has no step", cursor.position),
                    now,
                )?;
                return Ok(DriveOutcome::Finished);
            };
            executed += 1;

            debug!(
                cursor_id = %cursor.id,
                position = cursor.position,
                step_id = %step.id,
                step_type = step.kind.type_name(),
                "Executing step"
            );

            let next = match &step.kind {
                StepKind::Message { content, media } => {
                    let payload = OutboundPayload {
                        content: content.clone(),
                        media: media.clone(),
                    };
                    if let Err(e) = self.dispatcher.send(&cursor.contact_id, &payload).await {
                        self.fail(cursor, e.to_string(), now)?;
                        return Ok(DriveOutcome::Finished);
                    }
                    let outbound = MessageEvent::outbound(cursor.contact_id.clone(), content, now);
                    if let Err(e) = self.messages.record_message(&outbound) {
                        warn!(cursor_id = %cursor.id, error = %e, "Failed to record outbound message");
                    }
                    self.step_done(cursor, step, "sent", now);
                    graph.successor(cursor.position)
                }
                StepKind::Pause(pause) => {
                    cursor::transition(cursor, CursorState::WaitingForEvent, now)?;
                    let wait = cursor::wait_for(pause, now);
                    let due_at = wait.due_at;
                    cursor.wait = Some(wait);
                    self.store.update_cursor(cursor)?;

                    self.step_done(cursor, step, "pause started", now);
                    self.journal.record(
                        cursor,
                        "waiting",
                        due_at.map(|d| format!("due {}", d.to_rfc3339())).unwrap_or_default(),
                        now,
                        EngineEvent::CursorWaiting {
                            cursor_id: cursor.id.clone(),
                            due_at,
                        },
                    );
                    info!(cursor_id = %cursor.id, position = cursor.position, due_at = ?due_at, "Cursor waiting");
                    return Ok(DriveOutcome::Waiting);
                }
                StepKind::Condition(condition) => {
                    let outcome =
                        ConditionEvaluator::new(self.messages.as_ref()).evaluate(cursor, condition);
                    match graph.branch(condition, outcome) {
                        Ok(next) => {
                            self.step_done(cursor, step, format!("outcome {}", outcome), now);
                            next
                        }
                        Err(e) => {
                            warn!(cursor_id = %cursor.id, error = %e, "Condition branch unresolvable");
                            self.fail(cursor, e.to_string(), now)?;
                            return Ok(DriveOutcome::Finished);
                        }
                    }
                }
                StepKind::StageChange { target_stage_name } => {
                    cursor.updated_at = now;
                    self.store.update_cursor(cursor)?;
                    self.step_done(cursor, step, format!("to {}", target_stage_name), now);
                    return Ok(DriveOutcome::HandOff {
                        target_stage: target_stage_name.clone(),
                    });
                }
            };

            if !self.move_to(cursor, next, now)? {
                return Ok(DriveOutcome::Finished);
            }
        }
    }

    /// Step past the current position along the default successor.
    ///
    /// Returns `false` when the sequence is exhausted and the cursor completed.
    pub fn advance(&self, cursor: &mut Cursor, sequence: &Sequence, now: DateTime<Utc>) -> Result<bool> {
        let next = StepGraph::new(sequence).successor(cursor.position);
        self.move_to(cursor, next, now)
    }

    fn move_to(&self, cursor: &mut Cursor, next: Next, now: DateTime<Utc>) -> Result<bool> {
        match next {
            Next::Step(position) => {
                cursor.position = position;
                cursor.updated_at = now;
                self.store.update_cursor(cursor)?;
                Ok(true)
            }
            Next::End => {
                cursor::transition(cursor, CursorState::Completed, now)?;
                self.store.update_cursor(cursor)?;
                self.journal.record(
                    cursor,
                    "completed",
                    "",
                    now,
                    EngineEvent::CursorCompleted {
                        cursor_id: cursor.id.clone(),
                    },
                );
                info!(cursor_id = %cursor.id, lead_id = %cursor.lead_id, "Cursor completed");
                Ok(false)
            }
        }
    }

    /// Stop the cursor with a failure record and persist it.
    pub fn fail(&self, cursor: &mut Cursor, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        let reason = reason.into();
        cursor::fail(cursor, reason.clone(), now)?;
        self.store.update_cursor(cursor)?;
        self.journal.record(
            cursor,
            "failed",
            reason.clone(),
            now,
            EngineEvent::CursorFailed {
                cursor_id: cursor.id.clone(),
                reason: reason.clone(),
            },
        );
        warn!(cursor_id = %cursor.id, lead_id = %cursor.lead_id, reason = %reason, "Cursor failed");
        Ok(())
    }

    fn step_done(&self, cursor: &Cursor, step: &Step, detail: impl Into<String>, now: DateTime<Utc>) {
        self.journal.record(
            cursor,
            step.kind.type_name(),
            detail,
            now,
            EngineEvent::StepExecuted {
                cursor_id: cursor.id.clone(),
                position: cursor.position,
                step_type: step.kind.type_name(),
            },
        );
    }
}
