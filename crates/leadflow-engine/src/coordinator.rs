use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use leadflow_core::config::ReentryPolicy;
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::FlowStore;
use leadflow_core::types::*;

use crate::cursor;
use crate::journal::Journal;

/// Result of a stage move or sequence assignment.
#[derive(Debug, Clone)]
pub struct Transition {
    pub lead: Lead,
    /// The cursor that was active before, now `Stopped`.
    pub stopped: Option<Cursor>,
    /// The fresh cursor at position 0, `Running`.
    pub started: Option<Cursor>,
    /// False when the move was a no-op re-entry.
    pub changed: bool,
}

/// Sole writer of lead stages and creator of cursors.
///
/// Callers must hold the lead's lane so the stop-then-start sequence cannot
/// interleave with another move of the same lead. The store's unique index
/// backs this up.
pub struct StageTransitionCoordinator {
    store: Arc<dyn FlowStore>,
    journal: Journal,
    reentry: ReentryPolicy,
}

impl StageTransitionCoordinator {
    pub fn new(store: Arc<dyn FlowStore>, journal: Journal, reentry: ReentryPolicy) -> Self {
        Self {
            store,
            journal,
            reentry,
        }
    }

    /// Move a lead to `stage_name`: stop its active cursor, update the stage,
    /// and start the stage's sequence if it has one.
    pub fn move_lead(
        &self,
        lead_id: &LeadId,
        stage_name: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut lead = self.load_lead(lead_id)?;
        let pipeline = self
            .store
            .load_pipeline(&lead.product_id)?
            .ok_or_else(|| LeadflowError::PipelineNotFound(lead.product_id.clone()))?;
        let stage = pipeline
            .stage(stage_name)
            .ok_or_else(|| LeadflowError::StageNotFound {
                product: lead.product_id.clone(),
                stage: stage_name.to_string(),
            })?
            .clone();

        if lead.stage.as_deref() == Some(stage_name) && self.reentry == ReentryPolicy::Ignore {
            info!(lead_id = %lead.id, stage = stage_name, "Lead already in stage, ignoring move");
            return Ok(Transition {
                lead,
                stopped: None,
                started: None,
                changed: false,
            });
        }

        let stopped = self.stop_active(&lead.id, reason, now)?;

        let from = lead.stage.replace(stage.name.clone());
        lead.updated_at = now;
        self.store.save_lead(&lead)?;
        info!(
            lead_id = %lead.id,
            from = from.as_deref().unwrap_or("-"),
            to = %stage.name,
            "Lead stage changed"
        );
        self.journal.publish(EngineEvent::StageChanged {
            lead_id: lead.id.clone(),
            from,
            to: stage.name.clone(),
        });

        let started = match &stage.sequence_id {
            Some(sequence_id) => self.start_stage_sequence(&lead, sequence_id, now)?,
            None => None,
        };

        Ok(Transition {
            lead,
            stopped,
            started,
            changed: true,
        })
    }

    /// Place a lead in its pipeline's protected entry stage, saving it first
    /// if it is new.
    pub fn enroll(&self, lead: &Lead, now: DateTime<Utc>) -> Result<Transition> {
        let pipeline = self
            .store
            .load_pipeline(&lead.product_id)?
            .ok_or_else(|| LeadflowError::PipelineNotFound(lead.product_id.clone()))?;
        let entry = pipeline.entry_stage().ok_or_else(|| {
            LeadflowError::Config(format!(
                "pipeline {} must have exactly one protected stage",
                pipeline.product_id
            ))
        })?;

        if self.store.load_lead(&lead.id)?.is_none() {
            self.store.save_lead(lead)?;
        }
        self.move_lead(&lead.id, &entry.name, "enrolled", now)
    }

    /// Replace the lead's active cursor with a fresh one on `sequence_id`.
    pub fn assign(
        &self,
        lead_id: &LeadId,
        sequence_id: &SequenceId,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let lead = self.load_lead(lead_id)?;
        let sequence = self
            .store
            .load_sequence(sequence_id)?
            .ok_or_else(|| LeadflowError::SequenceNotFound(sequence_id.to_string()))?;
        if !sequence.active {
            return Err(LeadflowError::SequenceInactive(sequence_id.to_string()));
        }
        if sequence.is_empty() {
            return Err(LeadflowError::InvalidSequence {
                sequence: sequence_id.to_string(),
                issues: "sequence has no steps".into(),
            });
        }

        let stopped = self.stop_active(&lead.id, &format!("replaced by sequence {}", sequence_id), now)?;
        let started = self.start_cursor(&lead, sequence_id, now)?;

        Ok(Transition {
            lead,
            stopped,
            started: Some(started),
            changed: true,
        })
    }

    fn load_lead(&self, lead_id: &LeadId) -> Result<Lead> {
        self.store
            .load_lead(lead_id)?
            .ok_or_else(|| LeadflowError::LeadNotFound(lead_id.to_string()))
    }

    fn stop_active(&self, lead_id: &LeadId, reason: &str, now: DateTime<Utc>) -> Result<Option<Cursor>> {
        let Some(mut active) = self.store.active_cursor(lead_id)? else {
            return Ok(None);
        };
        cursor::stop(&mut active, reason, now)?;
        self.store.update_cursor(&active)?;
        self.journal.record(
            &active,
            "stopped",
            reason,
            now,
            EngineEvent::CursorStopped {
                cursor_id: active.id.clone(),
                reason: reason.to_string(),
            },
        );
        info!(cursor_id = %active.id, lead_id = %lead_id, reason, "Cursor stopped");
        Ok(Some(active))
    }

    /// Start a stage's auto-sequence. A missing, inactive or empty sequence
    /// leaves the lead without a cursor.
    fn start_stage_sequence(
        &self,
        lead: &Lead,
        sequence_id: &SequenceId,
        now: DateTime<Utc>,
    ) -> Result<Option<Cursor>> {
        match self.store.load_sequence(sequence_id)? {
            Some(sequence) if sequence.active && !sequence.is_empty() => {
                self.start_cursor(lead, sequence_id, now).map(Some)
            }
            Some(_) => {
                warn!(lead_id = %lead.id, sequence_id = %sequence_id, "Stage sequence is inactive or empty, not starting");
                Ok(None)
            }
            None => {
                warn!(lead_id = %lead.id, sequence_id = %sequence_id, "Stage sequence not found, not starting");
                Ok(None)
            }
        }
    }

    fn start_cursor(&self, lead: &Lead, sequence_id: &SequenceId, now: DateTime<Utc>) -> Result<Cursor> {
        let cursor = Cursor::start(lead, sequence_id.clone(), now);
        self.store.insert_cursor(&cursor)?;
        self.journal.record(
            &cursor,
            "started",
            sequence_id.to_string(),
            now,
            EngineEvent::CursorStarted {
                cursor_id: cursor.id.clone(),
                lead_id: lead.id.clone(),
                sequence_id: sequence_id.clone(),
            },
        );
        info!(cursor_id = %cursor.id, lead_id = %lead.id, sequence_id = %sequence_id, "Cursor started");
        Ok(cursor)
    }
}
