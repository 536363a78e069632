use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::types::*;
use leadflow_engine::ensure_valid;
use leadflow_store::SqliteStore;

/// Authoring bundle accepted by `leadflow import`.
///
/// ```json
/// { "sequences": [...], "pipelines": [...], "leads": [...] }
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub sequences: Vec<Sequence>,
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
    #[serde(default)]
    pub leads: Vec<LeadSpec>,
}

/// A lead as written by hand: timestamps are filled in on import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadSpec {
    pub id: LeadId,
    pub product_id: String,
    pub account_id: String,
    pub contact_id: ContactId,
    /// Place the lead in the pipeline's entry stage after import.
    #[serde(default = "default_enroll")]
    pub enroll: bool,
}

fn default_enroll() -> bool {
    true
}

impl LeadSpec {
    pub fn into_lead(self, now: DateTime<Utc>) -> Lead {
        Lead::new(self.id, self.product_id, self.account_id, self.contact_id, now)
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ImportSummary {
    pub sequences: usize,
    pub pipelines: usize,
}

/// The pipeline with a stage that starts `sequence`, if any. Its stage names
/// are the valid stage_change targets for that sequence.
pub fn pipeline_starting<'a>(pipelines: &'a [Pipeline], sequence: &SequenceId) -> Option<&'a Pipeline> {
    pipelines.iter().find(|p| {
        p.stages
            .iter()
            .any(|s| s.sequence_id.as_ref() == Some(sequence))
    })
}

impl Bundle {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn pipeline_for(&self, sequence: &SequenceId) -> Option<&Pipeline> {
        pipeline_starting(&self.pipelines, sequence)
    }

    /// Validate every sequence, then write sequences and pipelines.
    ///
    /// Nothing is written if any sequence is invalid. Leads are left to the
    /// caller so they can go through the engine.
    pub fn import(&mut self, store: &SqliteStore) -> Result<ImportSummary> {
        for sequence in &mut self.sequences {
            sequence.normalize();
            for step in &mut sequence.steps {
                step.sequence_id = sequence.id.clone();
            }
        }
        for pipeline in &self.pipelines {
            if pipeline.entry_stage().is_none() {
                return Err(LeadflowError::Config(format!(
                    "pipeline {} must have exactly one protected stage",
                    pipeline.product_id
                )));
            }
        }
        for sequence in &self.sequences {
            ensure_valid(sequence, self.pipeline_for(&sequence.id))?;
        }

        for sequence in &self.sequences {
            store.save_sequence(sequence)?;
        }
        for pipeline in &self.pipelines {
            store.save_pipeline(pipeline)?;
        }
        Ok(ImportSummary {
            sequences: self.sequences.len(),
            pipelines: self.pipelines.len(),
        })
    }
}
