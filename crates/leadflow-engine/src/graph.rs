use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::types::*;

/// Where a cursor goes after the step at its current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Continue at this index into the ordered steps.
    Step(usize),
    /// No successor: the sequence is exhausted.
    End,
}

/// Read-only successor resolution over a sequence's ordered steps.
///
/// Holds no state of its own, so resolving the same position with the same
/// condition outcome always yields the same answer.
pub struct StepGraph<'a> {
    sequence: &'a Sequence,
}

impl<'a> StepGraph<'a> {
    pub fn new(sequence: &'a Sequence) -> Self {
        Self { sequence }
    }

    pub fn step(&self, position: usize) -> Option<&'a Step> {
        self.sequence.step(position)
    }

    /// Default successor: the next step in order.
    pub fn successor(&self, position: usize) -> Next {
        if position + 1 < self.sequence.len() {
            Next::Step(position + 1)
        } else {
            Next::End
        }
    }

    /// Branch target of a condition step for an evaluated outcome.
    ///
    /// A missing target ends the sequence. A target naming a step that is not
    /// in this sequence is a configuration error.
    pub fn branch(&self, condition: &ConditionSpec, outcome: bool) -> Result<Next> {
        let target = if outcome {
            &condition.next_if_true
        } else {
            &condition.next_if_false
        };
        match target {
            None => Ok(Next::End),
            Some(step_id) => self
                .sequence
                .position_of(step_id)
                .map(Next::Step)
                .ok_or_else(|| LeadflowError::InvalidSequence {
                    sequence: self.sequence.id.to_string(),
                    issues: format!("branch target {} does not exist", step_id),
                }),
        }
    }

    /// Resolve the successor of `position`. `outcome` is required for
    /// condition steps and ignored otherwise.
    pub fn resolve(&self, position: usize, outcome: Option<bool>) -> Result<Next> {
        let step = self.step(position).ok_or_else(|| LeadflowError::InvalidSequence {
            sequence: self.sequence.id.to_string(),
            issues: format!("position {} is out of range", position),
        })?;
        match (&step.kind, outcome) {
            (StepKind::Condition(spec), Some(outcome)) => self.branch(spec, outcome),
            (StepKind::Condition(_), None) => Err(LeadflowError::InvalidSequence {
                sequence: self.sequence.id.to_string(),
                issues: format!("condition step {} resolved without an outcome", step.id),
            }),
            _ => Ok(self.successor(position)),
        }
    }
}

/// A configuration problem found in a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub step_id: Option<StepId>,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(id) => write!(f, "step {}: {}", id, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Check a sequence for configuration errors.
///
/// Stage names are only checked when `pipeline` is given.
pub fn validate_sequence(sequence: &Sequence, pipeline: Option<&Pipeline>) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let issue = |step: Option<&Step>, message: String| ValidationIssue {
        step_id: step.map(|s| s.id.clone()),
        message,
    };

    if sequence.is_empty() {
        issues.push(issue(None, "sequence has no steps".into()));
    }

    let mut positions = HashSet::new();
    let mut ids = HashSet::new();
    for step in &sequence.steps {
        if !positions.insert(step.order_position) {
            issues.push(issue(
                Some(step),
                format!("duplicate order_position {}", step.order_position),
            ));
        }
        if !ids.insert(&step.id) {
            issues.push(issue(Some(step), "duplicate step id".into()));
        }
    }

    for step in &sequence.steps {
        match &step.kind {
            StepKind::Message { content, media } => {
                if content.trim().is_empty() && media.is_empty() {
                    issues.push(issue(Some(step), "message has no content or media".into()));
                }
            }
            StepKind::Pause(PauseSpec::FixedDelay {
                delay_hours_from_previous,
                pause_interrupt,
                pause_interrupt_keywords,
                pause_delay_after_interrupt,
            }) => {
                if !delay_hours_from_previous.is_finite() || *delay_hours_from_previous < 0.0 {
                    issues.push(issue(
                        Some(step),
                        format!("delay must be >= 0 hours, got {}", delay_hours_from_previous),
                    ));
                }
                if let Some(after) = pause_delay_after_interrupt {
                    if !after.is_finite() || *after < 0.0 {
                        issues.push(issue(
                            Some(step),
                            format!("delay after interrupt must be >= 0 hours, got {}", after),
                        ));
                    }
                }
                if *pause_interrupt == InterruptMode::Keywords
                    && !has_keyword(pause_interrupt_keywords)
                {
                    issues.push(issue(Some(step), "keyword interrupt has no keywords".into()));
                }
            }
            StepKind::Pause(PauseSpec::UntilDaysWithoutResponse {
                days_without_response,
            }) => {
                if *days_without_response == 0 {
                    issues.push(issue(Some(step), "days_without_response must be >= 1".into()));
                }
            }
            StepKind::Pause(PauseSpec::UntilMessage) => {}
            StepKind::Condition(spec) => {
                if spec.next_if_true.is_none() && spec.next_if_false.is_none() {
                    issues.push(issue(Some(step), "condition has no branch target".into()));
                }
                for target in [&spec.next_if_true, &spec.next_if_false].into_iter().flatten() {
                    if sequence.position_of(target).is_none() {
                        issues.push(issue(
                            Some(step),
                            format!("branch target {} does not exist", target),
                        ));
                    } else if target == &step.id {
                        issues.push(issue(Some(step), "condition branches to itself".into()));
                    }
                }
                if spec.condition_type == ConditionType::IfMessageContains
                    && !has_keyword(&spec.condition_keywords)
                {
                    issues.push(issue(Some(step), "if_message_contains has no keywords".into()));
                }
            }
            StepKind::StageChange { target_stage_name } => {
                if target_stage_name.trim().is_empty() {
                    issues.push(issue(Some(step), "stage_change has no target stage".into()));
                } else if let Some(pipeline) = pipeline {
                    if pipeline.stage(target_stage_name).is_none() {
                        issues.push(issue(
                            Some(step),
                            format!(
                                "stage {} not found in pipeline {}",
                                target_stage_name, pipeline.product_id
                            ),
                        ));
                    }
                }
            }
        }
    }

    issues
}

/// Validate and turn any issues into an `InvalidSequence` error.
pub fn ensure_valid(sequence: &Sequence, pipeline: Option<&Pipeline>) -> Result<()> {
    let issues = validate_sequence(sequence, pipeline);
    if issues.is_empty() {
        return Ok(());
    }
    Err(LeadflowError::InvalidSequence {
        sequence: sequence.id.to_string(),
        issues: issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; "),
    })
}

fn has_keyword(keywords: &[String]) -> bool {
    keywords.iter().any(|k| !k.trim().is_empty())
}
