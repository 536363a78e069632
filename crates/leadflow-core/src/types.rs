use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_str(s: &str) -> Self {
                Self(s.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique lead identifier.
    LeadId
);
string_id!(
    /// Unique sequence (flow) identifier.
    SequenceId
);
string_id!(
    /// Unique step identifier, stable across reorderings.
    StepId
);
string_id!(
    /// Unique cursor identifier.
    CursorId
);
string_id!(
    /// Contact reference owned by the CRM.
    ContactId
);

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// One node of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub sequence_id: SequenceId,
    /// Unique within the sequence; defines the default successor order.
    pub order_position: u32,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// Type-specific step payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step_type", rename_all = "snake_case")]
pub enum StepKind {
    /// Send content to the lead's contact.
    Message {
        content: String,
        #[serde(default)]
        media: Vec<String>,
    },
    /// Suspend the cursor until a time and/or an inbound message.
    Pause(PauseSpec),
    /// Evaluate a condition now and branch.
    Condition(ConditionSpec),
    /// Move the lead to another stage of its pipeline (hands off the cursor).
    StageChange { target_stage_name: String },
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Message { .. } => "message",
            StepKind::Pause(_) => "pause",
            StepKind::Condition(_) => "condition",
            StepKind::StageChange { .. } => "stage_change",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pause_type", rename_all = "snake_case")]
pub enum PauseSpec {
    FixedDelay {
        delay_hours_from_previous: f64,
        #[serde(default)]
        pause_interrupt: InterruptMode,
        /// Only read in `keywords` mode.
        #[serde(default)]
        pause_interrupt_keywords: Vec<String>,
        /// Hours to wait after an interrupting message before waking.
        #[serde(default)]
        pause_delay_after_interrupt: Option<f64>,
    },
    UntilMessage,
    UntilDaysWithoutResponse { days_without_response: u32 },
}

impl PauseSpec {
    /// Whether a cursor waiting on this pause listens for inbound messages.
    pub fn listens(&self) -> bool {
        match self {
            PauseSpec::FixedDelay {
                pause_interrupt, ..
            } => *pause_interrupt != InterruptMode::None,
            PauseSpec::UntilMessage | PauseSpec::UntilDaysWithoutResponse { .. } => true,
        }
    }
}

/// How an inbound message may end a fixed delay early.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptMode {
    #[default]
    None,
    AnyMessage,
    Keywords,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub condition_type: ConditionType,
    #[serde(default)]
    pub condition_keywords: Vec<String>,
    /// `None` ends the sequence when the condition holds.
    #[serde(default)]
    pub next_if_true: Option<StepId>,
    /// `None` ends the sequence when the condition does not hold.
    #[serde(default)]
    pub next_if_false: Option<StepId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    IfMessageContains,
    IfResponded,
    IfNotResponded,
}

/// Convert fractional hours into a chrono duration (millisecond precision).
pub fn hours(h: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((h * 3_600_000.0).round() as i64)
}

// ---------------------------------------------------------------------------
// Sequences and pipelines
// ---------------------------------------------------------------------------

/// A named, ordered set of steps belonging to an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub id: SequenceId,
    pub account_id: String,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub steps: Vec<Step>,
}

fn default_active() -> bool {
    true
}

impl Sequence {
    /// Build a sequence with its steps sorted by `order_position`.
    pub fn new(
        id: SequenceId,
        account_id: impl Into<String>,
        name: impl Into<String>,
        mut steps: Vec<Step>,
    ) -> Self {
        steps.sort_by_key(|s| s.order_position);
        Self {
            id,
            account_id: account_id.into(),
            name: name.into(),
            active: true,
            steps,
        }
    }

    /// Sort steps in place; positions index this ordering.
    pub fn normalize(&mut self) {
        self.steps.sort_by_key(|s| s.order_position);
    }

    pub fn step(&self, position: usize) -> Option<&Step> {
        self.steps.get(position)
    }

    pub fn position_of(&self, step_id: &StepId) -> Option<usize> {
        self.steps.iter().position(|s| &s.id == step_id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// One column of a product's funnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Sequence auto-started when a lead enters this stage.
    #[serde(default)]
    pub sequence_id: Option<SequenceId>,
    /// The protected stage is the funnel's entry point.
    #[serde(default)]
    pub protected: bool,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sequence_id: None,
            protected: false,
        }
    }

    pub fn with_sequence(mut self, sequence_id: SequenceId) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub product_id: String,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The protected entry stage, if the pipeline has exactly one.
    pub fn entry_stage(&self) -> Option<&Stage> {
        let mut protected = self.stages.iter().filter(|s| s.protected);
        match (protected.next(), protected.next()) {
            (Some(stage), None) => Some(stage),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Leads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub product_id: String,
    pub account_id: String,
    pub contact_id: ContactId,
    /// Current stage name; `None` until the lead enters the funnel.
    #[serde(default)]
    pub stage: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(
        id: LeadId,
        product_id: impl Into<String>,
        account_id: impl Into<String>,
        contact_id: ContactId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            product_id: product_id.into(),
            account_id: account_id.into(),
            contact_id,
            stage: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorState {
    Running,
    WaitingForEvent,
    Paused,
    Stopped,
    Completed,
}

impl CursorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorState::Running => "running",
            CursorState::WaitingForEvent => "waiting_for_event",
            CursorState::Paused => "paused",
            CursorState::Stopped => "stopped",
            CursorState::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(CursorState::Running),
            "waiting_for_event" => Some(CursorState::WaitingForEvent),
            "paused" => Some(CursorState::Paused),
            "stopped" => Some(CursorState::Stopped),
            "completed" => Some(CursorState::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CursorState::Stopped | CursorState::Completed)
    }
}

impl std::fmt::Display for CursorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable wake conditions of a cursor in `WaitingForEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wait {
    /// When the pause step began executing.
    pub step_started_at: DateTime<Utc>,
    /// Wall-clock wake time, if any.
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    /// Whether inbound messages from the contact are of interest.
    #[serde(default)]
    pub listen: bool,
    /// Set once an interrupt re-delayed the pause.
    #[serde(default)]
    pub interrupted_at: Option<DateTime<Utc>>,
}

/// Why a cursor terminated abnormally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub reason: String,
    pub position: usize,
    pub at: DateTime<Utc>,
}

/// A lead's live progress through one sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub id: CursorId,
    pub lead_id: LeadId,
    pub sequence_id: SequenceId,
    pub contact_id: ContactId,
    /// Index into the sequence's ordered steps.
    pub position: usize,
    pub state: CursorState,
    #[serde(default)]
    pub wait: Option<Wait>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cursor {
    /// A fresh cursor at position 0, ready to run.
    pub fn start(lead: &Lead, sequence_id: SequenceId, now: DateTime<Utc>) -> Self {
        Self {
            id: CursorId::new(),
            lead_id: lead.id.clone(),
            sequence_id,
            contact_id: lead.contact_id.clone(),
            position: 0,
            state: CursorState::Running,
            wait: None,
            stop_reason: None,
            failure: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        self.wait.as_ref().and_then(|w| w.due_at)
    }

    pub fn status(&self) -> CursorStatus {
        CursorStatus {
            cursor_id: self.id.clone(),
            lead_id: self.lead_id.clone(),
            sequence_id: self.sequence_id.clone(),
            position: self.position,
            state: self.state,
            due_at: self.due_at(),
            stop_reason: self.stop_reason.clone(),
            failure: self.failure.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Read model exposed to collaborator UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorStatus {
    pub cursor_id: CursorId,
    pub lead_id: LeadId,
    pub sequence_id: SequenceId,
    pub position: usize,
    pub state: CursorState,
    pub due_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub failure: Option<FailureRecord>,
    pub updated_at: DateTime<Utc>,
}

/// One line of a cursor's activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorLogEntry {
    pub cursor_id: CursorId,
    pub position: usize,
    pub kind: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl CursorLogEntry {
    pub fn new(
        cursor: &Cursor,
        kind: impl Into<String>,
        detail: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            cursor_id: cursor.id.clone(),
            position: cursor.position,
            kind: kind.into(),
            detail: detail.into(),
            at,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// An inbound or outbound chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: String,
    pub contact_id: ContactId,
    pub direction: Direction,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageEvent {
    pub fn inbound(contact_id: ContactId, body: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            contact_id,
            direction: Direction::Inbound,
            body: body.into(),
            timestamp,
        }
    }

    pub fn outbound(contact_id: ContactId, body: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            contact_id,
            direction: Direction::Outbound,
            body: body.into(),
            timestamp,
        }
    }
}

/// Content handed to the dispatcher for a message step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub content: String,
    #[serde(default)]
    pub media: Vec<String>,
}

// ---------------------------------------------------------------------------
// Engine events
// ---------------------------------------------------------------------------

/// Events published by the engine on the event bus.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A new cursor was created for a lead.
    CursorStarted {
        cursor_id: CursorId,
        lead_id: LeadId,
        sequence_id: SequenceId,
    },
    /// A step finished executing.
    StepExecuted {
        cursor_id: CursorId,
        position: usize,
        step_type: &'static str,
    },
    /// The cursor suspended on a pause step.
    CursorWaiting {
        cursor_id: CursorId,
        due_at: Option<DateTime<Utc>>,
    },
    /// A wake source fired and the cursor resumed running.
    CursorWoken { cursor_id: CursorId, reason: String },
    CursorPaused { cursor_id: CursorId },
    CursorResumed { cursor_id: CursorId },
    CursorStopped { cursor_id: CursorId, reason: String },
    CursorCompleted { cursor_id: CursorId },
    /// The cursor stopped because of an error (dispatch, evaluation, guard).
    CursorFailed { cursor_id: CursorId, reason: String },
    /// A lead moved between stages.
    StageChanged {
        lead_id: LeadId,
        from: Option<String>,
        to: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_payload_roundtrip_is_flat() {
        let json = serde_json::json!({
            "id": "s2",
            "sequence_id": "seq",
            "order_position": 1,
            "step_type": "pause",
            "pause_type": "fixed_delay",
            "delay_hours_from_previous": 2.0,
            "pause_interrupt": "keywords",
            "pause_interrupt_keywords": ["precio"]
        });
        let step: Step = serde_json::from_value(json).unwrap();
        match &step.kind {
            StepKind::Pause(PauseSpec::FixedDelay {
                delay_hours_from_previous,
                pause_interrupt,
                pause_interrupt_keywords,
                pause_delay_after_interrupt,
            }) => {
                assert_eq!(*delay_hours_from_previous, 2.0);
                assert_eq!(*pause_interrupt, InterruptMode::Keywords);
                assert_eq!(pause_interrupt_keywords, &vec!["precio".to_string()]);
                assert!(pause_delay_after_interrupt.is_none());
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_condition_payload_defaults() {
        let json = serde_json::json!({
            "id": "c1",
            "sequence_id": "seq",
            "order_position": 2,
            "step_type": "condition",
            "condition_type": "if_responded",
            "next_if_true": "x"
        });
        let step: Step = serde_json::from_value(json).unwrap();
        let StepKind::Condition(spec) = step.kind else {
            panic!("expected condition");
        };
        assert_eq!(spec.condition_type, ConditionType::IfResponded);
        assert_eq!(spec.next_if_true, Some(StepId::from("x")));
        assert!(spec.next_if_false.is_none());
        assert!(spec.condition_keywords.is_empty());
    }

    #[test]
    fn test_sequence_sorts_steps() {
        let steps = vec![
            Step {
                id: "b".into(),
                sequence_id: "s".into(),
                order_position: 1,
                kind: StepKind::StageChange {
                    target_stage_name: "won".into(),
                },
            },
            Step {
                id: "a".into(),
                sequence_id: "s".into(),
                order_position: 0,
                kind: StepKind::Message {
                    content: "hola".into(),
                    media: vec![],
                },
            },
        ];
        let seq = Sequence::new("s".into(), "acct", "demo", steps);
        assert_eq!(seq.step(0).unwrap().id, StepId::from("a"));
        assert_eq!(seq.position_of(&"b".into()), Some(1));
    }

    #[test]
    fn test_entry_stage_requires_single_protected() {
        let mut pipeline = Pipeline {
            product_id: "p".into(),
            stages: vec![Stage::new("new").protected(), Stage::new("won")],
        };
        assert_eq!(pipeline.entry_stage().unwrap().name, "new");

        pipeline.stages[1].protected = true;
        assert!(pipeline.entry_stage().is_none());
    }

    #[test]
    fn test_cursor_state_str_roundtrip() {
        for state in [
            CursorState::Running,
            CursorState::WaitingForEvent,
            CursorState::Paused,
            CursorState::Stopped,
            CursorState::Completed,
        ] {
            assert_eq!(CursorState::parse(state.as_str()), Some(state));
        }
        assert!(CursorState::Stopped.is_terminal());
        assert!(!CursorState::Paused.is_terminal());
    }

    #[test]
    fn test_hours_conversion() {
        assert_eq!(hours(2.0), chrono::Duration::hours(2));
        assert_eq!(hours(0.5), chrono::Duration::minutes(30));
    }
}
