use chrono::{DateTime, Duration, Utc};

use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::text;
use leadflow_core::types::*;

/// Whether `from -> to` is a legal cursor transition.
///
/// Terminal states have no outgoing edges. `Completed` is only reachable from
/// `Running` (graph exhaustion).
pub fn can_transition(from: CursorState, to: CursorState) -> bool {
    use CursorState::*;
    matches!(
        (from, to),
        (Running, WaitingForEvent)
            | (Running, Paused)
            | (Running, Stopped)
            | (Running, Completed)
            | (WaitingForEvent, Running)
            | (WaitingForEvent, Paused)
            | (WaitingForEvent, Stopped)
            | (Paused, Running)
            | (Paused, Stopped)
    )
}

/// Move `cursor` to `to`, rejecting illegal transitions.
pub fn transition(cursor: &mut Cursor, to: CursorState, now: DateTime<Utc>) -> Result<()> {
    if !can_transition(cursor.state, to) {
        return Err(LeadflowError::InvalidTransition {
            from: cursor.state.to_string(),
            to: to.to_string(),
        });
    }
    cursor.state = to;
    if to != CursorState::WaitingForEvent {
        cursor.wait = None;
    }
    cursor.updated_at = now;
    Ok(())
}

/// Terminate the cursor as `Stopped` with a reason.
pub fn stop(cursor: &mut Cursor, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
    transition(cursor, CursorState::Stopped, now)?;
    cursor.stop_reason = Some(reason.into());
    Ok(())
}

/// Terminate the cursor as `Stopped` and keep a failure record.
pub fn fail(cursor: &mut Cursor, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
    let reason = reason.into();
    stop(cursor, reason.clone(), now)?;
    cursor.failure = Some(FailureRecord {
        reason,
        position: cursor.position,
        at: now,
    });
    Ok(())
}

/// Wake conditions for a pause step that starts executing at `now`.
pub fn wait_for(pause: &PauseSpec, now: DateTime<Utc>) -> Wait {
    let due_at = match pause {
        PauseSpec::FixedDelay {
            delay_hours_from_previous,
            ..
        } => Some(now + hours(delay_hours_from_previous.max(0.0))),
        PauseSpec::UntilMessage => None,
        PauseSpec::UntilDaysWithoutResponse {
            days_without_response,
        } => Some(now + Duration::days(i64::from(*days_without_response))),
    };
    Wait {
        step_started_at: now,
        due_at,
        listen: pause.listens(),
        interrupted_at: None,
    }
}

/// What an inbound message means for a cursor waiting on a pause.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundDecision {
    /// Not relevant to this pause.
    Ignore,
    /// End the pause now.
    Wake,
    /// Keep waiting with updated wake conditions.
    Reschedule(Wait),
}

/// Decide how `message` affects a wait on `pause`.
///
/// Messages older than the pause itself never count.
pub fn on_inbound(pause: &PauseSpec, wait: &Wait, message: &MessageEvent) -> InboundDecision {
    if !wait.listen || message.timestamp < wait.step_started_at {
        return InboundDecision::Ignore;
    }

    match pause {
        PauseSpec::FixedDelay {
            pause_interrupt,
            pause_interrupt_keywords,
            pause_delay_after_interrupt,
            ..
        } => {
            let interrupts = match pause_interrupt {
                InterruptMode::None => false,
                InterruptMode::AnyMessage => true,
                InterruptMode::Keywords => {
                    text::contains_any(&message.body, pause_interrupt_keywords)
                }
            };
            if !interrupts {
                return InboundDecision::Ignore;
            }
            match pause_delay_after_interrupt {
                Some(after) if wait.interrupted_at.is_none() => {
                    InboundDecision::Reschedule(Wait {
                        step_started_at: wait.step_started_at,
                        due_at: Some(message.timestamp + hours(after.max(0.0))),
                        listen: false,
                        interrupted_at: Some(message.timestamp),
                    })
                }
                _ => InboundDecision::Wake,
            }
        }
        PauseSpec::UntilMessage => InboundDecision::Wake,
        PauseSpec::UntilDaysWithoutResponse {
            days_without_response,
        } => {
            let due = message.timestamp + Duration::days(i64::from(*days_without_response));
            // A late message must not pull the deadline earlier.
            let due_at = match wait.due_at {
                Some(current) if current > due => Some(current),
                _ => Some(due),
            };
            InboundDecision::Reschedule(Wait {
                due_at,
                ..wait.clone()
            })
        }
    }
}

/// Whether a waiting cursor's timer has fired at `now`.
pub fn is_due(cursor: &Cursor, now: DateTime<Utc>) -> bool {
    cursor.state == CursorState::WaitingForEvent && cursor.due_at().is_some_and(|due| due <= now)
}
