//! Builders for steps, sequences, pipelines and leads.

use leadflow_core::types::*;

use crate::t0;

pub const PRODUCT: &str = "prod-1";
pub const ACCOUNT: &str = "acct-1";

pub fn lead(id: &str, contact: &str) -> Lead {
    Lead::new(id.into(), PRODUCT, ACCOUNT, contact.into(), t0())
}

pub fn pipeline(stages: Vec<Stage>) -> Pipeline {
    Pipeline {
        product_id: PRODUCT.to_string(),
        stages,
    }
}

pub fn sequence(id: &str, steps: Vec<Step>) -> Sequence {
    let steps = steps
        .into_iter()
        .map(|mut s| {
            s.sequence_id = id.into();
            s
        })
        .collect();
    Sequence::new(id.into(), ACCOUNT, id, steps)
}

fn step(id: &str, order_position: u32, kind: StepKind) -> Step {
    Step {
        id: id.into(),
        sequence_id: SequenceId::from(""),
        order_position,
        kind,
    }
}

pub fn message(id: &str, pos: u32, content: &str) -> Step {
    step(
        id,
        pos,
        StepKind::Message {
            content: content.to_string(),
            media: vec![],
        },
    )
}

pub fn fixed_delay(id: &str, pos: u32, hours: f64) -> Step {
    step(
        id,
        pos,
        StepKind::Pause(PauseSpec::FixedDelay {
            delay_hours_from_previous: hours,
            pause_interrupt: InterruptMode::None,
            pause_interrupt_keywords: vec![],
            pause_delay_after_interrupt: None,
        }),
    )
}

pub fn fixed_delay_any_message(id: &str, pos: u32, hours: f64, after: Option<f64>) -> Step {
    step(
        id,
        pos,
        StepKind::Pause(PauseSpec::FixedDelay {
            delay_hours_from_previous: hours,
            pause_interrupt: InterruptMode::AnyMessage,
            pause_interrupt_keywords: vec![],
            pause_delay_after_interrupt: after,
        }),
    )
}

pub fn fixed_delay_keywords(id: &str, pos: u32, hours: f64, keywords: &[&str]) -> Step {
    step(
        id,
        pos,
        StepKind::Pause(PauseSpec::FixedDelay {
            delay_hours_from_previous: hours,
            pause_interrupt: InterruptMode::Keywords,
            pause_interrupt_keywords: keywords.iter().map(|k| k.to_string()).collect(),
            pause_delay_after_interrupt: None,
        }),
    )
}

pub fn until_message(id: &str, pos: u32) -> Step {
    step(id, pos, StepKind::Pause(PauseSpec::UntilMessage))
}

pub fn until_days_without_response(id: &str, pos: u32, days: u32) -> Step {
    step(
        id,
        pos,
        StepKind::Pause(PauseSpec::UntilDaysWithoutResponse {
            days_without_response: days,
        }),
    )
}

pub fn condition(
    id: &str,
    pos: u32,
    condition_type: ConditionType,
    keywords: &[&str],
    next_if_true: Option<&str>,
    next_if_false: Option<&str>,
) -> Step {
    step(
        id,
        pos,
        StepKind::Condition(ConditionSpec {
            condition_type,
            condition_keywords: keywords.iter().map(|k| k.to_string()).collect(),
            next_if_true: next_if_true.map(StepId::from),
            next_if_false: next_if_false.map(StepId::from),
        }),
    )
}

pub fn stage_change(id: &str, pos: u32, target: &str) -> Step {
    step(
        id,
        pos,
        StepKind::StageChange {
            target_stage_name: target.to_string(),
        },
    )
}

/// `[Message "hola", Pause(1h), Condition(if_responded) -> true: end, false: Message "nudge"]`.
pub fn message_pause_condition(id: &str) -> Sequence {
    sequence(
        id,
        vec![
            message("m1", 0, "hola"),
            fixed_delay("p1", 1, 1.0),
            condition("c1", 2, ConditionType::IfResponded, &[], None, Some("m2")),
            message("m2", 3, "nudge"),
        ],
    )
}
