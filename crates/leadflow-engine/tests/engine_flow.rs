use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use leadflow_core::config::{AppConfig, ReentryPolicy};
use leadflow_core::error::LeadflowError;
use leadflow_core::event::EventBus;
use leadflow_core::traits::FlowStore;
use leadflow_core::types::*;
use leadflow_engine::FlowEngine;
use leadflow_store::SqliteStore;
use leadflow_test_utils::fixtures::*;
use leadflow_test_utils::{t0, MockDispatcher};

struct Harness {
    store: Arc<SqliteStore>,
    dispatcher: Arc<MockDispatcher>,
    engine: Arc<FlowEngine>,
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.dispatch.initial_backoff_ms = 1;
    config.dispatch.max_backoff_ms = 2;
    config
}

fn harness_with(config: AppConfig, dispatcher: MockDispatcher) -> Harness {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let dispatcher = Arc::new(dispatcher);
    let engine = Arc::new(FlowEngine::new(
        store.clone(),
        store.clone(),
        dispatcher.clone(),
        Arc::new(EventBus::default()),
        &config,
    ));
    Harness {
        store,
        dispatcher,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(test_config(), MockDispatcher::new())
}

fn at(minutes: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(minutes)
}

impl Harness {
    fn with_lead(&self, id: &str, contact: &str) -> Lead {
        let lead = lead(id, contact);
        self.store.save_lead(&lead).unwrap();
        lead
    }

    fn save(&self, sequence: Sequence) -> SequenceId {
        let id = sequence.id.clone();
        self.store.save_sequence(&sequence).unwrap();
        id
    }

    async fn inbound(&self, contact: &str, body: &str, when: DateTime<Utc>) -> usize {
        self.engine
            .handle_inbound(&MessageEvent::inbound(contact.into(), body, when))
            .await
            .unwrap()
    }

    /// Another engine instance over the same store, as a separate worker or
    /// CLI process would run.
    fn second_engine(&self) -> FlowEngine {
        FlowEngine::new(
            self.store.clone(),
            self.store.clone(),
            self.dispatcher.clone(),
            Arc::new(EventBus::default()),
            &test_config(),
        )
    }

    fn active_count(&self, lead: &LeadId) -> usize {
        self.store
            .cursors_for_lead(lead)
            .unwrap()
            .iter()
            .filter(|c| c.is_active())
            .count()
    }
}

/// Pipeline: new (protected) -> welcome, qualified -> followup, lost (no sequence).
fn standard_pipeline(h: &Harness) {
    h.save(sequence(
        "welcome",
        vec![message("w1", 0, "bienvenido"), until_message("w2", 1)],
    ));
    h.save(sequence(
        "followup",
        vec![until_message("f1", 0), message("f2", 1, "seguimos?")],
    ));
    h.store
        .save_pipeline(&pipeline(vec![
            Stage::new("new").protected().with_sequence("welcome".into()),
            Stage::new("qualified").with_sequence("followup".into()),
            Stage::new("lost"),
        ]))
        .unwrap();
}

#[tokio::test]
async fn test_no_reply_takes_false_branch() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(message_pause_condition("seq"));

    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();
    assert_eq!(status.state, CursorState::WaitingForEvent);
    assert_eq!(status.position, 1);
    assert_eq!(h.dispatcher.sent_contents(), vec!["hola"]);

    assert_eq!(h.engine.tick(at(59)).await.unwrap(), 0);
    assert_eq!(h.engine.tick(at(60)).await.unwrap(), 1);

    let status = h.engine.status(&status.cursor_id).unwrap();
    assert_eq!(status.state, CursorState::Completed);
    assert_eq!(h.dispatcher.sent_contents(), vec!["hola", "nudge"]);
}

#[tokio::test]
async fn test_reply_during_pause_takes_true_branch() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(message_pause_condition("seq"));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();

    // Uninterruptible delay: the reply is recorded but does not wake
    assert_eq!(h.inbound("contact-1", "gracias", at(10)).await, 0);
    assert_eq!(h.engine.tick(at(60)).await.unwrap(), 1);

    let status = h.engine.status(&status.cursor_id).unwrap();
    assert_eq!(status.state, CursorState::Completed);
    assert_eq!(h.dispatcher.sent_contents(), vec!["hola"]);
}

#[tokio::test]
async fn test_fixed_delay_wakes_exactly_on_time() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence(
        "seq",
        vec![fixed_delay("p1", 0, 2.0), message("m1", 1, "ya")],
    ));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();
    assert_eq!(status.due_at, Some(t0() + Duration::hours(2)));

    let just_before = t0() + Duration::hours(2) - Duration::milliseconds(1);
    assert_eq!(h.engine.tick(just_before).await.unwrap(), 0);
    assert!(h.dispatcher.sent().is_empty());

    assert_eq!(h.engine.tick(t0() + Duration::hours(2)).await.unwrap(), 1);
    assert_eq!(h.dispatcher.sent_contents(), vec!["ya"]);
}

#[tokio::test]
async fn test_keyword_interrupt_wakes_early() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence(
        "seq",
        vec![
            fixed_delay_keywords("p1", 0, 2.0, &["precio"]),
            message("m1", 1, "te paso precios"),
        ],
    ));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();

    assert_eq!(h.inbound("contact-1", "hola", at(5)).await, 0);
    assert_eq!(
        h.engine.status(&status.cursor_id).unwrap().state,
        CursorState::WaitingForEvent
    );

    assert_eq!(h.inbound("contact-1", "PRECIO??", at(10)).await, 1);
    assert_eq!(
        h.engine.status(&status.cursor_id).unwrap().state,
        CursorState::Completed
    );
    assert_eq!(h.dispatcher.sent_contents(), vec!["te paso precios"]);

    // The original timer is now stale
    assert_eq!(h.engine.tick(t0() + Duration::hours(3)).await.unwrap(), 0);
    assert_eq!(h.dispatcher.sent().len(), 1);
}

#[tokio::test]
async fn test_message_contains_condition_matches_accents() {
    let h = harness();
    let seq = h.save(sequence(
        "seq",
        vec![
            until_message("p1", 0),
            condition(
                "c1",
                1,
                ConditionType::IfMessageContains,
                &["si", "sí"],
                Some("yes"),
                None,
            ),
            message("yes", 2, "genial"),
        ],
    ));

    let a = h.with_lead("lead-a", "contact-a");
    let b = h.with_lead("lead-b", "contact-b");
    let ca = h.engine.assign_sequence(&a.id, &seq, t0()).await.unwrap();
    let cb = h.engine.assign_sequence(&b.id, &seq, t0()).await.unwrap();

    assert_eq!(h.inbound("contact-a", "Sí, me interesa", at(1)).await, 1);
    assert_eq!(h.inbound("contact-b", "no gracias", at(1)).await, 1);

    let sent = h.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, ContactId::from("contact-a"));
    assert_eq!(h.engine.status(&ca.cursor_id).unwrap().state, CursorState::Completed);
    assert_eq!(h.engine.status(&cb.cursor_id).unwrap().state, CursorState::Completed);
}

#[tokio::test]
async fn test_delay_after_interrupt_redelays() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence(
        "seq",
        vec![
            fixed_delay_any_message("p1", 0, 24.0, Some(1.0)),
            message("m1", 1, "hablamos"),
        ],
    ));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();

    assert_eq!(h.inbound("contact-1", "hey", at(30)).await, 0);
    let waiting = h.engine.status(&status.cursor_id).unwrap();
    assert_eq!(waiting.due_at, Some(at(90)));

    assert_eq!(h.engine.tick(at(89)).await.unwrap(), 0);
    assert_eq!(h.engine.tick(at(90)).await.unwrap(), 1);
    assert_eq!(h.dispatcher.sent_contents(), vec!["hablamos"]);
}

#[tokio::test]
async fn test_days_without_response_extends_on_activity() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence(
        "seq",
        vec![until_days_without_response("p1", 0, 3), message("m1", 1, "sigues ahi?")],
    ));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();
    assert_eq!(status.due_at, Some(t0() + Duration::days(3)));

    assert_eq!(h.inbound("contact-1", "ok", t0() + Duration::days(1)).await, 0);
    assert_eq!(
        h.engine.status(&status.cursor_id).unwrap().due_at,
        Some(t0() + Duration::days(4))
    );

    assert_eq!(h.engine.tick(t0() + Duration::days(3)).await.unwrap(), 0);
    assert_eq!(h.engine.tick(t0() + Duration::days(4)).await.unwrap(), 1);
    assert_eq!(h.dispatcher.sent_contents(), vec!["sigues ahi?"]);
}

#[tokio::test]
async fn test_moving_stage_replaces_cursor() {
    let h = harness();
    standard_pipeline(&h);
    let lead = lead("lead-1", "contact-1");

    let first = h.engine.enroll_lead(&lead, t0()).await.unwrap().unwrap();
    assert_eq!(first.sequence_id, SequenceId::from("welcome"));
    assert_eq!(first.state, CursorState::WaitingForEvent);

    let second = h
        .engine
        .move_lead_to_stage(&lead.id, "qualified", at(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.sequence_id, SequenceId::from("followup"));
    assert_eq!(second.position, 0);
    assert_eq!(second.state, CursorState::WaitingForEvent);

    let old = h.engine.status(&first.cursor_id).unwrap();
    assert_eq!(old.state, CursorState::Stopped);
    assert_eq!(old.stop_reason.as_deref(), Some("moved to stage qualified"));
    assert_eq!(h.active_count(&lead.id), 1);
    assert_eq!(
        h.store.load_lead(&lead.id).unwrap().unwrap().stage.as_deref(),
        Some("qualified")
    );

    // The stopped cursor no longer listens
    assert_eq!(h.inbound("contact-1", "hola", at(6)).await, 1);
    assert_eq!(h.dispatcher.sent_contents(), vec!["bienvenido", "seguimos?"]);
}

#[tokio::test]
async fn test_moving_to_stage_without_sequence_leaves_no_cursor() {
    let h = harness();
    standard_pipeline(&h);
    let lead = lead("lead-1", "contact-1");
    h.engine.enroll_lead(&lead, t0()).await.unwrap();

    let started = h.engine.move_lead_to_stage(&lead.id, "lost", at(1)).await.unwrap();
    assert!(started.is_none());
    assert_eq!(h.active_count(&lead.id), 0);
    assert!(h.engine.active_cursor(&lead.id).unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_stage_is_rejected_without_side_effects() {
    let h = harness();
    standard_pipeline(&h);
    let lead = lead("lead-1", "contact-1");
    let first = h.engine.enroll_lead(&lead, t0()).await.unwrap().unwrap();

    let err = h
        .engine
        .move_lead_to_stage(&lead.id, "ghost", at(1))
        .await
        .unwrap_err();
    assert!(matches!(err, LeadflowError::StageNotFound { .. }));
    assert_eq!(
        h.engine.status(&first.cursor_id).unwrap().state,
        CursorState::WaitingForEvent
    );
}

#[tokio::test]
async fn test_reentry_is_ignored_by_default() {
    let h = harness();
    standard_pipeline(&h);
    let lead = lead("lead-1", "contact-1");
    let first = h.engine.enroll_lead(&lead, t0()).await.unwrap().unwrap();

    let again = h.engine.move_lead_to_stage(&lead.id, "new", at(1)).await.unwrap();
    assert!(again.is_none());
    let active = h.engine.active_cursor(&lead.id).unwrap().unwrap();
    assert_eq!(active.cursor_id, first.cursor_id);
}

#[tokio::test]
async fn test_reentry_restart_policy_starts_over() {
    let mut config = test_config();
    config.engine.reentry = ReentryPolicy::Restart;
    let h = harness_with(config, MockDispatcher::new());
    standard_pipeline(&h);
    let lead = lead("lead-1", "contact-1");
    let first = h.engine.enroll_lead(&lead, t0()).await.unwrap().unwrap();

    let again = h
        .engine
        .move_lead_to_stage(&lead.id, "new", at(1))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(again.cursor_id, first.cursor_id);
    assert_eq!(h.active_count(&lead.id), 1);
    assert_eq!(h.dispatcher.sent_contents(), vec!["bienvenido", "bienvenido"]);
}

#[tokio::test]
async fn test_stage_change_step_hands_off() {
    let h = harness();
    standard_pipeline(&h);
    h.save(sequence(
        "qualify",
        vec![message("q1", 0, "te paso con ventas"), stage_change("q2", 1, "qualified")],
    ));
    let lead = h.with_lead("lead-1", "contact-1");

    let first = h
        .engine
        .assign_sequence(&lead.id, &"qualify".into(), t0())
        .await
        .unwrap();
    // The status returned is the cursor the handoff started
    assert_eq!(first.sequence_id, SequenceId::from("followup"));
    assert_eq!(first.state, CursorState::WaitingForEvent);

    let all = h.store.cursors_for_lead(&lead.id).unwrap();
    let old = all.iter().find(|c| c.sequence_id.as_str() == "qualify").unwrap();
    assert_eq!(old.state, CursorState::Stopped);
    assert_eq!(old.position, 1);
    assert_eq!(h.active_count(&lead.id), 1);
    assert_eq!(
        h.store.load_lead(&lead.id).unwrap().unwrap().stage.as_deref(),
        Some("qualified")
    );
}

#[tokio::test]
async fn test_stage_change_to_unknown_stage_fails_cursor() {
    let h = harness();
    standard_pipeline(&h);
    h.save(sequence("bad", vec![stage_change("x", 0, "ghost")]));
    let lead = h.with_lead("lead-1", "contact-1");

    let status = h
        .engine
        .assign_sequence(&lead.id, &"bad".into(), t0())
        .await
        .unwrap();
    assert_eq!(status.state, CursorState::Stopped);
    let failure = status.failure.unwrap();
    assert_eq!(failure.position, 0);
    assert!(failure.reason.contains("ghost"));
}

#[tokio::test]
async fn test_handoff_ping_pong_is_bounded() {
    let h = harness();
    h.save(sequence("to-b", vec![stage_change("x", 0, "b")]));
    h.save(sequence("to-a", vec![stage_change("y", 0, "a")]));
    h.store
        .save_pipeline(&pipeline(vec![
            Stage::new("a").protected().with_sequence("to-b".into()),
            Stage::new("b").with_sequence("to-a".into()),
        ]))
        .unwrap();
    let lead = lead("lead-1", "contact-1");

    let last = h.engine.enroll_lead(&lead, t0()).await.unwrap().unwrap();
    assert_eq!(last.state, CursorState::Stopped);
    assert_eq!(
        last.failure.map(|f| f.reason).as_deref(),
        Some("handoff limit exceeded")
    );
    assert_eq!(h.active_count(&lead.id), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_moves_keep_one_active_cursor() {
    let h = harness();
    standard_pipeline(&h);
    let lead = lead("lead-1", "contact-1");
    h.engine.enroll_lead(&lead, t0()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = h.engine.clone();
        let lead_id = lead.id.clone();
        let stage = if i % 2 == 0 { "qualified" } else { "new" };
        handles.push(tokio::spawn(async move {
            engine.move_lead_to_stage(&lead_id, stage, at(i)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.active_count(&lead.id), 1);
}

#[tokio::test]
async fn test_pause_wins_over_timer() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence(
        "seq",
        vec![fixed_delay("p1", 0, 1.0), message("m1", 1, "hola")],
    ));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();

    let paused = h.engine.pause(&status.cursor_id, at(10)).await.unwrap();
    assert_eq!(paused.state, CursorState::Paused);

    assert_eq!(h.engine.tick(at(120)).await.unwrap(), 0);
    assert_eq!(
        h.engine.status(&status.cursor_id).unwrap().state,
        CursorState::Paused
    );
    assert!(h.dispatcher.sent().is_empty());

    // Resume re-executes the pause from the resume time
    let resumed = h.engine.resume(&status.cursor_id, at(120)).await.unwrap();
    assert_eq!(resumed.state, CursorState::WaitingForEvent);
    assert_eq!(resumed.position, 0);
    assert_eq!(resumed.due_at, Some(at(180)));

    assert_eq!(h.engine.tick(at(180)).await.unwrap(), 1);
    assert_eq!(h.dispatcher.sent_contents(), vec!["hola"]);
}

#[tokio::test]
async fn test_resume_requires_paused() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence("seq", vec![until_message("p1", 0)]));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();

    let err = h.engine.resume(&status.cursor_id, at(1)).await.unwrap_err();
    assert!(matches!(err, LeadflowError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_stop_is_terminal_and_discards_wakes() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence(
        "seq",
        vec![until_message("p1", 0), message("m1", 1, "hola")],
    ));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();

    let stopped = h.engine.stop(&status.cursor_id, at(1)).await.unwrap();
    assert_eq!(stopped.state, CursorState::Stopped);
    assert_eq!(h.inbound("contact-1", "hola", at(2)).await, 0);
    assert!(h.dispatcher.sent().is_empty());

    for result in [
        h.engine.stop(&status.cursor_id, at(3)).await,
        h.engine.pause(&status.cursor_id, at(3)).await,
        h.engine.resume(&status.cursor_id, at(3)).await,
    ] {
        assert!(matches!(result, Err(LeadflowError::InvalidTransition { .. })));
    }
}

#[tokio::test]
async fn test_dispatch_exhaustion_stops_cursor() {
    let h = harness_with(test_config(), MockDispatcher::always_failing());
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(message_pause_condition("seq"));

    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();
    assert_eq!(status.state, CursorState::Stopped);
    assert_eq!(h.dispatcher.attempts(), 3);
    let failure = status.failure.unwrap();
    assert_eq!(failure.position, 0);
    assert_eq!(failure.at, t0());
    assert!(failure.reason.contains("3 attempt"));

    let reloaded = h.engine.status(&status.cursor_id).unwrap();
    assert_eq!(reloaded.state, CursorState::Stopped);
    assert!(reloaded.failure.is_some());
}

#[tokio::test]
async fn test_transient_dispatch_failure_is_retried() {
    let h = harness_with(test_config(), MockDispatcher::failing(1));
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(message_pause_condition("seq"));

    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();
    assert_eq!(status.state, CursorState::WaitingForEvent);
    assert_eq!(h.dispatcher.sent_contents(), vec!["hola"]);
}

#[tokio::test]
async fn test_backward_loop_hits_step_budget() {
    let mut config = test_config();
    config.engine.max_steps_per_run = 10;
    let h = harness_with(config, MockDispatcher::new());
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence(
        "loop",
        vec![
            message("m1", 0, "hola?"),
            condition("c1", 1, ConditionType::IfResponded, &[], None, Some("m1")),
        ],
    ));

    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();
    assert_eq!(status.state, CursorState::Stopped);
    assert_eq!(
        status.failure.map(|f| f.reason).as_deref(),
        Some("step budget exhausted")
    );
    assert_eq!(h.dispatcher.sent().len(), 5);
}

#[tokio::test]
async fn test_assign_replaces_active_cursor() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let a = h.save(sequence("a", vec![until_message("p", 0)]));
    let b = h.save(sequence("b", vec![until_message("p", 0)]));

    let first = h.engine.assign_sequence(&lead.id, &a, t0()).await.unwrap();
    let second = h.engine.assign_sequence(&lead.id, &b, at(1)).await.unwrap();

    assert_eq!(h.engine.status(&first.cursor_id).unwrap().state, CursorState::Stopped);
    assert_eq!(second.state, CursorState::WaitingForEvent);
    assert_eq!(h.active_count(&lead.id), 1);
}

#[tokio::test]
async fn test_assign_rejects_inactive_and_missing_sequences() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let mut inactive = sequence("off", vec![message("m", 0, "x")]);
    inactive.active = false;
    let off = h.save(inactive);

    assert!(matches!(
        h.engine.assign_sequence(&lead.id, &off, t0()).await,
        Err(LeadflowError::SequenceInactive(_))
    ));
    assert!(matches!(
        h.engine.assign_sequence(&lead.id, &"ghost".into(), t0()).await,
        Err(LeadflowError::SequenceNotFound(_))
    ));
    assert!(matches!(
        h.engine.assign_sequence(&"nobody".into(), &off, t0()).await,
        Err(LeadflowError::LeadNotFound(_))
    ));
}

#[tokio::test]
async fn test_deleted_contact_condition_is_false() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(message_pause_condition("seq"));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();

    h.store.delete_contact(&lead.contact_id).unwrap();
    assert_eq!(h.engine.tick(at(60)).await.unwrap(), 1);

    // if_responded evaluated false: the nudge went out
    assert_eq!(h.dispatcher.sent_contents(), vec!["hola", "nudge"]);
    assert_eq!(
        h.engine.status(&status.cursor_id).unwrap().state,
        CursorState::Completed
    );
}

#[tokio::test]
async fn test_recovery_restores_timers() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(message_pause_condition("seq"));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();

    // A fresh engine over the same store has no cached timers until it recovers
    let restarted = h.second_engine();
    assert_eq!(restarted.next_due(), None);

    let report = restarted.recover(at(60)).await.unwrap();
    assert_eq!(report.rescheduled, 1);
    assert_eq!(report.redriven, 0);
    assert_eq!(restarted.next_due(), Some(at(60)));

    assert_eq!(restarted.tick(at(60)).await.unwrap(), 1);
    assert_eq!(
        restarted.status(&status.cursor_id).unwrap().state,
        CursorState::Completed
    );
}

#[tokio::test]
async fn test_recovery_redrives_running_cursors() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence("seq", vec![message("m1", 0, "hola")]));

    // Simulate a crash right after the cursor was created
    let cursor = Cursor::start(&lead, seq.clone(), t0());
    h.store.insert_cursor(&cursor).unwrap();

    let report = h.engine.recover(at(1)).await.unwrap();
    assert_eq!(report.redriven, 1);
    assert_eq!(h.dispatcher.sent_contents(), vec!["hola"]);
    assert_eq!(h.engine.status(&cursor.id).unwrap().state, CursorState::Completed);
}

#[tokio::test]
async fn test_activity_log_and_events() {
    let h = harness();
    let mut events = h.engine.subscribe();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(message_pause_condition("seq"));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();

    let kinds: Vec<String> = h
        .engine
        .log(&status.cursor_id)
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec!["started", "message", "pause", "waiting"]);

    match events.recv().await.unwrap() {
        EngineEvent::CursorStarted { lead_id, .. } => assert_eq!(lead_id, lead.id),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_positions_always_index_a_step() {
    let h = harness();
    standard_pipeline(&h);
    let lead = lead("lead-1", "contact-1");
    h.engine.enroll_lead(&lead, t0()).await.unwrap();
    h.inbound("contact-1", "hola", at(1)).await;
    h.engine.move_lead_to_stage(&lead.id, "qualified", at(2)).await.unwrap();
    h.inbound("contact-1", "si", at(3)).await;

    for cursor in h.store.cursors_for_lead(&lead.id).unwrap() {
        let sequence = h.store.load_sequence(&cursor.sequence_id).unwrap().unwrap();
        assert!(cursor.position < sequence.len(), "{:?}", cursor);
    }
}

#[tokio::test]
async fn test_worker_fires_timer_set_by_another_engine() {
    let h = harness();
    let worker = h.second_engine();
    worker.recover(t0()).await.unwrap();

    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence(
        "seq",
        vec![fixed_delay("p1", 0, 1.0), message("m1", 1, "hola")],
    ));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();
    assert_eq!(status.state, CursorState::WaitingForEvent);

    assert_eq!(worker.tick(at(59)).await.unwrap(), 0);
    assert_eq!(worker.tick(at(300)).await.unwrap(), 1);
    assert_eq!(h.dispatcher.sent_contents(), vec!["hola"]);
    assert_eq!(
        worker.status(&status.cursor_id).unwrap().state,
        CursorState::Completed
    );

    // The assigning engine's cached timer is stale by now
    assert_eq!(h.engine.tick(at(301)).await.unwrap(), 0);
    assert_eq!(h.dispatcher.sent().len(), 1);
}

#[tokio::test]
async fn test_worker_delivers_inbound_to_cursor_of_another_engine() {
    let h = harness();
    let worker = h.second_engine();
    worker.recover(t0()).await.unwrap();

    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence(
        "seq",
        vec![until_message("p1", 0), message("m1", 1, "gracias")],
    ));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();

    let woken = worker
        .handle_inbound(&MessageEvent::inbound("contact-1".into(), "hola", at(5)))
        .await
        .unwrap();
    assert_eq!(woken, 1);
    assert_eq!(h.dispatcher.sent_contents(), vec!["gracias"]);
    assert_eq!(
        h.engine.status(&status.cursor_id).unwrap().state,
        CursorState::Completed
    );
}

#[tokio::test]
async fn test_timer_for_deleted_sequence_fails_cursor() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence(
        "seq",
        vec![fixed_delay("p1", 0, 1.0), message("m1", 1, "hola")],
    ));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();
    h.store.delete_sequence(&seq).unwrap();

    assert_eq!(h.engine.tick(at(120)).await.unwrap(), 0);

    let reloaded = h.engine.status(&status.cursor_id).unwrap();
    assert_eq!(reloaded.state, CursorState::Stopped);
    let failure = reloaded.failure.expect("failure recorded");
    assert!(failure.reason.contains("Sequence not found"), "{}", failure.reason);
    assert_eq!(failure.at, at(120));

    // Nothing left to fire
    assert!(h.store.due_cursors(at(180)).unwrap().is_empty());
    assert_eq!(h.engine.tick(at(180)).await.unwrap(), 0);
    assert!(h.dispatcher.sent().is_empty());
}

#[tokio::test]
async fn test_inbound_for_cursor_off_its_pause_fails_cursor() {
    let h = harness();
    let lead = h.with_lead("lead-1", "contact-1");
    let seq = h.save(sequence(
        "seq",
        vec![until_message("p1", 0), message("m1", 1, "hola")],
    ));
    let status = h.engine.assign_sequence(&lead.id, &seq, t0()).await.unwrap();

    // Edited under the waiting cursor: position 0 is now a message
    h.save(sequence(
        "seq",
        vec![message("m0", 0, "editado"), message("m1", 1, "hola")],
    ));

    assert_eq!(h.inbound("contact-1", "hola", at(5)).await, 0);

    let reloaded = h.engine.status(&status.cursor_id).unwrap();
    assert_eq!(reloaded.state, CursorState::Stopped);
    let failure = reloaded.failure.expect("failure recorded");
    assert!(failure.reason.contains("not a pause step"), "{}", failure.reason);
    assert!(h.store.listening_cursors(&lead.id).unwrap().is_empty());
    assert!(h.dispatcher.sent().is_empty());
}
