use tracing::warn;

use leadflow_core::error::Result;
use leadflow_core::text;
use leadflow_core::traits::MessageStore;
use leadflow_core::types::{ConditionSpec, ConditionType, Cursor};

/// Evaluates condition steps against a contact's message history.
///
/// Only inbound messages with `timestamp >= cursor.started_at` count, so the
/// answer depends on the stored history and nothing else.
pub struct ConditionEvaluator<'a> {
    messages: &'a dyn MessageStore,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(messages: &'a dyn MessageStore) -> Self {
        Self { messages }
    }

    /// Evaluate, resolving any lookup error to `false`.
    pub fn evaluate(&self, cursor: &Cursor, condition: &ConditionSpec) -> bool {
        match self.try_evaluate(cursor, condition) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    cursor_id = %cursor.id,
                    contact_id = %cursor.contact_id,
                    condition = ?condition.condition_type,
                    error = %e,
                    "Condition evaluation failed, treating as false"
                );
                false
            }
        }
    }

    pub fn try_evaluate(&self, cursor: &Cursor, condition: &ConditionSpec) -> Result<bool> {
        let since = cursor.started_at;
        match condition.condition_type {
            ConditionType::IfMessageContains => {
                let last = self.messages.last_inbound_since(&cursor.contact_id, since)?;
                Ok(last.is_some_and(|m| text::contains_any(&m.body, &condition.condition_keywords)))
            }
            ConditionType::IfResponded => self.messages.has_inbound_since(&cursor.contact_id, since),
            ConditionType::IfNotResponded => self
                .messages
                .has_inbound_since(&cursor.contact_id, since)
                .map(|responded| !responded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use leadflow_core::error::LeadflowError;
    use leadflow_core::traits::FlowStore;
    use leadflow_core::types::*;
    use leadflow_store::SqliteStore;
    use leadflow_test_utils::{fixtures, t0};

    fn spec(condition_type: ConditionType, keywords: &[&str]) -> ConditionSpec {
        ConditionSpec {
            condition_type,
            condition_keywords: keywords.iter().map(|k| k.to_string()).collect(),
            next_if_true: Some("t".into()),
            next_if_false: Some("f".into()),
        }
    }

    fn setup() -> (SqliteStore, Cursor) {
        let store = SqliteStore::in_memory().unwrap();
        let lead = fixtures::lead("lead-1", "contact-1");
        store.save_lead(&lead).unwrap();
        let cursor = Cursor::start(&lead, "seq".into(), t0());
        (store, cursor)
    }

    fn inbound(store: &SqliteStore, cursor: &Cursor, body: &str, minutes: i64) {
        store
            .record_message(&MessageEvent::inbound(
                cursor.contact_id.clone(),
                body,
                t0() + Duration::minutes(minutes),
            ))
            .unwrap();
    }

    #[test]
    fn test_message_contains_accent_insensitive() {
        let (store, cursor) = setup();
        let eval = ConditionEvaluator::new(&store);
        let cond = spec(ConditionType::IfMessageContains, &["si", "sí"]);

        inbound(&store, &cursor, "Sí, me interesa", 1);
        assert!(eval.evaluate(&cursor, &cond));

        inbound(&store, &cursor, "no gracias", 2);
        assert!(!eval.evaluate(&cursor, &cond));
    }

    #[test]
    fn test_message_contains_only_reads_latest() {
        let (store, cursor) = setup();
        let eval = ConditionEvaluator::new(&store);
        inbound(&store, &cursor, "precio?", 1);
        inbound(&store, &cursor, "ok", 2);
        assert!(!eval.evaluate(&cursor, &spec(ConditionType::IfMessageContains, &["precio"])));
    }

    #[test]
    fn test_responded_ignores_history_before_start() {
        let (store, cursor) = setup();
        let eval = ConditionEvaluator::new(&store);
        inbound(&store, &cursor, "old reply", -30);

        assert!(!eval.evaluate(&cursor, &spec(ConditionType::IfResponded, &[])));
        assert!(eval.evaluate(&cursor, &spec(ConditionType::IfNotResponded, &[])));

        inbound(&store, &cursor, "new reply", 5);
        assert!(eval.evaluate(&cursor, &spec(ConditionType::IfResponded, &[])));
        assert!(!eval.evaluate(&cursor, &spec(ConditionType::IfNotResponded, &[])));
    }

    #[test]
    fn test_outbound_messages_do_not_count() {
        let (store, cursor) = setup();
        store
            .record_message(&MessageEvent::outbound(cursor.contact_id.clone(), "hola", t0()))
            .unwrap();
        let eval = ConditionEvaluator::new(&store);
        assert!(!eval.evaluate(&cursor, &spec(ConditionType::IfResponded, &[])));
    }

    #[test]
    fn test_deleted_contact_evaluates_false() {
        let (store, cursor) = setup();
        inbound(&store, &cursor, "si", 1);
        store.delete_contact(&cursor.contact_id).unwrap();
        let eval = ConditionEvaluator::new(&store);

        let cond = spec(ConditionType::IfNotResponded, &[]);
        assert!(matches!(
            eval.try_evaluate(&cursor, &cond),
            Err(LeadflowError::ContactNotFound(_))
        ));
        assert!(!eval.evaluate(&cursor, &cond));
    }

    #[test]
    fn test_reevaluation_is_stable() {
        let (store, cursor) = setup();
        inbound(&store, &cursor, "precio", 1);
        let eval = ConditionEvaluator::new(&store);
        let cond = spec(ConditionType::IfMessageContains, &["PRECIO"]);
        let first = eval.evaluate(&cursor, &cond);
        assert!(first);
        assert_eq!(eval.evaluate(&cursor, &cond), first);
    }
}
