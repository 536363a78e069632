use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::MessageDispatcher;
use leadflow_core::types::{ContactId, OutboundPayload};

/// Dispatcher that records every delivered payload and can fail on demand.
#[derive(Default)]
pub struct MockDispatcher {
    sent: Mutex<Vec<(ContactId, OutboundPayload)>>,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends, then succeed.
    pub fn failing(n: u32) -> Self {
        let mock = Self::default();
        mock.failures_left.store(n, Ordering::SeqCst);
        mock
    }

    /// Fail every send.
    pub fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    /// Successfully delivered payloads, in order.
    pub fn sent(&self) -> Vec<(ContactId, OutboundPayload)> {
        self.sent.lock().unwrap().clone()
    }

    /// Delivered contents only.
    pub fn sent_contents(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, p)| p.content).collect()
    }

    /// Total send calls, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl MessageDispatcher for MockDispatcher {
    fn name(&self) -> &str {
        "mock"
    }

    fn send<'a>(
        &'a self,
        contact: &'a ContactId,
        payload: &'a OutboundPayload,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                if left != u32::MAX {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                }
                return Err(LeadflowError::Dispatch {
                    attempts: 1,
                    message: "mock failure".into(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((contact.clone(), payload.clone()));
            Ok(())
        })
    }
}
