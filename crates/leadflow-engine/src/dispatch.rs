use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use leadflow_core::config::RetryConfig;
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::MessageDispatcher;
use leadflow_core::types::{ContactId, OutboundPayload};

/// Wraps a dispatcher with bounded exponential backoff.
pub struct RetryingDispatcher {
    inner: Arc<dyn MessageDispatcher>,
    retry_config: RetryConfig,
}

impl RetryingDispatcher {
    pub fn new(inner: Arc<dyn MessageDispatcher>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Send, retrying failures up to `max_attempts` total attempts.
    pub async fn send(&self, contact: &ContactId, payload: &OutboundPayload) -> Result<()> {
        let max_attempts = self.retry_config.max_attempts.max(1);
        let mut last_err = String::new();

        for attempt in 0..max_attempts {
            match self.inner.send(contact, payload).await {
                Ok(()) => {
                    debug!(
                        dispatcher = self.inner.name(),
                        contact_id = %contact,
                        attempt = attempt + 1,
                        "Message dispatched"
                    );
                    return Ok(());
                }
                Err(e) => {
                    last_err = e.to_string();
                    if attempt + 1 < max_attempts {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            dispatcher = self.inner.name(),
                            contact_id = %contact,
                            attempt = attempt + 1,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Dispatch failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        error!(
            dispatcher = self.inner.name(),
            contact_id = %contact,
            attempts = max_attempts,
            error = %last_err,
            "Dispatch failed, giving up"
        );
        Err(LeadflowError::Dispatch {
            attempts: max_attempts,
            message: last_err,
        })
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
