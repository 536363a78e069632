use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::{debug, info};

use leadflow_core::config::WebhookConfig;
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::MessageDispatcher;
use leadflow_core::types::{ContactId, OutboundPayload};

/// POSTs each outbound message as JSON to a configured URL.
///
/// Any non-2xx status counts as a failed delivery.
pub struct WebhookDispatcher {
    http: Client,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| LeadflowError::Config(format!("webhook client: {e}")))?;
        Ok(Self { http, config })
    }
}

impl MessageDispatcher for WebhookDispatcher {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send<'a>(
        &'a self,
        contact: &'a ContactId,
        payload: &'a OutboundPayload,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let body = serde_json::json!({
                "contact_id": contact,
                "content": payload.content,
                "media": payload.media,
            });

            let mut request = self.http.post(&self.config.url).json(&body);
            for (name, value) in &self.config.headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request.send().await.map_err(|e| LeadflowError::Dispatch {
                attempts: 1,
                message: format!("webhook request failed: {e}"),
            })?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(LeadflowError::Dispatch {
                    attempts: 1,
                    message: format!("webhook returned {status}: {}", truncate(&text, 200)),
                });
            }

            debug!(contact_id = %contact, status = %status, "Webhook delivered");
            Ok(())
        })
    }
}

/// Logs outbound messages instead of sending them.
pub struct DryRunDispatcher;

impl MessageDispatcher for DryRunDispatcher {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn send<'a>(
        &'a self,
        contact: &'a ContactId,
        payload: &'a OutboundPayload,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            info!(
                contact_id = %contact,
                media = payload.media.len(),
                content = truncate(&payload.content, 120),
                "Dry run: message not sent"
            );
            Ok(())
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
