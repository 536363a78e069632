use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use leadflow_core::error::Result;
use leadflow_core::types::MessageEvent;

use crate::engine::FlowEngine;

/// Drives the engine in the background: fires timers, feeds inbound
/// messages, and exits when cancelled.
pub struct FlowRunner {
    engine: Arc<FlowEngine>,
    inbound: mpsc::Receiver<MessageEvent>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl FlowRunner {
    /// Create a runner and the sender half for inbound messages.
    pub fn new(
        engine: Arc<FlowEngine>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Sender<MessageEvent>) {
        let config = engine.config();
        let (tx, rx) = mpsc::channel(config.inbound_buffer.max(1));
        let poll_interval = Duration::from_secs(config.poll_interval_secs.max(1));
        (
            Self {
                engine,
                inbound: rx,
                cancel,
                poll_interval,
            },
            tx,
        )
    }

    /// Recover persisted state, then loop until cancelled.
    pub async fn run(mut self) -> Result<()> {
        self.engine.recover(Utc::now()).await?;
        info!(poll_secs = self.poll_interval.as_secs(), "Flow runner started");

        let mut inbound_open = true;
        loop {
            let now = Utc::now();
            match self.engine.tick(now).await {
                Ok(0) => {}
                Ok(woken) => debug!(woken, "Timers fired"),
                Err(e) => error!(error = %e, "Scheduler tick failed"),
            }

            let delay = self
                .engine
                .next_due()
                .and_then(|due| (due - Utc::now()).to_std().ok())
                .map(|d| d.min(self.poll_interval))
                .unwrap_or(self.poll_interval);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Flow runner stopped");
                    return Ok(());
                }
                message = self.inbound.recv(), if inbound_open => {
                    match message {
                        Some(message) => {
                            if let Err(e) = self.engine.handle_inbound(&message).await {
                                error!(contact_id = %message.contact_id, error = %e, "Inbound message failed");
                            }
                        }
                        None => {
                            debug!("Inbound channel closed");
                            inbound_open = false;
                        }
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
