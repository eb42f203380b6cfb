use std::str::FromStr;

use crate::error::Result;
use crate::models::event::EventType;
use crate::services::dispatcher::{Dispatched, EventDispatcher};

pub const DEFAULT_SWEEP_BATCH: i64 = 50;

/// Re-drives deliveries whose pipeline died before writing a record.
#[derive(Clone)]
pub struct OutboxSweeper {
    dispatcher: EventDispatcher,
    batch_size: i64,
}

impl OutboxSweeper {
    pub fn new(dispatcher: EventDispatcher) -> Self {
        Self {
            dispatcher,
            batch_size: DEFAULT_SWEEP_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Claims expired outbox leases. Entries whose last attempt already ran
    /// are settled without sending; the rest resume with the attempts they
    /// have left. Returns the handles of the resumed pipelines.
    pub async fn run_once(&self) -> Result<Dispatched> {
        let store = self.dispatcher.store();
        let lease = self.dispatcher.settings().lease_margin;
        let entries = store.claim_stale_outbox(self.batch_size, lease).await?;

        let mut resumed = Dispatched::default();
        for entry in entries {
            if EventType::from_str(&entry.event).is_err() {
                store.complete_outbox(entry.id).await?;
                continue;
            }

            if self.dispatcher.is_live(entry.id) {
                tracing::debug!(
                    target: "webhook_delivery",
                    outbox_id = %entry.id,
                    "Outbox entry still owned by a running pipeline"
                );
                continue;
            }

            let Some(subscriber) = store.find_subscriber(entry.webhook_id).await? else {
                tracing::info!(
                    target: "webhook_delivery",
                    outbox_id = %entry.id,
                    subscriber_id = %entry.webhook_id,
                    "Dropping outbox entry for deleted webhook"
                );
                store.complete_outbox(entry.id).await?;
                continue;
            };

            if let Some(parked) = &entry.outcome {
                if let Err(e) = self.dispatcher.settle(&subscriber, &entry, parked).await {
                    tracing::error!(
                        target: "webhook_delivery",
                        outbox_id = %entry.id,
                        error = %e,
                        "Outbox entry body is unreadable, dropping it"
                    );
                    store.complete_outbox(entry.id).await?;
                }
                continue;
            }

            if !subscriber.is_active() || !subscriber.has_http_url() {
                tracing::info!(
                    target: "webhook_delivery",
                    outbox_id = %entry.id,
                    subscriber_id = %subscriber.id,
                    "Dropping outbox entry for inactive webhook"
                );
                store.complete_outbox(entry.id).await?;
                continue;
            }

            if entry.remaining_attempts() == 0 {
                self.dispatcher.close_exhausted(&subscriber, &entry).await?;
                continue;
            }

            tracing::info!(
                target: "webhook_delivery",
                outbox_id = %entry.id,
                subscriber_id = %subscriber.id,
                attempts = entry.attempts,
                max_attempts = entry.max_attempts,
                "Resuming interrupted webhook delivery"
            );
            let subscriber_id = subscriber.id;
            let entry_id = entry.id;
            match self.dispatcher.resume(subscriber, entry) {
                Ok(handle) => resumed.push(subscriber_id, handle),
                Err(e) => {
                    tracing::error!(
                        target: "webhook_delivery",
                        outbox_id = %entry_id,
                        error = %e,
                        "Outbox entry body is unreadable, dropping it"
                    );
                    store.complete_outbox(entry_id).await?;
                }
            }
        }
        Ok(resumed)
    }
}
