use std::sync::Arc;

use crate::error::Result;
use crate::models::webhook::{CounterDelta, Subscriber, SubscriberCounters, SubscriberStatus};
use crate::services::retry_scheduler::DeliveryOutcome;
use crate::services::webhook_store::WebhookStore;
use crate::utils::time::now;

pub const DEFAULT_DISABLE_THRESHOLD: i32 = 10;

/// Lifetime success/error tallies plus the permanent auto-disable.
///
/// The error count is cumulative and never reset by a success; once it
/// reaches the threshold the subscriber stays `disabled` until an admin
/// re-enables it.
#[derive(Clone)]
pub struct HealthTracker {
    store: Arc<dyn WebhookStore>,
    disable_threshold: i32,
}

impl HealthTracker {
    pub fn new(store: Arc<dyn WebhookStore>, disable_threshold: i32) -> Self {
        Self {
            store,
            disable_threshold: disable_threshold.max(1),
        }
    }

    pub async fn on_outcome(
        &self,
        subscriber: &Subscriber,
        outcome: &DeliveryOutcome,
    ) -> Result<SubscriberCounters> {
        if outcome.is_success() {
            return self
                .store
                .update_subscriber_counters(subscriber.id, CounterDelta::success_at(now()))
                .await;
        }

        let mut counters = self
            .store
            .update_subscriber_counters(subscriber.id, CounterDelta::failure())
            .await?;

        if counters.error_count >= self.disable_threshold
            && counters.status == SubscriberStatus::Active
            && self
                .store
                .disable_subscriber(subscriber.id, SubscriberStatus::Disabled)
                .await?
        {
            tracing::warn!(
                target: "webhook_delivery",
                subscriber_id = %subscriber.id,
                url = %subscriber.url,
                error_count = counters.error_count,
                threshold = self.disable_threshold,
                "Auto-disabling webhook after repeated delivery failures"
            );
            counters.status = SubscriberStatus::Disabled;
        }

        Ok(counters)
    }
}
