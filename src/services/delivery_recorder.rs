use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::models::event::EventType;
use crate::models::webhook_delivery::{DeliveryRecord, DeliveryStatus, NewDeliveryRecord};
use crate::services::retry_scheduler::DeliveryOutcome;
use crate::services::webhook_store::WebhookStore;
use crate::utils::time::now;

/// Writes exactly one record per finished pipeline.
#[derive(Clone)]
pub struct DeliveryRecorder {
    store: Arc<dyn WebhookStore>,
}

impl DeliveryRecorder {
    pub fn new(store: Arc<dyn WebhookStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        webhook_id: Uuid,
        event: EventType,
        payload: JsonValue,
        outcome: &DeliveryOutcome,
    ) -> Result<DeliveryRecord> {
        self.store
            .persist_delivery_record(new_record(webhook_id, event, payload, outcome))
            .await
    }
}

fn new_record(
    webhook_id: Uuid,
    event: EventType,
    payload: JsonValue,
    outcome: &DeliveryOutcome,
) -> NewDeliveryRecord {
    let at = now();
    let (delivered_at, failed_at) = match outcome.status {
        DeliveryStatus::Success => (Some(at), None),
        DeliveryStatus::Failed => (None, Some(at)),
    };
    NewDeliveryRecord {
        webhook_id,
        event: event.as_str().to_string(),
        payload,
        status: outcome.status,
        response_status: outcome.response_status.map(i32::from),
        response_body: outcome.body_excerpt.clone(),
        error: outcome.error.clone(),
        attempts: outcome.attempts.max(1) as i32,
        delivered_at,
        failed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_outcome_sets_failed_at_only() {
        let outcome = DeliveryOutcome {
            status: DeliveryStatus::Failed,
            attempts: 3,
            response_status: Some(500),
            body_excerpt: Some("boom".into()),
            error: Some("HTTP 500".into()),
        };
        let record = new_record(Uuid::nil(), EventType::LeadFormSubmit, json!({}), &outcome);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.response_status, Some(500));
        assert_eq!(record.event, "lead_form_submit");
        assert!(record.delivered_at.is_none());
        assert!(record.failed_at.is_some());
    }

    #[test]
    fn success_outcome_sets_delivered_at_only() {
        let outcome = DeliveryOutcome {
            status: DeliveryStatus::Success,
            attempts: 2,
            response_status: Some(204),
            body_excerpt: Some(String::new()),
            error: None,
        };
        let record = new_record(Uuid::nil(), EventType::WhatsAppClick, json!({}), &outcome);
        assert_eq!(record.status, DeliveryStatus::Success);
        assert!(record.delivered_at.is_some());
        assert!(record.failed_at.is_none());
        assert!(record.error.is_none());
    }
}
