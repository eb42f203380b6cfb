use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::dto::webhook_dto::{WebhookMetadata, WebhookPayload};
use crate::error::Result;
use crate::models::event::EventType;
use crate::utils::time::to_iso_millis;

/// An envelope together with the exact bytes that get signed and sent.
#[derive(Debug, Clone)]
pub struct PreparedPayload {
    pub envelope: WebhookPayload,
    pub body: String,
}

impl PreparedPayload {
    pub fn event(&self) -> EventType {
        self.envelope.event
    }

    /// JSON form stored with delivery records.
    pub fn as_json(&self) -> JsonValue {
        serde_json::from_str(&self.body).unwrap_or(JsonValue::Null)
    }

    /// Rebuilds from a body previously produced by [`build_payload`].
    pub fn from_body(body: String) -> Result<Self> {
        let envelope: WebhookPayload = serde_json::from_str(&body)?;
        Ok(Self { envelope, body })
    }
}

pub fn build_payload(
    event: EventType,
    data: JsonValue,
    metadata: Option<WebhookMetadata>,
    at: DateTime<Utc>,
) -> Result<PreparedPayload> {
    let envelope = WebhookPayload {
        event,
        timestamp: to_iso_millis(at),
        data,
        metadata,
    };
    let body = serde_json::to_string(&envelope)?;
    Ok(PreparedPayload { envelope, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn envelope_fields_are_in_canonical_order() {
        let prepared = build_payload(
            EventType::LeadFormSubmit,
            json!({ "phone": "+5511999990000", "name": "Ana" }),
            Some(WebhookMetadata::with_page_url("https://kennel.example.com/")),
            fixed_time(),
        )
        .unwrap();
        assert_eq!(
            prepared.body,
            r#"{"event":"lead_form_submit","timestamp":"2026-03-01T09:00:00.000Z","data":{"name":"Ana","phone":"+5511999990000"},"metadata":{"page_url":"https://kennel.example.com/"}}"#
        );
    }

    #[test]
    fn same_input_serializes_identically() {
        let data = json!({ "b": 1, "a": [1, 2, 3] });
        let first = build_payload(EventType::WhatsAppClick, data.clone(), None, fixed_time()).unwrap();
        let second = build_payload(EventType::WhatsAppClick, data, None, fixed_time()).unwrap();
        assert_eq!(first.body, second.body);
        assert!(!first.body.contains("metadata"));
    }

    #[test]
    fn round_trips_through_stored_body() {
        let prepared = build_payload(
            EventType::PuppyReservation,
            json!({ "puppy_id": "spitz-07" }),
            None,
            fixed_time(),
        )
        .unwrap();
        let restored = PreparedPayload::from_body(prepared.body.clone()).unwrap();
        assert_eq!(restored.envelope, prepared.envelope);
        assert_eq!(restored.event(), EventType::PuppyReservation);
        assert_eq!(restored.as_json()["data"]["puppy_id"], "spitz-07");
    }
}
