use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::models::event::EventType;
use crate::models::webhook_delivery::DeliveryRecord;

/// Envelope posted to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: EventType,
    pub timestamp: String,
    pub data: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WebhookMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl WebhookMetadata {
    pub fn with_page_url(page_url: impl Into<String>) -> Self {
        Self {
            page_url: Some(page_url.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTestResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryListResponse {
    pub deliveries: Vec<DeliveryRecord>,
    pub total: usize,
}

impl From<Vec<DeliveryRecord>> for DeliveryListResponse {
    fn from(deliveries: Vec<DeliveryRecord>) -> Self {
        let total = deliveries.len();
        Self { deliveries, total }
    }
}
