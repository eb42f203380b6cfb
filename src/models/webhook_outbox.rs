use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::models::webhook_delivery::DeliveryStatus;

/// Terminal result parked on the row until the delivery record is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxOutcome {
    pub status: DeliveryStatus,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub error: Option<String>,
}

/// A pipeline that has started but not yet written its delivery record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event: String,
    /// Exact bytes that were signed and sent.
    pub body: String,
    pub max_attempts: i32,
    pub attempts: i32,
    pub timeout_ms: i64,
    pub locked_until: DateTime<Utc>,
    /// Set once the last attempt has finished; the row must not be re-sent.
    pub outcome: Option<OutboxOutcome>,
    /// Subscriber counters already include `outcome`.
    pub counted: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn remaining_attempts(&self) -> i32 {
        (self.max_attempts - self.attempts).max(0)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub webhook_id: Uuid,
    pub event: String,
    pub body: String,
    pub max_attempts: i32,
    pub timeout_ms: i64,
    pub lease: Duration,
}
