use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;
use crate::models::event::EventType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberStatus {
    Active,
    Error,
    Disabled,
}

impl SubscriberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberStatus::Active => "active",
            SubscriberStatus::Error => "error",
            SubscriberStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for SubscriberStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriberStatus::Active),
            "error" => Ok(SubscriberStatus::Error),
            "disabled" => Ok(SubscriberStatus::Disabled),
            other => Err(Error::Internal(format!("unknown webhook status: {}", other))),
        }
    }
}

/// A webhook registration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub events: Vec<String>,
    pub status: SubscriberStatus,
    pub success_count: i32,
    pub error_count: i32,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Subscriber {
    pub fn is_active(&self) -> bool {
        self.status == SubscriberStatus::Active
    }

    pub fn listens_to(&self, event: EventType) -> bool {
        self.events.iter().any(|e| e == event.as_str())
    }

    pub fn has_http_url(&self) -> bool {
        url::Url::parse(&self.url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false)
    }
}

/// Increments applied in one statement, never read-then-written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub success: i32,
    pub error: i32,
    pub triggered_at: Option<DateTime<Utc>>,
}

impl CounterDelta {
    pub fn success_at(at: DateTime<Utc>) -> Self {
        Self {
            success: 1,
            error: 0,
            triggered_at: Some(at),
        }
    }

    pub fn failure() -> Self {
        Self {
            success: 0,
            error: 1,
            triggered_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscriberCounters {
    pub success_count: i32,
    pub error_count: i32,
    pub status: SubscriberStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(url: &str) -> Subscriber {
        Subscriber {
            id: Uuid::new_v4(),
            name: "crm".into(),
            url: url.into(),
            secret: "s3cret".into(),
            events: vec!["lead_form_submit".into()],
            status: SubscriberStatus::Active,
            success_count: 0,
            error_count: 0,
            last_triggered_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn only_http_schemes_are_deliverable() {
        assert!(subscriber("https://crm.example.com/hooks").has_http_url());
        assert!(subscriber("http://localhost:8080/in").has_http_url());
        assert!(!subscriber("ftp://files.example.com").has_http_url());
        assert!(!subscriber("not a url").has_http_url());
    }

    #[test]
    fn event_filter_matches_wire_name() {
        let sub = subscriber("https://crm.example.com/hooks");
        assert!(sub.listens_to(EventType::LeadFormSubmit));
        assert!(!sub.listens_to(EventType::PuppyReservation));
    }

    #[test]
    fn secret_is_never_serialized() {
        let json = serde_json::to_value(subscriber("https://crm.example.com")).unwrap();
        assert!(json.get("secret").is_none());
        assert_eq!(json["status"], "active");
    }
}
