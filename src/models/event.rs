use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Business occurrences that webhook subscribers can listen to.
///
/// Subscriptions store event names as plain strings; unknown names fail to
/// parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "lead_form_submit")]
    LeadFormSubmit,
    #[serde(rename = "puppy_reservation")]
    PuppyReservation,
    #[serde(rename = "whatsapp_click")]
    WhatsAppClick,
    #[serde(rename = "test_event")]
    TestEvent,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::LeadFormSubmit,
        EventType::PuppyReservation,
        EventType::WhatsAppClick,
        EventType::TestEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::LeadFormSubmit => "lead_form_submit",
            EventType::PuppyReservation => "puppy_reservation",
            EventType::WhatsAppClick => "whatsapp_click",
            EventType::TestEvent => "test_event",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        EventType::ALL
            .into_iter()
            .find(|event| event.as_str() == name)
            .ok_or_else(|| {
                tracing::warn!(event = %name, "Rejected unknown webhook event type");
                Error::UnknownEvent(name.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_known_event() {
        for event in EventType::ALL {
            assert_eq!(event.as_str().parse::<EventType>().unwrap(), event);
        }
    }

    #[test]
    fn rejects_typos() {
        let err = "lead_form_sumbit".parse::<EventType>().unwrap_err();
        assert!(matches!(err, Error::UnknownEvent(name) if name == "lead_form_sumbit"));
    }

    #[test]
    fn serializes_with_wire_names() {
        let json = serde_json::to_string(&EventType::WhatsAppClick).unwrap();
        assert_eq!(json, "\"whatsapp_click\"");
    }
}
