//! Shared fixtures: an in-memory `WebhookStore` and wiremock responders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;
use wiremock::{Request, Respond, ResponseTemplate};

use storefront_webhooks::error::{Error, Result};
use storefront_webhooks::models::event::EventType;
use storefront_webhooks::models::webhook::{
    CounterDelta, Subscriber, SubscriberCounters, SubscriberStatus,
};
use storefront_webhooks::models::webhook_delivery::{DeliveryRecord, NewDeliveryRecord};
use storefront_webhooks::models::webhook_outbox::{NewOutboxEntry, OutboxEntry, OutboxOutcome};
use storefront_webhooks::services::dispatcher::{DispatcherSettings, EventDispatcher};
use storefront_webhooks::services::webhook_store::WebhookStore;

pub const SECRET_A: &str = "whsec_crm_2b7f";
pub const SECRET_B: &str = "whsec_sheets_91c4";

pub fn subscriber(name: &str, url: &str, events: &[EventType], secret: &str) -> Subscriber {
    Subscriber {
        id: Uuid::new_v4(),
        name: name.to_string(),
        url: url.to_string(),
        secret: secret.to_string(),
        events: events.iter().map(|e| e.as_str().to_string()).collect(),
        status: SubscriberStatus::Active,
        success_count: 0,
        error_count: 0,
        last_triggered_at: None,
        created_at: Some(Utc::now()),
        updated_at: Some(Utc::now()),
    }
}

/// Millisecond backoff so retry scenarios finish quickly.
pub fn fast_settings() -> DispatcherSettings {
    DispatcherSettings {
        max_attempts: 3,
        timeout: Duration::from_secs(2),
        backoff_base: Duration::from_millis(50),
        disable_threshold: 10,
        max_concurrency: 8,
        lease_margin: Duration::from_secs(30),
    }
}

pub fn dispatcher(store: &Arc<MemoryStore>) -> EventDispatcher {
    dispatcher_with(store, fast_settings())
}

pub fn dispatcher_with(store: &Arc<MemoryStore>, settings: DispatcherSettings) -> EventDispatcher {
    let store: Arc<dyn WebhookStore> = store.clone();
    EventDispatcher::new(store, settings).expect("http client")
}

/// Polls until `check` holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[derive(Default)]
struct Tables {
    subscribers: Vec<Subscriber>,
    deliveries: Vec<DeliveryRecord>,
    outbox: Vec<OutboxEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_reads: AtomicBool,
    fail_records: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_subscribers(subscribers: Vec<Subscriber>) -> Arc<Self> {
        let store = Self::default();
        store.tables.lock().unwrap().subscribers = subscribers;
        Arc::new(store)
    }

    pub fn insert_subscriber(&self, subscriber: Subscriber) {
        self.tables.lock().unwrap().subscribers.push(subscriber);
    }

    pub fn subscriber(&self, id: Uuid) -> Subscriber {
        self.tables
            .lock()
            .unwrap()
            .subscribers
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .expect("subscriber exists")
    }

    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.tables.lock().unwrap().deliveries.clone()
    }

    pub fn deliveries_for(&self, webhook_id: Uuid) -> Vec<DeliveryRecord> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.webhook_id == webhook_id)
            .collect()
    }

    pub fn outbox(&self) -> Vec<OutboxEntry> {
        self.tables.lock().unwrap().outbox.clone()
    }

    /// Plants an outbox row as if a process died mid-pipeline.
    pub fn insert_outbox(&self, entry: OutboxEntry) {
        self.tables.lock().unwrap().outbox.push(entry);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_records(&self, fail: bool) {
        self.fail_records.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Internal("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookStore for MemoryStore {
    async fn list_active_subscribers_for_event(&self, event: EventType) -> Result<Vec<Subscriber>> {
        self.check_reads()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .subscribers
            .iter()
            .filter(|s| s.status == SubscriberStatus::Active && s.listens_to(event))
            .cloned()
            .collect())
    }

    async fn find_subscriber(&self, id: Uuid) -> Result<Option<Subscriber>> {
        self.check_reads()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables.subscribers.iter().find(|s| s.id == id).cloned())
    }

    async fn persist_delivery_record(&self, record: NewDeliveryRecord) -> Result<DeliveryRecord> {
        if self.fail_records.load(Ordering::SeqCst) {
            return Err(Error::Internal("insert failed".to_string()));
        }
        let stored = DeliveryRecord {
            id: Uuid::new_v4(),
            webhook_id: record.webhook_id,
            event: record.event,
            payload: record.payload,
            status: record.status,
            response_status: record.response_status,
            response_body: record.response_body,
            error: record.error,
            attempts: record.attempts,
            delivered_at: record.delivered_at,
            failed_at: record.failed_at,
            created_at: Some(Utc::now()),
        };
        self.tables.lock().unwrap().deliveries.push(stored.clone());
        Ok(stored)
    }

    async fn list_deliveries(&self, webhook_id: Uuid, limit: i64) -> Result<Vec<DeliveryRecord>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .deliveries
            .iter()
            .rev()
            .filter(|d| d.webhook_id == webhook_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn update_subscriber_counters(
        &self,
        id: Uuid,
        delta: CounterDelta,
    ) -> Result<SubscriberCounters> {
        let mut tables = self.tables.lock().unwrap();
        let sub = tables
            .subscribers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::NotFound("webhook".to_string()))?;
        sub.success_count += delta.success;
        sub.error_count += delta.error;
        if let Some(at) = delta.triggered_at {
            sub.last_triggered_at = Some(at);
        }
        Ok(SubscriberCounters {
            success_count: sub.success_count,
            error_count: sub.error_count,
            status: sub.status,
        })
    }

    async fn disable_subscriber(&self, id: Uuid, status: SubscriberStatus) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        match tables
            .subscribers
            .iter_mut()
            .find(|s| s.id == id && s.status == SubscriberStatus::Active)
        {
            Some(sub) => {
                sub.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn enqueue_outbox(&self, entry: NewOutboxEntry) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.tables.lock().unwrap().outbox.push(OutboxEntry {
            id,
            webhook_id: entry.webhook_id,
            event: entry.event,
            body: entry.body,
            max_attempts: entry.max_attempts,
            attempts: 0,
            timeout_ms: entry.timeout_ms,
            locked_until: now + lease(entry.lease),
            outcome: None,
            counted: false,
            created_at: Some(now),
        });
        Ok(id)
    }

    async fn record_outbox_attempt(
        &self,
        id: Uuid,
        attempts: i32,
        lease_for: Duration,
        outcome: Option<OutboxOutcome>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(entry) = tables.outbox.iter_mut().find(|e| e.id == id) {
            entry.attempts = attempts;
            entry.locked_until = Utc::now() + lease(lease_for);
            if outcome.is_some() {
                entry.outcome = outcome;
            }
        }
        Ok(())
    }

    async fn mark_outbox_counted(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(entry) = tables.outbox.iter_mut().find(|e| e.id == id) {
            entry.counted = true;
        }
        Ok(())
    }

    async fn complete_outbox(&self, id: Uuid) -> Result<()> {
        self.tables.lock().unwrap().outbox.retain(|e| e.id != id);
        Ok(())
    }

    async fn claim_stale_outbox(&self, limit: i64, lease_for: Duration) -> Result<Vec<OutboxEntry>> {
        let now = Utc::now();
        let mut tables = self.tables.lock().unwrap();
        let mut claimed = Vec::new();
        for entry in tables.outbox.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if entry.locked_until <= now {
                entry.locked_until = now + lease(lease_for);
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }
}

fn lease(d: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(d.as_millis() as i64)
}

/// A received webhook request.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub received_at: Instant,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

/// Answers with the scripted statuses in order, repeating the last one,
/// and keeps every request.
#[derive(Clone)]
pub struct ScriptedResponder {
    statuses: Arc<Vec<u16>>,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    delay: Duration,
}

impl ScriptedResponder {
    pub fn new(statuses: &[u16]) -> Self {
        Self {
            statuses: Arc::new(statuses.to_vec()),
            requests: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
        }
    }

    /// Holds every response for `delay` after the request is captured.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn always(status: u16) -> Self {
        Self::new(&[status])
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Respond for ScriptedResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut requests = self.requests.lock().unwrap();
        let status = self
            .statuses
            .get(requests.len())
            .or_else(|| self.statuses.last())
            .copied()
            .unwrap_or(200);
        requests.push(CapturedRequest {
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
            received_at: Instant::now(),
        });
        ResponseTemplate::new(status)
            .set_body_string(format!("status {}", status))
            .set_delay(self.delay)
    }
}
