//! Event fan-out to webhook subscribers.
//!
//! `dispatch` resolves the subscribers for an event, builds one envelope,
//! and spawns an independent delivery pipeline per subscriber. Nothing a
//! pipeline does is reported back to the caller as an error: outcomes end up
//! in delivery records and subscriber health counters.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::dto::webhook_dto::{WebhookMetadata, WebhookTestResult};
use crate::error::{Error, Result};
use crate::models::event::EventType;
use crate::models::webhook::Subscriber;
use crate::models::webhook_delivery::DeliveryStatus;
use crate::models::webhook_outbox::{NewOutboxEntry, OutboxEntry, OutboxOutcome};
use crate::services::delivery_executor::{
    AttemptOutcome, DeliveryExecutor, DeliveryRequest, DeliveryTransport,
};
use crate::services::delivery_recorder::DeliveryRecorder;
use crate::services::health_tracker::{HealthTracker, DEFAULT_DISABLE_THRESHOLD};
use crate::services::payload_builder::{build_payload, PreparedPayload};
use crate::services::retry_scheduler::{
    AttemptObserver, DeliveryOutcome, NoopObserver, RetryPolicy, RetryScheduler,
    DEFAULT_BACKOFF_BASE, DEFAULT_MAX_ATTEMPTS,
};
use crate::services::subscriber_resolver::SubscriberResolver;
use crate::services::webhook_store::WebhookStore;
use crate::utils::crypto::sign_payload;
use crate::utils::time::now;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub disable_threshold: i32,
    pub max_concurrency: usize,
    /// Added on top of the worst-case pipeline duration when leasing outbox rows.
    pub lease_margin: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: Duration::from_millis(10_000),
            backoff_base: DEFAULT_BACKOFF_BASE,
            disable_threshold: DEFAULT_DISABLE_THRESHOLD,
            max_concurrency: 32,
            lease_margin: Duration::from_secs(30),
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    pub max_attempts: Option<u32>,
    pub timeout: Option<Duration>,
}

/// Handles of the pipelines started by one dispatch. Dropping it leaves the
/// pipelines running.
#[derive(Default)]
pub struct Dispatched {
    pipelines: Vec<(Uuid, JoinHandle<DeliveryOutcome>)>,
}

impl Dispatched {
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn subscriber_ids(&self) -> Vec<Uuid> {
        self.pipelines.iter().map(|(id, _)| *id).collect()
    }

    pub(crate) fn push(&mut self, subscriber_id: Uuid, handle: JoinHandle<DeliveryOutcome>) {
        self.pipelines.push((subscriber_id, handle));
    }

    pub async fn wait(self) -> Vec<(Uuid, DeliveryOutcome)> {
        let mut outcomes = Vec::with_capacity(self.pipelines.len());
        for (subscriber_id, handle) in self.pipelines {
            match handle.await {
                Ok(outcome) => outcomes.push((subscriber_id, outcome)),
                Err(e) => tracing::error!(
                    target: "webhook_delivery",
                    subscriber_id = %subscriber_id,
                    error = %e,
                    "Webhook delivery pipeline aborted"
                ),
            }
        }
        outcomes
    }
}

#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    store: Arc<dyn WebhookStore>,
    resolver: SubscriberResolver,
    transport: Arc<dyn DeliveryTransport>,
    recorder: DeliveryRecorder,
    health: HealthTracker,
    settings: DispatcherSettings,
    permits: Arc<Semaphore>,
    live: LiveOutbox,
}

/// Outbox rows owned by a pipeline running in this process.
#[derive(Clone, Default)]
struct LiveOutbox {
    ids: Arc<Mutex<HashSet<Uuid>>>,
}

impl LiveOutbox {
    fn register(&self, id: Uuid) -> LiveGuard {
        lock(&self.ids).insert(id);
        LiveGuard {
            ids: self.ids.clone(),
            id,
        }
    }

    fn contains(&self, id: Uuid) -> bool {
        lock(&self.ids).contains(&id)
    }
}

fn lock(ids: &Mutex<HashSet<Uuid>>) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
    ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases the row when the pipeline ends, however it ends.
struct LiveGuard {
    ids: Arc<Mutex<HashSet<Uuid>>>,
    id: Uuid,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        lock(&self.ids).remove(&self.id);
    }
}

/// Outbox row a pipeline reports its progress to.
struct OutboxClaim {
    id: Uuid,
    attempts: u32,
    _live: LiveGuard,
}

impl EventDispatcher {
    pub fn new(store: Arc<dyn WebhookStore>, settings: DispatcherSettings) -> Result<Self> {
        let transport = Arc::new(DeliveryExecutor::new()?);
        Ok(Self::with_transport(store, transport, settings))
    }

    pub fn with_transport(
        store: Arc<dyn WebhookStore>,
        transport: Arc<dyn DeliveryTransport>,
        settings: DispatcherSettings,
    ) -> Self {
        let inner = DispatcherInner {
            resolver: SubscriberResolver::new(store.clone()),
            recorder: DeliveryRecorder::new(store.clone()),
            health: HealthTracker::new(store.clone(), settings.disable_threshold),
            permits: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            live: LiveOutbox::default(),
            store,
            transport,
            settings,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> Arc<dyn WebhookStore> {
        self.inner.store.clone()
    }

    /// Starts one pipeline per matching subscriber and returns their handles.
    ///
    /// Never fails: a resolver or serialization error is logged and yields an
    /// empty [`Dispatched`].
    pub async fn dispatch(
        &self,
        event: EventType,
        data: JsonValue,
        metadata: Option<WebhookMetadata>,
        options: DispatchOptions,
    ) -> Dispatched {
        let subscribers = match self.inner.resolver.find_active_subscribers(event).await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    event = %event,
                    error = %e,
                    "Failed to load webhooks for event"
                );
                return Dispatched::default();
            }
        };

        if subscribers.is_empty() {
            tracing::debug!(target: "webhook_delivery", event = %event, "No webhooks listen to event");
            return Dispatched::default();
        }

        let payload = match build_payload(event, data, metadata, now()) {
            Ok(payload) => Arc::new(payload),
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    event = %event,
                    error = %e,
                    "Failed to serialize webhook payload"
                );
                return Dispatched::default();
            }
        };

        let settings = &self.inner.settings;
        let policy = RetryPolicy {
            max_attempts: options.max_attempts.unwrap_or(settings.max_attempts).max(1),
            backoff_base: settings.backoff_base,
        };
        let timeout = options.timeout.unwrap_or(settings.timeout);

        tracing::info!(
            target: "webhook_delivery",
            event = %event,
            subscriber_count = subscribers.len(),
            "Dispatching event to webhooks"
        );

        let mut dispatched = Dispatched::default();
        for subscriber in subscribers {
            let inner = self.inner.clone();
            let payload = payload.clone();
            let subscriber_id = subscriber.id;
            let handle = tokio::spawn(async move {
                inner
                    .run_pipeline(subscriber, payload, policy, timeout, None)
                    .await
            });
            dispatched.push(subscriber_id, handle);
        }
        dispatched
    }

    /// Fire-and-forget variant for request handlers: resolution happens in
    /// the background too.
    pub fn spawn_dispatch(
        &self,
        event: EventType,
        data: JsonValue,
        metadata: Option<WebhookMetadata>,
    ) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch(event, data, metadata, DispatchOptions::default())
                .await;
        });
    }

    /// Sends a single `test_event` attempt to one webhook, whatever its
    /// event filter. The attempt is recorded and counted like any other.
    pub async fn send_test(
        &self,
        webhook_id: Uuid,
        user_agent: Option<String>,
    ) -> Result<WebhookTestResult> {
        let subscriber = self
            .inner
            .store
            .find_subscriber(webhook_id)
            .await?
            .ok_or_else(|| Error::NotFound("Webhook not found".to_string()))?;
        if !subscriber.is_active() {
            return Err(Error::BadRequest("Webhook is not active".to_string()));
        }
        if !subscriber.has_http_url() {
            return Err(Error::BadRequest("Webhook URL must use http or https".to_string()));
        }

        let data = json!({
            "test": true,
            "message": "Test event from the storefront webhook dispatcher",
            "webhook_id": subscriber.id,
            "webhook_name": subscriber.name,
        });
        let metadata = WebhookMetadata {
            user_agent,
            ..WebhookMetadata::default()
        };
        let payload = build_payload(EventType::TestEvent, data, Some(metadata), now())?;
        let signature = sign_payload(payload.body.as_bytes(), &subscriber.secret);
        let request = DeliveryRequest {
            url: &subscriber.url,
            event: EventType::TestEvent,
            body: &payload.body,
            signature: &signature,
            timeout: self.inner.settings.timeout,
        };
        let policy = RetryPolicy {
            max_attempts: 1,
            backoff_base: self.inner.settings.backoff_base,
        };

        let started = Instant::now();
        let outcome = RetryScheduler::new(self.inner.transport.as_ref(), policy)
            .run(&request, 0, &NoopObserver)
            .await;
        let elapsed = started.elapsed();

        self.inner
            .finish(&subscriber, EventType::TestEvent, payload.as_json(), &outcome, None)
            .await;

        let message = match (&outcome.status, outcome.response_status) {
            (DeliveryStatus::Success, Some(code)) => format!("Webhook tested successfully ({})", code),
            (DeliveryStatus::Success, None) => "Webhook tested successfully".to_string(),
            (DeliveryStatus::Failed, _) => format!(
                "Webhook test failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            ),
        };

        Ok(WebhookTestResult {
            success: outcome.is_success(),
            status: outcome.response_status,
            message,
            response_time_ms: outcome
                .response_status
                .map(|_| elapsed.as_millis() as u64),
        })
    }

    /// True while a pipeline in this process still owns the outbox row.
    pub(crate) fn is_live(&self, outbox_id: Uuid) -> bool {
        self.inner.live.contains(outbox_id)
    }

    /// Restarts a pipeline recovered from the outbox with its remaining budget.
    pub(crate) fn resume(
        &self,
        subscriber: Subscriber,
        entry: OutboxEntry,
    ) -> Result<JoinHandle<DeliveryOutcome>> {
        let payload = Arc::new(PreparedPayload::from_body(entry.body.clone())?);
        let policy = RetryPolicy {
            max_attempts: entry.max_attempts.max(1) as u32,
            backoff_base: self.inner.settings.backoff_base,
        };
        let timeout = entry.timeout();
        let claim = OutboxClaim {
            id: entry.id,
            attempts: entry.attempts.max(0) as u32,
            _live: self.inner.live.register(entry.id),
        };
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            inner
                .run_pipeline(subscriber, payload, policy, timeout, Some(claim))
                .await
        }))
    }

    /// Closes an outbox entry whose budget was spent before the process died.
    pub(crate) async fn close_exhausted(&self, subscriber: &Subscriber, entry: &OutboxEntry) -> Result<()> {
        let payload = PreparedPayload::from_body(entry.body.clone())?;
        let outcome = DeliveryOutcome {
            status: DeliveryStatus::Failed,
            attempts: entry.attempts.max(1) as u32,
            response_status: None,
            body_excerpt: None,
            error: Some("delivery interrupted after the final attempt".to_string()),
        };
        self.inner
            .finish(subscriber, payload.event(), payload.as_json(), &outcome, Some(entry.id))
            .await;
        Ok(())
    }

    /// Finishes the bookkeeping for an entry whose last attempt already ran.
    /// Nothing is sent again; counters are skipped if they already include it.
    pub(crate) async fn settle(
        &self,
        subscriber: &Subscriber,
        entry: &OutboxEntry,
        parked: &OutboxOutcome,
    ) -> Result<()> {
        let payload = PreparedPayload::from_body(entry.body.clone())?;
        let event = payload.event();
        let outcome = DeliveryOutcome::from_parked(parked, entry.attempts.max(1) as u32);
        tracing::info!(
            target: "webhook_delivery",
            outbox_id = %entry.id,
            subscriber_id = %subscriber.id,
            event = %event,
            status = %outcome.status.as_str(),
            counted = entry.counted,
            "Settling finished webhook delivery without a record"
        );
        if !entry.counted && self.inner.count(subscriber, &outcome).await {
            self.inner.mark_counted(entry.id).await;
        }
        self.inner
            .write_record(subscriber, event, payload.as_json(), &outcome, Some(entry.id))
            .await;
        Ok(())
    }
}

impl DispatcherInner {
    async fn run_pipeline(
        &self,
        subscriber: Subscriber,
        payload: Arc<PreparedPayload>,
        policy: RetryPolicy,
        timeout: Duration,
        resumed: Option<OutboxClaim>,
    ) -> DeliveryOutcome {
        let event = payload.event();
        let claim = match resumed {
            Some(claim) => Some(claim),
            None => self
                .open_outbox(&subscriber, &payload, policy, timeout)
                .await
                .map(|id| OutboxClaim {
                    id,
                    attempts: 0,
                    _live: self.live.register(id),
                }),
        };
        let outbox_id = claim.as_ref().map(|c| c.id);
        let attempts_made = claim.as_ref().map_or(0, |c| c.attempts);

        let _permit = self.acquire_permit(outbox_id, attempts_made).await;

        let observer = OutboxProgress {
            store: self.store.as_ref(),
            outbox_id,
            policy,
            timeout,
            lease_margin: self.settings.lease_margin,
        };
        observer.refresh(attempts_made, None).await;

        let signature = sign_payload(payload.body.as_bytes(), &subscriber.secret);
        let request = DeliveryRequest {
            url: &subscriber.url,
            event,
            body: &payload.body,
            signature: &signature,
            timeout,
        };

        let outcome = RetryScheduler::new(self.transport.as_ref(), policy)
            .run(&request, attempts_made, &observer)
            .await;

        self.finish(&subscriber, event, payload.as_json(), &outcome, outbox_id)
            .await;
        outcome
    }

    /// Waits for a concurrency slot, renewing the outbox lease meanwhile so
    /// the sweeper does not mistake a queued pipeline for a dead one.
    async fn acquire_permit(
        &self,
        outbox_id: Option<Uuid>,
        attempts: u32,
    ) -> Option<OwnedSemaphorePermit> {
        let acquire = self.permits.clone().acquire_owned();
        tokio::pin!(acquire);
        let Some(id) = outbox_id else {
            return acquire.await.ok();
        };

        let lease = self.settings.lease_margin;
        let renew_every = (lease / 2).max(Duration::from_millis(5));
        loop {
            tokio::select! {
                permit = &mut acquire => return permit.ok(),
                _ = tokio::time::sleep(renew_every) => {
                    if let Err(e) = self
                        .store
                        .record_outbox_attempt(id, attempts as i32, lease, None)
                        .await
                    {
                        tracing::warn!(
                            target: "webhook_delivery",
                            outbox_id = %id,
                            error = %e,
                            "Failed to renew webhook outbox lease"
                        );
                    }
                }
            }
        }
    }

    async fn open_outbox(
        &self,
        subscriber: &Subscriber,
        payload: &PreparedPayload,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Option<Uuid> {
        let entry = NewOutboxEntry {
            webhook_id: subscriber.id,
            event: payload.event().as_str().to_string(),
            body: payload.body.clone(),
            max_attempts: policy.max_attempts as i32,
            timeout_ms: timeout.as_millis() as i64,
            lease: policy.worst_case(policy.max_attempts, timeout) + self.settings.lease_margin,
        };
        match self.store.enqueue_outbox(entry).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    subscriber_id = %subscriber.id,
                    error = %e,
                    "Failed to write webhook outbox entry, delivering without recovery"
                );
                None
            }
        }
    }

    async fn finish(
        &self,
        subscriber: &Subscriber,
        event: EventType,
        payload: JsonValue,
        outcome: &DeliveryOutcome,
        outbox_id: Option<Uuid>,
    ) {
        if outcome.is_success() {
            tracing::info!(
                target: "webhook_delivery",
                subscriber_id = %subscriber.id,
                event = %event,
                attempts = outcome.attempts,
                status = ?outcome.response_status,
                "Webhook delivered"
            );
        } else {
            tracing::warn!(
                target: "webhook_delivery",
                subscriber_id = %subscriber.id,
                event = %event,
                attempts = outcome.attempts,
                error = ?outcome.error,
                "Webhook delivery exhausted its attempts"
            );
        }

        // Once parked, a lost record is settled by the sweeper and never re-sent.
        let parked = match outbox_id {
            Some(id) => self.park(id, outcome).await,
            None => false,
        };
        if self.count(subscriber, outcome).await && parked {
            if let Some(id) = outbox_id {
                self.mark_counted(id).await;
            }
        }
        self.write_record(subscriber, event, payload, outcome, outbox_id)
            .await;
    }

    async fn park(&self, id: Uuid, outcome: &DeliveryOutcome) -> bool {
        let parked = OutboxOutcome::from(outcome);
        match self
            .store
            .record_outbox_attempt(
                id,
                outcome.attempts as i32,
                self.settings.lease_margin,
                Some(parked),
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    target: "webhook_delivery",
                    outbox_id = %id,
                    error = %e,
                    "Failed to store webhook outcome on outbox entry"
                );
                false
            }
        }
    }

    async fn count(&self, subscriber: &Subscriber, outcome: &DeliveryOutcome) -> bool {
        match self.health.on_outcome(subscriber, outcome).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    subscriber_id = %subscriber.id,
                    error = %e,
                    "Failed to update webhook counters"
                );
                false
            }
        }
    }

    async fn mark_counted(&self, id: Uuid) {
        if let Err(e) = self.store.mark_outbox_counted(id).await {
            tracing::warn!(
                target: "webhook_delivery",
                outbox_id = %id,
                error = %e,
                "Failed to flag webhook outbox entry as counted"
            );
        }
    }

    /// Writes the record and clears the outbox row. Without a record the row
    /// is the only trace, so it stays for the sweeper.
    async fn write_record(
        &self,
        subscriber: &Subscriber,
        event: EventType,
        payload: JsonValue,
        outcome: &DeliveryOutcome,
        outbox_id: Option<Uuid>,
    ) {
        if let Err(e) = self.recorder.record(subscriber.id, event, payload, outcome).await {
            tracing::error!(
                target: "webhook_delivery",
                subscriber_id = %subscriber.id,
                event = %event,
                error = %e,
                "Failed to persist webhook delivery record"
            );
            return;
        }

        if let Some(id) = outbox_id {
            if let Err(e) = self.store.complete_outbox(id).await {
                tracing::error!(
                    target: "webhook_delivery",
                    outbox_id = %id,
                    error = %e,
                    "Failed to clear webhook outbox entry"
                );
            }
        }
    }
}

struct OutboxProgress<'a> {
    store: &'a dyn WebhookStore,
    outbox_id: Option<Uuid>,
    policy: RetryPolicy,
    timeout: Duration,
    lease_margin: Duration,
}

impl OutboxProgress<'_> {
    async fn refresh(&self, attempts: u32, outcome: Option<OutboxOutcome>) {
        let Some(id) = self.outbox_id else { return };
        let remaining = self.policy.max_attempts.saturating_sub(attempts);
        let mut lease = self.policy.worst_case(remaining, self.timeout) + self.lease_margin;
        if attempts > 0 && remaining > 0 {
            lease += self.policy.backoff(attempts);
        }
        if let Err(e) = self
            .store
            .record_outbox_attempt(id, attempts as i32, lease, outcome)
            .await
        {
            tracing::warn!(
                target: "webhook_delivery",
                outbox_id = %id,
                error = %e,
                "Failed to update webhook outbox progress"
            );
        }
    }
}

#[async_trait]
impl<'a> AttemptObserver for OutboxProgress<'a> {
    async fn on_attempt(&self, attempt: u32, outcome: &AttemptOutcome) {
        // The final attempt's result is stored together with its count.
        let last = outcome.ok || attempt >= self.policy.max_attempts;
        let parked = last.then(|| OutboxOutcome::from(outcome));
        self.refresh(attempt, parked).await;
    }
}
