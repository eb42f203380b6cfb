use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::event::EventType;
use crate::models::webhook::{CounterDelta, Subscriber, SubscriberCounters, SubscriberStatus};
use crate::models::webhook_delivery::{DeliveryRecord, DeliveryStatus, NewDeliveryRecord};
use crate::models::webhook_outbox::{NewOutboxEntry, OutboxEntry, OutboxOutcome};

/// Persistence the dispatcher needs. Subscription CRUD lives elsewhere.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn list_active_subscribers_for_event(&self, event: EventType) -> Result<Vec<Subscriber>>;

    async fn find_subscriber(&self, id: Uuid) -> Result<Option<Subscriber>>;

    async fn persist_delivery_record(&self, record: NewDeliveryRecord) -> Result<DeliveryRecord>;

    async fn list_deliveries(&self, webhook_id: Uuid, limit: i64) -> Result<Vec<DeliveryRecord>>;

    /// Applies the delta atomically and returns the counters after the update.
    async fn update_subscriber_counters(
        &self,
        id: Uuid,
        delta: CounterDelta,
    ) -> Result<SubscriberCounters>;

    /// Moves an `active` subscriber to `status`. Returns false if it was not active.
    async fn disable_subscriber(&self, id: Uuid, status: SubscriberStatus) -> Result<bool>;

    async fn enqueue_outbox(&self, entry: NewOutboxEntry) -> Result<Uuid>;

    /// Stores progress and renews the lease. A terminal `outcome` is written in
    /// the same statement as the attempt count.
    async fn record_outbox_attempt(
        &self,
        id: Uuid,
        attempts: i32,
        lease: Duration,
        outcome: Option<OutboxOutcome>,
    ) -> Result<()>;

    async fn mark_outbox_counted(&self, id: Uuid) -> Result<()>;

    async fn complete_outbox(&self, id: Uuid) -> Result<()>;

    /// Claims entries whose lease expired, extending the lease by `lease`.
    async fn claim_stale_outbox(&self, limit: i64, lease: Duration) -> Result<Vec<OutboxEntry>>;
}

#[derive(Clone)]
pub struct PgWebhookStore {
    pool: PgPool,
}

const SUBSCRIBER_COLUMNS: &str = "id, name, url, secret, events, status, success_count, error_count, last_triggered_at, created_at, updated_at";

const DELIVERY_COLUMNS: &str = "id, webhook_id, event, payload, status, response_status, response_body, error, attempts, delivered_at, failed_at, created_at";

const OUTBOX_COLUMNS: &str = "id, webhook_id, event, body, max_attempts, attempts, timeout_ms, locked_until, \
     outcome_status, outcome_response_status, outcome_response_body, outcome_error, counted, created_at";

impl PgWebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn subscriber_from_row(row: &PgRow) -> Result<Subscriber> {
    let status: String = row.try_get("status")?;
    Ok(Subscriber {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        secret: row.try_get("secret")?,
        events: row.try_get("events")?,
        status: status.parse()?,
        success_count: row.try_get("success_count")?,
        error_count: row.try_get("error_count")?,
        last_triggered_at: row.try_get("last_triggered_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn delivery_from_row(row: &PgRow) -> Result<DeliveryRecord> {
    let status: String = row.try_get("status")?;
    Ok(DeliveryRecord {
        id: row.try_get("id")?,
        webhook_id: row.try_get("webhook_id")?,
        event: row.try_get("event")?,
        payload: row.try_get::<JsonValue, _>("payload")?,
        status: status.parse::<DeliveryStatus>()?,
        response_status: row.try_get("response_status")?,
        response_body: row.try_get("response_body")?,
        error: row.try_get("error")?,
        attempts: row.try_get("attempts")?,
        delivered_at: row.try_get("delivered_at")?,
        failed_at: row.try_get("failed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxEntry> {
    let outcome = match row.try_get::<Option<String>, _>("outcome_status")? {
        Some(status) => Some(OutboxOutcome {
            status: status.parse::<DeliveryStatus>()?,
            response_status: row.try_get("outcome_response_status")?,
            response_body: row.try_get("outcome_response_body")?,
            error: row.try_get("outcome_error")?,
        }),
        None => None,
    };
    Ok(OutboxEntry {
        id: row.try_get("id")?,
        webhook_id: row.try_get("webhook_id")?,
        event: row.try_get("event")?,
        body: row.try_get("body")?,
        max_attempts: row.try_get("max_attempts")?,
        attempts: row.try_get("attempts")?,
        timeout_ms: row.try_get("timeout_ms")?,
        locked_until: row.try_get::<DateTime<Utc>, _>("locked_until")?,
        outcome,
        counted: row.try_get("counted")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl WebhookStore for PgWebhookStore {
    async fn list_active_subscribers_for_event(&self, event: EventType) -> Result<Vec<Subscriber>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM webhooks WHERE status = 'active' AND events @> ARRAY[$1]::text[] ORDER BY created_at ASC",
            SUBSCRIBER_COLUMNS
        ))
        .bind(event.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscriber_from_row).collect()
    }

    async fn find_subscriber(&self, id: Uuid) -> Result<Option<Subscriber>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM webhooks WHERE id = $1",
            SUBSCRIBER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscriber_from_row).transpose()
    }

    async fn persist_delivery_record(&self, record: NewDeliveryRecord) -> Result<DeliveryRecord> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO webhook_deliveries
                (webhook_id, event, payload, status, response_status, response_body, error, attempts, delivered_at, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(record.webhook_id)
        .bind(&record.event)
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(record.response_status)
        .bind(&record.response_body)
        .bind(&record.error)
        .bind(record.attempts)
        .bind(record.delivered_at)
        .bind(record.failed_at)
        .fetch_one(&self.pool)
        .await?;
        delivery_from_row(&row)
    }

    async fn list_deliveries(&self, webhook_id: Uuid, limit: i64) -> Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM webhook_deliveries WHERE webhook_id = $1 ORDER BY created_at DESC LIMIT $2",
            DELIVERY_COLUMNS
        ))
        .bind(webhook_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delivery_from_row).collect()
    }

    async fn update_subscriber_counters(
        &self,
        id: Uuid,
        delta: CounterDelta,
    ) -> Result<SubscriberCounters> {
        let row = sqlx::query(
            r#"
            UPDATE webhooks
               SET success_count = success_count + $2,
                   error_count = error_count + $3,
                   last_triggered_at = COALESCE($4, last_triggered_at),
                   updated_at = NOW()
             WHERE id = $1
            RETURNING success_count, error_count, status
            "#,
        )
        .bind(id)
        .bind(delta.success)
        .bind(delta.error)
        .bind(delta.triggered_at)
        .fetch_one(&self.pool)
        .await?;
        let status: String = row.try_get("status")?;
        Ok(SubscriberCounters {
            success_count: row.try_get("success_count")?,
            error_count: row.try_get("error_count")?,
            status: status.parse()?,
        })
    }

    async fn disable_subscriber(&self, id: Uuid, status: SubscriberStatus) -> Result<bool> {
        let res = sqlx::query(
            r#"UPDATE webhooks SET status = $2, updated_at = NOW() WHERE id = $1 AND status = 'active'"#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn enqueue_outbox(&self, entry: NewOutboxEntry) -> Result<Uuid> {
        let row = sqlx::query(
            r#"
            INSERT INTO webhook_outbox (webhook_id, event, body, max_attempts, timeout_ms, locked_until)
            VALUES ($1, $2, $3, $4, $5, NOW() + make_interval(secs => $6))
            RETURNING id
            "#,
        )
        .bind(entry.webhook_id)
        .bind(&entry.event)
        .bind(&entry.body)
        .bind(entry.max_attempts)
        .bind(entry.timeout_ms)
        .bind(entry.lease.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;
        let id: Uuid = row.try_get("id")?;
        Ok(id)
    }

    async fn record_outbox_attempt(
        &self,
        id: Uuid,
        attempts: i32,
        lease: Duration,
        outcome: Option<OutboxOutcome>,
    ) -> Result<()> {
        let query = sqlx::query(
            r#"
            UPDATE webhook_outbox
               SET attempts = $2,
                   locked_until = NOW() + make_interval(secs => $3),
                   outcome_status = COALESCE($4, outcome_status),
                   outcome_response_status = CASE WHEN $4 IS NULL THEN outcome_response_status ELSE $5 END,
                   outcome_response_body = CASE WHEN $4 IS NULL THEN outcome_response_body ELSE $6 END,
                   outcome_error = CASE WHEN $4 IS NULL THEN outcome_error ELSE $7 END
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(lease.as_secs_f64());
        let query = match outcome {
            Some(outcome) => query
                .bind(Some(outcome.status.as_str()))
                .bind(outcome.response_status)
                .bind(outcome.response_body)
                .bind(outcome.error),
            None => query
                .bind(None::<&str>)
                .bind(None::<i32>)
                .bind(None::<String>)
                .bind(None::<String>),
        };
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn mark_outbox_counted(&self, id: Uuid) -> Result<()> {
        sqlx::query(r#"UPDATE webhook_outbox SET counted = TRUE WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_outbox(&self, id: Uuid) -> Result<()> {
        sqlx::query(r#"DELETE FROM webhook_outbox WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_stale_outbox(&self, limit: i64, lease: Duration) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE webhook_outbox SET locked_until = NOW() + make_interval(secs => $2)
            WHERE id IN (
                SELECT id FROM webhook_outbox
                 WHERE locked_until <= NOW()
                 ORDER BY created_at ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT $1
            )
            RETURNING {}
            "#,
            OUTBOX_COLUMNS
        ))
        .bind(limit)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(outbox_from_row).collect()
    }
}
