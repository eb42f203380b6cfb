use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::models::event::EventType;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const USER_AGENT: &str = concat!("storefront-webhooks/", env!("CARGO_PKG_VERSION"));
pub const RESPONSE_EXCERPT_CHARS: usize = 1000;
/// Bytes read from a response body; 1000 chars of UTF-8 never need more.
pub const RESPONSE_READ_LIMIT_BYTES: usize = 4 * RESPONSE_EXCERPT_CHARS;

#[derive(Debug, Clone)]
pub struct DeliveryRequest<'a> {
    pub url: &'a str,
    pub event: EventType,
    pub body: &'a str,
    pub signature: &'a str,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptFailure {
    #[error("HTTP {0}")]
    HttpStatus(u16),
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub ok: bool,
    pub status: Option<u16>,
    pub body_excerpt: Option<String>,
    pub failure: Option<AttemptFailure>,
    pub elapsed: Duration,
}

impl AttemptOutcome {
    pub fn failed(failure: AttemptFailure, elapsed: Duration) -> Self {
        Self {
            ok: false,
            status: None,
            body_excerpt: None,
            failure: Some(failure),
            elapsed,
        }
    }
}

/// One bounded-time POST to a subscriber endpoint.
///
/// Failed deliveries come back as `Ok` with `ok == false`; `Err` is reserved
/// for requests that could not be built at all.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn attempt(&self, request: &DeliveryRequest<'_>) -> Result<AttemptOutcome>;
}

#[derive(Clone)]
pub struct DeliveryExecutor {
    client: Client,
}

impl DeliveryExecutor {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build webhook HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliveryTransport for DeliveryExecutor {
    async fn attempt(&self, request: &DeliveryRequest<'_>) -> Result<AttemptOutcome> {
        let started = Instant::now();
        let res = self
            .client
            .post(request.url)
            .timeout(request.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(SIGNATURE_HEADER, request.signature)
            .header(EVENT_HEADER, request.event.as_str())
            .body(request.body.to_owned())
            .send()
            .await;

        match res {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = read_excerpt(resp).await;
                let ok = (200..300).contains(&status);
                Ok(AttemptOutcome {
                    ok,
                    status: Some(status),
                    body_excerpt: Some(body),
                    failure: (!ok).then_some(AttemptFailure::HttpStatus(status)),
                    elapsed: started.elapsed(),
                })
            }
            Err(err) if err.is_builder() => Err(Error::Reqwest(err)),
            Err(err) => {
                let failure = if err.is_timeout() {
                    AttemptFailure::Timeout
                } else if err.is_connect() {
                    AttemptFailure::Connect(err.to_string())
                } else {
                    AttemptFailure::Transport(err.to_string())
                };
                Ok(AttemptOutcome::failed(failure, started.elapsed()))
            }
        }
    }
}

/// Reads at most [`RESPONSE_READ_LIMIT_BYTES`] of the body; the rest is
/// never buffered.
async fn read_excerpt(mut resp: reqwest::Response) -> String {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < RESPONSE_READ_LIMIT_BYTES {
        match resp.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(
                    target: "webhook_delivery",
                    error = %e,
                    "Stopped reading webhook response body"
                );
                break;
            }
        }
    }
    excerpt_bytes(&buf)
}

pub fn excerpt_bytes(bytes: &[u8]) -> String {
    let bytes = &bytes[..bytes.len().min(RESPONSE_READ_LIMIT_BYTES)];
    excerpt(&String::from_utf8_lossy(bytes))
}

/// Truncates to [`RESPONSE_EXCERPT_CHARS`] characters on a char boundary.
pub fn excerpt(body: &str) -> String {
    match body.char_indices().nth(RESPONSE_EXCERPT_CHARS) {
        Some((idx, _)) => body[..idx].to_string(),
        None => body.to_string(),
    }
}
