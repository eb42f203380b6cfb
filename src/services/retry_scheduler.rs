use async_trait::async_trait;
use std::time::Duration;

use crate::models::webhook_delivery::DeliveryStatus;
use crate::models::webhook_outbox::OutboxOutcome;
use crate::services::delivery_executor::{
    AttemptFailure, AttemptOutcome, DeliveryRequest, DeliveryTransport,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Pending,
    Attempting(u32),
    ScheduledRetry { next_attempt: u32, delay: Duration },
    Success { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Success { .. } | RetryState::Exhausted { .. })
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exp)
    }

    /// Upper bound on wall time for `attempts` attempts, backoffs included.
    pub fn worst_case(&self, attempts: u32, timeout: Duration) -> Duration {
        (1..=attempts).fold(Duration::ZERO, |acc, n| {
            let wait = if n < attempts { self.backoff(n) } else { Duration::ZERO };
            acc.saturating_add(timeout).saturating_add(wait)
        })
    }

    pub fn transition(&self, state: &RetryState, succeeded: bool) -> RetryState {
        match *state {
            RetryState::Pending => RetryState::Attempting(1),
            RetryState::Attempting(n) if succeeded => RetryState::Success { attempts: n },
            RetryState::Attempting(n) if n < self.max_attempts => RetryState::ScheduledRetry {
                next_attempt: n + 1,
                delay: self.backoff(n),
            },
            RetryState::Attempting(n) => RetryState::Exhausted { attempts: n },
            RetryState::ScheduledRetry { next_attempt, .. } => RetryState::Attempting(next_attempt),
            terminal => terminal,
        }
    }
}

/// Hook invoked after every attempt, before any backoff sleep.
#[async_trait]
pub trait AttemptObserver: Send + Sync {
    async fn on_attempt(&self, attempt: u32, outcome: &AttemptOutcome);
}

pub struct NoopObserver;

#[async_trait]
impl AttemptObserver for NoopObserver {
    async fn on_attempt(&self, _attempt: u32, _outcome: &AttemptOutcome) {}
}

/// Result of one complete retry sequence.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub response_status: Option<u16>,
    pub body_excerpt: Option<String>,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        self.status == DeliveryStatus::Success
    }

    /// Rebuilds the outcome parked on an outbox row by a pipeline that did
    /// not get to write its record.
    pub fn from_parked(parked: &OutboxOutcome, attempts: u32) -> Self {
        Self {
            status: parked.status,
            attempts: attempts.max(1),
            response_status: parked
                .response_status
                .and_then(|code| u16::try_from(code).ok()),
            body_excerpt: parked.response_body.clone(),
            error: parked.error.clone(),
        }
    }

    fn from_last(status: DeliveryStatus, attempts: u32, last: Option<AttemptOutcome>) -> Self {
        let (response_status, body_excerpt, error) = match last {
            Some(o) => (o.status, o.body_excerpt, o.failure.map(|f| f.to_string())),
            None => (None, None, None),
        };
        Self {
            status,
            attempts,
            response_status,
            body_excerpt,
            error,
        }
    }
}

impl From<&DeliveryOutcome> for OutboxOutcome {
    fn from(outcome: &DeliveryOutcome) -> Self {
        Self {
            status: outcome.status,
            response_status: outcome.response_status.map(i32::from),
            response_body: outcome.body_excerpt.clone(),
            error: outcome.error.clone(),
        }
    }
}

impl From<&AttemptOutcome> for OutboxOutcome {
    fn from(outcome: &AttemptOutcome) -> Self {
        Self {
            status: if outcome.ok {
                DeliveryStatus::Success
            } else {
                DeliveryStatus::Failed
            },
            response_status: outcome.status.map(i32::from),
            response_body: outcome.body_excerpt.clone(),
            error: outcome.failure.as_ref().map(|f| f.to_string()),
        }
    }
}

pub struct RetryScheduler<'a> {
    transport: &'a dyn DeliveryTransport,
    policy: RetryPolicy,
}

impl<'a> RetryScheduler<'a> {
    pub fn new(transport: &'a dyn DeliveryTransport, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Drives attempts until success or the budget runs out.
    ///
    /// `attempts_made` is non-zero when resuming a pipeline recovered from
    /// the outbox; numbering continues from there.
    pub async fn run(
        &self,
        request: &DeliveryRequest<'_>,
        attempts_made: u32,
        observer: &dyn AttemptObserver,
    ) -> DeliveryOutcome {
        let mut state = if attempts_made == 0 {
            self.policy.transition(&RetryState::Pending, false)
        } else {
            RetryState::Attempting(attempts_made + 1)
        };
        let mut last: Option<AttemptOutcome> = None;

        loop {
            match state {
                RetryState::Attempting(n) if n > self.policy.max_attempts => {
                    return DeliveryOutcome::from_last(DeliveryStatus::Failed, n - 1, last);
                }
                RetryState::Attempting(n) => {
                    let outcome = match self.transport.attempt(request).await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            tracing::error!(
                                target: "webhook_delivery",
                                url = %request.url,
                                attempt = n,
                                error = %err,
                                "Webhook request could not be built"
                            );
                            let outcome = AttemptOutcome::failed(
                                AttemptFailure::Transport(err.to_string()),
                                Duration::ZERO,
                            );
                            observer.on_attempt(n, &outcome).await;
                            return DeliveryOutcome::from_last(
                                DeliveryStatus::Failed,
                                n,
                                Some(outcome),
                            );
                        }
                    };
                    observer.on_attempt(n, &outcome).await;
                    if !outcome.ok {
                        tracing::warn!(
                            target: "webhook_delivery",
                            url = %request.url,
                            event = %request.event,
                            attempt = n,
                            status = ?outcome.status,
                            error = ?outcome.failure,
                            "Webhook delivery attempt failed"
                        );
                    }
                    state = self.policy.transition(&state, outcome.ok);
                    last = Some(outcome);
                }
                RetryState::ScheduledRetry { delay, .. } => {
                    tokio::time::sleep(delay).await;
                    state = self.policy.transition(&state, false);
                }
                RetryState::Success { attempts } => {
                    return DeliveryOutcome::from_last(DeliveryStatus::Success, attempts, last);
                }
                RetryState::Exhausted { attempts } => {
                    return DeliveryOutcome::from_last(DeliveryStatus::Failed, attempts, last);
                }
                RetryState::Pending => {
                    state = self.policy.transition(&state, false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::models::event::EventType;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        statuses: Mutex<Vec<u16>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(statuses: &[u16]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().rev().copied().collect()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DeliveryTransport for Scripted {
        async fn attempt(&self, _request: &DeliveryRequest<'_>) -> Result<AttemptOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let status = self.statuses.lock().unwrap().pop().unwrap_or(500);
            let ok = (200..300).contains(&status);
            Ok(AttemptOutcome {
                ok,
                status: Some(status),
                body_excerpt: Some(String::new()),
                failure: (!ok).then_some(AttemptFailure::HttpStatus(status)),
                elapsed: Duration::ZERO,
            })
        }
    }

    fn request() -> DeliveryRequest<'static> {
        DeliveryRequest {
            url: "http://localhost/hook",
            event: EventType::TestEvent,
            body: "{}",
            signature: "00",
            timeout: Duration::from_secs(1),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles_from_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn worst_case_counts_timeouts_and_gaps() {
        let policy = RetryPolicy::default();
        // 3 x 10s timeouts + 1s + 2s gaps
        assert_eq!(
            policy.worst_case(3, Duration::from_secs(10)),
            Duration::from_secs(33)
        );
    }

    #[test]
    fn state_machine_walks_to_exhaustion() {
        let policy = RetryPolicy::default();
        let mut state = policy.transition(&RetryState::Pending, false);
        assert_eq!(state, RetryState::Attempting(1));
        state = policy.transition(&state, false);
        assert_eq!(
            state,
            RetryState::ScheduledRetry {
                next_attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
        state = policy.transition(&state, false);
        assert_eq!(state, RetryState::Attempting(2));
        state = policy.transition(&policy.transition(&state, false), false);
        assert_eq!(state, RetryState::Attempting(3));
        state = policy.transition(&state, false);
        assert_eq!(state, RetryState::Exhausted { attempts: 3 });
        assert!(state.is_terminal());
        assert_eq!(policy.transition(&state, true), state);
    }

    #[test]
    fn success_is_terminal_at_current_attempt() {
        let policy = RetryPolicy::default();
        let state = policy.transition(&RetryState::Attempting(2), true);
        assert_eq!(state, RetryState::Success { attempts: 2 });
    }

    #[tokio::test]
    async fn stops_on_first_success() {
        let transport = Scripted::new(&[500, 200, 200]);
        let scheduler = RetryScheduler::new(&transport, fast_policy());
        let outcome = scheduler.run(&request(), 0, &NoopObserver).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.response_status, Some(200));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let transport = Scripted::new(&[500, 502, 503, 200]);
        let scheduler = RetryScheduler::new(&transport, fast_policy());
        let outcome = scheduler.run(&request(), 0, &NoopObserver).await;
        assert_eq!(outcome.status, DeliveryStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.response_status, Some(503));
        assert_eq!(outcome.error.as_deref(), Some("HTTP 503"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn parked_outcome_restores_the_delivery_result() {
        let transport = Scripted::new(&[500, 201]);
        let scheduler = RetryScheduler::new(&transport, fast_policy());
        let outcome = scheduler.run(&request(), 0, &NoopObserver).await;

        let parked = OutboxOutcome::from(&outcome);
        assert_eq!(parked.status, DeliveryStatus::Success);
        assert_eq!(parked.response_status, Some(201));

        let restored = DeliveryOutcome::from_parked(&parked, 2);
        assert!(restored.is_success());
        assert_eq!(restored.attempts, 2);
        assert_eq!(restored.response_status, Some(201));
        assert_eq!(restored.error, None);
    }

    #[tokio::test]
    async fn resumed_run_uses_remaining_budget() {
        let transport = Scripted::new(&[500, 500]);
        let scheduler = RetryScheduler::new(&transport, fast_policy());
        let outcome = scheduler.run(&request(), 2, &NoopObserver).await;
        assert_eq!(outcome.status, DeliveryStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
