//! Bounded exponential-backoff retry for outbound remote calls.

use std::future::Future;
use std::time::Duration;

use serde_json::json;

use crate::error::{ConnectorError, RemoteError};
use crate::events::EventSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for a single backoff sleep.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Sleep after the failure of attempt number `attempt` (0-based):
    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Wraps every data-fetch call with a per-call timeout and the retry policy.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    call_timeout: Duration,
    events: Option<EventSink>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            policy,
            call_timeout: call_timeout.max(Duration::from_millis(1)),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `call` receives the 0-based attempt number.
    pub async fn execute<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, ConnectorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            let outcome = match tokio::time::timeout(self.call_timeout, call(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(self.call_timeout.as_millis() as u64)),
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_transient() {
                tracing::warn!(target: "ethica::retry", op, attempt, error = %err, "remote call rejected");
                return Err(ConnectorError::Rejected(err));
            }
            attempt += 1;
            if attempt >= max_attempts {
                tracing::warn!(
                    target: "ethica::retry",
                    op,
                    attempts = attempt,
                    error = %err,
                    "remote unavailable; retries exhausted"
                );
                if let Some(events) = &self.events {
                    events.emit(
                        ethica_topics::TOPIC_REMOTE_UNAVAILABLE,
                        &json!({"op": op, "attempts": attempt, "error": err.to_string()}),
                    );
                }
                return Err(ConnectorError::RemoteUnavailable {
                    attempts: attempt,
                    last_error: err,
                });
            }
            let delay = self.policy.delay_for(attempt - 1);
            tracing::debug!(
                target: "ethica::retry",
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient remote failure; backing off"
            );
            if let Some(events) = &self.events {
                events.emit(
                    ethica_topics::TOPIC_REMOTE_RETRY,
                    &json!({"op": op, "attempt": attempt, "delay_ms": delay.as_millis() as u64}),
                );
            }
            tokio::time::sleep(delay).await;
        }
    }
}
