//! Delivery tracking with bounded retries
//!
//! Turns the publisher's asynchronous answer into a bounded wait for the
//! caller. Each record walks a small state machine:
//!
//! ```text
//! Pending ──ack──────────────▶ Acknowledged
//!    │ ──rejected/overloaded─▶ Failed
//!    │ ──timeout/unavailable─▶ Retrying ──backoff──▶ Pending
//!    └ (attempts exhausted) ─▶ Failed
//! ```
//!
//! The walk itself happens in the publisher lane that owns the record's key:
//! a record backing off holds back later records with the same key, so
//! retries never reorder a key. The tracker bounds the caller's wait with a
//! hard deadline. A caller that goes away stops waiting; the in-flight
//! publish still runs to its end.

use crate::publisher::{PublishError, PublishResult, PublisherClient};
use crate::AckMode;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Wait before the next attempt, after `failed_attempts` failures
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Retry policy plus the hard deadline for one delivery
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub retry: RetryConfig,
    /// Longest a caller waits for a terminal state
    pub deadline: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            deadline: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Retrying,
    Acknowledged,
    Failed,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Acknowledged | DeliveryState::Failed)
    }
}

/// Successful delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub offset: Option<u64>,
    pub attempts: u32,
}

/// Terminal failure of a delivery
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    #[error("delivery failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("broker rejected the event: {0}")]
    Rejected(String),

    #[error("publisher queue is full")]
    Overloaded,

    #[error("no broker acknowledgment within {0:?}")]
    DeadlineExceeded(Duration),

    #[error("publisher is closed")]
    Closed,

    #[error("delivery task aborted: {0}")]
    Aborted(String),
}

/// What one attempt produced, folded from the publisher's two result layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Acknowledged(Option<u64>),
    TimedOut,
    Unavailable(String),
    Rejected(String),
    Overloaded,
    Closed,
}

impl From<Result<PublishResult, PublishError>> for AttemptOutcome {
    fn from(result: Result<PublishResult, PublishError>) -> Self {
        match result {
            Ok(PublishResult::Acknowledged(offset)) => AttemptOutcome::Acknowledged(offset),
            Ok(PublishResult::TimedOut) => AttemptOutcome::TimedOut,
            Ok(PublishResult::Rejected(reason)) => AttemptOutcome::Rejected(reason),
            Err(PublishError::BrokerUnavailable(e)) => AttemptOutcome::Unavailable(e),
            Err(PublishError::Overloaded { .. }) => AttemptOutcome::Overloaded,
            Err(PublishError::Closed) => AttemptOutcome::Closed,
        }
    }
}

/// In-flight correlation of one request to its publish
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub ack_mode: AckMode,
    deadline: Option<(Instant, Duration)>,
    attempts: u32,
    state: DeliveryState,
}

impl DeliveryRecord {
    pub fn new(
        topic: impl Into<String>,
        key: impl Into<String>,
        payload: Vec<u8>,
        ack_mode: AckMode,
    ) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            ack_mode,
            deadline: None,
            attempts: 0,
            state: DeliveryState::Pending,
        }
    }

    /// No attempt starts at or after `at`; `budget` is what the caller was given
    pub fn with_deadline(mut self, at: Instant, budget: Duration) -> Self {
        self.deadline = Some((at, budget));
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|at| now >= at)
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Count a new attempt and move back to `Pending`
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.transition(DeliveryState::Pending);
    }

    /// Apply an attempt's outcome
    ///
    /// `Ok(Some(_))` is success, `Ok(None)` means the record is `Retrying`,
    /// `Err(_)` is a terminal failure.
    pub fn apply(
        &mut self,
        outcome: AttemptOutcome,
        max_attempts: u32,
    ) -> Result<Option<Delivered>, DeliveryFailure> {
        let transient = match outcome {
            AttemptOutcome::Acknowledged(offset) => {
                self.transition(DeliveryState::Acknowledged);
                return Ok(Some(Delivered {
                    offset,
                    attempts: self.attempts,
                }));
            }
            AttemptOutcome::Rejected(reason) => {
                self.transition(DeliveryState::Failed);
                return Err(DeliveryFailure::Rejected(reason));
            }
            AttemptOutcome::Overloaded => {
                self.transition(DeliveryState::Failed);
                return Err(DeliveryFailure::Overloaded);
            }
            AttemptOutcome::Closed => {
                self.transition(DeliveryState::Failed);
                return Err(DeliveryFailure::Closed);
            }
            AttemptOutcome::TimedOut => "broker acknowledgment timed out".to_string(),
            AttemptOutcome::Unavailable(e) => e,
        };

        if self.attempts >= max_attempts {
            self.transition(DeliveryState::Failed);
            return Err(DeliveryFailure::Exhausted {
                attempts: self.attempts,
                last_error: transient,
            });
        }

        self.transition(DeliveryState::Retrying);
        debug!(key = %self.key, attempt = self.attempts, error = %transient, "Attempt failed");
        Ok(None)
    }

    /// Give up because the deadline passed before the next attempt
    pub fn expire(&mut self) -> DeliveryFailure {
        self.transition(DeliveryState::Failed);
        let budget = self.deadline.map(|(_, budget)| budget).unwrap_or_default();
        DeliveryFailure::DeadlineExceeded(budget)
    }

    fn transition(&mut self, to: DeliveryState) {
        if self.state != to {
            debug!(key = %self.key, from = ?self.state, to = ?to, "Delivery state change");
        }
        self.state = to;
    }
}

impl From<PublishError> for DeliveryFailure {
    /// Refusals at enqueue time; nothing reached the broker
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Overloaded { .. } => DeliveryFailure::Overloaded,
            PublishError::Closed => DeliveryFailure::Closed,
            PublishError::BrokerUnavailable(e) => DeliveryFailure::Exhausted {
                attempts: 0,
                last_error: e,
            },
        }
    }
}

/// Hands records to the publisher with a retry policy and waits, up to a
/// hard deadline, for their terminal state
#[derive(Clone)]
pub struct DeliveryTracker {
    publisher: PublisherClient,
    config: DeliveryConfig,
}

impl DeliveryTracker {
    pub fn new(publisher: PublisherClient, config: DeliveryConfig) -> Self {
        Self { publisher, config }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn publisher(&self) -> &PublisherClient {
        &self.publisher
    }

    /// Publish `payload` and wait for a terminal state
    ///
    /// Always resolves within the configured deadline. Retries run inside
    /// the record's publisher lane, which holds back later records with the
    /// same key until this one settles. The wait runs on a spawned task, so
    /// dropping this future does not cancel the delivery.
    pub async fn deliver(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        ack_mode: AckMode,
    ) -> Result<Delivered, DeliveryFailure> {
        let budget = self.config.deadline;
        let deadline = Instant::now() + budget;
        let record =
            DeliveryRecord::new(topic, key, payload, ack_mode).with_deadline(deadline, budget);
        let publisher = self.publisher.clone();
        let retry = self.config.retry;

        let task = tokio::spawn(async move {
            let key = record.key.clone();
            let delivery = async move {
                match publisher.submit(record, retry).await {
                    Ok(handle) => handle.outcome().await,
                    Err(refused) => Err(DeliveryFailure::from(refused)),
                }
            };

            match timeout_at(deadline, delivery).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        key = %key,
                        deadline_ms = budget.as_millis() as u64,
                        "Delivery deadline exceeded"
                    );
                    Err(DeliveryFailure::DeadlineExceeded(budget))
                }
            }
        });

        task.await
            .unwrap_or_else(|e| Err(DeliveryFailure::Aborted(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DeliveryRecord {
        DeliveryRecord::new("orders", "1001", b"{}".to_vec(), AckMode::All)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };

        assert_eq!(config.backoff_for(1), Duration::from_millis(10));
        assert_eq!(config.backoff_for(2), Duration::from_millis(20));
        assert_eq!(config.backoff_for(3), Duration::from_millis(40));
        assert_eq!(config.backoff_for(4), Duration::from_millis(50));
        assert_eq!(config.backoff_for(u32::MAX), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_acknowledged_is_terminal_success() {
        let mut record = record();
        record.begin_attempt();

        let result = record.apply(AttemptOutcome::Acknowledged(Some(7)), 3);

        assert_eq!(result, Ok(Some(Delivered { offset: Some(7), attempts: 1 })));
        assert_eq!(record.state(), DeliveryState::Acknowledged);
        assert!(record.state().is_terminal());
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_max_attempts() {
        let mut record = record();

        record.begin_attempt();
        assert_eq!(record.apply(AttemptOutcome::TimedOut, 3), Ok(None));
        assert_eq!(record.state(), DeliveryState::Retrying);

        record.begin_attempt();
        assert_eq!(record.state(), DeliveryState::Pending);
        assert_eq!(
            record.apply(AttemptOutcome::Unavailable("refused".into()), 3),
            Ok(None)
        );

        record.begin_attempt();
        let result = record.apply(AttemptOutcome::Unavailable("refused".into()), 3);
        assert_eq!(
            result,
            Err(DeliveryFailure::Exhausted {
                attempts: 3,
                last_error: "refused".into()
            })
        );
        assert_eq!(record.state(), DeliveryState::Failed);
    }

    #[tokio::test]
    async fn test_rejected_fails_without_retry() {
        let mut record = record();
        record.begin_attempt();

        let result = record.apply(AttemptOutcome::Rejected("too large".into()), 3);

        assert_eq!(result, Err(DeliveryFailure::Rejected("too large".into())));
        assert_eq!(record.state(), DeliveryState::Failed);
        assert_eq!(record.attempts(), 1);
    }

    #[tokio::test]
    async fn test_overloaded_surfaces_distinctly() {
        let mut record = record();
        record.begin_attempt();

        assert_eq!(
            record.apply(AttemptOutcome::Overloaded, 3),
            Err(DeliveryFailure::Overloaded)
        );
    }

    #[test]
    fn test_expiry_reports_the_callers_budget() {
        let budget = Duration::from_secs(5);
        let mut record = record().with_deadline(Instant::now(), budget);

        assert!(record.is_expired(Instant::now()));
        assert_eq!(record.expire(), DeliveryFailure::DeadlineExceeded(budget));
        assert_eq!(record.state(), DeliveryState::Failed);
        assert!(!DeliveryRecord::new("t", "k", vec![], AckMode::All).is_expired(Instant::now()));
    }

    #[test]
    fn test_enqueue_refusals_map_to_failures() {
        assert_eq!(
            DeliveryFailure::from(PublishError::Overloaded { lane: 1 }),
            DeliveryFailure::Overloaded
        );
        assert_eq!(DeliveryFailure::from(PublishError::Closed), DeliveryFailure::Closed);
    }

    #[test]
    fn test_outcome_folding() {
        assert_eq!(
            AttemptOutcome::from(Ok(PublishResult::TimedOut)),
            AttemptOutcome::TimedOut
        );
        assert_eq!(
            AttemptOutcome::from(Err(PublishError::Overloaded { lane: 2 })),
            AttemptOutcome::Overloaded
        );
        assert_eq!(
            AttemptOutcome::from(Err(PublishError::BrokerUnavailable("x".into()))),
            AttemptOutcome::Unavailable("x".into())
        );
    }
}
