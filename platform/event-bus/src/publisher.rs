//! Batching publisher client
//!
//! Records are routed to a lane by a stable hash of their key. Each lane owns
//! a bounded queue and a single task that lingers to fill a batch, then
//! flushes it through a pooled broker session. A lane never starts a batch
//! before the previous one is flushed, and retries happen in the lane: while
//! a record backs off, later records with its key wait behind it. Records
//! sharing a key therefore reach the broker in submission order.

use crate::batch::{runs_by_ack_mode, Batch};
use crate::delivery::{AttemptOutcome, Delivered, DeliveryFailure, DeliveryRecord, RetryConfig};
use crate::pool::ConnectionPool;
use crate::{AckMode, BusError, BusRecord, BusResult};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// What a lane does when its queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for room in the queue
    Block,
    /// Fail the publish with `PublishError::Overloaded`
    Reject,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "reject" => Ok(OverflowPolicy::Reject),
            other => Err(BusError::InvalidConfig(format!(
                "unknown overflow policy '{}', expected block|reject",
                other
            ))),
        }
    }
}

/// Publisher tuning
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Longest wait for broker acknowledgment of a flushed batch
    pub ack_timeout: Duration,
    /// How long a lane waits for more records after the first one arrives
    pub linger: Duration,
    pub batch_max_records: usize,
    pub batch_max_bytes: usize,
    /// Larger payloads are rejected before they are queued
    pub max_payload_bytes: usize,
    /// Queue depth per lane
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub lanes: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(1000),
            linger: Duration::from_millis(5),
            batch_max_records: 100,
            batch_max_bytes: 1024 * 1024,
            max_payload_bytes: 1024 * 1024,
            queue_capacity: 1024,
            overflow: OverflowPolicy::Block,
            lanes: 4,
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> BusResult<()> {
        let zero = [
            ("lanes", self.lanes),
            ("queue_capacity", self.queue_capacity),
            ("batch_max_records", self.batch_max_records),
            ("batch_max_bytes", self.batch_max_bytes),
            ("max_payload_bytes", self.max_payload_bytes),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);

        if let Some((name, _)) = zero {
            return Err(BusError::InvalidConfig(format!("{} must be greater than 0", name)));
        }
        if self.ack_timeout.is_zero() {
            return Err(BusError::InvalidConfig("ack_timeout must be greater than 0".to_string()));
        }
        Ok(())
    }
}

/// Outcome of one publish attempt as reported by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    /// Persisted; carries the broker offset when the ack mode yields one
    Acknowledged(Option<u64>),
    /// No acknowledgment within `ack_timeout`; the record may or may not be stored
    TimedOut,
    /// The broker refused the record; resending the same bytes cannot succeed
    Rejected(String),
}

/// Failures that prevent a publish from producing a `PublishResult`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("publisher overloaded: lane {lane} queue is full")]
    Overloaded { lane: usize },

    #[error("publisher is closed")]
    Closed,
}

type Reply = Result<PublishResult, PublishError>;

/// Final word on a queued record
struct Settled {
    /// What the broker said to the last attempt
    last: Reply,
    /// Terminal state under the record's retry policy
    outcome: Result<Delivered, DeliveryFailure>,
}

/// Future resolving to the broker's answer for one record
///
/// Awaiting the handle yields the last attempt's `PublishResult`;
/// [`DeliveryHandle::outcome`] yields the terminal delivery state instead.
/// Dropping the handle abandons the answer only; the record is still flushed.
pub struct DeliveryHandle {
    rx: oneshot::Receiver<Settled>,
}

impl DeliveryHandle {
    fn resolved(last: Reply, outcome: Result<Delivered, DeliveryFailure>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Settled { last, outcome });
        Self { rx }
    }

    /// Wait for the record to be acknowledged or to fail for good
    pub async fn outcome(self) -> Result<Delivered, DeliveryFailure> {
        match self.rx.await {
            Ok(settled) => settled.outcome,
            Err(_) => Err(DeliveryFailure::Closed),
        }
    }
}

impl Future for DeliveryHandle {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.map(|s| s.last).unwrap_or(Err(PublishError::Closed)))
    }
}

/// A record held by a lane until it settles
pub(crate) struct QueuedRecord {
    delivery: DeliveryRecord,
    dedup_id: String,
    retry: RetryConfig,
    /// Set while backing off; no attempt starts before it
    not_before: Option<Instant>,
    reply: oneshot::Sender<Settled>,
}

impl QueuedRecord {
    pub(crate) fn new(delivery: DeliveryRecord, retry: RetryConfig) -> (Self, DeliveryHandle) {
        let (reply, rx) = oneshot::channel();
        let dedup_id = dedup_id(&delivery.key, &delivery.payload);
        (
            Self {
                delivery,
                dedup_id,
                retry,
                not_before: None,
                reply,
            },
            DeliveryHandle { rx },
        )
    }

    pub(crate) fn key(&self) -> &str {
        &self.delivery.key
    }

    pub(crate) fn ack_mode(&self) -> AckMode {
        self.delivery.ack_mode
    }

    pub(crate) fn payload_len(&self) -> usize {
        self.delivery.payload.len()
    }

    fn to_bus_record(&self) -> BusRecord {
        BusRecord::new(
            self.delivery.topic.clone(),
            self.delivery.key.clone(),
            self.delivery.payload.clone(),
        )
        .with_dedup_id(self.dedup_id.clone())
    }

    fn is_due(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| now >= at)
    }

    /// When this record next needs the lane's attention
    fn wake_at(&self) -> Option<Instant> {
        match (self.not_before, self.delivery.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fold one attempt's reply into the record; returns it if it must retry
    fn settle_attempt(mut self, lane: usize, reply: Reply) -> Option<Self> {
        self.delivery.begin_attempt();
        match self
            .delivery
            .apply(AttemptOutcome::from(reply.clone()), self.retry.max_attempts)
        {
            Ok(Some(delivered)) => {
                if delivered.attempts > 1 {
                    info!(
                        lane,
                        key = %self.delivery.key,
                        attempts = delivered.attempts,
                        "Delivery succeeded after retry"
                    );
                }
                self.resolve(reply, Ok(delivered));
                None
            }
            Ok(None) => {
                let backoff = self.retry.backoff_for(self.delivery.attempts());
                warn!(
                    lane,
                    key = %self.delivery.key,
                    attempt = self.delivery.attempts(),
                    max_attempts = self.retry.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "Delivery attempt failed, retrying with backoff"
                );
                self.not_before = Some(Instant::now() + backoff);
                Some(self)
            }
            Err(failure) => {
                warn!(
                    lane,
                    key = %self.delivery.key,
                    attempts = self.delivery.attempts(),
                    error = %failure,
                    "Delivery failed"
                );
                self.resolve(reply, Err(failure));
                None
            }
        }
    }

    fn expire(mut self, lane: usize) {
        let failure = self.delivery.expire();
        warn!(
            lane,
            key = %self.delivery.key,
            attempts = self.delivery.attempts(),
            "Deadline passed before the next attempt, giving up"
        );
        self.resolve(Ok(PublishResult::TimedOut), Err(failure));
    }

    fn resolve(self, last: Reply, outcome: Result<Delivered, DeliveryFailure>) {
        // The caller may have stopped waiting
        let _ = self.reply.send(Settled { last, outcome });
    }
}

/// Cloneable handle to the batching publisher
#[derive(Clone)]
pub struct PublisherClient {
    inner: Arc<Inner>,
}

struct Inner {
    lanes: Vec<mpsc::Sender<QueuedRecord>>,
    config: Arc<PublisherConfig>,
    pool: Arc<ConnectionPool>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PublisherClient {
    /// Spawn the lane tasks; must be called inside a tokio runtime
    pub fn start(pool: ConnectionPool, config: PublisherConfig) -> BusResult<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let pool = Arc::new(pool);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut lanes = Vec::with_capacity(config.lanes);
        let mut tasks = Vec::with_capacity(config.lanes);
        for lane in 0..config.lanes {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            lanes.push(tx);
            tasks.push(tokio::spawn(run_lane(
                lane,
                rx,
                shutdown_rx.clone(),
                pool.clone(),
                config.clone(),
            )));
        }

        info!(
            lanes = config.lanes,
            pool_size = pool.size(),
            queue_capacity = config.queue_capacity,
            linger_ms = config.linger.as_millis() as u64,
            "Publisher started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                lanes,
                config,
                pool,
                closed: AtomicBool::new(false),
                shutdown,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    /// Queue a record for a single publish attempt
    ///
    /// Returns once the record is queued (or refused); await the handle for
    /// the broker's answer. Oversized payloads resolve to `Rejected` without
    /// touching the broker.
    pub async fn publish(
        &self,
        topic: &str,
        key: &str,
        value: Vec<u8>,
        ack_mode: AckMode,
    ) -> Result<DeliveryHandle, PublishError> {
        self.submit(DeliveryRecord::new(topic, key, value, ack_mode), RetryConfig::once())
            .await
    }

    /// Queue a record that its lane retries under `retry`
    ///
    /// Transient failures back off inside the lane. Until the record settles
    /// the lane sends no later record with the same key.
    pub async fn submit(
        &self,
        record: DeliveryRecord,
        retry: RetryConfig,
    ) -> Result<DeliveryHandle, PublishError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }

        let max = self.inner.config.max_payload_bytes;
        if record.payload.len() > max {
            let reason = format!(
                "payload of {} bytes exceeds the {} byte limit",
                record.payload.len(),
                max
            );
            return Ok(DeliveryHandle::resolved(
                Ok(PublishResult::Rejected(reason.clone())),
                Err(DeliveryFailure::Rejected(reason)),
            ));
        }

        let lane = lane_for(&record.key, self.inner.lanes.len());
        let key = record.key.clone();
        let (queued, handle) = QueuedRecord::new(record, retry);
        let sender = &self.inner.lanes[lane];

        match self.inner.config.overflow {
            OverflowPolicy::Block => sender
                .send(queued)
                .await
                .map_err(|_| PublishError::Closed)?,
            OverflowPolicy::Reject => sender.try_send(queued).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(lane, key = %key, "Publisher lane full, rejecting record");
                    PublishError::Overloaded { lane }
                }
                mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
            })?,
        }

        Ok(handle)
    }

    /// All pooled sessions are connected
    pub fn is_connected(&self) -> bool {
        self.inner.pool.is_healthy()
    }

    /// Stop accepting records, settle what is queued, and wait for the lanes
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown.send(true);

        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Publisher lane task ended abnormally");
            }
        }
        info!("Publisher closed");
    }
}

/// Stable lane index for a key (FNV-1a)
pub(crate) fn lane_for(key: &str, lanes: usize) -> usize {
    let hash = key.bytes().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
        (hash ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    });
    (hash % lanes as u64) as usize
}

/// `<key>-<first 16 hex chars of sha256(value)>`
///
/// Retries of one record carry the same id, letting the broker discard a
/// resend whose first attempt was stored but not acknowledged in time.
pub(crate) fn dedup_id(key: &str, value: &[u8]) -> String {
    let digest = Sha256::digest(value);
    let hex: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", key, hex)
}

async fn run_lane(
    lane: usize,
    mut rx: mpsc::Receiver<QueuedRecord>,
    mut shutdown: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
    config: Arc<PublisherConfig>,
) {
    // Taken off the queue but not settled, in submission order
    let mut waiting: VecDeque<QueuedRecord> = VecDeque::new();
    let mut batch = Batch::new(config.batch_max_records, config.batch_max_bytes);
    let mut closing = false;
    let mut drained = false;

    loop {
        top_up(&mut rx, &mut waiting, &config, &mut drained);

        let records = take_batch(lane, &mut waiting, &mut batch, Instant::now());
        if !records.is_empty() {
            let retry = flush(lane, records, &pool, &config).await;
            // Back in front of anything that arrived later
            for record in retry.into_iter().rev() {
                waiting.push_front(record);
            }
            continue;
        }

        // Nothing sendable: wait for a new record or the next backoff to end
        let wake = next_wake(&waiting);
        if drained && wake.is_none() {
            break;
        }

        tokio::select! {
            biased;
            maybe = rx.recv(), if !drained => match maybe {
                Some(record) => {
                    waiting.push_back(record);
                    linger(&mut rx, &mut waiting, &config, &mut drained).await;
                }
                None => drained = true,
            },
            _ = shutdown.changed(), if !closing => {
                // Refuse new records; recv keeps yielding what is already queued
                closing = true;
                rx.close();
            }
            _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
            else => break,
        }
    }

    debug!(lane, "Publisher lane drained");
}

/// Earliest time a waiting record can make progress
///
/// Only the first record of each key can be sent next; the others matter
/// for their deadlines alone.
fn next_wake(waiting: &VecDeque<QueuedRecord>) -> Option<Instant> {
    let mut seen: HashSet<&str> = HashSet::new();
    waiting
        .iter()
        .filter_map(|record| {
            if seen.insert(record.key()) {
                record.wake_at()
            } else {
                record.delivery.deadline()
            }
        })
        .min()
}

/// Pull already-queued records without waiting
fn top_up(
    rx: &mut mpsc::Receiver<QueuedRecord>,
    waiting: &mut VecDeque<QueuedRecord>,
    config: &PublisherConfig,
    drained: &mut bool,
) {
    while !*drained && waiting.len() < config.batch_max_records {
        match rx.try_recv() {
            Ok(record) => waiting.push_back(record),
            Err(mpsc::error::TryRecvError::Empty) => break,
            Err(mpsc::error::TryRecvError::Disconnected) => *drained = true,
        }
    }
}

/// After an idle lane wakes up, wait up to `linger` for a fuller batch
async fn linger(
    rx: &mut mpsc::Receiver<QueuedRecord>,
    waiting: &mut VecDeque<QueuedRecord>,
    config: &PublisherConfig,
    drained: &mut bool,
) {
    let mut bytes: usize = waiting.iter().map(QueuedRecord::payload_len).sum();
    let timer = sleep(config.linger);
    tokio::pin!(timer);

    while waiting.len() < config.batch_max_records && bytes < config.batch_max_bytes {
        tokio::select! {
            biased;
            maybe = rx.recv() => match maybe {
                Some(record) => {
                    bytes += record.payload_len();
                    waiting.push_back(record);
                }
                None => {
                    *drained = true;
                    break;
                }
            },
            _ = &mut timer => break,
        }
    }
}

/// Move the next batch out of `waiting`
///
/// Records are taken in order. One that cannot go now (backing off, or the
/// batch is full) holds back every later record with its key. Records whose
/// deadline has passed are failed here without being sent.
fn take_batch(
    lane: usize,
    waiting: &mut VecDeque<QueuedRecord>,
    batch: &mut Batch,
    now: Instant,
) -> Vec<QueuedRecord> {
    let mut held: HashSet<String> = HashSet::new();
    let mut kept = VecDeque::with_capacity(waiting.len());

    while let Some(record) = waiting.pop_front() {
        if record.delivery.is_expired(now) {
            record.expire(lane);
            continue;
        }
        if held.contains(record.key()) || !record.is_due(now) || batch.is_full() {
            held.insert(record.key().to_string());
            kept.push_back(record);
            continue;
        }
        batch.push(record);
    }

    *waiting = kept;
    batch.drain()
}

/// Send one batch and settle each record's attempt
///
/// Returns the records still owed an attempt, in batch order: those backing
/// off and those held back behind an earlier failure of their key.
async fn flush(
    lane: usize,
    records: Vec<QueuedRecord>,
    pool: &ConnectionPool,
    config: &PublisherConfig,
) -> Vec<QueuedRecord> {
    let count = records.len();
    let conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            let reply = Err(PublishError::BrokerUnavailable(e.to_string()));
            return records
                .into_iter()
                .filter_map(|record| record.settle_attempt(lane, reply.clone()))
                .collect();
        }
    };

    let mut retry = Vec::new();
    let mut held: HashSet<String> = HashSet::new();

    for (ack_mode, run) in runs_by_ack_mode(records) {
        // Keys that failed in an earlier run stay out of this one
        let send: Vec<usize> = (0..run.len())
            .filter(|&i| !held.contains(run[i].key()))
            .collect();
        let mut replies: Vec<Option<Reply>> = vec![None; run.len()];

        if !send.is_empty() {
            let bus_records: Vec<BusRecord> = send.iter().map(|&i| run[i].to_bus_record()).collect();

            match timeout(config.ack_timeout, conn.publish_batch(bus_records, ack_mode)).await {
                Ok(results) => {
                    let mut results = results.into_iter();
                    for &i in &send {
                        replies[i] = match results.next() {
                            // Not sent; waits behind its key's failed record
                            Some(Err(BusError::Held)) => None,
                            Some(result) => Some(classify(result)),
                            None => Some(Err(PublishError::BrokerUnavailable(
                                "transport returned no result for record".to_string(),
                            ))),
                        };
                    }
                }
                Err(_) => {
                    warn!(
                        lane,
                        records = send.len(),
                        ack_timeout_ms = config.ack_timeout.as_millis() as u64,
                        "Broker acknowledgment timed out"
                    );
                    for &i in &send {
                        replies[i] = Some(Ok(PublishResult::TimedOut));
                    }
                }
            }
        }

        for (record, reply) in run.into_iter().zip(replies) {
            let pending = match reply {
                Some(reply) => record.settle_attempt(lane, reply),
                None => Some(record),
            };
            if let Some(record) = pending {
                held.insert(record.key().to_string());
                retry.push(record);
            }
        }
    }

    debug!(lane, records = count, retrying = retry.len(), "Flushed batch");
    retry
}

fn classify(result: BusResult<Option<u64>>) -> Reply {
    match result {
        Ok(offset) => Ok(PublishResult::Acknowledged(offset)),
        Err(BusError::Timeout) => Ok(PublishResult::TimedOut),
        Err(e) if e.is_rejection() => Ok(PublishResult::Rejected(e.to_string())),
        Err(e) => Err(PublishError::BrokerUnavailable(e.to_string())),
    }
}
