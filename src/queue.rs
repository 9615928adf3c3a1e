//! Retry queue for samples awaiting publish.
//!
//! The queue is bounded and ordered by `next_retry_at`. When full, the attempt
//! with the oldest capture time is evicted to make room (newest telemetry
//! wins). Transient failures are rescheduled with capped exponential backoff
//! plus jitter until the retry budget is spent.
//!
//! The queue holds no lock and no clock of its own: callers pass `now` and
//! wrap it in a single mutex shared by the sampling handoff and the publish
//! loop.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::publisher::PublishOutcome;
use crate::sample::LocationSample;

/// Default queue capacity. Telemetry value decays with age, so keep it small.
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRY_BUDGET: u32 = 5;

/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Default cap on the backoff delay (before jitter).
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Exponent cap so `base * 2^k` cannot overflow.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Retry scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub retry_budget: u32,

    /// Base delay; retry `k` waits `base * 2^k` before jitter
    pub base_backoff: Duration,

    /// Cap applied to the exponential delay before jitter
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Backoff without jitter for an attempt that has failed `attempt_count`
    /// times: `min(base * 2^attempt_count, max)`.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let factor = 1u32 << attempt_count.min(MAX_BACKOFF_EXPONENT);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Configuration for the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of attempts held at once
    pub capacity: usize,

    /// Retry scheduling
    pub policy: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            policy: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn new(capacity: usize, policy: RetryPolicy) -> Self {
        Self { capacity, policy }
    }
}

/// Delivery bookkeeping for one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishAttempt {
    pub sample: LocationSample,

    /// Number of failed publishes so far
    pub attempt_count: u32,

    /// Reason of the most recent failure
    pub last_error: Option<String>,

    /// Earliest time the attempt may be published again
    pub next_retry_at: Instant,
}

impl PublishAttempt {
    fn new(sample: LocationSample, now: Instant) -> Self {
        Self {
            sample,
            attempt_count: 0,
            last_error: None,
            next_retry_at: now,
        }
    }
}

/// What happened to an attempt handed back through `requeue`.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Rescheduled after a transient failure
    Retrying { next_retry_at: Instant, delay: Duration },

    /// Accepted by the endpoint
    Delivered { attempt: PublishAttempt, status: u16 },

    /// Refused by the endpoint; not retried
    Rejected {
        attempt: PublishAttempt,
        status: u16,
        body: String,
    },

    /// Retry budget spent
    Exhausted { attempt: PublishAttempt },

    /// TLS handshake or trust failure; not retried
    HandshakeFailed { attempt: PublishAttempt },
}

impl Disposition {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Disposition::Retrying { .. })
    }
}

/// Statistics about queue operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Samples enqueued
    pub enqueued: u64,

    /// Attempts evicted on overflow
    pub evicted: u64,

    /// Transient failures rescheduled
    pub retries: u64,

    /// Attempts delivered
    pub delivered: u64,

    /// Attempts rejected by the endpoint
    pub rejected: u64,

    /// Attempts dropped after the retry budget or a handshake failure
    pub failed: u64,

    /// Attempts discarded by `clear`
    pub discarded: u64,
}

/// Bounded retry queue ordered by `next_retry_at`.
pub struct RetryQueue {
    attempts: Vec<PublishAttempt>,
    config: QueueConfig,
    rng: StdRng,
    stats: QueueStats,
}

impl RetryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create a queue whose jitter sequence is reproducible.
    pub fn with_seed(config: QueueConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: QueueConfig, rng: StdRng) -> Self {
        let config = QueueConfig {
            capacity: config.capacity.max(1),
            ..config
        };

        Self {
            attempts: Vec::with_capacity(config.capacity),
            config,
            rng,
            stats: QueueStats::default(),
        }
    }

    /// Add a fresh sample, ready immediately.
    ///
    /// If the queue is full, the attempt with the oldest capture time is
    /// evicted first and returned.
    pub fn enqueue(&mut self, sample: LocationSample, now: Instant) -> Option<PublishAttempt> {
        let evicted = if self.attempts.len() >= self.config.capacity {
            self.evict_oldest()
        } else {
            None
        };

        self.attempts.push(PublishAttempt::new(sample, now));
        self.stats.enqueued += 1;
        evicted
    }

    fn evict_oldest(&mut self) -> Option<PublishAttempt> {
        let index = self
            .attempts
            .iter()
            .enumerate()
            .min_by_key(|(_, a)| a.sample.captured_at)
            .map(|(i, _)| i)?;

        let evicted = self.attempts.swap_remove(index);
        self.stats.evicted += 1;

        warn!(
            captured_at = %evicted.sample.captured_at.wall,
            attempt_count = evicted.attempt_count,
            capacity = self.config.capacity,
            "Retry queue overflow: evicting oldest sample"
        );

        Some(evicted)
    }

    /// Remove and return the ready attempt with the earliest `next_retry_at`,
    /// ties broken by earliest capture time.
    pub fn dequeue_ready(&mut self, now: Instant) -> Option<PublishAttempt> {
        let index = self
            .attempts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.next_retry_at <= now)
            .min_by_key(|(_, a)| (a.next_retry_at, a.sample.captured_at))
            .map(|(i, _)| i)?;

        Some(self.attempts.swap_remove(index))
    }

    /// Settle an attempt according to its publish outcome.
    pub fn requeue(
        &mut self,
        mut attempt: PublishAttempt,
        outcome: &PublishOutcome,
        now: Instant,
    ) -> Disposition {
        match outcome {
            PublishOutcome::Delivered { status } => {
                self.stats.delivered += 1;
                Disposition::Delivered {
                    attempt,
                    status: *status,
                }
            }
            PublishOutcome::Rejected { status, body } => {
                self.stats.rejected += 1;
                attempt.last_error = Some(format!("rejected with status {}", status));
                Disposition::Rejected {
                    attempt,
                    status: *status,
                    body: body.clone(),
                }
            }
            PublishOutcome::HandshakeFailed { reason } => {
                self.stats.failed += 1;
                attempt.last_error = Some(reason.clone());
                Disposition::HandshakeFailed { attempt }
            }
            PublishOutcome::Transient { reason } => {
                attempt.attempt_count += 1;
                attempt.last_error = Some(reason.clone());

                if attempt.attempt_count > self.config.policy.retry_budget {
                    self.stats.failed += 1;
                    warn!(
                        attempts = attempt.attempt_count,
                        retry_budget = self.config.policy.retry_budget,
                        error = %reason,
                        "Retry budget exhausted, dropping sample"
                    );
                    return Disposition::Exhausted { attempt };
                }

                let delay = self.jittered_backoff(attempt.attempt_count);
                let next_retry_at = now + delay;
                attempt.next_retry_at = next_retry_at;

                debug!(
                    attempt_count = attempt.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Scheduling retry"
                );

                self.attempts.push(attempt);
                self.stats.retries += 1;
                Disposition::Retrying {
                    next_retry_at,
                    delay,
                }
            }
        }
    }

    /// Backoff for `attempt_count` plus jitter in `[0, backoff / 2)`.
    fn jittered_backoff(&mut self, attempt_count: u32) -> Duration {
        let backoff = self.config.policy.backoff(attempt_count);
        let half_nanos = (backoff.as_nanos() / 2).min(u64::MAX as u128) as u64;
        let jitter = if half_nanos > 0 {
            Duration::from_nanos(self.rng.gen_range(0..half_nanos))
        } else {
            Duration::ZERO
        };
        backoff + jitter
    }

    /// Earliest `next_retry_at` among queued attempts.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.attempts.iter().map(|a| a.next_retry_at).min()
    }

    /// Discard every queued attempt, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.attempts.len();
        self.attempts.clear();
        self.stats.discarded += count as u64;
        count
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("len", &self.attempts.len())
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}
