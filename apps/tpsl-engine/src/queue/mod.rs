//! Scheduled monitoring work queue.
//!
//! One job per open order. A single scheduler task owns the timing: every
//! scheduler pass it collects due jobs, orders them by priority and hands
//! them to the handler under a concurrency bound. Failed jobs back off
//! exponentially with jitter; jobs that keep failing are parked in a
//! bounded dead-letter buffer, and jobs past their lifetime cap expire.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, RetryConfig};
use crate::domain::{AccountId, Direction, OrderId, Position, Symbol, Timestamp};
use crate::health::ComponentHealth;

/// How often the scheduler scans for due jobs.
const SCHEDULER_TICK: Duration = Duration::from_millis(200);

/// Dead-letter buffer cap; oldest entries are evicted first.
const MAX_DEAD_LETTERS: usize = 256;

/// Priority bonus for orders carrying both TP and SL thresholds.
const BOTH_THRESHOLDS_BONUS: u64 = 1_000;

/// A scheduled monitoring job: an immutable snapshot of one order.
///
/// The worker re-reads the authoritative position on every tick; the
/// snapshot exists for priority, rejection checks and dead-letter
/// reporting without a store round-trip.
#[derive(Debug, Clone)]
pub struct MonitoringJob {
    /// Order under monitoring.
    pub order_id: OrderId,
    /// Owning account.
    pub account_id: AccountId,
    /// Market symbol of the position.
    pub symbol: Symbol,
    /// Long or short.
    pub direction: Direction,
    /// Staked amount at enqueue time.
    pub amount: Decimal,
    /// Leverage multiplier.
    pub leverage: u32,
    /// Open price of the position.
    pub open_price: Decimal,
    /// Take-profit threshold snapshot.
    pub take_profit: Option<Decimal>,
    /// Stop-loss threshold snapshot.
    pub stop_loss: Option<Decimal>,
    /// Dispatch priority; higher runs first when ticks contend.
    pub priority: u64,
    /// When the job was enqueued.
    pub created_at: Timestamp,
}

impl MonitoringJob {
    /// Build a job from a position snapshot.
    ///
    /// Priority scales with notional volume; positions watched on both
    /// sides get a flat bonus so a double-threshold order is never
    /// starved by a larger single-threshold one at the same notional.
    #[must_use]
    pub fn for_position(position: &Position) -> Self {
        let mut priority = position.volume().round().to_u64().unwrap_or(u64::MAX);
        if position.take_profit.is_some() && position.stop_loss.is_some() {
            priority = priority.saturating_add(BOTH_THRESHOLDS_BONUS);
        }
        Self {
            order_id: position.order_id.clone(),
            account_id: position.account_id.clone(),
            symbol: position.symbol.clone(),
            direction: position.direction,
            amount: position.amount,
            leverage: position.leverage,
            open_price: position.open_price,
            take_profit: position.take_profit,
            stop_loss: position.stop_loss,
            priority,
            created_at: Timestamp::now(),
        }
    }

    /// Whether the snapshot carries at least one threshold.
    #[must_use]
    pub const fn has_thresholds(&self) -> bool {
        self.take_profit.is_some() || self.stop_loss.is_some()
    }
}

/// What `enqueue` did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Job accepted and scheduled.
    Scheduled,
    /// Order already has a job; the existing one was kept.
    Duplicate,
    /// Job carries no threshold; nothing to monitor, not retryable.
    Rejected,
}

/// Result of one job execution, decided by the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Monitoring is finished (settled, or nothing left to watch).
    Completed,
    /// Nothing happened this tick; run again at the normal interval.
    Reschedule,
    /// Transient failure; retry with backoff.
    Retry,
    /// Unrecoverable condition; park the job.
    DeadLetter(DeadLetterReason),
}

/// Why a job was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Position no longer carries any TP/SL threshold.
    NoThresholds,
    /// Position disappeared from the store.
    OrderVanished,
    /// Consecutive failure budget exhausted.
    RetriesExhausted,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoThresholds => write!(f, "no_thresholds"),
            Self::OrderVanished => write!(f, "order_vanished"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
        }
    }
}

/// A parked job, kept for operator inspection.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    /// Order that was being monitored.
    pub order_id: OrderId,
    /// Owning account.
    pub account_id: AccountId,
    /// Market symbol.
    pub symbol: Symbol,
    /// Why the job was parked.
    pub reason: DeadLetterReason,
    /// Consecutive failures at the time of parking.
    pub failures: u32,
    /// When the job was originally enqueued.
    pub enqueued_at: Timestamp,
    /// When the job was parked.
    pub parked_at: Timestamp,
}

/// Lifecycle events published by the queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Job finished normally and was removed.
    JobCompleted(OrderId),
    /// Job exceeded its lifetime cap and was removed.
    JobExpired(OrderId),
    /// Job was parked in the dead-letter buffer.
    JobDeadLettered(OrderId, DeadLetterReason),
}

/// Executes one monitoring tick for a job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one tick and report what the queue should do next.
    async fn execute(&self, job: &MonitoringJob) -> JobOutcome;
}

#[derive(Debug)]
struct JobState {
    job: MonitoringJob,
    next_due: Instant,
    enqueued_at: Instant,
    consecutive_failures: u32,
    in_flight: bool,
}

struct DispatchCandidate {
    order_id: OrderId,
    priority: u64,
}

impl PartialEq for DispatchCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for DispatchCandidate {}

impl PartialOrd for DispatchCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DispatchCandidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority.cmp(&other.priority)
    }
}

/// Work queue: at most one scheduled job per order.
pub struct WorkQueue<H: JobHandler> {
    handler: Arc<H>,
    jobs: Mutex<HashMap<OrderId, JobState>>,
    dead_letters: Mutex<VecDeque<DeadLetterEntry>>,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
    max_lifetime: Duration,
    max_consecutive_failures: u32,
    retry: RetryConfig,
    event_tx: broadcast::Sender<QueueEvent>,
}

impl<H: JobHandler + 'static> WorkQueue<H> {
    /// Create a queue driving `handler` under `config`'s schedule.
    #[must_use]
    pub fn new(handler: Arc<H>, config: &EngineConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            handler,
            jobs: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(config.worker_concurrency)),
            poll_interval: config.poll_interval(),
            max_lifetime: config.max_job_lifetime(),
            max_consecutive_failures: config.max_consecutive_failures,
            retry: config.retry.clone(),
            event_tx,
        }
    }

    /// Enqueue a job, keyed by order id.
    ///
    /// Thresholdless jobs are rejected outright; an order that already
    /// has a job keeps the existing one, so re-enqueueing never
    /// duplicates work.
    pub fn enqueue(&self, job: MonitoringJob) -> EnqueueOutcome {
        if !job.has_thresholds() {
            warn!(order_id = %job.order_id, "rejecting job without thresholds");
            return EnqueueOutcome::Rejected;
        }
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.order_id) {
            return EnqueueOutcome::Duplicate;
        }
        debug!(order_id = %job.order_id, priority = job.priority, "job enqueued");
        let now = Instant::now();
        jobs.insert(
            job.order_id.clone(),
            JobState {
                job,
                next_due: now,
                enqueued_at: now,
                consecutive_failures: 0,
                in_flight: false,
            },
        );
        EnqueueOutcome::Scheduled
    }

    /// Remove a job. Idempotent; an in-flight execution finishes but its
    /// outcome is discarded.
    pub fn remove(&self, order_id: &OrderId) -> bool {
        self.jobs.lock().remove(order_id).is_some()
    }

    /// Whether an order currently has a scheduled job.
    #[must_use]
    pub fn contains(&self, order_id: &OrderId) -> bool {
        self.jobs.lock().contains_key(order_id)
    }

    /// Whether any scheduled job watches the given symbol.
    #[must_use]
    pub fn symbol_referenced(&self, symbol: &Symbol) -> bool {
        self.jobs
            .lock()
            .values()
            .any(|state| &state.job.symbol == symbol)
    }

    /// Number of scheduled jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Whether the queue has no scheduled jobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Snapshot of the dead-letter buffer, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    /// Number of parked jobs.
    #[must_use]
    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().len()
    }

    /// Subscribe to queue lifecycle events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    /// Scheduler health: unhealthy when dispatch is stalled, meaning a
    /// due job has been waiting several poll intervals without running.
    #[must_use]
    pub fn health(&self) -> ComponentHealth {
        let stall_threshold = self.poll_interval * 3;
        let now = Instant::now();
        let stalled = self
            .jobs
            .lock()
            .values()
            .any(|state| !state.in_flight && now.duration_since(state.next_due) > stall_threshold);
        if stalled {
            ComponentHealth::unhealthy("work_queue", vec!["dispatch_stalled".to_string()])
        } else {
            ComponentHealth::healthy("work_queue")
        }
    }

    /// Run the scheduler until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(SCHEDULER_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("work queue scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.dispatch_due(),
                () = shutdown.cancelled() => {
                    info!("work queue scheduler stopping");
                    break;
                }
            }
        }
    }

    /// One scheduler pass: expire stale jobs, then dispatch due ones by
    /// priority while permits last.
    fn dispatch_due(self: &Arc<Self>) {
        let now = Instant::now();
        let mut due = BinaryHeap::new();

        {
            let mut jobs = self.jobs.lock();
            let mut expired = Vec::new();
            for (order_id, state) in jobs.iter() {
                if !state.in_flight && now.duration_since(state.enqueued_at) > self.max_lifetime {
                    expired.push(order_id.clone());
                }
            }
            for order_id in expired {
                jobs.remove(&order_id);
                warn!(order_id = %order_id, "monitoring job exceeded lifetime cap, expiring");
                let _ = self.event_tx.send(QueueEvent::JobExpired(order_id));
            }

            for (order_id, state) in jobs.iter_mut() {
                if !state.in_flight && state.next_due <= now {
                    due.push(DispatchCandidate {
                        order_id: order_id.clone(),
                        priority: state.job.priority,
                    });
                }
            }
        }

        while let Some(candidate) = due.pop() {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                // All workers busy; remaining due jobs wait for the next pass.
                break;
            };

            let job = {
                let mut jobs = self.jobs.lock();
                let Some(state) = jobs.get_mut(&candidate.order_id) else {
                    continue;
                };
                state.in_flight = true;
                state.job.clone()
            };

            let queue = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = queue.handler.execute(&job).await;
                queue.apply_outcome(&job.order_id, outcome);
                drop(permit);
            });
        }
    }

    fn apply_outcome(&self, order_id: &OrderId, outcome: JobOutcome) {
        let parked = {
            let mut jobs = self.jobs.lock();
            let Some(state) = jobs.get_mut(order_id) else {
                // Removed while running; discard the outcome.
                return;
            };
            state.in_flight = false;

            match outcome {
                JobOutcome::Completed => {
                    jobs.remove(order_id);
                    let _ = self
                        .event_tx
                        .send(QueueEvent::JobCompleted(order_id.clone()));
                    None
                }
                JobOutcome::Reschedule => {
                    state.consecutive_failures = 0;
                    state.next_due = Instant::now() + self.poll_interval;
                    None
                }
                JobOutcome::Retry => {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.max_consecutive_failures {
                        let entry = Self::park_entry(state, DeadLetterReason::RetriesExhausted);
                        jobs.remove(order_id);
                        Some(entry)
                    } else {
                        let delay = backoff_delay(&self.retry, state.consecutive_failures);
                        debug!(
                            order_id = %order_id,
                            failures = state.consecutive_failures,
                            delay_ms = delay.as_millis() as u64,
                            "job retry scheduled"
                        );
                        state.next_due = Instant::now() + delay;
                        None
                    }
                }
                JobOutcome::DeadLetter(reason) => {
                    let entry = Self::park_entry(state, reason);
                    jobs.remove(order_id);
                    Some(entry)
                }
            }
        };

        if let Some(entry) = parked {
            warn!(
                order_id = %entry.order_id,
                reason = %entry.reason,
                failures = entry.failures,
                "job dead-lettered"
            );
            let mut dead = self.dead_letters.lock();
            if dead.len() >= MAX_DEAD_LETTERS
                && let Some(evicted) = dead.pop_front()
            {
                warn!(
                    order_id = %evicted.order_id,
                    reason = %evicted.reason,
                    "dead-letter buffer full, evicting oldest entry"
                );
            }
            let event = QueueEvent::JobDeadLettered(entry.order_id.clone(), entry.reason);
            dead.push_back(entry);
            drop(dead);
            let _ = self.event_tx.send(event);
        }
    }

    fn park_entry(state: &JobState, reason: DeadLetterReason) -> DeadLetterEntry {
        DeadLetterEntry {
            order_id: state.job.order_id.clone(),
            account_id: state.job.account_id.clone(),
            symbol: state.job.symbol.clone(),
            reason,
            failures: state.consecutive_failures,
            enqueued_at: state.job.created_at,
            parked_at: Timestamp::now(),
        }
    }
}

/// Exponential backoff with jitter for the given failure count (1-based).
pub(crate) fn backoff_delay(retry: &RetryConfig, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(32);
    let base = retry.initial_backoff_ms as f64 * retry.backoff_multiplier.powi(exponent as i32);
    let capped = base.min(retry.max_backoff_ms as f64);
    let jitter = rand::rng().random_range(1.0 - retry.jitter_factor..=1.0 + retry.jitter_factor);
    Duration::from_millis((capped * jitter).max(0.0) as u64)
}
