//! Rolling health tracking.
//!
//! Components record successes and failures into a rolling window; the
//! engine aggregates the per-component snapshots into one system verdict
//! so degraded conditions (stale prices, failing settlements) are visible
//! before they cause missed triggers.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Maximum samples kept in the rolling buffer.
const MAX_SAMPLES: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleKind {
    Ok,
    Err,
    Skip,
}

#[derive(Debug, Clone)]
struct Sample {
    at: Instant,
    kind: SampleKind,
    latency: Duration,
}

/// Rolling success/failure/latency tracker over a bounded time window.
#[derive(Debug)]
pub struct RollingTracker {
    window: Duration,
    samples: VecDeque<Sample>,
    total_processed: u64,
}

impl RollingTracker {
    /// Create a tracker with the given rolling window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            total_processed: 0,
        }
    }

    /// Record a successful operation and its latency.
    pub fn record_success(&mut self, latency: Duration) {
        self.push(Sample {
            at: Instant::now(),
            kind: SampleKind::Ok,
            latency,
        });
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self) {
        self.push(Sample {
            at: Instant::now(),
            kind: SampleKind::Err,
            latency: Duration::ZERO,
        });
    }

    /// Record a skipped operation (no input available); skips are
    /// tracked separately and never count against the success rate.
    pub fn record_skip(&mut self) {
        self.push(Sample {
            at: Instant::now(),
            kind: SampleKind::Skip,
            latency: Duration::ZERO,
        });
    }

    fn push(&mut self, sample: Sample) {
        self.total_processed += 1;
        self.samples.push_back(sample);
        self.trim(Instant::now());
    }

    fn trim(&mut self, now: Instant) {
        let cutoff = now.checked_sub(self.window);
        while let Some(front) = self.samples.front() {
            let expired = cutoff.is_some_and(|c| front.at < c);
            if expired || self.samples.len() > MAX_SAMPLES {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Success rate over the window, with skips excluded; 1.0 when
    /// nothing decisive has been sampled.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let decisive = self
            .samples
            .iter()
            .filter(|s| s.kind != SampleKind::Skip)
            .count();
        if decisive == 0 {
            return 1.0;
        }
        let ok = self
            .samples
            .iter()
            .filter(|s| s.kind == SampleKind::Ok)
            .count();
        ok as f64 / decisive as f64
    }

    /// Failures inside the window.
    #[must_use]
    pub fn recent_errors(&self) -> u64 {
        self.samples
            .iter()
            .filter(|s| s.kind == SampleKind::Err)
            .count() as u64
    }

    /// Skips inside the window.
    #[must_use]
    pub fn recent_skips(&self) -> u64 {
        self.samples
            .iter()
            .filter(|s| s.kind == SampleKind::Skip)
            .count() as u64
    }

    /// Average latency over successful samples, in milliseconds.
    #[must_use]
    pub fn avg_latency_ms(&self) -> f64 {
        let successes: Vec<&Sample> = self
            .samples
            .iter()
            .filter(|s| s.kind == SampleKind::Ok)
            .collect();
        if successes.is_empty() {
            return 0.0;
        }
        let total: Duration = successes.iter().map(|s| s.latency).sum();
        total.as_secs_f64() * 1000.0 / successes.len() as f64
    }

    /// Total operations seen since creation (not windowed).
    #[must_use]
    pub const fn total_processed(&self) -> u64 {
        self.total_processed
    }

    /// Snapshot of the current window.
    #[must_use]
    pub fn snapshot(&self) -> RollingStats {
        RollingStats {
            total_processed: self.total_processed,
            windowed_samples: self.samples.len() as u64,
            success_rate: self.success_rate(),
            recent_errors: self.recent_errors(),
            recent_skips: self.recent_skips(),
            avg_latency_ms: self.avg_latency_ms(),
        }
    }
}

/// Serializable snapshot of a rolling tracker.
#[derive(Debug, Clone, Serialize)]
pub struct RollingStats {
    /// Total operations since process start.
    pub total_processed: u64,
    /// Samples currently inside the window.
    pub windowed_samples: u64,
    /// Success rate over the window (0.0 to 1.0), skips excluded.
    pub success_rate: f64,
    /// Failures inside the window.
    pub recent_errors: u64,
    /// Operations skipped for lack of input inside the window.
    pub recent_skips: u64,
    /// Average latency of successful operations (milliseconds).
    pub avg_latency_ms: f64,
}

/// Health of a single engine component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Component name.
    pub component: String,
    /// Whether the component considers itself healthy.
    pub is_healthy: bool,
    /// Reasons for an unhealthy verdict.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl ComponentHealth {
    /// A healthy component with no issues.
    #[must_use]
    pub fn healthy(component: &str) -> Self {
        Self {
            component: component.to_string(),
            is_healthy: true,
            issues: Vec::new(),
        }
    }

    /// An unhealthy component with the given issues.
    #[must_use]
    pub fn unhealthy(component: &str, issues: Vec<String>) -> Self {
        Self {
            component: component.to_string(),
            is_healthy: false,
            issues,
        }
    }
}

/// Aggregated system health exposed to the rest of the application.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// Overall verdict: every component healthy and thresholds met.
    pub is_healthy: bool,
    /// Per-component detail.
    pub components: Vec<ComponentHealth>,
    /// Closure success rate over the sampling window.
    pub success_rate: f64,
    /// Failures over the sampling window.
    pub recent_errors: u64,
    /// Average settlement latency (milliseconds).
    pub avg_latency_ms: f64,
    /// Total monitoring ticks processed since start.
    pub ticks_processed: u64,
    /// Orders currently monitored.
    pub monitored_orders: usize,
    /// Jobs parked in the dead-letter queue.
    pub dead_letters: usize,
}
