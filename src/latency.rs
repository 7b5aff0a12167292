//! Sliding-window latency tracking per pipeline operation.
//!
//! Samples live in a bounded ring buffer; averages and P95 are computed
//! over the trailing window on demand. Health is advisory only and never
//! gates requests.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::warn;

use crate::config::{LatencyTargets, PolicyConfig};

/// Default trailing window for averages and percentiles.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// A timed pipeline stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Normalization,
    Embedding,
    VectorSearch,
    Rerank,
    ContextBoost,
    TotalRetrieval,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Self::Normalization,
        Self::Embedding,
        Self::VectorSearch,
        Self::Rerank,
        Self::ContextBoost,
        Self::TotalRetrieval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normalization => "normalization",
            Self::Embedding => "embedding",
            Self::VectorSearch => "vectorSearch",
            Self::Rerank => "rerank",
            Self::ContextBoost => "contextBoost",
            Self::TotalRetrieval => "totalRetrieval",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyMetric {
    pub operation: Operation,
    pub duration_ms: f64,
    pub recorded_at: Instant,
}

/// Measures one stage in fractional milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch(Instant);

impl Stopwatch {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.0.elapsed().as_secs_f64() * 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    pub count: usize,
    pub average_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    pub operations: BTreeMap<Operation, OperationSummary>,
    pub healthy: bool,
}

#[derive(Debug)]
pub struct LatencyMonitor {
    samples: Mutex<VecDeque<LatencyMetric>>,
    max_samples: usize,
    window: Duration,
    targets: LatencyTargets,
}

impl Default for LatencyMonitor {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}

impl LatencyMonitor {
    pub fn new(
        targets: LatencyTargets,
        max_samples: usize,
        window: Duration,
    ) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(max_samples)),
            max_samples,
            window,
            targets,
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(
            config.latency_targets,
            config.max_latency_samples,
            config.latency_window(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LatencyMetric>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, operation: Operation, duration_ms: f64) {
        self.record_at(operation, duration_ms, Instant::now());
    }

    fn record_at(&self, operation: Operation, duration_ms: f64, at: Instant) {
        let mut samples = self.lock();
        samples.push_back(LatencyMetric {
            operation,
            duration_ms,
            recorded_at: at,
        });
        while samples.len() > self.max_samples {
            samples.pop_front();
        }
    }

    /// Durations for `operation` recorded within the trailing `window`,
    /// sorted ascending.
    fn window_durations(
        &self,
        operation: Operation,
        window: Duration,
    ) -> Vec<f64> {
        let now = Instant::now();
        let mut durations: Vec<f64> = self
            .lock()
            .iter()
            .filter(|m| {
                m.operation == operation
                    && now.saturating_duration_since(m.recorded_at) <= window
            })
            .map(|m| m.duration_ms)
            .collect();
        durations.sort_by(|a, b| a.total_cmp(b));
        durations
    }

    /// Mean duration over `window`, or 0 when there are no samples.
    pub fn average(&self, operation: Operation, window: Duration) -> f64 {
        let durations = self.window_durations(operation, window);
        if durations.is_empty() {
            return 0.0;
        }
        durations.iter().sum::<f64>() / durations.len() as f64
    }

    /// 95th percentile over `window` (element `floor(n * 0.95)` of the
    /// sorted samples), or 0 when there are no samples.
    pub fn p95(&self, operation: Operation, window: Duration) -> f64 {
        percentile_95(&self.window_durations(operation, window))
    }

    /// True while embedding and search P95 stay under 1.5x their targets
    /// and total retrieval P95 under 1.2x.
    pub fn is_healthy(&self) -> bool {
        let t = &self.targets;
        self.p95(Operation::Embedding, self.window) < t.embedding * 1.5
            && self.p95(Operation::VectorSearch, self.window)
                < t.vector_search * 1.5
            && self.p95(Operation::TotalRetrieval, self.window)
                < t.total_retrieval * 1.2
    }

    /// Per-operation count/average/P95 over the configured window.
    pub fn snapshot(&self) -> LatencySnapshot {
        let operations = Operation::ALL
            .iter()
            .filter_map(|&op| {
                let durations = self.window_durations(op, self.window);
                if durations.is_empty() {
                    return None;
                }
                let summary = OperationSummary {
                    count: durations.len(),
                    average_ms: durations.iter().sum::<f64>()
                        / durations.len() as f64,
                    p95_ms: percentile_95(&durations),
                };
                Some((op, summary))
            })
            .collect();

        let healthy = self.is_healthy();
        if !healthy {
            warn!(
                window_ms = self.window.as_millis() as u64,
                "latency above targets"
            );
        }

        LatencySnapshot {
            operations,
            healthy,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

fn percentile_95(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * 0.95).floor() as usize)
        .min(sorted.len() - 1);
    sorted[idx]
}
