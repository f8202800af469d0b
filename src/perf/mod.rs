//! Performance optimizer
//!
//! Aggregates pipeline telemetry (per-stage latency, frame pacing, memory,
//! cache hit rate) into a healthy/degraded verdict and a stable list of
//! recommendations. It only observes; it never cancels slow stages.

pub mod sampler;
mod window;

pub use window::RollingWindow;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;

use crate::config::PerfConfig;

/// Instrumented pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Recognition,
    Parsing,
    Execution,
    Synthesis,
    /// Measured end to end by the caller
    Overall,
}

impl Stage {
    /// Every stage in pipeline order
    pub const ALL: [Self; 5] = [
        Self::Recognition,
        Self::Parsing,
        Self::Execution,
        Self::Synthesis,
        Self::Overall,
    ];

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Recognition => "recognition",
            Self::Parsing => "parsing",
            Self::Execution => "execution",
            Self::Synthesis => "synthesis",
            Self::Overall => "overall",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| crate::Error::Config(format!("unknown pipeline stage: {s}")))
    }
}

/// Current reduction over the telemetry windows
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    /// Average end-to-end latency
    pub average_latency_ms: Option<f64>,
    /// Mean latency per stage with at least one observation
    pub stage_latency_ms: BTreeMap<Stage, f64>,
    /// Frames per second derived from mean frame interval
    pub frame_rate: Option<f64>,
    /// Resident memory of the process
    pub memory_usage_bytes: Option<u64>,
    /// Most recent cache hit rate
    pub cache_hit_rate: Option<f64>,
}

/// Verdict plus recommendations, for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub metrics: PerformanceMetrics,
    pub optimal: bool,
    pub recommendations: Vec<String>,
}

#[derive(Debug)]
struct PerfState {
    stages: HashMap<Stage, RollingWindow>,
    frames: RollingWindow,
    memory_bytes: Option<u64>,
    cache_hit_rate: Option<f64>,
}

/// Rolling telemetry aggregator
#[derive(Debug)]
pub struct PerformanceOptimizer {
    config: PerfConfig,
    state: Mutex<PerfState>,
}

impl PerformanceOptimizer {
    /// Create an optimizer with empty windows
    #[must_use]
    pub fn new(config: PerfConfig) -> Self {
        let state = PerfState {
            stages: HashMap::new(),
            frames: RollingWindow::new(config.frame_window),
            memory_bytes: None,
            cache_hit_rate: None,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PerfState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured thresholds
    #[must_use]
    pub const fn config(&self) -> &PerfConfig {
        &self.config
    }

    /// Record one latency observation for `stage`
    pub fn record_latency(&self, stage: Stage, ms: f64) {
        if !ms.is_finite() || ms < 0.0 {
            tracing::trace!(%stage, ms, "ignoring invalid latency sample");
            return;
        }
        let window = self.config.latency_window;
        self.lock()
            .stages
            .entry(stage)
            .or_insert_with(|| RollingWindow::new(window))
            .push(ms);
        tracing::trace!(%stage, ms, "latency recorded");
    }

    /// Record the interval between two frames
    pub fn record_frame_interval(&self, ms: f64) {
        if ms.is_finite() && ms > 0.0 {
            self.lock().frames.push(ms);
        }
    }

    /// Record instantaneous resident memory
    pub fn record_memory(&self, bytes: u64) {
        self.lock().memory_bytes = Some(bytes);
    }

    /// Record the latest cache hit rate, clamped to `[0, 1]`
    pub fn update_cache_hit_rate(&self, rate: f64) {
        if rate.is_nan() {
            return;
        }
        self.lock().cache_hit_rate = Some(rate.clamp(0.0, 1.0));
    }

    /// Start timing `stage`; the sample is recorded when the guard drops
    #[must_use]
    pub fn time(&self, stage: Stage) -> LatencyTimer<'_> {
        LatencyTimer {
            optimizer: self,
            stage,
            started: Instant::now(),
        }
    }

    /// Snapshot of all current means
    #[must_use]
    pub fn metrics(&self) -> PerformanceMetrics {
        let state = self.lock();

        let stage_latency_ms: BTreeMap<Stage, f64> = state
            .stages
            .iter()
            .filter_map(|(stage, window)| window.mean().map(|m| (*stage, m)))
            .collect();

        PerformanceMetrics {
            average_latency_ms: average_latency(&stage_latency_ms),
            stage_latency_ms,
            frame_rate: state
                .frames
                .mean()
                .filter(|interval| *interval > 0.0)
                .map(|interval| 1000.0 / interval),
            memory_usage_bytes: state.memory_bytes,
            cache_hit_rate: state.cache_hit_rate,
        }
    }

    fn latency_high(&self, metrics: &PerformanceMetrics) -> bool {
        metrics
            .average_latency_ms
            .is_some_and(|ms| ms >= self.config.latency_threshold_ms)
    }

    fn frame_rate_low(&self, metrics: &PerformanceMetrics) -> bool {
        metrics
            .frame_rate
            .is_some_and(|fps| fps < self.config.fps_threshold)
    }

    fn memory_high_in(&self, metrics: &PerformanceMetrics) -> bool {
        metrics
            .memory_usage_bytes
            .is_some_and(|bytes| bytes >= self.config.memory_threshold_bytes())
    }

    /// Whether resident memory is at or above its ceiling
    #[must_use]
    pub fn memory_high(&self) -> bool {
        self.memory_high_in(&self.metrics())
    }

    /// True when latency, frame rate and memory are all within bounds
    ///
    /// A metric with no observations yet counts as within bounds.
    #[must_use]
    pub fn is_performance_optimal(&self) -> bool {
        let metrics = self.metrics();
        !self.latency_high(&metrics)
            && !self.frame_rate_low(&metrics)
            && !self.memory_high_in(&metrics)
    }

    /// Actionable recommendations in a stable order
    #[must_use]
    pub fn recommendations(&self) -> Vec<String> {
        self.recommendations_for(&self.metrics())
    }

    #[allow(clippy::cast_precision_loss)]
    fn recommendations_for(&self, metrics: &PerformanceMetrics) -> Vec<String> {
        let mut out = Vec::new();

        if self.latency_high(metrics)
            && let Some(ms) = metrics.average_latency_ms
        {
            out.push(format!(
                "Average response latency is {ms:.0} ms (target < {:.0} ms): preload common responses and keep response caching enabled",
                self.config.latency_threshold_ms
            ));
        }

        if self.frame_rate_low(metrics)
            && let Some(fps) = metrics.frame_rate
        {
            out.push(format!(
                "Frame rate is {fps:.1} fps (target >= {:.0} fps): move heavy work off the interactive thread",
                self.config.fps_threshold
            ));
        }

        if self.memory_high_in(metrics)
            && let Some(bytes) = metrics.memory_usage_bytes
        {
            out.push(format!(
                "Memory usage is {:.1} MB (limit {} MB): clear old cache entries",
                bytes as f64 / (1024.0 * 1024.0),
                self.config.memory_threshold_mb
            ));
        }

        if let Some(rate) = metrics.cache_hit_rate
            && rate < self.config.hit_rate_warning
        {
            out.push(format!(
                "Cache hit rate is {:.0}% (target >= {:.0}%): preload frequently used responses",
                rate * 100.0,
                self.config.hit_rate_warning * 100.0
            ));
        }

        out
    }

    /// Metrics, verdict and recommendations in one snapshot
    #[must_use]
    pub fn report(&self) -> PerformanceReport {
        let metrics = self.metrics();
        let optimal = !self.latency_high(&metrics)
            && !self.frame_rate_low(&metrics)
            && !self.memory_high_in(&metrics);
        let recommendations = self.recommendations_for(&metrics);
        PerformanceReport {
            metrics,
            optimal,
            recommendations,
        }
    }
}

/// End-to-end latency: the `Overall` mean when the caller measures it,
/// otherwise the sum of the individual stage means
fn average_latency(stage_means: &BTreeMap<Stage, f64>) -> Option<f64> {
    if let Some(overall) = stage_means.get(&Stage::Overall) {
        return Some(*overall);
    }
    if stage_means.is_empty() {
        return None;
    }
    Some(stage_means.values().sum())
}

/// Records elapsed wall time for a stage when dropped
#[derive(Debug)]
pub struct LatencyTimer<'a> {
    optimizer: &'a PerformanceOptimizer,
    stage: Stage,
    started: Instant,
}

impl Drop for LatencyTimer<'_> {
    fn drop(&mut self) {
        let ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.optimizer.record_latency(self.stage, ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> PerformanceOptimizer {
        PerformanceOptimizer::new(PerfConfig::default())
    }

    #[test]
    fn test_optimal_without_observations() {
        let opt = optimizer();
        assert!(opt.is_performance_optimal());
        assert!(opt.recommendations().is_empty());
    }

    #[test]
    fn test_stage_means_sum_without_overall() {
        let opt = optimizer();
        opt.record_latency(Stage::Recognition, 300.0);
        opt.record_latency(Stage::Recognition, 500.0);
        opt.record_latency(Stage::Synthesis, 600.0);

        let metrics = opt.metrics();
        assert!((metrics.stage_latency_ms[&Stage::Recognition] - 400.0).abs() < 1e-9);
        assert!((metrics.average_latency_ms.unwrap() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_overall_takes_precedence() {
        let opt = optimizer();
        opt.record_latency(Stage::Synthesis, 3000.0);
        opt.record_latency(Stage::Overall, 1200.0);

        assert!((opt.metrics().average_latency_ms.unwrap() - 1200.0).abs() < 1e-9);
        assert!(opt.is_performance_optimal());
    }

    #[test]
    fn test_invalid_samples_ignored() {
        let opt = optimizer();
        opt.record_latency(Stage::Parsing, f64::NAN);
        opt.record_latency(Stage::Parsing, -4.0);
        opt.record_frame_interval(0.0);
        opt.update_cache_hit_rate(f64::NAN);

        let metrics = opt.metrics();
        assert!(metrics.stage_latency_ms.is_empty());
        assert!(metrics.frame_rate.is_none());
        assert!(metrics.cache_hit_rate.is_none());
    }

    #[test]
    fn test_hit_rate_clamped() {
        let opt = optimizer();
        opt.update_cache_hit_rate(1.7);
        assert!((opt.metrics().cache_hit_rate.unwrap() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_timer_records_on_drop() {
        let opt = optimizer();
        {
            let _timer = opt.time(Stage::Execution);
        }
        assert!(opt.metrics().stage_latency_ms.contains_key(&Stage::Execution));
    }

    #[test]
    fn test_stage_parse_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert_eq!(" Synthesis ".parse::<Stage>().unwrap(), Stage::Synthesis);
        assert!("rendering".parse::<Stage>().is_err());
    }
}
