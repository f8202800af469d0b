//! Periodic telemetry samplers
//!
//! Frame pacing and memory are sampled on their own loops, independent of
//! the event-driven latency recording. Both stop when the shutdown signal
//! flips to `true` and never surface errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::PerformanceOptimizer;

/// Shortest sampling period; `tokio` intervals reject zero
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Spawn a loop ticking at `target_fps` that records observed tick intervals
///
/// A busy runtime delays ticks, which shows up as a lower frame rate.
pub fn spawn_frame_sampler(
    optimizer: Arc<PerformanceOptimizer>,
    target_fps: u32,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = Duration::from_secs(1) / target_fps.max(1);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        let mut last = Instant::now();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let now = Instant::now();
                    optimizer.record_frame_interval(now.duration_since(last).as_secs_f64() * 1000.0);
                    last = now;
                }
            }
        }

        tracing::debug!("frame sampler stopped");
    })
}

/// Spawn a loop recording this process's resident memory every `every`
pub fn spawn_memory_sampler(
    optimizer: Arc<PerformanceOptimizer>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut probe = MemoryProbe::new();
        let mut interval = tokio::time::interval(every.max(MIN_PERIOD));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Some(bytes) = probe.resident_bytes() {
                        optimizer.record_memory(bytes);
                        tracing::trace!(bytes, "memory sampled");
                    }
                }
            }
        }

        tracing::debug!("memory sampler stopped");
    })
}

/// Reads resident memory of the current process
pub struct MemoryProbe {
    system: System,
    pid: Option<Pid>,
}

impl MemoryProbe {
    /// Create a probe for the current process
    #[must_use]
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| tracing::warn!(error = e, "cannot resolve current pid"))
            .ok();
        Self {
            system: System::new(),
            pid,
        }
    }

    /// Current resident memory in bytes, `None` if unavailable
    pub fn resident_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        if !self.system.refresh_process(pid) {
            return None;
        }
        self.system.process(pid).map(sysinfo::Process::memory)
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerfConfig;

    #[test]
    fn test_memory_probe_reads_self() {
        let mut probe = MemoryProbe::new();
        assert!(probe.resident_bytes().is_some_and(|bytes| bytes > 0));
    }

    #[tokio::test]
    async fn test_frame_sampler_records_and_stops() {
        let optimizer = Arc::new(PerformanceOptimizer::new(PerfConfig::default()));
        let (tx, rx) = watch::channel(false);

        let handle = spawn_frame_sampler(Arc::clone(&optimizer), 100, rx);
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(optimizer.metrics().frame_rate.is_some());
    }

    #[tokio::test]
    async fn test_memory_sampler_records_and_stops() {
        let optimizer = Arc::new(PerformanceOptimizer::new(PerfConfig::default()));
        let (tx, rx) = watch::channel(false);

        let handle = spawn_memory_sampler(Arc::clone(&optimizer), Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(optimizer.metrics().memory_usage_bytes.is_some());
    }

    #[tokio::test]
    async fn test_zero_period_does_not_kill_sampler() {
        let optimizer = Arc::new(PerformanceOptimizer::new(PerfConfig::default()));
        let (tx, rx) = watch::channel(false);

        let handle = spawn_memory_sampler(Arc::clone(&optimizer), Duration::ZERO, rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
