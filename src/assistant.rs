//! Assistant runtime
//!
//! Wires the response cache, performance optimizer and wake monitor together
//! and runs their background loops until shutdown.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::{CacheBackend, ResponseCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::{self, CacheRepo};
use crate::engine::Synthesizer;
use crate::perf::sampler::{MIN_PERIOD, spawn_frame_sampler, spawn_memory_sampler};
use crate::perf::{PerformanceOptimizer, Stage};
use crate::voice::restart::{delay_for_attempt, is_recoverable};
use crate::voice::{RestartPolicy, WakeEvent, WakeWordMonitor};
use crate::{Error, Result};

const WAKE_EVENT_BUFFER: usize = 16;

/// How often a live session is checked for capture failures
const FAULT_POLL: Duration = Duration::from_millis(250);

/// Open the durable cache store if persistence is enabled
///
/// # Errors
///
/// Returns error if the data directory or database cannot be opened
pub fn open_backend(config: &Config) -> Result<Option<Arc<dyn CacheBackend>>> {
    if !config.cache.persist {
        return Ok(None);
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let pool = db::init(config.cache_db_path())?;
    Ok(Some(Arc::new(CacheRepo::new(pool))))
}

/// Audio served for a response
#[derive(Debug, Clone)]
pub struct Response {
    pub audio: Arc<[u8]>,
    /// Served without synthesis
    pub cached: bool,
}

/// Voice assistant core
pub struct Assistant {
    config: Config,
    cache: Arc<ResponseCache>,
    optimizer: Arc<PerformanceOptimizer>,
    monitor: Arc<Mutex<WakeWordMonitor>>,
    wake_events: broadcast::Sender<WakeEvent>,
    restart: RestartPolicy,
}

impl Assistant {
    /// Build the assistant around a wake monitor
    #[must_use]
    pub fn new(
        config: Config,
        backend: Option<Arc<dyn CacheBackend>>,
        monitor: WakeWordMonitor,
    ) -> Self {
        Self::with_clock(config, backend, monitor, Arc::new(SystemClock))
    }

    /// Build the assistant with an explicit clock
    #[must_use]
    pub fn with_clock(
        config: Config,
        backend: Option<Arc<dyn CacheBackend>>,
        monitor: WakeWordMonitor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = match backend {
            Some(backend) => ResponseCache::open(config.cache.clone(), clock, backend),
            None => ResponseCache::in_memory(config.cache.clone(), clock),
        };

        let (wake_events, _) = broadcast::channel(WAKE_EVENT_BUFFER);
        let events = wake_events.clone();
        monitor.on_wake_word_detected(move |event| {
            tracing::info!(phrase = %event.phrase, "wake word heard");
            // No receivers is fine
            let _ = events.send(event.clone());
        });

        Self {
            optimizer: Arc::new(PerformanceOptimizer::new(config.perf.clone())),
            cache: Arc::new(cache),
            monitor: Arc::new(Mutex::new(monitor)),
            wake_events,
            restart: RestartPolicy::default(),
            config,
        }
    }

    /// Replace the listening restart policy
    #[must_use]
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    /// Shared response cache
    #[must_use]
    pub const fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Shared performance optimizer
    #[must_use]
    pub const fn optimizer(&self) -> &Arc<PerformanceOptimizer> {
        &self.optimizer
    }

    /// Receive wake events for downstream recognition
    #[must_use]
    pub fn wake_events(&self) -> broadcast::Receiver<WakeEvent> {
        self.wake_events.subscribe()
    }

    /// Whether the wake monitor is routing microphone audio
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.monitor().is_listening()
    }

    fn monitor(&self) -> MutexGuard<'_, WakeWordMonitor> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Audio for `text`, from cache or freshly synthesized and cached
    ///
    /// # Errors
    ///
    /// Returns the synthesizer's error on a miss that fails to synthesize
    pub async fn respond(&self, text: &str, synthesizer: &dyn Synthesizer) -> Result<Response> {
        if let Some(hit) = self.cache.get(text) {
            return Ok(Response {
                audio: hit.bytes,
                cached: true,
            });
        }

        let audio = {
            let _timer = self.optimizer.time(Stage::Synthesis);
            synthesizer.synthesize(text).await?
        };
        let bytes: Arc<[u8]> = Arc::from(audio.as_slice());
        self.cache.store(text, audio);

        Ok(Response {
            audio: bytes,
            cached: false,
        })
    }

    /// Run background loops and listen for the wake phrase until `shutdown`
    /// flips to `true`
    ///
    /// # Errors
    ///
    /// Returns error if the monitor cannot be initialized or listening
    /// fails with an unrecoverable error or exhausts its restarts
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let perf = &self.config.perf;
        let tasks = vec![
            spawn_frame_sampler(Arc::clone(&self.optimizer), perf.target_fps, shutdown.clone()),
            spawn_memory_sampler(
                Arc::clone(&self.optimizer),
                perf.memory_sample_interval,
                shutdown.clone(),
            ),
            spawn_cleanup_loop(
                Arc::clone(&self.cache),
                self.config.cache.cleanup_interval,
                shutdown.clone(),
            ),
            spawn_hit_rate_feed(
                Arc::clone(&self.cache),
                Arc::clone(&self.optimizer),
                perf.hit_rate_refresh,
                shutdown.clone(),
            ),
        ];

        let result = self.listen(shutdown).await;

        // Joining the worker can wait on a transcription in flight
        let monitor = Arc::clone(&self.monitor);
        let disposed = tokio::task::spawn_blocking(move || {
            monitor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .dispose();
        })
        .await;
        if let Err(e) = disposed {
            tracing::error!(error = %e, "wake monitor dispose failed");
        }

        for task in tasks {
            if result.is_err() {
                task.abort();
            }
            if let Err(e) = task.await
                && e.is_panic()
            {
                tracing::error!(error = %e, "background task panicked");
            }
        }
        self.cache.flush();

        let report = self.optimizer.report();
        tracing::info!(
            optimal = report.optimal,
            recommendations = ?report.recommendations,
            "assistant stopped"
        );
        result
    }

    async fn listen(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.monitor().initialize(&self.config.wake.phrase)?;

        let mut attempt = 0;
        loop {
            let started = self.monitor().start_listening();
            match started {
                Ok(()) => {
                    attempt = 0;
                    let Some(e) = self.watch_session(&mut shutdown).await else {
                        tracing::info!("shutdown requested");
                        return Ok(());
                    };
                    if !is_recoverable(&e) {
                        tracing::error!(error = %e, "listening stopped");
                        return Err(e);
                    }
                }
                Err(e) if is_recoverable(&e) && attempt < self.restart.max_retries => {
                    tracing::warn!(error = %e, attempt, "listening failed, retrying");
                }
                Err(e) => {
                    tracing::error!(error = %e, attempt, "listening failed");
                    return Err(e);
                }
            }

            let delay = delay_for_attempt(&self.restart, attempt);
            attempt += 1;
            tracing::debug!(attempt, ?delay, "restarting capture");
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Wait until shutdown (`None`) or a capture failure ends the session
    async fn watch_session(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Error> {
        let mut health = tokio::time::interval(FAULT_POLL);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow_and_update() {
                return None;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = health.tick() => {
                    if let Some(e) = self.monitor().take_fault() {
                        return Some(e);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Assistant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assistant")
            .field("cache", &self.cache)
            .field("restart", &self.restart)
            .finish_non_exhaustive()
    }
}

fn spawn_cleanup_loop(
    cache: Arc<ResponseCache>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(MIN_PERIOD));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let removed = cache.cleanup();
                    tracing::debug!(removed, "scheduled cache cleanup");
                }
            }
        }
    })
}

/// Push the cache hit rate into the optimizer and sweep the cache when
/// memory runs high
fn spawn_hit_rate_feed(
    cache: Arc<ResponseCache>,
    optimizer: Arc<PerformanceOptimizer>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
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
                    feed_hit_rate(&cache, &optimizer);
                }
            }
        }
    })
}

fn feed_hit_rate(cache: &ResponseCache, optimizer: &PerformanceOptimizer) {
    let stats = cache.stats();
    if stats.total_hits + stats.total_misses > 0 {
        optimizer.update_cache_hit_rate(stats.hit_rate);
    }

    if optimizer.memory_high() {
        let removed = cache.cleanup();
        tracing::info!(removed, "memory above threshold, swept response cache");
    }
}
