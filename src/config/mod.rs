//! Configuration for the voice core
//!
//! A single immutable [`Config`] is built once at startup from defaults, the
//! optional TOML overlay and `PETVOICE_*` environment variables.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

use self::file::VoiceConfigFile;

const MB: u64 = 1024 * 1024;
const DAY_SECS: u64 = 24 * 60 * 60;

/// Voice core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (cache database)
    pub data_dir: PathBuf,

    /// Wake-word monitor configuration
    pub wake: WakeConfig,

    /// Response cache configuration
    pub cache: CacheConfig,

    /// Performance optimizer configuration
    pub perf: PerfConfig,
}

/// Wake-word monitor configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Phrase that activates the assistant
    pub phrase: String,

    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Capacity of the frame queue between capture and the worker
    pub frame_queue: usize,

    /// Speech-to-text command that verifies wake phrase candidates
    pub stt_command: Option<String>,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            phrase: "hey buddy".to_string(),
            sample_rate: crate::voice::SAMPLE_RATE,
            frame_queue: 64,
            stt_command: None,
        }
    }
}

/// Response cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached responses
    pub max_entries: usize,

    /// Maximum aggregate payload size in megabytes
    pub max_size_mb: u64,

    /// Period of the background cleanup sweep
    pub cleanup_interval: Duration,

    /// Entries older than this are candidates for cleanup
    pub cleanup_max_age: Duration,

    /// Cleanup spares entries accessed at least this many times
    pub cleanup_min_access: u64,

    /// Length of the most-used listing in statistics
    pub top_n: usize,

    /// Persist entries to the data directory
    pub persist: bool,
}

impl CacheConfig {
    /// Byte ceiling derived from `max_size_mb`
    #[must_use]
    pub const fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(MB)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_size_mb: 50,
            cleanup_interval: Duration::from_secs(60 * 60),
            cleanup_max_age: Duration::from_secs(7 * DAY_SECS),
            cleanup_min_access: 3,
            top_n: 10,
            persist: true,
        }
    }
}

/// Performance optimizer configuration
#[derive(Debug, Clone)]
pub struct PerfConfig {
    /// Average end-to-end latency must stay below this
    pub latency_threshold_ms: f64,

    /// Frame rate must stay at or above this
    pub fps_threshold: f64,

    /// Frame rate the sampler paces itself at
    pub target_fps: u32,

    /// Resident memory must stay below this
    pub memory_threshold_mb: u64,

    /// Cache hit rate below this produces a recommendation
    pub hit_rate_warning: f64,

    /// Latency observations kept per stage
    pub latency_window: usize,

    /// Frame-interval observations kept
    pub frame_window: usize,

    /// Period of the memory sampler
    pub memory_sample_interval: Duration,

    /// Period of the cache hit-rate feed
    pub hit_rate_refresh: Duration,
}

impl PerfConfig {
    /// Byte ceiling derived from `memory_threshold_mb`
    #[must_use]
    pub const fn memory_threshold_bytes(&self) -> u64 {
        self.memory_threshold_mb.saturating_mul(MB)
    }
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            latency_threshold_ms: 2000.0,
            fps_threshold: 55.0,
            target_fps: 60,
            memory_threshold_mb: 200,
            hit_rate_warning: 0.5,
            latency_window: 100,
            frame_window: 60,
            memory_sample_interval: Duration::from_secs(5),
            hit_rate_refresh: Duration::from_secs(10),
        }
    }
}

/// Return the data directory, e.g. `~/.local/share/petcare/voice` on Linux
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("app", "petcare", "petcare")
        .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("voice"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            wake: WakeConfig::default(),
            cache: CacheConfig::default(),
            perf: PerfConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the standard config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        Self::from_file(file::load_config_file())
    }

    /// Load configuration using an explicit TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::from_file(file::load_from(path))
    }

    fn from_file(fc: VoiceConfigFile) -> Result<Self> {
        let mut config = Self::default();
        config.apply_file(fc);
        config.apply_env();
        config.validate()?;

        // Ensure data dir exists
        if config.cache.persist {
            std::fs::create_dir_all(&config.data_dir).ok();
        }

        Ok(config)
    }

    fn apply_file(&mut self, fc: VoiceConfigFile) {
        if let Some(dir) = fc.data_dir {
            self.data_dir = PathBuf::from(dir);
        }

        let wake = &mut self.wake;
        if let Some(phrase) = fc.wake.phrase {
            wake.phrase = phrase;
        }
        if let Some(rate) = fc.wake.sample_rate {
            wake.sample_rate = rate;
        }
        if let Some(queue) = fc.wake.frame_queue {
            wake.frame_queue = queue;
        }
        if let Some(command) = fc.wake.stt_command {
            wake.stt_command = Some(command);
        }

        let cache = &mut self.cache;
        if let Some(v) = fc.cache.max_entries {
            cache.max_entries = v;
        }
        if let Some(v) = fc.cache.max_size_mb {
            cache.max_size_mb = v;
        }
        if let Some(v) = fc.cache.cleanup_interval_secs {
            cache.cleanup_interval = Duration::from_secs(v);
        }
        if let Some(v) = fc.cache.cleanup_max_age_days {
            cache.cleanup_max_age = Duration::from_secs(v.saturating_mul(DAY_SECS));
        }
        if let Some(v) = fc.cache.cleanup_min_access {
            cache.cleanup_min_access = v;
        }
        if let Some(v) = fc.cache.top_n {
            cache.top_n = v;
        }
        if let Some(v) = fc.cache.persist {
            cache.persist = v;
        }

        let perf = &mut self.perf;
        if let Some(v) = fc.perf.latency_threshold_ms {
            perf.latency_threshold_ms = v;
        }
        if let Some(v) = fc.perf.fps_threshold {
            perf.fps_threshold = v;
        }
        if let Some(v) = fc.perf.target_fps {
            perf.target_fps = v;
        }
        if let Some(v) = fc.perf.memory_threshold_mb {
            perf.memory_threshold_mb = v;
        }
        if let Some(v) = fc.perf.hit_rate_warning {
            perf.hit_rate_warning = v;
        }
        if let Some(v) = fc.perf.latency_window {
            perf.latency_window = v;
        }
        if let Some(v) = fc.perf.frame_window {
            perf.frame_window = v;
        }
        if let Some(v) = fc.perf.memory_sample_interval_secs {
            perf.memory_sample_interval = Duration::from_secs(v);
        }
        if let Some(v) = fc.perf.hit_rate_refresh_secs {
            perf.hit_rate_refresh = Duration::from_secs(v);
        }
    }

    fn apply_env(&mut self) {
        if let Ok(phrase) = std::env::var("PETVOICE_WAKE_PHRASE") {
            self.wake.phrase = phrase;
        }
        if let Some(v) = env_parse("PETVOICE_MAX_CACHE_ENTRIES") {
            self.cache.max_entries = v;
        }
        if let Some(v) = env_parse("PETVOICE_MAX_CACHE_MB") {
            self.cache.max_size_mb = v;
        }
        if let Ok(dir) = std::env::var("PETVOICE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(command) = std::env::var("PETVOICE_STT_COMMAND") {
            self.wake.stt_command = Some(command);
        }
    }

    /// Check every tunable is within its domain
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first invalid field
    pub fn validate(&self) -> Result<()> {
        if self.wake.phrase.trim().is_empty() {
            return Err(Error::Config("wake phrase must not be empty".to_string()));
        }
        if self.wake.sample_rate == 0 {
            return Err(Error::Config("sample rate must be positive".to_string()));
        }
        if self.wake.frame_queue == 0 {
            return Err(Error::Config("frame queue must be positive".to_string()));
        }
        if self.cache.max_entries == 0 {
            return Err(Error::Config("max cache entries must be positive".to_string()));
        }
        if self.cache.max_size_mb == 0 {
            return Err(Error::Config("max cache size must be positive".to_string()));
        }
        if self.cache.cleanup_interval.is_zero() {
            return Err(Error::Config("cleanup interval must be positive".to_string()));
        }
        if self.perf.latency_window == 0 || self.perf.frame_window == 0 {
            return Err(Error::Config("sample windows must be positive".to_string()));
        }
        if self.perf.memory_sample_interval.is_zero() || self.perf.hit_rate_refresh.is_zero() {
            return Err(Error::Config("sampling intervals must be positive".to_string()));
        }
        if self.perf.target_fps == 0 {
            return Err(Error::Config("target fps must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.perf.hit_rate_warning) {
            return Err(Error::Config(format!(
                "hit rate warning must be within [0, 1], got {}",
                self.perf.hit_rate_warning
            )));
        }
        if self.perf.latency_threshold_ms <= 0.0 || self.perf.fps_threshold <= 0.0 {
            return Err(Error::Config("perf thresholds must be positive".to_string()));
        }
        Ok(())
    }

    /// Path to the cache database inside the data directory
    #[must_use]
    pub fn cache_db_path(&self) -> PathBuf {
        self.data_dir.join("response-cache.db")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let parsed = raw.parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
    }
    parsed
}
