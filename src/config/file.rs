//! TOML configuration file loading
//!
//! Supports `~/.config/petcare/voice.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// Directory holding the cache database
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Wake-word monitor configuration
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Response cache configuration
    #[serde(default)]
    pub cache: CacheFileConfig,

    /// Performance optimizer configuration
    #[serde(default)]
    pub perf: PerfFileConfig,
}

/// Wake-word monitor configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Wake phrase (e.g. "hey buddy")
    pub phrase: Option<String>,

    /// Capture sample rate in Hz
    pub sample_rate: Option<u32>,

    /// Frames buffered between capture and worker
    pub frame_queue: Option<usize>,

    /// Speech-to-text command, e.g. `whisper-cli --stdin`
    pub stt_command: Option<String>,
}

/// Response cache configuration
#[derive(Debug, Default, Deserialize)]
pub struct CacheFileConfig {
    pub max_entries: Option<usize>,
    pub max_size_mb: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub cleanup_max_age_days: Option<u64>,
    pub cleanup_min_access: Option<u64>,
    pub top_n: Option<usize>,
    /// Disable durable persistence (in-memory only)
    pub persist: Option<bool>,
}

/// Performance optimizer configuration
#[derive(Debug, Default, Deserialize)]
pub struct PerfFileConfig {
    pub latency_threshold_ms: Option<f64>,
    pub fps_threshold: Option<f64>,
    pub target_fps: Option<u32>,
    pub memory_threshold_mb: Option<u64>,
    pub hit_rate_warning: Option<f64>,
    pub latency_window: Option<usize>,
    pub frame_window: Option<usize>,
    pub memory_sample_interval_secs: Option<u64>,
    pub hit_rate_refresh_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceConfigFile {
    config_file_path().map_or_else(VoiceConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Missing or malformed files fall back to defaults.
pub fn load_from(path: &Path) -> VoiceConfigFile {
    if !path.exists() {
        return VoiceConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoiceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoiceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/petcare/voice.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("petcare").join("voice.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_file() {
        let file: VoiceConfigFile = toml::from_str(
            r#"
            [wake]
            phrase = "hey rex"

            [cache]
            max_entries = 20
            "#,
        )
        .unwrap();

        assert_eq!(file.wake.phrase.as_deref(), Some("hey rex"));
        assert_eq!(file.cache.max_entries, Some(20));
        assert!(file.cache.max_size_mb.is_none());
        assert!(file.perf.latency_threshold_ms.is_none());
    }

    #[test]
    fn test_missing_file_is_default() {
        let file = load_from(Path::new("/nonexistent/petcare/voice.toml"));
        assert!(file.wake.phrase.is_none());
    }

    #[test]
    fn test_malformed_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();

        let file = load_from(&path);
        assert!(file.cache.max_entries.is_none());
    }
}
