//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use petcare_voice::cache::{CacheBackend, EntryRecord, StatsRecord};
use petcare_voice::config::{CacheConfig, WakeConfig};
use petcare_voice::voice::{AudioSource, CaptureConstraints, FrameSink, SAMPLE_RATE};
use petcare_voice::{DbPool, Error, Result, Synthesizer, Transcriber, db};

/// Samples per frame pushed by fake sources (100 ms at 16 kHz)
pub const FRAME: usize = SAMPLE_RATE as usize / 10;

pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Cache configuration with the given ceilings and no persistence
#[must_use]
pub fn cache_config(max_entries: usize, max_size_mb: u64) -> CacheConfig {
    CacheConfig {
        max_entries,
        max_size_mb,
        persist: false,
        ..CacheConfig::default()
    }
}

/// Wake configuration with a queue deep enough that tests never drop frames
#[must_use]
pub fn wake_config() -> WakeConfig {
    WakeConfig {
        frame_queue: 4096,
        ..WakeConfig::default()
    }
}

/// `tenths` tenths of a second of loud audio
#[must_use]
pub fn speech(tenths: usize) -> Vec<f32> {
    (0..FRAME * tenths)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f32 / SAMPLE_RATE as f32;
            0.3 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
        })
        .collect()
}

/// `tenths` tenths of a second of silence
#[must_use]
pub fn silence(tenths: usize) -> Vec<f32> {
    vec![0.0; FRAME * tenths]
}

/// One spoken utterance followed by enough silence to end it
#[must_use]
pub fn utterance() -> Vec<f32> {
    let mut audio = speech(6);
    audio.extend(silence(6));
    audio
}

/// Poll `done` until it holds or two seconds pass
pub fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Audio source driven by the test
///
/// Keeps the most recent sink after `close` so tests can simulate frames
/// still in flight from a stopped session.
#[derive(Clone, Default)]
pub struct FakeSource {
    sink: Arc<Mutex<Option<FrameSink>>>,
    retained: Arc<Mutex<Option<FrameSink>>>,
    failures: Arc<Mutex<VecDeque<Error>>>,
    pub opens: Arc<AtomicUsize>,
}

impl FakeSource {
    /// Fail the next `open` calls with these errors, in order
    pub fn fail_with(&self, errors: impl IntoIterator<Item = Error>) {
        self.failures.lock().unwrap().extend(errors);
    }

    /// Push audio through the live sink in frame-sized chunks
    pub fn play(&self, audio: &[f32]) {
        for frame in audio.chunks(FRAME) {
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                sink.push(frame);
            }
        }
    }

    /// Push audio through the sink of the last session, even if closed
    pub fn play_stale(&self, audio: &[f32]) {
        let sink = self.retained.lock().unwrap().clone();
        if let Some(sink) = sink {
            for frame in audio.chunks(FRAME) {
                sink.push(frame);
            }
        }
    }

    /// Fail the live session as a disconnected device would
    pub fn fail_session(&self, error: Error) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.fail(error);
        }
    }

    /// Report a failure from the last session, even if closed
    pub fn fail_stale(&self, error: Error) {
        let sink = self.retained.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.fail(error);
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl AudioSource for FakeSource {
    fn open(&mut self, constraints: &CaptureConstraints, sink: FrameSink) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        assert!(constraints.echo_cancellation && constraints.noise_suppression);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        *self.retained.lock().unwrap() = Some(sink.clone());
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn close(&mut self) {
        *self.sink.lock().unwrap() = None;
    }

    fn is_open(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }
}

/// Transcriber returning queued transcripts in order, then silence
#[derive(Clone, Default)]
pub struct ScriptedTranscriber {
    transcripts: Arc<Mutex<VecDeque<String>>>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedTranscriber {
    pub fn new<I, S>(transcripts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transcripts: Arc::new(Mutex::new(transcripts.into_iter().map(Into::into).collect())),
            calls: Arc::default(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transcriber for ScriptedTranscriber {
    fn transcribe(&mut self, samples: &[f32], sample_rate: u32) -> Result<String> {
        assert_eq!(sample_rate, SAMPLE_RATE);
        assert!(!samples.is_empty());
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.transcripts.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// Synthesizer returning the text's bytes, failing on "fail"
#[derive(Default)]
pub struct EchoSynthesizer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Synthesizer for EchoSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text == "fail" {
            return Err(Error::Audio("synthesis failed".to_string()));
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// Durable store where every operation fails
pub struct FailingBackend;

fn unavailable<T>() -> Result<T> {
    Err(Error::Persistence("store unavailable".to_string()))
}

impl CacheBackend for FailingBackend {
    fn put(&self, _: &EntryRecord, _: &[u8]) -> Result<()> {
        unavailable()
    }

    fn audio(&self, _: &str) -> Result<Option<Vec<u8>>> {
        unavailable()
    }

    fn touch(&self, _: &str, _: i64, _: u64) -> Result<()> {
        unavailable()
    }

    fn delete(&self, _: &str) -> Result<()> {
        unavailable()
    }

    fn list_all(&self) -> Result<Vec<EntryRecord>> {
        unavailable()
    }

    fn clear(&self) -> Result<()> {
        unavailable()
    }

    fn load_stats(&self) -> Result<Option<StatsRecord>> {
        unavailable()
    }

    fn save_stats(&self, _: &StatsRecord) -> Result<()> {
        unavailable()
    }
}
