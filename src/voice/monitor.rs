//! Always-on wake-word monitor
//!
//! The monitor owns the audio source and two background threads. The worker
//! thread runs the classifier over queued frames. The dispatcher thread
//! delivers detections to subscribers. Capture pushes frames tagged with the
//! generation of the listening session that produced them; stopping bumps the
//! generation, so anything still queued from that session is discarded.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use super::capture::{AudioSource, CaptureConstraints, FrameSink};
use super::classifier::WakeClassifier;
use super::wav::samples_to_wav;
use crate::clock::Clock;
use crate::config::WakeConfig;
use crate::{Error, Result};

/// Subscriber invoked on the dispatcher thread for every detection
pub type WakeCallback = Arc<dyn Fn(&WakeEvent) + Send + Sync>;

/// A detected wake phrase
#[derive(Debug, Clone)]
pub struct WakeEvent {
    /// Phrase the monitor was armed with
    pub phrase: String,
    /// Detection time in epoch milliseconds
    pub detected_at_ms: i64,
    /// Audio of the utterance that contained the phrase, may be empty
    pub utterance: Vec<f32>,
    /// Sample rate of `utterance`
    pub sample_rate: u32,
}

impl WakeEvent {
    /// Encode the utterance as WAV for downstream recognition
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        samples_to_wav(&self.utterance, self.sample_rate)
    }
}

enum WorkerMessage {
    Frame { generation: u64, samples: Vec<f32> },
    Reset,
    Shutdown,
}

type WorkerHandle = JoinHandle<Option<Box<dyn WakeClassifier>>>;
type WorkerBody = Box<dyn FnOnce() -> Option<Box<dyn WakeClassifier>> + Send>;

struct Worker {
    tx: SyncSender<WorkerMessage>,
    classify: WorkerHandle,
    dispatch: JoinHandle<()>,
    phrase: String,
}

/// Continuously classifies microphone audio for a wake phrase
pub struct WakeWordMonitor {
    config: WakeConfig,
    clock: Arc<dyn Clock>,
    source: Box<dyn AudioSource>,
    classifier: Option<Box<dyn WakeClassifier>>,
    worker: Option<Worker>,
    subscribers: Arc<Mutex<Vec<WakeCallback>>>,
    generation: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    fault: Arc<Mutex<Option<SessionFault>>>,
    listening: bool,
}

/// A capture failure raised by the session with this generation
struct SessionFault {
    generation: u64,
    error: Error,
}

impl WakeWordMonitor {
    /// Create an uninitialized monitor
    #[must_use]
    pub fn new(
        config: WakeConfig,
        clock: Arc<dyn Clock>,
        source: Box<dyn AudioSource>,
        classifier: Box<dyn WakeClassifier>,
    ) -> Self {
        Self {
            config,
            clock,
            source,
            classifier: Some(classifier),
            worker: None,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            generation: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            fault: Arc::new(Mutex::new(None)),
            listening: false,
        }
    }

    /// Arm the classifier for `wake_phrase` and start the background threads
    ///
    /// Calling again with the same phrase is a no-op; a different phrase
    /// tears down the current session and re-arms.
    ///
    /// # Errors
    ///
    /// Returns `Error::Initialization` if the sample rate or phrase is
    /// unusable or a background thread cannot be spawned
    pub fn initialize(&mut self, wake_phrase: &str) -> Result<()> {
        if let Some(worker) = &self.worker {
            if worker.phrase == wake_phrase {
                return Ok(());
            }
            self.dispose();
        }

        let sample_rate = self.config.sample_rate;
        if sample_rate == 0 {
            return Err(Error::Initialization("sample rate must be positive".to_string()));
        }

        let mut classifier = self
            .classifier
            .take()
            .ok_or_else(|| Error::Initialization("wake classifier was lost".to_string()))?;
        if let Err(e) = classifier.arm(wake_phrase, sample_rate) {
            self.classifier = Some(classifier);
            return Err(e);
        }

        let (event_tx, event_rx) = mpsc::channel::<WakeEvent>();
        let subscribers = Arc::clone(&self.subscribers);
        let dispatch = match thread::Builder::new()
            .name("wake-dispatch".to_string())
            .spawn(move || run_dispatcher(&event_rx, &subscribers))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.classifier = Some(classifier);
                return Err(Error::Initialization(format!(
                    "cannot spawn wake dispatcher: {e}"
                )));
            }
        };

        let (tx, rx) = mpsc::sync_channel(self.config.frame_queue.max(1));
        let context = WorkerContext {
            events: event_tx,
            generation: Arc::clone(&self.generation),
            clock: Arc::clone(&self.clock),
            phrase: wake_phrase.to_string(),
            sample_rate,
        };
        let classify = match launch_worker(classifier, rx, context, |body| {
            thread::Builder::new()
                .name("wake-worker".to_string())
                .spawn(body)
        }) {
            Ok(handle) => handle,
            Err((classifier, e)) => {
                self.classifier = Some(classifier);
                // The event sender went down with the worker body
                if dispatch.join().is_err() {
                    tracing::error!("wake dispatcher panicked");
                }
                return Err(Error::Initialization(format!("cannot spawn wake worker: {e}")));
            }
        };

        self.worker = Some(Worker {
            tx,
            classify,
            dispatch,
            phrase: wake_phrase.to_string(),
        });

        tracing::info!(phrase = wake_phrase, sample_rate, "wake monitor initialized");
        Ok(())
    }

    /// Open the microphone and route its frames into the worker
    ///
    /// No-op while already listening.
    ///
    /// # Errors
    ///
    /// Returns `Error::Initialization` before [`Self::initialize`], or the
    /// source's `Permission` / `Audio` error if capture cannot start
    pub fn start_listening(&mut self) -> Result<()> {
        let Some(worker) = &self.worker else {
            return Err(Error::Initialization(
                "start_listening called before initialize".to_string(),
            ));
        };
        if self.listening {
            return Ok(());
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let tx = worker.tx.clone();
        let dropped = Arc::clone(&self.dropped);
        let sink = FrameSink::new(move |samples| {
            match tx.try_send(WorkerMessage::Frame {
                generation,
                samples: samples.to_vec(),
            }) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        })
        .on_fault({
            let slot = Arc::clone(&self.fault);
            move |error| {
                let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                // Keep the first failure of the session
                if slot.as_ref().is_none_or(|f| f.generation != generation) {
                    *slot = Some(SessionFault { generation, error });
                }
            }
        });

        let constraints = CaptureConstraints::voice(self.config.sample_rate);
        if let Err(e) = self.source.open(&constraints, sink) {
            self.generation.fetch_add(1, Ordering::AcqRel);
            tracing::warn!(error = %e, "cannot start listening");
            return Err(e);
        }

        self.listening = true;
        tracing::info!(generation, "listening for wake phrase");
        Ok(())
    }

    /// Close the microphone; queued frames from this session are discarded
    pub fn stop_listening(&mut self) {
        if !self.listening {
            return;
        }

        self.generation.fetch_add(1, Ordering::AcqRel);
        self.source.close();
        self.listening = false;

        // A full queue drains as stale frames; the worker resets on the next session
        if let Some(worker) = &self.worker {
            let _ = worker.tx.try_send(WorkerMessage::Reset);
        }

        tracing::info!("stopped listening");
    }

    /// Collect a capture failure from the live session
    ///
    /// A failed session stops listening: the source is closed and
    /// `is_listening` turns false, ready for another `start_listening`.
    /// Failures from sessions that were already stopped are ignored.
    pub fn take_fault(&mut self) -> Option<Error> {
        let fault = self
            .fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        if !self.listening || fault.generation != self.generation.load(Ordering::Acquire) {
            return None;
        }

        tracing::warn!(error = %fault.error, "audio capture failed mid-session");
        self.stop_listening();
        Some(fault.error)
    }

    /// Register a subscriber for wake events
    pub fn on_wake_word_detected<F>(&self, callback: F)
    where
        F: Fn(&WakeEvent) + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Stop listening and release the background threads
    ///
    /// Subscribers stay registered so the monitor can be initialized again.
    pub fn dispose(&mut self) {
        self.stop_listening();

        let Some(worker) = self.worker.take() else {
            return;
        };

        let _ = worker.tx.send(WorkerMessage::Shutdown);
        drop(worker.tx);

        match worker.classify.join() {
            Ok(Some(classifier)) => self.classifier = Some(classifier),
            Ok(None) => tracing::error!("wake worker never received its classifier"),
            Err(_) => tracing::error!("wake worker panicked"),
        }
        if worker.dispatch.join().is_err() {
            tracing::error!("wake dispatcher panicked");
        }

        tracing::info!("wake monitor disposed");
    }

    /// Whether the microphone is routed into the worker
    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.listening
    }

    /// Whether the background threads are running
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.worker.is_some()
    }

    /// Phrase the monitor is armed with
    #[must_use]
    pub fn wake_phrase(&self) -> Option<&str> {
        self.worker.as_ref().map(|w| w.phrase.as_str())
    }

    /// Frames dropped because the worker queue was full
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for WakeWordMonitor {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for WakeWordMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeWordMonitor")
            .field("phrase", &self.wake_phrase())
            .field("listening", &self.listening)
            .field("dropped_frames", &self.dropped_frames())
            .finish_non_exhaustive()
    }
}

struct WorkerContext {
    events: Sender<WakeEvent>,
    generation: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
    phrase: String,
    sample_rate: u32,
}

/// Spawn the worker and hand it `classifier`
///
/// The classifier only moves once the thread exists, so a failed spawn
/// gives it back to the caller.
fn launch_worker<S>(
    classifier: Box<dyn WakeClassifier>,
    rx: Receiver<WorkerMessage>,
    context: WorkerContext,
    spawn: S,
) -> std::result::Result<WorkerHandle, (Box<dyn WakeClassifier>, io::Error)>
where
    S: FnOnce(WorkerBody) -> io::Result<WorkerHandle>,
{
    let (handoff_tx, handoff_rx) = mpsc::channel::<Box<dyn WakeClassifier>>();
    let body: WorkerBody = Box::new(move || {
        let classifier = handoff_rx.recv().ok()?;
        Some(run_worker(classifier, &rx, &context))
    });

    match spawn(body) {
        Ok(handle) => match handoff_tx.send(classifier) {
            Ok(()) => Ok(handle),
            Err(mpsc::SendError(classifier)) => {
                let _ = handle.join();
                Err((classifier, io::Error::other("wake worker exited before start")))
            }
        },
        Err(e) => Err((classifier, e)),
    }
}

fn run_worker(
    mut classifier: Box<dyn WakeClassifier>,
    rx: &Receiver<WorkerMessage>,
    ctx: &WorkerContext,
) -> Box<dyn WakeClassifier> {
    let mut active = 0;

    while let Ok(message) = rx.recv() {
        match message {
            WorkerMessage::Frame {
                generation,
                samples,
            } => {
                if generation != ctx.generation.load(Ordering::Acquire) {
                    continue;
                }
                if generation != active {
                    classifier.reset();
                    active = generation;
                }

                if !classifier.classify(&samples) {
                    continue;
                }
                // Listening may have stopped while the frame was classified
                if generation != ctx.generation.load(Ordering::Acquire) {
                    continue;
                }

                let event = WakeEvent {
                    phrase: ctx.phrase.clone(),
                    detected_at_ms: ctx.clock.now_ms(),
                    utterance: classifier.take_utterance(),
                    sample_rate: ctx.sample_rate,
                };
                if ctx.events.send(event).is_err() {
                    break;
                }
            }
            WorkerMessage::Reset => classifier.reset(),
            WorkerMessage::Shutdown => break,
        }
    }

    classifier.reset();
    tracing::debug!("wake worker stopped");
    classifier
}

fn run_dispatcher(events: &Receiver<WakeEvent>, subscribers: &Mutex<Vec<WakeCallback>>) {
    for event in events {
        let callbacks = subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        tracing::debug!(
            phrase = %event.phrase,
            subscribers = callbacks.len(),
            "dispatching wake event"
        );

        for callback in &callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                tracing::error!("wake subscriber panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::clock::ManualClock;

    #[derive(Default, Clone)]
    struct Loopback {
        sink: Arc<Mutex<Option<FrameSink>>>,
        opens: Arc<AtomicUsize>,
    }

    impl Loopback {
        fn push(&self, frame: &[f32]) {
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                sink.push(frame);
            }
        }
    }

    impl Loopback {
        fn fail(&self, error: Error) {
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                sink.fail(error);
            }
        }
    }

    impl AudioSource for Loopback {
        fn open(&mut self, _: &CaptureConstraints, sink: FrameSink) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
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

    /// Fires on any frame whose first sample is 1.0
    struct Marker;

    impl WakeClassifier for Marker {
        fn arm(&mut self, _: &str, _: u32) -> Result<()> {
            Ok(())
        }

        fn classify(&mut self, frame: &[f32]) -> bool {
            frame.first().is_some_and(|s| (*s - 1.0).abs() < f32::EPSILON)
        }

        fn reset(&mut self) {}
    }

    fn monitor(source: Loopback) -> WakeWordMonitor {
        WakeWordMonitor::new(
            WakeConfig::default(),
            Arc::new(ManualClock::new(42)),
            Box::new(source),
            Box::new(Marker),
        )
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_start_before_initialize_fails() {
        let mut monitor = monitor(Loopback::default());
        assert!(matches!(monitor.start_listening(), Err(Error::Initialization(_))));
        assert!(!monitor.is_listening());
    }

    #[test]
    fn test_capture_fault_ends_session() {
        let source = Loopback::default();
        let mut monitor = monitor(source.clone());
        monitor.initialize("hey buddy").unwrap();
        monitor.start_listening().unwrap();
        assert!(monitor.take_fault().is_none());

        source.fail(Error::Audio("unplugged".to_string()));
        source.fail(Error::Audio("second report".to_string()));

        let fault = monitor.take_fault();
        assert!(matches!(fault, Some(Error::Audio(ref m)) if m == "unplugged"));
        assert!(!monitor.is_listening());
        assert!(!source.is_open());
        assert!(monitor.take_fault().is_none());

        monitor.start_listening().unwrap();
        assert!(monitor.is_listening());
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_worker_spawn_failure_returns_classifier() {
        let (_tx, rx) = mpsc::sync_channel(1);
        let (events, _) = mpsc::channel();
        let context = WorkerContext {
            events,
            generation: Arc::new(AtomicU64::new(0)),
            clock: Arc::new(ManualClock::new(0)),
            phrase: "hey buddy".to_string(),
            sample_rate: 16_000,
        };

        let result = launch_worker(Box::new(Marker), rx, context, |_| {
            Err(io::Error::other("thread limit reached"))
        });

        let Err((mut classifier, e)) = result else {
            panic!("spawn should have failed");
        };
        assert_eq!(e.to_string(), "thread limit reached");
        assert!(classifier.classify(&[1.0]));
    }

    #[test]
    fn test_start_is_idempotent() {
        let source = Loopback::default();
        let mut monitor = monitor(source.clone());
        monitor.initialize("hey buddy").unwrap();

        monitor.start_listening().unwrap();
        monitor.start_listening().unwrap();

        assert!(monitor.is_listening());
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_delivered_to_every_subscriber() {
        let source = Loopback::default();
        let mut monitor = monitor(source.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            monitor.on_wake_word_detected(move |event| {
                assert_eq!(event.phrase, "hey buddy");
                assert_eq!(event.detected_at_ms, 42);
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        monitor.initialize("hey buddy").unwrap();
        monitor.start_listening().unwrap();
        source.push(&[1.0, 0.0]);

        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn test_panicking_subscriber_isolated() {
        let source = Loopback::default();
        let mut monitor = monitor(source.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        monitor.on_wake_word_detected(|_| panic!("subscriber failure"));
        let counter = Arc::clone(&hits);
        monitor.on_wake_word_detected(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor.initialize("hey buddy").unwrap();
        monitor.start_listening().unwrap();
        source.push(&[1.0]);
        source.push(&[1.0]);

        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn test_dispose_then_reinitialize() {
        let source = Loopback::default();
        let mut monitor = monitor(source.clone());
        monitor.initialize("hey buddy").unwrap();
        monitor.start_listening().unwrap();

        monitor.dispose();
        monitor.dispose();
        assert!(!monitor.is_listening());
        assert!(!monitor.is_initialized());
        assert!(!source.is_open());

        monitor.initialize("hey rex").unwrap();
        assert_eq!(monitor.wake_phrase(), Some("hey rex"));
    }

    #[test]
    fn test_event_wav_encodes_utterance() {
        let event = WakeEvent {
            phrase: "hey buddy".to_string(),
            detected_at_ms: 0,
            utterance: vec![0.0; 16],
            sample_rate: 16_000,
        };
        assert_eq!(event.to_wav().unwrap().len(), 44 + 32);
    }
}
