//! Audio capture from microphone

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, SampleFormat, SampleRate, Stream, StreamConfig, StreamError};

use crate::{Error, Result};

/// Processing requested from the capture device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
}

impl CaptureConstraints {
    /// Voice-tuned constraints at `sample_rate`
    #[must_use]
    pub const fn voice(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
        }
    }
}

type Deliver = Arc<dyn Fn(&[f32]) -> bool + Send + Sync>;
type Fault = Arc<dyn Fn(Error) + Send + Sync>;

/// Non-blocking destination for captured mono frames
///
/// `push` is called from the audio callback and must never block; the
/// receiving side decides whether to queue or drop. Sources report stream
/// failures after `open` through `fail`.
#[derive(Clone)]
pub struct FrameSink {
    deliver: Deliver,
    fault: Fault,
}

impl FrameSink {
    /// Wrap a delivery function returning `false` once the receiver is gone
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(&[f32]) -> bool + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
            fault: Arc::new(|err| tracing::warn!(error = %err, "unhandled capture fault")),
        }
    }

    /// Route stream failures to `fault`
    #[must_use]
    pub fn on_fault<F>(mut self, fault: F) -> Self
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        self.fault = Arc::new(fault);
        self
    }

    /// Deliver one frame; `false` if the receiver has shut down
    pub fn push(&self, samples: &[f32]) -> bool {
        (self.deliver)(samples)
    }

    /// Report that the stream failed after it was opened
    pub fn fail(&self, err: Error) {
        (self.fault)(err);
    }
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSink").finish_non_exhaustive()
    }
}

/// A live audio input the wake monitor can route into its worker
pub trait AudioSource: Send {
    /// Start delivering frames to `sink`
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if the microphone is unavailable or
    /// access was denied, `Error::Audio` for other device failures
    fn open(&mut self, constraints: &CaptureConstraints, sink: FrameSink) -> Result<()>;

    /// Stop all input and release the device
    fn close(&mut self);

    /// Whether the source is currently delivering frames
    fn is_open(&self) -> bool;
}

struct CaptureThread {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Captures audio from the default input device
///
/// The `cpal` stream lives on a dedicated thread for its whole life, so
/// the source itself can move between threads.
#[derive(Default)]
pub struct MicrophoneSource {
    capture: Option<CaptureThread>,
}

impl MicrophoneSource {
    /// Create a closed microphone source
    #[must_use]
    pub const fn new() -> Self {
        Self { capture: None }
    }
}

impl AudioSource for MicrophoneSource {
    fn open(&mut self, constraints: &CaptureConstraints, sink: FrameSink) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let constraints = constraints.clone();

        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || match build_input_stream(&constraints, sink) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Hold the stream until asked to stop or the owner is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::debug!("audio capture stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| Error::Initialization(format!("cannot spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.capture = Some(CaptureThread {
                    stop: stop_tx,
                    handle,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::Audio("capture thread exited before starting".to_string()))
            }
        }
    }

    fn close(&mut self) {
        if let Some(capture) = self.capture.take() {
            let _ = capture.stop.send(());
            if capture.handle.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.capture.is_some()
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_input_stream(constraints: &CaptureConstraints, sink: FrameSink) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Permission("no input device available".to_string()))?;

    let rate = SampleRate(constraints.sample_rate);
    let mut candidates: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| {
            c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
        })
        .collect();
    // Prefer mono, fall back to downmixing
    candidates.sort_by_key(cpal::SupportedStreamConfigRange::channels);

    let supported = candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;
    let config: StreamConfig = supported.with_sample_rate(rate).config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = constraints.sample_rate,
        channels,
        echo_cancellation = constraints.echo_cancellation,
        noise_suppression = constraints.noise_suppression,
        auto_gain = constraints.auto_gain,
        "audio capture initialized"
    );

    let fault_sink = sink.clone();
    let mut receiver_open = true;
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !receiver_open {
                    return;
                }
                receiver_open = if channels == 1 {
                    sink.push(data)
                } else {
                    sink.push(&downmix(data, channels))
                };
                if !receiver_open {
                    sink.fail(Error::Audio("frame receiver closed".to_string()));
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                fault_sink.fail(stream_fault(&err));
            },
            None,
        )
        .map_err(|e| match e {
            BuildStreamError::DeviceNotAvailable => {
                Error::Permission("microphone unavailable or access denied".to_string())
            }
            other => Error::Audio(other.to_string()),
        })?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    tracing::debug!("audio capture started");
    Ok(stream)
}

/// A running stream failure is a device problem worth retrying
fn stream_fault(err: &StreamError) -> Error {
    match err {
        StreamError::DeviceNotAvailable => {
            Error::Audio("input device disconnected".to_string())
        }
        StreamError::BackendSpecific { err } => Error::Audio(err.description.clone()),
    }
}

/// Average interleaved channels into mono
#[allow(clippy::cast_precision_loss)]
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_energy_calculation() {
        let silence = vec![0.0f32; 100];
        assert!(calculate_rms(&silence) < 0.001);

        let loud = vec![0.5f32; 100];
        assert!(calculate_rms(&loud) > 0.4);
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[0.2, 0.4, -1.0, 1.0], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!(mono[1].abs() < 1e-6);
    }

    #[test]
    fn test_frame_sink_delivers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = FrameSink::new(move |samples| {
            sink_seen.lock().unwrap().extend_from_slice(samples);
            true
        });

        assert!(sink.push(&[0.1, 0.2]));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_frame_sink_reports_faults() {
        let faults = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&faults);
        let sink = FrameSink::new(|_| true).on_fault(move |err| {
            seen.lock().unwrap().push(err.to_string());
        });

        sink.clone().fail(Error::Audio("unplugged".to_string()));
        assert_eq!(*faults.lock().unwrap(), ["audio error: unplugged"]);
    }

    #[test]
    fn test_disconnect_is_recoverable_audio_error() {
        assert!(matches!(
            stream_fault(&StreamError::DeviceNotAvailable),
            Error::Audio(_)
        ));
    }
}
