//! Voice processing module
//!
//! Handles audio capture and always-on wake-word detection. Recognition of
//! what follows the wake phrase happens downstream.

mod capture;
mod classifier;
mod monitor;
pub mod restart;
mod wav;

pub use capture::{AudioSource, CaptureConstraints, FrameSink, MicrophoneSource, calculate_rms};
pub use classifier::{PhraseMatcher, SpeechSegmenter, TranscribingClassifier, WakeClassifier};
pub use monitor::{WakeCallback, WakeEvent, WakeWordMonitor};
pub use restart::RestartPolicy;
pub use wav::{samples_to_wav, wav_to_samples};

/// Audio sample rate for wake detection (16kHz is standard for STT)
pub const SAMPLE_RATE: u32 = 16000;
