//! Wake phrase classification
//!
//! Classification runs on the monitor's worker thread. The default
//! [`TranscribingClassifier`] gates audio by energy, collects complete
//! utterances and only fires when a transcript contains the wake phrase as
//! whole tokens. Near misses like "hey buddies" never trigger.

use super::capture::calculate_rms;
use crate::engine::Transcriber;
use crate::{Error, Result};

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Speech shorter than this is treated as noise (tenths of a second)
const MIN_SPEECH_TENTHS: u32 = 3;

/// Silence that ends an utterance (tenths of a second)
const TRAILING_SILENCE_TENTHS: u32 = 5;

/// Utterances are cut at this length (seconds)
const MAX_SEGMENT_SECS: u32 = 10;

/// Classifier consuming raw frames on the worker thread
pub trait WakeClassifier: Send {
    /// Prepare to detect `phrase` in audio captured at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns `Error::Initialization` if the phrase cannot be detected
    fn arm(&mut self, phrase: &str, sample_rate: u32) -> Result<()>;

    /// Feed one frame; `true` when the frame completes a wake phrase
    fn classify(&mut self, frame: &[f32]) -> bool;

    /// Discard any partially accumulated audio
    fn reset(&mut self);

    /// Take the audio of the most recent detection
    fn take_utterance(&mut self) -> Vec<f32> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmenterState {
    Idle,
    Speech,
}

/// Splits a frame stream into utterances using an RMS gate
#[derive(Debug)]
pub struct SpeechSegmenter {
    state: SegmenterState,
    buffer: Vec<f32>,
    speech_samples: usize,
    silence_samples: usize,
    min_speech: usize,
    trailing_silence: usize,
    max_segment: usize,
}

impl SpeechSegmenter {
    /// Create a segmenter for audio at `sample_rate`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(sample_rate: u32) -> Self {
        let tenths = |n: u32| (u64::from(sample_rate) * u64::from(n) / 10) as usize;
        Self {
            state: SegmenterState::Idle,
            buffer: Vec::new(),
            speech_samples: 0,
            silence_samples: 0,
            min_speech: tenths(MIN_SPEECH_TENTHS),
            trailing_silence: tenths(TRAILING_SILENCE_TENTHS),
            max_segment: tenths(MAX_SEGMENT_SECS * 10),
        }
    }

    /// Feed one frame; returns a finished utterance once it is followed by
    /// enough silence or reaches the length cap
    pub fn feed(&mut self, frame: &[f32]) -> Option<Vec<f32>> {
        let energy = calculate_rms(frame);
        let is_speech = energy > ENERGY_THRESHOLD;

        match self.state {
            SegmenterState::Idle => {
                if is_speech {
                    self.state = SegmenterState::Speech;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(frame);
                    self.speech_samples = frame.len();
                    self.silence_samples = 0;
                    tracing::trace!(energy, "speech started");
                }
                None
            }
            SegmenterState::Speech => {
                self.buffer.extend_from_slice(frame);
                if is_speech {
                    self.speech_samples += frame.len();
                    self.silence_samples = 0;
                } else {
                    self.silence_samples += frame.len();
                }

                if self.silence_samples >= self.trailing_silence
                    || self.buffer.len() >= self.max_segment
                {
                    return self.finish();
                }
                None
            }
        }
    }

    fn finish(&mut self) -> Option<Vec<f32>> {
        let long_enough = self.speech_samples >= self.min_speech;
        let segment = std::mem::take(&mut self.buffer);
        self.reset();

        if long_enough {
            tracing::debug!(samples = segment.len(), "speech segment complete");
            Some(segment)
        } else {
            tracing::trace!("segment too short, discarded");
            None
        }
    }

    /// Drop any partial utterance
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.buffer.clear();
        self.speech_samples = 0;
        self.silence_samples = 0;
    }

    /// Whether an utterance is in progress
    #[must_use]
    pub fn in_speech(&self) -> bool {
        self.state == SegmenterState::Speech
    }
}

/// Matches a wake phrase as a contiguous run of whole tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseMatcher {
    tokens: Vec<String>,
}

impl PhraseMatcher {
    /// Build a matcher for `phrase`
    ///
    /// # Errors
    ///
    /// Returns `Error::Initialization` if the phrase has no word characters
    pub fn new(phrase: &str) -> Result<Self> {
        let tokens = tokenize(phrase);
        if tokens.is_empty() {
            return Err(Error::Initialization(format!(
                "wake phrase {phrase:?} has no words"
            )));
        }
        Ok(Self { tokens })
    }

    /// Whether `transcript` contains the phrase
    #[must_use]
    pub fn matches(&self, transcript: &str) -> bool {
        let words = tokenize(transcript);
        words
            .windows(self.tokens.len())
            .any(|window| window == self.tokens.as_slice())
    }
}

/// Lowercase words with punctuation stripped; apostrophes join their word
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|word| {
            word.chars()
                .filter(|c| *c != '\'')
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

/// Default classifier: energy segmentation, transcription, phrase match
pub struct TranscribingClassifier {
    transcriber: Box<dyn Transcriber>,
    segmenter: Option<SpeechSegmenter>,
    matcher: Option<PhraseMatcher>,
    sample_rate: u32,
    last_utterance: Vec<f32>,
}

impl TranscribingClassifier {
    /// Create an unarmed classifier around `transcriber`
    #[must_use]
    pub fn new(transcriber: Box<dyn Transcriber>) -> Self {
        Self {
            transcriber,
            segmenter: None,
            matcher: None,
            sample_rate: 0,
            last_utterance: Vec::new(),
        }
    }
}

impl WakeClassifier for TranscribingClassifier {
    fn arm(&mut self, phrase: &str, sample_rate: u32) -> Result<()> {
        if sample_rate == 0 {
            return Err(Error::Initialization("sample rate must be positive".to_string()));
        }
        self.matcher = Some(PhraseMatcher::new(phrase)?);
        self.segmenter = Some(SpeechSegmenter::new(sample_rate));
        self.sample_rate = sample_rate;
        tracing::debug!(phrase, sample_rate, "wake classifier armed");
        Ok(())
    }

    fn classify(&mut self, frame: &[f32]) -> bool {
        let (Some(segmenter), Some(matcher)) = (self.segmenter.as_mut(), self.matcher.as_ref())
        else {
            return false;
        };
        let Some(segment) = segmenter.feed(frame) else {
            return false;
        };

        match self.transcriber.transcribe(&segment, self.sample_rate) {
            Ok(transcript) if matcher.matches(&transcript) => {
                tracing::info!(transcript, "wake phrase detected");
                self.last_utterance = segment;
                true
            }
            Ok(transcript) => {
                tracing::debug!(transcript, "no wake phrase in segment");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "transcription failed");
                false
            }
        }
    }

    fn reset(&mut self) {
        if let Some(segmenter) = self.segmenter.as_mut() {
            segmenter.reset();
        }
        self.last_utterance.clear();
    }

    fn take_utterance(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.last_utterance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;

    struct Echo(&'static str);

    impl Transcriber for Echo {
        fn transcribe(&mut self, _: &[f32], _: u32) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn feed_all(segmenter: &mut SpeechSegmenter, samples: &[f32]) -> Vec<Vec<f32>> {
        samples
            .chunks(1600)
            .filter_map(|frame| segmenter.feed(frame))
            .collect()
    }

    fn tone(secs_tenths: usize) -> Vec<f32> {
        vec![0.2; 1600 * secs_tenths]
    }

    fn silence(secs_tenths: usize) -> Vec<f32> {
        vec![0.0; 1600 * secs_tenths]
    }

    #[test]
    fn test_segment_emitted_after_trailing_silence() {
        let mut segmenter = SpeechSegmenter::new(RATE);
        let mut audio = tone(6);
        audio.extend(silence(6));

        let segments = feed_all(&mut segmenter, &audio);
        assert_eq!(segments.len(), 1);
        assert!(!segmenter.in_speech());
    }

    #[test]
    fn test_short_blip_discarded() {
        let mut segmenter = SpeechSegmenter::new(RATE);
        let mut audio = tone(1);
        audio.extend(silence(6));

        assert!(feed_all(&mut segmenter, &audio).is_empty());
    }

    #[test]
    fn test_silence_never_segments() {
        let mut segmenter = SpeechSegmenter::new(RATE);
        assert!(feed_all(&mut segmenter, &silence(600)).is_empty());
        assert!(!segmenter.in_speech());
    }

    #[test]
    fn test_long_speech_cut_at_cap() {
        let mut segmenter = SpeechSegmenter::new(RATE);
        let segments = feed_all(&mut segmenter, &tone(105));
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].len(), RATE as usize * 10);
    }

    #[test]
    fn test_matcher_whole_tokens_only() {
        let matcher = PhraseMatcher::new("Hey Buddy").unwrap();

        assert!(matcher.matches("hey buddy"));
        assert!(matcher.matches("Hey, buddy! what's up"));
        assert!(matcher.matches("okay hey buddy"));

        assert!(!matcher.matches("hey buddies"));
        assert!(!matcher.matches("hay buddy"));
        assert!(!matcher.matches("hey body"));
        assert!(!matcher.matches("buddy hey"));
        assert!(!matcher.matches("hey buddy's"));
        assert!(!matcher.matches(""));
    }

    #[test]
    fn test_matcher_rejects_empty_phrase() {
        assert!(matches!(PhraseMatcher::new(" ?! "), Err(Error::Initialization(_))));
    }

    #[test]
    fn test_unarmed_classifier_never_fires() {
        let mut classifier = TranscribingClassifier::new(Box::new(Echo("hey buddy")));
        for frame in tone(20).chunks(1600) {
            assert!(!classifier.classify(frame));
        }
    }

    #[test]
    fn test_classifier_fires_on_phrase() {
        let mut classifier = TranscribingClassifier::new(Box::new(Echo("hey buddy")));
        classifier.arm("hey buddy", RATE).unwrap();

        let mut audio = tone(6);
        audio.extend(silence(6));
        let fired = audio
            .chunks(1600)
            .filter(|frame| classifier.classify(frame))
            .count();

        assert_eq!(fired, 1);
        assert_eq!(classifier.take_utterance().len(), 1600 * 11);
        assert!(classifier.take_utterance().is_empty());
    }

    #[test]
    fn test_classifier_ignores_other_speech() {
        let mut classifier = TranscribingClassifier::new(Box::new(Echo("hey buddies")));
        classifier.arm("hey buddy", RATE).unwrap();

        let mut audio = tone(6);
        audio.extend(silence(6));
        assert!(!audio.chunks(1600).any(|frame| classifier.classify(frame)));
    }
}
