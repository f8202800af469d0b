//! Boundaries to the external speech engines
//!
//! Recognition and synthesis are implemented elsewhere; the core only feeds
//! them audio or text and caches what they return.

use std::io::Write;
use std::process::{Child, Command, Stdio};

use async_trait::async_trait;

use crate::voice::samples_to_wav;
use crate::{Error, Result};

/// Text-to-speech engine
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` into encoded audio bytes
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Speech-to-text engine used to verify wake phrase candidates
///
/// Called from the wake worker thread, so implementations may block.
pub trait Transcriber: Send {
    /// Transcribe mono f32 samples captured at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    fn transcribe(&mut self, samples: &[f32], sample_rate: u32) -> Result<String>;
}

/// Transcriber that runs an external speech-to-text program
///
/// The segment is written to the program's stdin as a 16-bit mono WAV; the
/// transcript is whatever it prints to stdout.
#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
}

impl CommandTranscriber {
    /// Parse a whitespace-separated command line
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the command is empty
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("speech-to-text command is empty".to_string()))?;

        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl Transcriber for CommandTranscriber {
    fn transcribe(&mut self, samples: &[f32], sample_rate: u32) -> Result<String> {
        let wav = samples_to_wav(samples, sample_rate)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(&wav)
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            reap(&mut child);
            return Err(e.into());
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::Audio(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        let transcript = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::debug!(transcript, "segment transcribed");
        Ok(transcript)
    }
}

/// Kill `child` and wait for it so it does not linger as a zombie
fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "speech-to-text process already exited");
    }
    if let Err(e) = child.wait() {
        tracing::warn!(error = %e, "failed to reap speech-to-text process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(CommandTranscriber::new("  "), Err(Error::Config(_))));
    }

    #[test]
    fn test_command_split() {
        let t = CommandTranscriber::new("whisper-cli --stdin  -l en").unwrap();
        assert_eq!(t.program, "whisper-cli");
        assert_eq!(t.args, vec!["--stdin", "-l", "en"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_transcript_read_from_stdout() {
        let mut t = CommandTranscriber::new("echo hey buddy").unwrap();
        assert_eq!(t.transcribe(&[0.0; 16], 16_000).unwrap(), "hey buddy");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_command_is_error() {
        let mut t = CommandTranscriber::new("false").unwrap();
        assert!(t.transcribe(&[0.0; 16], 16_000).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_reap_collects_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        reap(&mut child);
        assert!(child.try_wait().unwrap().is_some());
    }
}
