//! 16-bit PCM WAV encoding for captured audio

use std::io::Cursor;

use crate::{Error, Result};

/// Encode mono `f32` samples as a 16-bit PCM WAV file
///
/// # Errors
///
/// Returns error if the WAV writer fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let pcm = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            writer
                .write_sample(pcm)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Decode a mono 16-bit PCM WAV file into `f32` samples and its sample rate
///
/// # Errors
///
/// Returns error if the bytes are not a readable 16-bit WAV
pub fn wav_to_samples(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(Error::Audio(format!(
            "unsupported wav format: {} bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }

    let samples = reader
        .samples::<i16>()
        .map(|s| s.map(|v| f32::from(v) / f32::from(i16::MAX)))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Audio(e.to_string()))?;

    Ok((samples, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header_and_length() {
        let wav = samples_to_wav(&[0.0; 160], 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 320);
    }

    #[test]
    fn test_out_of_range_samples_clamped() {
        let wav = samples_to_wav(&[2.0, -2.0], 16_000).unwrap();
        let (samples, rate) = wav_to_samples(&wav).unwrap();

        assert_eq!(rate, 16_000);
        assert!((samples[0] - 1.0).abs() < 1e-4);
        assert!((samples[1] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(wav_to_samples(b"not a wav").is_err());
    }
}
