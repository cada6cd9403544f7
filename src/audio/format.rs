// NOTE: Chunks and the intermediate container always carry 16-bit signed integer PCM.
// In memory, decoded audio is interleaved f32 in -1.0..=1.0.

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const BITS_PER_SAMPLE: u16 = 16;

    /// Calculate number of interleaved samples for a given duration in seconds
    pub fn samples_for_duration(&self, seconds: f32) -> usize {
        (self.sample_rate as f32 * seconds) as usize * self.channels as usize
    }

    pub fn wav_spec(&self) -> WavSpec {
        WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: Self::BITS_PER_SAMPLE,
            sample_format: SampleFormat::Int,
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 1,
        }
    }
}

/// Convert f32 (-1.0 to 1.0) to i16
pub fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

pub fn from_i16(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Decoded audio, channel count and rate as reported by the decoder
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub format: AudioFormat,
    pub samples: Vec<f32>,
}

impl PcmBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels.max(1) as usize
    }

    pub fn duration_ms(&self) -> u64 {
        if self.format.sample_rate == 0 {
            return 0;
        }
        self.frames() as u64 * 1000 / self.format.sample_rate as u64
    }

    /// Serialize into an uncompressed 16-bit WAV container
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, self.format.wav_spec())
                .context("Failed to create WAV writer")?;
            for &sample in &self.samples {
                writer
                    .write_sample(to_i16(sample))
                    .context("Failed to write WAV sample")?;
            }
            writer.finalize().context("Failed to finalize WAV")?;
        }
        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_for_duration() {
        let mono = AudioFormat::default();
        assert_eq!(mono.samples_for_duration(1.0), 44_100);

        let stereo = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
        };
        assert_eq!(stereo.samples_for_duration(0.5), 48_000);
    }

    #[test]
    fn test_sample_conversion_clamps() {
        assert_eq!(to_i16(2.0), i16::MAX);
        assert_eq!(to_i16(-2.0), -i16::MAX);
        assert_eq!(to_i16(0.0), 0);
        assert!((from_i16(16384) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_wav_bytes_header_and_length() {
        let pcm = PcmBuffer {
            format: AudioFormat::default(),
            samples: vec![0.0; 441],
        };
        let bytes = pcm.to_wav_bytes().unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(bytes.len(), 44 + 441 * 2);
        assert_eq!(pcm.duration_ms(), 10);
    }
}
