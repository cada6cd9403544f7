use super::chunk::{AudioDecoder, CapturedChunk, concat};
use super::format::{from_i16, to_i16};
use super::{mp3, resample};
use crate::error::RecorderError;
use hound::WavReader;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Container of the finished artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp3,
    Wav,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "audio/mp3",
            OutputFormat::Wav => "audio/wav",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Wav => "wav",
        }
    }
}

/// One compressed blob, ready for upload
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAudio {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

impl EncodedAudio {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Turns a frozen chunk sequence into one audio artifact
///
/// Pipeline: concatenate, decode to PCM, serialize to a 16-bit WAV, then
/// (for MP3) feed those 16-bit samples to LAME at mono / 44.1 kHz / 128 kbps.
pub struct Encoder {
    decoder: Box<dyn AudioDecoder>,
    output: OutputFormat,
}

impl Encoder {
    pub fn new(decoder: Box<dyn AudioDecoder>, output: OutputFormat) -> Self {
        Self { decoder, output }
    }

    pub async fn encode(&self, chunks: &[CapturedChunk]) -> Result<EncodedAudio, RecorderError> {
        if chunks.is_empty() {
            return Err(RecorderError::Usage("encode called with no captured chunks"));
        }

        self.decoder.wait_ready().await;

        let raw = concat(chunks);
        tracing::debug!("Decoding {} chunks ({} bytes)", chunks.len(), raw.len());
        let pcm = self.decoder.decode(raw).await?;
        tracing::info!(
            "Decoded {} ms of audio at {} Hz, {} channel(s)",
            pcm.duration_ms(),
            pcm.format.sample_rate,
            pcm.format.channels
        );

        let wav = pcm
            .to_wav_bytes()
            .map_err(|e| RecorderError::ConversionFailed(e.to_string()))?;

        let bytes = match self.output {
            OutputFormat::Wav => wav,
            OutputFormat::Mp3 => tokio::task::spawn_blocking(move || wav_to_mp3(&wav))
                .await
                .map_err(|e| RecorderError::Compression(e.to_string()))??,
        };

        Ok(EncodedAudio {
            bytes,
            content_type: self.output.content_type(),
        })
    }
}

/// Compress an intermediate 16-bit WAV
///
/// LAME is always configured for mono 44.1 kHz, so the samples are
/// downmixed and resampled to match before compression.
fn wav_to_mp3(wav: &[u8]) -> Result<Vec<u8>, RecorderError> {
    let reader = WavReader::new(Cursor::new(wav))
        .map_err(|e| RecorderError::ConversionFailed(e.to_string()))?;
    let spec = reader.spec();
    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<i16>, _>>()
        .map_err(|e| RecorderError::ConversionFailed(e.to_string()))?;

    let samples = if spec.channels == 1 && spec.sample_rate == mp3::SAMPLE_RATE {
        samples
    } else {
        tracing::debug!(
            "Conforming {} Hz / {} channel(s) to {} Hz mono",
            spec.sample_rate,
            spec.channels,
            mp3::SAMPLE_RATE
        );
        let floats: Vec<f32> = samples.iter().copied().map(from_i16).collect();
        let mono = resample::downmix(&floats, spec.channels);
        resample::resample(&mono, spec.sample_rate, mp3::SAMPLE_RATE)
            .into_iter()
            .map(to_i16)
            .collect()
    };

    mp3::encode_mono(&samples)
}
