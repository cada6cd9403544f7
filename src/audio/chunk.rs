use super::format::{AudioFormat, PcmBuffer, from_i16, to_i16};
use async_trait::async_trait;
use hound::{SampleFormat, WavReader, WavWriter};
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;

/// Opaque fragment of encoded audio, in stream delivery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedChunk(Vec<u8>);

impl CapturedChunk {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Concatenate chunks into one raw byte buffer, preserving order
pub fn concat(chunks: &[CapturedChunk]) -> Vec<u8> {
    let total = chunks.iter().map(CapturedChunk::len).sum();
    let mut raw = Vec::with_capacity(total);
    for chunk in chunks {
        raw.extend_from_slice(chunk.as_bytes());
    }
    raw
}

/// Encodes live samples into chunks of a streamed WAV
///
/// The first chunk carries the header with zero sizes (the final length is
/// unknown while recording); every chunk after that is raw interleaved
/// little-endian 16-bit samples. Only the full ordered sequence decodes.
pub struct ChunkWriter {
    format: AudioFormat,
    header_sent: bool,
}

impl ChunkWriter {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            header_sent: false,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Encode the next run of interleaved samples, or `None` if there is nothing to emit
    pub fn encode(&mut self, samples: &[f32]) -> Option<CapturedChunk> {
        if self.header_sent && samples.is_empty() {
            return None;
        }

        let mut data = if self.header_sent {
            Vec::with_capacity(samples.len() * 2)
        } else {
            self.header_sent = true;
            streaming_header(self.format)
        };

        for &sample in samples {
            data.extend_from_slice(&to_i16(sample).to_le_bytes());
        }

        Some(CapturedChunk::new(data))
    }
}

fn streaming_header(format: AudioFormat) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    let written = WavWriter::new(&mut cursor, format.wav_spec()).and_then(|w| w.finalize());
    match written {
        Ok(()) => cursor.into_inner(),
        Err(e) => {
            // Writing into memory only fails on an invalid WavSpec
            tracing::error!("Failed to write WAV header: {}", e);
            Vec::new()
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("no audio data")]
    Empty,
    #[error("missing RIFF/WAVE header")]
    MissingHeader,
    #[error("no data chunk found")]
    MissingData,
    #[error("truncated sample data ({0} trailing bytes)")]
    Truncated(usize),
    #[error("unsupported encoding: {0}")]
    Unsupported(String),
    #[error("malformed audio: {0}")]
    Malformed(String),
}

impl From<DecodeError> for crate::error::RecorderError {
    fn from(err: DecodeError) -> Self {
        crate::error::RecorderError::ConversionFailed(err.to_string())
    }
}

/// Turns raw concatenated chunk bytes into PCM
#[async_trait]
pub trait AudioDecoder: Send + Sync {
    /// Resolves once the decoder can accept data
    async fn wait_ready(&self);

    async fn decode(&self, raw: Vec<u8>) -> Result<PcmBuffer, DecodeError>;
}

/// Decoder for the streamed WAV produced by [`ChunkWriter`]
pub struct WavChunkDecoder {
    settle: Duration,
}

impl WavChunkDecoder {
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }
}

#[async_trait]
impl AudioDecoder for WavChunkDecoder {
    async fn wait_ready(&self) {
        // No readiness signal from the capture backend; bounded wait instead
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
    }

    async fn decode(&self, raw: Vec<u8>) -> Result<PcmBuffer, DecodeError> {
        decode_streamed_wav(raw)
    }
}

pub fn decode_streamed_wav(mut raw: Vec<u8>) -> Result<PcmBuffer, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    if raw.len() < 12 || &raw[0..4] != b"RIFF" || &raw[8..12] != b"WAVE" {
        return Err(DecodeError::MissingHeader);
    }

    let (data_start, block_align) = locate_data(&raw)?;
    let payload = raw.len() - data_start;
    if block_align == 0 {
        return Err(DecodeError::Malformed("zero block alignment".into()));
    }
    if payload % block_align != 0 {
        return Err(DecodeError::Truncated(payload % block_align));
    }

    // Patch the sizes left at zero while streaming
    let riff_size = (raw.len() - 8) as u32;
    raw[4..8].copy_from_slice(&riff_size.to_le_bytes());
    raw[data_start - 4..data_start].copy_from_slice(&(payload as u32).to_le_bytes());

    let reader =
        WavReader::new(Cursor::new(raw)).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(DecodeError::Unsupported(format!(
            "{:?} {}-bit",
            spec.sample_format, spec.bits_per_sample
        )));
    }

    let samples = reader
        .into_samples::<i16>()
        .map(|s| s.map(from_i16))
        .collect::<Result<Vec<f32>, _>>()
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    Ok(PcmBuffer {
        format: AudioFormat {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        },
        samples,
    })
}

/// Walk RIFF sub-chunks; returns the data payload offset and the fmt block alignment
fn locate_data(raw: &[u8]) -> Result<(usize, usize), DecodeError> {
    let mut pos = 12;
    let mut block_align = None;

    while pos + 8 <= raw.len() {
        let id = &raw[pos..pos + 4];
        let size = u32::from_le_bytes([raw[pos + 4], raw[pos + 5], raw[pos + 6], raw[pos + 7]])
            as usize;
        let body = pos + 8;

        if id == b"data" {
            return match block_align {
                Some(align) => Ok((body, align)),
                None => Err(DecodeError::Malformed("data chunk before fmt chunk".into())),
            };
        }

        if id == b"fmt " {
            if body + 14 > raw.len() {
                return Err(DecodeError::MissingHeader);
            }
            block_align = Some(u16::from_le_bytes([raw[body + 12], raw[body + 13]]) as usize);
        }

        // Sub-chunks are word aligned
        pos = body + size + (size & 1);
    }

    Err(DecodeError::MissingData)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo() -> AudioFormat {
        AudioFormat {
            sample_rate: 48_000,
            channels: 2,
        }
    }

    #[test]
    fn test_first_chunk_carries_header() {
        let mut writer = ChunkWriter::new(AudioFormat::default());
        let first = writer.encode(&[]).unwrap();
        assert_eq!(&first.as_bytes()[0..4], b"RIFF");
        assert_eq!(first.len(), 44);

        assert!(writer.encode(&[]).is_none());
        let second = writer.encode(&[0.5, -0.5]).unwrap();
        assert_eq!(second.len(), 4);
    }

    #[test]
    fn test_concatenated_chunks_decode_in_order() {
        let mut writer = ChunkWriter::new(stereo());
        let chunks: Vec<CapturedChunk> = [vec![0.25, -0.25], vec![], vec![0.5, 0.5, -1.0, 1.0]]
            .iter()
            .filter_map(|s| writer.encode(s))
            .collect();

        let pcm = decode_streamed_wav(concat(&chunks)).unwrap();
        assert_eq!(pcm.format, stereo());
        assert_eq!(pcm.frames(), 3);
        assert!((pcm.samples[0] - 0.25).abs() < 1e-3);
        assert!((pcm.samples[4] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_rejects_missing_header() {
        let mut writer = ChunkWriter::new(AudioFormat::default());
        let _header = writer.encode(&[]);
        let body = writer.encode(&[0.1; 32]).unwrap();
        assert_eq!(
            decode_streamed_wav(body.as_bytes().to_vec()),
            Err(DecodeError::MissingHeader)
        );
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let mut writer = ChunkWriter::new(stereo());
        let mut raw = writer.encode(&[0.1, 0.2, 0.3, 0.4]).unwrap().as_bytes().to_vec();
        raw.pop();
        assert_eq!(decode_streamed_wav(raw), Err(DecodeError::Truncated(3)));
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(decode_streamed_wav(Vec::new()), Err(DecodeError::Empty));
    }

    #[tokio::test]
    async fn test_decoder_trait() {
        let decoder = WavChunkDecoder::new(Duration::ZERO);
        decoder.wait_ready().await;
        let mut writer = ChunkWriter::new(AudioFormat::default());
        let raw = writer.encode(&[0.0; 441]).unwrap().as_bytes().to_vec();
        let pcm = decoder.decode(raw).await.unwrap();
        assert_eq!(pcm.duration_ms(), 10);
    }
}
