//! MP3 compression via LAME, plus a frame-header probe for encoded output

use crate::error::RecorderError;
use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, MonoPcm, Quality};

pub const SAMPLE_RATE: u32 = 44_100;
pub const BITRATE_KBPS: u32 = 128;

/// LAME encoder delay plus the MP3 decoder delay, in samples
pub const LEAD_IN_SAMPLES: u64 = 576 + 529;

/// Compress mono 16-bit samples at 44.1 kHz / 128 kbps
///
/// No VBR/Info tag frame is written: output is streamed into memory and the
/// tag could never be patched afterwards.
pub fn encode_mono(samples: &[i16]) -> Result<Vec<u8>, RecorderError> {
    tracing::debug!(
        "Compressing {} samples at {} kbps",
        samples.len(),
        BITRATE_KBPS
    );
    let mut builder = Builder::new()
        .ok_or_else(|| RecorderError::Compression("Failed to create LAME builder".into()))?;
    builder.set_num_channels(1).map_err(compression)?;
    builder.set_sample_rate(SAMPLE_RATE).map_err(compression)?;
    builder.set_brate(Bitrate::Kbps128).map_err(compression)?;
    builder.set_quality(Quality::Good).map_err(compression)?;
    builder.set_to_write_vbr_tag(false).map_err(compression)?;
    let mut encoder = builder.build().map_err(compression)?;

    let mut out = Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(samples.len()));
    encoder
        .encode_to_vec(MonoPcm(samples), &mut out)
        .map_err(compression)?;

    // Trailing frames still buffered inside LAME
    out.reserve(7200);
    encoder
        .flush_to_vec::<FlushNoGap>(&mut out)
        .map_err(compression)?;

    Ok(out)
}

fn compression(err: impl std::fmt::Display) -> RecorderError {
    RecorderError::Compression(err.to_string())
}

/// Summary of an MPEG audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mp3Info {
    pub frames: u64,
    pub sample_rate: u32,
    pub samples_per_frame: u32,
}

impl Mp3Info {
    /// Length of all frames, including encoder padding
    pub fn duration_ms(&self) -> u64 {
        self.total_samples() * 1000 / self.sample_rate as u64
    }

    /// Duration a gapless decoder would play back
    pub fn playable_duration_ms(&self) -> u64 {
        self.total_samples().saturating_sub(LEAD_IN_SAMPLES) * 1000 / self.sample_rate as u64
    }

    fn total_samples(&self) -> u64 {
        self.frames * self.samples_per_frame as u64
    }
}

struct FrameHeader {
    length: usize,
    sample_rate: u32,
    samples_per_frame: u32,
    side_info: usize,
}

const BITRATES_V1_L3: [u32; 15] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];
const BITRATES_V2_L3: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

fn parse_header(bytes: &[u8]) -> Option<FrameHeader> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
        return None;
    }

    let version = (bytes[1] >> 3) & 0b11; // 0 = 2.5, 2 = 2, 3 = 1
    let layer = (bytes[1] >> 1) & 0b11; // 1 = Layer III
    let bitrate_idx = (bytes[2] >> 4) as usize;
    let rate_idx = ((bytes[2] >> 2) & 0b11) as usize;
    let padding = ((bytes[2] >> 1) & 1) as usize;
    let mono = (bytes[3] >> 6) == 0b11;

    if version == 1 || layer != 1 || bitrate_idx == 0 || bitrate_idx == 15 || rate_idx == 3 {
        return None;
    }

    let base_rate = [44_100, 48_000, 32_000][rate_idx];
    let (sample_rate, bitrate, samples_per_frame, side_info) = match version {
        3 => (
            base_rate,
            BITRATES_V1_L3[bitrate_idx],
            1152,
            if mono { 17 } else { 32 },
        ),
        2 => (
            base_rate / 2,
            BITRATES_V2_L3[bitrate_idx],
            576,
            if mono { 9 } else { 17 },
        ),
        _ => (
            base_rate / 4,
            BITRATES_V2_L3[bitrate_idx],
            576,
            if mono { 9 } else { 17 },
        ),
    };

    let length = (samples_per_frame as usize / 8) * bitrate as usize * 1000 / sample_rate as usize
        + padding;

    Some(FrameHeader {
        length,
        sample_rate,
        samples_per_frame,
        side_info,
    })
}

/// Count MPEG Layer III frames, skipping ID3v2 and any Xing/Info tag frame
pub fn probe(bytes: &[u8]) -> Option<Mp3Info> {
    let mut pos = id3v2_len(bytes);
    let mut info: Option<Mp3Info> = None;

    while pos + 4 <= bytes.len() {
        let Some(header) = parse_header(&bytes[pos..]) else {
            pos += 1;
            continue;
        };
        if header.length < 4 {
            pos += 1;
            continue;
        }

        let tag_at = pos + 4 + header.side_info;
        let is_tag = info.is_none()
            && bytes
                .get(tag_at..tag_at + 4)
                .is_some_and(|id| id == b"Xing" || id == b"Info");

        if !is_tag {
            let entry = info.get_or_insert(Mp3Info {
                frames: 0,
                sample_rate: header.sample_rate,
                samples_per_frame: header.samples_per_frame,
            });
            entry.frames += 1;
        }
        pos += header.length;
    }

    info
}

fn id3v2_len(bytes: &[u8]) -> usize {
    if bytes.len() < 10 || &bytes[0..3] != b"ID3" {
        return 0;
    }
    // Syncsafe size, 7 bits per byte
    let size = bytes[6..10]
        .iter()
        .fold(0usize, |acc, &b| (acc << 7) | (b & 0x7F) as usize);
    10 + size
}

/// Fully decode `bytes` and return the length of the decoded audio
#[cfg(test)]
pub(crate) fn decoded_duration_ms(bytes: &[u8]) -> u64 {
    use rodio::Source;

    let decoder = rodio::Decoder::new(std::io::Cursor::new(bytes.to_vec()))
        .expect("MP3 output decodes");
    let channels = decoder.channels().max(1) as u64;
    let sample_rate = decoder.sample_rate() as u64;
    let samples = decoder.count() as u64;
    samples / channels * 1000 / sample_rate
}
