use anyhow::{Result, anyhow};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Frames fed to the sinc resampler per call
const CHUNK_FRAMES: usize = 1024;

/// Average interleaved channels down to mono
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample mono audio, falling back to linear interpolation if rubato fails
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    match resample_with_rubato(input, from_rate, to_rate) {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!("Sinc resampling failed, using linear fallback: {}", e);
            resample_linear(input, from_rate, to_rate)
        }
    }
}

/// Band-limited sinc resampling of mono audio
///
/// Output length is `input.len() * to_rate / from_rate`, rounded.
pub fn resample_with_rubato(input: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        return Err(anyhow!("invalid sample rate {from_rate}Hz -> {to_rate}Hz"));
    }
    if from_rate == to_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    //                                   ratio, drift, params, chunk_size, channels
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, CHUNK_FRAMES, 1)
        .map_err(|e| anyhow!("failed to construct sinc resampler: {e:?}"))?;

    let expected = (input.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(expected + CHUNK_FRAMES);
    let mut chunk = vec![0.0f32; CHUNK_FRAMES];

    for segment in input.chunks(CHUNK_FRAMES) {
        // Last segment is padded with silence to a full chunk
        chunk.fill(0.0);
        chunk[..segment.len()].copy_from_slice(segment);
        let produced = resampler
            .process(std::slice::from_ref(&chunk), None)
            .map_err(|e| anyhow!("resampler process failed: {e:?}"))?;
        output.extend_from_slice(&produced[0]);
    }

    output.resize(expected, 0.0);
    Ok(output)
}

/// Lightweight linear resampler, used only when the sinc path errors
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == 0 || from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (input.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = (src_idx - idx as f64) as f32;

        if idx + 1 < input.len() {
            output.push(input[idx] * (1.0 - frac) + input[idx + 1] * frac);
        } else {
            output.push(input.last().copied().unwrap_or(0.0));
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmixes_multi_channel_audio() {
        let samples = [1.0f32, -1.0, 0.5, 0.5];
        assert_eq!(downmix(&samples, 2), vec![0.0, 0.5]);
    }

    #[test]
    fn preserves_single_channel_audio() {
        let samples = [0.1f32, 0.2, 0.3];
        assert_eq!(downmix(&samples, 1), samples);
    }

    #[test]
    fn sinc_resample_keeps_duration_and_level() {
        let input = vec![0.25f32; 48_000];
        let output = resample_with_rubato(&input, 48_000, 44_100).unwrap();
        assert_eq!(output.len(), 44_100);

        // Away from the filter warm-up the DC level is preserved
        let middle = &output[10_000..30_000];
        assert!(
            middle.iter().all(|s| (s - 0.25).abs() < 0.01),
            "level drifted"
        );
    }

    #[test]
    fn sinc_resample_upsamples() {
        let input: Vec<f32> = (0..16_000)
            .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 16_000.0).sin() * 0.5)
            .collect();
        let output = resample_with_rubato(&input, 16_000, 44_100).unwrap();
        assert_eq!(output.len(), 44_100);

        let peak = output[5_000..40_000]
            .iter()
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!((peak - 0.5).abs() < 0.05, "peak {}", peak);
    }

    #[test]
    fn same_rate_is_identity() {
        let input = [0.1f32, -0.2, 0.3];
        assert_eq!(resample(&input, 44_100, 44_100), input);
    }

    #[test]
    fn zero_rate_falls_back_to_input() {
        assert!(resample_with_rubato(&[0.1], 0, 44_100).is_err());
        assert_eq!(resample(&[0.1f32, 0.2], 0, 44_100), vec![0.1, 0.2]);
    }

    #[test]
    fn linear_fallback_keeps_duration() {
        let input = vec![0.25f32; 48_000];
        let output = resample_linear(&input, 48_000, 44_100);
        assert_eq!(output.len(), 44_100);
        assert!(output.iter().all(|s| (s - 0.25).abs() < 1e-6));
    }
}
