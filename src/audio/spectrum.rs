//! Byte frequency data for level metering
//!
//! Mirrors the behaviour of a browser AnalyserNode so levels line up with
//! what users are used to seeing:
//! - Blackman window over the most recent `fft_size` samples
//! - Magnitudes normalised by the FFT size and smoothed over time
//! - Decibels mapped from `[min_db, max_db]` onto `0..=255`

use rustfft::{Fft, FftPlanner, num_complex::Complex};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SpectrumConfig {
    /// FFT window size, a power of two
    pub fft_size: usize,
    /// Temporal smoothing factor (0.0-1.0, higher = more smoothing)
    pub smoothing: f32,
    pub min_db: f32,
    pub max_db: f32,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            fft_size: 128,
            smoothing: 0.8,
            min_db: -100.0,
            max_db: -30.0,
        }
    }
}

pub struct SpectrumAnalyzer {
    config: SpectrumConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    pub fn new(fft_size: usize) -> Self {
        Self::with_config(SpectrumConfig {
            fft_size,
            ..SpectrumConfig::default()
        })
    }

    pub fn with_config(config: SpectrumConfig) -> Self {
        let n = config.fft_size;
        let fft = FftPlanner::new().plan_fft_forward(n);

        // Blackman window, alpha = 0.16
        let window = (0..n)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / n as f32;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();

        Self {
            fft,
            window,
            smoothed: vec![0.0; n / 2],
            scratch: vec![Complex::new(0.0, 0.0); n],
            config,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.config.fft_size
    }

    /// Number of frequency bins produced per frame
    pub fn bin_count(&self) -> usize {
        self.config.fft_size / 2
    }

    /// Compute byte magnitudes for the latest samples
    ///
    /// `frame` shorter than the FFT size is zero-padded at the front; longer
    /// frames use only the most recent samples. Writes up to `bins.len()` bins.
    pub fn byte_frequency_data(&mut self, frame: &[f32], bins: &mut [u8]) {
        let n = self.config.fft_size;
        let recent = &frame[frame.len().saturating_sub(n)..];
        let pad = n - recent.len();

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { recent[i - pad] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }

        self.fft.process(&mut self.scratch);

        let range = self.config.max_db - self.config.min_db;
        let tau = self.config.smoothing;
        for (k, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.scratch[k].norm() / n as f32;
            *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;

            if let Some(out) = bins.get_mut(k) {
                let db = 20.0 * smoothed.max(1e-12).log10();
                let scaled = 255.0 * (db - self.config.min_db) / range;
                *out = scaled.clamp(0.0, 255.0) as u8;
            }
        }
    }

    /// Forget smoothing history
    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
    }
}

/// Arithmetic mean of byte magnitudes
pub fn average(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    bins.iter().map(|&b| b as f32).sum::<f32>() / bins.len() as f32
}
