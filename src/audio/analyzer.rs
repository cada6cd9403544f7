use super::device::FrequencyTap;
use super::spectrum;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Meter ring radius at silence
pub const BASE_RADIUS: f32 = 20.0;
/// Extra radius at full level
pub const SCALE_RADIUS: f32 = 20.0;

/// Presentation hints for one analysis tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MeterReading {
    pub elapsed_ms: u64,
    /// Mean bin magnitude, 0-255
    pub level: f32,
    /// Fraction of the time limit used; `None` without a limit
    pub progress: Option<f32>,
    pub radius: f32,
}

impl MeterReading {
    /// Indicators at rest, shown outside of recording
    pub fn resting() -> Self {
        Self::default()
    }
}

pub struct FrameReport {
    pub reading: MeterReading,
    pub deadline_exceeded: bool,
}

/// Per-tick level metering and time-limit detection
pub struct FrameAnalyzer {
    max_time: Option<Duration>,
    origin: Option<Instant>,
    levels: Vec<f32>,
    bins: Vec<u8>,
}

impl FrameAnalyzer {
    pub fn new(max_time: Option<Duration>) -> Self {
        Self {
            max_time,
            origin: None,
            levels: Vec::new(),
            bins: Vec::new(),
        }
    }

    pub fn set_max_time(&mut self, max_time: Option<Duration>) {
        self.max_time = max_time;
    }

    /// Reset the elapsed origin and level log for a new recording
    pub fn begin_session(&mut self) {
        self.origin = None;
        self.levels.clear();
    }

    pub fn clear_levels(&mut self) {
        self.levels.clear();
    }

    /// Zero the elapsed origin; returns the resting indicators
    pub fn rest(&mut self) -> MeterReading {
        self.origin = None;
        MeterReading::resting()
    }

    /// Elapsed time since the first tick of this recording
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.origin
            .map(|origin| now.saturating_duration_since(origin))
            .unwrap_or_default()
    }

    /// Mean of every level sample logged this recording
    pub fn average_level(&self) -> f32 {
        if self.levels.is_empty() {
            return 0.0;
        }
        self.levels.iter().sum::<f32>() / self.levels.len() as f32
    }

    pub fn samples(&self) -> usize {
        self.levels.len()
    }

    pub fn tick(&mut self, now: Instant, tap: &mut dyn FrequencyTap) -> FrameReport {
        // The first tick after start defines the origin, so it reports ~0
        let origin = *self.origin.get_or_insert(now);
        let elapsed = now.saturating_duration_since(origin);

        let bin_count = tap.bin_count();
        if self.bins.len() != bin_count {
            self.bins.resize(bin_count, 0);
        }
        tap.byte_frequency_data(&mut self.bins);
        let level = spectrum::average(&self.bins);
        self.levels.push(level);

        let limit = self.max_time.filter(|t| !t.is_zero());
        let progress = limit.map(|limit| {
            let limit_ms = limit.as_millis().max(1) as f32;
            (elapsed.as_millis() as f32 / limit_ms).clamp(0.0, 1.0)
        });

        FrameReport {
            reading: MeterReading {
                elapsed_ms: elapsed.as_millis() as u64,
                level,
                progress,
                radius: BASE_RADIUS + (level / 255.0) * SCALE_RADIUS,
            },
            deadline_exceeded: limit.is_some_and(|limit| elapsed > limit),
        }
    }
}
