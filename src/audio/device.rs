use super::chunk::CapturedChunk;
use super::format::AudioFormat;
use crate::error::RecorderError;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Live microphone stream delivering encoded chunks at a fixed interval
///
/// Implementations may hold `!Send` platform handles, so the recorder runs
/// on a LocalSet.
#[async_trait(?Send)]
pub trait InputStream {
    /// Format of the samples carried by the chunks
    fn format(&self) -> AudioFormat;

    /// Begin delivering chunks on `chunk_tx`
    async fn start(&mut self, chunk_tx: mpsc::UnboundedSender<CapturedChunk>) -> Result<()>;

    /// Halt delivery
    ///
    /// Must not return until the final chunk has been sent and the sender
    /// dropped, so nothing can arrive after the stop boundary.
    async fn stop(&mut self) -> Result<()>;
}

/// Frequency-analysis tap on the same stream
pub trait FrequencyTap {
    fn bin_count(&self) -> usize;

    /// Fill `bins` with current magnitudes, 0-255 per bin
    fn byte_frequency_data(&mut self, bins: &mut [u8]);

    /// Forget audio and smoothing history from before this call
    fn reset(&mut self);
}

/// Handles acquired once per recorder lifetime
pub struct AcquiredDevice {
    pub stream: Box<dyn InputStream>,
    pub tap: Box<dyn FrequencyTap>,
}

/// Obtains the microphone stream and its analysis tap
pub trait DeviceProvider {
    fn acquire(&mut self, fft_size: usize) -> Result<AcquiredDevice, RecorderError>;
}
