use super::chunk::{CapturedChunk, ChunkWriter};
use super::device::{AcquiredDevice, DeviceProvider, FrequencyTap, InputStream};
use super::format::AudioFormat;
use super::spectrum::SpectrumAnalyzer;
use crate::error::RecorderError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use ringbuf::{HeapCons, HeapProd, HeapRb, traits::*};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default input device via cpal
pub struct CpalDevice {
    chunk_interval: Duration,
}

impl CpalDevice {
    pub fn new(chunk_interval: Duration) -> Self {
        Self { chunk_interval }
    }
}

impl DeviceProvider for CpalDevice {
    fn acquire(&mut self, fft_size: usize) -> Result<AcquiredDevice, RecorderError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            RecorderError::DeviceUnavailable("No input audio device available".into())
        })?;

        let supported = device
            .default_input_config()
            .map_err(|e| RecorderError::DeviceUnavailable(e.to_string()))?;

        let format = AudioFormat {
            sample_rate: supported.sample_rate().0,
            channels: supported.channels(),
        };
        let config: StreamConfig = supported.config();

        // The capture ring holds a minute of audio between chunk deliveries
        let (capture_tx, capture_rx) =
            HeapRb::<f32>::new(format.samples_for_duration(60.0)).split();
        let (tap_tx, tap_rx) = HeapRb::<f32>::new(format.samples_for_duration(1.0)).split();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, capture_tx, tap_tx),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, capture_tx, tap_tx),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, capture_tx, tap_tx),
            other => {
                return Err(RecorderError::ContextInit(format!(
                    "Unsupported sample format: {:?}",
                    other
                )));
            }
        }
        .map_err(|e| RecorderError::ContextInit(e.to_string()))?;

        stream
            .play()
            .map_err(|e| RecorderError::ContextInit(e.to_string()))?;

        tracing::info!(
            "Audio input ready: {} Hz, {} channel(s)",
            format.sample_rate,
            format.channels
        );

        Ok(AcquiredDevice {
            stream: Box::new(CpalStream {
                _stream: stream,
                format,
                chunk_interval: self.chunk_interval,
                consumer: Some(capture_rx),
                active: None,
            }),
            tap: Box::new(CpalTap::new(tap_rx, format.channels, fft_size)),
        })
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut capture: HeapProd<f32>,
    mut tap: HeapProd<f32>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _info: &cpal::InputCallbackInfo| {
            for &sample in data {
                let sample: f32 = cpal::Sample::from_sample(sample);
                // Full rings drop samples rather than block the audio thread
                let _ = capture.try_push(sample);
                let _ = tap.try_push(sample);
            }
        },
        move |err| {
            tracing::error!("Audio stream error: {}", err);
        },
        None,
    )
}

struct ActiveCapture {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<HeapCons<f32>>,
}

/// Chunk delivery on top of a running cpal stream
///
/// The device stream runs for the recorder's whole lifetime; recording only
/// toggles the bridge task that turns ring contents into chunks.
pub struct CpalStream {
    _stream: cpal::Stream,
    format: AudioFormat,
    chunk_interval: Duration,
    consumer: Option<HeapCons<f32>>,
    active: Option<ActiveCapture>,
}

#[async_trait(?Send)]
impl InputStream for CpalStream {
    fn format(&self) -> AudioFormat {
        self.format
    }

    async fn start(&mut self, chunk_tx: mpsc::UnboundedSender<CapturedChunk>) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }

        let mut consumer = self
            .consumer
            .take()
            .context("Capture buffer is not available")?;

        // Drop whatever accumulated while idle
        drop_stale(&mut consumer);

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::task::spawn_local(bridge_task(
            consumer,
            ChunkWriter::new(self.format),
            chunk_tx,
            self.chunk_interval,
            stop_rx,
        ));

        self.active = Some(ActiveCapture { stop_tx, task });
        tracing::info!("Audio capture started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        let _ = active.stop_tx.send(());
        let consumer = active.task.await.context("Capture bridge task failed")?;
        self.consumer = Some(consumer);

        tracing::info!("Audio capture stopped");
        Ok(())
    }
}

/// Discard everything buffered in `consumer`; returns the number of samples dropped
fn drop_stale(consumer: &mut HeapCons<f32>) -> usize {
    let stale = consumer.occupied_len();
    consumer.skip(stale)
}

/// Drains the capture ring into chunks every `interval` until stopped
///
/// Hands the consumer back so the next recording can reuse it.
async fn bridge_task(
    mut consumer: HeapCons<f32>,
    mut writer: ChunkWriter,
    tx: mpsc::UnboundedSender<CapturedChunk>,
    interval: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) -> HeapCons<f32> {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !emit(&mut consumer, &mut writer, &tx) {
                    break;
                }
            }
            _ = &mut stop_rx => {
                // Final chunk with everything captured up to the stop
                emit(&mut consumer, &mut writer, &tx);
                break;
            }
        }
    }

    consumer
}

/// Returns false once the receiving side has gone away
fn emit(
    consumer: &mut HeapCons<f32>,
    writer: &mut ChunkWriter,
    tx: &mpsc::UnboundedSender<CapturedChunk>,
) -> bool {
    // Whole sample frames only, so chunks never split a frame across channels
    let channels = writer.format().channels.max(1) as usize;
    let available = consumer.occupied_len();
    let mut samples = vec![0.0f32; available - available % channels];
    let n = consumer.pop_slice(&mut samples);
    samples.truncate(n);

    match writer.encode(&samples) {
        Some(chunk) => tx.send(chunk).is_ok(),
        None => !tx.is_closed(),
    }
}

/// Analysis tap fed from the device callback
pub struct CpalTap {
    consumer: HeapCons<f32>,
    channels: usize,
    window: VecDeque<f32>,
    analyzer: SpectrumAnalyzer,
    scratch: Vec<f32>,
}

impl CpalTap {
    fn new(consumer: HeapCons<f32>, channels: u16, fft_size: usize) -> Self {
        Self {
            consumer,
            channels: channels.max(1) as usize,
            window: VecDeque::with_capacity(fft_size),
            analyzer: SpectrumAnalyzer::new(fft_size),
            scratch: Vec::new(),
        }
    }

    fn drain(&mut self) {
        let fft_size = self.analyzer.fft_size();
        let available = self.consumer.occupied_len();
        // Keep whole frames so channels stay aligned
        let take = available - available % self.channels;
        self.scratch.resize(take, 0.0);
        let n = self.consumer.pop_slice(&mut self.scratch);

        for frame in self.scratch[..n].chunks_exact(self.channels) {
            let mono = frame.iter().sum::<f32>() / self.channels as f32;
            if self.window.len() == fft_size {
                self.window.pop_front();
            }
            self.window.push_back(mono);
        }
    }
}

impl FrequencyTap for CpalTap {
    fn bin_count(&self) -> usize {
        self.analyzer.bin_count()
    }

    fn byte_frequency_data(&mut self, bins: &mut [u8]) {
        self.drain();
        let frame = self.window.make_contiguous();
        self.analyzer.byte_frequency_data(frame, bins);
    }

    fn reset(&mut self) {
        // The ring fills up while idle; drop that backlog so fresh samples fit
        let stale = drop_stale(&mut self.consumer);
        tracing::debug!("Analysis tap dropped {} stale samples", stale);
        self.window.clear();
        self.analyzer.reset();
    }
}
