use crate::audio::encoder::EncodedAudio;
use crate::audio::{
    AcquiredDevice, CapturedChunk, DeviceProvider, Encoder, FrameAnalyzer, MeterReading, Player,
    mp3,
};
use crate::error::RecorderError;
use crate::messages::{RecorderCommand, RecorderEvent, RecorderState};
use crate::recording::{PlaybackHandle, RecordingData};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Recorder settings derived from the configuration
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub max_time: Option<Duration>,
    pub fft_size: usize,
    pub tick_interval: Duration,
    pub filename: String,
    pub offer_id: Option<String>,
    pub offer_source: Option<String>,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            max_time: None,
            fft_size: 128,
            tick_interval: Duration::from_millis(16),
            filename: "audio.mp3".to_string(),
            offer_id: None,
            offer_source: None,
        }
    }
}

type EncodeResult = (u64, Result<EncodedAudio, RecorderError>);

/// What a stopped session contributes to its artifact besides the audio
struct PendingArtifact {
    session: u64,
    duration: Duration,
    average_volume: f32,
    started_at: Option<DateTime<Utc>>,
}

/// Coordinates capture, metering and encoding for one recorder instance
///
/// This service:
/// - Acquires the device stream and analysis tap once, on startup
/// - Buffers captured chunks while recording
/// - Runs the analysis tick (level meter and time limit) while recording
/// - Hands the frozen chunk buffer to the encoder on stop
/// - Holds the finished artifact until it is discarded or accepted
///
/// Note: the device stream may be !Send, so this service must be spawned
/// on a LocalSet using tokio::task::spawn_local.
pub struct Recorder {
    settings: RecorderSettings,
    provider: Box<dyn DeviceProvider>,
    device: Option<AcquiredDevice>,
    encoder: Rc<Encoder>,
    cmd_rx: mpsc::Receiver<RecorderCommand>,
    chunk_rx: Option<mpsc::UnboundedReceiver<CapturedChunk>>,
    chunks: Vec<CapturedChunk>,
    analyzer: FrameAnalyzer,
    ticker: Option<Interval>,
    session: u64,
    started_at: Option<DateTime<Utc>>,
    pending: Option<PendingArtifact>,
    encode_tx: mpsc::UnboundedSender<EncodeResult>,
    encode_rx: mpsc::UnboundedReceiver<EncodeResult>,
    artifact: Option<RecordingData>,
    player: Player,
    playback_tx: mpsc::UnboundedSender<()>,
    playback_rx: mpsc::UnboundedReceiver<()>,
    state_tx: watch::Sender<RecorderState>,
    meter_tx: watch::Sender<MeterReading>,
    error_tx: watch::Sender<Option<RecorderError>>,
    events_tx: broadcast::Sender<RecorderEvent>,
}

impl Recorder {
    pub fn new(
        settings: RecorderSettings,
        provider: Box<dyn DeviceProvider>,
        encoder: Encoder,
    ) -> (Self, RecorderHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(10);
        let (encode_tx, encode_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RecorderState::NoDevice);
        let (meter_tx, meter_rx) = watch::channel(MeterReading::resting());
        let (error_tx, error_rx) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(64);

        let handle = RecorderHandle {
            tx: cmd_tx,
            state_rx,
            meter_rx,
            error_rx,
            events_tx: events_tx.clone(),
        };

        let recorder = Self {
            analyzer: FrameAnalyzer::new(settings.max_time),
            settings,
            provider,
            device: None,
            encoder: Rc::new(encoder),
            cmd_rx,
            chunk_rx: None,
            chunks: Vec::new(),
            ticker: None,
            session: 0,
            started_at: None,
            pending: None,
            encode_tx,
            encode_rx,
            artifact: None,
            player: Player::new(),
            playback_tx,
            playback_rx,
            state_tx,
            meter_tx,
            error_tx,
            events_tx,
        };

        (recorder, handle)
    }

    pub async fn run(mut self) {
        self.acquire_device();

        loop {
            tokio::select! {
                // Handle commands from callers; exit once every handle is gone
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                // Accumulate chunks in delivery order (only exists while recording)
                chunk = next_chunk(&mut self.chunk_rx) => match chunk {
                    Some(chunk) if chunk.is_empty() => {}
                    Some(chunk) => self.chunks.push(chunk),
                    None => {
                        tracing::warn!("Capture stream closed while recording");
                        self.chunk_rx = None;
                    }
                },

                // Analysis tick (only exists while recording)
                now = next_tick(&mut self.ticker) => self.on_tick(now).await,

                Some((session, result)) = self.encode_rx.recv() => {
                    self.on_encoded(session, result);
                }

                Some(()) = self.playback_rx.recv() => {
                    let _ = self.events_tx.send(RecorderEvent::PlaybackEnded);
                }
            }
        }

        self.shutdown().await;
    }

    fn state(&self) -> RecorderState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: RecorderState) {
        if self.state() == state {
            return;
        }
        tracing::info!("Recorder state: {} -> {}", self.state(), state);
        self.state_tx.send_replace(state);
        let _ = self.events_tx.send(RecorderEvent::StateChanged(state));
    }

    /// Acquire the stream and tap; runs once per recorder lifetime, no retry on failure
    fn acquire_device(&mut self) {
        if self.device.is_some() {
            return;
        }

        match self.provider.acquire(self.settings.fft_size) {
            Ok(device) => {
                tracing::info!("Created audio recorder");
                self.device = Some(device);
                self.set_state(RecorderState::Inactive);
            }
            Err(err) => {
                tracing::error!("Audio device setup failed: {}", err);
                self.error_tx.send_replace(Some(err));
            }
        }
    }

    async fn handle_command(&mut self, cmd: RecorderCommand) {
        match cmd {
            RecorderCommand::Configure { max_time } => self.configure(max_time),
            RecorderCommand::Start => self.start_recording().await,
            RecorderCommand::Stop => self.stop_recording().await,
            RecorderCommand::Discard => self.discard(),
            RecorderCommand::Accept(reply) => {
                let artifact = self.accept();
                let _ = reply.send(artifact);
            }
            RecorderCommand::Play => self.play(),
            RecorderCommand::StopPlayback => {
                if self.player.is_playing() {
                    self.player.stop();
                }
            }
        }
    }

    fn configure(&mut self, max_time: Option<Duration>) {
        if max_time.is_some_and(|t| t.is_zero()) {
            tracing::debug!("Ignoring zero time limit");
            return;
        }
        tracing::info!("Time limit set to {:?}", max_time);
        self.settings.max_time = max_time;
        self.analyzer.set_max_time(max_time);
    }

    async fn start_recording(&mut self) {
        let state = self.state();
        if state != RecorderState::Inactive {
            tracing::debug!("Start ignored in state {}", state);
            return;
        }
        let Some(device) = self.device.as_mut() else {
            return;
        };

        self.chunks.clear();
        self.analyzer.begin_session();
        device.tap.reset();

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        if let Err(e) = device.stream.start(chunk_tx).await {
            tracing::error!("Failed to start capture: {}", e);
            self.error_tx
                .send_replace(Some(RecorderError::ContextInit(e.to_string())));
            return;
        }
        let format = device.stream.format();

        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.chunk_rx = Some(chunk_rx);
        self.ticker = Some(ticker);
        self.session += 1;
        self.started_at = Some(Utc::now());
        self.error_tx.send_replace(None);
        self.set_state(RecorderState::Recording);
        tracing::info!(
            "Recording started (session {}, {} Hz, {} channel(s))",
            self.session,
            format.sample_rate,
            format.channels
        );
    }

    async fn on_tick(&mut self, now: Instant) {
        if self.state() != RecorderState::Recording {
            self.ticker = None;
            return;
        }
        let Some(device) = self.device.as_mut() else {
            return;
        };

        let report = self.analyzer.tick(now, device.tap.as_mut());
        self.meter_tx.send_replace(report.reading);

        if report.deadline_exceeded {
            tracing::info!(
                "Time limit reached after {} ms, stopping",
                report.reading.elapsed_ms
            );
            self.stop_recording().await;
        }
    }

    /// Shared by manual stop and the time limit
    async fn stop_recording(&mut self) {
        let state = self.state();
        if state != RecorderState::Recording {
            tracing::debug!("Stop ignored in state {}", state);
            return;
        }

        let duration = self.analyzer.elapsed(Instant::now());
        self.ticker = None;

        if let Some(device) = self.device.as_mut() {
            if let Err(e) = device.stream.stop().await {
                tracing::warn!("Failed to stop capture cleanly: {}", e);
            }
        }

        // Close first so nothing past the stop boundary gets in, then drain
        if let Some(mut rx) = self.chunk_rx.take() {
            rx.close();
            while let Ok(chunk) = rx.try_recv() {
                self.chunks.push(chunk);
            }
        }

        let chunks = std::mem::take(&mut self.chunks);
        self.pending = Some(PendingArtifact {
            session: self.session,
            duration,
            average_volume: self.analyzer.average_level(),
            started_at: self.started_at.take(),
        });
        self.meter_tx.send_replace(self.analyzer.rest());
        self.set_state(RecorderState::Converting);

        tracing::info!(
            "Recording stopped after {} ms, {} chunks captured, {} level samples",
            duration.as_millis(),
            chunks.len(),
            self.analyzer.samples()
        );

        let encoder = self.encoder.clone();
        let tx = self.encode_tx.clone();
        let session = self.session;
        tokio::task::spawn_local(async move {
            let result = encoder.encode(&chunks).await;
            let _ = tx.send((session, result));
        });
    }

    fn on_encoded(&mut self, session: u64, result: Result<EncodedAudio, RecorderError>) {
        let Some(pending) = self.pending.take_if(|p| p.session == session) else {
            tracing::debug!("Dropping stale encode result for session {}", session);
            return;
        };

        let outcome = result.and_then(|encoded| self.build_artifact(encoded, pending));
        self.analyzer.clear_levels();

        match outcome {
            Ok(artifact) => {
                tracing::info!(
                    "Recording ready: {} ({} bytes, {} ms)",
                    artifact.filename,
                    artifact.filesize_bytes,
                    artifact.duration_ms
                );
                self.artifact = Some(artifact.clone());
                let _ = self
                    .events_tx
                    .send(RecorderEvent::BufferChanged(Some(artifact)));
                self.set_state(RecorderState::Done);
            }
            Err(RecorderError::Usage(reason)) => {
                tracing::debug!("Nothing to encode: {}", reason);
                self.set_state(RecorderState::Inactive);
            }
            Err(err) => {
                tracing::error!("Failed to convert recording: {}", err);
                self.error_tx.send_replace(Some(err.clone()));
                let _ = self
                    .events_tx
                    .send(RecorderEvent::ConversionFailed(err.to_string()));
                self.set_state(RecorderState::Inactive);
            }
        }
    }

    fn build_artifact(
        &self,
        encoded: EncodedAudio,
        pending: PendingArtifact,
    ) -> Result<RecordingData, RecorderError> {
        if let Some(info) = mp3::probe(&encoded.bytes) {
            tracing::debug!(
                "Encoded {} MP3 frames ({} ms, {} ms playable)",
                info.frames,
                info.duration_ms(),
                info.playable_duration_ms()
            );
        }

        let suffix = Path::new(&self.settings.filename)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let playback = PlaybackHandle::create(&encoded.bytes, &suffix)
            .map_err(|e| RecorderError::ConversionFailed(format!("{:#}", e)))?;

        Ok(RecordingData {
            filename: self.settings.filename.clone(),
            filesize_bytes: encoded.size(),
            duration_ms: pending.duration.as_millis() as u64,
            average_volume: pending.average_volume,
            audio_bytes: Arc::from(encoded.bytes),
            content_type: encoded.content_type,
            playback_url: playback.url(),
            playback,
            offer_id: self.settings.offer_id.clone(),
            offer_source: self.settings.offer_source.clone(),
            date: pending.started_at,
        })
    }

    fn discard(&mut self) {
        let state = self.state();
        if state != RecorderState::Done {
            tracing::debug!("Discard ignored in state {}", state);
            return;
        }

        self.player.stop();
        if let Some(artifact) = self.artifact.take() {
            artifact.playback.revoke();
        }
        self.chunks.clear();
        self.analyzer.clear_levels();
        self.meter_tx.send_replace(MeterReading::resting());

        self.set_state(RecorderState::Inactive);
        let _ = self.events_tx.send(RecorderEvent::BufferChanged(None));
        tracing::info!("Recording discarded");
    }

    fn accept(&mut self) -> Option<RecordingData> {
        let state = self.state();
        if state != RecorderState::Done {
            tracing::debug!("Accept ignored in state {}", state);
            return None;
        }

        self.player.stop();
        let artifact = self.artifact.take();
        self.set_state(RecorderState::Inactive);
        let _ = self.events_tx.send(RecorderEvent::Finished);
        tracing::info!("Recording handed to caller");
        artifact
    }

    fn play(&mut self) {
        let path = self
            .artifact
            .as_ref()
            .and_then(|artifact| artifact.playback.path())
            .map(Path::to_path_buf);

        match path {
            Some(path) => self.player.play(path, self.playback_tx.clone()),
            None => tracing::debug!("Nothing to play in state {}", self.state()),
        }
    }

    async fn shutdown(&mut self) {
        if self.state() == RecorderState::Recording {
            if let Some(device) = self.device.as_mut() {
                let _ = device.stream.stop().await;
            }
        }
        self.player.stop();
        if let Some(artifact) = self.artifact.take() {
            artifact.playback.revoke();
        }
        self.device = None;
        tracing::info!("Recorder shut down");
    }
}

async fn next_chunk(rx: &mut Option<mpsc::UnboundedReceiver<CapturedChunk>>) -> Option<CapturedChunk> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => std::future::pending().await,
    }
}

/// Handle for communicating with the Recorder
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<RecorderCommand>,
    state_rx: watch::Receiver<RecorderState>,
    meter_rx: watch::Receiver<MeterReading>,
    error_rx: watch::Receiver<Option<RecorderError>>,
    events_tx: broadcast::Sender<RecorderEvent>,
}

impl RecorderHandle {
    async fn send(&self, cmd: RecorderCommand, name: &str) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send {} command: {}", name, e))
    }

    pub async fn configure(&self, max_time: Option<Duration>) -> Result<()> {
        self.send(RecorderCommand::Configure { max_time }, "configure")
            .await
    }

    pub async fn start(&self) -> Result<()> {
        self.send(RecorderCommand::Start, "start").await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(RecorderCommand::Stop, "stop").await
    }

    pub async fn discard(&self) -> Result<()> {
        self.send(RecorderCommand::Discard, "discard").await
    }

    pub async fn play(&self) -> Result<()> {
        self.send(RecorderCommand::Play, "play").await
    }

    pub async fn stop_playback(&self) -> Result<()> {
        self.send(RecorderCommand::StopPlayback, "stop playback")
            .await
    }

    /// Take ownership of the finished artifact; `None` unless the recorder is done
    pub async fn accept(&self) -> Result<Option<RecordingData>> {
        let (reply, rx) = oneshot::channel();
        self.send(RecorderCommand::Accept(reply), "accept").await?;

        rx.await
            .map_err(|e| anyhow::anyhow!("Failed to receive accept response: {}", e))
    }

    pub fn state(&self) -> RecorderState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RecorderState> {
        self.state_rx.clone()
    }

    pub fn watch_meter(&self) -> watch::Receiver<MeterReading> {
        self.meter_rx.clone()
    }

    /// Message to display, if setup or the last conversion failed
    pub fn last_error(&self) -> Option<RecorderError> {
        self.error_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chunk::{AudioDecoder, DecodeError, WavChunkDecoder, concat};
    use crate::audio::device::testing::FakeMic;
    use crate::audio::format::PcmBuffer;
    use crate::audio::OutputFormat;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::task::LocalSet;

    /// Passes through to the real decoder, keeping a copy of every input
    struct RecordingDecoder {
        inner: WavChunkDecoder,
        seen: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl AudioDecoder for RecordingDecoder {
        async fn wait_ready(&self) {
            self.inner.wait_ready().await;
        }

        async fn decode(&self, raw: Vec<u8>) -> Result<PcmBuffer, DecodeError> {
            self.seen.lock().unwrap().push(raw.clone());
            self.inner.decode(raw).await
        }
    }

    struct Harness {
        handle: RecorderHandle,
        events: broadcast::Receiver<RecorderEvent>,
        decoded: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    fn spawn(provider: Box<dyn DeviceProvider>, output: OutputFormat) -> Harness {
        let decoded = Arc::new(Mutex::new(Vec::new()));
        let decoder = RecordingDecoder {
            inner: WavChunkDecoder::new(Duration::ZERO),
            seen: decoded.clone(),
        };
        let settings = RecorderSettings {
            filename: match output {
                OutputFormat::Mp3 => "audio.mp3".into(),
                OutputFormat::Wav => "audio.wav".into(),
            },
            ..Default::default()
        };
        let (recorder, handle) =
            Recorder::new(settings, provider, Encoder::new(Box::new(decoder), output));
        let events = handle.subscribe();
        tokio::task::spawn_local(recorder.run());
        Harness {
            handle,
            events,
            decoded,
        }
    }

    async fn wait_for(handle: &RecorderHandle, state: RecorderState) {
        let mut rx = handle.watch_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    fn drain(events: &mut broadcast::Receiver<RecorderEvent>) -> Vec<RecorderEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_reach_encoder_in_order() {
        LocalSet::new()
            .run_until(async {
                let mic = FakeMic::default();
                let h = spawn(Box::new(mic.provider()), OutputFormat::Wav);
                wait_for(&h.handle, RecorderState::Inactive).await;

                h.handle.start().await.unwrap();
                wait_for(&h.handle, RecorderState::Recording).await;
                for ms in [100, 250, 50] {
                    assert!(mic.deliver_ms(ms));
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                // Queued but not yet consumed when stop arrives
                assert!(mic.deliver_ms(100));
                h.handle.stop().await.unwrap();

                wait_for(&h.handle, RecorderState::Done).await;
                assert!(!mic.is_streaming());
                assert!(!mic.deliver_ms(100));

                let decoded = h.decoded.lock().unwrap().clone();
                assert_eq!(decoded.len(), 1);
                assert_eq!(decoded[0], concat(&mic.sent()));
                // Header plus four data chunks
                assert_eq!(mic.sent().len(), 5);

                let artifact = h.handle.accept().await.unwrap().unwrap();
                assert_eq!(artifact.content_type, "audio/wav");
                assert_eq!(artifact.filesize_bytes, 44 + 44_100 * 500 / 1000 * 2);
                assert!(artifact.playback_url.starts_with("file://"));
                assert!(artifact.date.is_some());
                assert_eq!(h.handle.state(), RecorderState::Inactive);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_limit_stops_exactly_once() {
        LocalSet::new()
            .run_until(async {
                let mic = FakeMic::default();
                let mut h = spawn(Box::new(mic.provider()), OutputFormat::Mp3);
                wait_for(&h.handle, RecorderState::Inactive).await;
                h.handle
                    .configure(Some(Duration::from_millis(2000)))
                    .await
                    .unwrap();

                h.handle.start().await.unwrap();
                wait_for(&h.handle, RecorderState::Recording).await;
                let mut delivered = 0;
                for _ in 0..25 {
                    if mic.deliver_ms(100) {
                        delivered += 1;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                assert!(delivered >= 20 && delivered < 25);

                wait_for(&h.handle, RecorderState::Done).await;
                let converting = drain(&mut h.events)
                    .iter()
                    .filter(|e| {
                        matches!(e, RecorderEvent::StateChanged(RecorderState::Converting))
                    })
                    .count();
                assert_eq!(converting, 1);

                let artifact = h.handle.accept().await.unwrap().unwrap();
                assert!(
                    (2000..=2500).contains(&artifact.duration_ms),
                    "got {}ms",
                    artifact.duration_ms
                );
                assert_eq!(artifact.content_type, "audio/mp3");
                assert!(mp3::probe(&artifact.audio_bytes).is_some());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_outside_their_state_are_ignored() {
        LocalSet::new()
            .run_until(async {
                let mic = FakeMic::default();
                let mut h = spawn(Box::new(mic.provider()), OutputFormat::Wav);
                wait_for(&h.handle, RecorderState::Inactive).await;
                drain(&mut h.events);

                h.handle.stop().await.unwrap();
                h.handle.discard().await.unwrap();
                h.handle.play().await.unwrap();
                assert!(h.handle.accept().await.unwrap().is_none());

                assert_eq!(h.handle.state(), RecorderState::Inactive);
                assert!(drain(&mut h.events).is_empty());
                assert!(h.decoded.lock().unwrap().is_empty());
                assert_eq!(mic.starts(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_resets_for_next_recording() {
        LocalSet::new()
            .run_until(async {
                let mic = FakeMic::default();
                let mut h = spawn(Box::new(mic.provider()), OutputFormat::Wav);
                wait_for(&h.handle, RecorderState::Inactive).await;

                mic.set_level(200);
                h.handle.start().await.unwrap();
                wait_for(&h.handle, RecorderState::Recording).await;
                mic.deliver_ms(300);
                tokio::time::sleep(Duration::from_millis(300)).await;
                assert!(h.handle.watch_meter().borrow().elapsed_ms >= 288);
                h.handle.stop().await.unwrap();
                wait_for(&h.handle, RecorderState::Done).await;

                let events = drain(&mut h.events);
                let artifact = events
                    .iter()
                    .find_map(|e| match e {
                        RecorderEvent::BufferChanged(Some(data)) => Some(data.clone()),
                        _ => None,
                    })
                    .unwrap();
                assert_eq!(artifact.average_volume, 200.0);
                let path = artifact.playback.path().unwrap().to_path_buf();
                assert!(path.exists());

                h.handle.discard().await.unwrap();
                wait_for(&h.handle, RecorderState::Inactive).await;
                assert!(!path.exists());
                assert_eq!(*h.handle.watch_meter().borrow(), MeterReading::resting());
                assert!(
                    drain(&mut h.events)
                        .iter()
                        .any(|e| matches!(e, RecorderEvent::BufferChanged(None)))
                );

                mic.set_level(0);
                h.handle.start().await.unwrap();
                wait_for(&h.handle, RecorderState::Recording).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                let reading = *h.handle.watch_meter().borrow();
                assert!(reading.elapsed_ms < 100, "got {}ms", reading.elapsed_ms);
                assert_eq!(reading.level, 0.0);
                assert_eq!(mic.starts(), 2);
                // Each start drops the tap's idle backlog
                assert_eq!(mic.tap_resets(), 2);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_failure_stays_in_no_device() {
        LocalSet::new()
            .run_until(async {
                let mic = FakeMic::default();
                let h = spawn(
                    Box::new(mic.failing_provider(RecorderError::DeviceUnavailable(
                        "permission denied".into(),
                    ))),
                    OutputFormat::Wav,
                );

                h.handle.start().await.unwrap();
                h.handle.start().await.unwrap();
                assert!(h.handle.accept().await.unwrap().is_none());

                assert_eq!(h.handle.state(), RecorderState::NoDevice);
                assert_eq!(
                    h.handle.last_error(),
                    Some(RecorderError::DeviceUnavailable("permission denied".into()))
                );
                assert_eq!(mic.acquisitions(), 1);
                assert_eq!(mic.starts(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversion_failure_returns_to_inactive() {
        LocalSet::new()
            .run_until(async {
                let mic = FakeMic::default();
                let mut h = spawn(Box::new(mic.provider()), OutputFormat::Wav);
                wait_for(&h.handle, RecorderState::Inactive).await;

                h.handle.start().await.unwrap();
                wait_for(&h.handle, RecorderState::Recording).await;
                // Odd byte count cannot hold whole 16-bit samples
                assert!(mic.deliver_raw(&[1, 2, 3]));
                h.handle.stop().await.unwrap();

                let failed = loop {
                    match h.events.recv().await.unwrap() {
                        RecorderEvent::ConversionFailed(msg) => break msg,
                        RecorderEvent::BufferChanged(Some(_)) => panic!("unexpected artifact"),
                        _ => {}
                    }
                };
                assert!(!failed.is_empty());

                wait_for(&h.handle, RecorderState::Inactive).await;
                assert!(matches!(
                    h.handle.last_error(),
                    Some(RecorderError::ConversionFailed(_))
                ));

                // A fresh start clears the error
                h.handle.start().await.unwrap();
                wait_for(&h.handle, RecorderState::Recording).await;
                assert_eq!(h.handle.last_error(), None);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_stop_yields_empty_artifact() {
        LocalSet::new()
            .run_until(async {
                let mic = FakeMic::default();
                let h = spawn(Box::new(mic.provider()), OutputFormat::Wav);
                wait_for(&h.handle, RecorderState::Inactive).await;

                h.handle.start().await.unwrap();
                h.handle.stop().await.unwrap();
                wait_for(&h.handle, RecorderState::Done).await;

                let artifact = h.handle.accept().await.unwrap().unwrap();
                assert_eq!(artifact.duration_ms, 0);
                assert_eq!(artifact.filesize_bytes, 44);
                assert_eq!(artifact.filename, "audio.wav");
            })
            .await;
    }
}
