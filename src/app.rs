use crate::audio::{CpalDevice, Encoder, WavChunkDecoder};
use crate::config::Config;
use crate::error::RecorderError;
use crate::messages::{RecorderEvent, RecorderState};
use crate::services::{Recorder, RecorderHandle};

use anyhow::Result;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

/// One line of console input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Toggle,
    Play,
    StopPlayback,
    Discard,
    Accept,
    /// Change the time limit; `None` removes it
    Limit(Option<u64>),
    Quit,
}

fn parse_action(line: &str) -> Option<Action> {
    let line = line.trim().to_ascii_lowercase();
    if let Some(rest) = line.strip_prefix('t') {
        let rest = rest.trim();
        if rest.is_empty() {
            return Some(Action::Limit(None));
        }
        return rest.parse().ok().map(|ms| Action::Limit(Some(ms)));
    }

    match line.as_str() {
        "" | "r" => Some(Action::Toggle),
        "p" => Some(Action::Play),
        "s" => Some(Action::StopPlayback),
        "d" => Some(Action::Discard),
        "y" => Some(Action::Accept),
        "q" => Some(Action::Quit),
        _ => None,
    }
}

pub struct App {
    config: Config,
    recorder: RecorderHandle,
}

impl App {
    pub fn new(config: Config) -> Self {
        let recorder = Self::setup_recorder(&config);
        tokio::task::spawn_local(report_progress(recorder.clone()));

        println!(
            "Enter/r: start or stop   p: play   s: stop playback   d: discard   y: keep   t <ms>: time limit   q: quit"
        );

        Self { config, recorder }
    }

    pub async fn run(self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        tracing::info!("Input closed, shutting down");
                        break;
                    };
                    match parse_action(&line) {
                        Some(Action::Quit) => break,
                        Some(action) => {
                            if let Err(e) = self.handle_action(action).await {
                                tracing::error!("Error handling {:?}: {}", action, e);
                            }
                        }
                        None => println!("Unknown command: {:?}", line.trim()),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_action(&self, action: Action) -> Result<()> {
        match action {
            Action::Toggle => self.toggle().await,
            Action::Play => self.recorder.play().await,
            Action::StopPlayback => self.recorder.stop_playback().await,
            Action::Discard => self.recorder.discard().await,
            Action::Accept => self.accept().await,
            Action::Limit(ms) => {
                self.recorder
                    .configure(ms.map(Duration::from_millis))
                    .await
            }
            Action::Quit => Ok(()),
        }
    }

    async fn toggle(&self) -> Result<()> {
        match self.recorder.state() {
            RecorderState::Inactive => self.recorder.start().await,
            RecorderState::Recording => self.recorder.stop().await,
            RecorderState::NoDevice => {
                let reason = self
                    .recorder
                    .last_error()
                    .filter(RecorderError::is_setup_failure)
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no input device".to_string());
                println!("Cannot record: {}", reason);
                Ok(())
            }
            state => {
                tracing::debug!("Toggle ignored while {}", state);
                Ok(())
            }
        }
    }

    async fn accept(&self) -> Result<()> {
        let Some(recording) = self.recorder.accept().await? else {
            println!("Nothing to keep yet");
            return Ok(());
        };

        let path = recording.save_to(&self.config.output_dir)?;
        println!(
            "Saved {} ({} bytes, {:.1}s)",
            path.display(),
            recording.filesize_bytes,
            recording.duration_ms as f64 / 1000.0
        );
        recording.playback.revoke();
        Ok(())
    }

    fn setup_recorder(config: &Config) -> RecorderHandle {
        let device = CpalDevice::new(config.chunk_interval());
        let decoder = WavChunkDecoder::new(config.stabilization_delay());
        let encoder = Encoder::new(Box::new(decoder), config.output_format);

        // Spawned locally because the capture stream is !Send
        let (recorder, handle) =
            Recorder::new(config.recorder_settings(), Box::new(device), encoder);
        tokio::task::spawn_local(recorder.run());

        handle
    }
}

/// Print state changes, events and a once-per-second meter line
async fn report_progress(recorder: RecorderHandle) {
    let mut events = recorder.subscribe();
    let mut meter = recorder.watch_meter();
    let mut last_second = None;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RecorderEvent::StateChanged(state)) => {
                    last_second = None;
                    println!("[{}]", state);
                }
                Ok(RecorderEvent::BufferChanged(Some(recording))) => println!(
                    "Ready: {} ({} bytes, {:.1}s, avg level {:.0}) at {}",
                    recording.filename,
                    recording.filesize_bytes,
                    recording.duration_ms as f64 / 1000.0,
                    recording.average_volume,
                    recording.playback_url
                ),
                Ok(RecorderEvent::BufferChanged(None)) => println!("Recording discarded"),
                Ok(RecorderEvent::ConversionFailed(reason)) => {
                    println!("Conversion failed: {}", reason)
                }
                Ok(RecorderEvent::Finished) => {}
                Ok(RecorderEvent::PlaybackEnded) => println!("Playback ended"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Progress reporter missed {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = meter.changed() => {
                if changed.is_err() {
                    break;
                }
                let reading = *meter.borrow_and_update();
                let second = reading.elapsed_ms / 1000;
                if recorder.state() == RecorderState::Recording && last_second != Some(second) {
                    last_second = Some(second);
                    let progress = reading
                        .progress
                        .map(|p| format!(" {:>3.0}%", p * 100.0))
                        .unwrap_or_default();
                    println!("  {:>3}s level {:>5.1}{}", second, reading.level, progress);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_action() {
        assert_eq!(parse_action(""), Some(Action::Toggle));
        assert_eq!(parse_action(" R \n"), Some(Action::Toggle));
        assert_eq!(parse_action("p"), Some(Action::Play));
        assert_eq!(parse_action("s"), Some(Action::StopPlayback));
        assert_eq!(parse_action("d"), Some(Action::Discard));
        assert_eq!(parse_action("y"), Some(Action::Accept));
        assert_eq!(parse_action("q"), Some(Action::Quit));
        assert_eq!(parse_action("t 30000"), Some(Action::Limit(Some(30_000))));
        assert_eq!(parse_action("t"), Some(Action::Limit(None)));
        assert_eq!(parse_action("t soon"), None);
        assert_eq!(parse_action("record"), None);
    }
}
