use rodio::OutputStreamBuilder;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Preview playback of a finished recording
///
/// Audio output runs on a blocking thread; stopping is signalled through a
/// shared flag that the thread polls while the sink drains.
#[derive(Default)]
pub struct Player {
    stop_flag: Option<Arc<AtomicBool>>,
}

impl Player {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_playing(&self) -> bool {
        self.stop_flag
            .as_ref()
            .is_some_and(|flag| !flag.load(Ordering::Acquire))
    }

    /// Start playing `path`; `ended_tx` receives `()` when playback finishes or is stopped
    pub fn play(&mut self, path: PathBuf, ended_tx: mpsc::UnboundedSender<()>) {
        self.stop();

        let stop_flag = Arc::new(AtomicBool::new(false));
        self.stop_flag = Some(stop_flag.clone());

        tokio::task::spawn_blocking(move || {
            if let Err(e) = play_blocking(&path, &stop_flag) {
                tracing::warn!("Failed to play {}: {}", path.display(), e);
            }
            stop_flag.store(true, Ordering::Release);
            let _ = ended_tx.send(());
        });
    }

    pub fn stop(&mut self) {
        if let Some(flag) = self.stop_flag.take() {
            flag.store(true, Ordering::Release);
        }
    }
}

fn play_blocking(path: &Path, stop_flag: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let stream_handle = OutputStreamBuilder::open_default_stream()?;
    let sink = rodio::play(stream_handle.mixer(), BufReader::new(file))?;

    while !sink.empty() {
        if stop_flag.load(Ordering::Acquire) {
            sink.stop();
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_without_play_is_noop() {
        let mut player = Player::new();
        assert!(!player.is_playing());
        player.stop();
        assert!(!player.is_playing());
    }

    #[tokio::test]
    async fn test_missing_file_reports_ended() {
        let mut player = Player::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        player.play(PathBuf::from("/nonexistent/voicedrop.mp3"), tx);
        assert!(rx.recv().await.is_some());
        assert!(!player.is_playing());
    }
}
