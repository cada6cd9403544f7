use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// Temporary on-disk copy of an artifact, addressable by URL for playback
///
/// Revoking deletes the file; every clone of the handle sees the revocation.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    file: Arc<Mutex<Option<NamedTempFile>>>,
    path: PathBuf,
}

impl PlaybackHandle {
    pub fn create(bytes: &[u8], suffix: &str) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("voicedrop-")
            .suffix(suffix)
            .tempfile()
            .context("Failed to create playback file")?;
        file.write_all(bytes)
            .context("Failed to write playback file")?;
        file.flush().context("Failed to flush playback file")?;

        let path = file.path().to_path_buf();
        Ok(Self {
            file: Arc::new(Mutex::new(Some(file))),
            path,
        })
    }

    pub fn url(&self) -> String {
        format!("file://{}", self.path.display())
    }

    /// Path of the playable file, `None` once revoked
    pub fn path(&self) -> Option<&Path> {
        self.is_live().then_some(self.path.as_path())
    }

    pub fn is_live(&self) -> bool {
        self.file.lock().map(|f| f.is_some()).unwrap_or(false)
    }

    pub fn revoke(&self) {
        let taken = match self.file.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(file) = taken {
            if let Err(e) = file.close() {
                tracing::warn!("Failed to remove playback file {:?}: {}", self.path, e);
            }
        }
    }
}

/// Finished artifact of one recording session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingData {
    pub filename: String,
    pub filesize_bytes: usize,
    pub duration_ms: u64,
    pub average_volume: f32,
    #[serde(skip)]
    pub audio_bytes: Arc<[u8]>,
    pub content_type: &'static str,
    pub playback_url: String,
    #[serde(skip)]
    pub playback: PlaybackHandle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

impl RecordingData {
    /// Write the audio and a JSON metadata sidecar into `dir`
    pub fn save_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {:?}", dir))?;

        let stem = match self.date {
            Some(date) => format!("{}-{}", date.format("%Y%m%dT%H%M%S"), self.filename),
            None => self.filename.clone(),
        };
        let audio_path = dir.join(&stem);
        std::fs::write(&audio_path, &self.audio_bytes)
            .with_context(|| format!("Failed to write recording: {:?}", audio_path))?;

        let meta = serde_json::to_string_pretty(self).context("Failed to serialize metadata")?;
        let meta_path = audio_path.with_extension("json");
        std::fs::write(&meta_path, meta)
            .with_context(|| format!("Failed to write metadata: {:?}", meta_path))?;

        tracing::info!("Saved recording to {:?}", audio_path);
        Ok(audio_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bytes: &[u8]) -> RecordingData {
        let playback = PlaybackHandle::create(bytes, ".mp3").unwrap();
        RecordingData {
            filename: "audio.mp3".into(),
            filesize_bytes: bytes.len(),
            duration_ms: 1234,
            average_volume: 12.5,
            audio_bytes: Arc::from(bytes),
            content_type: "audio/mp3",
            playback_url: playback.url(),
            playback,
            offer_id: Some("offer-1".into()),
            offer_source: None,
            date: None,
        }
    }

    #[test]
    fn test_revoke_removes_file_for_all_clones() {
        let handle = PlaybackHandle::create(b"abc", ".mp3").unwrap();
        let clone = handle.clone();
        let path = handle.path().unwrap().to_path_buf();
        assert!(path.exists());
        assert!(handle.url().starts_with("file://"));

        handle.revoke();
        assert!(!path.exists());
        assert!(!clone.is_live());
        assert!(clone.path().is_none());

        // Second revoke is harmless
        clone.revoke();
    }

    #[test]
    fn test_save_writes_audio_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(b"fake mp3 bytes");
        let path = data.save_to(dir.path()).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"fake mp3 bytes");
        let meta: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path.with_extension("json")).unwrap())
                .unwrap();
        assert_eq!(meta["filesizeBytes"], 14);
        assert_eq!(meta["durationMs"], 1234);
        assert_eq!(meta["offerId"], "offer-1");
        assert!(meta.get("offerSource").is_none());
        assert!(meta.get("audioBytes").is_none());
    }
}
