use crate::audio::OutputFormat;
use crate::services::recorder::RecorderSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Recording time limit; unset means unlimited
    #[serde(default)]
    pub max_time_ms: Option<u64>,

    #[serde(default = "default_fft_size")]
    pub fft_size: usize,

    #[serde(default = "default_chunk_interval")]
    pub chunk_interval_ms: u64,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_stabilization_delay")]
    pub stabilization_delay_ms: u64,

    #[serde(default)]
    pub output_format: OutputFormat,

    /// Artifact name; defaults to `audio.<ext>` for the output format
    #[serde(default)]
    pub filename: Option<String>,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub offer_id: Option<String>,

    #[serde(default)]
    pub offer_source: Option<String>,
}

fn default_fft_size() -> usize {
    128
}

fn default_chunk_interval() -> u64 {
    250
}

fn default_tick_interval() -> u64 {
    16
}

fn default_stabilization_delay() -> u64 {
    100
}

fn default_output_dir() -> PathBuf {
    let data_dir = match std::env::var("XDG_DATA_HOME") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".local").join("share"))
            .unwrap_or_else(|_| std::env::temp_dir()),
    };
    data_dir.join("voicedrop")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_time_ms: None,
            fft_size: default_fft_size(),
            chunk_interval_ms: default_chunk_interval(),
            tick_interval_ms: default_tick_interval(),
            stabilization_delay_ms: default_stabilization_delay(),
            output_format: OutputFormat::default(),
            filename: None,
            output_dir: default_output_dir(),
            offer_id: None,
            offer_source: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.config/voicedrop/config.json)
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            tracing::info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the path to the configuration file
    fn config_path() -> Result<PathBuf> {
        let config_dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(dir)
        } else {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("voicedrop").join("config.json"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_time_ms == Some(0) {
            return Err(anyhow::anyhow!("max_time_ms must be greater than 0 when set"));
        }

        if !self.fft_size.is_power_of_two() || !(32..=2048).contains(&self.fft_size) {
            return Err(anyhow::anyhow!(
                "fft_size must be a power of two between 32 and 2048"
            ));
        }

        if self.chunk_interval_ms == 0 {
            return Err(anyhow::anyhow!("chunk_interval_ms must be greater than 0"));
        }

        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("tick_interval_ms must be greater than 0"));
        }

        if let Some(filename) = &self.filename {
            if filename.trim().is_empty() {
                return Err(anyhow::anyhow!("filename cannot be empty"));
            }

            let extension = Path::new(filename)
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_ascii_lowercase);
            let expected = self.output_format.extension();
            if extension.as_deref() != Some(expected) {
                return Err(anyhow::anyhow!(
                    "filename {:?} must end in .{} to match output_format",
                    filename,
                    expected
                ));
            }
        }

        Ok(())
    }

    pub fn filename(&self) -> String {
        self.filename
            .clone()
            .unwrap_or_else(|| format!("audio.{}", self.output_format.extension()))
    }

    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }

    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            max_time: self.max_time_ms.map(Duration::from_millis),
            fft_size: self.fft_size,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            filename: self.filename(),
            offer_id: self.offer_id.clone(),
            offer_source: self.offer_source.clone(),
        }
    }
}
