pub mod analyzer;
pub mod capture;
pub mod chunk;
pub mod device;
pub mod encoder;
pub mod format;
pub mod mp3;
pub mod playback;
pub mod resample;
pub mod spectrum;

pub use analyzer::{FrameAnalyzer, MeterReading};
pub use capture::CpalDevice;
pub use chunk::{AudioDecoder, CapturedChunk, WavChunkDecoder};
pub use device::{AcquiredDevice, DeviceProvider, FrequencyTap, InputStream};
pub use encoder::{Encoder, OutputFormat};
pub use format::AudioFormat;
pub use playback::Player;
