use crate::recording::RecordingData;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

/// Commands for the Recorder service
pub enum RecorderCommand {
    Configure { max_time: Option<Duration> },
    Start,
    Stop,
    /// Drop the finished artifact and return to `Inactive`
    Discard,
    /// Hand the finished artifact to the caller
    Accept(oneshot::Sender<Option<RecordingData>>),
    Play,
    StopPlayback,
}

/// Recorder state (observable via watch channel)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecorderState {
    NoDevice,
    Inactive,
    Recording,
    Converting,
    Done,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecorderState::NoDevice => "no-device",
            RecorderState::Inactive => "inactive",
            RecorderState::Recording => "recording",
            RecorderState::Converting => "converting",
            RecorderState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Notifications broadcast to every subscriber
#[derive(Clone, Debug)]
pub enum RecorderEvent {
    StateChanged(RecorderState),
    /// A new artifact is available, or the previous one was cleared
    BufferChanged(Option<RecordingData>),
    ConversionFailed(String),
    /// The caller accepted the artifact
    Finished,
    PlaybackEnded,
}
