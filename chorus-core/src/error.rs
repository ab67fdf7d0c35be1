use thiserror::Error;

use crate::turn::TurnId;

/// All errors produced by chorus-core.
///
/// Only producer-side failures and API misuse surface through this type.
/// Engine failures inside a turn are reported as [`crate::adapter::Completion`]
/// values and never abort the turn.
#[derive(Debug, Error)]
pub enum ChorusError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("recording sink error: {0}")]
    Recording(String),

    #[error("turn has ended; publish is rejected until the next reset")]
    TurnEnded,

    #[error("no turn is in flight")]
    NoActiveTurn,

    #[error("unknown turn id: {0}")]
    UnknownTurn(TurnId),

    #[error("frame sample rate {got} Hz does not match turn sample rate {expected} Hz")]
    SampleRateMismatch { expected: u32, got: u32 },

    #[error("invalid sample rate: {0} Hz")]
    InvalidSampleRate(u32),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("remote recognizer error: {0}")]
    Remote(String),

    #[error("session was evicted")]
    SessionEvicted,

    #[error("failed to spawn worker thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ChorusError>;
