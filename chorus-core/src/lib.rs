//! # chorus-core
//!
//! Realtime audio fan-out and turn-synchronized orchestration of several
//! speech-analysis engines over one live mono PCM stream.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → capture pump ─┐
//! PCM byte chunks → Coordinator ──────────────────────────────┤
//!                                                             ▼
//!                                   TurnController → Broadcaster ─► WAV recording
//!                                                             │
//!                      ┌──────────────────────┬───────────────┴─────────┐
//!               ChunkedModelAdapter   RemoteStreamAdapter       FileModelAdapter
//!              (ChunkingBuffer → model) (push stream → service)  (finalised WAV)
//!                      └──────────────────────┴───────────┬─────────────┘
//!                                                  ResultsContainer
//!                                                         │
//!                                    TurnResults + broadcast::Sender<TurnStatusEvent>
//! ```
//!
//! Warm controllers are pooled per (teacher, student) identity in a
//! [`SessionPool`] and evicted after an idle period.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod adapter;
pub mod audio;
pub mod buffering;
pub mod error;
pub mod fanout;
pub mod inference;
pub mod ipc;
pub mod session;
pub mod turn;
pub mod vad;
pub mod worker;

// Convenience re-exports for downstream crates
pub use adapter::{
    Adapter, ChunkOutput, ChunkedModelAdapter, Completion, FileModelAdapter, RemoteStreamAdapter,
};
pub use audio::{CaptureConfig, CaptureSession};
pub use error::{ChorusError, Result};
pub use fanout::{Frame, OverflowPolicy};
pub use inference::{
    EngineOutput, FileModel, FileModelHandle, ModelCache, ModelHandle, PronunciationScore,
    RemoteRecognizer, SpeechModel,
};
pub use ipc::{EventBus, TurnStatusEvent};
pub use session::{ChunkAck, Coordinator, IdentityKey, PoolConfig, SessionPool};
pub use turn::{EngineStatus, TurnConfig, TurnController, TurnId, TurnResults};

#[cfg(feature = "remote-http")]
pub use inference::http::{HttpFileModel, HttpFileModelConfig};
