//! Remote recognizer contract.
//!
//! A remote recognizer keeps one long-lived connection and opens a short
//! per-turn substream on it. Audio is pushed as i16 PCM; results come back
//! asynchronously through a [`RemoteEventSink`] that stamps every event with
//! the turn the substream was opened for. The adapter compares that stamp
//! with its current turn and discards anything stale.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::inference::EngineOutput;
use crate::turn::TurnId;

/// Parameters of one per-turn substream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub turn_id: TurnId,
    pub sample_rate: u32,
    pub reference_text: String,
    pub language: String,
}

/// Events a recognizer reports for a substream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RemoteEvent {
    /// Interim hypothesis; informational only.
    Recognizing { text: String },
    /// One recognized segment. A turn may produce several.
    Recognized { output: EngineOutput },
    /// The service has delivered everything for this substream.
    StreamFinished,
    /// The service gave up on this substream.
    Canceled { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub turn_id: TurnId,
    pub event: RemoteEvent,
}

/// Turn-bound event channel handed to a recognizer when a substream opens.
#[derive(Debug, Clone)]
pub struct RemoteEventSink {
    turn_id: TurnId,
    tx: Sender<TaggedEvent>,
}

impl RemoteEventSink {
    pub fn new(turn_id: TurnId, tx: Sender<TaggedEvent>) -> Self {
        Self { turn_id, tx }
    }

    pub fn turn_id(&self) -> &TurnId {
        &self.turn_id
    }

    /// Report an event. Returns `false` once the adapter has shut down.
    pub fn emit(&self, event: RemoteEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                turn_id: self.turn_id.clone(),
                event,
            })
            .is_ok()
    }
}

/// Contract for push-stream recognition services.
pub trait RemoteRecognizer: Send + 'static {
    /// Service name used in logs.
    fn name(&self) -> &str;

    /// Establish the long-lived connection. Called once per construction.
    fn connect(&mut self) -> Result<()>;

    /// Open the substream for a new turn. Any previous substream is closed
    /// first; events it still emits carry its own turn id.
    fn open_stream(&mut self, request: &StreamRequest, sink: RemoteEventSink) -> Result<()>;

    /// Push audio into the open substream.
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Signal end of audio. The service then reports its final results and
    /// `StreamFinished` asynchronously.
    fn close_stream(&mut self) -> Result<()>;

    /// Tear down the connection and any helper threads.
    fn shutdown(&mut self);
}

/// Builds a fresh recognizer when re-arming a warm one fails.
pub type RecognizerFactory = Box<dyn Fn() -> Result<Box<dyn RemoteRecognizer>> + Send + Sync>;
