//! Engine model abstractions.
//!
//! Three kinds of black-box engines sit behind the adapters:
//!
//! - [`SpeechModel`]: consumes fixed-duration chunks as they are produced
//!   (e.g. a phoneme recognizer). Driven by a chunked streaming adapter.
//! - [`FileModel`]: consumes the finalised recording of a whole turn.
//!   Driven by a batch adapter.
//! - [`remote::RemoteRecognizer`]: an external service fed a live push
//!   stream that reports results asynchronously as events.
//!
//! `&mut self` on the inference calls expresses that decoders are stateful.
//! All mutation is serialised through `parking_lot::Mutex` handles.

pub mod cache;
#[cfg(feature = "remote-http")]
pub mod http;
pub mod remote;
pub mod stub;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::buffering::chunk::ModelInput;
use crate::error::Result;

pub use cache::ModelCache;
pub use remote::{
    RecognizerFactory, RemoteEvent, RemoteEventSink, RemoteRecognizer, StreamRequest, TaggedEvent,
};

/// Phonemes recognised in one chunk, positioned on the turn timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhonemeGroup {
    pub phonemes: String,
    pub start_secs: f64,
    pub end_secs: f64,
}

/// Assessment of one word in the reference sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordScore {
    pub word: String,
    pub accuracy: Option<f64>,
    /// Service-reported error class, e.g. `"None"`, `"Omission"`.
    pub error_type: Option<String>,
    pub offset_secs: Option<f64>,
    pub duration_secs: Option<f64>,
}

/// Pronunciation scores, each in 0–100.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PronunciationScore {
    pub transcript: String,
    pub pronunciation: Option<f64>,
    pub accuracy: Option<f64>,
    pub fluency: Option<f64>,
    pub completeness: Option<f64>,
    pub prosody: Option<f64>,
    #[serde(default)]
    pub words: Vec<WordScore>,
}

impl PronunciationScore {
    /// Clamp every sub-score into 0–100.
    pub fn clamped(mut self) -> Self {
        let clamp = |v: Option<f64>| v.map(|s| s.clamp(0.0, 100.0));
        self.pronunciation = clamp(self.pronunciation);
        self.accuracy = clamp(self.accuracy);
        self.fluency = clamp(self.fluency);
        self.completeness = clamp(self.completeness);
        self.prosody = clamp(self.prosody);
        for w in &mut self.words {
            w.accuracy = clamp(w.accuracy);
        }
        self
    }
}

/// What one engine contributes to a turn's results.
///
/// Serialises untagged: a transcript is a JSON string, phonemes a list and a
/// score an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EngineOutput {
    Transcript(String),
    Phonemes(Vec<PhonemeGroup>),
    Score(PronunciationScore),
}

impl EngineOutput {
    /// Fold a later result of the same turn into this one.
    ///
    /// Transcripts concatenate, phoneme groups and word scores append, and
    /// sub-scores take the latest values.
    pub fn merge(&mut self, next: EngineOutput) {
        match (self, next) {
            (EngineOutput::Transcript(text), EngineOutput::Transcript(more)) => {
                append_text(text, &more);
            }
            (EngineOutput::Phonemes(groups), EngineOutput::Phonemes(more)) => {
                groups.extend(more);
            }
            (EngineOutput::Score(score), EngineOutput::Score(more)) => {
                append_text(&mut score.transcript, &more.transcript);
                score.words.extend(more.words);
                score.pronunciation = more.pronunciation;
                score.accuracy = more.accuracy;
                score.fluency = more.fluency;
                score.completeness = more.completeness;
                score.prosody = more.prosody;
            }
            (slot, other) => *slot = other,
        }
    }
}

fn append_text(text: &mut String, more: &str) {
    let more = more.trim();
    if more.is_empty() {
        return;
    }
    if !text.is_empty() {
        text.push(' ');
    }
    text.push_str(more);
}

/// Per-turn context passed to engines that need more than audio.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnContext {
    pub reference_text: String,
    pub language: String,
}

/// Contract for chunk-at-a-time recognition backends.
pub trait SpeechModel: Send + 'static {
    /// One-time warm-up: load weights and run a dummy inference.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Sample rate the model expects its input at.
    fn sample_rate(&self) -> u32 {
        16_000
    }

    /// Recognise one chunk. An empty string means nothing was decoded.
    fn transcribe(&mut self, input: &ModelInput) -> Result<String>;

    /// Reset decoder state between turns.
    fn reset(&mut self);
}

/// Thread-safe reference-counted handle to any `SpeechModel` implementor.
///
/// Uses `parking_lot::Mutex` for non-poisoning on panic.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<Mutex<dyn SpeechModel>>);

impl ModelHandle {
    pub fn new<M: SpeechModel>(model: M) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").finish_non_exhaustive()
    }
}

/// Contract for whole-recording analysis backends.
pub trait FileModel: Send + 'static {
    /// Analyse a finalised mono 16-bit WAV file.
    fn analyze(&mut self, recording: &Path, context: &TurnContext) -> Result<EngineOutput>;
}

#[derive(Clone)]
pub struct FileModelHandle(pub Arc<Mutex<dyn FileModel>>);

impl FileModelHandle {
    pub fn new<M: FileModel>(model: M) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }
}

impl std::fmt::Debug for FileModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileModelHandle").finish_non_exhaustive()
    }
}
