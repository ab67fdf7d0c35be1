//! Turns: identity, configuration and the per-turn results container.
//!
//! A [`ResultsContainer`] is created once per turn with a fixed set of engine
//! keys. Each adapter receives an exclusive [`SlotWriter`] for its own key and
//! never touches another engine's slot, so the key map itself is immutable
//! and unlocked. Once the controller seals the container, every later write
//! is rejected, logged and counted.

pub mod controller;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapter::Completion;
use crate::fanout::OverflowPolicy;
use crate::inference::EngineOutput;

pub use controller::TurnController;

// ---------------------------------------------------------------------------
// Turn identity
// ---------------------------------------------------------------------------

static TURN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unique identifier of one recorded utterance.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(Arc<str>);

impl TurnId {
    /// Process-unique id: a sequence number plus a random suffix so ids from
    /// different processes do not collide in logs or recordings.
    pub fn generate() -> Self {
        let seq = TURN_SEQ.fetch_add(1, Ordering::Relaxed);
        let salt: u32 = rand::random();
        Self(format!("turn-{seq:06}-{salt:08x}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TurnId({})", self.0)
    }
}

impl From<&str> for TurnId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for TurnId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-controller turn settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TurnConfig {
    /// Inference chunk length for streaming engines. Default: 1000 ms.
    pub chunk_duration_ms: u64,
    /// Capacity of each consumer queue, in frames. Default: 512.
    pub queue_depth: usize,
    pub overflow: OverflowPolicy,
    /// How long to wait for streaming adapters to acknowledge the end marker.
    pub drain_timeout_ms: u64,
    /// Per-adapter completion budget after the recording is closed.
    pub completion_timeout_ms: u64,
    /// Run batch engines on the recording concurrently instead of one after
    /// another. Default: off.
    pub parallel_batches: bool,
    /// Extra wait for a remote final signal once a result has arrived.
    pub remote_settle_ms: u64,
    /// Worker input-queue liveness poll.
    pub liveness_poll_ms: u64,
    /// Directory receiving one WAV per turn.
    pub recordings_dir: PathBuf,
    /// BCP-47 language passed to engines.
    pub language: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            chunk_duration_ms: 1_000,
            queue_depth: 512,
            overflow: OverflowPolicy::default(),
            drain_timeout_ms: 5_000,
            completion_timeout_ms: 15_000,
            parallel_batches: false,
            remote_settle_ms: 300,
            liveness_poll_ms: 250,
            recordings_dir: PathBuf::from("recordings"),
            language: "nl-NL".to_string(),
        }
    }
}

impl TurnConfig {
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_duration_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn remote_settle(&self) -> Duration {
        Duration::from_millis(self.remote_settle_ms)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Final state of one engine within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Never reported a completion.
    Pending,
    Ok,
    Partial,
    Failed,
}

/// Per-engine record inside a sealed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineReport {
    pub status: EngineStatus,
    pub detail: Option<String>,
    /// Milliseconds from turn creation until the adapter started.
    pub started_ms: Option<u64>,
    /// Milliseconds from turn creation until the adapter completed.
    pub finished_ms: Option<u64>,
    pub dropped_frames: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetadata {
    pub language: String,
    pub chunk_duration_secs: f64,
    pub sample_rate: u32,
    pub samples: u64,
    pub aborted: bool,
}

/// Sealed, immutable results of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResults {
    pub turn_id: TurnId,
    pub reference_text: String,
    pub audio_file: Option<PathBuf>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Engine name → output, `null` for engines that failed or produced nothing.
    pub results: BTreeMap<String, Option<EngineOutput>>,
    pub engines: BTreeMap<String, EngineReport>,
    pub metadata: TurnMetadata,
    /// Writes that arrived after sealing and were rejected.
    pub rejected_late_writes: u64,
}

impl TurnResults {
    pub fn output(&self, engine: &str) -> Option<&EngineOutput> {
        self.results.get(engine).and_then(Option::as_ref)
    }

    pub fn status(&self, engine: &str) -> Option<EngineStatus> {
        self.engines.get(engine).map(|r| r.status)
    }
}

#[derive(Debug)]
struct SlotState {
    output: Option<EngineOutput>,
    status: EngineStatus,
    detail: Option<String>,
    started_ms: Option<u64>,
    finished_ms: Option<u64>,
    dropped_frames: u64,
}

impl SlotState {
    fn new() -> Self {
        Self {
            output: None,
            status: EngineStatus::Pending,
            detail: None,
            started_ms: None,
            finished_ms: None,
            dropped_frames: 0,
        }
    }
}

#[derive(Debug)]
struct Shared {
    turn_id: TurnId,
    created: Instant,
    sealed: AtomicBool,
    rejected: AtomicU64,
}

/// Exclusive write access to one engine's slot.
///
/// Not `Clone`: exactly one writer exists per engine per turn.
#[derive(Debug)]
pub struct SlotWriter {
    engine: String,
    slot: Arc<Mutex<SlotState>>,
    shared: Arc<Shared>,
}

impl SlotWriter {
    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn turn_id(&self) -> &TurnId {
        &self.shared.turn_id
    }

    pub fn is_sealed(&self) -> bool {
        self.shared.sealed.load(Ordering::SeqCst)
    }

    fn elapsed_ms(&self) -> u64 {
        self.shared.created.elapsed().as_millis() as u64
    }

    /// Run `f` on the slot unless the container is sealed.
    fn with_slot(&self, what: &str, f: impl FnOnce(&mut SlotState)) -> bool {
        let mut slot = self.slot.lock();
        if self.shared.sealed.load(Ordering::SeqCst) {
            let rejected = self.shared.rejected.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                turn_id = %self.shared.turn_id,
                engine = %self.engine,
                rejected,
                "late {what} rejected: turn already sealed"
            );
            return false;
        }
        f(&mut slot);
        true
    }

    pub fn mark_started(&self) -> bool {
        let now = self.elapsed_ms();
        self.with_slot("start", |s| s.started_ms = Some(now))
    }

    /// Fold `output` into whatever the engine already reported this turn.
    pub fn append(&self, output: EngineOutput) -> bool {
        self.with_slot("result", |s| match s.output.as_mut() {
            Some(existing) => existing.merge(output),
            None => s.output = Some(output),
        })
    }

    /// Replace the engine's output.
    pub fn set_output(&self, output: EngineOutput) -> bool {
        self.with_slot("result", |s| s.output = Some(output))
    }

    pub fn set_dropped_frames(&self, dropped: u64) -> bool {
        self.with_slot("drop count", |s| s.dropped_frames = dropped)
    }

    /// Record the engine's completion. A later completion overwrites an
    /// earlier one until the container is sealed.
    pub fn complete(&self, completion: &Completion) -> bool {
        let now = self.elapsed_ms();
        let (status, detail) = status_of(completion);
        self.with_slot("completion", |s| {
            s.status = status;
            s.detail = detail;
            s.finished_ms = Some(now);
        })
    }
}

pub(crate) fn status_of(completion: &Completion) -> (EngineStatus, Option<String>) {
    match completion {
        Completion::Ok => (EngineStatus::Ok, None),
        Completion::Partial(reason) => (EngineStatus::Partial, Some(reason.clone())),
        Completion::Failed(reason) => (EngineStatus::Failed, Some(reason.clone())),
    }
}

/// Fixed-key, per-engine partitioned results of one turn.
#[derive(Debug)]
pub struct ResultsContainer {
    shared: Arc<Shared>,
    reference_text: String,
    sample_rate: u32,
    start_time: DateTime<Utc>,
    slots: HashMap<String, Arc<Mutex<SlotState>>>,
}

impl ResultsContainer {
    /// Create a container for `engines` and one writer per engine.
    pub fn new<I, S>(
        turn_id: TurnId,
        reference_text: impl Into<String>,
        sample_rate: u32,
        engines: I,
    ) -> (Self, Vec<SlotWriter>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let shared = Arc::new(Shared {
            turn_id,
            created: Instant::now(),
            sealed: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
        });
        let mut slots = HashMap::new();
        let mut writers = Vec::new();
        for engine in engines {
            let engine = engine.into();
            let slot = Arc::new(Mutex::new(SlotState::new()));
            slots.insert(engine.clone(), Arc::clone(&slot));
            writers.push(SlotWriter {
                engine,
                slot,
                shared: Arc::clone(&shared),
            });
        }
        let container = Self {
            shared,
            reference_text: reference_text.into(),
            sample_rate,
            start_time: Utc::now(),
            slots,
        };
        (container, writers)
    }

    pub fn turn_id(&self) -> &TurnId {
        &self.shared.turn_id
    }

    pub fn reference_text(&self) -> &str {
        &self.reference_text
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Time since the container was created.
    pub fn elapsed(&self) -> Duration {
        self.shared.created.elapsed()
    }

    pub fn is_sealed(&self) -> bool {
        self.shared.sealed.load(Ordering::SeqCst)
    }

    pub fn rejected_writes(&self) -> u64 {
        self.shared.rejected.load(Ordering::Relaxed)
    }

    pub fn engines(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Record `completion` for an engine whose adapter never completed its
    /// slot itself, e.g. after a timeout. No effect once sealed or when the
    /// slot already has a status.
    pub fn resolve_pending(&self, engine: &str, completion: &Completion) -> bool {
        let Some(slot) = self.slots.get(engine) else {
            return false;
        };
        let mut slot = slot.lock();
        if self.is_sealed() || slot.status != EngineStatus::Pending {
            return false;
        }
        let (status, detail) = status_of(completion);
        slot.status = status;
        slot.detail = detail;
        slot.finished_ms = Some(self.shared.created.elapsed().as_millis() as u64);
        true
    }

    /// Seal the container and snapshot every slot.
    ///
    /// Sealing again returns a fresh snapshot of the same frozen state.
    pub fn seal(&self, audio_file: Option<PathBuf>, metadata: TurnMetadata) -> TurnResults {
        self.shared.sealed.store(true, Ordering::SeqCst);

        let mut results = BTreeMap::new();
        let mut engines = BTreeMap::new();
        for (name, slot) in &self.slots {
            let slot = slot.lock();
            let output = match slot.status {
                EngineStatus::Failed => None,
                _ => slot.output.clone(),
            };
            results.insert(name.clone(), output);
            engines.insert(
                name.clone(),
                EngineReport {
                    status: slot.status,
                    detail: slot.detail.clone(),
                    started_ms: slot.started_ms,
                    finished_ms: slot.finished_ms,
                    dropped_frames: slot.dropped_frames,
                },
            );
        }

        TurnResults {
            turn_id: self.shared.turn_id.clone(),
            reference_text: self.reference_text.clone(),
            audio_file,
            start_time: self.start_time,
            end_time: Utc::now(),
            results,
            engines,
            metadata,
            rejected_late_writes: self.rejected_writes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> TurnMetadata {
        TurnMetadata {
            language: "nl-NL".into(),
            chunk_duration_secs: 1.0,
            sample_rate: 16_000,
            samples: 0,
            aborted: false,
        }
    }

    fn writer_for<'a>(writers: &'a [SlotWriter], engine: &str) -> &'a SlotWriter {
        writers
            .iter()
            .find(|w| w.engine() == engine)
            .expect("writer exists")
    }

    #[test]
    fn generated_turn_ids_are_unique() {
        let a = TurnId::generate();
        let b = TurnId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("turn-"));
    }

    #[test]
    fn turn_id_serializes_as_a_plain_string() {
        let id = TurnId::from("turn-000042-0badf00d");
        let json = serde_json::to_string(&id).expect("serialize turn id");
        assert_eq!(json, r#""turn-000042-0badf00d""#);
        let back: TurnId = serde_json::from_str(&json).expect("deserialize turn id");
        assert_eq!(back, id);
    }

    #[test]
    fn writers_fill_only_their_own_slot() {
        let (container, writers) =
            ResultsContainer::new(TurnId::from("t1"), "de kat", 16_000, ["asr", "score"]);
        let asr = writer_for(&writers, "asr");
        assert!(asr.append(EngineOutput::Transcript("de".into())));
        assert!(asr.append(EngineOutput::Transcript("kat".into())));
        assert!(asr.complete(&Completion::Ok));

        let results = container.seal(None, metadata());
        assert_eq!(results.output("asr"), Some(&EngineOutput::Transcript("de kat".into())));
        assert_eq!(results.status("asr"), Some(EngineStatus::Ok));
        assert_eq!(results.output("score"), None);
        assert_eq!(results.status("score"), Some(EngineStatus::Pending));
    }

    #[test]
    fn sealed_container_rejects_and_counts_late_writes() {
        let (container, writers) =
            ResultsContainer::new(TurnId::from("t2"), "", 16_000, ["remote"]);
        let remote = writer_for(&writers, "remote");
        let sealed = container.seal(None, metadata());
        assert!(!remote.append(EngineOutput::Transcript("late".into())));
        assert!(!remote.complete(&Completion::Ok));
        assert_eq!(container.rejected_writes(), 2);
        assert_eq!(sealed.output("remote"), None);
        assert_eq!(container.seal(None, metadata()).output("remote"), None);
    }

    #[test]
    fn failed_engines_report_null_output() {
        let (container, writers) =
            ResultsContainer::new(TurnId::from("t3"), "", 16_000, ["phonemes"]);
        let w = writer_for(&writers, "phonemes");
        w.set_output(EngineOutput::Phonemes(vec![]));
        w.complete(&Completion::Failed("model crashed".into()));
        let results = container.seal(None, metadata());
        let json = serde_json::to_value(&results).expect("serialize results");
        assert!(json["results"]["phonemes"].is_null());
        assert_eq!(json["engines"]["phonemes"]["status"], "failed");
        assert_eq!(json["engines"]["phonemes"]["detail"], "model crashed");
        assert_eq!(json["turnId"], "t3");
    }

    #[test]
    fn resolve_pending_only_touches_silent_slots() {
        let (container, writers) =
            ResultsContainer::new(TurnId::from("t4"), "", 16_000, ["fast", "slow"]);
        writer_for(&writers, "fast").complete(&Completion::Ok);
        let timeout = Completion::Partial("timed out".into());
        assert!(!container.resolve_pending("fast", &timeout));
        assert!(container.resolve_pending("slow", &timeout));
        assert!(!container.resolve_pending("missing", &timeout));
        let results = container.seal(None, metadata());
        assert_eq!(results.status("fast"), Some(EngineStatus::Ok));
        assert_eq!(results.status("slow"), Some(EngineStatus::Partial));
        assert_eq!(results.engines["slow"].detail.as_deref(), Some("timed out"));
    }

    #[test]
    fn turn_config_fills_missing_fields_with_defaults() {
        let cfg: TurnConfig =
            serde_json::from_str(r#"{"chunkDurationMs": 500}"#).expect("parse config");
        assert_eq!(cfg.chunk_duration(), Duration::from_millis(500));
        assert_eq!(cfg.queue_depth, TurnConfig::default().queue_depth);
        assert!(!cfg.parallel_batches);
        let cfg: TurnConfig =
            serde_json::from_str(r#"{"parallelBatches": true}"#).expect("parse config");
        assert!(cfg.parallel_batches);
    }
}
