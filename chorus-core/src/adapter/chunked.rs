//! Streaming adapter for chunk-at-a-time models.
//!
//! One persistent worker thread per adapter serves every turn of the
//! session:
//!
//! ```text
//! control: Begin(turn) ─┐
//!                       ▼
//! queue ─► Frame ─► ChunkingBuffer ─► ModelInput ─► SpeechModel::transcribe ─► SlotWriter
//!       └► EndMarker(Finished) ─► flush short tail ─► ack(turn, completion)
//!       └► EndMarker(Aborted)  ─► clear buffer      ─► ack(turn, partial)
//! ```
//!
//! The worker only reads its queue while it has a turn, and it checks the
//! control channel before handling any frame, so frames are never attributed
//! to a turn that has already been superseded.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::adapter::feed::{await_ack, run_turn_loop, AckWait, Control, TurnAck, TurnHandler};
use crate::adapter::{AdapterState, Completion, EngineAdapter, StreamingAdapter, TurnBinding};
use crate::buffering::chunk::AudioChunk;
use crate::buffering::ChunkingBuffer;
use crate::error::{ChorusError, Result};
use crate::fanout::{ConsumerHandle, DropCounter, TurnEnd};
use crate::inference::{EngineOutput, ModelHandle, PhonemeGroup};
use crate::turn::{SlotWriter, TurnId};
use crate::worker;

/// Shape of the output a chunked engine accumulates over a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkOutput {
    /// One timestamped phoneme group per decoded chunk.
    #[default]
    Phonemes,
    /// Decoded chunks joined into one transcript.
    Transcript,
}

impl ChunkOutput {
    pub(crate) fn empty(self) -> EngineOutput {
        match self {
            ChunkOutput::Phonemes => EngineOutput::Phonemes(Vec::new()),
            ChunkOutput::Transcript => EngineOutput::Transcript(String::new()),
        }
    }

    pub(crate) fn for_chunk(self, text: &str, chunk: &AudioChunk) -> EngineOutput {
        match self {
            ChunkOutput::Phonemes => EngineOutput::Phonemes(vec![PhonemeGroup {
                phonemes: text.to_string(),
                start_secs: chunk.offset_secs(),
                end_secs: chunk.offset_secs() + chunk.duration_secs(),
            }]),
            ChunkOutput::Transcript => EngineOutput::Transcript(text.to_string()),
        }
    }
}

struct WorkerTurn {
    turn_id: TurnId,
    sample_rate: u32,
    writer: SlotWriter,
}

pub struct ChunkedModelAdapter {
    name: String,
    model: ModelHandle,
    chunk_duration: Duration,
    liveness: Duration,
    output: ChunkOutput,
    state: AdapterState,
    control_tx: Option<Sender<Control<WorkerTurn>>>,
    ack_rx: Option<Receiver<TurnAck>>,
    worker: Option<JoinHandle<()>>,
    current: Option<TurnId>,
    outcome: Option<Completion>,
    stopped: bool,
}

impl ChunkedModelAdapter {
    pub fn new(
        name: impl Into<String>,
        model: ModelHandle,
        chunk_duration: Duration,
        liveness: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            model,
            chunk_duration,
            liveness,
            output: ChunkOutput::default(),
            state: AdapterState::Idle,
            control_tx: None,
            ack_rx: None,
            worker: None,
            current: None,
            outcome: None,
            stopped: false,
        }
    }

    pub fn with_output(mut self, output: ChunkOutput) -> Self {
        self.output = output;
        self
    }

    /// Wait for the worker's acknowledgement of the current turn.
    fn collect_ack(&mut self, timeout: Duration) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        let (Some(ack_rx), Some(current)) = (self.ack_rx.as_ref(), self.current.as_ref()) else {
            return false;
        };
        let completion = match await_ack(ack_rx, current, timeout) {
            AckWait::Acked(completion) => completion,
            AckWait::TimedOut => return false,
            AckWait::Disconnected => Completion::Failed("worker exited".into()),
        };
        self.outcome = Some(completion);
        self.state = AdapterState::Completed;
        true
    }
}

impl EngineAdapter for ChunkedModelAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> AdapterState {
        self.state
    }

    fn start(&mut self, binding: TurnBinding) -> Result<()> {
        if self.stopped {
            return Err(ChorusError::Engine(format!("{} has been stopped", self.name)));
        }
        let Some(control_tx) = self.control_tx.as_ref() else {
            return Err(ChorusError::Engine(format!("{} has no queue attached", self.name)));
        };
        binding.writer.mark_started();
        let turn_id = binding.turn_id.clone();
        control_tx
            .send(Control::Begin(WorkerTurn {
                turn_id: binding.turn_id,
                sample_rate: binding.sample_rate,
                writer: binding.writer,
            }))
            .map_err(|_| ChorusError::Engine(format!("{} worker is gone", self.name)))?;
        self.current = Some(turn_id);
        self.outcome = None;
        self.state = AdapterState::Running;
        Ok(())
    }

    fn wait_for_completion(&mut self, timeout: Duration) -> Completion {
        if self.current.is_none() {
            return Completion::Failed("no turn was started".into());
        }
        if !self.collect_ack(timeout) {
            warn!(engine = %self.name, ?timeout, "timed out waiting for end of turn");
            self.outcome = Some(Completion::Partial("timed out waiting for end of turn".into()));
            self.state = AdapterState::Completed;
        }
        self.outcome
            .clone()
            .unwrap_or_else(|| Completion::Failed("no completion recorded".into()))
    }

    fn stop(&mut self) {
        if let Some(tx) = self.control_tx.take() {
            let _ = tx.send(Control::Shutdown);
        }
        if let Some(handle) = self.worker.take() {
            worker::join_logged(handle);
            info!(engine = %self.name, "adapter stopped");
        }
        self.ack_rx = None;
        self.stopped = true;
        self.state = AdapterState::Stopped;
    }
}

impl StreamingAdapter for ChunkedModelAdapter {
    fn attach(&mut self, queue: ConsumerHandle) -> Result<()> {
        if self.worker.is_some() || self.stopped {
            return Err(ChorusError::Engine(format!("{} cannot be attached again", self.name)));
        }
        self.model.0.lock().warm_up()?;

        let (control_tx, control_rx) = unbounded();
        let (ack_tx, ack_rx) = unbounded();
        let mut handler = ChunkedWorker {
            model: self.model.clone(),
            chunk_duration: self.chunk_duration,
            output: self.output,
            dropped: queue.drop_counter(),
            ack_tx,
            active: None,
        };
        let liveness = self.liveness;
        let span = info_span!("engine", engine = %self.name);
        let handle = worker::spawn(format!("chorus-{}", self.name), move || {
            let _enter = span.enter();
            debug!("worker started");
            run_turn_loop(&queue, &control_rx, liveness, &mut handler);
        })?;
        self.control_tx = Some(control_tx);
        self.ack_rx = Some(ack_rx);
        self.worker = Some(handle);
        Ok(())
    }

    fn wait_end_of_turn(&mut self, timeout: Duration) -> bool {
        if self.state == AdapterState::Running {
            self.state = AdapterState::Draining;
        }
        self.collect_ack(timeout)
    }
}

impl Drop for ChunkedModelAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct ChunkedWorker {
    model: ModelHandle,
    chunk_duration: Duration,
    output: ChunkOutput,
    dropped: DropCounter,
    ack_tx: Sender<TurnAck>,
    active: Option<ActiveTurn>,
}

/// The turn the worker is currently serving.
struct ActiveTurn {
    turn_id: TurnId,
    writer: SlotWriter,
    chunker: ChunkingBuffer,
    chunks: usize,
    errors: usize,
}

impl ChunkedWorker {
    fn infer_chunk(&mut self, chunk: &AudioChunk) {
        let Some(turn) = self.active.as_mut() else {
            return;
        };
        let input = turn.chunker.to_model_input(chunk);
        turn.chunks += 1;
        let result = self.model.0.lock().transcribe(&input);
        match result {
            Ok(text) if text.trim().is_empty() => {
                debug!(
                    chunk = input.chunk_index,
                    samples = input.source_samples,
                    rms = input.rms(),
                    final_short = input.is_final_short,
                    "empty decode"
                );
            }
            Ok(text) => {
                debug!(chunk = input.chunk_index, %text, "chunk decoded");
                turn.writer.append(self.output.for_chunk(text.trim(), chunk));
            }
            Err(e) => {
                turn.errors += 1;
                warn!(chunk = input.chunk_index, "inference failed: {e}");
            }
        }
    }

    fn finish(&mut self, completion: Completion) {
        let Some(turn) = self.active.take() else {
            return;
        };
        turn.writer.set_dropped_frames(self.dropped.get());
        turn.writer.complete(&completion);
        debug!(turn_id = %turn.turn_id, chunks = turn.chunks, %completion, "turn finished");
        let _ = self.ack_tx.send(TurnAck {
            turn_id: turn.turn_id,
            completion,
        });
    }
}

impl TurnHandler for ChunkedWorker {
    type Turn = WorkerTurn;

    fn begin(&mut self, turn: WorkerTurn) -> bool {
        let target_rate = {
            let mut model = self.model.0.lock();
            model.reset();
            model.sample_rate()
        };
        match ChunkingBuffer::new(turn.sample_rate, target_rate, self.chunk_duration) {
            Ok(chunker) => {
                turn.writer.set_output(self.output.empty());
                debug!(
                    turn_id = %turn.turn_id,
                    chunk_samples = chunker.chunk_samples(),
                    "turn started"
                );
                self.active = Some(ActiveTurn {
                    turn_id: turn.turn_id,
                    writer: turn.writer,
                    chunker,
                    chunks: 0,
                    errors: 0,
                });
                true
            }
            Err(e) => {
                warn!(turn_id = %turn.turn_id, "cannot serve turn: {e}");
                let completion = Completion::Failed(e.to_string());
                turn.writer.complete(&completion);
                let _ = self.ack_tx.send(TurnAck {
                    turn_id: turn.turn_id,
                    completion,
                });
                false
            }
        }
    }

    fn frame(&mut self, frame: &[i16]) {
        let chunks = match self.active.as_mut() {
            Some(turn) => turn.chunker.feed(frame),
            None => return,
        };
        for chunk in &chunks {
            self.infer_chunk(chunk);
        }
    }

    fn end(&mut self, end: TurnEnd) {
        let completion = match end {
            TurnEnd::Finished => {
                if let Some(tail) = self.active.as_mut().and_then(|t| t.chunker.finish()) {
                    self.infer_chunk(&tail);
                }
                match self.active.as_ref() {
                    Some(turn) if turn.errors > 0 => Completion::Partial(format!(
                        "{} of {} chunks failed",
                        turn.errors, turn.chunks
                    )),
                    _ => Completion::Ok,
                }
            }
            TurnEnd::Aborted => {
                if let Some(turn) = self.active.as_mut() {
                    turn.chunker.clear();
                }
                Completion::Partial("turn aborted".into())
            }
        };
        self.finish(completion);
    }

    fn abandon(&mut self, reason: &str) {
        self.finish(Completion::Partial(reason.to_string()));
    }
}
