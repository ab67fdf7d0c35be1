//! `TurnController`: one in-flight recording at a time over a warm set of
//! adapters.
//!
//! ## Lifecycle
//!
//! ```text
//! TurnController::new()      → broadcaster built, streaming adapters attached
//!     └─► begin()            → results container, recording sink, adapters started
//!         ├─► publish()*     → frames to the WAV sink and every queue
//!         └─► stop()         → (1) end markers
//!                              (2) streaming acks
//!                              (3) WAV finalised
//!                              (4) batch adapters run on the file
//!                              (5) every adapter completed or timed out
//!                              (6) container sealed → TurnResults
//!     └─► shutdown()         → adapters stopped and joined
//! ```
//!
//! An engine failing or timing out only marks its own slot; the turn always
//! produces results.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Span};

use crate::adapter::{Adapter, AdapterState, Completion, TurnBinding};
use crate::error::{ChorusError, Result};
use crate::fanout::{Broadcaster, Frame, RecordingInfo, RecordingSink, TurnEnd};
use crate::inference::TurnContext;
use crate::ipc::{EventBus, TurnStatusEvent};
use crate::turn::{status_of, ResultsContainer, TurnConfig, TurnId, TurnMetadata, TurnResults};

struct ActiveTurn {
    container: ResultsContainer,
    sample_rate: u32,
    /// Odd trailing byte of the last PCM byte chunk.
    pcm_carry: Option<u8>,
    span: Span,
}

pub struct TurnController {
    config: TurnConfig,
    broadcaster: Broadcaster,
    adapters: Vec<Adapter>,
    events: EventBus,
    turn: Option<ActiveTurn>,
    turns_served: u64,
    stopped: bool,
}

impl TurnController {
    /// Build a controller over `adapters`, registering one queue per
    /// streaming adapter.
    ///
    /// # Errors
    /// Duplicate engine names, or a streaming adapter refusing its queue.
    pub fn new(config: TurnConfig, mut adapters: Vec<Adapter>, events: EventBus) -> Result<Self> {
        let mut names = HashSet::new();
        for adapter in &adapters {
            if !names.insert(adapter.name().to_string()) {
                return Err(ChorusError::Engine(format!(
                    "engine name `{}` is used twice",
                    adapter.name()
                )));
            }
        }

        let mut broadcaster = Broadcaster::new(config.overflow, config.queue_depth);
        for adapter in &mut adapters {
            if let Adapter::Streaming(streaming) = adapter {
                let queue = broadcaster.register(streaming.name());
                streaming.attach(queue)?;
            }
        }
        info!(
            engines = adapters.len(),
            streaming = broadcaster.consumer_count(),
            "turn controller ready"
        );

        Ok(Self {
            config,
            broadcaster,
            adapters,
            events,
            turn: None,
            turns_served: 0,
            stopped: false,
        })
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    /// Lifecycle state of every engine, in registration order.
    pub fn engine_states(&self) -> impl Iterator<Item = (&str, AdapterState)> {
        self.adapters.iter().map(|a| (a.name(), a.state()))
    }

    pub fn engines(&self) -> impl Iterator<Item = &str> {
        self.adapters.iter().map(Adapter::name)
    }

    pub fn current_turn(&self) -> Option<&TurnId> {
        self.turn.as_ref().map(|t| t.container.turn_id())
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.turn.as_ref().map(|t| t.sample_rate)
    }

    /// Samples published in the current turn.
    pub fn published_samples(&self) -> u64 {
        self.broadcaster.published_samples()
    }

    pub fn turns_served(&self) -> u64 {
        self.turns_served
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Abandon any in-flight turn and drain every queue.
    ///
    /// Safe to call with no prior turn.
    pub fn reset(&mut self) {
        if let Some(turn_id) = self.current_turn().cloned() {
            warn!(%turn_id, "resetting with a turn in flight; aborting it");
            if let Err(e) = self.finish(TurnEnd::Aborted) {
                warn!(%turn_id, "abort during reset failed: {e}");
            }
        }
        self.broadcaster.reset_turn();
    }

    /// Start a new turn and return its id.
    ///
    /// # Errors
    /// A stopped controller, a zero sample rate, or failure to create the
    /// recording file. Adapter start failures only mark that engine failed.
    pub fn begin(&mut self, reference_text: &str, sample_rate: u32) -> Result<TurnId> {
        if self.stopped {
            return Err(ChorusError::Engine("turn controller has been shut down".into()));
        }
        if sample_rate == 0 {
            return Err(ChorusError::InvalidSampleRate(sample_rate));
        }
        self.reset();

        let turn_id = TurnId::generate();
        let span = info_span!("turn", turn_id = %turn_id);
        let entered = span.enter();

        let names: Vec<String> = self.engines().map(str::to_string).collect();
        let (container, writers) =
            ResultsContainer::new(turn_id.clone(), reference_text, sample_rate, names.clone());

        let path = self
            .config
            .recordings_dir
            .join(format!("{}.wav", turn_id.as_str()));
        let sink = RecordingSink::create(&path, sample_rate).inspect_err(|e| {
            error!(path = %path.display(), "cannot create turn recording: {e}");
        })?;
        self.broadcaster.attach_recording(sink);

        let context = TurnContext {
            reference_text: reference_text.to_string(),
            language: self.config.language.clone(),
        };
        for (adapter, writer) in self.adapters.iter_mut().zip(writers) {
            let binding = TurnBinding {
                turn_id: turn_id.clone(),
                sample_rate,
                context: context.clone(),
                writer,
            };
            if let Err(e) = adapter.start(binding) {
                warn!(engine = adapter.name(), "adapter failed to start: {e}");
                container.resolve_pending(adapter.name(), &Completion::Failed(e.to_string()));
            }
        }

        info!(sample_rate, engines = names.len(), "turn started");
        self.events.emit(TurnStatusEvent::TurnStarted {
            turn_id: turn_id.clone(),
            sample_rate,
            engines: names,
        });
        drop(entered);
        self.turn = Some(ActiveTurn {
            container,
            sample_rate,
            pcm_carry: None,
            span,
        });
        Ok(turn_id)
    }

    /// Publish one frame to the recording and every engine queue.
    ///
    /// # Errors
    /// `NoActiveTurn` outside a turn; a recording failure is fatal to the turn.
    pub fn publish(&mut self, frame: Frame) -> Result<()> {
        if self.turn.is_none() {
            return Err(ChorusError::NoActiveTurn);
        }
        self.broadcaster.publish(frame)
    }

    pub fn publish_pcm(&mut self, samples: &[i16]) -> Result<()> {
        self.publish(Arc::from(samples))
    }

    /// Decode 16-bit little-endian PCM bytes and publish them. A chunk may
    /// end mid-sample; the odd byte is held for the next call in this turn.
    ///
    /// Returns the samples published in the turn so far.
    pub fn publish_pcm_bytes(&mut self, bytes: &[u8]) -> Result<u64> {
        let Some(turn) = self.turn.as_mut() else {
            return Err(ChorusError::NoActiveTurn);
        };
        let samples = decode_le_pcm(&mut turn.pcm_carry, bytes);
        if !samples.is_empty() {
            self.broadcaster.publish(Arc::from(samples))?;
        }
        Ok(self.broadcaster.published_samples())
    }

    /// End the turn normally and return its sealed results.
    pub fn stop(&mut self) -> Result<TurnResults> {
        self.finish(TurnEnd::Finished)
    }

    /// End the turn discarding buffered audio. Batch engines are not run.
    pub fn abort(&mut self) -> Result<TurnResults> {
        self.finish(TurnEnd::Aborted)
    }

    /// Abort after the producer failed to start; the partial recording is
    /// deleted and the results carry no audio file.
    pub fn abandon(&mut self, reason: &str) -> Result<TurnResults> {
        if let Some(turn_id) = self.current_turn() {
            error!(%turn_id, reason, "producer failed; abandoning turn");
        }
        if self.turn.is_none() {
            return Err(ChorusError::NoActiveTurn);
        }
        self.broadcaster.discard_recording();
        self.finish(TurnEnd::Aborted)
    }

    fn finish(&mut self, end: TurnEnd) -> Result<TurnResults> {
        let Some(turn) = self.turn.take() else {
            return Err(ChorusError::NoActiveTurn);
        };
        let _enter = turn.span.enter();
        let container = &turn.container;
        let aborted = end == TurnEnd::Aborted;
        if turn.pcm_carry.is_some() {
            debug!("dropping trailing half sample");
        }

        self.broadcaster.end_turn(end);

        let drain = self.config.drain_timeout();
        for adapter in &mut self.adapters {
            if let Adapter::Streaming(streaming) = adapter {
                if !streaming.wait_end_of_turn(drain) {
                    warn!(engine = streaming.name(), ?drain, "end of turn not acknowledged");
                }
            }
        }

        let recording = match self.broadcaster.close_recording() {
            Ok(info) => info,
            Err(e) => {
                error!("finalising turn recording failed: {e}");
                None
            }
        };

        if aborted {
            for adapter in &mut self.adapters {
                if let Adapter::Batch(batch) = adapter {
                    batch.skip("turn aborted");
                }
            }
        } else {
            self.run_batches(container, recording.as_ref());
        }

        let timeout = self.config.completion_timeout();
        for adapter in &mut self.adapters {
            let completion = adapter.wait_for_completion(timeout);
            container.resolve_pending(adapter.name(), &completion);
            let (status, detail) = status_of(&completion);
            self.events.emit(TurnStatusEvent::EngineCompleted {
                turn_id: container.turn_id().clone(),
                engine: adapter.name().to_string(),
                status,
                detail,
                elapsed_ms: container.elapsed().as_millis() as u64,
            });
        }

        for stats in self.broadcaster.stats() {
            if stats.dropped_frames > 0 {
                warn!(consumer = %stats.id, dropped = stats.dropped_frames, "frames dropped this turn");
            }
        }

        let samples = self.broadcaster.published_samples();
        let audio_file: Option<PathBuf> = recording.map(|r| r.path);
        let results = container.seal(
            audio_file.clone(),
            TurnMetadata {
                language: self.config.language.clone(),
                chunk_duration_secs: self.config.chunk_duration().as_secs_f64(),
                sample_rate: turn.sample_rate,
                samples,
                aborted,
            },
        );
        self.turns_served += 1;

        info!(
            samples,
            aborted,
            elapsed_ms = container.elapsed().as_millis() as u64,
            "turn completed"
        );
        self.events.emit(TurnStatusEvent::TurnCompleted {
            turn_id: container.turn_id().clone(),
            aborted,
            samples,
            audio_file,
            rejected_late_writes: results.rejected_late_writes,
        });
        Ok(results)
    }

    /// Trigger every batch engine on the finalised recording. Unless
    /// `parallel_batches` is set, each one is waited for (within its own
    /// completion timeout) before the next is triggered.
    fn run_batches(&mut self, container: &ResultsContainer, recording: Option<&RecordingInfo>) {
        let sequential = !self.config.parallel_batches;
        let timeout = self.config.completion_timeout();
        for adapter in &mut self.adapters {
            let Adapter::Batch(batch) = adapter else {
                continue;
            };
            let outcome = match recording {
                Some(info) => batch.process_batch(info),
                None => Err(ChorusError::Recording("no finalised recording".into())),
            };
            match outcome {
                Ok(()) if sequential => {
                    let completion = batch.wait_for_completion(timeout);
                    debug!(engine = batch.name(), %completion, "batch engine finished");
                }
                Ok(()) => {}
                Err(e) => {
                    warn!(engine = batch.name(), "batch engine not run: {e}");
                    container.resolve_pending(batch.name(), &Completion::Failed(e.to_string()));
                }
            }
        }
    }

    /// Abort any in-flight turn and stop every adapter. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        if self.turn.is_some() {
            if let Err(e) = self.finish(TurnEnd::Aborted) {
                warn!("abort during shutdown failed: {e}");
            }
        }
        for adapter in &mut self.adapters {
            adapter.stop();
        }
        self.broadcaster.reset_turn();
        self.stopped = true;
        info!(turns = self.turns_served, "turn controller shut down");
    }
}

/// Decode little-endian i16 samples, carrying an odd trailing byte.
fn decode_le_pcm(carry: &mut Option<u8>, bytes: &[u8]) -> Vec<i16> {
    let mut buf = Vec::with_capacity(bytes.len() + 1);
    buf.extend(carry.take());
    buf.extend_from_slice(bytes);
    if buf.len() % 2 == 1 {
        *carry = buf.pop();
    }
    buf.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

impl Drop for TurnController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use crate::adapter::{ChunkedModelAdapter, FileModelAdapter};
    use crate::turn::EngineStatus;
    use crate::buffering::chunk::ModelInput;
    use crate::inference::{
        EngineOutput, FileModel, FileModelHandle, ModelHandle, PronunciationScore, SpeechModel,
    };

    struct ChunkCounter {
        seen: Arc<Mutex<Vec<usize>>>,
    }

    impl SpeechModel for ChunkCounter {
        fn warm_up(&mut self) -> Result<()> {
            Ok(())
        }

        fn transcribe(&mut self, input: &ModelInput) -> Result<String> {
            self.seen.lock().push(input.samples.len());
            Ok("a".into())
        }

        fn reset(&mut self) {}
    }

    struct LengthScorer {
        fail: bool,
    }

    impl FileModel for LengthScorer {
        fn analyze(&mut self, recording: &Path, _context: &TurnContext) -> Result<EngineOutput> {
            if self.fail {
                return Err(ChorusError::Engine("scoring service down".into()));
            }
            let samples = hound::WavReader::open(recording)?.len();
            Ok(EngineOutput::Score(PronunciationScore {
                accuracy: Some(f64::from(samples) / 1_000.0),
                ..Default::default()
            }))
        }
    }

    fn config(dir: &Path) -> TurnConfig {
        TurnConfig {
            recordings_dir: dir.to_path_buf(),
            liveness_poll_ms: 10,
            completion_timeout_ms: 2_000,
            ..TurnConfig::default()
        }
    }

    fn controller(dir: &Path, fail_scorer: bool) -> (TurnController, Arc<Mutex<Vec<usize>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cfg = config(dir);
        let adapters = vec![
            Adapter::streaming(ChunkedModelAdapter::new(
                "phonemes",
                ModelHandle::new(ChunkCounter {
                    seen: Arc::clone(&seen),
                }),
                cfg.chunk_duration(),
                cfg.liveness_poll(),
            )),
            Adapter::batch(FileModelAdapter::new(
                "scorer",
                FileModelHandle::new(LengthScorer { fail: fail_scorer }),
            )),
        ];
        let ctrl = TurnController::new(cfg, adapters, EventBus::new()).expect("controller");
        (ctrl, seen)
    }

    #[test]
    fn full_turn_collects_every_engine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut ctrl, seen) = controller(dir.path(), false);
        let turn_id = ctrl.begin("de kat", 16_000).expect("begin");
        for _ in 0..5 {
            ctrl.publish_pcm(&[0i16; 8_000]).expect("publish");
        }
        let results = ctrl.stop().expect("stop");

        assert_eq!(results.turn_id, turn_id);
        assert_eq!(results.metadata.samples, 40_000);
        assert_eq!(results.status("phonemes"), Some(EngineStatus::Ok));
        assert_eq!(results.status("scorer"), Some(EngineStatus::Ok));
        assert_eq!(*seen.lock(), vec![16_000, 16_000, 8_000]);
        match results.output("scorer") {
            Some(EngineOutput::Score(score)) => assert_eq!(score.accuracy, Some(40.0)),
            other => panic!("unexpected scorer output {other:?}"),
        }
        let wav = results.audio_file.as_ref().expect("recording path");
        assert_eq!(hound::WavReader::open(wav).expect("open wav").len(), 40_000);
    }

    #[test]
    fn odd_bytes_carry_into_the_next_chunk() {
        let mut carry = None;
        let bytes = 1000i16.to_le_bytes();
        let more = (-2i16).to_le_bytes();
        assert!(decode_le_pcm(&mut carry, &bytes[..1]).is_empty());
        assert_eq!(carry, Some(bytes[0]));
        assert_eq!(decode_le_pcm(&mut carry, &[bytes[1], more[0], more[1]]), vec![1000, -2]);
        assert_eq!(carry, None);
    }

    #[test]
    fn half_sample_does_not_leak_into_the_next_turn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut ctrl, _seen) = controller(dir.path(), false);
        assert!(matches!(ctrl.publish_pcm_bytes(&[0, 0]), Err(ChorusError::NoActiveTurn)));

        ctrl.begin("", 16_000).expect("begin");
        assert_eq!(ctrl.publish_pcm_bytes(&[1, 0, 7]).expect("publish"), 1);
        let results = ctrl.stop().expect("stop");
        assert_eq!(results.metadata.samples, 1);

        ctrl.begin("", 16_000).expect("begin again");
        assert_eq!(ctrl.publish_pcm_bytes(&[0x34, 0x12]).expect("publish"), 1);
        let results = ctrl.stop().expect("stop");
        let wav = results.audio_file.expect("recording");
        let samples: Vec<i16> = hound::WavReader::open(wav)
            .expect("open wav")
            .samples::<i16>()
            .map(|s| s.expect("sample"))
            .collect();
        assert_eq!(samples, vec![0x1234]);
    }

    #[test]
    fn failing_engine_does_not_fail_the_turn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut ctrl, _seen) = controller(dir.path(), true);
        ctrl.begin("", 16_000).expect("begin");
        ctrl.publish_pcm(&[0i16; 16_000]).expect("publish");
        let results = ctrl.stop().expect("stop");
        assert_eq!(results.status("phonemes"), Some(EngineStatus::Ok));
        assert_eq!(results.status("scorer"), Some(EngineStatus::Failed));
        assert_eq!(results.output("scorer"), None);
        let json = serde_json::to_value(&results).expect("serialize");
        assert!(json["results"]["scorer"].is_null());
    }

    #[test]
    fn abort_discards_audio_and_skips_batch_engines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut ctrl, seen) = controller(dir.path(), false);
        ctrl.begin("", 16_000).expect("begin");
        ctrl.publish_pcm(&[0i16; 8_000]).expect("publish");
        let results = ctrl.abort().expect("abort");
        assert!(results.metadata.aborted);
        assert_eq!(results.status("phonemes"), Some(EngineStatus::Partial));
        assert_eq!(results.status("scorer"), Some(EngineStatus::Partial));
        assert!(seen.lock().is_empty());
        assert!(ctrl.current_turn().is_none());
        for (engine, state) in ctrl.engine_states() {
            assert_eq!(state, AdapterState::Completed, "{engine} left unfinished by abort");
        }

        ctrl.begin("", 16_000).expect("begin after abort");
        ctrl.publish_pcm(&[0i16; 16_000]).expect("publish");
        let results = ctrl.stop().expect("stop");
        assert_eq!(results.status("scorer"), Some(EngineStatus::Ok));
        assert_eq!(*seen.lock(), vec![16_000]);
    }

    #[test]
    fn begin_while_in_flight_aborts_the_previous_turn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut ctrl, _seen) = controller(dir.path(), false);
        let first = ctrl.begin("", 16_000).expect("begin");
        ctrl.publish_pcm(&[0i16; 4_000]).expect("publish");
        let second = ctrl.begin("", 16_000).expect("begin again");
        assert_ne!(first, second);
        assert_eq!(ctrl.current_turn(), Some(&second));
        assert_eq!(ctrl.published_samples(), 0);
        let results = ctrl.stop().expect("stop");
        assert_eq!(results.turn_id, second);
        assert_eq!(results.metadata.samples, 0);
    }

    /// `(engine, began, finished)` per analysis.
    type Runs = Arc<Mutex<Vec<(&'static str, Instant, Instant)>>>;

    /// Scorer that sleeps, then logs when it ran.
    struct TimedScorer {
        name: &'static str,
        delay: Duration,
        runs: Runs,
    }

    impl FileModel for TimedScorer {
        fn analyze(&mut self, _recording: &Path, _context: &TurnContext) -> Result<EngineOutput> {
            let began = Instant::now();
            std::thread::sleep(self.delay);
            self.runs.lock().push((self.name, began, Instant::now()));
            Ok(EngineOutput::Score(PronunciationScore::default()))
        }
    }

    fn timed_controller(dir: &Path, cfg: TurnConfig, delay_ms: u64) -> (TurnController, Runs) {
        let runs: Runs = Arc::new(Mutex::new(Vec::new()));
        let adapters = ["accuracy", "fluency"]
            .into_iter()
            .map(|name| {
                Adapter::batch(FileModelAdapter::new(
                    name,
                    FileModelHandle::new(TimedScorer {
                        name,
                        delay: Duration::from_millis(delay_ms),
                        runs: Arc::clone(&runs),
                    }),
                ))
            })
            .collect();
        let cfg = TurnConfig {
            recordings_dir: dir.to_path_buf(),
            ..cfg
        };
        let ctrl = TurnController::new(cfg, adapters, EventBus::new()).expect("controller");
        (ctrl, runs)
    }

    fn run_one_turn(ctrl: &mut TurnController) -> TurnResults {
        ctrl.begin("", 16_000).expect("begin");
        ctrl.publish_pcm(&[0i16; 1_600]).expect("publish");
        ctrl.stop().expect("stop")
    }

    #[test]
    fn batch_engines_run_one_after_another_by_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut ctrl, runs) = timed_controller(dir.path(), config(dir.path()), 150);
        let results = run_one_turn(&mut ctrl);
        assert_eq!(results.status("accuracy"), Some(EngineStatus::Ok));
        assert_eq!(results.status("fluency"), Some(EngineStatus::Ok));

        let runs = runs.lock();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].0, "accuracy");
        assert!(runs[1].1 >= runs[0].2, "second batch started before the first finished");
    }

    #[test]
    fn parallel_batches_overlap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = TurnConfig {
            parallel_batches: true,
            ..config(dir.path())
        };
        let (mut ctrl, runs) = timed_controller(dir.path(), cfg, 300);
        let results = run_one_turn(&mut ctrl);
        assert_eq!(results.status("accuracy"), Some(EngineStatus::Ok));
        assert_eq!(results.status("fluency"), Some(EngineStatus::Ok));

        let runs = runs.lock();
        assert_eq!(runs.len(), 2);
        let (first, second) = (&runs[0], &runs[1]);
        assert!(second.1 < first.2, "batches did not run concurrently");
    }

    #[test]
    fn overdue_batch_does_not_delay_the_next_turn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = TurnConfig {
            completion_timeout_ms: 100,
            ..config(dir.path())
        };
        let (mut ctrl, _runs) = timed_controller(dir.path(), cfg, 2_500);
        let results = run_one_turn(&mut ctrl);
        assert_eq!(results.status("accuracy"), Some(EngineStatus::Partial));

        let began = Instant::now();
        ctrl.begin("", 16_000).expect("begin next turn");
        assert!(
            began.elapsed() < Duration::from_millis(500),
            "begin waited {:?} for an overdue analysis",
            began.elapsed()
        );
        ctrl.abort().expect("abort");
    }

    #[test]
    fn misuse_is_reported_not_panicked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut ctrl, _seen) = controller(dir.path(), false);
        ctrl.reset();
        assert!(matches!(ctrl.publish_pcm(&[1, 2, 3]), Err(ChorusError::NoActiveTurn)));
        assert!(matches!(ctrl.stop(), Err(ChorusError::NoActiveTurn)));
        assert!(matches!(ctrl.begin("", 0), Err(ChorusError::InvalidSampleRate(0))));
        ctrl.shutdown();
        ctrl.shutdown();
        assert!(ctrl.is_stopped());
        assert!(ctrl.begin("", 16_000).is_err());
    }

    #[test]
    fn duplicate_engine_names_are_rejected() {
        let adapters = vec![
            Adapter::batch(FileModelAdapter::new(
                "scorer",
                FileModelHandle::new(LengthScorer { fail: false }),
            )),
            Adapter::batch(FileModelAdapter::new(
                "scorer",
                FileModelHandle::new(LengthScorer { fail: false }),
            )),
        ];
        assert!(TurnController::new(TurnConfig::default(), adapters, EventBus::new()).is_err());
    }

    #[test]
    fn status_events_follow_the_turn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let cfg = config(dir.path());
        let adapters = vec![Adapter::batch(FileModelAdapter::new(
            "scorer",
            FileModelHandle::new(LengthScorer { fail: false }),
        ))];
        let mut ctrl = TurnController::new(cfg, adapters, bus).expect("controller");
        let turn_id = ctrl.begin("", 16_000).expect("begin");
        ctrl.publish_pcm(&[0i16; 160]).expect("publish");
        ctrl.stop().expect("stop");

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.turn_id(), Some(&turn_id));
            kinds.push(match event {
                TurnStatusEvent::TurnStarted { .. } => "started",
                TurnStatusEvent::EngineCompleted { .. } => "engine",
                TurnStatusEvent::TurnCompleted { .. } => "completed",
                TurnStatusEvent::SessionEvicted { .. } => "evicted",
            });
        }
        assert_eq!(kinds, vec!["started", "engine", "completed"]);
    }

    #[test]
    fn engine_timing_is_recorded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut ctrl, _seen) = controller(dir.path(), false);
        ctrl.begin("", 16_000).expect("begin");
        std::thread::sleep(Duration::from_millis(5));
        let results = ctrl.stop().expect("stop");
        let report = &results.engines["scorer"];
        let started = report.started_ms.expect("start offset");
        let finished = report.finished_ms.expect("finish offset");
        assert!(finished >= started);
        assert!(results.end_time >= results.start_time);
    }

    #[test]
    fn abandoned_turn_leaves_no_recording() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut ctrl, _seen) = controller(dir.path(), false);
        let turn_id = ctrl.begin("de kat", 48_000).expect("begin");
        let results = ctrl.abandon("input device vanished").expect("abandon");
        assert_eq!(results.turn_id, turn_id);
        assert!(results.metadata.aborted);
        assert_eq!(results.audio_file, None);
        assert!(!dir.path().join(format!("{}.wav", turn_id.as_str())).exists());
        assert!(matches!(ctrl.abandon("again"), Err(ChorusError::NoActiveTurn)));
    }
}
