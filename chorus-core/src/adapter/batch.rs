//! Batch adapter: runs a [`FileModel`] over the finalised recording.
//!
//! Nothing happens while the turn is live. Once the controller has closed
//! the WAV file it calls `process_batch`, which hands the analysis to a
//! short-lived worker thread; `wait_for_completion` then waits for it with a
//! deadline.
//!
//! An analysis that overruns its deadline is left to finish on its own: the
//! sealed slot rejects its late result, and finished workers are reaped at the
//! next `start` without waiting. `stop` waits at most [`STOP_GRACE`] before
//! detaching whatever is still running.
//!
//! [`FileModel`]: crate::inference::FileModel

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, info, info_span, warn};

use crate::adapter::{AdapterState, BatchAdapter, Completion, EngineAdapter, TurnBinding};
use crate::error::{ChorusError, Result};
use crate::fanout::RecordingInfo;
use crate::inference::{FileModelHandle, TurnContext};
use crate::turn::{SlotWriter, TurnId};
use crate::worker;

struct PendingTurn {
    turn_id: TurnId,
    context: TurnContext,
    /// Moves into the job once the batch is triggered.
    writer: Option<SlotWriter>,
}

/// Longest `stop` waits for a running analysis.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

struct Job {
    done_rx: Receiver<Completion>,
    handle: JoinHandle<()>,
}

impl Job {
    /// Join the worker if it is done or finishes within `grace`; hand the
    /// job back otherwise.
    fn reap(self, grace: Duration) -> Option<Job> {
        if !self.handle.is_finished() {
            if let Err(RecvTimeoutError::Timeout) = self.done_rx.recv_timeout(grace) {
                return Some(self);
            }
        }
        worker::join_logged(self.handle);
        None
    }
}

pub struct FileModelAdapter {
    name: String,
    model: FileModelHandle,
    state: AdapterState,
    turn: Option<PendingTurn>,
    job: Option<Job>,
    /// Analyses from earlier turns that overran their deadline.
    overdue: Vec<Job>,
    outcome: Option<Completion>,
    stopped: bool,
}

impl FileModelAdapter {
    pub fn new(name: impl Into<String>, model: FileModelHandle) -> Self {
        Self {
            name: name.into(),
            model,
            state: AdapterState::Idle,
            turn: None,
            job: None,
            overdue: Vec::new(),
            outcome: None,
            stopped: false,
        }
    }

    /// Analyses from earlier turns that are still running.
    pub fn overdue_jobs(&self) -> usize {
        self.overdue.len()
    }

    /// Retire the current job and join every finished one, waiting at most
    /// `grace` in total.
    fn reap_jobs(&mut self, grace: Duration) {
        if let Some(job) = self.job.take() {
            self.overdue.push(job);
        }
        let deadline = Instant::now() + grace;
        for job in std::mem::take(&mut self.overdue) {
            let left = deadline.saturating_duration_since(Instant::now());
            if let Some(job) = job.reap(left) {
                self.overdue.push(job);
            }
        }
        if !self.overdue.is_empty() {
            debug!(engine = %self.name, running = self.overdue.len(), "earlier analysis still running");
        }
    }
}

impl EngineAdapter for FileModelAdapter {
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
        self.reap_jobs(Duration::ZERO);
        binding.writer.mark_started();
        self.turn = Some(PendingTurn {
            turn_id: binding.turn_id,
            context: binding.context,
            writer: Some(binding.writer),
        });
        self.outcome = None;
        self.state = AdapterState::Running;
        Ok(())
    }

    fn wait_for_completion(&mut self, timeout: Duration) -> Completion {
        if let Some(outcome) = self.outcome.clone() {
            return outcome;
        }
        let Some(turn) = self.turn.as_mut() else {
            return Completion::Failed("no turn was started".into());
        };
        let completion = match self.job.as_ref() {
            Some(job) => match job.done_rx.recv_timeout(timeout) {
                Ok(completion) => completion,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(engine = %self.name, ?timeout, "batch analysis still running");
                    Completion::Partial("timed out waiting for batch analysis".into())
                }
                Err(RecvTimeoutError::Disconnected) => {
                    Completion::Failed("batch worker exited without a result".into())
                }
            },
            None => {
                let completion = Completion::Failed("recording was never processed".into());
                if let Some(writer) = turn.writer.take() {
                    writer.complete(&completion);
                }
                completion
            }
        };
        self.outcome = Some(completion.clone());
        self.state = AdapterState::Completed;
        completion
    }

    fn stop(&mut self) {
        self.reap_jobs(STOP_GRACE);
        for job in self.overdue.drain(..) {
            warn!(engine = %self.name, "detaching analysis that outlived the adapter");
            drop(job.handle);
        }
        if let Some(writer) = self.turn.as_mut().and_then(|t| t.writer.take()) {
            writer.complete(&Completion::Partial("adapter stopped".into()));
        }
        if !self.stopped {
            debug!(engine = %self.name, "adapter stopped");
        }
        self.stopped = true;
        self.state = AdapterState::Stopped;
    }
}

impl BatchAdapter for FileModelAdapter {
    fn skip(&mut self, reason: &str) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let completion = Completion::Partial(reason.to_string());
        if let Some(writer) = turn.writer.take() {
            writer.complete(&completion);
        }
        debug!(engine = %self.name, turn_id = %turn.turn_id, reason, "batch skipped");
        self.outcome = Some(completion);
        self.state = AdapterState::Completed;
    }

    fn process_batch(&mut self, recording: &RecordingInfo) -> Result<()> {
        let Some(turn) = self.turn.as_mut() else {
            return Err(ChorusError::Engine(format!("{} has no active turn", self.name)));
        };
        let Some(writer) = turn.writer.take() else {
            return Err(ChorusError::Engine(format!(
                "{} already processed turn {}",
                self.name, turn.turn_id
            )));
        };

        let model = self.model.clone();
        let context = turn.context.clone();
        let path = recording.path.clone();
        let (done_tx, done_rx) = bounded(1);
        let span = info_span!("engine", engine = %self.name, turn_id = %turn.turn_id);
        let handle = worker::spawn(format!("chorus-{}-batch", self.name), move || {
            let _enter = span.enter();
            let completion = match model.0.lock().analyze(&path, &context) {
                Ok(output) => {
                    writer.set_output(output);
                    Completion::Ok
                }
                Err(e) => {
                    warn!("batch analysis failed: {e}");
                    Completion::Failed(e.to_string())
                }
            };
            writer.complete(&completion);
            info!(%completion, "batch analysis finished");
            let _ = done_tx.send(completion);
        })?;

        self.job = Some(Job { done_rx, handle });
        self.state = AdapterState::Draining;
        Ok(())
    }
}

impl Drop for FileModelAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::{Path, PathBuf};

    use crate::fanout::recording::RecordingSink;
    use crate::inference::{EngineOutput, FileModel, PronunciationScore};
    use crate::turn::{EngineStatus, ResultsContainer, TurnMetadata};

    struct SampleCounter {
        delay: Duration,
        fail: bool,
    }

    impl FileModel for SampleCounter {
        fn analyze(&mut self, recording: &Path, context: &TurnContext) -> Result<EngineOutput> {
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(ChorusError::Engine("scorer unavailable".into()));
            }
            let samples = hound::WavReader::open(recording)?.len();
            Ok(EngineOutput::Score(PronunciationScore {
                transcript: context.reference_text.clone(),
                completeness: Some(f64::from(samples) / 160.0),
                ..Default::default()
            }))
        }
    }

    fn metadata() -> TurnMetadata {
        TurnMetadata {
            language: "nl-NL".into(),
            chunk_duration_secs: 1.0,
            sample_rate: 16_000,
            samples: 0,
            aborted: false,
        }
    }

    fn bind(turn: &str) -> (ResultsContainer, TurnBinding) {
        let (container, mut writers) =
            ResultsContainer::new(TurnId::from(turn), "de kat", 16_000, ["scorer"]);
        let binding = TurnBinding {
            turn_id: TurnId::from(turn),
            sample_rate: 16_000,
            context: TurnContext {
                reference_text: "de kat".into(),
                language: "nl-NL".into(),
            },
            writer: writers.remove(0),
        };
        (container, binding)
    }

    fn recording(dir: &Path, samples: usize) -> RecordingInfo {
        let path: PathBuf = dir.join("turn.wav");
        let mut sink = RecordingSink::create(&path, 16_000).expect("create wav");
        sink.write(&vec![100i16; samples]).expect("write wav");
        sink.finalize().expect("finalize wav")
    }

    fn adapter(delay_ms: u64, fail: bool) -> FileModelAdapter {
        FileModelAdapter::new(
            "scorer",
            FileModelHandle::new(SampleCounter {
                delay: Duration::from_millis(delay_ms),
                fail,
            }),
        )
    }

    #[test]
    fn analyses_the_finalised_recording() {
        let dir = tempfile::tempdir().expect("tempdir");
        let info = recording(dir.path(), 1_600);
        let mut scorer = adapter(0, false);
        let (container, binding) = bind("t1");
        scorer.start(binding).expect("start");
        scorer.process_batch(&info).expect("process");
        assert_eq!(scorer.wait_for_completion(Duration::from_secs(5)), Completion::Ok);

        let results = container.seal(Some(info.path.clone()), metadata());
        match results.output("scorer") {
            Some(EngineOutput::Score(score)) => {
                assert_eq!(score.transcript, "de kat");
                assert_eq!(score.completeness, Some(10.0));
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn model_error_is_isolated_to_the_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let info = recording(dir.path(), 160);
        let mut scorer = adapter(0, true);
        let (container, binding) = bind("t2");
        scorer.start(binding).expect("start");
        scorer.process_batch(&info).expect("process");
        assert!(matches!(
            scorer.wait_for_completion(Duration::from_secs(5)),
            Completion::Failed(_)
        ));
        let results = container.seal(None, metadata());
        assert_eq!(results.status("scorer"), Some(EngineStatus::Failed));
        assert_eq!(results.output("scorer"), None);
    }

    #[test]
    fn slow_analysis_times_out_and_late_result_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let info = recording(dir.path(), 160);
        let mut scorer = adapter(300, false);
        let (container, binding) = bind("t3");
        scorer.start(binding).expect("start");
        scorer.process_batch(&info).expect("process");
        let completion = scorer.wait_for_completion(Duration::from_millis(20));
        assert!(matches!(completion, Completion::Partial(_)));
        container.resolve_pending("scorer", &completion);
        let results = container.seal(None, metadata());
        assert_eq!(results.status("scorer"), Some(EngineStatus::Partial));

        scorer.stop();
        assert_eq!(container.rejected_writes(), 2);
    }

    #[test]
    fn never_triggered_batch_fails() {
        let mut scorer = adapter(0, false);
        let (container, binding) = bind("t4");
        scorer.start(binding).expect("start");
        assert!(matches!(
            scorer.wait_for_completion(Duration::from_millis(10)),
            Completion::Failed(_)
        ));
        assert_eq!(container.seal(None, metadata()).status("scorer"), Some(EngineStatus::Failed));
    }

    #[test]
    fn overdue_analysis_does_not_hold_up_the_next_turn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let info = recording(dir.path(), 160);
        let mut scorer = adapter(2_500, false);
        let (first, binding) = bind("t7");
        scorer.start(binding).expect("start");
        scorer.process_batch(&info).expect("process");
        assert!(matches!(
            scorer.wait_for_completion(Duration::from_millis(50)),
            Completion::Partial(_)
        ));
        seal_as_partial(&first);

        let began = Instant::now();
        let (_second, binding) = bind("t8");
        scorer.start(binding).expect("start next turn");
        assert!(began.elapsed() < Duration::from_millis(500), "start waited for the old analysis");
        assert_eq!(scorer.state(), AdapterState::Running);
        assert_eq!(scorer.overdue_jobs(), 1);

        let stopping = Instant::now();
        scorer.stop();
        assert!(stopping.elapsed() < STOP_GRACE + Duration::from_millis(500));
        assert_eq!(scorer.state(), AdapterState::Stopped);
        assert_eq!(scorer.overdue_jobs(), 0);
    }

    fn seal_as_partial(container: &ResultsContainer) {
        container.resolve_pending("scorer", &Completion::Partial("timed out".into()));
        let results = container.seal(None, metadata());
        assert_eq!(results.status("scorer"), Some(EngineStatus::Partial));
    }

    #[test]
    fn skipped_turn_completes_without_analysis() {
        let mut scorer = adapter(0, false);
        let (container, binding) = bind("t9");
        scorer.start(binding).expect("start");
        scorer.skip("turn aborted");
        assert_eq!(scorer.state(), AdapterState::Completed);
        assert_eq!(
            scorer.wait_for_completion(Duration::from_millis(10)),
            Completion::Partial("turn aborted".into())
        );
        assert_eq!(container.seal(None, metadata()).status("scorer"), Some(EngineStatus::Partial));
    }

    #[test]
    fn second_trigger_in_one_turn_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let info = recording(dir.path(), 160);
        let mut scorer = adapter(0, false);
        let (_container, binding) = bind("t5");
        scorer.start(binding).expect("start");
        scorer.process_batch(&info).expect("process");
        assert!(scorer.process_batch(&info).is_err());
        scorer.stop();
        scorer.stop();
        assert_eq!(scorer.state(), AdapterState::Stopped);
        let (_c, binding) = bind("t6");
        assert!(scorer.start(binding).is_err());
    }
}
