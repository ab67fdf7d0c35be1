//! Streaming adapter for push-stream remote recognizers.
//!
//! ```text
//! queue ─► feed thread ─► RemoteRecognizer::write ··· network ···┐
//!            └ end marker ─► close_stream                        │
//!                                                                ▼
//! TurnGate ◄── event pump thread ◄── TaggedEvent{turn_id, event} ◄┘
//!    └ current turn only; others discarded and counted
//! ```
//!
//! The connection is kept warm across turns. Each turn opens a substream
//! bound to the new turn id; if that fails the connection is rebuilt through
//! the factory once, and if that also fails the engine reports `Failed` for
//! the turn while the session carries on.
//!
//! Completion for a turn is reached when the recognized-result counter moves
//! past the baseline snapshotted at `start`, or when the service signals the
//! end of the substream. After the counter moves the adapter still waits a
//! short settle window for the end signal, so results that arrive in quick
//! succession are not split across turns.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, info_span, warn};

use crate::adapter::feed::{await_ack, run_turn_loop, AckWait, Control, TurnAck, TurnHandler};
use crate::adapter::{AdapterState, Completion, EngineAdapter, StreamingAdapter, TurnBinding};
use crate::error::{ChorusError, Result};
use crate::fanout::{ConsumerHandle, TurnEnd};
use crate::inference::{
    RecognizerFactory, RemoteEvent, RemoteEventSink, RemoteRecognizer, StreamRequest, TaggedEvent,
};
use crate::turn::{SlotWriter, TurnId};
use crate::worker;

type SharedRecognizer = Arc<Mutex<Box<dyn RemoteRecognizer>>>;

// ---------------------------------------------------------------------------
// Turn gate
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GateState {
    current: Option<TurnId>,
    writer: Option<SlotWriter>,
    /// Lifetime count of recognized events accepted for any turn.
    recognized: u64,
    baseline: u64,
    final_signal: bool,
    canceled: Option<String>,
    failed: Option<String>,
    aborted: bool,
    bytes_pushed: u64,
    discarded: u64,
}

impl GateState {
    fn advanced(&self) -> bool {
        self.recognized > self.baseline
    }
}

#[derive(Default)]
struct TurnGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl TurnGate {
    fn begin(&self, turn_id: TurnId, writer: SlotWriter) {
        let mut st = self.state.lock();
        st.current = Some(turn_id);
        st.writer = Some(writer);
        st.baseline = st.recognized;
        st.final_signal = false;
        st.canceled = None;
        st.failed = None;
        st.aborted = false;
        st.bytes_pushed = 0;
    }

    fn apply(&self, tagged: TaggedEvent) {
        let mut st = self.state.lock();
        if st.current.as_ref() != Some(&tagged.turn_id) {
            st.discarded += 1;
            debug!(
                event_turn = %tagged.turn_id,
                current = ?st.current,
                discarded = st.discarded,
                "discarding event for another turn"
            );
            return;
        }
        match tagged.event {
            RemoteEvent::Recognizing { text } => {
                debug!(%text, "interim hypothesis");
                return;
            }
            RemoteEvent::Recognized { output } => {
                st.recognized += 1;
                if let Some(writer) = st.writer.as_ref() {
                    writer.append(output);
                }
            }
            RemoteEvent::StreamFinished => st.final_signal = true,
            RemoteEvent::Canceled { reason } => {
                warn!(%reason, "remote substream canceled");
                st.canceled = Some(reason);
                st.final_signal = true;
            }
        }
        self.changed.notify_all();
    }

    fn add_bytes(&self, bytes: u64) {
        self.state.lock().bytes_pushed += bytes;
    }

    fn mark_aborted(&self) {
        self.state.lock().aborted = true;
        self.changed.notify_all();
    }

    fn fail(&self, reason: String) {
        self.state.lock().failed = Some(reason);
        self.changed.notify_all();
    }

    /// Wait for the current turn to complete, then close the gate so any
    /// later event for it is discarded.
    fn complete(&self, deadline: Instant, settle: Duration) -> (Completion, Option<SlotWriter>) {
        let mut st = self.state.lock();
        let completion = if let Some(reason) = st.failed.clone() {
            Completion::Failed(reason)
        } else if st.aborted {
            Completion::Partial("turn aborted".into())
        } else if st.bytes_pushed == 0 {
            // Nothing was streamed, so the service has nothing to report.
            Completion::Ok
        } else {
            while !(st.advanced() || st.final_signal) {
                if self.changed.wait_until(&mut st, deadline).timed_out() {
                    break;
                }
            }
            if st.advanced() && !st.final_signal {
                let settle_deadline = (Instant::now() + settle).min(deadline);
                while !st.final_signal {
                    if self.changed.wait_until(&mut st, settle_deadline).timed_out() {
                        break;
                    }
                }
            }
            match (&st.canceled, st.advanced(), st.final_signal) {
                (Some(reason), true, _) => Completion::Partial(reason.clone()),
                (Some(reason), false, _) => Completion::Failed(reason.clone()),
                (None, true, _) | (None, false, true) => Completion::Ok,
                (None, false, false) => {
                    Completion::Partial("timed out waiting for final result".into())
                }
            }
        };
        st.current = None;
        (completion, st.writer.take())
    }

    fn close(&self) -> Option<SlotWriter> {
        let mut st = self.state.lock();
        st.current = None;
        st.writer.take()
    }

    fn discarded(&self) -> u64 {
        self.state.lock().discarded
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct RemoteStreamAdapter {
    name: String,
    factory: RecognizerFactory,
    recognizer: SharedRecognizer,
    gate: Arc<TurnGate>,
    events_tx: Sender<TaggedEvent>,
    settle: Duration,
    liveness: Duration,
    state: AdapterState,
    control_tx: Option<Sender<Control<FeedTurn>>>,
    ack_rx: Option<Receiver<TurnAck>>,
    feeder: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    pump_stop_tx: Option<Sender<()>>,
    current: Option<TurnId>,
    fed: bool,
    outcome: Option<Completion>,
    reconnects: u32,
    stopped: bool,
}

impl RemoteStreamAdapter {
    /// Build the recognizer through `factory`, connect it and start the event
    /// pump.
    pub fn new(
        name: impl Into<String>,
        factory: RecognizerFactory,
        settle: Duration,
        liveness: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let mut recognizer = factory()?;
        recognizer.connect()?;
        info!(engine = %name, service = recognizer.name(), "remote recognizer connected");

        let gate = Arc::new(TurnGate::default());
        let (events_tx, events_rx) = unbounded::<TaggedEvent>();
        let (pump_stop_tx, pump_stop_rx) = bounded::<()>(1);
        let pump_gate = Arc::clone(&gate);
        let span = info_span!("engine", engine = %name);
        let pump = worker::spawn(format!("chorus-{name}-events"), move || {
            let _enter = span.enter();
            loop {
                select! {
                    recv(events_rx) -> ev => match ev {
                        Ok(tagged) => pump_gate.apply(tagged),
                        Err(_) => break,
                    },
                    recv(pump_stop_rx) -> _ => break,
                }
            }
            debug!("event pump exited");
        })?;

        Ok(Self {
            name,
            factory,
            recognizer: Arc::new(Mutex::new(recognizer)),
            gate,
            events_tx,
            settle,
            liveness,
            state: AdapterState::Idle,
            control_tx: None,
            ack_rx: None,
            feeder: None,
            pump: Some(pump),
            pump_stop_tx: Some(pump_stop_tx),
            current: None,
            fed: false,
            outcome: None,
            reconnects: 0,
            stopped: false,
        })
    }

    /// Events dropped because they belonged to a turn other than the current one.
    pub fn discarded_events(&self) -> u64 {
        self.gate.discarded()
    }

    /// How many times the connection was rebuilt after a failed re-arm.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Open the per-turn substream, rebuilding the connection once on failure.
    fn arm(&mut self, request: &StreamRequest) -> Result<()> {
        let sink = RemoteEventSink::new(request.turn_id.clone(), self.events_tx.clone());
        let first = self.recognizer.lock().open_stream(request, sink.clone());
        let Err(e) = first else {
            return Ok(());
        };
        warn!(engine = %self.name, "re-arm failed ({e}), rebuilding connection");
        let mut fresh = (self.factory)()?;
        fresh.connect()?;
        {
            let mut guard = self.recognizer.lock();
            guard.shutdown();
            *guard = fresh;
        }
        self.reconnects += 1;
        self.recognizer.lock().open_stream(request, sink)
    }

    fn collect_ack(&mut self, timeout: Duration) -> bool {
        if self.fed {
            return true;
        }
        let (Some(ack_rx), Some(current)) = (self.ack_rx.as_ref(), self.current.as_ref()) else {
            return false;
        };
        match await_ack(ack_rx, current, timeout) {
            AckWait::Acked(_) => {
                self.fed = true;
                true
            }
            AckWait::TimedOut => false,
            AckWait::Disconnected => {
                self.gate.fail("feed thread exited".into());
                self.fed = true;
                true
            }
        }
    }
}

impl EngineAdapter for RemoteStreamAdapter {
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
        if self.control_tx.is_none() {
            return Err(ChorusError::Engine(format!("{} has no queue attached", self.name)));
        }
        // A turn left open by a skipped wait is closed before the next one.
        if let Some(writer) = self.gate.close() {
            writer.complete(&Completion::Partial("superseded by a new turn".into()));
        }

        binding.writer.mark_started();
        let request = StreamRequest {
            turn_id: binding.turn_id.clone(),
            sample_rate: binding.sample_rate,
            reference_text: binding.context.reference_text,
            language: binding.context.language,
        };
        self.gate.begin(binding.turn_id.clone(), binding.writer);

        let live = match self.arm(&request) {
            Ok(()) => true,
            Err(e) => {
                warn!(engine = %self.name, turn_id = %request.turn_id, "substream unavailable: {e}");
                self.gate.fail(format!("substream unavailable: {e}"));
                false
            }
        };

        let sent = self.control_tx.as_ref().is_some_and(|tx| {
            tx.send(Control::Begin(FeedTurn {
                turn_id: request.turn_id.clone(),
                live,
            }))
            .is_ok()
        });
        if !sent {
            return Err(ChorusError::Engine(format!("{} feed thread is gone", self.name)));
        }

        debug!(engine = %self.name, turn_id = %request.turn_id, live, "turn armed");
        self.current = Some(request.turn_id);
        self.fed = false;
        self.outcome = None;
        self.state = AdapterState::Running;
        Ok(())
    }

    fn wait_for_completion(&mut self, timeout: Duration) -> Completion {
        if self.current.is_none() {
            return Completion::Failed("no turn was started".into());
        }
        if let Some(outcome) = self.outcome.clone() {
            return outcome;
        }
        let deadline = Instant::now() + timeout;
        if !self.collect_ack(timeout) {
            warn!(engine = %self.name, "audio feed did not drain before the deadline");
        }
        self.state = AdapterState::Draining;
        let (completion, writer) = self.gate.complete(deadline, self.settle);
        if let Some(writer) = writer {
            writer.complete(&completion);
        }
        if !completion.is_ok() {
            warn!(engine = %self.name, %completion, "remote turn incomplete");
        }
        self.outcome = Some(completion.clone());
        self.state = AdapterState::Completed;
        completion
    }

    fn stop(&mut self) {
        if let Some(tx) = self.control_tx.take() {
            let _ = tx.send(Control::Shutdown);
        }
        if let Some(handle) = self.feeder.take() {
            worker::join_logged(handle);
        }
        if !self.stopped {
            self.recognizer.lock().shutdown();
        }
        if let Some(tx) = self.pump_stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.pump.take() {
            worker::join_logged(handle);
        }
        if let Some(writer) = self.gate.close() {
            writer.complete(&Completion::Partial("adapter stopped".into()));
        }
        if !self.stopped {
            info!(engine = %self.name, "adapter stopped");
        }
        self.ack_rx = None;
        self.stopped = true;
        self.state = AdapterState::Stopped;
    }
}

impl StreamingAdapter for RemoteStreamAdapter {
    fn attach(&mut self, queue: ConsumerHandle) -> Result<()> {
        if self.feeder.is_some() || self.stopped {
            return Err(ChorusError::Engine(format!("{} cannot be attached again", self.name)));
        }
        let (control_tx, control_rx) = unbounded();
        let (ack_tx, ack_rx) = unbounded();
        let mut handler = FeedWorker {
            recognizer: Arc::clone(&self.recognizer),
            gate: Arc::clone(&self.gate),
            ack_tx,
            active: None,
        };
        let liveness = self.liveness;
        let span = info_span!("engine", engine = %self.name);
        let handle = worker::spawn(format!("chorus-{}-feed", self.name), move || {
            let _enter = span.enter();
            run_turn_loop(&queue, &control_rx, liveness, &mut handler);
        })?;
        self.control_tx = Some(control_tx);
        self.ack_rx = Some(ack_rx);
        self.feeder = Some(handle);
        Ok(())
    }

    fn wait_end_of_turn(&mut self, timeout: Duration) -> bool {
        if self.state == AdapterState::Running {
            self.state = AdapterState::Draining;
        }
        self.collect_ack(timeout)
    }
}

impl Drop for RemoteStreamAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Feed thread
// ---------------------------------------------------------------------------

struct FeedTurn {
    turn_id: TurnId,
    /// `false` when the substream could not be opened; frames are drained only.
    live: bool,
}

struct ActiveFeed {
    turn_id: TurnId,
    live: bool,
    write_errors: usize,
}

struct FeedWorker {
    recognizer: SharedRecognizer,
    gate: Arc<TurnGate>,
    ack_tx: Sender<TurnAck>,
    active: Option<ActiveFeed>,
}

impl FeedWorker {
    fn close(&mut self, completion: Completion) {
        let Some(feed) = self.active.take() else {
            return;
        };
        if feed.live {
            if let Err(e) = self.recognizer.lock().close_stream() {
                warn!(turn_id = %feed.turn_id, "closing substream failed: {e}");
            }
        }
        let _ = self.ack_tx.send(TurnAck {
            turn_id: feed.turn_id,
            completion,
        });
    }
}

impl TurnHandler for FeedWorker {
    type Turn = FeedTurn;

    fn begin(&mut self, turn: FeedTurn) -> bool {
        self.active = Some(ActiveFeed {
            turn_id: turn.turn_id,
            live: turn.live,
            write_errors: 0,
        });
        true
    }

    fn frame(&mut self, frame: &[i16]) {
        let Some(feed) = self.active.as_mut() else {
            return;
        };
        if !feed.live {
            return;
        }
        match self.recognizer.lock().write(frame) {
            Ok(()) => self.gate.add_bytes(frame.len() as u64 * 2),
            Err(e) => {
                feed.write_errors += 1;
                if feed.write_errors == 1 {
                    warn!(turn_id = %feed.turn_id, "push stream write failed: {e}");
                }
            }
        }
    }

    fn end(&mut self, end: TurnEnd) {
        if end == TurnEnd::Aborted {
            self.gate.mark_aborted();
        }
        let completion = match self.active.as_ref() {
            Some(feed) if feed.write_errors > 0 => {
                Completion::Partial(format!("{} writes failed", feed.write_errors))
            }
            _ => Completion::Ok,
        };
        self.close(completion);
    }

    fn abandon(&mut self, reason: &str) {
        self.close(Completion::Partial(reason.to_string()));
    }
}
