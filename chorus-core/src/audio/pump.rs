//! Capture pump: ring buffer → fixed-size [`Frame`]s → [`CaptureEvent`]s.
//!
//! ```text
//! cpal callback ─► SPSC ring ─► pump thread ─► CaptureEvent channel ─► drive_turn ─► TurnController
//!                               (frames, VAD auto-stop, max duration)
//! ```
//!
//! The pump owns the `!Send` cpal stream for its whole life. It reports the
//! device sample rate back before the first frame, so a turn can begin at the
//! rate the device actually delivers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::{AudioCapture, DeviceChoice};
use crate::buffering::{create_audio_ring, AudioConsumer, Consumer};
use crate::error::{ChorusError, Result};
use crate::fanout::Frame;
use crate::turn::{TurnController, TurnResults};
use crate::vad::{EnergyVad, VoiceActivityDetector};
use crate::worker;

/// Sleep when the ring is empty.
const EMPTY_SLEEP: Duration = Duration::from_millis(5);

/// Samples popped from the ring per iteration.
const POP_CHUNK: usize = 4_096;

/// How long `CaptureSession::start` waits for the device to open.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureConfig {
    /// Preferred input device name; `None` picks the default device.
    pub device: Option<String>,
    /// Rate to capture at when a device offers it; `None` takes the device
    /// default. Default: 16 kHz.
    pub sample_rate: Option<u32>,
    /// Channels to ask the device for before down-mixing. Default: 1.
    pub channels: u16,
    /// Frame duration published to the turn. Default: 20 ms.
    pub frame_ms: u32,
    /// End the turn after this much silence following speech.
    pub silence_timeout_ms: Option<u64>,
    /// End the turn after this much audio regardless of speech.
    pub max_duration_ms: Option<u64>,
    /// Normalised RMS speech threshold for auto-stop.
    pub vad_threshold: f32,
    pub vad_hangover_frames: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: Some(16_000),
            channels: 1,
            frame_ms: 20,
            silence_timeout_ms: Some(1_500),
            max_duration_ms: Some(30_000),
            vad_threshold: 0.02,
            vad_hangover_frames: 8,
        }
    }
}

impl CaptureConfig {
    pub fn frame_samples(&self, sample_rate: u32) -> usize {
        (sample_rate as u64 * u64::from(self.frame_ms.max(1)) / 1_000).max(1) as usize
    }
}

/// Why the pump ended the turn on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    /// Silence after speech exceeded the timeout.
    Silence,
    MaxDuration,
    /// The caller asked the session to stop.
    Requested,
}

#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// First event of a session: the device that was opened.
    Opened(DeviceChoice),
    Frame(Frame),
    /// Last event of a healthy session. Remaining audio was sent first.
    Stopped(StopReason),
    /// The device reported an error; no further frames follow.
    Failed(String),
}

/// Slices an arbitrary sample stream into frames of a fixed length.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Append samples and return every completed frame.
    pub fn push(&mut self, samples: &[i16]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_samples - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_samples {
                frames.push(Frame::from(std::mem::take(&mut self.pending)));
                self.pending.reserve(self.frame_samples);
            }
        }
        frames
    }

    /// The short remainder, if any.
    pub fn flush(&mut self) -> Option<Frame> {
        if self.pending.is_empty() {
            None
        } else {
            Some(Frame::from(std::mem::take(&mut self.pending)))
        }
    }
}

/// Decides when a live turn should end without the caller asking.
///
/// Silence only counts once speech has been heard, so a speaker who takes a
/// moment to begin is not cut off.
pub struct AutoStop {
    vad: Box<dyn VoiceActivityDetector>,
    silence_limit: Option<u64>,
    max_samples: Option<u64>,
    heard_speech: bool,
    silent_samples: u64,
    samples: u64,
}

impl AutoStop {
    pub fn new(config: &CaptureConfig, sample_rate: u32) -> Self {
        let to_samples = |ms: u64| ms * u64::from(sample_rate) / 1_000;
        Self {
            vad: Box::new(EnergyVad::new(config.vad_threshold, config.vad_hangover_frames)),
            silence_limit: config.silence_timeout_ms.map(to_samples),
            max_samples: config.max_duration_ms.map(to_samples),
            heard_speech: false,
            silent_samples: 0,
            samples: 0,
        }
    }

    pub fn observe(&mut self, frame: &[i16]) -> Option<StopReason> {
        self.samples += frame.len() as u64;
        if self.vad.classify(frame).is_speech() {
            self.heard_speech = true;
            self.silent_samples = 0;
        } else if self.heard_speech {
            self.silent_samples += frame.len() as u64;
        }

        if self.max_samples.is_some_and(|max| self.samples >= max) {
            return Some(StopReason::MaxDuration);
        }
        match self.silence_limit {
            Some(limit) if self.heard_speech && self.silent_samples >= limit => {
                Some(StopReason::Silence)
            }
            _ => None,
        }
    }
}

/// Cloneable request to end a capture session.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct PumpContext {
    consumer: AudioConsumer,
    running: Arc<AtomicBool>,
    device_errors: Receiver<String>,
    events: Sender<CaptureEvent>,
    assembler: FrameAssembler,
    auto_stop: AutoStop,
}

/// Drain the ring until stopped, an auto-stop fires, or the device fails.
fn run_pump(mut ctx: PumpContext) {
    let mut raw = vec![0i16; POP_CHUNK];
    let mut published = 0u64;

    let send = |event: CaptureEvent| ctx.events.send(event).is_ok();

    let outcome = 'pump: loop {
        if let Ok(reason) = ctx.device_errors.try_recv() {
            break CaptureEvent::Failed(reason);
        }
        let stopping = !ctx.running.load(Ordering::SeqCst);

        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            if stopping {
                if let Some(tail) = ctx.assembler.flush() {
                    published += tail.len() as u64;
                    if !send(CaptureEvent::Frame(tail)) {
                        return;
                    }
                }
                break CaptureEvent::Stopped(StopReason::Requested);
            }
            std::thread::sleep(EMPTY_SLEEP);
            continue;
        }

        for frame in ctx.assembler.push(&raw[..n]) {
            let verdict = ctx.auto_stop.observe(&frame);
            published += frame.len() as u64;
            if !send(CaptureEvent::Frame(frame)) {
                debug!("capture receiver dropped; pump exiting");
                return;
            }
            if let Some(reason) = verdict {
                break 'pump CaptureEvent::Stopped(reason);
            }
        }
    };

    ctx.running.store(false, Ordering::SeqCst);
    info!(samples = published, ?outcome, "capture pump finished");
    let _ = ctx.events.send(outcome);
}

/// A live microphone capture feeding one turn.
pub struct CaptureSession {
    running: Arc<AtomicBool>,
    device: DeviceChoice,
    events: Receiver<CaptureEvent>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureSession {
    /// Open the input device on a pump thread and start producing frames.
    ///
    /// # Errors
    /// Device open failures, or the pump not reporting back in time.
    pub fn start(config: &CaptureConfig) -> Result<Self> {
        let (producer, consumer) = create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let (open_tx, open_rx) = bounded::<Result<DeviceChoice>>(1);
        let (events_tx, events_rx) = unbounded();
        let (errors_tx, errors_rx) = bounded(4);

        let pump_running = Arc::clone(&running);
        let config = config.clone();
        let handle = worker::spawn("chorus-capture", move || {
            let capture = match AudioCapture::open(producer, Arc::clone(&pump_running), &config, errors_tx)
            {
                Ok(c) => {
                    let _ = open_tx.send(Ok(c.device.clone()));
                    c
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
            let sample_rate = capture.device.sample_rate;
            let _ = events_tx.send(CaptureEvent::Opened(capture.device.clone()));
            run_pump(PumpContext {
                consumer,
                running: pump_running,
                device_errors: errors_rx,
                events: events_tx,
                assembler: FrameAssembler::new(config.frame_samples(sample_rate)),
                auto_stop: AutoStop::new(&config, sample_rate),
            });
            capture.stop();
            // Stream drops here, releasing the audio device on this thread.
            drop(capture);
        })?;

        let opened = open_rx.recv_timeout(OPEN_TIMEOUT).map_err(|_| {
            running.store(false, Ordering::SeqCst);
            ChorusError::AudioStream("capture thread did not report device open".into())
        });
        match opened.and_then(|r| r) {
            Ok(device) => {
                info!(
                    device = %device.name,
                    sample_rate = device.sample_rate,
                    matched = device.matched,
                    "capture started"
                );
                Ok(Self {
                    running,
                    device,
                    events: events_rx,
                    handle: Some(handle),
                })
            }
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                worker::join_logged(handle);
                Err(e)
            }
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.device.sample_rate
    }

    /// The device opened and the format it delivers.
    pub fn device(&self) -> &DeviceChoice {
        &self.device
    }

    pub fn events(&self) -> &Receiver<CaptureEvent> {
        &self.events
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.running))
    }

    /// Stop capturing and join the pump. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            // The pump blocks on nothing but the unbounded event channel.
            worker::join_logged(handle);
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run one turn on `controller` from a stream of capture events.
///
/// Returns the sealed results once the producer stops. A producer failure
/// aborts the turn and is returned as an error; when no audio was published
/// at all, the empty recording is deleted.
pub fn drive_turn(
    controller: &mut TurnController,
    reference_text: &str,
    sample_rate: u32,
    events: &Receiver<CaptureEvent>,
) -> Result<TurnResults> {
    let turn_id = controller.begin(reference_text, sample_rate)?;
    loop {
        let failure = match events.recv() {
            Ok(CaptureEvent::Opened(device)) => {
                if device.sample_rate != sample_rate {
                    warn!(%turn_id, device_rate = device.sample_rate, sample_rate, "device rate differs from the turn");
                }
                debug!(%turn_id, device = %device.name, "capture device open");
                continue;
            }
            Ok(CaptureEvent::Frame(frame)) => match controller.publish(frame) {
                Ok(()) => continue,
                Err(e) => e.to_string(),
            },
            Ok(CaptureEvent::Stopped(reason)) => {
                info!(%turn_id, ?reason, "capture stopped");
                return controller.stop();
            }
            Ok(CaptureEvent::Failed(reason)) => reason,
            Err(_) => "capture pump exited without stopping".to_string(),
        };

        warn!(%turn_id, "producer failed: {failure}");
        let outcome = if controller.published_samples() == 0 {
            controller.abandon(&failure)
        } else {
            controller.abort()
        };
        if let Err(e) = outcome {
            warn!(%turn_id, "closing failed turn: {e}");
        }
        return Err(ChorusError::AudioStream(failure));
    }
}
