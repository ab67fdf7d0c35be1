//! Stub engines that need no model files or network.
//!
//! They produce deterministic output from the audio they see, so the whole
//! fan-out, adapter and session machinery can be exercised end to end and the
//! `chorus` binary runs out of the box.

use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::buffering::chunk::ModelInput;
use crate::error::{ChorusError, Result};
use crate::inference::{
    EngineOutput, FileModel, PronunciationScore, RemoteEvent, RemoteEventSink, RemoteRecognizer,
    SpeechModel, StreamRequest, TurnContext, WordScore,
};
use crate::worker;

/// Chunks quieter than this RMS decode to nothing.
const SILENCE_RMS: f32 = 0.005;

const STUB_PHONEMES: [&str; 6] = ["a", "k", "t", "ə", "s", "n"];

/// Emits one placeholder phoneme per 100 ms of non-silent audio.
#[derive(Debug, Default)]
pub struct StubPhonemeModel {
    chunks_seen: u64,
}

impl SpeechModel for StubPhonemeModel {
    fn warm_up(&mut self) -> Result<()> {
        debug!("StubPhonemeModel::warm_up: no-op");
        Ok(())
    }

    fn transcribe(&mut self, input: &ModelInput) -> Result<String> {
        self.chunks_seen += 1;
        if input.rms() < SILENCE_RMS {
            return Ok(String::new());
        }
        let count = (input.samples.len() * 10 / input.sample_rate.max(1) as usize).max(1);
        let phonemes: Vec<&str> = (0..count)
            .map(|i| STUB_PHONEMES[(input.chunk_index + i) % STUB_PHONEMES.len()])
            .collect();
        Ok(phonemes.join(" "))
    }

    fn reset(&mut self) {
        self.chunks_seen = 0;
    }
}

/// Scores a recording against its reference sentence from duration alone.
///
/// Completeness assumes 0.4 s per reference word; every word gets the same
/// accuracy. Good enough to exercise score plumbing.
#[derive(Debug, Default)]
pub struct StubScorer;

const SECS_PER_WORD: f64 = 0.4;

impl FileModel for StubScorer {
    fn analyze(&mut self, recording: &Path, context: &TurnContext) -> Result<EngineOutput> {
        let reader = hound::WavReader::open(recording)?;
        let spec = reader.spec();
        if spec.channels != 1 || spec.bits_per_sample != 16 {
            return Err(ChorusError::Engine(format!(
                "expected mono 16-bit audio, got {} channels at {} bits",
                spec.channels, spec.bits_per_sample
            )));
        }
        let secs = f64::from(reader.duration()) / f64::from(spec.sample_rate.max(1));

        let words: Vec<&str> = context.reference_text.split_whitespace().collect();
        let expected = words.len() as f64 * SECS_PER_WORD;
        let completeness = if expected > 0.0 {
            (secs / expected * 100.0).min(100.0)
        } else {
            0.0
        };
        let accuracy = completeness.mul_add(0.5, 50.0);

        let score = PronunciationScore {
            transcript: context.reference_text.clone(),
            pronunciation: Some(accuracy),
            accuracy: Some(accuracy),
            fluency: Some(completeness),
            completeness: Some(completeness),
            prosody: None,
            words: words
                .iter()
                .enumerate()
                .map(|(i, word)| WordScore {
                    word: (*word).to_string(),
                    accuracy: Some(accuracy),
                    error_type: Some(if completeness < 50.0 { "Omission" } else { "None" }.into()),
                    offset_secs: Some(i as f64 * SECS_PER_WORD),
                    duration_secs: Some(SECS_PER_WORD),
                })
                .collect(),
        };
        Ok(EngineOutput::Score(score.clamped()))
    }
}

/// In-process stand-in for a push-stream recognition service.
///
/// Counts the audio it is sent and, after a simulated round trip, reports the
/// reference text (or a placeholder) followed by the end-of-stream signal.
pub struct LoopbackRecognizer {
    latency: Duration,
    connected: bool,
    stream: Option<OpenStream>,
    in_flight: Vec<JoinHandle<()>>,
}

struct OpenStream {
    request: StreamRequest,
    sink: RemoteEventSink,
    samples: u64,
}

impl LoopbackRecognizer {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            connected: false,
            stream: None,
            in_flight: Vec::new(),
        }
    }

    fn reap(&mut self) {
        let (done, pending): (Vec<_>, Vec<_>) =
            self.in_flight.drain(..).partition(JoinHandle::is_finished);
        self.in_flight = pending;
        for handle in done {
            worker::join_logged(handle);
        }
    }
}

impl RemoteRecognizer for LoopbackRecognizer {
    fn name(&self) -> &str {
        "loopback"
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn open_stream(&mut self, request: &StreamRequest, sink: RemoteEventSink) -> Result<()> {
        if !self.connected {
            return Err(ChorusError::Remote("loopback recognizer is not connected".into()));
        }
        self.reap();
        if let Some(previous) = self.stream.take() {
            debug!(turn_id = %previous.request.turn_id, "closing unfinished substream");
        }
        self.stream = Some(OpenStream {
            request: request.clone(),
            sink,
            samples: 0,
        });
        Ok(())
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ChorusError::Remote("no open substream".into()))?;
        stream.samples += samples.len() as u64;
        Ok(())
    }

    fn close_stream(&mut self) -> Result<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        let latency = self.latency;
        let name = format!("chorus-loopback-{}", stream.request.turn_id);
        let handle = worker::spawn(name, move || {
            std::thread::sleep(latency);
            let text = if stream.request.reference_text.is_empty() {
                format!("[loopback: {} samples]", stream.samples)
            } else {
                stream.request.reference_text.clone()
            };
            stream.sink.emit(RemoteEvent::Recognized {
                output: EngineOutput::Transcript(text),
            });
            stream.sink.emit(RemoteEvent::StreamFinished);
        })?;
        self.in_flight.push(handle);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.stream = None;
        for handle in self.in_flight.drain(..) {
            worker::join_logged(handle);
        }
        self.connected = false;
    }
}
