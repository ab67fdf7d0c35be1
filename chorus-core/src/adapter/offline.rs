//! Offline renditions of the streaming engines.
//!
//! An engine configured as non-realtime does not read the live queue; it
//! runs once on the finalised recording, behind a [`FileModelAdapter`]. The
//! two models here replay that recording through the same backends the
//! streaming adapters drive:
//!
//! - [`ChunkedFileModel`]: chunks the file and decodes it with a
//!   [`SpeechModel`](crate::inference::SpeechModel).
//! - [`RecognizerFileModel`]: pushes the file through a one-shot substream
//!   of a [`RemoteRecognizer`] and collects what it reports.
//!
//! [`FileModelAdapter`]: crate::adapter::FileModelAdapter

use std::path::Path;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::adapter::ChunkOutput;
use crate::buffering::chunker::chunk_samples_for;
use crate::buffering::ChunkingBuffer;
use crate::error::{ChorusError, Result};
use crate::inference::{
    EngineOutput, FileModel, ModelHandle, RecognizerFactory, RemoteEvent, RemoteEventSink,
    RemoteRecognizer, StreamRequest, TurnContext,
};
use crate::turn::TurnId;

/// Read a mono 16-bit WAV file.
fn read_mono_wav(path: &Path) -> Result<(u32, Vec<i16>)> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 {
        return Err(ChorusError::Engine(format!(
            "expected mono 16-bit audio, got {} channels at {} bits",
            spec.channels, spec.bits_per_sample
        )));
    }
    let samples = reader.into_samples::<i16>().collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((spec.sample_rate, samples))
}

/// Turn id a recording belongs to; recordings are named `<turn id>.wav`.
fn turn_of(recording: &Path) -> TurnId {
    recording
        .file_stem()
        .map(|stem| TurnId::from(stem.to_string_lossy().into_owned()))
        .unwrap_or_else(TurnId::generate)
}

/// Decodes a whole recording chunk by chunk with a chunk-at-a-time model.
pub struct ChunkedFileModel {
    model: ModelHandle,
    chunk_duration: Duration,
    output: ChunkOutput,
    warmed: bool,
}

impl ChunkedFileModel {
    pub fn new(model: ModelHandle, chunk_duration: Duration) -> Self {
        Self {
            model,
            chunk_duration,
            output: ChunkOutput::default(),
            warmed: false,
        }
    }

    pub fn with_output(mut self, output: ChunkOutput) -> Self {
        self.output = output;
        self
    }
}

impl FileModel for ChunkedFileModel {
    fn analyze(&mut self, recording: &Path, _context: &TurnContext) -> Result<EngineOutput> {
        let (sample_rate, samples) = read_mono_wav(recording)?;
        let mut model = self.model.0.lock();
        if !self.warmed {
            model.warm_up()?;
            self.warmed = true;
        }
        model.reset();
        let mut chunker = ChunkingBuffer::new(sample_rate, model.sample_rate(), self.chunk_duration)?;

        let mut chunks = chunker.feed(&samples);
        chunks.extend(chunker.finish());

        let mut output = self.output.empty();
        let mut errors = 0usize;
        for chunk in &chunks {
            let input = chunker.to_model_input(chunk);
            match model.transcribe(&input) {
                Ok(text) if text.trim().is_empty() => {}
                Ok(text) => output.merge(self.output.for_chunk(text.trim(), chunk)),
                Err(e) => {
                    errors += 1;
                    warn!(chunk = input.chunk_index, "inference failed: {e}");
                }
            }
        }
        if errors > 0 && errors == chunks.len() {
            return Err(ChorusError::Engine(format!("all {errors} chunks failed to decode")));
        }
        debug!(chunks = chunks.len(), errors, "recording decoded");
        Ok(output)
    }
}

/// Pushes a whole recording through a remote recognizer and waits for its
/// final results.
pub struct RecognizerFileModel {
    factory: RecognizerFactory,
    recognizer: Option<Box<dyn RemoteRecognizer>>,
    result_timeout: Duration,
    write_duration: Duration,
}

impl RecognizerFileModel {
    /// The connection is made on first use and kept for later turns.
    pub fn new(factory: RecognizerFactory, result_timeout: Duration) -> Self {
        Self {
            factory,
            recognizer: None,
            result_timeout,
            write_duration: Duration::from_millis(100),
        }
    }

    fn connected(&mut self) -> Result<&mut Box<dyn RemoteRecognizer>> {
        if self.recognizer.is_none() {
            let mut recognizer = (self.factory)()?;
            recognizer.connect()?;
            info!(service = recognizer.name(), "offline recognizer connected");
            self.recognizer = Some(recognizer);
        }
        self.recognizer
            .as_mut()
            .ok_or_else(|| ChorusError::Remote("recognizer unavailable".into()))
    }

    fn recognize(&mut self, recording: &Path, context: &TurnContext) -> Result<EngineOutput> {
        let (sample_rate, samples) = read_mono_wav(recording)?;
        let request = StreamRequest {
            turn_id: turn_of(recording),
            sample_rate,
            reference_text: context.reference_text.clone(),
            language: context.language.clone(),
        };
        let piece = chunk_samples_for(sample_rate, self.write_duration).max(1);
        let timeout = self.result_timeout;

        let (tx, rx) = unbounded();
        let recognizer = self.connected()?;
        recognizer.open_stream(&request, RemoteEventSink::new(request.turn_id.clone(), tx))?;
        for part in samples.chunks(piece) {
            recognizer.write(part)?;
        }
        recognizer.close_stream()?;

        let deadline = Instant::now() + timeout;
        let mut output: Option<EngineOutput> = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let tagged = match rx.recv_timeout(remaining) {
                Ok(tagged) => tagged,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ChorusError::Remote(format!(
                        "no end of stream within {timeout:?}"
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if tagged.turn_id != request.turn_id {
                continue;
            }
            match tagged.event {
                RemoteEvent::Recognizing { .. } => {}
                RemoteEvent::Recognized { output: next } => match output.as_mut() {
                    Some(acc) => acc.merge(next),
                    None => output = Some(next),
                },
                RemoteEvent::StreamFinished => break,
                RemoteEvent::Canceled { reason } => return Err(ChorusError::Remote(reason)),
            }
        }
        output.ok_or_else(|| ChorusError::Remote("service reported no result".into()))
    }
}

impl FileModel for RecognizerFileModel {
    fn analyze(&mut self, recording: &Path, context: &TurnContext) -> Result<EngineOutput> {
        let result = self.recognize(recording, context);
        if let Err(e) = &result {
            warn!("offline recognition failed, reconnecting next turn: {e}");
            if let Some(mut recognizer) = self.recognizer.take() {
                recognizer.shutdown();
            }
        }
        result
    }
}

impl Drop for RecognizerFileModel {
    fn drop(&mut self) {
        if let Some(mut recognizer) = self.recognizer.take() {
            recognizer.shutdown();
        }
    }
}
