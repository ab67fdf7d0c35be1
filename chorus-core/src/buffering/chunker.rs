//! Duration-based chunking buffer used by streaming engine adapters.
//!
//! ```text
//! feed(frame) ──► pending i16 ──► ≥ chunk_samples? ──► slice one chunk
//!                                                      │
//!                                  normalise (÷32768) + resample to engine rate
//!                                                      │
//!                                                 ModelInput
//! finish() ──► remainder (if any) ──► one final short ModelInput
//! ```
//!
//! Samples are kept as i16 until a chunk leaves the buffer, so rounding never
//! compounds across chunk boundaries.

use std::time::Duration;

use crate::audio::resample::{RateConverter, DEFAULT_BLOCK};
use crate::buffering::chunk::{normalize_i16, AudioChunk, ModelInput};
use crate::error::{ChorusError, Result};

/// Number of source samples in one chunk of `duration` at `sample_rate`.
pub fn chunk_samples_for(sample_rate: u32, duration: Duration) -> usize {
    ((sample_rate as f64 * duration.as_secs_f64()).round() as usize).max(1)
}

pub struct ChunkingBuffer {
    chunk_samples: usize,
    sample_rate: u32,
    pending: Vec<i16>,
    /// Samples already sliced off into chunks during this turn.
    consumed: u64,
    next_index: usize,
    converter: RateConverter,
}

impl ChunkingBuffer {
    /// Create a buffer slicing `chunk_duration` of audio at `sample_rate`,
    /// emitting model input at `target_rate`.
    pub fn new(sample_rate: u32, target_rate: u32, chunk_duration: Duration) -> Result<Self> {
        if sample_rate == 0 {
            return Err(ChorusError::InvalidSampleRate(sample_rate));
        }
        let chunk_samples = chunk_samples_for(sample_rate, chunk_duration);
        Ok(Self {
            chunk_samples,
            sample_rate,
            pending: Vec::with_capacity(chunk_samples),
            consumed: 0,
            next_index: 0,
            converter: RateConverter::new(sample_rate, target_rate, DEFAULT_BLOCK)?,
        })
    }

    pub fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.converter.target_rate()
    }

    /// Samples waiting for the next chunk boundary.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Accumulate samples; return every full chunk that became available.
    pub fn feed(&mut self, samples: &[i16]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(samples);
        let mut ready = Vec::new();
        while self.pending.len() >= self.chunk_samples {
            let rest = self.pending.split_off(self.chunk_samples);
            let chunk = std::mem::replace(&mut self.pending, rest);
            ready.push(self.make_chunk(chunk, false));
        }
        ready
    }

    /// Flush the remainder (shorter than one chunk) at end of turn.
    ///
    /// Returns `None` when the stream ended exactly on a chunk boundary.
    /// Resets the turn-relative counters either way.
    pub fn finish(&mut self) -> Option<AudioChunk> {
        let tail = if self.pending.is_empty() {
            None
        } else {
            let rest = std::mem::take(&mut self.pending);
            Some(self.make_chunk(rest, true))
        };
        self.consumed = 0;
        self.next_index = 0;
        tail
    }

    /// Discard everything buffered (aborted turn or turn change).
    pub fn clear(&mut self) {
        self.pending.clear();
        self.consumed = 0;
        self.next_index = 0;
    }

    /// Convert a chunk to the engine's input format. This is the only place
    /// where samples become floating point.
    pub fn to_model_input(&mut self, chunk: &AudioChunk) -> ModelInput {
        let normalized = normalize_i16(&chunk.samples);
        ModelInput {
            samples: self.converter.convert(&normalized),
            sample_rate: self.converter.target_rate(),
            chunk_index: chunk.index,
            offset_secs: chunk.offset_secs(),
            source_samples: chunk.samples.len(),
            is_final_short: chunk.is_final_short,
        }
    }

    fn make_chunk(&mut self, samples: Vec<i16>, is_final_short: bool) -> AudioChunk {
        let chunk = AudioChunk {
            offset_samples: self.consumed,
            index: self.next_index,
            sample_rate: self.sample_rate,
            is_final_short,
            samples,
        };
        self.consumed += chunk.samples.len() as u64;
        self.next_index += 1;
        chunk
    }
}
