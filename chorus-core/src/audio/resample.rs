//! Audio sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Ingress audio arrives at whatever rate the client negotiated (commonly
//! 48 kHz from browsers, 16 kHz from native clients). Most engines require
//! 16 kHz mono f32. `RateConverter` bridges that gap per inference chunk on
//! the adapter's worker thread, where allocation is allowed.
//!
//! Each chunk is converted independently: the resampler is reset, fed the
//! whole chunk (the last block zero-padded via `process_partial`), drained
//! past its filter delay, and the output trimmed to `round(len × ratio)`.
//! Chunk boundaries therefore never leak filter state into the next chunk.
//!
//! When source rate == target rate, `RateConverter` is a passthrough: no
//! rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{ChorusError, Result};

/// Input frames per rubato call. 20 ms at 48 kHz.
pub const DEFAULT_BLOCK: usize = 960;

/// Upper bound on drain calls when flushing the filter delay.
const MAX_DRAIN_CALLS: usize = 8;

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    source_rate: u32,
    target_rate: u32,
    /// How many input samples rubato expects per process call.
    block: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Errors
    /// Returns `ChorusError::InvalidSampleRate` for a zero rate, or
    /// `ChorusError::Engine` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32, block: usize) -> Result<Self> {
        if source_rate == 0 {
            return Err(ChorusError::InvalidSampleRate(source_rate));
        }
        if target_rate == 0 {
            return Err(ChorusError::InvalidSampleRate(target_rate));
        }
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                source_rate,
                target_rate,
                block,
                output_buf: Vec::new(),
            });
        }

        let ratio = target_rate as f64 / source_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio, no dynamic adjustment
            PolynomialDegree::Cubic,
            block,
            1, // mono
        )
        .map_err(|e| ChorusError::Engine(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::debug!(source_rate, target_rate, block, max_out, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            source_rate,
            target_rate,
            block,
            output_buf,
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Expected output length for `input_len` source samples.
    pub fn output_len(&self, input_len: usize) -> usize {
        if self.is_passthrough() {
            return input_len;
        }
        (input_len as f64 * self.target_rate as f64 / self.source_rate as f64).round() as usize
    }

    /// Convert one self-contained block of audio.
    ///
    /// The output length is exactly [`Self::output_len`] of the input length.
    pub fn convert(&mut self, samples: &[f32]) -> Vec<f32> {
        let expected = self.output_len(samples.len());
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };
        if samples.is_empty() {
            return Vec::new();
        }

        resampler.reset();
        let delay = resampler.output_delay();
        let mut out = Vec::with_capacity(expected + delay + self.output_buf[0].len());

        for block in samples.chunks(self.block) {
            let step = if block.len() == self.block {
                resampler.process_into_buffer(&[block], &mut self.output_buf, None)
            } else {
                resampler.process_partial_into_buffer(Some(&[block]), &mut self.output_buf, None)
            };
            match step {
                Ok((_consumed, produced)) => out.extend_from_slice(&self.output_buf[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
        }

        // Push the tail of the filter out so the delay can be trimmed.
        let mut drains = 0;
        while out.len() < expected + delay && drains < MAX_DRAIN_CALLS {
            match resampler.process_partial_into_buffer(
                None::<&[&[f32]]>,
                &mut self.output_buf,
                None,
            ) {
                Ok((_consumed, 0)) => break,
                Ok((_consumed, produced)) => out.extend_from_slice(&self.output_buf[0][..produced]),
                Err(e) => {
                    error!("resampler drain error: {e}");
                    break;
                }
            }
            drains += 1;
        }

        out.drain(..delay.min(out.len()));
        out.resize(expected, 0.0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, DEFAULT_BLOCK).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        let out = rc.convert(&samples);
        assert_eq!(out, samples);
    }

    #[test]
    fn ratio_48k_to_16k_exact_length() {
        let mut rc = RateConverter::new(48_000, 16_000, DEFAULT_BLOCK).unwrap();
        assert!(!rc.is_passthrough());
        let out = rc.convert(&vec![0.0f32; 48_000]);
        assert_eq!(out.len(), 16_000);
    }

    #[test]
    fn short_final_chunk_is_converted_not_dropped() {
        let mut rc = RateConverter::new(48_000, 16_000, DEFAULT_BLOCK).unwrap();
        // 0.3 s at 48 kHz is not a multiple of the block size.
        let out = rc.convert(&vec![0.1f32; 14_400]);
        assert_eq!(out.len(), 4_800);
    }

    #[test]
    fn consecutive_chunks_do_not_share_state() {
        let mut rc = RateConverter::new(48_000, 16_000, DEFAULT_BLOCK).unwrap();
        let loud = rc.convert(&vec![0.5f32; 9_600]);
        let silent = rc.convert(&vec![0.0f32; 9_600]);
        assert!(loud.iter().any(|s| s.abs() > 0.1));
        assert!(
            silent.iter().all(|s| s.abs() < 1e-6),
            "filter state leaked across chunks"
        );
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(matches!(
            RateConverter::new(0, 16_000, DEFAULT_BLOCK),
            Err(ChorusError::InvalidSampleRate(0))
        ));
    }
}
