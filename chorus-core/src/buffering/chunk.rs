//! Typed audio units passed from the chunking buffer to the engines.

/// A contiguous block of mono 16-bit PCM sliced out of one turn's stream.
///
/// Samples stay integer here; conversion to floating point happens once, in
/// [`ModelInput`], at the inference boundary.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono i16 samples at `sample_rate`.
    pub samples: Vec<i16>,
    /// Sample rate in Hz of the turn's ingress stream.
    pub sample_rate: u32,
    /// Zero-based position of this chunk within the turn.
    pub index: usize,
    /// Offset of the first sample from the start of the turn, in samples.
    pub offset_samples: u64,
    /// `true` for the short remainder flushed at end of turn.
    pub is_final_short: bool,
}

impl AudioChunk {
    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Start of this chunk relative to the start of the turn, in seconds.
    pub fn offset_secs(&self) -> f64 {
        self.offset_samples as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// One inference unit: normalised f32 samples at the engine's rate.
#[derive(Debug, Clone)]
pub struct ModelInput {
    /// Mono f32 samples in [-1.0, 1.0).
    pub samples: Vec<f32>,
    /// Sample rate of `samples` (the engine's expected rate).
    pub sample_rate: u32,
    /// Index of the source chunk within the turn.
    pub chunk_index: usize,
    /// Start of the source chunk relative to the start of the turn, in seconds.
    pub offset_secs: f64,
    /// Number of i16 samples in the source chunk before resampling.
    pub source_samples: usize,
    pub is_final_short: bool,
}

impl ModelInput {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Root-mean-square level of the input, used for empty-decode diagnostics.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum_sq / self.samples.len() as f32).sqrt()
    }
}

/// Convert i16 PCM to f32 by dividing by 32768.
pub fn normalize_i16(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn normalization_divides_by_32768() {
        let out = normalize_i16(&[i16::MIN, 0, 16_384, i16::MAX]);
        assert_relative_eq!(out[0], -1.0);
        assert_relative_eq!(out[1], 0.0);
        assert_relative_eq!(out[2], 0.5);
        assert!(out[3] < 1.0);
    }

    #[test]
    fn chunk_timing_uses_source_rate() {
        let chunk = AudioChunk {
            samples: vec![0; 4_800],
            sample_rate: 16_000,
            index: 2,
            offset_samples: 32_000,
            is_final_short: true,
        };
        assert_relative_eq!(chunk.duration_secs(), 0.3);
        assert_relative_eq!(chunk.offset_secs(), 2.0);
    }
}
