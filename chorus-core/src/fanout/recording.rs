//! Durable per-turn recording sink.
//!
//! Every frame the broadcaster publishes is appended here before it reaches
//! any analysis queue. The sink never drops audio: a failed write is a
//! producer error and ends the turn.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ChorusError, Result};

/// Finalised recording metadata handed to batch engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingInfo {
    pub path: PathBuf,
    pub sample_rate: u32,
    /// Mono i16 samples written to the file.
    pub samples: u64,
}

impl RecordingInfo {
    pub fn duration_secs(&self) -> f64 {
        self.samples as f64 / self.sample_rate as f64
    }
}

pub struct RecordingSink {
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
    sample_rate: u32,
    samples: u64,
}

impl RecordingSink {
    /// Create (or truncate) a mono 16-bit WAV file at `path`.
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(ChorusError::InvalidSampleRate(sample_rate));
        }
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)?;
        debug!(path = %path.display(), sample_rate, "recording opened");
        Ok(Self {
            writer,
            path,
            sample_rate,
            samples: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples_written(&self) -> u64 {
        self.samples
    }

    pub fn write(&mut self, samples: &[i16]) -> Result<()> {
        let mut writer = self.writer.get_i16_writer(samples.len() as u32);
        for &s in samples {
            writer.write_sample(s);
        }
        writer
            .flush()
            .map_err(|e| ChorusError::Recording(format!("{}: {e}", self.path.display())))?;
        self.samples += samples.len() as u64;
        Ok(())
    }

    /// Flush and patch the WAV header.
    pub fn finalize(self) -> Result<RecordingInfo> {
        let Self {
            writer,
            path,
            sample_rate,
            samples,
        } = self;
        writer.finalize()?;
        debug!(path = %path.display(), samples, "recording finalised");
        Ok(RecordingInfo {
            path,
            sample_rate,
            samples,
        })
    }

    /// Close and delete the file. Used when the producer never started, so no
    /// empty artifact is left behind.
    pub fn discard(self) {
        let path = self.path.clone();
        if let Err(e) = self.writer.finalize() {
            warn!(path = %path.display(), "failed to close discarded recording: {e}");
        }
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), "failed to remove discarded recording: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalised_file_holds_every_sample() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("turn.wav");
        let mut sink = RecordingSink::create(&path, 16_000).expect("create sink");
        sink.write(&[1, -1, 2]).expect("write");
        sink.write(&vec![7; 997]).expect("write");
        assert_eq!(sink.samples_written(), 1_000);
        let info = sink.finalize().expect("finalize");
        assert_eq!(info.samples, 1_000);

        let reader = hound::WavReader::open(&path).expect("open wav");
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.len(), 1_000);
    }

    #[test]
    fn discard_removes_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("never-started.wav");
        let sink = RecordingSink::create(&path, 48_000).expect("create sink");
        assert!(path.exists());
        sink.discard();
        assert!(!path.exists());
    }
}
