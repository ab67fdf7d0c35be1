//! Audio capture via cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory (after the first callback sizes the mix buffer)
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! This module satisfies that contract by down-mixing to mono i16 and writing
//! into an SPSC ring buffer producer whose `push_slice` is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on macOS).
//! `AudioCapture` therefore must be created and dropped on the same thread:
//! the capture pump (see [`pump`]) opens it on its own worker thread.

pub mod device;
pub mod pump;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};
pub use device::DeviceChoice;
use crossbeam_channel::Sender;

use crate::{
    buffering::AudioProducer,
    error::{ChorusError, Result},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, warn};

pub use pump::{drive_turn, CaptureConfig, CaptureEvent, CaptureSession, StopHandle, StopReason};

/// Handle to an active audio capture stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on Windows/macOS.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Set to `false` to make the callback no-op.
    running: Arc<AtomicBool>,
    /// Device and stream format actually opened.
    pub device: DeviceChoice,
}

/// Saturating f32 → i16 conversion.
#[inline]
fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

#[inline]
fn u8_to_i16(sample: u8) -> i16 {
    (i16::from(sample) - 128) << 8
}

/// Average interleaved channels of `data` into `mix`, converting each
/// sample with `convert`.
#[inline]
fn downmix<T: Copy>(data: &[T], channels: usize, mix: &mut Vec<i16>, convert: impl Fn(T) -> i16) {
    let frames = data.len() / channels;
    mix.resize(frames, 0);
    for (f, out) in mix.iter_mut().enumerate() {
        let base = f * channels;
        let sum: i32 = data[base..base + channels]
            .iter()
            .map(|&s| i32::from(convert(s)))
            .sum();
        *out = (sum / channels as i32) as i16;
    }
}

impl AudioCapture {
    /// Open the input device that best matches `config` and start streaming
    /// mono i16 into `producer`.
    ///
    /// Stream errors reported by cpal after start are forwarded on `errors`.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
        config: &CaptureConfig,
        errors: Sender<String>,
    ) -> Result<Self> {
        use crate::buffering::Producer;

        let device::OpenedInput {
            device: input,
            config: supported,
            choice,
        } = device::open_input(config.device.as_deref(), config.sample_rate, config.channels.max(1))?;

        let stream_config = StreamConfig {
            channels: supported.channels(),
            sample_rate: SampleRate(choice.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let ch = usize::from(supported.channels().max(1));
        let cb_running = Arc::clone(&running);
        let mut mix: Vec<i16> = Vec::new();
        let on_error = move |err: cpal::StreamError| {
            error!("audio stream error: {err}");
            let _ = errors.try_send(err.to_string());
        };

        let stream = match supported.sample_format() {
            SampleFormat::I16 => input.build_input_stream(
                &stream_config,
                move |data: &[i16], _info| {
                    if !cb_running.load(Ordering::Relaxed) {
                        return;
                    }
                    let frames = if ch == 1 {
                        data
                    } else {
                        downmix(data, ch, &mut mix, |s| s);
                        mix.as_slice()
                    };
                    let written = producer.push_slice(frames);
                    if written < frames.len() {
                        warn!("ring buffer full: dropped {} frames", frames.len() - written);
                    }
                },
                on_error,
                None,
            ),

            SampleFormat::F32 => input.build_input_stream(
                &stream_config,
                move |data: &[f32], _info| {
                    if !cb_running.load(Ordering::Relaxed) {
                        return;
                    }
                    downmix(data, ch, &mut mix, f32_to_i16);
                    let written = producer.push_slice(&mix);
                    if written < mix.len() {
                        warn!("ring buffer full: dropped {} frames", mix.len() - written);
                    }
                },
                on_error,
                None,
            ),

            SampleFormat::U8 => input.build_input_stream(
                &stream_config,
                move |data: &[u8], _info| {
                    if !cb_running.load(Ordering::Relaxed) {
                        return;
                    }
                    downmix(data, ch, &mut mix, u8_to_i16);
                    let written = producer.push_slice(&mix);
                    if written < mix.len() {
                        warn!("ring buffer full: dropped {} frames", mix.len() - written);
                    }
                },
                on_error,
                None,
            ),

            fmt => {
                return Err(ChorusError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| ChorusError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ChorusError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            device: choice,
        })
    }

    /// Signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _config: &CaptureConfig,
        _errors: Sender<String>,
    ) -> Result<Self> {
        Err(ChorusError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_is_averaged_to_mono() {
        let mut mix = Vec::new();
        downmix(&[1_000i16, 3_000, -200, 200, 7], 2, &mut mix, |s| s);
        assert_eq!(mix, vec![2_000, 0]);
    }

    #[cfg(not(feature = "audio-cpal"))]
    #[test]
    fn opening_without_a_backend_fails_cleanly() {
        let (producer, _consumer) = crate::buffering::create_audio_ring();
        let (errors, _device_errors) = crossbeam_channel::bounded(1);
        let running = Arc::new(AtomicBool::new(true));
        let opened = AudioCapture::open(producer, running, &CaptureConfig::default(), errors);
        assert!(matches!(opened, Err(ChorusError::AudioStream(_))));
    }

    #[test]
    fn float_and_unsigned_samples_convert_to_i16() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.5), 32_767);
        assert_eq!(f32_to_i16(-1.0), -32_767);
        assert_eq!(u8_to_i16(128), 0);
        assert_eq!(u8_to_i16(0), -32_768);
        assert_eq!(u8_to_i16(255), 127 << 8);
    }
}
