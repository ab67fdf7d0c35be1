//! Input device selection.
//!
//! Capture asks for a sample rate and channel count (by default 16 kHz mono,
//! the rate the engines consume). Candidates are tried in order: the
//! preferred device by name, then the system default, then every other input
//! with system-output loopbacks last. The first candidate offering a stream
//! config that covers the requested rate wins; when none does, the first
//! candidate opens at its own default config and turns run at that rate.
//!
//! The choice is reported as a [`DeviceChoice`] so callers can see which
//! device is live and whether it delivers what was asked for.

use serde::{Deserialize, Serialize};

/// One supported input stream configuration, reduced to what selection needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputRange {
    pub channels: u16,
    pub min_rate: u32,
    pub max_rate: u32,
}

impl InputRange {
    fn covers(&self, rate: u32) -> bool {
        (self.min_rate..=self.max_rate).contains(&rate)
    }
}

/// Stream configuration picked for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamChoice {
    /// Index into the ranges offered; `None` means the device default.
    pub range: Option<usize>,
    pub sample_rate: u32,
    pub channels: u16,
    /// The requested rate is delivered as is.
    pub matched: bool,
}

/// The input device a capture session opened, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceChoice {
    pub name: String,
    pub sample_rate: u32,
    /// Channels the device delivers; they are averaged down to mono.
    pub channels: u16,
    pub requested_sample_rate: Option<u32>,
    pub matched: bool,
    /// A preferred device was named but is not present.
    pub preferred_missing: bool,
}

/// An input device as listed by `chorus devices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub default_sample_rate: Option<u32>,
    /// Whether the device can capture at the configured rate directly.
    pub supports_capture_rate: bool,
}

/// Pick the stream configuration closest to `want_rate` and `want_channels`.
///
/// Among ranges covering the rate, an exact channel count beats the fewest
/// channels above it. With no requested rate, or no range covering it, the
/// device default is used.
pub fn choose_stream(
    ranges: &[InputRange],
    default: (u32, u16),
    want_rate: Option<u32>,
    want_channels: u16,
) -> StreamChoice {
    let fallback = StreamChoice {
        range: None,
        sample_rate: default.0,
        channels: default.1,
        matched: want_rate.map_or(true, |rate| rate == default.0),
    };
    let Some(rate) = want_rate else {
        return fallback;
    };
    if fallback.matched && default.1 == want_channels {
        return fallback;
    }

    let best = ranges
        .iter()
        .enumerate()
        .filter(|(_, r)| r.channels > 0 && r.covers(rate))
        .min_by_key(|(_, r)| (r.channels != want_channels, r.channels));
    match best {
        Some((index, r)) => StreamChoice {
            range: Some(index),
            sample_rate: rate,
            channels: r.channels,
            matched: true,
        },
        None => fallback,
    }
}

const LOOPBACK_HINTS: &[&str] = &["stereo mix", "what u hear", "loopback", "monitor of", "wave out"];

/// Whether a device name looks like it captures system output, not a voice.
pub fn is_loopback_like(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    LOOPBACK_HINTS.iter().any(|hint| lowered.contains(hint))
}

/// Order in which devices are tried: preferred, default, microphones by
/// name, loopbacks.
pub fn candidate_order(names: &[String], preferred: Option<&str>, default: Option<&str>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..names.len()).collect();
    order.sort_by_key(|&i| {
        let name = names[i].as_str();
        (
            Some(name) != preferred,
            Some(name) != default,
            is_loopback_like(name),
            name.to_ascii_lowercase(),
        )
    });
    order
}

#[cfg(feature = "audio-cpal")]
pub use cpal_backend::list_input_devices;
#[cfg(feature = "audio-cpal")]
pub(crate) use cpal_backend::{open_input, OpenedInput};

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices(_capture_rate: Option<u32>) -> Vec<DeviceInfo> {
    Vec::new()
}

#[cfg(feature = "audio-cpal")]
mod cpal_backend {
    use cpal::traits::{DeviceTrait, HostTrait};
    use cpal::{Device, SampleFormat, SampleRate, SupportedStreamConfig, SupportedStreamConfigRange};
    use tracing::{info, warn};

    use super::{candidate_order, choose_stream, DeviceChoice, DeviceInfo, InputRange};
    use crate::error::{ChorusError, Result};

    pub(crate) struct OpenedInput {
        pub device: Device,
        pub config: SupportedStreamConfig,
        pub choice: DeviceChoice,
    }

    fn usable(range: &SupportedStreamConfigRange) -> bool {
        matches!(
            range.sample_format(),
            SampleFormat::I16 | SampleFormat::F32 | SampleFormat::U8
        )
    }

    fn named(host: &cpal::Host) -> Result<Vec<(String, Device)>> {
        let devices = host
            .input_devices()
            .map_err(|e| ChorusError::AudioDevice(e.to_string()))?;
        Ok(devices
            .enumerate()
            .map(|(i, d)| (d.name().unwrap_or_else(|_| format!("Input Device {}", i + 1)), d))
            .collect())
    }

    /// Resolve the stream config for one device.
    fn configure(
        device: &Device,
        want_rate: Option<u32>,
        want_channels: u16,
    ) -> Result<(SupportedStreamConfig, super::StreamChoice)> {
        let default = device
            .default_input_config()
            .map_err(|e| ChorusError::AudioDevice(e.to_string()))?;
        let supported: Vec<SupportedStreamConfigRange> = device
            .supported_input_configs()
            .map(|ranges| ranges.filter(usable).collect())
            .unwrap_or_default();
        let ranges: Vec<InputRange> = supported
            .iter()
            .map(|r| InputRange {
                channels: r.channels(),
                min_rate: r.min_sample_rate().0,
                max_rate: r.max_sample_rate().0,
            })
            .collect();
        let choice = choose_stream(
            &ranges,
            (default.sample_rate().0, default.channels()),
            want_rate,
            want_channels,
        );
        let config = match choice.range.and_then(|i| supported.get(i)) {
            Some(range) => range.clone().with_sample_rate(SampleRate(choice.sample_rate)),
            None => default,
        };
        Ok((config, choice))
    }

    pub(crate) fn open_input(
        preferred: Option<&str>,
        want_rate: Option<u32>,
        want_channels: u16,
    ) -> Result<OpenedInput> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let mut devices = named(&host)?;
        let names: Vec<String> = devices.iter().map(|(name, _)| name.clone()).collect();
        let preferred_missing = preferred.is_some_and(|p| !names.iter().any(|n| n == p));
        if preferred_missing {
            warn!(?preferred, "preferred input device not found, falling back");
        }

        let mut first: Option<(usize, SupportedStreamConfig, super::StreamChoice)> = None;
        for index in candidate_order(&names, preferred, default_name.as_deref()) {
            let (config, choice) = match configure(&devices[index].1, want_rate, want_channels) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(device = %names[index], "skipping input device: {e}");
                    continue;
                }
            };
            let matched = choice.matched;
            if first.is_none() || matched {
                first = Some((index, config, choice));
            }
            if matched {
                break;
            }
        }

        let (index, config, stream) = first.ok_or(ChorusError::NoDefaultInputDevice)?;
        let (name, device) = devices.swap_remove(index);
        let choice = DeviceChoice {
            name,
            sample_rate: stream.sample_rate,
            channels: stream.channels,
            requested_sample_rate: want_rate,
            matched: stream.matched,
            preferred_missing,
        };
        if choice.matched {
            info!(device = %choice.name, sample_rate = choice.sample_rate, channels = choice.channels, "input device selected");
        } else {
            warn!(
                device = %choice.name,
                sample_rate = choice.sample_rate,
                requested = ?want_rate,
                "no input device offers the requested rate; using the device default"
            );
        }
        Ok(OpenedInput {
            device,
            config,
            choice,
        })
    }

    /// Every input device, in the order capture would try them.
    pub fn list_input_devices(capture_rate: Option<u32>) -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let devices = match named(&host) {
            Ok(devices) => devices,
            Err(e) => {
                warn!("failed to enumerate input devices: {e}");
                return Vec::new();
            }
        };
        let names: Vec<String> = devices.iter().map(|(name, _)| name.clone()).collect();
        candidate_order(&names, None, default_name.as_deref())
            .into_iter()
            .map(|i| {
                let (name, device) = &devices[i];
                let configured = configure(device, capture_rate, 1).ok();
                DeviceInfo {
                    name: name.clone(),
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    default_sample_rate: device.default_input_config().ok().map(|c| c.sample_rate().0),
                    supports_capture_rate: configured.is_some_and(|(_, choice)| choice.matched),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    const STEREO_WIDE: InputRange = InputRange {
        channels: 2,
        min_rate: 8_000,
        max_rate: 96_000,
    };

    #[test]
    fn exact_channel_count_wins_among_covering_ranges() {
        let ranges = [
            STEREO_WIDE,
            InputRange {
                channels: 1,
                min_rate: 16_000,
                max_rate: 48_000,
            },
        ];
        let choice = choose_stream(&ranges, (48_000, 2), Some(16_000), 1);
        assert_eq!(choice.range, Some(1));
        assert_eq!((choice.sample_rate, choice.channels), (16_000, 1));
        assert!(choice.matched);
    }

    #[test]
    fn multichannel_range_is_used_when_no_mono_one_covers_the_rate() {
        let ranges = [
            InputRange {
                channels: 1,
                min_rate: 44_100,
                max_rate: 48_000,
            },
            InputRange {
                channels: 4,
                min_rate: 16_000,
                max_rate: 16_000,
            },
            STEREO_WIDE,
        ];
        let choice = choose_stream(&ranges, (48_000, 1), Some(16_000), 1);
        assert_eq!(choice.range, Some(2), "fewest channels above the request");
        assert_eq!(choice.channels, 2);
        assert!(choice.matched);
    }

    #[test]
    fn uncovered_rate_falls_back_to_the_device_default() {
        let ranges = [InputRange {
            channels: 1,
            min_rate: 44_100,
            max_rate: 48_000,
        }];
        let choice = choose_stream(&ranges, (48_000, 1), Some(16_000), 1);
        assert_eq!(choice.range, None);
        assert_eq!(choice.sample_rate, 48_000);
        assert!(!choice.matched);

        let unrequested = choose_stream(&ranges, (44_100, 1), None, 1);
        assert_eq!(unrequested.sample_rate, 44_100);
        assert!(unrequested.matched);
    }

    #[test]
    fn preferred_then_default_then_loopbacks_last() {
        let list = names(&["Stereo Mix (Realtek)", "USB Microphone", "Built-in Mic", "Headset"]);
        assert_eq!(candidate_order(&list, Some("Headset"), Some("Built-in Mic")), vec![3, 2, 1, 0]);
        assert_eq!(candidate_order(&list, Some("Missing"), None), vec![2, 3, 1, 0]);
        assert!(is_loopback_like("Monitor of Built-in Audio"));
        assert!(!is_loopback_like("USB Microphone"));
    }

    #[test]
    fn device_choice_serializes_camel_case() {
        let choice = DeviceChoice {
            name: "USB Microphone".into(),
            sample_rate: 48_000,
            channels: 2,
            requested_sample_rate: Some(16_000),
            matched: false,
            preferred_missing: true,
        };
        let json = serde_json::to_value(&choice).expect("serialize");
        assert_eq!(json["requestedSampleRate"], 16_000);
        assert_eq!(json["preferredMissing"], true);
        assert_eq!(json["matched"], false);
    }
}
