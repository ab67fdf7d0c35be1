//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chorus_core::{CaptureConfig, OverflowPolicy, PoolConfig, TurnConfig};
use serde::{Deserialize, Serialize};

/// Environment variable naming the settings file when `--settings` is absent.
pub const SETTINGS_ENV: &str = "CHORUS_SETTINGS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    /// Rate to ask the input device for; 0 takes the device default.
    pub capture_sample_rate: u32,
    pub language: String,
    /// Where per-turn WAV files go; `None` uses `recordings/` next to the
    /// settings file.
    pub recordings_dir: Option<PathBuf>,
    pub chunk_duration_ms: u64,
    pub queue_depth: usize,
    pub overflow: OverflowPolicy,
    pub completion_timeout_ms: u64,
    pub remote_settle_ms: u64,
    pub frame_ms: u32,
    /// 0 disables silence auto-stop.
    pub silence_timeout_ms: u64,
    /// 0 disables the duration cap.
    pub max_duration_secs: u64,
    pub vad_threshold: f32,
    pub phoneme_engine: bool,
    pub transcript_engine: bool,
    /// Feed the phoneme engine live; otherwise it decodes the recording
    /// after the turn ends.
    pub phoneme_realtime: bool,
    pub transcript_realtime: bool,
    /// Run post-turn engines concurrently instead of one after another.
    pub parallel_batches: bool,
    /// Simulated round trip of the in-process transcript service.
    pub transcript_latency_ms: u64,
    /// Scoring service endpoint; the built-in scorer is used when unset.
    pub assessment_url: Option<String>,
    pub assessment_api_key: Option<String>,
    pub idle_threshold_secs: u64,
    pub max_sessions: Option<usize>,
}

impl Default for AppSettings {
    fn default() -> Self {
        let turn = TurnConfig::default();
        let capture = CaptureConfig::default();
        Self {
            preferred_input_device: None,
            capture_sample_rate: capture.sample_rate.unwrap_or(0),
            language: turn.language,
            recordings_dir: None,
            chunk_duration_ms: turn.chunk_duration_ms,
            queue_depth: turn.queue_depth,
            overflow: turn.overflow,
            completion_timeout_ms: turn.completion_timeout_ms,
            remote_settle_ms: turn.remote_settle_ms,
            frame_ms: capture.frame_ms,
            silence_timeout_ms: capture.silence_timeout_ms.unwrap_or(0),
            max_duration_secs: capture.max_duration_ms.map_or(0, |ms| ms / 1_000),
            vad_threshold: capture.vad_threshold,
            phoneme_engine: true,
            transcript_engine: true,
            phoneme_realtime: true,
            transcript_realtime: true,
            parallel_batches: turn.parallel_batches,
            transcript_latency_ms: 120,
            assessment_url: None,
            assessment_api_key: None,
            idle_threshold_secs: PoolConfig::default().idle_threshold_secs,
            max_sessions: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.language = normalize_language(&self.language);
        self.chunk_duration_ms = self.chunk_duration_ms.clamp(100, 30_000);
        self.queue_depth = self.queue_depth.clamp(8, 65_536);
        if let OverflowPolicy::BlockWithTimeout { timeout_ms } = &mut self.overflow {
            *timeout_ms = (*timeout_ms).clamp(1, 1_000);
        }
        self.completion_timeout_ms = self.completion_timeout_ms.clamp(500, 120_000);
        self.remote_settle_ms = self.remote_settle_ms.min(5_000);
        if self.capture_sample_rate != 0 {
            self.capture_sample_rate = self.capture_sample_rate.clamp(8_000, 192_000);
        }
        self.frame_ms = self.frame_ms.clamp(5, 200);
        self.silence_timeout_ms = self.silence_timeout_ms.min(60_000);
        self.max_duration_secs = self.max_duration_secs.min(600);
        self.vad_threshold = self.vad_threshold.clamp(0.001, 0.5);
        self.transcript_latency_ms = self.transcript_latency_ms.min(10_000);
        self.idle_threshold_secs = self.idle_threshold_secs.max(1);
        self.max_sessions = self.max_sessions.filter(|&n| n > 0);
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.assessment_url = trimmed(self.assessment_url.take());
        self.assessment_api_key = trimmed(self.assessment_api_key.take());
    }

    pub fn turn_config(&self, settings_path: &Path) -> TurnConfig {
        let recordings_dir = self.recordings_dir.clone().unwrap_or_else(|| {
            settings_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("recordings")
        });
        TurnConfig {
            chunk_duration_ms: self.chunk_duration_ms,
            queue_depth: self.queue_depth,
            overflow: self.overflow,
            completion_timeout_ms: self.completion_timeout_ms,
            remote_settle_ms: self.remote_settle_ms,
            recordings_dir,
            language: self.language.clone(),
            parallel_batches: self.parallel_batches,
            ..TurnConfig::default()
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device: self.preferred_input_device.clone(),
            sample_rate: Some(self.capture_sample_rate).filter(|&hz| hz > 0),
            frame_ms: self.frame_ms,
            silence_timeout_ms: Some(self.silence_timeout_ms).filter(|&ms| ms > 0),
            max_duration_ms: Some(self.max_duration_secs * 1_000).filter(|&ms| ms > 0),
            vad_threshold: self.vad_threshold,
            ..CaptureConfig::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            idle_threshold_secs: self.idle_threshold_secs,
            max_sessions: self.max_sessions,
            ..PoolConfig::default()
        }
    }

    pub fn transcript_latency(&self) -> Duration {
        Duration::from_millis(self.transcript_latency_ms)
    }
}

/// Accepts `nl`, `nl_nl` or `NL-nl` style hints and returns `nl-NL` form.
pub fn normalize_language(raw: &str) -> String {
    let cleaned = raw.trim().replace('_', "-");
    let mut parts = cleaned.split('-').filter(|p| !p.is_empty());
    match (parts.next(), parts.next()) {
        (Some(lang), Some(region)) => {
            format!("{}-{}", lang.to_ascii_lowercase(), region.to_ascii_uppercase())
        }
        (Some(lang), None) if lang.eq_ignore_ascii_case("nl") => "nl-NL".into(),
        (Some(lang), None) => lang.to_ascii_lowercase(),
        _ => TurnConfig::default().language,
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Chorus")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("chorus")
            .join("settings.json")
    }
}

/// `--settings` wins, then `CHORUS_SETTINGS`, then the platform default.
pub fn resolve_settings_path(cli: Option<PathBuf>) -> PathBuf {
    cli.or_else(|| std::env::var_os(SETTINGS_ENV).map(PathBuf::from))
        .unwrap_or_else(default_settings_path)
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        assert_eq!(load_settings(&path), AppSettings::default());
        fs::write(&path, "{ not json").expect("write");
        assert_eq!(load_settings(&path), AppSettings::default());
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut s = AppSettings {
            language: " nl_nl ".into(),
            chunk_duration_ms: 5,
            frame_ms: 1_000,
            vad_threshold: 3.0,
            max_sessions: Some(0),
            assessment_url: Some("   ".into()),
            capture_sample_rate: 1_000,
            ..AppSettings::default()
        };
        s.normalize();
        assert_eq!(s.language, "nl-NL");
        assert_eq!(s.chunk_duration_ms, 100);
        assert_eq!(s.frame_ms, 200);
        assert_eq!(s.vad_threshold, 0.5);
        assert_eq!(s.max_sessions, None);
        assert_eq!(s.assessment_url, None);
        assert_eq!(s.capture_sample_rate, 8_000);
    }

    #[test]
    fn saved_settings_round_trip_through_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let settings = AppSettings {
            language: "en-US".into(),
            silence_timeout_ms: 0,
            transcript_engine: false,
            ..AppSettings::default()
        };
        save_settings(&path, &settings).expect("save");
        let loaded = load_settings(&path);
        assert_eq!(loaded, settings);
        assert_eq!(loaded.capture_config().silence_timeout_ms, None);
        assert_eq!(loaded.capture_config().sample_rate, Some(16_000));
    }

    #[test]
    fn recordings_default_next_to_settings_file() {
        let settings = AppSettings::default();
        let cfg = settings.turn_config(Path::new("/data/chorus/settings.json"));
        assert_eq!(cfg.recordings_dir, PathBuf::from("/data/chorus/recordings"));
        assert_eq!(cfg.language, "nl-NL");
    }

    #[test]
    fn engine_modes_default_to_live_and_sequential() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"transcriptRealtime": false}"#).expect("parse");
        assert!(settings.phoneme_realtime);
        assert!(!settings.transcript_realtime);
        assert!(!settings.parallel_batches);

        let settings: AppSettings =
            serde_json::from_str(r#"{"parallelBatches": true}"#).expect("parse");
        assert!(settings.turn_config(Path::new("settings.json")).parallel_batches);
    }

    #[test]
    fn cli_path_beats_environment() {
        let explicit = PathBuf::from("/etc/chorus.json");
        assert_eq!(resolve_settings_path(Some(explicit.clone())), explicit);
    }
}
