//! `chorus` command-line host.
//!
//! ## Runtime note
//!
//! Turns run on blocking threads (`spawn_blocking`): the core is thread
//! based and the microphone stream must stay on the thread that opened it.
//! The Tokio runtime only carries the status-event logger and Ctrl-C.

mod engines;
mod settings;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chorus_core::audio::device::list_input_devices;
use chorus_core::audio::{drive_turn, CaptureSession};
use chorus_core::{Coordinator, EventBus, IdentityKey, SessionPool, TurnResults, TurnStatusEvent};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use engines::EngineSet;
use settings::{load_settings, resolve_settings_path, save_settings, AppSettings};

/// Turn-synchronized multi-engine speech analysis
#[derive(Parser, Debug)]
#[command(name = "chorus", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the settings file (default: $CHORUS_SETTINGS, then the app data dir)
    #[arg(long, global = true, value_name = "PATH")]
    settings: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed a WAV file through the turn API in byte chunks
    Replay {
        /// Mono or multi-channel 16-bit PCM WAV
        #[arg(value_name = "WAV")]
        wav: PathBuf,

        /// Sentence the speaker was asked to say
        #[arg(long, short = 't', default_value = "")]
        text: String,

        /// Size of each uploaded chunk in milliseconds
        #[arg(long, value_name = "MS", default_value_t = 500)]
        chunk_ms: u32,

        #[arg(long, default_value = "teacher")]
        teacher: String,

        #[arg(long, default_value = "student")]
        student: String,

        /// Replay the file this many times on the same warm session
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },

    /// Record one turn from the microphone
    Listen {
        #[arg(long, short = 't', default_value = "")]
        text: String,

        /// Input device name (overrides settings)
        #[arg(long, value_name = "DEVICE")]
        device: Option<String>,
    },

    /// List available audio input devices
    Devices,

    /// Print the effective settings, optionally writing them back
    Settings {
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chorus=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings_path = resolve_settings_path(cli.settings);
    let settings = load_settings(&settings_path);
    debug!(path = %settings_path.display(), "settings loaded");

    match cli.command {
        Commands::Devices => {
            let devices = list_input_devices(settings.capture_config().sample_rate);
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        Commands::Settings { save } => {
            if save {
                save_settings(&settings_path, &settings)
                    .with_context(|| format!("writing {}", settings_path.display()))?;
                info!(path = %settings_path.display(), "settings saved");
            }
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::Replay {
            wav,
            text,
            chunk_ms,
            teacher,
            student,
            repeat,
        } => {
            let events = EventBus::new();
            let logger = tokio::spawn(log_status_events(events.clone()));
            let key = IdentityKey::new(teacher, student);
            let all = tokio::task::spawn_blocking(move || {
                replay(settings, &settings_path, events, &key, &wav, &text, chunk_ms, repeat)
            })
            .await
            .context("replay task panicked")??;
            logger.abort();
            for results in all {
                println!("{}", serde_json::to_string_pretty(&results)?);
            }
        }
        Commands::Listen { text, device } => {
            let mut settings = settings;
            if device.is_some() {
                settings.preferred_input_device = device;
            }
            let events = EventBus::new();
            let logger = tokio::spawn(log_status_events(events.clone()));
            let results = listen(settings, settings_path, events, text).await?;
            logger.abort();
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }
    Ok(())
}

/// Read a 16-bit WAV, down-mixing to mono.
fn read_pcm(path: &Path) -> anyhow::Result<(Vec<i16>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        bail!(
            "{}: expected 16-bit integer PCM, got {} bits {:?}",
            path.display(),
            spec.bits_per_sample,
            spec.sample_format
        );
    }
    let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
    let channels = usize::from(spec.channels.max(1));
    let mono = samples
        .chunks_exact(channels)
        .map(|frame| (frame.iter().map(|&s| i32::from(s)).sum::<i32>() / channels as i32) as i16)
        .collect();
    Ok((mono, spec.sample_rate))
}

#[allow(clippy::too_many_arguments)]
fn replay(
    settings: AppSettings,
    settings_path: &Path,
    events: EventBus,
    key: &IdentityKey,
    wav: &Path,
    text: &str,
    chunk_ms: u32,
    repeat: u32,
) -> anyhow::Result<Vec<TurnResults>> {
    let (pcm, sample_rate) = read_pcm(wav)?;
    let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
    let chunk_bytes = (sample_rate as usize * chunk_ms.max(1) as usize / 1_000).max(1) * 2;
    info!(
        samples = pcm.len(),
        sample_rate,
        chunk_bytes,
        "replaying {}",
        wav.display()
    );

    let pool_config = settings.pool_config();
    let engines = EngineSet::new(settings, settings_path.to_path_buf());
    let pool = SessionPool::new(pool_config, events.clone(), engines.into_factory(events));
    pool.start_sweeper()?;
    let coordinator = Coordinator::new(pool);

    let mut all = Vec::new();
    for _ in 0..repeat.max(1) {
        let turn_id = coordinator.start(key, text, sample_rate)?;
        for piece in bytes.chunks(chunk_bytes) {
            let ack = coordinator.chunk(&turn_id, piece)?;
            debug!(samples = ack.samples_received, "chunk acknowledged");
        }
        all.push(coordinator.stop(&turn_id)?);
    }
    coordinator.shutdown();
    Ok(all)
}

async fn listen(
    settings: AppSettings,
    settings_path: PathBuf,
    events: EventBus,
    text: String,
) -> anyhow::Result<TurnResults> {
    let capture_config = settings.capture_config();
    let engines = EngineSet::new(settings, settings_path);
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

    let turn = tokio::task::spawn_blocking(move || -> anyhow::Result<TurnResults> {
        let mut controller = engines.controller(&events)?;
        let mut capture = CaptureSession::start(&capture_config)?;
        let _ = ready_tx.send(capture.stop_handle());
        let device = capture.device();
        info!(
            device = %device.name,
            sample_rate = device.sample_rate,
            channels = device.channels,
            "listening; Ctrl-C to finish"
        );
        let results = drive_turn(&mut controller, &text, capture.sample_rate(), capture.events());
        capture.stop();
        controller.shutdown();
        Ok(results?)
    });

    if let Ok(stop) = ready_rx.await {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("stop requested");
                stop.stop();
            }
        });
    }
    turn.await.context("listen task panicked")?
}

/// Mirror status events into the log, the way a UI would consume them.
async fn log_status_events(events: EventBus) {
    let mut rx = events.subscribe();
    loop {
        match rx.recv().await {
            Ok(TurnStatusEvent::EngineCompleted {
                turn_id,
                engine,
                status,
                detail,
                elapsed_ms,
            }) => info!(%turn_id, engine = %engine, ?status, ?detail, elapsed_ms, "engine completed"),
            Ok(event) => debug!(?event, "status event"),
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "status log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
