//! Engine wiring: which adapters every session gets.

use std::path::PathBuf;

use anyhow::Context;
use chorus_core::adapter::{
    Adapter, ChunkOutput, ChunkedFileModel, ChunkedModelAdapter, FileModelAdapter,
    RecognizerFileModel, RemoteStreamAdapter,
};
use chorus_core::inference::stub::{LoopbackRecognizer, StubPhonemeModel, StubScorer};
use chorus_core::inference::{FileModelHandle, ModelHandle, RecognizerFactory, RemoteRecognizer};
use chorus_core::session::ControllerFactory;
use chorus_core::{
    EventBus, HttpFileModel, HttpFileModelConfig, IdentityKey, ModelCache, TurnConfig,
    TurnController,
};
use tracing::info;

use crate::settings::AppSettings;

const PHONEME_MODEL_ID: &str = "stub-phonemes";

pub const PHONEMES: &str = "phonemes";
pub const TRANSCRIPT: &str = "transcript";
pub const ASSESSMENT: &str = "assessment";

/// Builds warm controllers for new sessions.
///
/// The phoneme model is loaded once and shared by every session through the
/// model cache. Phonemes and transcript run live or on the finished
/// recording depending on their `realtime` setting; assessment always runs
/// on the recording.
pub struct EngineSet {
    settings: AppSettings,
    settings_path: PathBuf,
    models: ModelCache<ModelHandle>,
}

impl EngineSet {
    pub fn new(settings: AppSettings, settings_path: PathBuf) -> Self {
        Self {
            settings,
            settings_path,
            models: ModelCache::new(),
        }
    }

    pub fn turn_config(&self) -> TurnConfig {
        self.settings.turn_config(&self.settings_path)
    }

    pub fn adapters(&self, cfg: &TurnConfig) -> anyhow::Result<Vec<Adapter>> {
        let mut adapters = Vec::new();

        if self.settings.phoneme_engine {
            let model = self.models.get_or_load(PHONEME_MODEL_ID, || {
                let handle = ModelHandle::new(StubPhonemeModel::default());
                handle.0.lock().warm_up()?;
                Ok(handle)
            })?;
            adapters.push(if self.settings.phoneme_realtime {
                Adapter::streaming(
                    ChunkedModelAdapter::new(PHONEMES, model, cfg.chunk_duration(), cfg.liveness_poll())
                        .with_output(ChunkOutput::Phonemes),
                )
            } else {
                let offline = ChunkedFileModel::new(model, cfg.chunk_duration())
                    .with_output(ChunkOutput::Phonemes);
                Adapter::batch(FileModelAdapter::new(PHONEMES, FileModelHandle::new(offline)))
            });
        }

        if self.settings.transcript_engine {
            let latency = self.settings.transcript_latency();
            let factory: RecognizerFactory = Box::new(move || {
                Ok(Box::new(LoopbackRecognizer::new(latency)) as Box<dyn RemoteRecognizer>)
            });
            adapters.push(if self.settings.transcript_realtime {
                let adapter = RemoteStreamAdapter::new(
                    TRANSCRIPT,
                    factory,
                    cfg.remote_settle(),
                    cfg.liveness_poll(),
                )
                .context("connecting transcript service")?;
                Adapter::streaming(adapter)
            } else {
                let offline = RecognizerFileModel::new(factory, cfg.completion_timeout());
                Adapter::batch(FileModelAdapter::new(TRANSCRIPT, FileModelHandle::new(offline)))
            });
        }

        let scorer = match &self.settings.assessment_url {
            Some(url) => {
                let config = HttpFileModelConfig {
                    api_key: self.settings.assessment_api_key.clone(),
                    ..HttpFileModelConfig::new(url.clone())
                };
                FileModelHandle::new(HttpFileModel::new(config).context("building scoring client")?)
            }
            None => FileModelHandle::new(StubScorer),
        };
        adapters.push(Adapter::batch(FileModelAdapter::new(ASSESSMENT, scorer)));

        Ok(adapters)
    }

    pub fn controller(&self, events: &EventBus) -> anyhow::Result<TurnController> {
        let cfg = self.turn_config();
        let adapters = self.adapters(&cfg)?;
        Ok(TurnController::new(cfg, adapters, events.clone())?)
    }

    /// Session factory for the pool.
    pub fn into_factory(self, events: EventBus) -> ControllerFactory {
        Box::new(move |key: &IdentityKey| {
            info!(identity = %key, "building engines for session");
            self.controller(&events)
                .map_err(|e| chorus_core::ChorusError::Engine(format!("{e:#}")))
        })
    }
}
