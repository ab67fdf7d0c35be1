//! Memoized model loader.
//!
//! Loading weights dominates session construction, so every session that asks
//! for the same model id shares one loaded instance. Loads of different ids run
//! concurrently; concurrent loads of the same id run the loader once.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;

type Entry<T> = Arc<Mutex<Option<T>>>;

pub struct ModelCache<T: Clone> {
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T: Clone> Default for ModelCache<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> ModelCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached model for `model_id`, loading it on first use.
    ///
    /// A failed load is not cached; the next call retries.
    pub fn get_or_load<F>(&self, model_id: &str, load: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let entry = {
            let mut entries = self.entries.lock();
            Arc::clone(entries.entry(model_id.to_string()).or_default())
        };

        let mut slot = entry.lock();
        if let Some(model) = slot.as_ref() {
            return Ok(model.clone());
        }
        info!(model_id, "loading model");
        let model = load()?;
        *slot = Some(model.clone());
        Ok(model)
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        let entry = self.entries.lock().get(model_id).cloned();
        entry.is_some_and(|e| e.lock().is_some())
    }

    /// Drop every cached model. Sessions already holding one keep it alive.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
