use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use crate::config::ModelSpec;
use crate::detect::model::{FrameScorer, TorchDetector};
use crate::error::AnalysisError;

/// Produces a loaded scorer for a model spec. Seam between the cache and the
/// torch runtime so the cache's coalescing can be tested without weights.
#[async_trait]
pub trait DetectorLoader: Send + Sync {
    async fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn FrameScorer>, AnalysisError>;
}

pub struct TorchLoader {
    models_dir: PathBuf,
}

impl TorchLoader {
    pub fn new(models_dir: PathBuf) -> Self {
        Self { models_dir }
    }
}

#[async_trait]
impl DetectorLoader for TorchLoader {
    async fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn FrameScorer>, AnalysisError> {
        let path = self.models_dir.join(&spec.file);
        if !path.exists() {
            return Err(AnalysisError::Inference(format!(
                "model file missing: {}",
                path.display()
            )));
        }
        let spec = spec.clone();
        let detector =
            tokio::task::spawn_blocking(move || TorchDetector::load(&spec, &path))
                .await
                .map_err(|e| AnalysisError::Inference(format!("model load aborted: {e}")))??;
        Ok(Arc::new(detector))
    }
}

/// Process-wide cache of loaded detectors, keyed by model name.
///
/// Each entry is a `OnceCell`, so concurrent first requests for the same
/// model coalesce into a single load and every waiter receives the same
/// instance. A failed load leaves the cell uninitialized rather than
/// poisoned, so a later request may retry. Entries live until shutdown
/// unless explicitly invalidated.
pub struct DetectorCache {
    loader: Arc<dyn DetectorLoader>,
    entries: Mutex<HashMap<String, Arc<OnceCell<Arc<dyn FrameScorer>>>>>,
}

impl DetectorCache {
    pub fn new(loader: Arc<dyn DetectorLoader>) -> Self {
        Self {
            loader,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, spec: &ModelSpec) -> Result<Arc<dyn FrameScorer>, AnalysisError> {
        let cell = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .entry(spec.name.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let scorer = cell
            .get_or_try_init(|| self.loader.load(spec))
            .await?;
        Ok(scorer.clone())
    }

    /// Names of models that finished loading.
    pub fn loaded(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Drop a cached detector so the next request reloads it.
    pub fn invalidate(&self, name: &str) {
        self.entries.lock().unwrap().remove(name);
    }
}
