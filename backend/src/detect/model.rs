use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tch::nn::ModuleT;
use tch::{CModule, Device, Kind, Tensor};

use crate::config::{ModelKind, ModelSpec};
use crate::error::AnalysisError;
use crate::detect::preprocess::FrameTensor;

/// The capability a worker needs from a detection backend: score a bounded
/// batch of preprocessed frames, one fake probability per input, in order.
/// A batch either fully succeeds or fails as a whole.
#[async_trait]
pub trait FrameScorer: Send + Sync {
    fn spec(&self) -> &ModelSpec;

    async fn predict_batch(&self, batch: Vec<FrameTensor>) -> Result<Vec<f32>, AnalysisError>;
}

/// TorchScript-backed detector. The module is loaded once onto the best
/// available device and shared behind a mutex; forwards run on the blocking
/// pool so inference never stalls the async workers.
pub struct TorchDetector {
    spec: ModelSpec,
    device: Device,
    module: Arc<Mutex<CModule>>,
}

impl TorchDetector {
    pub fn load(spec: &ModelSpec, model_path: &Path) -> Result<Self, AnalysisError> {
        let device = Device::cuda_if_available();
        let module = CModule::load_on_device(model_path, device).map_err(|e| {
            AnalysisError::Inference(format!(
                "failed to load model '{}' from {}: {e}",
                spec.name,
                model_path.display()
            ))
        })?;
        log::info!("loaded model '{}' on {:?}", spec.name, device);
        Ok(Self {
            spec: spec.clone(),
            device,
            module: Arc::new(Mutex::new(module)),
        })
    }
}

#[async_trait]
impl FrameScorer for TorchDetector {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    async fn predict_batch(&self, batch: Vec<FrameTensor>) -> Result<Vec<f32>, AnalysisError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let module = self.module.clone();
        let device = self.device;
        let kind = self.spec.kind;
        let [width, height] = self.spec.input_size;
        let expected = batch.len();

        let probabilities = tokio::task::spawn_blocking(move || -> Result<Vec<f32>, AnalysisError> {
            let plane = 3 * height as usize * width as usize;
            let mut flat = Vec::with_capacity(expected * plane);
            for frame in &batch {
                flat.extend(frame.data.iter().copied());
            }
            let input = Tensor::from_slice(&flat)
                .view([expected as i64, 3, height as i64, width as i64])
                .to_device(device);

            let output = module.lock().unwrap().forward_t(&input, false);
            let probs = match kind {
                // Single fake logit.
                ModelKind::Xception => output.sigmoid(),
                // Two-class head; class 0 is the fake column.
                ModelKind::Meso => output.softmax(-1, Kind::Float).select(1, 0),
            };
            let flat_probs = probs.to_kind(Kind::Float).contiguous().view([-1]);
            let produced = flat_probs.size()[0] as usize;
            if produced != expected {
                return Err(AnalysisError::Inference(format!(
                    "model returned {produced} scores for {expected} frames"
                )));
            }
            let mut out = vec![0.0f32; produced];
            flat_probs.copy_data(&mut out, produced);
            Ok(out)
        })
        .await
        .map_err(|e| AnalysisError::Inference(format!("inference task aborted: {e}")))??;

        Ok(probabilities)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Scorer that returns a fixed cycle of probabilities, for pipeline tests.
    pub struct ScriptedScorer {
        spec: ModelSpec,
        script: Vec<f32>,
    }

    impl ScriptedScorer {
        pub fn new(spec: ModelSpec, script: Vec<f32>) -> Self {
            Self { spec, script }
        }
    }

    #[async_trait]
    impl FrameScorer for ScriptedScorer {
        fn spec(&self) -> &ModelSpec {
            &self.spec
        }

        async fn predict_batch(
            &self,
            batch: Vec<FrameTensor>,
        ) -> Result<Vec<f32>, AnalysisError> {
            Ok(batch
                .iter()
                .map(|frame| self.script[frame.frame_index % self.script.len()])
                .collect())
        }
    }

    /// Scorer that always fails, to exercise the fatal-inference path.
    pub struct FailingScorer {
        spec: ModelSpec,
    }

    impl FailingScorer {
        pub fn new(spec: ModelSpec) -> Self {
            Self { spec }
        }
    }

    #[async_trait]
    impl FrameScorer for FailingScorer {
        fn spec(&self) -> &ModelSpec {
            &self.spec
        }

        async fn predict_batch(
            &self,
            _batch: Vec<FrameTensor>,
        ) -> Result<Vec<f32>, AnalysisError> {
            Err(AnalysisError::Inference("scripted failure".to_string()))
        }
    }
}
