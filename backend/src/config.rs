use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub results_dir: PathBuf,
    pub models_dir: PathBuf,
    /// Optional YAML file overriding the built-in model registry.
    pub models_config: Option<PathBuf>,
    pub max_file_size: usize,
    pub allowed_extensions: Vec<String>,
    /// Frames per second to sample from submitted videos.
    pub frame_rate: f64,
    /// Hard cap on sampled frames per video.
    pub max_frames: usize,
    pub batch_size: usize,
    /// Ceiling on tasks in non-terminal state; submissions beyond it are rejected.
    pub max_concurrent_tasks: usize,
    pub worker_count: usize,
    pub task_timeout: Duration,
    /// Terminal registry records older than this are evicted by the sweeper.
    pub retention_max_age: Duration,
    pub retention_sweep_interval: Duration,
    /// Percentage of fake-classified frames above which the video verdict is "fake".
    pub fake_majority_pct: f32,
    /// Cap on the suspicious-frame list in a result.
    pub suspicious_top_n: usize,
    /// When set, `/api` requires `Authorization: Bearer <key>`.
    pub api_key: Option<String>,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8081),
            upload_dir: env_path("UPLOAD_DIR", "uploads"),
            results_dir: env_path("RESULTS_DIR", "stored_results"),
            models_dir: env_path("MODELS_DIR", "models"),
            models_config: std::env::var("MODELS_CONFIG").ok().map(PathBuf::from),
            max_file_size: env_parse("MAX_FILE_SIZE", 100 * 1024 * 1024),
            allowed_extensions: std::env::var("ALLOWED_VIDEO_EXTENSIONS")
                .map(|raw| {
                    raw.split(',')
                        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                        .filter(|ext| !ext.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| {
                    ["mp4", "avi", "mov", "mkv", "flv", "wmv", "webm"]
                        .into_iter()
                        .map(String::from)
                        .collect()
                }),
            frame_rate: env_parse("FRAME_EXTRACTION_RATE", 1.0),
            max_frames: env_parse("MAX_FRAMES_PER_VIDEO", 300),
            batch_size: env_parse("BATCH_SIZE", 32),
            max_concurrent_tasks: env_parse("MAX_CONCURRENT_TASKS", 10),
            worker_count: env_parse("WORKER_COUNT", 2),
            task_timeout: Duration::from_secs(env_parse("TASK_TIMEOUT_SECS", 600)),
            retention_max_age: Duration::from_secs(env_parse("TASK_RETENTION_SECS", 24 * 3600)),
            retention_sweep_interval: Duration::from_secs(env_parse("RETENTION_SWEEP_SECS", 600)),
            fake_majority_pct: env_parse("FAKE_MAJORITY_PCT", 50.0),
            suspicious_top_n: env_parse("SUSPICIOUS_TOP_N", 5),
            api_key: std::env::var("API_KEY").ok().filter(|k| !k.is_empty()),
        }
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.upload_dir)?;
        std::fs::create_dir_all(&self.results_dir)?;
        std::fs::create_dir_all(&self.models_dir)?;
        Ok(())
    }

    pub fn extension_allowed(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        self.allowed_extensions.iter().any(|allowed| *allowed == ext)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Xception,
    Meso,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    pub fn imagenet() -> Self {
        Self {
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }

    /// Maps [0,1] pixels into [-1,1].
    pub fn centered() -> Self {
        Self {
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        }
    }
}

/// Static description of a detection backend: where its weights live and how
/// its input tensors must look.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub kind: ModelKind,
    pub file: String,
    pub input_size: [u32; 2],
    pub normalization: Normalization,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

fn default_threshold() -> f32 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRegistry {
    pub default_model: String,
    pub models: Vec<ModelSpec>,
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        Self {
            default_model: "xception".to_string(),
            models: vec![
                ModelSpec {
                    name: "xception".to_string(),
                    display_name: "XceptionNet".to_string(),
                    description: "High accuracy deepfake detection model".to_string(),
                    kind: ModelKind::Xception,
                    file: "xception_deepfake_detector.pt".to_string(),
                    input_size: [224, 224],
                    normalization: Normalization::imagenet(),
                    threshold: 0.5,
                },
                ModelSpec {
                    name: "mesonet".to_string(),
                    display_name: "MesoNet".to_string(),
                    description: "Lightweight model for real-time inference".to_string(),
                    kind: ModelKind::Meso,
                    file: "mesonet_deepfake_detector.pt".to_string(),
                    input_size: [256, 256],
                    normalization: Normalization::centered(),
                    threshold: 0.5,
                },
            ],
        }
    }

    /// Built-in registry, or the YAML override when `MODELS_CONFIG` points at one.
    pub fn load(settings: &Settings) -> Result<Self, Box<dyn std::error::Error>> {
        let registry = match &settings.models_config {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::builtin(),
        };
        if registry.models.is_empty() {
            return Err("model registry contains no models".into());
        }
        if registry.get(&registry.default_model).is_none() {
            return Err(format!(
                "default model '{}' is not in the registry",
                registry.default_model
            )
            .into());
        }
        Ok(registry)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)?;
        let registry: ModelRegistry = serde_yaml::from_str(&raw)?;
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|spec| spec.name == name)
    }

    pub fn default_spec(&self) -> &ModelSpec {
        // Validated by `load`; the first entry is a safe fallback for
        // hand-built registries in tests.
        self.get(&self.default_model).unwrap_or(&self.models[0])
    }
}
