use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Verdict {
    Real,
    Fake,
}

/// Failure categories surfaced to clients; `Cancelled` is user-initiated and
/// rendered differently from system failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Decode,
    Preprocess,
    Inference,
    EmptyResult,
    Timeout,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A frame whose fake probability met the decision threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousFrame {
    pub frame_index: usize,
    pub timestamp: f64,
    pub fake_probability: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionStatistics {
    pub total_frames: usize,
    pub fake_frames: usize,
    pub real_frames: usize,
    /// Share of frames classified fake, 0-100.
    pub fake_percentage: f32,
    pub mean_prediction: f32,
    pub std_prediction: f32,
    pub mean_confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReport {
    pub model_used: String,
    pub threshold: f32,
    pub frames_analyzed: usize,
}

/// Video-level verdict produced by aggregating per-frame scores.
/// Probabilities and confidences are 0-1; only `fake_percentage` is 0-100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub prediction: Verdict,
    pub confidence: f32,
    pub fake_probability: f32,
    pub statistics: DetectionStatistics,
    pub suspicious_frames: Vec<SuspiciousFrame>,
    pub model_info: ModelReport,
}

/// Point-in-time view of a task as returned by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub progress: u8,
    pub filename: String,
    pub model_name: String,
    pub content_digest: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DetectionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

/// Durable record of a terminal task, used for history listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResult {
    pub task_id: Uuid,
    pub filename: String,
    pub model_name: String,
    pub content_digest: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fake_probability: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: Uuid,
    pub filename: String,
    pub model: String,
    pub status_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultPage {
    pub results: Vec<StoredResult>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub input_size: [u32; 2],
    pub threshold: f32,
    pub available: bool,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelDescriptor>,
    pub default_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_tasks: usize,
    pub loaded_models: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskStatus::Uploaded,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            let text = status.to_string();
            assert_eq!(TaskStatus::from_str(&text).unwrap(), status);
        }
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let failure = TaskFailure::new(FailureKind::EmptyResult, "no frames");
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("\"empty_result\""));
    }

    #[test]
    fn snapshot_omits_absent_result_and_error() {
        let snapshot = TaskSnapshot {
            task_id: Uuid::new_v4(),
            status: TaskStatus::Uploaded,
            progress: 0,
            filename: "clip.mp4".into(),
            model_name: "xception".into(),
            content_digest: "abc".into(),
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("result"));
        assert!(!json.contains("error"));
    }
}
