use shared::{
    DetectionResult, DetectionStatistics, ModelReport, SuspiciousFrame, Verdict,
};
use std::cmp::Ordering;

use crate::config::ModelSpec;
use crate::error::AnalysisError;

/// Inference output for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionScore {
    pub frame_index: usize,
    pub timestamp: f64,
    pub fake_probability: f32,
    pub confidence: f32,
}

/// Task-level aggregation knobs, taken from settings at submission time.
#[derive(Debug, Clone, Copy)]
pub struct AggregationConfig {
    /// Verdict is "fake" when the fake-frame percentage strictly exceeds this.
    pub fake_majority_pct: f32,
    /// Cap on the suspicious-frame list.
    pub top_n: usize,
}

const MIN_FRAME_CONFIDENCE: f32 = 0.1;

/// Confidence of a single frame score: distance from the decision threshold,
/// scaled by the wider side of the threshold into 0-1, floored at 0.1.
pub fn frame_confidence(probability: f32, threshold: f32) -> f32 {
    let span = threshold.max(1.0 - threshold);
    ((probability - threshold).abs() / span).clamp(MIN_FRAME_CONFIDENCE, 1.0)
}

/// Reduce per-frame scores into the video-level result.
///
/// Frames are classified against the model's threshold; the verdict is a
/// frame-majority vote rather than a single-frame trigger, so isolated false
/// positives do not flip a video to "fake".
pub fn aggregate(
    spec: &ModelSpec,
    scores: &[DetectionScore],
    config: AggregationConfig,
) -> Result<DetectionResult, AnalysisError> {
    if scores.is_empty() {
        return Err(AnalysisError::EmptyResult(
            "no frames survived preprocessing".to_string(),
        ));
    }

    let threshold = spec.threshold;
    let total = scores.len();
    let fake_frames = scores
        .iter()
        .filter(|s| s.fake_probability >= threshold)
        .count();
    let real_frames = total - fake_frames;
    let fake_percentage = fake_frames as f32 / total as f32 * 100.0;

    let mean_prediction =
        scores.iter().map(|s| s.fake_probability).sum::<f32>() / total as f32;
    let variance = scores
        .iter()
        .map(|s| {
            let d = s.fake_probability - mean_prediction;
            d * d
        })
        .sum::<f32>()
        / total as f32;
    let std_prediction = variance.sqrt();
    let mean_confidence = scores.iter().map(|s| s.confidence).sum::<f32>() / total as f32;

    let prediction = if fake_percentage > config.fake_majority_pct {
        Verdict::Fake
    } else {
        Verdict::Real
    };

    // Video confidence reflects the aggregate margin, not any single frame.
    let span = threshold.max(1.0 - threshold);
    let confidence = ((mean_prediction - threshold).abs() / span).clamp(0.0, 1.0);

    let mut suspicious: Vec<SuspiciousFrame> = scores
        .iter()
        .filter(|s| s.fake_probability >= threshold)
        .map(|s| SuspiciousFrame {
            frame_index: s.frame_index,
            timestamp: s.timestamp,
            fake_probability: s.fake_probability,
            confidence: s.confidence,
        })
        .collect();
    suspicious.sort_by(|a, b| {
        b.fake_probability
            .partial_cmp(&a.fake_probability)
            .unwrap_or(Ordering::Equal)
            .then(a.frame_index.cmp(&b.frame_index))
    });
    suspicious.truncate(config.top_n);

    Ok(DetectionResult {
        prediction,
        confidence,
        fake_probability: mean_prediction,
        statistics: DetectionStatistics {
            total_frames: total,
            fake_frames,
            real_frames,
            fake_percentage,
            mean_prediction,
            std_prediction,
            mean_confidence,
        },
        suspicious_frames: suspicious,
        model_info: ModelReport {
            model_used: spec.name.clone(),
            threshold,
            frames_analyzed: total,
        },
    })
}
