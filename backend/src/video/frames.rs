use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::process::Command;

use crate::error::AnalysisError;
use crate::video::probe::{self, VideoMetadata};

/// One sampled frame, decoded lazily from disk when preprocessing reaches it.
#[derive(Debug, Clone)]
pub struct FrameHandle {
    /// Position in the sampled sequence, 0-based.
    pub index: usize,
    /// Playback time of the frame in seconds.
    pub timestamp: f64,
    pub path: PathBuf,
}

/// The sampled frame sequence for one task. Dropping it removes the backing
/// directory, so pixel data never outlives the task's processing scope.
pub struct SampledFrames {
    _dir: TempDir,
    pub frames: Vec<FrameHandle>,
    pub effective_rate: f64,
    pub video: VideoMetadata,
}

impl SampledFrames {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        dir: TempDir,
        frames: Vec<FrameHandle>,
        effective_rate: f64,
        video: VideoMetadata,
    ) -> Self {
        Self {
            _dir: dir,
            frames,
            effective_rate,
            video,
        }
    }
}

/// Sample frames from `video_path` at up to `rate` frames per second, capped
/// at `max_frames` chosen evenly across the whole duration.
///
/// The effective rate never exceeds the native frame rate, so low-fps inputs
/// are not upsampled. An unopenable container or a decode run yielding zero
/// frames fails with a `Decode` error.
pub async fn extract(
    video_path: &Path,
    rate: f64,
    max_frames: usize,
) -> Result<SampledFrames, AnalysisError> {
    let video = probe::probe(video_path).await?;
    let effective_rate = rate.min(video.fps);
    if effective_rate <= 0.0 || max_frames == 0 {
        return Err(AnalysisError::Decode(
            "frame sampling configuration yields no frames".to_string(),
        ));
    }

    which::which("ffmpeg")
        .map_err(|_| AnalysisError::Decode("ffmpeg not found in PATH".to_string()))?;

    let dir = tempfile::Builder::new().prefix("frames-").tempdir()?;
    let pattern = dir.path().join("frame_%06d.png");

    let output = Command::new("ffmpeg")
        .args(["-v", "error", "-i"])
        .arg(video_path)
        .args(["-vf", &format!("fps={effective_rate}"), "-start_number", "0"])
        .arg(&pattern)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(AnalysisError::Decode(format!(
            "ffmpeg failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let mut extracted: Vec<PathBuf> = std::fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "png"))
        .collect();
    extracted.sort();

    if extracted.is_empty() {
        return Err(AnalysisError::Decode(
            "video contains no decodable frames".to_string(),
        ));
    }

    let selected = select_evenly(extracted.len(), max_frames);
    let frames = selected
        .into_iter()
        .enumerate()
        .map(|(index, original)| FrameHandle {
            index,
            timestamp: original as f64 / effective_rate,
            path: extracted[original].clone(),
        })
        .collect::<Vec<_>>();

    log::debug!(
        "sampled {} of {} extracted frames at {:.2} fps from {}",
        frames.len(),
        extracted.len(),
        effective_rate,
        video_path.display()
    );

    Ok(SampledFrames {
        _dir: dir,
        frames,
        effective_rate,
        video,
    })
}

/// Pick at most `cap` indices out of `0..available`, spread evenly so the
/// first and last candidates are always kept.
fn select_evenly(available: usize, cap: usize) -> Vec<usize> {
    if available <= cap {
        return (0..available).collect();
    }
    if cap == 1 {
        return vec![0];
    }
    (0..cap).map(|i| i * (available - 1) / (cap - 1)).collect()
}
