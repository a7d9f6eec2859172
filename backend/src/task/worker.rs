use shared::TaskSnapshot;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{ModelSpec, Settings};
use crate::detect::aggregate::{self, AggregationConfig, DetectionScore};
use crate::detect::cache::DetectorCache;
use crate::detect::model::FrameScorer;
use crate::detect::preprocess;
use crate::error::AnalysisError;
use crate::storage::results_store::{self, ResultsStore};
use crate::task::registry::TaskRegistry;
use crate::video::frames::{self, SampledFrames};

/// One unit of background work: a saved upload bound to a task record.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub task_id: Uuid,
    pub video_path: PathBuf,
    pub model: ModelSpec,
}

/// Services every worker needs, shared by reference.
#[derive(Clone)]
pub struct WorkerContext {
    pub settings: Arc<Settings>,
    pub registry: Arc<TaskRegistry>,
    pub detectors: Arc<DetectorCache>,
    pub store: Arc<ResultsStore>,
}

/// Fixed pool of background workers fed by a bounded channel. Submission
/// enqueues and returns; backpressure shows up as a capacity rejection, never
/// as an unbounded queue.
#[derive(Clone)]
pub struct WorkerPool {
    sender: mpsc::Sender<AnalysisJob>,
}

impl WorkerPool {
    pub fn start(ctx: WorkerContext) -> Self {
        let (sender, receiver) = mpsc::channel(ctx.settings.max_concurrent_tasks.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        for worker_id in 0..ctx.settings.worker_count.max(1) {
            let receiver = receiver.clone();
            let ctx = ctx.clone();
            actix_web::rt::spawn(worker_loop(worker_id, receiver, ctx));
        }
        Self { sender }
    }

    pub fn dispatch(&self, job: AnalysisJob) -> Result<(), AnalysisError> {
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                AnalysisError::Capacity(self.sender.max_capacity())
            }
            mpsc::error::TrySendError::Closed(_) => {
                AnalysisError::Internal("worker pool is not running".to_string())
            }
        })
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<AnalysisJob>>>,
    ctx: WorkerContext,
) {
    log::info!("analysis worker {worker_id} started");
    loop {
        // Hold the receiver lock only while waiting for the next job; each
        // task is then owned end-to-end by this worker.
        let job = { receiver.lock().await.recv().await };
        let Some(job) = job else { break };
        log::info!("worker {worker_id} picked up task {}", job.task_id);
        run_job(&ctx, job).await;
    }
    log::info!("analysis worker {worker_id} stopped");
}

/// Drive one task to a terminal state, bounded by the per-task wall-clock
/// timeout, and clean up the uploaded file on every exit path.
async fn run_job(ctx: &WorkerContext, job: AnalysisJob) {
    let task_id = job.task_id;
    let video_path = job.video_path.clone();

    let outcome = tokio::time::timeout(ctx.settings.task_timeout, process_task(ctx, &job)).await;
    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(_) => Some(AnalysisError::Timeout(ctx.settings.task_timeout.as_secs())),
    };
    if let Some(error) = error {
        log::warn!("task {task_id} failed: {error}");
        if let Some(snapshot) = ctx.registry.fail(task_id, error.failure()) {
            persist(ctx, &snapshot).await;
        }
    }

    if let Err(e) = tokio::fs::remove_file(&video_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("could not remove upload {}: {e}", video_path.display());
        }
    }
}

async fn process_task(ctx: &WorkerContext, job: &AnalysisJob) -> Result<(), AnalysisError> {
    let registry = &ctx.registry;
    let task_id = job.task_id;

    // A cancel that landed while the job sat in the queue already finished
    // the task; the claim fails and the job is dropped.
    if !registry.begin_processing(task_id) {
        log::info!("task {task_id} no longer runnable, dropping job");
        return Ok(());
    }

    registry.update_progress(task_id, 5);
    let frames = frames::extract(
        &job.video_path,
        ctx.settings.frame_rate,
        ctx.settings.max_frames,
    )
    .await?;
    log::info!(
        "task {task_id}: sampled {} frames at {:.2} fps from a {:.1}s {}x{} video",
        frames.len(),
        frames.effective_rate,
        frames.video.duration,
        frames.video.width,
        frames.video.height
    );
    registry.update_progress(task_id, 20);
    checkpoint(registry, task_id)?;

    let scorer = ctx.detectors.get(&job.model).await?;
    let scores = score_frames(
        registry,
        task_id,
        &frames,
        scorer.as_ref(),
        ctx.settings.batch_size,
    )
    .await?;
    // Frame pixel data is released before aggregation begins.
    drop(frames);

    checkpoint(registry, task_id)?;
    registry.update_progress(task_id, 95);
    let result = aggregate::aggregate(
        &job.model,
        &scores,
        AggregationConfig {
            fake_majority_pct: ctx.settings.fake_majority_pct,
            top_n: ctx.settings.suspicious_top_n,
        },
    )?;

    if let Some(snapshot) = registry.complete(task_id, result) {
        persist(ctx, &snapshot).await;
    }
    Ok(())
}

/// Preprocess and score sampled frames batch by batch, walking progress from
/// 20 to 90 proportional to frames consumed. Cancellation is honored between
/// batches; a corrupt frame is skipped and counted, an inference error fails
/// the whole task.
pub(crate) async fn score_frames(
    registry: &TaskRegistry,
    task_id: Uuid,
    frames: &SampledFrames,
    scorer: &dyn FrameScorer,
    batch_size: usize,
) -> Result<Vec<DetectionScore>, AnalysisError> {
    let spec = scorer.spec().clone();
    let total = frames.len();
    let batch_size = batch_size.max(1);
    let mut scores = Vec::with_capacity(total);
    let mut skipped = 0usize;
    let mut consumed = 0usize;

    for chunk in frames.frames.chunks(batch_size) {
        checkpoint(registry, task_id)?;

        let handles = chunk.to_vec();
        let chunk_spec = spec.clone();
        let decoded = tokio::task::spawn_blocking(move || {
            handles
                .iter()
                .map(|handle| preprocess::load_frame(handle, &chunk_spec))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| AnalysisError::Internal(format!("preprocess task aborted: {e}")))?;

        let mut batch = Vec::new();
        for item in decoded {
            match item {
                Ok(tensor) => batch.push(tensor),
                Err(e) => {
                    skipped += 1;
                    log::warn!("task {task_id}: skipping frame: {e}");
                }
            }
        }

        if !batch.is_empty() {
            let meta: Vec<(usize, f64)> = batch
                .iter()
                .map(|t| (t.frame_index, t.timestamp))
                .collect();
            let probabilities = scorer.predict_batch(batch).await?;
            for ((frame_index, timestamp), probability) in meta.into_iter().zip(probabilities) {
                scores.push(DetectionScore {
                    frame_index,
                    timestamp,
                    fake_probability: probability,
                    confidence: aggregate::frame_confidence(probability, spec.threshold),
                });
            }
        }

        consumed += chunk.len();
        let pct = 20 + (consumed as f64 / total as f64 * 70.0) as u8;
        registry.update_progress(task_id, pct.min(90));
    }

    if skipped > 0 {
        log::warn!("task {task_id}: {skipped}/{total} frames failed preprocessing");
    }
    Ok(scores)
}

async fn persist(ctx: &WorkerContext, snapshot: &TaskSnapshot) {
    match results_store::to_stored(snapshot) {
        Some(record) => {
            if let Err(e) = ctx.store.save(&record).await {
                log::error!(
                    "failed to persist result for task {}: {e}",
                    snapshot.task_id
                );
            }
        }
        None => log::error!(
            "task {} reached persist without a terminal snapshot",
            snapshot.task_id
        ),
    }
}

fn checkpoint(registry: &TaskRegistry, task_id: Uuid) -> Result<(), AnalysisError> {
    if registry.cancel_requested(task_id) {
        return Err(AnalysisError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelRegistry;
    use crate::detect::model::testing::{FailingScorer, ScriptedScorer};
    use crate::task::registry::NewTask;
    use crate::video::frames::FrameHandle;
    use crate::video::probe::VideoMetadata;
    use image::{Rgb, RgbImage};
    use shared::Verdict;
    use tempfile::TempDir;

    fn spec() -> ModelSpec {
        ModelRegistry::builtin().get("mesonet").unwrap().clone()
    }

    /// Frames on disk as a worker would see them after extraction.
    /// `corrupt` indices get garbage bytes instead of a PNG.
    fn frames_on_disk(count: usize, corrupt: &[usize]) -> SampledFrames {
        let dir = TempDir::new().unwrap();
        let mut handles = Vec::new();
        for index in 0..count {
            let path = dir.path().join(format!("frame_{index:06}.png"));
            if corrupt.contains(&index) {
                std::fs::write(&path, b"garbage").unwrap();
            } else {
                let mut img = RgbImage::new(16, 16);
                for pixel in img.pixels_mut() {
                    *pixel = Rgb([index as u8, 100, 200]);
                }
                img.save(&path).unwrap();
            }
            handles.push(FrameHandle {
                index,
                timestamp: index as f64,
                path,
            });
        }
        SampledFrames::from_parts(
            dir,
            handles,
            1.0,
            VideoMetadata {
                duration: count as f64,
                fps: 30.0,
                width: 16,
                height: 16,
            },
        )
    }

    fn processing_task(registry: &TaskRegistry) -> Uuid {
        let id = registry
            .submit(NewTask {
                filename: "clip.mp4".to_string(),
                model_name: "mesonet".to_string(),
                content_digest: "digest".to_string(),
            })
            .unwrap();
        assert!(registry.begin_processing(id));
        id
    }

    #[actix_web::test]
    async fn scoring_feeds_a_fake_majority_verdict() {
        let registry = TaskRegistry::new(4);
        let id = processing_task(&registry);
        let frames = frames_on_disk(10, &[]);
        // 6 of 10 frames above threshold.
        let scorer = ScriptedScorer::new(
            spec(),
            vec![0.9, 0.8, 0.7, 0.9, 0.8, 0.6, 0.1, 0.2, 0.1, 0.2],
        );

        let scores = score_frames(&registry, id, &frames, &scorer, 4).await.unwrap();
        assert_eq!(scores.len(), 10);

        let result = aggregate::aggregate(
            &spec(),
            &scores,
            AggregationConfig {
                fake_majority_pct: 50.0,
                top_n: 5,
            },
        )
        .unwrap();
        assert_eq!(result.prediction, Verdict::Fake);
        assert_eq!(result.statistics.fake_frames, 6);
        assert!((result.statistics.fake_percentage - 60.0).abs() < 1e-4);
    }

    #[actix_web::test]
    async fn progress_walks_the_inference_band() {
        let registry = TaskRegistry::new(4);
        let id = processing_task(&registry);
        registry.update_progress(id, 20);
        let frames = frames_on_disk(8, &[]);
        let scorer = ScriptedScorer::new(spec(), vec![0.4]);

        score_frames(&registry, id, &frames, &scorer, 2).await.unwrap();
        // 8/8 frames consumed: 20 + 70 = 90.
        assert_eq!(registry.snapshot(id).unwrap().progress, 90);
    }

    #[actix_web::test]
    async fn corrupt_frames_are_skipped_not_fatal() {
        let registry = TaskRegistry::new(4);
        let id = processing_task(&registry);
        let frames = frames_on_disk(6, &[1, 4]);
        let scorer = ScriptedScorer::new(spec(), vec![0.9]);

        let scores = score_frames(&registry, id, &frames, &scorer, 3).await.unwrap();
        assert_eq!(scores.len(), 4);
        let indices: Vec<_> = scores.iter().map(|s| s.frame_index).collect();
        assert_eq!(indices, vec![0, 2, 3, 5]);
    }

    #[actix_web::test]
    async fn all_corrupt_frames_end_in_empty_result() {
        let registry = TaskRegistry::new(4);
        let id = processing_task(&registry);
        let frames = frames_on_disk(4, &[0, 1, 2, 3]);
        let scorer = ScriptedScorer::new(spec(), vec![0.9]);

        let scores = score_frames(&registry, id, &frames, &scorer, 2).await.unwrap();
        assert!(scores.is_empty());

        let err = aggregate::aggregate(
            &spec(),
            &scores,
            AggregationConfig {
                fake_majority_pct: 50.0,
                top_n: 5,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyResult(_)));
    }

    #[actix_web::test]
    async fn cancellation_stops_at_the_next_batch() {
        let registry = TaskRegistry::new(4);
        let id = processing_task(&registry);
        let frames = frames_on_disk(4, &[]);
        registry.request_cancel(id).unwrap();

        let scorer = ScriptedScorer::new(spec(), vec![0.9]);
        let err = score_frames(&registry, id, &frames, &scorer, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));
    }

    #[actix_web::test]
    async fn inference_failure_is_fatal_for_the_batch() {
        let registry = TaskRegistry::new(4);
        let id = processing_task(&registry);
        let frames = frames_on_disk(4, &[]);
        let scorer = FailingScorer::new(spec());

        let err = score_frames(&registry, id, &frames, &scorer, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Inference(_)));
    }
}
