use chrono::{DateTime, Utc};
use shared::{DetectionResult, FailureKind, TaskFailure, TaskSnapshot, TaskStatus};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AnalysisError;

pub struct NewTask {
    pub filename: String,
    pub model_name: String,
    pub content_digest: String,
}

#[derive(Debug, Clone)]
struct TaskRecord {
    task_id: Uuid,
    status: TaskStatus,
    progress: u8,
    filename: String,
    model_name: String,
    content_digest: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<DetectionResult>,
    error: Option<TaskFailure>,
    cancel_requested: bool,
}

impl TaskRecord {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id,
            status: self.status,
            progress: self.progress,
            filename: self.filename.clone(),
            model_name: self.model_name.clone(),
            content_digest: self.content_digest.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }

    /// Terminal transition. `completed_at` is written exactly once, here.
    fn finish(&mut self, status: TaskStatus, result: Option<DetectionResult>, error: Option<TaskFailure>) {
        self.status = status;
        self.result = result;
        self.error = error;
        self.completed_at = Some(Utc::now());
        if status == TaskStatus::Completed {
            self.progress = 100;
        }
    }
}

/// Owns every task record and is the only mutation path for them. All
/// mutations run under the write lock, so readers never observe a
/// half-updated record; the worker owning a task and the cancel path are
/// the only writers.
pub struct TaskRegistry {
    max_active: usize,
    tasks: RwLock<HashMap<Uuid, TaskRecord>>,
}

impl TaskRegistry {
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active: max_active.max(1),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a new task, or reject with a capacity error once the number of
    /// non-terminal tasks reaches the ceiling. Rejected submissions leave no
    /// record behind.
    pub fn submit(&self, new: NewTask) -> Result<Uuid, AnalysisError> {
        let mut tasks = self.tasks.write().unwrap();
        let active = tasks.values().filter(|t| !t.status.is_terminal()).count();
        if active >= self.max_active {
            return Err(AnalysisError::Capacity(self.max_active));
        }
        let task_id = Uuid::new_v4();
        tasks.insert(
            task_id,
            TaskRecord {
                task_id,
                status: TaskStatus::Uploaded,
                progress: 0,
                filename: new.filename,
                model_name: new.model_name,
                content_digest: new.content_digest,
                created_at: Utc::now(),
                completed_at: None,
                result: None,
                error: None,
                cancel_requested: false,
            },
        );
        Ok(task_id)
    }

    pub fn snapshot(&self, task_id: Uuid) -> Result<TaskSnapshot, AnalysisError> {
        let tasks = self.tasks.read().unwrap();
        tasks
            .get(&task_id)
            .map(TaskRecord::snapshot)
            .ok_or(AnalysisError::NotFound(task_id))
    }

    pub fn contains(&self, task_id: Uuid) -> bool {
        self.tasks.read().unwrap().contains_key(&task_id)
    }

    pub fn active_count(&self) -> usize {
        let tasks = self.tasks.read().unwrap();
        tasks.values().filter(|t| !t.status.is_terminal()).count()
    }

    /// Cancel a task. Idempotent: terminal tasks are untouched. A task still
    /// waiting in the queue fails right away and its terminal snapshot is
    /// returned for persistence; a processing task is only flagged and fails
    /// at its worker's next checkpoint.
    pub fn request_cancel(&self, task_id: Uuid) -> Result<Option<TaskSnapshot>, AnalysisError> {
        let mut tasks = self.tasks.write().unwrap();
        let record = tasks
            .get_mut(&task_id)
            .ok_or(AnalysisError::NotFound(task_id))?;
        match record.status {
            TaskStatus::Completed | TaskStatus::Failed => Ok(None),
            TaskStatus::Uploaded => {
                record.cancel_requested = true;
                record.finish(
                    TaskStatus::Failed,
                    None,
                    Some(TaskFailure::new(FailureKind::Cancelled, "cancelled by client")),
                );
                Ok(Some(record.snapshot()))
            }
            TaskStatus::Processing => {
                record.cancel_requested = true;
                Ok(None)
            }
        }
    }

    pub fn cancel_requested(&self, task_id: Uuid) -> bool {
        let tasks = self.tasks.read().unwrap();
        tasks
            .get(&task_id)
            .map(|t| t.cancel_requested)
            .unwrap_or(false)
    }

    /// Claim an uploaded task for processing. Returns false when the task is
    /// gone or already terminal (a cancel won the race), in which case the
    /// worker must drop the job.
    pub fn begin_processing(&self, task_id: Uuid) -> bool {
        let mut tasks = self.tasks.write().unwrap();
        match tasks.get_mut(&task_id) {
            Some(record) if record.status == TaskStatus::Uploaded => {
                record.status = TaskStatus::Processing;
                true
            }
            _ => false,
        }
    }

    /// Raise the progress of a processing task. Values at or below the
    /// current progress are ignored, so progress never moves backwards, and
    /// 100 is reserved for completion.
    pub fn update_progress(&self, task_id: Uuid, progress: u8) {
        let mut tasks = self.tasks.write().unwrap();
        if let Some(record) = tasks.get_mut(&task_id) {
            if record.status == TaskStatus::Processing && progress > record.progress {
                record.progress = progress.min(99);
            }
        }
    }

    /// Terminal success. Returns the final snapshot for persistence, or None
    /// when the task is unknown or already terminal.
    pub fn complete(&self, task_id: Uuid, result: DetectionResult) -> Option<TaskSnapshot> {
        let mut tasks = self.tasks.write().unwrap();
        let record = tasks.get_mut(&task_id)?;
        if record.status.is_terminal() {
            return None;
        }
        record.finish(TaskStatus::Completed, Some(result), None);
        Some(record.snapshot())
    }

    /// Terminal failure. Same contract as `complete`.
    pub fn fail(&self, task_id: Uuid, failure: TaskFailure) -> Option<TaskSnapshot> {
        let mut tasks = self.tasks.write().unwrap();
        let record = tasks.get_mut(&task_id)?;
        if record.status.is_terminal() {
            return None;
        }
        record.finish(TaskStatus::Failed, None, Some(failure));
        Some(record.snapshot())
    }

    /// Remove a terminal task record. Running tasks stay with their worker.
    pub fn remove_terminal(&self, task_id: Uuid) -> bool {
        let mut tasks = self.tasks.write().unwrap();
        match tasks.get(&task_id) {
            Some(record) if record.status.is_terminal() => {
                tasks.remove(&task_id);
                true
            }
            _ => false,
        }
    }

    /// Roll back a submission whose job could not be enqueued. Only tasks
    /// still in `uploaded` state can be discarded.
    pub fn discard_unstarted(&self, task_id: Uuid) {
        let mut tasks = self.tasks.write().unwrap();
        if tasks
            .get(&task_id)
            .is_some_and(|t| t.status == TaskStatus::Uploaded)
        {
            tasks.remove(&task_id);
        }
    }

    /// Evict terminal records older than `max_age`, returning how many went.
    pub fn sweep_finished(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::hours(24));
        let mut tasks = self.tasks.write().unwrap();
        let before = tasks.len();
        tasks.retain(|_, record| {
            !(record.status.is_terminal()
                && record.completed_at.is_some_and(|done| done < cutoff))
        });
        before - tasks.len()
    }
}
