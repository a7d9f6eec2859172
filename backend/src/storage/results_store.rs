use shared::{ResultPage, StoredResult, TaskSnapshot};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::error::AnalysisError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StoreError> for AnalysisError {
    fn from(err: StoreError) -> Self {
        AnalysisError::Internal(err.to_string())
    }
}

/// Project a terminal task snapshot into its durable history record.
/// Non-terminal snapshots have no stored form.
pub fn to_stored(snapshot: &TaskSnapshot) -> Option<StoredResult> {
    if !snapshot.status.is_terminal() {
        return None;
    }
    let completed_at = snapshot.completed_at?;
    Some(StoredResult {
        task_id: snapshot.task_id,
        filename: snapshot.filename.clone(),
        model_name: snapshot.model_name.clone(),
        content_digest: snapshot.content_digest.clone(),
        status: snapshot.status,
        prediction: snapshot.result.as_ref().map(|r| r.prediction),
        confidence: snapshot.result.as_ref().map(|r| r.confidence),
        fake_probability: snapshot.result.as_ref().map(|r| r.fake_probability),
        error: snapshot.error.clone(),
        created_at: snapshot.created_at,
        completed_at,
    })
}

/// Durable log of terminal task outcomes, one JSON file per task. File names
/// carry a sortable UTC stamp, so lexicographic order is completion order.
/// Records are written once and never updated.
#[derive(Clone)]
pub struct ResultsStore {
    dir: PathBuf,
}

impl ResultsStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        log::info!("results store at {}", dir.display());
        Ok(Self { dir })
    }

    fn file_name(record: &StoredResult) -> String {
        format!(
            "{}_{}.json",
            record.completed_at.format("%Y%m%d%H%M%S"),
            record.task_id
        )
    }

    fn id_suffix(task_id: Uuid) -> String {
        format!("_{task_id}.json")
    }

    pub async fn save(&self, record: &StoredResult) -> Result<(), StoreError> {
        let path = self.dir.join(Self::file_name(record));
        let payload = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, payload).await?;
        log::debug!("stored result for task {}", record.task_id);
        Ok(())
    }

    /// Page through stored results, newest first. `has_more` tells the caller
    /// whether another page exists past this one.
    pub async fn list(&self, limit: usize, offset: usize) -> Result<ResultPage, StoreError> {
        let mut paths = self.record_paths().await?;
        paths.sort();
        paths.reverse();

        let total = paths.len();
        let mut results = Vec::new();
        for path in paths.into_iter().skip(offset).take(limit) {
            match self.read_record(&path).await {
                Ok(record) => results.push(record),
                Err(e) => log::warn!("skipping unreadable record {}: {e}", path.display()),
            }
        }
        Ok(ResultPage {
            results,
            has_more: offset + limit < total,
        })
    }

    pub async fn load(&self, task_id: Uuid) -> Result<Option<StoredResult>, StoreError> {
        match self.find_by_id(task_id).await? {
            Some(path) => Ok(Some(self.read_record(&path).await?)),
            None => Ok(None),
        }
    }

    /// Delete by task id. Idempotent: deleting an absent record is Ok(false).
    pub async fn delete(&self, task_id: Uuid) -> Result<bool, StoreError> {
        match self.find_by_id(task_id).await? {
            Some(path) => {
                tokio::fs::remove_file(&path).await?;
                log::info!("deleted stored result {task_id}");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    async fn find_by_id(&self, task_id: Uuid) -> Result<Option<PathBuf>, StoreError> {
        let suffix = Self::id_suffix(task_id);
        let paths = self.record_paths().await?;
        Ok(paths.into_iter().find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix))
        }))
    }

    async fn read_record(&self, path: &Path) -> Result<StoredResult, StoreError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
