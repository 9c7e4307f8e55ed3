//! Loading, saving and locking a record on the host that owns it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::JobRecord;
use crate::batch::BatchSystem;
use crate::error::RecordError;
use crate::retry::Retryer;

/// A record file at `path` on `host`, accessed through a batch system's transport.
#[derive(Clone)]
pub struct SidecarStore {
    path: PathBuf,
    host: String,
    batch: Arc<dyn BatchSystem>,
    retryer: Retryer,
}

impl SidecarStore {
    pub fn new(path: impl Into<PathBuf>, host: &str, batch: Arc<dyn BatchSystem>, retryer: Retryer) -> Self {
        Self {
            path: path.into(),
            host: host.to_string(),
            batch,
            retryer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Load the record, retrying transient failures.
    pub async fn load(&self) -> Result<JobRecord, RecordError> {
        self.retryer.run(|| self.load_once()).await
    }

    /// Single load attempt.
    pub async fn load_once(&self) -> Result<JobRecord, RecordError> {
        tracing::debug!(path = %self.path.display(), host = %self.host, "Loading job record");
        let text = self
            .batch
            .read_file(&self.host, &self.path)
            .await
            .map_err(|source| RecordError::Read {
                path: self.path.clone(),
                source,
            })?;
        JobRecord::from_yaml(&text, &self.path)
    }

    /// Save the whole record, retrying transient failures. A locked record fails at once.
    pub async fn save(&self, record: &JobRecord) -> Result<(), RecordError> {
        self.retryer
            .run_if(|| self.save_once(record), |e| !e.is_locked())
            .await
    }

    /// Single save attempt.
    pub async fn save_once(&self, record: &JobRecord) -> Result<(), RecordError> {
        tracing::debug!(path = %self.path.display(), host = %self.host, state = %record.job_state, "Saving job record");
        let content = record.to_yaml()?;
        self.batch
            .write_file(&self.host, &self.path, &content)
            .await
            .map_err(|source| RecordError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Make the record read-only for everyone.
    pub async fn lock(&self) -> Result<(), RecordError> {
        self.batch
            .lock_file(&self.host, &self.path)
            .await
            .map_err(|source| RecordError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// The single record file (ending in `suffix`) in `dir`.
pub async fn find_record(dir: &Path, suffix: &str) -> Result<PathBuf, RecordError> {
    let mut found = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.to_string_lossy().ends_with(suffix) && entry.file_type().await?.is_file() {
            found.push(path);
        }
    }
    match found.len() {
        0 => Err(RecordError::NotFound(dir.to_path_buf())),
        1 => Ok(found.remove(0)),
        _ => Err(RecordError::Ambiguous(dir.to_path_buf())),
    }
}
