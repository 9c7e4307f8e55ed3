//! Commands a user runs against a job from its submission directory.
//!
//! Each operator loads the job's record, resolves the batch system that runs
//! the job, and judges the job by its reconciled state before acting.
//! [`Clearer`] works on a whole directory and judges every record in it.

mod clear;
mod kill;
mod sync;
mod wipe;

use std::path::Path;
use std::sync::Arc;

pub use clear::{Cleared, Clearer};
pub use kill::Killer;
pub use sync::Syncer;
pub use wipe::Wiper;

use crate::batch::{BatchRegistry, BatchSystem};
use crate::error::{OperatorError, RecordError};
use crate::record::{JobRecord, JobStatus, SidecarStore};
use crate::retry::Retryer;
use crate::state::RealState;

/// A loaded job record together with its batch system.
pub struct Operator {
    store: SidecarStore,
    record: JobRecord,
    batch: Arc<dyn BatchSystem>,
}

impl Operator {
    /// Load the record at `path` on the local host.
    pub async fn load(path: &Path, registry: &BatchRegistry, retryer: Retryer) -> Result<Self, OperatorError> {
        let text = tokio::fs::read_to_string(path).await.map_err(RecordError::from)?;
        let record = JobRecord::from_yaml(&text, path)?;
        let batch = registry.get(&record.batch_system)?;
        let host = batch.transport().local_host().to_string();
        tracing::debug!(path = %path.display(), job_id = %record.job_id, batch_system = %batch.name(), "Loaded job record");

        Ok(Self {
            store: SidecarStore::new(path, &host, Arc::clone(&batch), retryer),
            record,
            batch,
        })
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn job_id(&self) -> &str {
        &self.record.job_id
    }

    pub fn batch(&self) -> &dyn BatchSystem {
        self.batch.as_ref()
    }

    /// Whether `job_id` names the loaded job.
    pub fn is_job(&self, job_id: &str) -> bool {
        self.record.matches_job(job_id)
    }

    /// The job's state as recorded, as reported by the scheduler, and reconciled.
    pub async fn status(&self) -> Result<JobStatus, OperatorError> {
        Ok(self.record.status(self.batch.as_ref()).await?)
    }

    fn not_suitable(&self, reason: impl Into<String>) -> OperatorError {
        OperatorError::NotSuitable {
            job_id: self.record.job_id.clone(),
            reason: reason.into(),
        }
    }

    /// Killed, or exiting without an exit code (the runner is handling a kill).
    fn is_killed(&self, real: RealState) -> bool {
        real == RealState::Killed || (real == RealState::Exiting && self.record.job_exit_code.is_none())
    }

    fn is_exiting_successfully(&self, real: RealState) -> bool {
        real == RealState::Exiting && self.record.job_exit_code == Some(0)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use chrono::NaiveDate;

    use crate::batch::{BatchRegistry, BatchSystem, FakeBatch};
    use crate::record::JobRecord;
    use crate::state::{BatchState, NaiveState};

    pub struct Fixture {
        pub root: tempfile::TempDir,
        pub input_dir: PathBuf,
        pub record_path: PathBuf,
        pub fake: Arc<FakeBatch>,
        pub registry: BatchRegistry,
    }

    impl Fixture {
        pub fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let input_dir = root.path().join("input");
            std::fs::create_dir_all(&input_dir).unwrap();
            let fake = Arc::new(FakeBatch::new(root.path().join("scratch")));
            let mut registry = BatchRegistry::new();
            registry.register(Arc::clone(&fake) as Arc<dyn BatchSystem>);
            Self {
                record_path: input_dir.join("job.jwinfo"),
                root,
                input_dir,
                fake,
                registry,
            }
        }

        pub fn record(&self, state: NaiveState) -> JobRecord {
            let time = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap().and_hms_opt(8, 0, 0).unwrap();
            let mut record = JobRecord::new_queued("Fake", "42.server", "job.sh", "localhost", &self.input_dir, time);
            record.job_state = state;
            record
        }

        pub fn write(&self, record: &JobRecord, batch_state: BatchState) {
            std::fs::write(&self.record_path, record.to_yaml().unwrap()).unwrap();
            self.fake.set_job(&record.job_id, batch_state, &["node1"]);
        }

        pub fn work_dir(&self) -> PathBuf {
            self.root.path().join("scratch").join("work")
        }

        pub fn running_record(&self, work_dir: &Path) -> JobRecord {
            let mut record = self.record(NaiveState::Running);
            record.main_node = Some("localhost".to_string());
            record.work_dir = Some(work_dir.to_path_buf());
            record
        }
    }
}
