use std::path::PathBuf;

use super::Operator;
use crate::error::OperatorError;

/// Copies files from a job's working directory back to its submission directory.
pub struct Syncer {
    op: Operator,
}

impl Syncer {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// A queued job has nothing to fetch yet.
    pub async fn ensure_suitable(&self) -> Result<(), OperatorError> {
        let status = self.op.status().await?;
        if status.real.is_queued_family() {
            return Err(self.op.not_suitable(format!("is {} and has no working directory yet", status.real)));
        }
        Ok(())
    }

    /// Fetch `files` (names relative to the working directory), or everything if empty.
    pub async fn sync(&self, files: &[String]) -> Result<(), OperatorError> {
        let record = self.op.record();
        let (host, work_dir) = record
            .destination()
            .ok_or_else(|| OperatorError::NoDestination(record.job_id.clone()))?;

        let batch = self.op.batch();
        if files.is_empty() {
            tracing::info!(host = %host, work_dir = %work_dir.display(), "Fetching all files from the working directory");
            batch
                .sync_with_exclusions(work_dir, &record.input_dir, Some(host), None, &[])
                .await?;
        } else {
            tracing::info!(host = %host, files = %files.join(" "), "Fetching selected files from the working directory");
            let selected: Vec<PathBuf> = files.iter().map(|f| work_dir.join(f)).collect();
            batch
                .sync_selected(work_dir, &record.input_dir, Some(host), None, &selected)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::test_support::Fixture;
    use crate::retry::Retryer;
    use crate::state::{BatchState, NaiveState};

    async fn syncer(f: &Fixture) -> Syncer {
        Syncer::new(Operator::load(&f.record_path, &f.registry, Retryer::once()).await.unwrap())
    }

    fn running_job(f: &Fixture) {
        let work_dir = f.work_dir();
        std::fs::create_dir_all(work_dir.join("traj")).unwrap();
        std::fs::write(work_dir.join("result.dat"), "42").unwrap();
        std::fs::write(work_dir.join("log.txt"), "log").unwrap();
        std::fs::write(work_dir.join("traj").join("frame1"), "f").unwrap();
        f.write(&f.running_record(&work_dir), BatchState::Running);
    }

    #[tokio::test]
    async fn sync_all_files() {
        let f = Fixture::new();
        running_job(&f);
        let syncer = syncer(&f).await;

        syncer.ensure_suitable().await.unwrap();
        syncer.sync(&[]).await.unwrap();

        assert!(f.input_dir.join("result.dat").exists());
        assert!(f.input_dir.join("log.txt").exists());
        assert!(f.input_dir.join("traj").join("frame1").exists());
        assert!(f.work_dir().join("result.dat").exists());
    }

    #[tokio::test]
    async fn sync_selected_files() {
        let f = Fixture::new();
        running_job(&f);

        syncer(&f).await.sync(&["result.dat".to_string()]).await.unwrap();

        assert!(f.input_dir.join("result.dat").exists());
        assert!(!f.input_dir.join("log.txt").exists());
    }

    #[tokio::test]
    async fn queued_job_is_not_suitable() {
        let f = Fixture::new();
        f.write(&f.record(NaiveState::Queued), BatchState::Held);
        let err = syncer(&f).await.ensure_suitable().await.unwrap_err();
        assert!(matches!(err, OperatorError::NotSuitable { .. }));
    }

    #[tokio::test]
    async fn job_without_destination_cannot_sync() {
        let f = Fixture::new();
        f.write(&f.record(NaiveState::Failed), BatchState::Finished);
        let err = syncer(&f).await.sync(&[]).await.unwrap_err();
        assert!(matches!(err, OperatorError::NoDestination(_)));
    }
}
