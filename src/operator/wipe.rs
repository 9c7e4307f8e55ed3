use std::path::Path;

use super::Operator;
use crate::error::OperatorError;
use crate::state::RealState;

/// Deletes a job's working directory on its main node.
pub struct Wiper {
    op: Operator,
}

impl Wiper {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Refuse jobs whose working directory is in use, gone, or missing.
    pub async fn ensure_suitable(&self) -> Result<(), OperatorError> {
        let real = self.op.status().await?.real;
        if real.is_queued_family() {
            return Err(self.op.not_suitable(format!("is {real} and does not have a working directory yet")));
        }
        if matches!(real, RealState::Running | RealState::Suspended) {
            return Err(self.op.not_suitable(format!("is {real}, deleting its working directory is not safe")));
        }
        if real == RealState::Finished {
            return Err(self.op.not_suitable("has finished, its working directory no longer exists"));
        }
        if self.op.is_exiting_successfully(real) {
            return Err(self.op.not_suitable("is finishing successfully, its working directory no longer exists"));
        }
        if self.op.record().destination().is_none() {
            return Err(OperatorError::NoDestination(self.op.job_id().to_string()));
        }
        if self.work_dir_is_input_dir() {
            return Err(self.op.not_suitable("ran in its submission directory, which cannot be deleted"));
        }
        Ok(())
    }

    /// Delete the working directory. Returns the job id.
    ///
    /// The submission directory is never deleted, forced or not.
    pub async fn wipe(&self) -> Result<String, OperatorError> {
        let record = self.op.record();
        let (host, work_dir) = record
            .destination()
            .ok_or_else(|| OperatorError::NoDestination(record.job_id.clone()))?;
        if self.work_dir_is_input_dir() {
            return Err(self.op.not_suitable("ran in its submission directory, which cannot be deleted"));
        }

        tracing::info!(host = %host, work_dir = %work_dir.display(), "Deleting working directory");
        self.op.batch().delete_dir(host, work_dir).await?;
        Ok(record.job_id.clone())
    }

    /// The same path can name different directories on different hosts, so the
    /// paths only count as equal for jobs that ran on shared storage or on the
    /// submission host.
    fn work_dir_is_input_dir(&self) -> bool {
        let record = self.op.record();
        let Some((host, work_dir)) = record.destination() else {
            return false;
        };
        same_dir(work_dir, &record.input_dir) && (!record.uses_scratch() || host == record.input_machine)
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::test_support::Fixture;
    use crate::record::Resources;
    use crate::retry::Retryer;
    use crate::state::{BatchState, NaiveState};

    async fn wiper(f: &Fixture) -> Wiper {
        Wiper::new(Operator::load(&f.record_path, &f.registry, Retryer::once()).await.unwrap())
    }

    #[tokio::test]
    async fn failed_job_working_dir_is_deleted() {
        let f = Fixture::new();
        let work_dir = f.work_dir();
        std::fs::create_dir_all(&work_dir).unwrap();
        std::fs::write(work_dir.join("core"), "x").unwrap();
        let mut record = f.running_record(&work_dir);
        record.job_state = NaiveState::Failed;
        record.job_exit_code = Some(1);
        f.write(&record, BatchState::Finished);

        let wiper = wiper(&f).await;
        wiper.ensure_suitable().await.unwrap();
        assert_eq!(wiper.wipe().await.unwrap(), "42.server");
        assert!(!work_dir.exists());
        assert!(f.input_dir.exists());
    }

    #[tokio::test]
    async fn active_or_finished_jobs_are_not_suitable() {
        for (state, batch) in [
            (NaiveState::Queued, BatchState::Queued),
            (NaiveState::Running, BatchState::Running),
            (NaiveState::Running, BatchState::Suspended),
            (NaiveState::Finished, BatchState::Finished),
        ] {
            let f = Fixture::new();
            let mut record = f.running_record(&f.work_dir());
            record.job_state = state;
            f.write(&record, batch);
            let err = wiper(&f).await.ensure_suitable().await.unwrap_err();
            assert!(matches!(err, OperatorError::NotSuitable { .. }), "{state} / {batch}");
        }
    }

    #[tokio::test]
    async fn submission_directory_is_never_wiped() {
        let f = Fixture::new();
        let mut record = f.running_record(&f.input_dir);
        record.job_state = NaiveState::Killed;
        record.resources = Resources {
            work_dir: Some("input_dir".to_string()),
            ..Resources::default()
        };
        f.write(&record, BatchState::Finished);

        let wiper = wiper(&f).await;
        assert!(wiper.ensure_suitable().await.is_err());
        assert!(wiper.wipe().await.is_err());
        assert!(f.input_dir.exists());
    }
}
