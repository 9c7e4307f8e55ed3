use chrono::Local;

use super::Operator;
use crate::error::OperatorError;
use crate::record::JobStatus;

/// Terminates a job through its batch system.
pub struct Killer {
    op: Operator,
}

impl Killer {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Refuse jobs that completed, were already killed, or are exiting.
    pub async fn ensure_suitable(&self) -> Result<JobStatus, OperatorError> {
        let status = self.op.status().await?;
        if status.real.is_completed() {
            return Err(self.op.not_suitable("is already completed"));
        }
        if self.op.is_killed(status.real) {
            return Err(self.op.not_suitable("has already been killed"));
        }
        if status.real == crate::state::RealState::Exiting {
            return Err(self.op.not_suitable("is in an exiting state"));
        }
        Ok(status)
    }

    /// Kill the job. Returns its id.
    ///
    /// The runner records the kill itself unless the job is not running yet, is
    /// suspended, or the kill is forced; in those cases the record is marked
    /// KILLED here and locked so a runner that starts late cannot overwrite it.
    pub async fn terminate(&mut self, force: bool) -> Result<String, OperatorError> {
        let status = self.op.status().await?;
        // decided before the scheduler sees the kill
        let should_update = self.should_update_record(status, force);

        let job_id = self.op.job_id().to_string();
        if force {
            self.op.batch().force_kill(&job_id).await?;
        } else {
            self.op.batch().kill(&job_id).await?;
        }
        tracing::info!(job_id = %job_id, force, "Kill request sent");

        if should_update {
            self.op.record.set_killed(Local::now().naive_local());
            self.op.store.save(&self.op.record).await?;
            self.op.store.lock().await?;
            tracing::debug!(path = %self.op.store.path().display(), "Record marked killed and locked");
        }
        Ok(job_id)
    }

    fn should_update_record(&self, status: JobStatus, force: bool) -> bool {
        let real = status.real;
        (force || real.is_queued_family() || real == crate::state::RealState::Suspended)
            && !real.is_completed()
            && !self.op.is_killed(real)
            && !real.is_undeterminable()
    }
}
