//! In-memory batch system for tests and dry runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BatchJobInfo, BatchSystem, Transport};
use crate::error::BatchError;
use crate::state::BatchState;

/// A scheduler call recorded by [`FakeBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Kill(String),
    ForceKill(String),
    Resubmit {
        input_machine: String,
        input_dir: PathBuf,
        command_line: Vec<String>,
    },
}

/// Batch system that keeps its job table in memory and moves files locally.
pub struct FakeBatch {
    name: String,
    available: bool,
    job_id: Option<String>,
    scratch_root: PathBuf,
    transport: Transport,
    jobs: Mutex<HashMap<String, BatchJobInfo>>,
    calls: Mutex<Vec<FakeCall>>,
}

impl FakeBatch {
    /// Fake whose scratch directories are created under `scratch_root`.
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            name: "Fake".to_string(),
            available: true,
            job_id: None,
            scratch_root: scratch_root.into(),
            transport: Transport::local_only(),
            jobs: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Pretend the current process runs inside `job_id`.
    pub fn with_current_job(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }

    /// Set what the scheduler reports for `job_id`.
    pub fn set_job(&self, job_id: &str, state: BatchState, nodes: &[&str]) {
        let info = BatchJobInfo {
            state,
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
        };
        self.lock_jobs().insert(job_id.to_string(), info);
    }

    /// Calls made so far, oldest first.
    pub fn calls(&self) -> Vec<FakeCall> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record_call(&self, call: FakeCall) {
        match self.calls.lock() {
            Ok(mut calls) => calls.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, BatchJobInfo>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn kill_job(&self, job_id: &str) -> Result<(), BatchError> {
        let mut jobs = self.lock_jobs();
        match jobs.get_mut(job_id) {
            Some(info) if info.state != BatchState::Finished => {
                info.state = BatchState::Exiting;
                Ok(())
            }
            _ => Err(BatchError::CommandFailed {
                command: format!("kill {job_id}"),
                code: 1,
                stderr: "unknown job".to_string(),
            }),
        }
    }
}

#[async_trait]
impl BatchSystem for FakeBatch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    fn current_job_id(&self) -> Result<String, BatchError> {
        self.job_id.clone().ok_or_else(|| BatchError::NotInJob {
            system: self.name.clone(),
            var: "current job".to_string(),
        })
    }

    fn transport(&self) -> &Transport {
        &self.transport
    }

    async fn scratch_dir(&self, job_id: &str) -> Result<PathBuf, BatchError> {
        let dir = self.scratch_root.join(format!("job_{job_id}"));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn job_info(&self, job_id: &str) -> Result<BatchJobInfo, BatchError> {
        Ok(self
            .lock_jobs()
            .get(job_id)
            .cloned()
            .unwrap_or_else(BatchJobInfo::unknown))
    }

    async fn kill(&self, job_id: &str) -> Result<(), BatchError> {
        self.record_call(FakeCall::Kill(job_id.to_string()));
        self.kill_job(job_id)
    }

    async fn force_kill(&self, job_id: &str) -> Result<(), BatchError> {
        self.record_call(FakeCall::ForceKill(job_id.to_string()));
        self.kill_job(job_id)
    }

    async fn resubmit(
        &self,
        input_machine: &str,
        input_dir: &Path,
        command_line: &[String],
    ) -> Result<(), BatchError> {
        self.record_call(FakeCall::Resubmit {
            input_machine: input_machine.to_string(),
            input_dir: input_dir.to_path_buf(),
            command_line: command_line.to_vec(),
        });
        Ok(())
    }
}
