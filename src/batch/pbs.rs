//! PBS Pro backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::remote::run_command;
use super::{BatchJobInfo, BatchSystem, Transport, on_path};
use crate::error::BatchError;
use crate::state::BatchState;

const JOB_ID_VAR: &str = "PBS_JOBID";
const SCRATCH_VAR: &str = "SCRATCHDIR";

/// PBS Pro, driven through `qstat` and `qdel`.
pub struct Pbs {
    transport: Transport,
    command_timeout: Duration,
}

impl Pbs {
    pub fn new(transport: Transport, command_timeout: Duration) -> Self {
        Self {
            transport,
            command_timeout,
        }
    }

    async fn qdel(&self, args: &[&str]) -> Result<(), BatchError> {
        let mut cmd = Command::new("qdel");
        cmd.args(args);
        let shown = format!("qdel {}", args.join(" "));
        tracing::debug!(command = %shown, "Killing job");
        run_command(cmd, &shown, self.command_timeout, None).await?;
        Ok(())
    }
}

#[async_trait]
impl BatchSystem for Pbs {
    fn name(&self) -> &str {
        "PBS"
    }

    async fn is_available(&self) -> bool {
        on_path("qsub")
    }

    fn current_job_id(&self) -> Result<String, BatchError> {
        std::env::var(JOB_ID_VAR).map_err(|_| BatchError::NotInJob {
            system: "PBS".to_string(),
            var: JOB_ID_VAR.to_string(),
        })
    }

    fn transport(&self) -> &Transport {
        &self.transport
    }

    /// PBS allocates the scratch itself and exposes it in the job's environment.
    async fn scratch_dir(&self, job_id: &str) -> Result<PathBuf, BatchError> {
        match std::env::var(SCRATCH_VAR) {
            Ok(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
            _ => Err(BatchError::Unsupported(format!(
                "scratch directory for job '{job_id}' is undefined ({SCRATCH_VAR} not set)"
            ))),
        }
    }

    async fn job_info(&self, job_id: &str) -> Result<BatchJobInfo, BatchError> {
        let mut cmd = Command::new("qstat");
        cmd.args(["-fxw", job_id]);
        let shown = format!("qstat -fxw {job_id}");
        match run_command(cmd, &shown, self.command_timeout, None).await {
            Ok(out) => Ok(parse_job_info(&out)),
            // qstat fails for jobs it no longer knows
            Err(BatchError::CommandFailed { stderr, .. }) => {
                tracing::debug!(job_id = %job_id, stderr = %stderr, "qstat has no information about job");
                Ok(BatchJobInfo::unknown())
            }
            Err(e) => Err(e),
        }
    }

    async fn kill(&self, job_id: &str) -> Result<(), BatchError> {
        self.qdel(&[job_id]).await
    }

    async fn force_kill(&self, job_id: &str) -> Result<(), BatchError> {
        self.qdel(&["-W", "force", job_id]).await
    }
}

/// Parse `qstat -f` output into key/value pairs.
pub(crate) fn parse_dump(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.trim_end().split_once(" = "))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

pub(crate) fn parse_job_info(text: &str) -> BatchJobInfo {
    let info = parse_dump(text);
    let state = info
        .get("job_state")
        .map(|s| BatchState::from_code(s))
        .unwrap_or(BatchState::Unknown);
    let nodes = info
        .get("exec_host2")
        .or_else(|| info.get("exec_host"))
        .map(|raw| {
            raw.split('+')
                .map(|n| clean_node_name(n.trim()))
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default();
    BatchJobInfo { state, nodes }
}

/// `(node1.cluster:15002/3*4)` becomes `node1.cluster`.
fn clean_node_name(raw: &str) -> String {
    let host = raw.split(':').next().unwrap_or(raw);
    let host = host.split('/').next().unwrap_or(host);
    host.replace(['(', ')'], "")
}
