//! Slurm backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::remote::run_command;
use super::{BatchJobInfo, BatchSystem, Transport, current_username, on_path};
use crate::error::BatchError;
use crate::state::BatchState;

const JOB_ID_VAR: &str = "SLURM_JOB_ID";
const DEFAULT_SCRATCH_ROOT: &str = "/scratch";

/// Slurm, driven through `scontrol` and `scancel`.
pub struct Slurm {
    transport: Transport,
    command_timeout: Duration,
    scratch_root: PathBuf,
}

impl Slurm {
    pub fn new(transport: Transport, command_timeout: Duration) -> Self {
        Self {
            transport,
            command_timeout,
            scratch_root: PathBuf::from(DEFAULT_SCRATCH_ROOT),
        }
    }

    /// Use a different filesystem for per-job scratch directories.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    async fn scontrol(&self, args: &[&str]) -> Result<String, BatchError> {
        let mut cmd = Command::new("scontrol");
        cmd.args(args);
        let shown = format!("scontrol {}", args.join(" "));
        run_command(cmd, &shown, self.command_timeout, None).await
    }

    async fn scancel(&self, args: &[&str]) -> Result<(), BatchError> {
        let mut cmd = Command::new("scancel");
        cmd.args(args);
        let shown = format!("scancel {}", args.join(" "));
        tracing::debug!(command = %shown, "Killing job");
        run_command(cmd, &shown, self.command_timeout, None).await?;
        Ok(())
    }

    /// Expand a compact node list like `node[01-03]`.
    async fn expand_nodes(&self, compact: &str) -> Vec<String> {
        match self.scontrol(&["show", "hostnames", compact]).await {
            Ok(out) => out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            Err(e) => {
                tracing::warn!(nodes = %compact, error = %e, "Could not expand node list");
                vec![compact.to_string()]
            }
        }
    }
}

#[async_trait]
impl BatchSystem for Slurm {
    fn name(&self) -> &str {
        "Slurm"
    }

    async fn is_available(&self) -> bool {
        on_path("sbatch")
    }

    fn current_job_id(&self) -> Result<String, BatchError> {
        std::env::var(JOB_ID_VAR).map_err(|_| BatchError::NotInJob {
            system: "Slurm".to_string(),
            var: JOB_ID_VAR.to_string(),
        })
    }

    fn transport(&self) -> &Transport {
        &self.transport
    }

    async fn scratch_dir(&self, job_id: &str) -> Result<PathBuf, BatchError> {
        let dir = self
            .scratch_root
            .join(current_username())
            .join("jobwarden")
            .join(format!("job_{job_id}"));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn job_info(&self, job_id: &str) -> Result<BatchJobInfo, BatchError> {
        let out = match self.scontrol(&["show", "job", "-o", job_id]).await {
            Ok(out) => out,
            Err(BatchError::CommandFailed { stderr, .. }) => {
                tracing::debug!(job_id = %job_id, stderr = %stderr, "scontrol has no information about job");
                return Ok(BatchJobInfo::unknown());
            }
            Err(e) => return Err(e),
        };

        let fields = parse_fields(&out);
        let state = fields
            .get("JobState")
            .map(|s| convert_state(s, fields.get("Reason").map(String::as_str)))
            .unwrap_or(BatchState::Unknown);
        let nodes = match fields.get("NodeList") {
            Some(list) if !list.contains("None") && !list.is_empty() => {
                self.expand_nodes(list).await
            }
            _ => Vec::new(),
        };
        Ok(BatchJobInfo { state, nodes })
    }

    async fn kill(&self, job_id: &str) -> Result<(), BatchError> {
        self.scancel(&[job_id]).await
    }

    async fn force_kill(&self, job_id: &str) -> Result<(), BatchError> {
        self.scancel(&["--signal=KILL", job_id]).await
    }
}

/// Split one-line `scontrol -o` output into its `Key=Value` fields.
pub(crate) fn parse_fields(line: &str) -> HashMap<String, String> {
    line.split_whitespace()
        .filter_map(|field| field.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub(crate) fn convert_state(raw: &str, reason: Option<&str>) -> BatchState {
    let word = raw.split_whitespace().next().unwrap_or_default();
    match word {
        "PENDING" | "REQUEUED" | "CONFIGURING" => {
            if reason.is_some_and(|r| r.contains("Dependency")) {
                BatchState::Held
            } else {
                BatchState::Queued
            }
        }
        "RUNNING" => BatchState::Running,
        "SUSPENDED" | "PREEMPTED" => BatchState::Suspended,
        "COMPLETING" => BatchState::Exiting,
        "COMPLETED" | "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY"
        | "BOOT_FAIL" | "DEADLINE" => BatchState::Finished,
        _ => BatchState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scontrol_line() {
        let line = "JobId=991 JobName=md+0001 UserId=alice(1000) JobState=RUNNING Reason=None \
                    NodeList=node[01-02] BatchHost=node01";
        let fields = parse_fields(line);
        assert_eq!(fields["JobState"], "RUNNING");
        assert_eq!(fields["NodeList"], "node[01-02]");
        assert_eq!(fields["UserId"], "alice(1000)");
    }

    #[test]
    fn state_conversion() {
        assert_eq!(convert_state("PENDING", Some("Priority")), BatchState::Queued);
        assert_eq!(convert_state("PENDING", Some("Dependency")), BatchState::Held);
        assert_eq!(convert_state("RUNNING", None), BatchState::Running);
        assert_eq!(convert_state("PREEMPTED", None), BatchState::Suspended);
        assert_eq!(convert_state("COMPLETING", None), BatchState::Exiting);
        assert_eq!(convert_state("CANCELLED by 1000", None), BatchState::Finished);
        assert_eq!(convert_state("SPECIAL_EXIT", None), BatchState::Unknown);
    }

    #[tokio::test]
    async fn scratch_dir_lives_under_root() {
        let root = tempfile::tempdir().unwrap();
        let slurm = Slurm::new(Transport::local_only(), Duration::from_secs(5))
            .with_scratch_root(root.path());
        let dir = slurm.scratch_dir("77").await.unwrap();
        assert!(dir.is_dir());
        assert!(dir.ends_with("jobwarden/job_77"));
    }
}
