//! Job execution on the compute node.
//!
//! The runner is started by the scheduler in place of the user's script. It
//! loads the job record, prepares a working directory, runs the script, and
//! records the outcome. Every record write after the start re-reads the record
//! first so that a kill issued from elsewhere always wins.
//!
//! ```text
//!   load ─► set_up ─► prepare ─► execute ─► finalize
//!                                   │           │
//!                                   └── SIGTERM ┴─► killed, exit 143
//! ```

mod process;
pub mod termination;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use tokio_util::sync::CancellationToken;

pub use process::ScriptProcess;
pub use termination::install_termination_handler;

use crate::archive::{Archiver, pattern};
use crate::batch::{BatchRegistry, BatchSystem};
use crate::config::{Config, env};
use crate::error::RunError;
use crate::record::{JobRecord, SidecarStore};
use crate::retry::Retryer;
use crate::state::NaiveState;

/// Inputs the runner takes from its environment.
#[derive(Debug, Clone)]
pub struct RunnerEnv {
    /// Path of the job record on the input machine.
    pub info_file: PathBuf,
    /// Host the job was submitted from.
    pub input_machine: String,
    /// Batch system to read the record with, if one is named.
    pub batch_system: Option<String>,
}

impl RunnerEnv {
    /// Read the runner environment. Fails if this process was not started by jobwarden.
    pub fn from_env() -> Result<Self, RunError> {
        if std::env::var_os(env::ENV_SET).is_none() {
            return Err(RunError::NotInEnvironment(format!("{} is not set", env::ENV_SET)));
        }
        let info_file = std::env::var(env::INFO)
            .map_err(|_| RunError::Fatal(format!("{} is not set", env::INFO)))?;
        let input_machine = std::env::var(env::INPUT_MACHINE)
            .map_err(|_| RunError::Fatal(format!("{} is not set", env::INPUT_MACHINE)))?;
        Ok(Self {
            info_file: PathBuf::from(info_file),
            input_machine,
            batch_system: std::env::var(env::BATCH_SYSTEM).ok().filter(|s| !s.is_empty()),
        })
    }
}

/// How the script's execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// The script exited with this code.
    Exited(i32),
    /// The runner received SIGTERM while the script was running.
    Terminated,
}

/// Orchestrates a single job on the compute node.
pub struct Runner {
    config: Config,
    store: SidecarStore,
    record: JobRecord,
    batch: Arc<dyn BatchSystem>,
    retryer: Retryer,
    token: CancellationToken,
    input_dir: PathBuf,
    use_scratch: bool,
    archiver: Option<Archiver>,
    work_dir: Option<PathBuf>,
}

impl Runner {
    /// Load the job record. Any failure here is fatal: nothing can be recorded yet.
    pub async fn load(
        runner_env: RunnerEnv,
        registry: &BatchRegistry,
        config: Config,
        token: CancellationToken,
    ) -> Result<Self, RunError> {
        let retryer = Retryer::new(config.runner.retry_tries, config.runner.retry_wait);
        let bootstrap = registry
            .detect(runner_env.batch_system.as_deref())
            .await
            .map_err(|e| RunError::Fatal(e.to_string()))?;

        let store = SidecarStore::new(
            &runner_env.info_file,
            &runner_env.input_machine,
            Arc::clone(&bootstrap),
            retryer,
        );
        let record = store.load().await.map_err(|e| {
            RunError::Fatal(format!(
                "unable to load job record '{}' on '{}': {e}",
                runner_env.info_file.display(),
                runner_env.input_machine
            ))
        })?;

        // the record names the batch system that actually runs the job
        let batch = registry
            .get(&record.batch_system)
            .map_err(|e| RunError::Fatal(e.to_string()))?;
        let job_id = batch
            .current_job_id()
            .map_err(|e| RunError::Fatal(format!("job has no associated job id: {e}")))?;
        if !record.matches_job(&job_id) {
            return Err(RunError::Fatal(format!(
                "record '{}' belongs to job '{}', not to '{job_id}'",
                runner_env.info_file.display(),
                record.job_id
            )));
        }
        let store = SidecarStore::new(
            &runner_env.info_file,
            &runner_env.input_machine,
            Arc::clone(&batch),
            retryer,
        );

        tracing::info!(
            job_id = %record.job_id,
            batch_system = %batch.name(),
            host = %batch.transport().local_host(),
            version = env!("CARGO_PKG_VERSION"),
            "Initializing job"
        );

        let input_dir = if record.input_dir.as_os_str().is_empty() {
            runner_env
                .info_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
        } else {
            record.input_dir.clone()
        };

        Ok(Self {
            use_scratch: record.uses_scratch(),
            config,
            store,
            record,
            batch,
            retryer,
            token,
            input_dir,
            archiver: None,
            work_dir: None,
        })
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub fn uses_scratch(&self) -> bool {
        self.use_scratch
    }

    /// Set up the archiver of a loop job and archive the previous cycle's runtime files.
    pub async fn set_up(&mut self) -> Result<(), RunError> {
        tracing::debug!(input_dir = %self.input_dir.display(), use_scratch = self.use_scratch, "Setting up");
        let Some(loop_info) = self.record.loop_info.clone() else {
            return Ok(());
        };
        loop_info.validate(Some(self.input_dir.as_path()))?;

        let archiver = Archiver::new(
            &loop_info,
            &self.record.input_machine,
            &self.input_dir,
            Arc::clone(&self.batch),
            &self.config,
        );
        archiver.make_archive_dir().await?;

        if let Some(previous) = loop_info.previous_cycle()
            && let Some(suffix) = pattern::fill_printf(&self.config.loop_job_pattern.0, previous)
        {
            tracing::debug!(cycle = previous, "Archiving runtime files of previous cycle");
            let job_name = regex::escape(&format!("{}{}", self.record.script_name, suffix));
            archiver.archive_runtime_files(&job_name, previous).await?;
        }

        self.archiver = Some(archiver);
        Ok(())
    }

    /// Choose and populate the working directory.
    pub async fn prepare(&mut self) -> Result<(), RunError> {
        let work_dir = if self.use_scratch {
            self.set_up_scratch_dir().await?
        } else {
            tracing::info!(work_dir = %self.input_dir.display(), "Running in the submission directory");
            self.input_dir.clone()
        };

        if let (Some(archiver), Some(loop_info)) = (&self.archiver, &self.record.loop_info) {
            archiver.archive_from(&work_dir, Some(loop_info.current)).await?;
        }

        self.work_dir = Some(work_dir);
        Ok(())
    }

    async fn set_up_scratch_dir(&self) -> Result<PathBuf, RunError> {
        let job_id = &self.record.job_id;
        let scratch = self
            .retryer
            .run(|| self.batch.scratch_dir(job_id))
            .await?;
        let work_dir = scratch.join(&self.config.runner.scratch_dir_inner);
        tracing::info!(work_dir = %work_dir.display(), "Setting up working directory on scratch");

        let local = self.local_host();
        self.retryer
            .run(|| self.batch.make_dir(local, &work_dir))
            .await?;

        let mut excluded = self.record.excluded_files.clone();
        excluded.push(self.store.path().to_path_buf());
        if let Some(archiver) = &self.archiver {
            excluded.push(archiver.archive_dir().to_path_buf());
        }

        self.retryer
            .run(|| {
                self.batch.sync_with_exclusions(
                    &self.input_dir,
                    &work_dir,
                    Some(self.record.input_machine.as_str()),
                    None,
                    &excluded,
                )
            })
            .await?;
        Ok(work_dir)
    }

    /// Mark the job as running and run the script to completion.
    ///
    /// Fails with [`RunError::KilledWithoutNotice`] if the record already shows
    /// the job as killed; the script is not started in that case.
    pub async fn execute(&mut self) -> Result<Execution, RunError> {
        let work_dir = self
            .work_dir
            .clone()
            .ok_or_else(|| RunError::Internal("working directory was not prepared".to_string()))?;

        self.reload_and_ensure_not_killed().await?;
        let nodes = self.nodes().await;
        let main_node = self.local_host().to_string();
        self.record.set_running(now(), &main_node, nodes, &work_dir);
        self.store.save(&self.record).await?;

        let (stdout, stderr) = self.record.log_files(&self.config.suffixes);
        let script = work_dir.join(&self.record.script_name);
        let mut process =
            ScriptProcess::spawn(&script, &work_dir, &work_dir.join(stdout), &work_dir.join(stderr)).await?;

        let outcome = tokio::select! {
            status = process.wait() => Some(status),
            _ = self.token.cancelled() => None,
        };

        match outcome {
            Some(Ok(code)) => {
                tracing::info!(exit_code = code, "Script finished");
                Ok(Execution::Exited(code))
            }
            Some(Err(e)) => Err(RunError::Execution(e.to_string())),
            None => {
                self.update_killed().await;
                process.terminate(self.config.runner.sigterm_to_sigkill).await;
                Ok(Execution::Terminated)
            }
        }
    }

    /// Record the outcome of the script.
    ///
    /// On success: archive outputs, copy the working directory back and remove
    /// it (scratch only), mark finished and resubmit the next cycle. On failure
    /// the working directory is left alone.
    pub async fn finalize(&mut self, exit_code: i32) -> Result<(), RunError> {
        tracing::info!(exit_code, "Finalizing the execution");
        if exit_code != 0 {
            return self.update_failed(exit_code).await;
        }

        let work_dir = self
            .work_dir
            .clone()
            .ok_or_else(|| RunError::Internal("working directory was not prepared".to_string()))?;

        if let Some(archiver) = &self.archiver {
            archiver.archive_to(&work_dir).await?;
        }

        if self.use_scratch {
            self.retryer
                .run(|| {
                    self.batch.sync_with_exclusions(
                        &work_dir,
                        &self.input_dir,
                        None,
                        Some(self.record.input_machine.as_str()),
                        &[],
                    )
                })
                .await?;

            tracing::debug!(work_dir = %work_dir.display(), "Removing working directory");
            let local = self.local_host();
            self.retryer
                .run(|| self.batch.delete_dir(local, &work_dir))
                .await?;
        }

        self.update_finished().await?;
        self.resubmit().await
    }

    /// Record a failure and return the exit code the runner should report.
    pub async fn record_failure(&mut self, err: RunError) -> i32 {
        let codes = self.config.exit_codes;
        let code = err.exit_code(&codes);
        if matches!(err, RunError::KilledWithoutNotice) {
            tracing::error!(error = %err, "Aborting the job");
            return code;
        }

        tracing::error!(error = %err, exit_code = code, "Job failed");
        match self.update_failed(code).await {
            Ok(()) => code,
            Err(e) => {
                tracing::error!(error = %e, "Failure state NOT recorded, the job may be in an inconsistent state");
                e.exit_code(&codes)
            }
        }
    }

    /// Mark the job killed without a child process to stop. Returns the exit code.
    pub async fn terminate(&mut self) -> i32 {
        self.update_killed().await;
        self.config.exit_codes.terminated
    }

    async fn resubmit(&self) -> Result<(), RunError> {
        let Some(loop_info) = &self.record.loop_info else {
            return Ok(());
        };
        if loop_info.is_last_cycle() {
            tracing::info!(cycle = loop_info.current, "Final cycle of the loop job, not resubmitting");
            return Ok(());
        }

        let command_line = resubmit_command_line(&self.record.command_line, &self.record.job_id);
        tracing::info!(next_cycle = loop_info.current + 1, "Resubmitting the job");
        self.retryer
            .run(|| {
                self.batch
                    .resubmit(&self.record.input_machine, &self.input_dir, &command_line)
            })
            .await?;
        tracing::info!("Job successfully resubmitted");
        Ok(())
    }

    async fn reload_and_ensure_not_killed(&mut self) -> Result<(), RunError> {
        self.record = self.store.load().await?;
        if self.record.job_state == NaiveState::Killed {
            return Err(RunError::KilledWithoutNotice);
        }
        Ok(())
    }

    async fn update_finished(&mut self) -> Result<(), RunError> {
        self.reload_and_ensure_not_killed().await?;
        self.record.set_finished(now());
        if let Err(e) = self.store.save(&self.record).await {
            tracing::warn!(error = %e, "Could not update job record at job completion");
        }
        Ok(())
    }

    async fn update_failed(&mut self, exit_code: i32) -> Result<(), RunError> {
        self.reload_and_ensure_not_killed().await?;
        self.record.set_failed(now(), exit_code);
        if let Err(e) = self.store.save(&self.record).await {
            tracing::warn!(error = %e, "Could not update job record at job failure");
        }
        Ok(())
    }

    /// Single attempt; there is no time for retries once SIGTERM arrived.
    async fn update_killed(&mut self) {
        self.record.set_killed(now());
        if let Err(e) = self.store.save_once(&self.record).await {
            tracing::warn!(error = %e, "Could not update job record at job kill");
        }
    }

    async fn nodes(&self) -> Vec<String> {
        match self.batch.job_info(&self.record.job_id).await {
            Ok(info) if !info.nodes.is_empty() => info.nodes,
            Ok(_) => vec![self.local_host().to_string()],
            Err(e) => {
                tracing::warn!(error = %e, "Could not get the job's nodes from the batch system");
                vec![self.local_host().to_string()]
            }
        }
    }

    fn local_host(&self) -> &str {
        self.batch.transport().local_host()
    }
}

/// Drive a loaded runner through all steps and return the process exit code.
pub async fn run_job(mut runner: Runner) -> i32 {
    let token = runner.token.clone();

    let prepared = tokio::select! {
        res = async {
            runner.set_up().await?;
            runner.prepare().await
        } => Some(res),
        _ = token.cancelled() => None,
    };
    match prepared {
        Some(Ok(())) => {}
        Some(Err(e)) => return runner.record_failure(e).await,
        None => return runner.terminate().await,
    }

    let exit_code = match runner.execute().await {
        Ok(Execution::Exited(code)) => code,
        Ok(Execution::Terminated) => return runner.config.exit_codes.terminated,
        Err(e) => return runner.record_failure(e).await,
    };

    let finalized = tokio::select! {
        res = runner.finalize(exit_code) => Some(res),
        _ = token.cancelled() => None,
    };
    match finalized {
        Some(Ok(())) => exit_code,
        Some(Err(e)) => runner.record_failure(e).await,
        None => runner.terminate().await,
    }
}

/// Command line for the next cycle: drop earlier dependencies, depend on `job_id`.
pub fn resubmit_command_line(original: &[String], job_id: &str) -> Vec<String> {
    let mut modified = Vec::with_capacity(original.len() + 1);
    let mut args = original.iter();
    while let Some(arg) = args.next() {
        if arg.trim() == "--depend" {
            args.next();
        } else if !arg.contains("--depend") {
            modified.push(arg.clone());
        }
    }
    modified.push(format!("--depend=afterok={job_id}"));
    modified
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
