//! Batch system capability.
//!
//! A [`BatchSystem`] is everything jobwarden needs from a scheduler: live job
//! state, scratch allocation, killing, resubmission and moving files between
//! the hosts involved in a job. Backends are collected in an explicit
//! [`BatchRegistry`] built once at start-up.

mod fake;
mod pbs;
pub mod remote;
mod slurm;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

pub use fake::{FakeBatch, FakeCall};
pub use pbs::Pbs;
pub use remote::Transport;
pub use slurm::Slurm;

use crate::config::Config;
use crate::error::BatchError;
use crate::state::BatchState;

/// Live information about a job as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJobInfo {
    pub state: BatchState,
    /// Nodes assigned to the job, main node first.
    pub nodes: Vec<String>,
}

impl BatchJobInfo {
    /// Info for a job the scheduler does not know.
    pub fn unknown() -> Self {
        Self {
            state: BatchState::Unknown,
            nodes: Vec::new(),
        }
    }
}

/// A scheduler backend.
///
/// File operations default to the backend's [`Transport`]; backends only
/// override them when the scheduler offers something better.
#[async_trait]
pub trait BatchSystem: Send + Sync {
    /// Name stored in job records, e.g. `PBS`.
    fn name(&self) -> &str;

    /// Whether this scheduler can be used from the current host.
    async fn is_available(&self) -> bool;

    /// Id of the job this process runs in.
    fn current_job_id(&self) -> Result<String, BatchError>;

    fn transport(&self) -> &Transport;

    /// Scratch directory allocated for `job_id`. Must exist when returned.
    async fn scratch_dir(&self, job_id: &str) -> Result<PathBuf, BatchError>;

    /// Live state and node list of a job. Unknown jobs report [`BatchState::Unknown`].
    async fn job_info(&self, job_id: &str) -> Result<BatchJobInfo, BatchError>;

    async fn kill(&self, job_id: &str) -> Result<(), BatchError>;

    async fn force_kill(&self, job_id: &str) -> Result<(), BatchError>;

    /// Run a complete submission command line from `input_dir` on `input_machine`.
    async fn resubmit(
        &self,
        input_machine: &str,
        input_dir: &Path,
        command_line: &[String],
    ) -> Result<(), BatchError> {
        let args: Vec<String> = command_line.iter().map(|a| remote::quote_str(a)).collect();
        let cmd = format!("cd {} && {}", remote::shell_quote(input_dir), args.join(" "));
        tracing::info!(host = %input_machine, command = %cmd, "Resubmitting job");
        self.transport().run_shell(input_machine, &cmd).await?;
        Ok(())
    }

    async fn read_file(&self, host: &str, path: &Path) -> Result<String, BatchError> {
        self.transport().read_file(host, path).await
    }

    async fn write_file(&self, host: &str, path: &Path, content: &str) -> Result<(), BatchError> {
        self.transport().write_file(host, path, content).await
    }

    async fn lock_file(&self, host: &str, path: &Path) -> Result<(), BatchError> {
        self.transport().lock_file(host, path).await
    }

    async fn make_dir(&self, host: &str, path: &Path) -> Result<(), BatchError> {
        self.transport().make_dir(host, path).await
    }

    async fn list_dir(&self, host: &str, path: &Path) -> Result<Vec<PathBuf>, BatchError> {
        self.transport().list_dir(host, path).await
    }

    async fn move_files(
        &self,
        host: &str,
        sources: &[PathBuf],
        destinations: &[PathBuf],
    ) -> Result<(), BatchError> {
        self.transport().move_files(host, sources, destinations).await
    }

    async fn remove_files(&self, host: &str, paths: &[PathBuf]) -> Result<(), BatchError> {
        self.transport().remove_files(host, paths).await
    }

    async fn delete_dir(&self, host: &str, path: &Path) -> Result<(), BatchError> {
        self.transport().delete_dir(host, path).await
    }

    async fn sync_with_exclusions(
        &self,
        src_dir: &Path,
        dest_dir: &Path,
        src_host: Option<&str>,
        dest_host: Option<&str>,
        exclude: &[PathBuf],
    ) -> Result<(), BatchError> {
        self.transport()
            .sync_with_exclusions(src_dir, dest_dir, src_host, dest_host, exclude)
            .await
    }

    async fn sync_selected(
        &self,
        src_dir: &Path,
        dest_dir: &Path,
        src_host: Option<&str>,
        dest_host: Option<&str>,
        include: &[PathBuf],
    ) -> Result<(), BatchError> {
        self.transport()
            .sync_selected(src_dir, dest_dir, src_host, dest_host, include)
            .await
    }
}

/// Registry of available batch systems, keyed by lowercase name.
pub struct BatchRegistry {
    systems: HashMap<String, Arc<dyn BatchSystem>>,
    /// Registration order, used for detection.
    order: Vec<String>,
}

impl BatchRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            systems: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Registry with the PBS and Slurm backends.
    pub fn with_defaults(config: &Config) -> Self {
        let mut registry = Self::new();
        let transport = Transport::new(&config.timeouts, config.shared_submit);
        registry.register(Arc::new(Pbs::new(transport.clone(), config.timeouts.ssh)));
        registry.register(Arc::new(Slurm::new(transport, config.timeouts.ssh)));
        registry
    }

    /// Register a backend, replacing one with the same name.
    pub fn register(&mut self, system: Arc<dyn BatchSystem>) {
        let key = system.name().to_lowercase();
        if self.systems.insert(key.clone(), system).is_none() {
            self.order.push(key.clone());
        }
        tracing::debug!("Registered batch system: {}", key);
    }

    /// Look up a backend by name, case-insensitively.
    pub fn get(&self, name: &str) -> Result<Arc<dyn BatchSystem>, BatchError> {
        self.systems
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| BatchError::NotRegistered(name.to_string()))
    }

    /// Pick the backend to use: `preferred` if given, otherwise the first available one.
    pub async fn detect(&self, preferred: Option<&str>) -> Result<Arc<dyn BatchSystem>, BatchError> {
        if let Some(name) = preferred {
            return self.get(name);
        }
        for key in &self.order {
            let system = &self.systems[key];
            if system.is_available().await {
                tracing::debug!(batch_system = %system.name(), "Detected batch system");
                return Ok(Arc::clone(system));
            }
        }
        Err(BatchError::NoneAvailable)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|k| self.systems[k].name()).collect()
    }
}

impl Default for BatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `program` can be found on `PATH`.
pub(crate) fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// Name of the user running this process.
pub fn current_username() -> String {
    if let Ok(user) = std::env::var("USER")
        && !user.is_empty()
    {
        return user;
    }
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => user.name,
        _ => nix::unistd::getuid().to_string(),
    }
}
