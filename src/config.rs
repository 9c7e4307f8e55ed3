//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable names read by jobwarden.
pub mod env {
    /// Path to the job's sidecar record.
    pub const INFO: &str = "JOBWARDEN_INFO";
    /// Host the job was submitted from.
    pub const INPUT_MACHINE: &str = "JOBWARDEN_INPUT_MACHINE";
    /// Set by the submitter; guards against running the runner by hand.
    pub const ENV_SET: &str = "JOBWARDEN_ENV_SET";
    /// Preferred batch system name.
    pub const BATCH_SYSTEM: &str = "JOBWARDEN_BATCH_SYSTEM";
    /// Set when the submission dir lives on storage shared with compute nodes.
    pub const SHARED_SUBMIT: &str = "JOBWARDEN_SHARED_SUBMIT";
    /// Enables debug logging when no RUST_LOG is given.
    pub const DEBUG: &str = "JOBWARDEN_DEBUG";

    pub const RETRY_TRIES: &str = "JOBWARDEN_RETRY_TRIES";
    pub const RETRY_WAIT_SECS: &str = "JOBWARDEN_RETRY_WAIT_SECS";
    pub const ARCHIVER_RETRY_TRIES: &str = "JOBWARDEN_ARCHIVER_RETRY_TRIES";
    pub const ARCHIVER_RETRY_WAIT_SECS: &str = "JOBWARDEN_ARCHIVER_RETRY_WAIT_SECS";
    pub const SIGTERM_GRACE_SECS: &str = "JOBWARDEN_SIGTERM_GRACE_SECS";
    pub const SSH_TIMEOUT_SECS: &str = "JOBWARDEN_SSH_TIMEOUT_SECS";
    pub const RSYNC_TIMEOUT_SECS: &str = "JOBWARDEN_RSYNC_TIMEOUT_SECS";
}

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub runner: RunnerConfig,
    pub archiver: ArchiverConfig,
    pub timeouts: TimeoutConfig,
    pub suffixes: SuffixConfig,
    pub exit_codes: ExitCodes,
    /// printf-style suffix appended to a loop job's name for each cycle.
    pub loop_job_pattern: LoopJobPattern,
    /// Submission directories are visible from compute nodes.
    pub shared_submit: bool,
}

/// Runner behaviour on the compute node.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Attempts for record load/save and directory syncing.
    pub retry_tries: u32,
    /// Pause between attempts.
    pub retry_wait: Duration,
    /// Subdirectory created inside the scheduler's scratch allocation.
    pub scratch_dir_inner: String,
    /// Grace period between SIGTERM and SIGKILL for the script.
    pub sigterm_to_sigkill: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry_tries: 3,
            retry_wait: Duration::from_secs(300), // 5 minutes
            scratch_dir_inner: "main".to_string(),
            sigterm_to_sigkill: Duration::from_secs(5),
        }
    }
}

/// Archiver retry policy.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    pub retry_tries: u32,
    pub retry_wait: Duration,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            retry_tries: 3,
            retry_wait: Duration::from_secs(300),
        }
    }
}

/// Upper bounds for remote commands.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub ssh: Duration,
    pub rsync: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ssh: Duration::from_secs(60),
            rsync: Duration::from_secs(600), // 10 minutes
        }
    }
}

/// File suffixes of jobwarden's runtime files.
#[derive(Debug, Clone)]
pub struct SuffixConfig {
    pub record: String,
    pub runner_output: String,
    pub stdout: String,
    pub stderr: String,
}

impl SuffixConfig {
    /// All runtime suffixes, in the order runtime files are archived.
    pub fn all(&self) -> [&str; 4] {
        [&self.record, &self.runner_output, &self.stdout, &self.stderr]
    }
}

impl Default for SuffixConfig {
    fn default() -> Self {
        Self {
            record: ".jwinfo".to_string(),
            runner_output: ".jwout".to_string(),
            stdout: ".out".to_string(),
            stderr: ".err".to_string(),
        }
    }
}

/// Stable exit codes of the runner.
#[derive(Debug, Clone, Copy)]
pub struct ExitCodes {
    /// Runner invoked outside a jobwarden job.
    pub not_in_environment: i32,
    /// Error that was recorded in the sidecar record.
    pub default: i32,
    /// Error before the record could be loaded; nothing was recorded.
    pub fatal: i32,
    /// Job was killed before the runner was notified.
    pub killed_without_notice: i32,
    /// Bug or other unexpected error.
    pub unexpected: i32,
    /// Runner received SIGTERM.
    pub terminated: i32,
}

impl Default for ExitCodes {
    fn default() -> Self {
        Self {
            not_in_environment: 90,
            default: 91,
            fatal: 92,
            killed_without_notice: 93,
            unexpected: 99,
            terminated: 143,
        }
    }
}

/// Pattern appended to loop job names, e.g. `run+0003`.
#[derive(Debug, Clone)]
pub struct LoopJobPattern(pub String);

impl Default for LoopJobPattern {
    fn default() -> Self {
        Self("+%04d".to_string())
    }
}

impl Config {
    /// Build configuration from defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_var::<u32>(env::RETRY_TRIES)? {
            config.runner.retry_tries = v;
        }
        if let Some(v) = parse_var::<u64>(env::RETRY_WAIT_SECS)? {
            config.runner.retry_wait = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>(env::SIGTERM_GRACE_SECS)? {
            config.runner.sigterm_to_sigkill = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u32>(env::ARCHIVER_RETRY_TRIES)? {
            config.archiver.retry_tries = v;
        }
        if let Some(v) = parse_var::<u64>(env::ARCHIVER_RETRY_WAIT_SECS)? {
            config.archiver.retry_wait = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>(env::SSH_TIMEOUT_SECS)? {
            config.timeouts.ssh = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>(env::RSYNC_TIMEOUT_SECS)? {
            config.timeouts.rsync = Duration::from_secs(v);
        }
        config.shared_submit = std::env::var_os(env::SHARED_SUBMIT).is_some();

        Ok(config)
    }

    /// Configuration with no waiting between retries. Used by tests and dry runs.
    pub fn without_retry_waits(mut self) -> Self {
        self.runner.retry_wait = Duration::ZERO;
        self.archiver.retry_wait = Duration::ZERO;
        self
    }
}

fn parse_var<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}
