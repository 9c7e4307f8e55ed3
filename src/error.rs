//! Error types for jobwarden.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::ExitCodes;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Batch system error: {0}")]
    Batch(#[from] BatchError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Operator error: {0}")]
    Operator(#[from] OperatorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not serialize output: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    /// Exit code the binary reports for this error.
    pub fn exit_code(&self, codes: &ExitCodes) -> i32 {
        match self {
            Self::Run(e) => e.exit_code(codes),
            Self::Config(_) => codes.fatal,
            _ => codes.default,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Sidecar record errors.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Could not read record {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: BatchError,
    },

    #[error("Could not write record {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: BatchError,
    },

    #[error("Could not parse record {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Could not serialize record: {0}")]
    Serialize(String),

    #[error("Invalid record: {0}")]
    Invalid(String),

    #[error("No job record found in {0}")]
    NotFound(PathBuf),

    #[error("More than one job record found in {0}")]
    Ambiguous(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecordError {
    /// The record was made read-only by a kill.
    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            Self::Write {
                source: BatchError::Locked(_),
                ..
            }
        )
    }
}

/// Batch system and transport errors.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Batch system '{0}' is not registered")]
    NotRegistered(String),

    #[error("No available batch system detected")]
    NoneAvailable,

    #[error("Not running inside a {system} job: {var} is not set")]
    NotInJob { system: String, var: String },

    #[error("Command `{command}` failed with exit code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Could not parse scheduler output: {0}")]
    Parse(String),

    #[error("File {0} is locked")]
    Locked(PathBuf),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Archiver errors.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Invalid archive pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("Archive {0} is the working directory itself")]
    SameDirectory(PathBuf),

    #[error("Archive transfer failed: {0}")]
    Transfer(#[from] BatchError),
}

/// Runner errors. Each maps to a stable exit code.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Not running in a jobwarden environment: {0}")]
    NotInEnvironment(String),

    #[error("Fatal runner error: {0}")]
    Fatal(String),

    #[error("Job was killed without informing the runner")]
    KilledWithoutNotice,

    #[error("Script execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("Unexpected runner error: {0}")]
    Internal(String),
}

impl RunError {
    pub fn exit_code(&self, codes: &ExitCodes) -> i32 {
        match self {
            Self::NotInEnvironment(_) => codes.not_in_environment,
            Self::Fatal(_) => codes.fatal,
            Self::KilledWithoutNotice => codes.killed_without_notice,
            Self::Internal(_) => codes.unexpected,
            _ => codes.default,
        }
    }
}

/// Errors of the kill/sync/wipe commands.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("Job {job_id} {reason}")]
    NotSuitable { job_id: String, reason: String },

    #[error("Job {0} has no known working directory")]
    NoDestination(String),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Result type alias for jobwarden.
pub type Result<T> = std::result::Result<T, Error>;
