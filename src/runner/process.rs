//! The user's script as a child process.

use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tempfile::NamedTempFile;
use tokio::process::{Child, Command};

use crate::error::RunError;

/// A running script. The temporary copy it runs from lives as long as this handle.
pub struct ScriptProcess {
    child: Child,
    _script: NamedTempFile,
}

impl ScriptProcess {
    /// Run `script` with bash in `work_dir`, writing its output to `stdout` and `stderr`.
    ///
    /// The shebang line is dropped; the script always runs under bash.
    pub async fn spawn(script: &Path, work_dir: &Path, stdout: &Path, stderr: &Path) -> Result<Self, RunError> {
        let content = tokio::fs::read_to_string(script)
            .await
            .map_err(|e| RunError::Execution(format!("cannot read script '{}': {e}", script.display())))?;

        let mut copy = tempfile::Builder::new()
            .prefix("jobwarden-")
            .suffix(".sh")
            .tempfile()
            .map_err(|e| RunError::Execution(format!("cannot create script copy: {e}")))?;
        copy.write_all(strip_shebang(&content).as_bytes())
            .and_then(|_| copy.flush())
            .map_err(|e| RunError::Execution(format!("cannot write script copy: {e}")))?;

        let out = log_file(stdout).await?;
        let err = log_file(stderr).await?;

        let child = Command::new("bash")
            .arg(copy.path())
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .spawn()
            .map_err(|e| RunError::Execution(format!("failed to spawn script '{}': {e}", script.display())))?;

        tracing::info!(script = %script.display(), pid = ?child.id(), "Script started");
        Ok(Self {
            child,
            _script: copy,
        })
    }

    /// Wait for the script and return its exit code.
    pub async fn wait(&mut self) -> std::io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }

    /// Ask the script to stop, then kill it if it is still running after `grace`.
    pub async fn terminate(&mut self, grace: Duration) {
        if let Some(pid) = self.child.id().and_then(|p| i32::try_from(p).ok())
            && let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM)
        {
            tracing::warn!(pid, error = %e, "Could not send SIGTERM to script");
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(exit_code = exit_code(status), "Script terminated");
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "Could not wait for script"),
            Err(_) => {
                tracing::warn!(grace_secs = grace.as_secs(), "Script still running, killing it");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(error = %e, "Could not kill script");
                }
            }
        }
    }
}

async fn log_file(path: &Path) -> Result<std::fs::File, RunError> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| RunError::Execution(format!("cannot create log file '{}': {e}", path.display())))?;
    Ok(file.into_std().await)
}

/// Drop a leading `#!` line.
pub(crate) fn strip_shebang(content: &str) -> &str {
    if !content.starts_with("#!") {
        return content;
    }
    match content.find('\n') {
        Some(end) => &content[end + 1..],
        None => "",
    }
}

/// Shell convention: signal deaths report `128 + signal`.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => -1,
    }
}
