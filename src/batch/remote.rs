//! File and command transport between hosts.
//!
//! Operations on the local host (or on storage shared by all hosts) go
//! straight to the filesystem. Everything else is done over `ssh` and `rsync`,
//! bounded by the configured timeouts.

use std::collections::HashSet;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::TimeoutConfig;
use crate::error::BatchError;

/// Moves files and runs commands, locally or over ssh.
#[derive(Debug, Clone)]
pub struct Transport {
    local_host: String,
    /// Every host sees the same filesystem.
    shared_storage: bool,
    ssh_timeout: Duration,
    rsync_timeout: Duration,
}

impl Transport {
    pub fn new(timeouts: &TimeoutConfig, shared_storage: bool) -> Self {
        Self {
            local_host: local_hostname(),
            shared_storage,
            ssh_timeout: timeouts.ssh,
            rsync_timeout: timeouts.rsync,
        }
    }

    /// A transport that treats every host as local.
    pub fn local_only() -> Self {
        Self {
            local_host: local_hostname(),
            shared_storage: true,
            ssh_timeout: Duration::from_secs(60),
            rsync_timeout: Duration::from_secs(600),
        }
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// Whether `host` can be reached through the local filesystem.
    pub fn is_local(&self, host: &str) -> bool {
        self.shared_storage || host == self.local_host || host == "localhost"
    }

    /// Read a whole text file.
    pub async fn read_file(&self, host: &str, path: &Path) -> Result<String, BatchError> {
        if self.is_local(host) {
            return Ok(fs::read_to_string(path).await?);
        }
        self.ssh(host, &format!("cat {}", shell_quote(path)), None)
            .await
    }

    /// Replace a file's content as a whole. Refuses to replace a locked file.
    pub async fn write_file(&self, host: &str, path: &Path, content: &str) -> Result<(), BatchError> {
        if !self.is_local(host) {
            self.ssh(host, &replace_command(path), Some(content)).await?;
            return Ok(());
        }

        if let Ok(meta) = fs::metadata(path).await
            && meta.permissions().readonly()
        {
            return Err(BatchError::Locked(path.to_path_buf()));
        }

        let path = path.to_path_buf();
        let content = content.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), BatchError> {
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let tmp = tempfile::NamedTempFile::new_in(&parent)?;
            std::fs::write(tmp.path(), content)?;
            tmp.persist(&path).map_err(|e| BatchError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| BatchError::Io(std::io::Error::other(e)))?
    }

    /// Clear all write permission bits of a file.
    pub async fn lock_file(&self, host: &str, path: &Path) -> Result<(), BatchError> {
        if !self.is_local(host) {
            self.ssh(host, &format!("chmod a-w {}", shell_quote(path)), None)
                .await?;
            return Ok(());
        }
        let mut perms = fs::metadata(path).await?.permissions();
        perms.set_mode(perms.mode() & !0o222);
        fs::set_permissions(path, perms).await?;
        Ok(())
    }

    /// Create a directory and its parents. Succeeds if it already exists.
    pub async fn make_dir(&self, host: &str, path: &Path) -> Result<(), BatchError> {
        if self.is_local(host) {
            fs::create_dir_all(path).await?;
            return Ok(());
        }
        self.ssh(host, &format!("mkdir -p {}", shell_quote(path)), None)
            .await?;
        Ok(())
    }

    /// Full paths of the entries directly inside `path`.
    pub async fn list_dir(&self, host: &str, path: &Path) -> Result<Vec<PathBuf>, BatchError> {
        if self.is_local(host) {
            let mut entries = Vec::new();
            let mut read_dir = fs::read_dir(path).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                entries.push(entry.path());
            }
            entries.sort();
            return Ok(entries);
        }
        let out = self
            .ssh(
                host,
                &format!("find {} -mindepth 1 -maxdepth 1", shell_quote(path)),
                None,
            )
            .await?;
        let mut entries: Vec<PathBuf> = out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(PathBuf::from)
            .collect();
        entries.sort();
        Ok(entries)
    }

    /// Move `sources[i]` to `destinations[i]` for every i.
    pub async fn move_files(
        &self,
        host: &str,
        sources: &[PathBuf],
        destinations: &[PathBuf],
    ) -> Result<(), BatchError> {
        if sources.len() != destinations.len() {
            return Err(BatchError::Unsupported(format!(
                "cannot move {} files to {} destinations",
                sources.len(),
                destinations.len()
            )));
        }
        if sources.is_empty() {
            return Ok(());
        }

        if self.is_local(host) {
            for (src, dst) in sources.iter().zip(destinations) {
                fs::rename(src, dst).await?;
            }
            return Ok(());
        }

        let cmd = sources
            .iter()
            .zip(destinations)
            .map(|(s, d)| format!("mv -f {} {}", shell_quote(s), shell_quote(d)))
            .collect::<Vec<_>>()
            .join(" && ");
        self.ssh(host, &cmd, None).await?;
        Ok(())
    }

    /// Remove files (not directories).
    pub async fn remove_files(&self, host: &str, paths: &[PathBuf]) -> Result<(), BatchError> {
        if paths.is_empty() {
            return Ok(());
        }
        if self.is_local(host) {
            for path in paths {
                fs::remove_file(path).await?;
            }
            return Ok(());
        }
        let quoted: Vec<String> = paths.iter().map(|p| shell_quote(p)).collect();
        self.ssh(host, &format!("rm -f {}", quoted.join(" ")), None)
            .await?;
        Ok(())
    }

    /// Delete a directory tree.
    pub async fn delete_dir(&self, host: &str, path: &Path) -> Result<(), BatchError> {
        if self.is_local(host) {
            fs::remove_dir_all(path).await?;
            return Ok(());
        }
        self.ssh(host, &format!("rm -rf {}", shell_quote(path)), None)
            .await?;
        Ok(())
    }

    /// Copy `src_dir` into `dest_dir`, skipping `exclude`. Never deletes anything in `dest_dir`.
    ///
    /// Exclusions are paths relative to `src_dir` (absolute paths inside it are accepted).
    /// A host of `None` means the local host.
    pub async fn sync_with_exclusions(
        &self,
        src_dir: &Path,
        dest_dir: &Path,
        src_host: Option<&str>,
        dest_host: Option<&str>,
        exclude: &[PathBuf],
    ) -> Result<(), BatchError> {
        let exclude: HashSet<PathBuf> = exclude
            .iter()
            .filter_map(|p| relative_to(src_dir, p))
            .collect();

        if self.all_local(src_host, dest_host) {
            return copy_tree(src_dir, dest_dir, src_dir, &exclude).await;
        }

        let mut args = vec!["-a".to_string()];
        let mut sorted: Vec<&PathBuf> = exclude.iter().collect();
        sorted.sort();
        for p in sorted {
            args.push(format!("--exclude={}", anchored(p)));
        }
        self.rsync(args, src_dir, dest_dir, src_host, dest_host).await
    }

    /// Copy only the listed files from `src_dir` into `dest_dir`.
    pub async fn sync_selected(
        &self,
        src_dir: &Path,
        dest_dir: &Path,
        src_host: Option<&str>,
        dest_host: Option<&str>,
        include: &[PathBuf],
    ) -> Result<(), BatchError> {
        let include: Vec<PathBuf> = include
            .iter()
            .filter_map(|p| relative_to(src_dir, p))
            .collect();

        if self.all_local(src_host, dest_host) {
            for rel in &include {
                let src = src_dir.join(rel);
                if !fs::try_exists(&src).await? {
                    tracing::debug!(file = %src.display(), "Selected file does not exist, skipping");
                    continue;
                }
                let dst = dest_dir.join(rel);
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent).await?;
                }
                if fs::metadata(&src).await?.is_dir() {
                    copy_tree(&src, &dst, &src, &HashSet::new()).await?;
                } else {
                    fs::copy(&src, &dst).await?;
                }
            }
            return Ok(());
        }

        let mut args = vec!["-a".to_string()];
        for p in &include {
            args.push(format!("--include={}", anchored(p)));
        }
        args.push("--exclude=*".to_string());
        self.rsync(args, src_dir, dest_dir, src_host, dest_host).await
    }

    /// Run a shell command line on `host` and return its stdout.
    pub async fn run_shell(&self, host: &str, command: &str) -> Result<String, BatchError> {
        if self.is_local(host) {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            return run_command(cmd, command, self.ssh_timeout, None).await;
        }
        self.ssh(host, command, None).await
    }

    fn all_local(&self, src_host: Option<&str>, dest_host: Option<&str>) -> bool {
        src_host.is_none_or(|h| self.is_local(h)) && dest_host.is_none_or(|h| self.is_local(h))
    }

    async fn ssh(&self, host: &str, command: &str, stdin: Option<&str>) -> Result<String, BatchError> {
        let connect_timeout = format!("ConnectTimeout={}", self.ssh_timeout.as_secs());
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "PasswordAuthentication=no",
            "-o",
            connect_timeout.as_str(),
            "-q",
            host,
            command,
        ]);
        let shown = format!("ssh {host} {command}");
        run_command(cmd, &shown, self.ssh_timeout, stdin).await
    }

    async fn rsync(
        &self,
        mut args: Vec<String>,
        src_dir: &Path,
        dest_dir: &Path,
        src_host: Option<&str>,
        dest_host: Option<&str>,
    ) -> Result<(), BatchError> {
        let src_host = src_host.filter(|h| !self.is_local(h));
        let dest_host = dest_host.filter(|h| !self.is_local(h));
        if src_host.is_some() && dest_host.is_some() {
            return Err(BatchError::Unsupported(
                "syncing between two remote hosts".to_string(),
            ));
        }

        args.push(remote_spec(src_host, src_dir, true));
        args.push(remote_spec(dest_host, dest_dir, false));

        let mut cmd = Command::new("rsync");
        cmd.args(&args);
        let shown = format!("rsync {}", args.join(" "));
        tracing::debug!(command = %shown, "Syncing directories");
        run_command(cmd, &shown, self.rsync_timeout, None).await?;
        Ok(())
    }
}

/// Run a prepared command with a timeout and return its stdout.
pub(crate) async fn run_command(
    mut cmd: Command,
    shown: &str,
    timeout: Duration,
    stdin: Option<&str>,
) -> Result<String, BatchError> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        pipe.write_all(input.as_bytes()).await?;
        pipe.shutdown().await?;
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| BatchError::Timeout {
            command: shown.to_string(),
            timeout,
        })??;

    if !output.status.success() {
        return Err(BatchError::CommandFailed {
            command: shown.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Quote a path for a POSIX shell.
pub fn shell_quote(path: impl AsRef<std::ffi::OsStr>) -> String {
    quote_str(&path.as_ref().to_string_lossy())
}

pub(crate) fn quote_str(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | '=' | ':' | ','))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Hostname of this machine.
pub fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine hostname, using localhost");
            "localhost".to_string()
        }
    }
}

/// Shell command that replaces `path` with stdin through a sibling temporary
/// file, so an interrupted transfer never leaves a truncated file behind.
fn replace_command(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{name}.{}.tmp", std::process::id()));
    let (quoted, tmp) = (shell_quote(path), shell_quote(&tmp));
    format!("test ! -e {quoted} -o -w {quoted} && cat > {tmp} && mv -f {tmp} {quoted} || {{ rm -f {tmp}; exit 1; }}")
}

fn remote_spec(host: Option<&str>, dir: &Path, trailing_slash: bool) -> String {
    let mut dir = dir.to_string_lossy().into_owned();
    if trailing_slash && !dir.ends_with('/') {
        dir.push('/');
    }
    match host {
        Some(h) => format!("{h}:{dir}"),
        None => dir,
    }
}

fn anchored(rel: &Path) -> String {
    format!("/{}", rel.to_string_lossy())
}

fn relative_to(base: &Path, path: &Path) -> Option<PathBuf> {
    if path.is_absolute() {
        path.strip_prefix(base).ok().map(Path::to_path_buf)
    } else {
        Some(path.to_path_buf())
    }
}

/// Recursively copy `src` into `dest`, skipping paths (relative to `root`) in `exclude`.
fn copy_tree<'a>(
    src: &'a Path,
    dest: &'a Path,
    root: &'a Path,
    exclude: &'a HashSet<PathBuf>,
) -> Pin<Box<dyn Future<Output = Result<(), BatchError>> + Send + 'a>> {
    Box::pin(async move {
        fs::create_dir_all(dest).await?;
        let mut read_dir = fs::read_dir(src).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap_or(&path);
            if exclude.contains(rel) {
                continue;
            }

            let target = dest.join(entry.file_name());
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                copy_tree(&path, &target, root, exclude).await?;
            } else if file_type.is_symlink() {
                let link = fs::read_link(&path).await?;
                if fs::symlink_metadata(&target).await.is_ok() {
                    fs::remove_file(&target).await?;
                }
                fs::symlink(link, &target).await?;
            } else {
                fs::copy(&path, &target).await?;
            }
        }
        Ok(())
    })
}
