//! Archiving for loop jobs.
//!
//! Between cycles, a loop job's data lives in an archive directory on the
//! submission host. Each cycle pulls its inputs from the archive, pushes its
//! outputs back, and moves the previous cycle's runtime files there.

pub mod pattern;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::batch::BatchSystem;
use crate::config::Config;
use crate::error::ArchiveError;
use crate::record::{LoopInfo, same_dir};
use crate::retry::Retryer;

/// Moves files between a working directory and a loop job's archive.
pub struct Archiver {
    archive: PathBuf,
    archive_format: String,
    input_machine: String,
    input_dir: PathBuf,
    batch: Arc<dyn BatchSystem>,
    retryer: Retryer,
    runtime_suffixes: Vec<String>,
}

impl Archiver {
    pub fn new(
        loop_info: &LoopInfo,
        input_machine: &str,
        input_dir: &Path,
        batch: Arc<dyn BatchSystem>,
        config: &Config,
    ) -> Self {
        Self {
            archive: loop_info.archive_dir(input_dir),
            archive_format: loop_info.archive_format.clone(),
            input_machine: input_machine.to_string(),
            input_dir: input_dir.to_path_buf(),
            batch,
            retryer: Retryer::new(config.archiver.retry_tries, config.archiver.retry_wait),
            runtime_suffixes: config.suffixes.all().iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive
    }

    /// Create the archive directory. Does nothing if it exists.
    pub async fn make_archive_dir(&self) -> Result<(), ArchiveError> {
        tracing::debug!(archive = %self.archive.display(), host = %self.input_machine, "Creating archive directory");
        self.retryer
            .run(|| self.batch.make_dir(&self.input_machine, &self.archive))
            .await?;
        Ok(())
    }

    /// Copy archived files matching the pattern into `work_dir`.
    ///
    /// With a cycle, printf-style patterns only fetch that cycle's files.
    pub async fn archive_from(&self, work_dir: &Path, cycle: Option<u32>) -> Result<(), ArchiveError> {
        let files = self
            .matching_files(&self.archive, &self.input_machine, &self.archive_format, cycle, false)
            .await?;
        if files.is_empty() {
            tracing::debug!("Nothing to fetch from archive");
            return Ok(());
        }

        tracing::info!(count = files.len(), cycle = ?cycle, "Fetching files from archive");
        self.retryer
            .run(|| {
                self.batch.sync_selected(
                    &self.archive,
                    work_dir,
                    Some(self.input_machine.as_str()),
                    None,
                    &files,
                )
            })
            .await?;
        Ok(())
    }

    /// Push matching files from `work_dir` to the archive, then remove them from `work_dir`.
    pub async fn archive_to(&self, work_dir: &Path) -> Result<(), ArchiveError> {
        if self.batch.transport().is_local(&self.input_machine) && same_dir(&self.archive, work_dir) {
            return Err(ArchiveError::SameDirectory(work_dir.to_path_buf()));
        }
        let local = self.batch.transport().local_host().to_string();
        let files = self
            .matching_files(work_dir, &local, &self.archive_format, None, false)
            .await?;
        if files.is_empty() {
            tracing::debug!("Nothing to archive");
            return Ok(());
        }

        tracing::info!(count = files.len(), archive = %self.archive.display(), "Archiving files");
        self.retryer
            .run(|| {
                self.batch.sync_selected(
                    work_dir,
                    &self.archive,
                    None,
                    Some(self.input_machine.as_str()),
                    &files,
                )
            })
            .await?;

        self.retryer
            .run(|| self.batch.remove_files(&local, &files))
            .await?;
        Ok(())
    }

    /// Move the runtime files of a previous cycle from the submission directory into the archive.
    ///
    /// Files whose stem matches `job_name_pattern` are renamed to the archive
    /// format filled with `cycle`, keeping their original extension.
    pub async fn archive_runtime_files(&self, job_name_pattern: &str, cycle: u32) -> Result<(), ArchiveError> {
        let files = self
            .matching_files(&self.input_dir, &self.input_machine, job_name_pattern, None, true)
            .await?;
        if files.is_empty() {
            tracing::debug!(cycle, "No runtime files to archive");
            return Ok(());
        }

        let stem = pattern::fill_printf(&self.archive_format, cycle).ok_or_else(|| ArchiveError::Pattern {
            pattern: self.archive_format.clone(),
            message: "runtime files need a pattern with exactly one numeric placeholder".to_string(),
        })?;
        let moved: Vec<PathBuf> = files
            .iter()
            .map(|f| {
                let suffix = f
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default();
                self.archive.join(format!("{stem}{suffix}"))
            })
            .collect();

        tracing::info!(cycle, count = files.len(), "Archiving runtime files of previous cycle");
        self.retryer
            .run(|| self.batch.move_files(&self.input_machine, &files, &moved))
            .await?;
        Ok(())
    }

    async fn matching_files(
        &self,
        dir: &Path,
        host: &str,
        pattern: &str,
        cycle: Option<u32>,
        include_runtime: bool,
    ) -> Result<Vec<PathBuf>, ArchiveError> {
        let regex = pattern::build_regex(pattern, cycle)?;
        let available = self.retryer.run(|| self.batch.list_dir(host, dir)).await?;

        Ok(available
            .into_iter()
            .filter(|f| {
                f.file_stem()
                    .is_some_and(|stem| regex.is_match(&stem.to_string_lossy()))
            })
            .filter(|f| include_runtime || !self.is_runtime_file(f))
            .collect())
    }

    fn is_runtime_file(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| {
            let suffix = format!(".{}", ext.to_string_lossy());
            self.runtime_suffixes.contains(&suffix)
        })
    }
}
