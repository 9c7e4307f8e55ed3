use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::Operator;
use crate::batch::BatchRegistry;
use crate::config::SuffixConfig;
use crate::error::{OperatorError, RecordError};
use crate::retry::Retryer;
use crate::state::RealState;

/// Outcome of clearing a directory.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Cleared {
    pub removed: Vec<PathBuf>,
    /// Runtime files left alone because their job is still alive or succeeded.
    pub kept: Vec<PathBuf>,
}

/// Removes runtime files of dead jobs from a submission directory.
pub struct Clearer<'a> {
    dir: PathBuf,
    registry: &'a BatchRegistry,
    suffixes: SuffixConfig,
}

impl<'a> Clearer<'a> {
    pub fn new(dir: &Path, registry: &'a BatchRegistry, suffixes: SuffixConfig) -> Self {
        Self {
            dir: dir.to_path_buf(),
            registry,
            suffixes,
        }
    }

    /// Delete runtime files. Without `force`, files of jobs that are not
    /// killed, failed or inconsistent are kept.
    pub async fn clear(&self, force: bool) -> Result<Cleared, OperatorError> {
        let files = self.runtime_files().await?;
        if files.is_empty() {
            tracing::info!(dir = %self.dir.display(), "Nothing to clear");
            return Ok(Cleared::default());
        }

        let protected = if force { BTreeSet::new() } else { self.protected_files(&files).await };
        let mut cleared = Cleared::default();
        for file in files {
            if protected.contains(&file) {
                cleared.kept.push(file);
                continue;
            }
            tracing::debug!(file = %file.display(), "Removing runtime file");
            tokio::fs::remove_file(&file).await.map_err(RecordError::from)?;
            cleared.removed.push(file);
        }

        tracing::info!(removed = cleared.removed.len(), kept = cleared.kept.len(), "Cleared runtime files");
        Ok(cleared)
    }

    async fn runtime_files(&self) -> Result<BTreeSet<PathBuf>, OperatorError> {
        let suffixes = self.suffixes.all();
        let mut files = BTreeSet::new();
        let mut read_dir = tokio::fs::read_dir(&self.dir).await.map_err(RecordError::from)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(RecordError::from)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_file = entry.file_type().await.map_err(RecordError::from)?.is_file();
            if is_file && suffixes.iter().any(|s| name.ends_with(s)) {
                files.insert(entry.path());
            }
        }
        Ok(files)
    }

    /// Files of records whose job may still need them. Unreadable records protect nothing.
    async fn protected_files(&self, files: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
        let mut protected = BTreeSet::new();
        let records = files
            .iter()
            .filter(|f| f.to_string_lossy().ends_with(&self.suffixes.record));
        for path in records {
            let real = match Operator::load(path, self.registry, Retryer::once()).await {
                Ok(op) => match op.status().await {
                    Ok(status) => Some((op, status.real)),
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "Could not get job state, ignoring record");
                        None
                    }
                },
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Could not load record, ignoring it");
                    None
                }
            };
            let Some((op, real)) = real else {
                continue;
            };
            if matches!(real, RealState::Killed | RealState::Failed | RealState::InAnInconsistentState) {
                continue;
            }

            let record = op.record();
            let (stdout, stderr) = record.log_files(&self.suffixes);
            protected.insert(path.clone());
            protected.insert(self.dir.join(stdout));
            protected.insert(self.dir.join(stderr));
            protected.insert(self.dir.join(format!("{}{}", record.job_name, self.suffixes.runner_output)));
        }
        protected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::test_support::Fixture;
    use crate::state::{BatchState, NaiveState};

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), "x").unwrap();
        }
    }

    #[tokio::test]
    async fn failed_job_files_are_removed() {
        let f = Fixture::new();
        let mut record = f.record(NaiveState::Failed);
        record.job_exit_code = Some(1);
        f.write(&record, BatchState::Finished);
        touch(&f.input_dir, &["job.sh.out", "job.sh.err", "job.sh.jwout", "job.sh", "notes.txt"]);

        let cleared = Clearer::new(&f.input_dir, &f.registry, SuffixConfig::default())
            .clear(false)
            .await
            .unwrap();

        assert_eq!(cleared.removed.len(), 4);
        assert!(cleared.kept.is_empty());
        assert!(!f.record_path.exists());
        assert!(f.input_dir.join("job.sh").exists());
        assert!(f.input_dir.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn running_job_files_are_kept_unless_forced() {
        let f = Fixture::new();
        f.write(&f.running_record(&f.work_dir()), BatchState::Running);
        touch(&f.input_dir, &["job.sh.out", "old.err"]);

        let clearer = Clearer::new(&f.input_dir, &f.registry, SuffixConfig::default());
        let cleared = clearer.clear(false).await.unwrap();
        assert_eq!(cleared.removed, vec![f.input_dir.join("old.err")]);
        assert_eq!(cleared.kept, vec![f.input_dir.join("job.jwinfo"), f.input_dir.join("job.sh.out")]);

        let cleared = clearer.clear(true).await.unwrap();
        assert_eq!(cleared.removed.len(), 2);
        assert!(!f.record_path.exists());
    }

    #[tokio::test]
    async fn unreadable_record_does_not_protect_anything() {
        let f = Fixture::new();
        std::fs::write(&f.record_path, "not: [a record").unwrap();

        let cleared = Clearer::new(&f.input_dir, &f.registry, SuffixConfig::default())
            .clear(false)
            .await
            .unwrap();
        assert_eq!(cleared.removed, vec![f.record_path.clone()]);
    }

    #[tokio::test]
    async fn empty_directory_is_a_noop() {
        let f = Fixture::new();
        let cleared = Clearer::new(&f.input_dir, &f.registry, SuffixConfig::default())
            .clear(false)
            .await
            .unwrap();
        assert_eq!(cleared, Cleared::default());
    }
}
