//! The sidecar job record.
//!
//! One YAML document per job, stored next to the job's files in the
//! submission directory. It is always read and written as a whole.

mod store;

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub use store::{SidecarStore, find_record};

use crate::archive::pattern;
use crate::batch::BatchSystem;
use crate::config::SuffixConfig;
use crate::error::{BatchError, RecordError};
use crate::state::{BatchState, NaiveState, RealState};

/// First line of every record file.
pub const RECORD_HEADER: &str = "# jobwarden job record";

/// Kind of job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    #[default]
    Standard,
    /// Runs in cycles and resubmits itself.
    Loop,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Loop => write!(f, "loop"),
        }
    }
}

/// Resources requested at submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nnodes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ncpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_per_cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ngpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub walltime: Option<String>,
    /// `job_dir`/`input_dir` to run in the submission directory, anything else means scratch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub props: Option<BTreeMap<String, String>>,
}

impl Resources {
    /// Whether the job runs in a scratch directory.
    pub fn uses_scratch(&self) -> bool {
        match &self.work_dir {
            Some(dir) => {
                let normalized = normalize(dir);
                normalized != "jobdir" && normalized != "inputdir"
            }
            None => true,
        }
    }
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Cycle descriptor of a loop job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopInfo {
    pub start: u32,
    pub end: u32,
    /// Archive directory, relative paths are relative to the submission directory.
    pub archive: PathBuf,
    /// Pattern of archived filenames, usually printf-style.
    pub archive_format: String,
    pub current: u32,
}

impl LoopInfo {
    /// Build and validate a cycle descriptor.
    ///
    /// Without `current`, the cycle is inferred from `archived` (the archive's
    /// listing): the highest number in a stem matching `archive_format`, or
    /// `start` if nothing matches.
    pub fn new(
        start: u32,
        end: Option<u32>,
        archive: PathBuf,
        archive_format: String,
        current: Option<u32>,
        archived: &[PathBuf],
    ) -> Result<Self, RecordError> {
        let end = end.ok_or_else(|| RecordError::Invalid("loop end is undefined".to_string()))?;
        let current = match current {
            Some(c) => c,
            None => detect_cycle(start, &archive_format, archived)?,
        };
        let info = Self {
            start,
            end,
            archive,
            archive_format,
            current,
        };
        info.validate(None)?;
        Ok(info)
    }

    /// Check the cycle bounds and, given the submission dir, that the archive is elsewhere.
    pub fn validate(&self, input_dir: Option<&Path>) -> Result<(), RecordError> {
        if self.start > self.end {
            return Err(RecordError::Invalid(format!(
                "loop start ({}) cannot be higher than loop end ({})",
                self.start, self.end
            )));
        }
        if self.current > self.end {
            return Err(RecordError::Invalid(format!(
                "current cycle ({}) cannot be higher than loop end ({})",
                self.current, self.end
            )));
        }
        if let Some(input_dir) = input_dir
            && same_dir(&self.archive_dir(input_dir), input_dir)
        {
            return Err(RecordError::Invalid(
                "the submission directory cannot be used as the loop archive".to_string(),
            ));
        }
        Ok(())
    }

    /// Absolute archive directory for a job submitted from `input_dir`.
    pub fn archive_dir(&self, input_dir: &Path) -> PathBuf {
        input_dir.join(&self.archive)
    }

    /// No further cycle follows this one.
    pub fn is_last_cycle(&self) -> bool {
        self.current >= self.end
    }

    /// The cycle before the current one, if any.
    pub fn previous_cycle(&self) -> Option<u32> {
        self.current.checked_sub(1)
    }
}

/// Whether two paths name the same directory. Existing directories are
/// resolved on disk, anything else is compared after lexical normalization.
pub(crate) fn same_dir(a: &Path, b: &Path) -> bool {
    if let (Ok(a), Ok(b)) = (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        return a == b;
    }
    normalize_path(a) == normalize_path(b)
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out
}

static FIRST_NUMBER: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\d+").expect("valid digit regex"));

fn detect_cycle(start: u32, archive_format: &str, archived: &[PathBuf]) -> Result<u32, RecordError> {
    let regex = pattern::build_regex(archive_format, None)
        .map_err(|e| RecordError::Invalid(e.to_string()))?;

    let detected = archived
        .iter()
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .filter(|stem| regex.is_match(stem))
        .filter_map(|stem| FIRST_NUMBER.find(&stem).and_then(|m| m.as_str().parse::<u32>().ok()))
        .fold(start, u32::max);
    Ok(detected)
}

/// The sidecar record of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub batch_system: String,
    #[serde(default)]
    pub tool_version: String,
    #[serde(default)]
    pub username: String,
    pub job_id: String,
    pub job_name: String,
    pub script_name: String,
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub job_type: JobType,
    #[serde(default)]
    pub input_machine: String,
    #[serde(default)]
    pub input_dir: PathBuf,
    pub job_state: NaiveState,
    #[serde(with = "timestamp")]
    pub submission_time: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_file: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_files: Vec<PathBuf>,
    #[serde(default)]
    pub resources: Resources,
    /// Full submission command line, program first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_line: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_info: Option<LoopInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp::option")]
    pub start_time: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_nodes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "timestamp::option")]
    pub completion_time: Option<NaiveDateTime>,
    /// Unset for killed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_exit_code: Option<i32>,
}

/// A record's state next to the scheduler's view of the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    pub naive: NaiveState,
    pub batch: BatchState,
    pub real: RealState,
}

impl JobRecord {
    /// A fresh QUEUED record, as written at submission.
    pub fn new_queued(
        batch_system: &str,
        job_id: &str,
        script_name: &str,
        input_machine: &str,
        input_dir: &Path,
        submission_time: NaiveDateTime,
    ) -> Self {
        let job_name = Path::new(script_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| script_name.to_string());
        Self {
            batch_system: batch_system.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            username: crate::batch::current_username(),
            job_id: job_id.to_string(),
            job_name,
            script_name: script_name.to_string(),
            queue: String::new(),
            job_type: JobType::Standard,
            input_machine: input_machine.to_string(),
            input_dir: input_dir.to_path_buf(),
            job_state: NaiveState::Queued,
            submission_time,
            stdout_file: None,
            stderr_file: None,
            excluded_files: Vec::new(),
            resources: Resources::default(),
            command_line: Vec::new(),
            loop_info: None,
            start_time: None,
            main_node: None,
            all_nodes: None,
            work_dir: None,
            completion_time: None,
            job_exit_code: None,
        }
    }

    /// Parse a record document.
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, RecordError> {
        let record: Self = serde_yaml::from_str(text).map_err(|e| RecordError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        record.check()?;
        Ok(record)
    }

    /// Serialize the record, header comment included.
    pub fn to_yaml(&self) -> Result<String, RecordError> {
        let body = serde_yaml::to_string(self).map_err(|e| RecordError::Serialize(e.to_string()))?;
        Ok(format!("{RECORD_HEADER}\n{body}"))
    }

    fn check(&self) -> Result<(), RecordError> {
        if self.job_id.trim().is_empty() {
            return Err(RecordError::Invalid("job id is empty".to_string()));
        }
        match (&self.job_type, &self.loop_info) {
            (JobType::Loop, None) => Err(RecordError::Invalid(
                "loop job without loop information".to_string(),
            )),
            (_, Some(info)) => info.validate(None),
            _ => Ok(()),
        }
    }

    /// Mark the job as running on `main_node` in `work_dir`.
    pub fn set_running(
        &mut self,
        time: NaiveDateTime,
        main_node: &str,
        all_nodes: Vec<String>,
        work_dir: &Path,
    ) {
        self.job_state = NaiveState::Running;
        self.start_time = Some(time);
        self.main_node = Some(main_node.to_string());
        self.all_nodes = Some(all_nodes);
        self.work_dir = Some(work_dir.to_path_buf());
    }

    pub fn set_finished(&mut self, time: NaiveDateTime) {
        self.job_state = NaiveState::Finished;
        self.completion_time = Some(time);
        self.job_exit_code = Some(0);
    }

    pub fn set_failed(&mut self, time: NaiveDateTime, exit_code: i32) {
        self.job_state = NaiveState::Failed;
        self.completion_time = Some(time);
        self.job_exit_code = Some(exit_code);
    }

    /// Mark the job as killed. The exit code is left unset on purpose.
    pub fn set_killed(&mut self, time: NaiveDateTime) {
        self.job_state = NaiveState::Killed;
        self.completion_time = Some(time);
    }

    pub fn uses_scratch(&self) -> bool {
        self.resources.uses_scratch()
    }

    /// Main node and working directory, once the job has started.
    pub fn destination(&self) -> Option<(&str, &Path)> {
        match (&self.main_node, &self.work_dir) {
            (Some(node), Some(dir)) => Some((node.as_str(), dir.as_path())),
            _ => None,
        }
    }

    /// Whether `job_id` names this job, ignoring any server suffix.
    pub fn matches_job(&self, job_id: &str) -> bool {
        let short = |id: &str| id.split('.').next().unwrap_or_default().to_string();
        short(&self.job_id) == short(job_id)
    }

    /// Stdout and stderr log filenames.
    pub fn log_files(&self, suffixes: &SuffixConfig) -> (String, String) {
        let stdout = self
            .stdout_file
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.job_name, suffixes.stdout));
        let stderr = self
            .stderr_file
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.job_name, suffixes.stderr));
        (stdout, stderr)
    }

    /// Reconcile the record with the scheduler's live view.
    pub async fn status(&self, batch: &dyn BatchSystem) -> Result<JobStatus, BatchError> {
        if self.job_state == NaiveState::Unknown {
            return Ok(JobStatus {
                naive: NaiveState::Unknown,
                batch: BatchState::Unknown,
                real: RealState::Unknown,
            });
        }
        let info = batch.job_info(&self.job_id).await?;
        Ok(JobStatus {
            naive: self.job_state,
            batch: info.state,
            real: RealState::reconcile(self.job_state, info.state),
        })
    }
}

/// `YYYY-MM-DD HH:MM:SS` timestamps.
mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(time: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(raw.trim(), FORMAT).map_err(de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(time: &Option<NaiveDateTime>, s: S) -> Result<S::Ok, S::Error> {
            match time {
                Some(t) => s.serialize_some(&t.format(FORMAT).to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDateTime>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| NaiveDateTime::parse_from_str(raw.trim(), FORMAT).map_err(de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn record() -> JobRecord {
        JobRecord::new_queued("PBS", "123.server", "run.sh", "login1", Path::new("/home/u/job"), at(9))
    }

    #[test]
    fn yaml_has_header_and_omits_unset_keys() {
        let yaml = record().to_yaml().unwrap();
        assert!(yaml.starts_with(RECORD_HEADER));
        assert!(yaml.contains("job_state: queued"));
        assert!(yaml.contains("2025-03-14 09:00:00"));
        assert!(!yaml.contains("start_time"));
        assert!(!yaml.contains("job_exit_code"));
        assert!(!yaml.contains("loop_info"));
    }

    #[test]
    fn yaml_round_trip_of_finished_loop_job() {
        let mut rec = record();
        rec.job_type = JobType::Loop;
        rec.loop_info = Some(LoopInfo {
            start: 1,
            end: 5,
            archive: PathBuf::from("storage"),
            archive_format: "md%04d".to_string(),
            current: 2,
        });
        rec.set_running(at(10), "node1", vec!["node1".into(), "node2".into()], Path::new("/scratch/1/main"));
        rec.set_finished(at(11));

        let parsed = JobRecord::from_yaml(&rec.to_yaml().unwrap(), Path::new("x.jwinfo")).unwrap();
        assert_eq!(parsed, rec);
        assert_eq!(parsed.job_exit_code, Some(0));
    }

    #[test]
    fn minimal_document_parses() {
        let text = "# jobwarden job record\n\
                    batch_system: Slurm\n\
                    job_id: '42'\n\
                    job_name: sim\n\
                    script_name: sim.sh\n\
                    job_state: exploded\n\
                    submission_time: 2025-01-02 03:04:05\n";
        let rec = JobRecord::from_yaml(text, Path::new("sim.jwinfo")).unwrap();
        assert_eq!(rec.job_state, NaiveState::Unknown);
        assert_eq!(rec.job_type, JobType::Standard);
        assert!(rec.uses_scratch());
    }

    #[test]
    fn missing_required_key_is_a_parse_error() {
        let text = "batch_system: PBS\njob_name: a\nscript_name: a.sh\njob_state: queued\n";
        let err = JobRecord::from_yaml(text, Path::new("a.jwinfo")).unwrap_err();
        assert!(matches!(err, RecordError::Parse { .. }));
    }

    #[test]
    fn loop_job_needs_loop_info() {
        let mut rec = record();
        rec.job_type = JobType::Loop;
        let err = JobRecord::from_yaml(&rec.to_yaml().unwrap(), Path::new("a")).unwrap_err();
        assert!(matches!(err, RecordError::Invalid(_)));
    }

    #[test]
    fn killed_has_no_exit_code() {
        let mut rec = record();
        rec.set_killed(at(12));
        assert_eq!(rec.job_state, NaiveState::Killed);
        assert_eq!(rec.job_exit_code, None);
        assert_eq!(rec.completion_time, Some(at(12)));

        rec.set_failed(at(13), 3);
        assert_eq!(rec.job_exit_code, Some(3));
    }

    #[test]
    fn scratch_detection_is_normalized() {
        let mut res = Resources::default();
        assert!(res.uses_scratch());
        res.work_dir = Some("Job-Dir".into());
        assert!(!res.uses_scratch());
        res.work_dir = Some("input_dir".into());
        assert!(!res.uses_scratch());
        res.work_dir = Some("scratch_local".into());
        assert!(res.uses_scratch());
    }

    #[test]
    fn destination_and_job_matching() {
        let mut rec = record();
        assert!(rec.destination().is_none());
        rec.set_running(at(10), "node9", vec![], Path::new("/w"));
        assert_eq!(rec.destination(), Some(("node9", Path::new("/w"))));
        assert!(rec.matches_job("123"));
        assert!(rec.matches_job("123.other"));
        assert!(!rec.matches_job("1234"));
    }

    #[test]
    fn log_files_default_to_job_name() {
        let mut rec = record();
        let suffixes = SuffixConfig::default();
        assert_eq!(rec.log_files(&suffixes), ("run.sh.out".to_string(), "run.sh.err".to_string()));
        rec.stdout_file = Some("custom.log".into());
        assert_eq!(rec.log_files(&suffixes).0, "custom.log");
    }

    #[test]
    fn loop_info_validation() {
        let ok = LoopInfo::new(1, Some(3), "storage".into(), "md%04d".into(), Some(3), &[]);
        assert!(ok.is_ok());
        assert!(ok.unwrap().is_last_cycle());

        assert!(LoopInfo::new(1, None, "s".into(), "md%04d".into(), None, &[]).is_err());
        assert!(LoopInfo::new(4, Some(3), "s".into(), "md%04d".into(), None, &[]).is_err());
        assert!(LoopInfo::new(1, Some(3), "s".into(), "md%04d".into(), Some(5), &[]).is_err());

        let info = LoopInfo::new(1, Some(3), ".".into(), "md%04d".into(), None, &[]).unwrap();
        assert!(info.validate(Some(Path::new("/home/u/job"))).is_err());
        let info = LoopInfo::new(1, Some(3), "storage".into(), "md%04d".into(), None, &[]).unwrap();
        assert!(info.validate(Some(Path::new("/home/u/job"))).is_ok());
    }

    #[test]
    fn archive_resolving_to_submission_dir_is_rejected() {
        for archive in ["storage/..", "./storage/../.", "../job", "/home/u/job/"] {
            let info = LoopInfo::new(1, Some(3), archive.into(), "md%04d".into(), None, &[]).unwrap();
            assert!(info.validate(Some(Path::new("/home/u/job"))).is_err(), "{archive}");
        }
        let info = LoopInfo::new(1, Some(3), "../storage".into(), "md%04d".into(), None, &[]).unwrap();
        assert!(info.validate(Some(Path::new("/home/u/job"))).is_ok());
    }

    #[test]
    fn existing_directories_are_compared_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("storage")).unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("storage/back")).unwrap();
        assert!(same_dir(&dir.path().join("storage/back"), dir.path()));
        assert!(!same_dir(&dir.path().join("storage"), dir.path()));
    }

    #[test]
    fn current_cycle_is_detected_from_archive() {
        let archived: Vec<PathBuf> = ["md0001.gro", "md0004.xtc", "md0003.jwinfo", "other7.txt"]
            .iter()
            .map(|n| PathBuf::from("/arch").join(n))
            .collect();
        let info = LoopInfo::new(1, Some(9), "arch".into(), "md%04d".into(), None, &archived).unwrap();
        assert_eq!(info.current, 4);

        let info = LoopInfo::new(2, Some(9), "arch".into(), "md%04d".into(), None, &[]).unwrap();
        assert_eq!(info.current, 2);
    }
}
