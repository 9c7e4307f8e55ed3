//! Runner driven end to end against the in-memory batch system.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use jobwarden::batch::{BatchRegistry, BatchSystem, FakeBatch, FakeCall};
use jobwarden::config::Config;
use jobwarden::error::RunError;
use jobwarden::record::{JobRecord, JobType, LoopInfo, Resources};
use jobwarden::runner::{Execution, Runner, RunnerEnv, run_job};
use jobwarden::state::{BatchState, NaiveState};

const JOB_ID: &str = "7.server";

struct Harness {
    root: tempfile::TempDir,
    input_dir: PathBuf,
    record_path: PathBuf,
    fake: Arc<FakeBatch>,
    registry: BatchRegistry,
    config: Config,
}

impl Harness {
    fn new(record_name: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let input_dir = root.path().join("input");
        std::fs::create_dir_all(&input_dir).unwrap();

        let fake = Arc::new(FakeBatch::new(root.path().join("scratch")).with_current_job(JOB_ID));
        fake.set_job(JOB_ID, BatchState::Running, &["node1", "node2"]);
        let mut registry = BatchRegistry::new();
        registry.register(Arc::clone(&fake) as Arc<dyn BatchSystem>);

        Self {
            record_path: input_dir.join(record_name),
            root,
            input_dir,
            fake,
            registry,
            config: Config::default().without_retry_waits(),
        }
    }

    fn script(&self, body: &str) {
        std::fs::write(self.input_dir.join("job.sh"), format!("#!/bin/bash\n{body}\n")).unwrap();
    }

    fn record(&self) -> JobRecord {
        let time = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap().and_hms_opt(9, 30, 0).unwrap();
        JobRecord::new_queued("Fake", JOB_ID, "job.sh", "localhost", &self.input_dir, time)
    }

    fn in_input_dir(mut record: JobRecord) -> JobRecord {
        record.resources = Resources {
            work_dir: Some("input_dir".to_string()),
            ..Resources::default()
        };
        record
    }

    fn write(&self, record: &JobRecord) {
        std::fs::write(&self.record_path, record.to_yaml().unwrap()).unwrap();
    }

    fn saved(&self) -> JobRecord {
        let text = std::fs::read_to_string(&self.record_path).unwrap();
        JobRecord::from_yaml(&text, &self.record_path).unwrap()
    }

    fn scratch_work_dir(&self) -> PathBuf {
        self.root.path().join("scratch").join(format!("job_{JOB_ID}")).join("main")
    }

    async fn runner(&self, token: CancellationToken) -> Runner {
        let runner_env = RunnerEnv {
            info_file: self.record_path.clone(),
            input_machine: "localhost".to_string(),
            batch_system: None,
        };
        Runner::load(runner_env, &self.registry, self.config.clone(), token)
            .await
            .unwrap()
    }
}

fn loop_record(h: &Harness, current: u32, end: u32) -> JobRecord {
    let mut record = Harness::in_input_dir(h.record());
    record.job_name = format!("job.sh+{current:04}");
    record.job_type = JobType::Loop;
    record.loop_info = Some(LoopInfo {
        start: 1,
        end,
        archive: PathBuf::from("storage"),
        archive_format: "md%04d".to_string(),
        current,
    });
    record.command_line = ["jw-submit", "job.sh", "--depend", "afterok=6.server", "-q", "long"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    record
}

fn exists(path: &Path) -> bool {
    path.exists()
}

#[tokio::test]
async fn scratch_job_success_copies_results_back() {
    let h = Harness::new("job.jwinfo");
    h.script("cat input.dat > out.txt\necho done");
    std::fs::write(h.input_dir.join("input.dat"), "payload").unwrap();
    h.write(&h.record());

    let code = run_job(h.runner(CancellationToken::new()).await).await;

    assert_eq!(code, 0);
    assert_eq!(std::fs::read_to_string(h.input_dir.join("out.txt")).unwrap(), "payload");
    assert_eq!(std::fs::read_to_string(h.input_dir.join("job.sh.out")).unwrap(), "done\n");
    assert!(!exists(&h.scratch_work_dir()));

    let saved = h.saved();
    assert_eq!(saved.job_state, NaiveState::Finished);
    assert_eq!(saved.job_exit_code, Some(0));
    assert_eq!(saved.all_nodes, Some(vec!["node1".to_string(), "node2".to_string()]));
    assert_eq!(saved.work_dir, Some(h.scratch_work_dir()));
    assert!(saved.start_time.is_some());
    assert!(saved.completion_time.is_some());
    assert!(h.fake.calls().is_empty());
}

#[tokio::test]
async fn scratch_job_failure_keeps_working_directory() {
    let h = Harness::new("job.jwinfo");
    h.script("echo partial > partial.txt\nexit 3");
    h.write(&h.record());

    let code = run_job(h.runner(CancellationToken::new()).await).await;

    assert_eq!(code, 3);
    assert!(exists(&h.scratch_work_dir().join("partial.txt")));
    assert!(!exists(&h.input_dir.join("partial.txt")));
    let saved = h.saved();
    assert_eq!(saved.job_state, NaiveState::Failed);
    assert_eq!(saved.job_exit_code, Some(3));
}

#[tokio::test]
async fn scratch_copy_excludes_record_and_excluded_files() {
    let h = Harness::new("job.jwinfo");
    h.script("ls > listing.txt");
    std::fs::write(h.input_dir.join("huge.bin"), "x").unwrap();
    std::fs::write(h.input_dir.join("keep.txt"), "x").unwrap();
    let mut record = h.record();
    record.excluded_files = vec![PathBuf::from("huge.bin")];
    h.write(&record);

    let mut runner = h.runner(CancellationToken::new()).await;
    runner.set_up().await.unwrap();
    runner.prepare().await.unwrap();

    let work_dir = runner.work_dir().unwrap().to_path_buf();
    assert_eq!(work_dir, h.scratch_work_dir());
    assert!(exists(&work_dir.join("keep.txt")));
    assert!(exists(&work_dir.join("job.sh")));
    assert!(!exists(&work_dir.join("huge.bin")));
    assert!(!exists(&work_dir.join("job.jwinfo")));
}

#[tokio::test]
async fn kill_before_start_aborts_without_running_script() {
    let h = Harness::new("job.jwinfo");
    h.script("touch ran.txt");
    h.write(&h.record());

    let mut runner = h.runner(CancellationToken::new()).await;
    runner.set_up().await.unwrap();
    runner.prepare().await.unwrap();

    // a kill lands between preparation and execution
    let mut killed = h.saved();
    killed.set_killed(NaiveDate::from_ymd_opt(2025, 6, 2).unwrap().and_hms_opt(9, 31, 0).unwrap());
    h.write(&killed);

    let err = runner.execute().await.unwrap_err();
    assert!(matches!(err, RunError::KilledWithoutNotice));
    assert_eq!(runner.record_failure(err).await, 93);

    assert!(!exists(&h.scratch_work_dir().join("ran.txt")));
    let saved = h.saved();
    assert_eq!(saved, killed);
}

#[tokio::test]
async fn killed_record_makes_run_exit_with_dedicated_code() {
    let h = Harness::new("job.jwinfo");
    h.script("touch ran.txt");
    let mut record = Harness::in_input_dir(h.record());
    record.job_state = NaiveState::Killed;
    h.write(&record);

    let code = run_job(h.runner(CancellationToken::new()).await).await;

    assert_eq!(code, 93);
    assert!(!exists(&h.input_dir.join("ran.txt")));
    assert_eq!(h.saved().job_state, NaiveState::Killed);
    assert_eq!(h.saved().job_exit_code, None);
}

#[tokio::test]
async fn sigterm_marks_job_killed_and_stops_script() {
    let mut h = Harness::new("job.jwinfo");
    h.config.runner.sigterm_to_sigkill = Duration::from_secs(1);
    h.script("sleep 30");
    h.write(&Harness::in_input_dir(h.record()));

    let token = CancellationToken::new();
    let runner = h.runner(token.clone()).await;
    let task = tokio::spawn(run_job(runner));

    let mut started = false;
    for _ in 0..200 {
        if h.saved().job_state == NaiveState::Running {
            started = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(started, "job never reached the running state");
    token.cancel();

    let code = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, 143);
    let saved = h.saved();
    assert_eq!(saved.job_state, NaiveState::Killed);
    assert_eq!(saved.job_exit_code, None);
}

#[tokio::test]
async fn direct_execution_reports_exit_status() {
    let h = Harness::new("job.jwinfo");
    h.script("exit 0");
    h.write(&Harness::in_input_dir(h.record()));

    let mut runner = h.runner(CancellationToken::new()).await;
    assert!(!runner.uses_scratch());
    runner.set_up().await.unwrap();
    runner.prepare().await.unwrap();
    assert_eq!(runner.work_dir(), Some(h.input_dir.as_path()));
    assert_eq!(runner.execute().await.unwrap(), Execution::Exited(0));
    assert_eq!(h.saved().job_state, NaiveState::Running);
}

#[tokio::test]
async fn loop_job_archives_outputs_and_resubmits() {
    let h = Harness::new("job.sh+0002.jwinfo");
    h.script("cat md0002.gro > md0002.xtc\necho ok > notes.txt");
    let archive = h.input_dir.join("storage");
    std::fs::create_dir_all(&archive).unwrap();
    std::fs::write(archive.join("md0002.gro"), "frame").unwrap();
    // runtime files of the previous cycle
    std::fs::write(h.input_dir.join("job.sh+0001.jwinfo"), "old").unwrap();
    std::fs::write(h.input_dir.join("job.sh+0001.out"), "old out").unwrap();
    h.write(&loop_record(&h, 2, 3));

    let code = run_job(h.runner(CancellationToken::new()).await).await;

    assert_eq!(code, 0);
    assert_eq!(std::fs::read_to_string(archive.join("md0002.xtc")).unwrap(), "frame");
    assert!(!exists(&h.input_dir.join("md0002.xtc")));
    assert!(!exists(&h.input_dir.join("md0002.gro")));
    assert!(exists(&h.input_dir.join("notes.txt")));

    assert!(exists(&archive.join("md0001.jwinfo")));
    assert_eq!(std::fs::read_to_string(archive.join("md0001.out")).unwrap(), "old out");
    assert!(!exists(&h.input_dir.join("job.sh+0001.out")));

    let expected: Vec<String> = ["jw-submit", "job.sh", "-q", "long", "--depend=afterok=7.server"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(
        h.fake.calls(),
        vec![FakeCall::Resubmit {
            input_machine: "localhost".to_string(),
            input_dir: h.input_dir.clone(),
            command_line: expected,
        }]
    );
    assert_eq!(h.saved().job_state, NaiveState::Finished);
}

#[tokio::test]
async fn last_cycle_is_not_resubmitted() {
    let h = Harness::new("job.sh+0003.jwinfo");
    h.script("true");
    h.write(&loop_record(&h, 3, 3));

    assert_eq!(run_job(h.runner(CancellationToken::new()).await).await, 0);
    assert!(h.fake.calls().is_empty());
}

#[tokio::test]
async fn archive_inside_submission_directory_is_rejected() {
    let h = Harness::new("job.sh+0001.jwinfo");
    h.script("touch ran.txt");
    let mut record = loop_record(&h, 1, 2);
    if let Some(info) = record.loop_info.as_mut() {
        info.archive = PathBuf::from(".");
    }
    h.write(&record);

    let code = run_job(h.runner(CancellationToken::new()).await).await;

    assert_eq!(code, 91);
    assert!(!exists(&h.input_dir.join("ran.txt")));
    let saved = h.saved();
    assert_eq!(saved.job_state, NaiveState::Failed);
    assert_eq!(saved.job_exit_code, Some(91));
}

#[tokio::test]
async fn missing_record_is_fatal() {
    let h = Harness::new("job.jwinfo");
    let runner_env = RunnerEnv {
        info_file: h.record_path.clone(),
        input_machine: "localhost".to_string(),
        batch_system: None,
    };
    let err = Runner::load(runner_env, &h.registry, h.config.clone(), CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RunError::Fatal(_)));
    assert_eq!(err.exit_code(&h.config.exit_codes), 92);
}

#[tokio::test]
async fn record_of_another_job_is_fatal() {
    let h = Harness::new("job.jwinfo");
    h.write(&h.record());
    let other = Arc::new(FakeBatch::new(h.root.path().join("scratch")).with_current_job("8.server"));
    let mut registry = BatchRegistry::new();
    registry.register(other as Arc<dyn BatchSystem>);
    let runner_env = RunnerEnv {
        info_file: h.record_path.clone(),
        input_machine: "localhost".to_string(),
        batch_system: None,
    };

    let err = Runner::load(runner_env, &registry, h.config.clone(), CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RunError::Fatal(_)));
    assert_eq!(h.saved().job_state, NaiveState::Queued);
}

#[tokio::test]
async fn sigterm_before_start_marks_job_killed() {
    let h = Harness::new("job.jwinfo");
    h.script("touch ran.txt");
    h.write(&h.record());

    let token = CancellationToken::new();
    let runner = h.runner(token.clone()).await;
    token.cancel();
    let code = run_job(runner).await;

    assert_eq!(code, 143);
    assert!(!exists(&h.input_dir.join("ran.txt")));
    assert!(!exists(&h.scratch_work_dir().join("ran.txt")));
    let saved = h.saved();
    assert_eq!(saved.job_state, NaiveState::Killed);
    assert_eq!(saved.job_exit_code, None);
}
