mod test_harness;

use std::time::{Duration, Instant};

use serde_json::json;
use taskvisor::events::JobEvent;
use taskvisor::scheduler::{Job, JobFilter, JobStatus, JobStore, TransitionFields};
use taskvisor::SupervisorError;
use test_harness::{test_config, wait_for_status, wait_for_terminal, TestSupervisor};

#[tokio::test]
async fn test_stop_and_kill_refuse_jobs_that_are_not_running() {
    let mut ts = TestSupervisor::new(1);

    // Scheduler not started yet, so the job stays scheduled.
    let script = ts.script("ok.sh", "true\n");
    let scheduled = ts.submit(&script).await;
    assert!(!ts.supervisor.stop(scheduled).await.unwrap());
    assert!(!ts.supervisor.kill(scheduled).await.unwrap());

    assert!(!ts.supervisor.stop(999).await.unwrap());
    assert!(!ts.supervisor.kill(999).await.unwrap());

    ts.start().await;
    let done = wait_for_terminal(&ts.store, scheduled).await;
    assert_eq!(done.status, JobStatus::Done);
    assert!(!ts.supervisor.stop(scheduled).await.unwrap());
    assert!(!ts.supervisor.kill(scheduled).await.unwrap());

    let failing = ts.submit(&ts.script("fail.sh", "exit 2\n")).await;
    let failed = wait_for_terminal(&ts.store, failing).await;
    assert_eq!(failed.status, JobStatus::Error);
    assert!(!ts.supervisor.kill(failing).await.unwrap());
}

#[cfg(unix)]
#[tokio::test]
async fn test_kill_running_job() {
    let mut ts = TestSupervisor::new(1);
    ts.start().await;

    let job_id = ts.submit(&ts.script("long.sh", "sleep 30\n")).await;
    wait_for_status(&ts.store, job_id, JobStatus::Running).await;

    let started = Instant::now();
    assert!(ts.supervisor.kill(job_id).await.unwrap());

    let job = wait_for_terminal(&ts.store, job_id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert!(job.exit_code.is_none(), "killed by a signal, not an exit");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_running_job() {
    let mut ts = TestSupervisor::new(1);
    ts.start().await;

    let job_id = ts.submit(&ts.script("long.sh", "sleep 30\n")).await;
    wait_for_status(&ts.store, job_id, JobStatus::Running).await;

    let started = Instant::now();
    assert!(ts.supervisor.stop(job_id).await.unwrap());

    let job = wait_for_terminal(&ts.store, job_id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_restart_reruns_with_fresh_log() {
    let mut ts = TestSupervisor::new(1);
    ts.start().await;

    let job_id = ts.submit(&ts.script("hello.sh", "echo hello\n")).await;
    let first = wait_for_terminal(&ts.store, job_id).await;
    assert_eq!(first.status, JobStatus::Done);
    let log_path = first.log_path.clone().expect("log path recorded");

    ts.supervisor.restart(job_id).await.unwrap();

    let second = wait_for_job_rerun(&ts, job_id, first.started_at).await;
    assert_eq!(second.status, JobStatus::Done);
    assert_eq!(second.log_path.as_deref(), Some(log_path.as_str()));

    let log = std::fs::read(&log_path).unwrap();
    assert_eq!(log, b"$&hello\\n\n".to_vec(), "log holds only the latest run");
}

async fn wait_for_job_rerun(
    ts: &TestSupervisor,
    job_id: u64,
    previous_start: Option<chrono::DateTime<chrono::Utc>>,
) -> Job {
    test_harness::wait_for_job(&ts.store, job_id, Duration::from_secs(10), |job| {
        job.status.is_terminal() && job.started_at.is_some() && job.started_at != previous_start
    })
    .await
}

#[tokio::test]
async fn test_restart_clears_previous_run() {
    let ts = TestSupervisor::new(1);
    let job_id = ts.submit("/m/train.py").await;
    ts.store
        .transition(
            job_id,
            &[JobStatus::Scheduled],
            JobStatus::Running,
            TransitionFields::started(4242, "/l/out".to_string(), "/l/err".to_string()),
        )
        .await
        .unwrap();
    ts.store
        .transition(
            job_id,
            &[JobStatus::Running],
            JobStatus::Error,
            TransitionFields::finished(Some(1)),
        )
        .await
        .unwrap();

    let mut events = ts.supervisor.events().subscribe();
    ts.supervisor.restart(job_id).await.unwrap();

    match events.recv().await.unwrap() {
        JobEvent::Updated(job) => {
            assert_eq!(job.id, job_id);
            assert_eq!(job.status, JobStatus::Scheduled);
            assert!(job.pid.is_none());
            assert!(job.exit_code.is_none());
            assert!(job.started_at.is_none());
            assert!(job.finished_at.is_none());
        }
        other => panic!("expected a job update, got {:?}", other),
    }
}

#[tokio::test]
async fn test_restart_missing_job() {
    let ts = TestSupervisor::new(1);
    assert!(matches!(
        ts.supervisor.restart(42).await,
        Err(SupervisorError::JobNotFound(42))
    ));
}

#[tokio::test]
async fn test_delete_running_job_is_rejected() {
    let mut ts = TestSupervisor::new(1);
    ts.start().await;

    let job_id = ts.submit(&ts.script("long.sh", "sleep 30\n")).await;
    wait_for_status(&ts.store, job_id, JobStatus::Running).await;

    assert!(matches!(
        ts.supervisor.delete_job(job_id).await,
        Err(SupervisorError::JobRunning(id)) if id == job_id
    ));
    assert!(ts.supervisor.get_job(job_id).await.unwrap().is_some());

    ts.supervisor.kill(job_id).await.unwrap();
    wait_for_terminal(&ts.store, job_id).await;
}

#[tokio::test]
async fn test_delete_removes_job_and_logs() {
    let mut ts = TestSupervisor::new(1);
    ts.start().await;

    let job_id = ts
        .submit(&ts.script("noisy.sh", "echo out\necho err >&2\n"))
        .await;
    let job = wait_for_terminal(&ts.store, job_id).await;
    let log_path = job.log_path.clone().unwrap();
    let err_log_path = job.err_log_path.clone().unwrap();
    assert!(std::path::Path::new(&log_path).exists());

    ts.supervisor.delete_job(job_id).await.unwrap();

    assert!(ts.supervisor.get_job(job_id).await.unwrap().is_none());
    assert!(!std::path::Path::new(&log_path).exists());
    assert!(!std::path::Path::new(&err_log_path).exists());

    assert!(matches!(
        ts.supervisor.delete_job(job_id).await,
        Err(SupervisorError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_never_started_job() {
    let ts = TestSupervisor::new(1);
    let job_id = ts.submit(&ts.script("ok.sh", "true\n")).await;

    ts.supervisor.delete_job(job_id).await.unwrap();
    assert_eq!(ts.supervisor.count_jobs(&JobFilter::default()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_tail_log_windows() {
    let mut ts = TestSupervisor::new(1);
    ts.start().await;

    let job_id = ts.submit(&ts.script("digits.sh", "printf 0123456789\n")).await;
    wait_for_terminal(&ts.store, job_id).await;

    // Persisted as "$&0123456789\n", 13 bytes.
    let whole = ts.supervisor.tail_log(job_id, None, None).await.unwrap();
    assert_eq!(whole.content, "$&0123456789\n");
    assert_eq!(whole.size, 13);

    let tail = ts.supervisor.tail_log(job_id, Some(4), None).await.unwrap();
    assert_eq!(tail.content, "789\n");
    assert_eq!(tail.size, 13);

    let from_offset = ts.supervisor.tail_log(job_id, Some(3), Some(2)).await.unwrap();
    assert_eq!(from_offset.content, "012");

    let past_end = ts.supervisor.tail_log(job_id, None, Some(50)).await.unwrap();
    assert!(past_end.content.is_empty());
    assert_eq!(past_end.size, 13);
}

#[tokio::test]
async fn test_tail_log_before_first_run_is_empty() {
    let ts = TestSupervisor::new(1);
    let job_id = ts.submit(&ts.script("ok.sh", "true\n")).await;

    let window = ts.supervisor.tail_log(job_id, Some(100), None).await.unwrap();
    assert!(window.content.is_empty());
    assert_eq!(window.size, 0);

    assert!(matches!(
        ts.supervisor.tail_log(404, None, None).await,
        Err(SupervisorError::JobNotFound(404))
    ));
}

#[tokio::test]
async fn test_submit_script_resolves_against_modules_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 1);
    config.modules_dir = Some(dir.path().join("modules"));
    let ts = TestSupervisor::with_config(dir, config);

    let args = json!({ "epochs": 3 });
    let job_id = ts
        .supervisor
        .submit_script("train/run.sh", Some(&args), 7)
        .await
        .unwrap();

    let job = ts.job(job_id).await;
    let expected = ts.dir.path().join("modules").join("train/run.sh");
    assert_eq!(job.script_path, expected.to_string_lossy());
    assert_eq!(job.script_payload, r#"{"epochs":3}"#);
    assert_eq!(job.created_by_user_id, 7);
    assert_eq!(job.status, JobStatus::Scheduled);

    let defaulted = ts.supervisor.submit_script("run.sh", None, 7).await.unwrap();
    assert_eq!(ts.job(defaulted).await.script_payload, "{}");
}

#[tokio::test]
async fn test_submit_script_rejects_escaping_names() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 1);
    config.modules_dir = Some(dir.path().join("modules"));
    let ts = TestSupervisor::with_config(dir, config);

    for name in ["../secret.sh", "/etc/passwd", "a/../../b.sh", "  "] {
        assert!(
            matches!(
                ts.supervisor.submit_script(name, None, 1).await,
                Err(SupervisorError::InvalidScriptName(_))
            ),
            "{:?} should be rejected",
            name
        );
    }
    assert_eq!(ts.store.count(&JobFilter::default()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_list_and_count_through_supervisor() {
    let ts = TestSupervisor::new(1);
    let a = ts.supervisor.submit("/m/train.py", "{}", 1).await.unwrap();
    let b = ts.supervisor.submit("/m/capture.py", "{}", 2).await.unwrap();

    let jobs = ts
        .supervisor
        .list_jobs(&JobFilter::default(), 0, None)
        .await
        .unwrap();
    let ids: Vec<u64> = jobs.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![b, a]);

    let filter = JobFilter {
        script_name: Some("TRAIN.PY".to_string()),
        user_id: None,
    };
    assert_eq!(ts.supervisor.count_jobs(&filter).await.unwrap(), 1);
}
