//! Shared helpers for supervisor integration tests.
//!
//! Jobs run through `sh` with scripts written into a temporary directory, so
//! tests do not depend on python or on anything outside the temp dir.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use taskvisor::config::{Platform, ShellConfig, SupervisorConfig};
use taskvisor::scheduler::{Job, JobId, JobStatus, JobStore, LocalJobStore};
use taskvisor::Supervisor;

/// Runs `sh '<script>' <job_id>` through `sh -c`.
pub fn sh_shell() -> ShellConfig {
    ShellConfig {
        command: "sh".to_string(),
        source_cmd: None,
        interpreter: Some("sh".to_string()),
        platform: Platform::Posix,
    }
}

/// Config with a fast tick and logs inside `dir`.
pub fn test_config(dir: &Path, max_parallel: usize) -> SupervisorConfig {
    SupervisorConfig::default()
        .with_max_parallel(max_parallel)
        .with_interval(Duration::from_millis(50))
        .with_log_directory(dir.join("logs"))
        .with_shell(sh_shell())
}

/// Write a shell script and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write test script");
    path.to_string_lossy().into_owned()
}

/// A supervisor over an in-memory store, plus the handles needed to drive it.
pub struct TestSupervisor {
    pub dir: TempDir,
    pub store: Arc<LocalJobStore>,
    pub supervisor: Supervisor,
    pub shutdown: CancellationToken,
    scheduler: Option<JoinHandle<()>>,
}

impl TestSupervisor {
    pub fn new(max_parallel: usize) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let config = test_config(dir.path(), max_parallel);
        Self::with_config(dir, config)
    }

    pub fn with_config(dir: TempDir, config: SupervisorConfig) -> Self {
        let store = Arc::new(LocalJobStore::in_memory());
        let dyn_store: Arc<dyn JobStore> = store.clone();
        let supervisor = Supervisor::new(config, dyn_store);
        Self {
            dir,
            store,
            supervisor,
            shutdown: CancellationToken::new(),
            scheduler: None,
        }
    }

    /// Run startup recovery and begin ticking.
    pub async fn start(&mut self) {
        let handle = self
            .supervisor
            .start(self.shutdown.clone())
            .await
            .expect("supervisor start");
        self.scheduler = Some(handle);
    }

    pub fn script(&self, name: &str, body: &str) -> String {
        write_script(self.dir.path(), name, body)
    }

    pub async fn submit(&self, script_path: &str) -> JobId {
        self.supervisor
            .submit(script_path, "{}", 1)
            .await
            .expect("submit job")
    }

    pub async fn job(&self, job_id: JobId) -> Job {
        self.store
            .get_by_id(job_id)
            .await
            .expect("store read")
            .expect("job exists")
    }

    pub async fn stop_scheduler(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestSupervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Poll until `job_id` satisfies `predicate`, panicking after `timeout`.
pub async fn wait_for_job<F>(store: &LocalJobStore, job_id: JobId, timeout: Duration, predicate: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(job) = store.get_by_id(job_id).await.expect("store read") {
            if predicate(&job) {
                return job;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("job {} did not reach expected state, last seen {:?}", job_id, job);
            }
        } else if tokio::time::Instant::now() >= deadline {
            panic!("job {} does not exist", job_id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_status(
    store: &LocalJobStore,
    job_id: JobId,
    status: JobStatus,
) -> Job {
    wait_for_job(store, job_id, Duration::from_secs(10), |job| job.status == status).await
}

pub async fn wait_for_terminal(store: &LocalJobStore, job_id: JobId) -> Job {
    wait_for_job(store, job_id, Duration::from_secs(10), |job| job.status.is_terminal()).await
}
