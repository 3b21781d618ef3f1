use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, SupervisorError};
use crate::scheduler::job::{Job, JobId, JobStatus};

/// Filter shared by job listing and counting.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    /// Case-insensitive suffix of the script path
    pub script_name: Option<String>,
    pub user_id: Option<u64>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(user_id) = self.user_id {
            if job.created_by_user_id != user_id {
                return false;
            }
        }
        match self.script_name.as_deref() {
            Some(name) if !name.is_empty() => job
                .script_path
                .to_lowercase()
                .ends_with(&name.to_lowercase()),
            _ => true,
        }
    }
}

/// Fields written together with a status change.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub pid: Option<u32>,
    pub log_path: Option<String>,
    pub err_log_path: Option<String>,
    pub exit_code: Option<i32>,
}

impl TransitionFields {
    pub fn started(pid: u32, log_path: String, err_log_path: String) -> Self {
        Self {
            pid: Some(pid),
            log_path: Some(log_path),
            err_log_path: Some(err_log_path),
            exit_code: None,
        }
    }

    pub fn finished(exit_code: Option<i32>) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }
}

/// Persistent job records.
///
/// Every method touches a single job row atomically; no locking is expected
/// from callers. The narrow `update_*` mutators exist for callers that manage
/// ordering themselves, [`JobStore::transition`] checks the state machine and
/// writes all fields of a status change at once.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job in `scheduled` state.
    async fn insert(&self, script_path: &str, payload: &str, user_id: u64) -> Result<JobId>;

    async fn get_by_id(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Up to `limit` jobs with `status`, oldest first. Empty when `limit < 1`.
    async fn get_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>>;

    async fn get_running_jobs(&self) -> Result<Vec<Job>>;

    async fn update_status(&self, job_id: JobId, status: JobStatus) -> Result<()>;

    async fn update_pid(&self, job_id: JobId, pid: u32) -> Result<()>;

    async fn update_log_path(&self, job_id: JobId, log_path: &str) -> Result<()>;

    async fn update_err_log_path(&self, job_id: JobId, err_log_path: &str) -> Result<()>;

    /// Move a job to `to` if its current status is one of `from` and the edge
    /// is part of the state machine. Returns the updated job.
    async fn transition(
        &self,
        job_id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job>;

    /// Reset a job to `scheduled` regardless of its status, clearing the
    /// previous run's pid, exit code and timestamps. Log paths are kept.
    async fn reschedule(&self, job_id: JobId) -> Result<()>;

    /// Jobs matching `filter`, newest first.
    async fn list(&self, filter: &JobFilter, skip: usize, limit: Option<usize>)
        -> Result<Vec<Job>>;

    async fn count(&self, filter: &JobFilter) -> Result<usize>;

    /// Returns false if no such job existed.
    async fn delete_by_id(&self, job_id: JobId) -> Result<bool>;
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    next_id: JobId,
    jobs: Vec<Job>,
}

/// Job store held in memory and optionally mirrored to a JSON snapshot file.
///
/// A mutation is applied to a copy of the table, written to disk, and only
/// then made visible, so a failed write leaves the previous state in place.
#[derive(Debug)]
pub struct LocalJobStore {
    state: RwLock<StoreState>,
    snapshot_path: Option<PathBuf>,
}

impl Default for LocalJobStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl LocalJobStore {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState {
                next_id: 1,
                jobs: BTreeMap::new(),
            }),
            snapshot_path: None,
        }
    }

    /// Load the snapshot at `path`, starting empty if it does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                let jobs: BTreeMap<JobId, Job> =
                    snapshot.jobs.into_iter().map(|job| (job.id, job)).collect();
                let next_id = jobs
                    .keys()
                    .next_back()
                    .map(|id| id + 1)
                    .unwrap_or(1)
                    .max(snapshot.next_id);
                tracing::info!(path = %path.display(), jobs = jobs.len(), "Loaded job store snapshot");
                StoreState { next_id, jobs }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState {
                next_id: 1,
                jobs: BTreeMap::new(),
            },
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path),
        })
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let snapshot = Snapshot {
            next_id: state.next_id,
            jobs: state.jobs.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn mutate<T, F>(&self, apply: F) -> Result<T>
    where
        F: FnOnce(&mut StoreState) -> Result<T> + Send,
        T: Send,
    {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let value = apply(&mut next)?;
        self.persist(&next).await?;
        *state = next;
        Ok(value)
    }

    async fn update_job<F>(&self, job_id: JobId, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Job) + Send,
    {
        self.mutate(|state| {
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(SupervisorError::JobNotFound(job_id))?;
            apply(job);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl JobStore for LocalJobStore {
    async fn insert(&self, script_path: &str, payload: &str, user_id: u64) -> Result<JobId> {
        let job_id = self
            .mutate(|state| {
                let id = state.next_id;
                state.next_id += 1;
                state.jobs.insert(
                    id,
                    Job::new(id, script_path.to_string(), payload.to_string(), user_id),
                );
                Ok(id)
            })
            .await?;
        tracing::debug!(job_id, script_path, user_id, "Job inserted");
        Ok(job_id)
    }

    async fn get_by_id(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.state.read().await.jobs.get(&job_id).cloned())
    }

    async fn get_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>> {
        if limit < 1 {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_running_jobs(&self) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .cloned()
            .collect())
    }

    async fn update_status(&self, job_id: JobId, status: JobStatus) -> Result<()> {
        self.update_job(job_id, |job| job.status = status).await
    }

    async fn update_pid(&self, job_id: JobId, pid: u32) -> Result<()> {
        self.update_job(job_id, |job| job.pid = Some(pid)).await
    }

    async fn update_log_path(&self, job_id: JobId, log_path: &str) -> Result<()> {
        self.update_job(job_id, |job| job.log_path = Some(log_path.to_string()))
            .await
    }

    async fn update_err_log_path(&self, job_id: JobId, err_log_path: &str) -> Result<()> {
        self.update_job(job_id, |job| {
            job.err_log_path = Some(err_log_path.to_string())
        })
        .await
    }

    async fn transition(
        &self,
        job_id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job> {
        self.mutate(|state| {
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(SupervisorError::JobNotFound(job_id))?;

            if !from.contains(&job.status) || !job.status.can_transition_to(to) {
                return Err(SupervisorError::InvalidTransition {
                    job_id,
                    from: job.status,
                    to,
                });
            }

            job.status = to;
            if let Some(pid) = fields.pid {
                job.pid = Some(pid);
            }
            if let Some(log_path) = fields.log_path {
                job.log_path = Some(log_path);
            }
            if let Some(err_log_path) = fields.err_log_path {
                job.err_log_path = Some(err_log_path);
            }
            if to == JobStatus::Running {
                job.started_at = Some(Utc::now());
            }
            if to.is_terminal() {
                job.exit_code = fields.exit_code;
                job.finished_at = Some(Utc::now());
            }
            Ok(job.clone())
        })
        .await
    }

    async fn reschedule(&self, job_id: JobId) -> Result<()> {
        self.update_job(job_id, |job| {
            job.status = JobStatus::Scheduled;
            job.pid = None;
            job.exit_code = None;
            job.started_at = None;
            job.finished_at = None;
        })
        .await
    }

    async fn list(
        &self,
        filter: &JobFilter,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<&Job> = state.jobs.values().filter(|j| filter.matches(j)).collect();
        jobs.sort_by(|a, b| {
            b.creation_date
                .cmp(&a.creation_date)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(jobs
            .into_iter()
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn count(&self, filter: &JobFilter) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state.jobs.values().filter(|j| filter.matches(j)).count())
    }

    async fn delete_by_id(&self, job_id: JobId) -> Result<bool> {
        self.mutate(|state| Ok(state.jobs.remove(&job_id).is_some()))
            .await
    }
}
