use std::path::{Component, Path};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::events::{EventBus, JobEvent};
use crate::scheduler::{
    Dispatcher, Job, JobFilter, JobId, JobStatus, JobStore, TransitionFields,
};
use crate::worker::log_tail::{self, LogWindow};
use crate::worker::signal::{self, StopSignal};
use crate::worker::ProcessExecutor;

/// Entry point for everything outside the scheduler: submitting and
/// controlling jobs, reading their logs, and booting the scheduler loop.
#[derive(Clone)]
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    store: Arc<dyn JobStore>,
    events: EventBus,
    executor: ProcessExecutor,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, store: Arc<dyn JobStore>) -> Self {
        let events = EventBus::new(config.event_capacity);
        let executor = ProcessExecutor::new(
            config.shell.clone(),
            config.scheduler.log_directory.clone(),
            events.clone(),
        );

        Self {
            config: Arc::new(config),
            store,
            events,
            executor,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Boot sequence: reconcile jobs left `running` by a previous instance,
    /// make sure the log directory exists, then start ticking.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, if recovery cannot read the store,
    /// or if the log directory cannot be created. Everything after that runs
    /// on the returned task.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        self.config.validate()?;
        self.recover().await?;

        let log_directory = &self.config.scheduler.log_directory;
        tokio::fs::create_dir_all(log_directory).await?;
        tracing::info!(path = %log_directory.display(), "Job log directory ready");

        let dispatcher = Dispatcher::new(
            self.config.scheduler.clone(),
            self.store.clone(),
            self.executor.clone(),
            self.events.clone(),
        );
        Ok(tokio::spawn(dispatcher.run(shutdown)))
    }

    /// Startup recovery.
    ///
    /// Nothing supervises a job marked `running` by an earlier instance any
    /// more, so its process (if one still exists) is killed and the job is
    /// marked `error`. Returns the number of jobs reconciled; a second call
    /// finds nothing to do.
    pub async fn recover(&self) -> Result<usize> {
        let running = self.store.get_running_jobs().await?;
        let mut recovered = 0;

        for job in running {
            match job.pid {
                Some(pid) => {
                    tracing::info!(job_id = job.id, pid, "Killing job left running by a previous instance");
                    signal::send(pid, StopSignal::Kill);
                }
                None => {
                    tracing::warn!(job_id = job.id, "Job marked running without a pid");
                }
            }

            match self
                .store
                .transition(
                    job.id,
                    &[JobStatus::Running],
                    JobStatus::Error,
                    TransitionFields::finished(None),
                )
                .await
            {
                Ok(job) => {
                    recovered += 1;
                    self.events.publish(JobEvent::Updated(job));
                }
                Err(e) => {
                    tracing::error!(job_id = job.id, error = %e, "Failed to mark orphaned job as error");
                }
            }
        }

        if recovered > 0 {
            tracing::info!(recovered, "Startup recovery finished");
        }
        Ok(recovered)
    }

    /// Create a `scheduled` job for an already resolved script path.
    pub async fn submit(&self, script_path: &str, payload: &str, user_id: u64) -> Result<JobId> {
        let job_id = self.store.insert(script_path, payload, user_id).await?;
        tracing::info!(job_id, script_path, user_id, "Job submitted");
        if let Some(job) = self.store.get_by_id(job_id).await? {
            self.events.publish(JobEvent::Updated(job));
        }
        Ok(job_id)
    }

    /// Resolve `script_name` and submit it with `args` serialized as payload.
    pub async fn submit_script(
        &self,
        script_name: &str,
        args: Option<&Value>,
        user_id: u64,
    ) -> Result<JobId> {
        let script_path = self.resolve_script(script_name)?;
        let payload = match args {
            Some(args) => serde_json::to_string(args)?,
            None => "{}".to_string(),
        };
        self.submit(&script_path, &payload, user_id).await
    }

    /// Map a submitted script name onto the modules directory.
    pub fn resolve_script(&self, script_name: &str) -> Result<String> {
        let name = script_name.trim();
        if name.is_empty() {
            return Err(SupervisorError::InvalidScriptName(script_name.to_string()));
        }

        let Some(modules_dir) = &self.config.modules_dir else {
            return Ok(name.to_string());
        };

        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(SupervisorError::InvalidScriptName(script_name.to_string()));
        }

        Ok(modules_dir.join(relative).to_string_lossy().into_owned())
    }

    /// Ask a running job to exit (SIGINT). The status changes once the
    /// process actually exits.
    pub async fn stop(&self, job_id: JobId) -> Result<bool> {
        self.signal_job(job_id, StopSignal::Interrupt).await
    }

    /// Terminate a running job unconditionally (SIGKILL).
    pub async fn kill(&self, job_id: JobId) -> Result<bool> {
        self.signal_job(job_id, StopSignal::Kill).await
    }

    async fn signal_job(&self, job_id: JobId, sig: StopSignal) -> Result<bool> {
        let Some(job) = self.store.get_by_id(job_id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        let Some(pid) = job.pid else {
            tracing::warn!(job_id, "Running job has no pid to signal");
            return Ok(false);
        };

        tracing::info!(job_id, pid, signal = %sig, "Signalling job");
        if !signal::send(pid, sig) {
            tracing::warn!(job_id, pid, signal = %sig, "Signal was not delivered");
        }
        Ok(true)
    }

    /// Put a job back to `scheduled`. Does not look at the current status;
    /// callers restart terminal jobs only.
    pub async fn restart(&self, job_id: JobId) -> Result<()> {
        self.store.reschedule(job_id).await?;
        tracing::info!(job_id, "Job rescheduled");
        if let Some(job) = self.store.get_by_id(job_id).await? {
            self.events.publish(JobEvent::Updated(job));
        }
        Ok(())
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.store.get_by_id(job_id).await
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Job>> {
        self.store.list(filter, skip, limit).await
    }

    pub async fn count_jobs(&self, filter: &JobFilter) -> Result<usize> {
        self.store.count(filter).await
    }

    /// Remove a job that is not running, together with its log files.
    pub async fn delete_job(&self, job_id: JobId) -> Result<()> {
        let job = self
            .store
            .get_by_id(job_id)
            .await?
            .ok_or(SupervisorError::JobNotFound(job_id))?;
        if job.status == JobStatus::Running {
            return Err(SupervisorError::JobRunning(job_id));
        }

        for path in [&job.log_path, &job.err_log_path].into_iter().flatten() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !self.store.delete_by_id(job_id).await? {
            return Err(SupervisorError::JobNotFound(job_id));
        }
        tracing::info!(job_id, "Job deleted");
        Ok(())
    }

    /// Windowed read of a job's combined log.
    pub async fn tail_log(
        &self,
        job_id: JobId,
        max_size: Option<u64>,
        offset: Option<u64>,
    ) -> Result<LogWindow> {
        let job = self
            .store
            .get_by_id(job_id)
            .await?
            .ok_or(SupervisorError::JobNotFound(job_id))?;

        let Some(log_path) = job.log_path else {
            return Ok(LogWindow {
                content: String::new(),
                size: 0,
            });
        };

        match log_tail::tail_file(&log_path, max_size, offset).await {
            Err(SupervisorError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(LogWindow {
                    content: String::new(),
                    size: 0,
                })
            }
            other => other,
        }
    }
}
