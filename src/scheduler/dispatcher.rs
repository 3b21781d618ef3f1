use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{Result, SupervisorError};
use crate::events::{EventBus, JobEvent};
use crate::scheduler::job::{Job, JobId, JobStatus};
use crate::scheduler::store::{JobStore, TransitionFields};
use crate::worker::signal::{self, StopSignal};
use crate::worker::{Outcome, ProcessExecutor, ProcessStart};

/// Where a job launched by this dispatcher currently is.
#[derive(Debug, Clone)]
enum Phase {
    /// Handed to the executor, no pid yet
    Launching,
    /// Process running but its `running` status could not be written
    StartPending(ProcessStart),
    /// `running` persisted
    Started,
    /// The job row vanished before the process started; the process was killed
    Abandoned,
    /// Process exited, final status not persisted yet. Holds no slot, but
    /// keeps the job from being dispatched again while the store still
    /// reports it `scheduled`.
    Finishing,
}

/// A terminal status write that failed and is retried on a later tick.
#[derive(Debug, Clone)]
struct PendingWrite {
    job_id: JobId,
    start: Option<ProcessStart>,
    from: JobStatus,
    status: JobStatus,
    exit_code: Option<i32>,
}

/// Scheduler loop: on every tick, fills free execution slots with
/// `scheduled` jobs and launches each on its own task.
///
/// Launches are fire-and-forget, so the tick cadence never depends on how
/// long jobs run. Slot accounting counts jobs the store reports as
/// `running` plus jobs launched here whose `running` write has not landed.
/// A job stays in flight until its final status is persisted, and a job
/// that is in flight is never launched a second time.
#[derive(Clone)]
pub struct Dispatcher {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    executor: ProcessExecutor,
    events: EventBus,
    in_flight: Arc<Mutex<HashMap<JobId, Phase>>>,
    pending_writes: Arc<Mutex<Vec<PendingWrite>>>,
}

impl Dispatcher {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        executor: ProcessExecutor,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            executor,
            events,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            pending_writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Tick until `shutdown` is cancelled. A tick in progress always
    /// completes before the loop exits; launched jobs are left running.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            max_parallel = self.config.max_parallel,
            interval_ms = self.config.interval.as_millis() as u64,
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }

        tracing::info!(in_flight = self.in_flight_count(), "Scheduler loop stopped");
    }

    /// One dispatch pass. Returns the number of jobs launched.
    pub async fn tick(&self) -> Result<usize> {
        self.retry_pending_writes().await;

        let max_parallel = self.config.max_parallel;
        let running = self
            .store
            .get_by_status(JobStatus::Running, max_parallel + 1)
            .await?
            .len();
        let (launching, in_flight) = {
            let in_flight = self.lock_in_flight();
            let launching = in_flight
                .values()
                .filter(|phase| matches!(phase, Phase::Launching | Phase::StartPending(_)))
                .count();
            (launching, in_flight.len())
        };

        let available = max_parallel.saturating_sub(running + launching);
        if available == 0 {
            tracing::trace!(running, launching, "No free execution slots");
            return Ok(0);
        }

        let candidates = self
            .store
            .get_by_status(JobStatus::Scheduled, available + in_flight)
            .await?;

        let mut launched = 0;
        for job in candidates {
            if launched == available {
                break;
            }
            if !self.claim(job.id) {
                tracing::debug!(job_id = job.id, "Job still in flight, skipping");
                continue;
            }

            tracing::info!(job_id = job.id, script = %job.script_path, "Dispatching job");
            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.run_job(job).await;
            });
            launched += 1;
        }

        Ok(launched)
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    pub fn is_in_flight(&self, job_id: JobId) -> bool {
        self.lock_in_flight().contains_key(&job_id)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<JobId, Phase>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending_writes(&self) -> MutexGuard<'_, Vec<PendingWrite>> {
        self.pending_writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn claim(&self, job_id: JobId) -> bool {
        let mut in_flight = self.lock_in_flight();
        if in_flight.contains_key(&job_id) {
            return false;
        }
        in_flight.insert(job_id, Phase::Launching);
        true
    }

    fn set_phase(&self, job_id: JobId, phase: Phase) {
        self.lock_in_flight().insert(job_id, phase);
    }

    async fn run_job(self, job: Job) {
        let job_id = job.id;
        let this = self.clone();
        let outcome = self
            .executor
            .execute(&job, move |start| async move {
                this.on_started(job_id, start).await;
            })
            .await;

        self.on_finished(job_id, outcome).await;
    }

    async fn on_started(&self, job_id: JobId, start: ProcessStart) {
        let fields = TransitionFields::started(
            start.pid,
            start.log_path.clone(),
            start.err_log_path.clone(),
        );

        match self
            .store
            .transition(job_id, &[JobStatus::Scheduled], JobStatus::Running, fields)
            .await
        {
            Ok(job) => {
                self.set_phase(job_id, Phase::Started);
                tracing::info!(job_id, pid = start.pid, "Job started");
                self.events.publish(JobEvent::Updated(job));
            }
            Err(e @ (SupervisorError::JobNotFound(_) | SupervisorError::InvalidTransition { .. })) => {
                tracing::warn!(job_id, pid = start.pid, error = %e, "Job changed before its process started, killing it");
                self.set_phase(job_id, Phase::Abandoned);
                signal::send(start.pid, StopSignal::Kill);
            }
            Err(e) => {
                tracing::error!(job_id, pid = start.pid, error = %e, "Failed to persist running status");
                self.set_phase(job_id, Phase::StartPending(start));
            }
        }
    }

    async fn on_finished(&self, job_id: JobId, outcome: Outcome) {
        let status = outcome.status();
        if outcome.is_spawn_failure() {
            tracing::error!(job_id, error = ?outcome.error, "Job did not start");
        } else if status == JobStatus::Error {
            tracing::warn!(
                job_id,
                exit_code = ?outcome.exit_code,
                signal = ?outcome.signal,
                error = ?outcome.error,
                "Job failed"
            );
        } else {
            tracing::info!(job_id, "Job finished");
        }

        let phase = self
            .lock_in_flight()
            .insert(job_id, Phase::Finishing)
            .unwrap_or(Phase::Launching);

        let write = match phase {
            Phase::Abandoned | Phase::Finishing => {
                self.lock_in_flight().remove(&job_id);
                return;
            }
            Phase::Launching => PendingWrite {
                job_id,
                start: None,
                from: JobStatus::Scheduled,
                status: JobStatus::Error,
                exit_code: outcome.exit_code,
            },
            Phase::StartPending(start) => PendingWrite {
                job_id,
                start: Some(start),
                from: JobStatus::Running,
                status,
                exit_code: outcome.exit_code,
            },
            Phase::Started => PendingWrite {
                job_id,
                start: None,
                from: JobStatus::Running,
                status,
                exit_code: outcome.exit_code,
            },
        };

        self.apply_write(write).await;
    }

    async fn retry_pending_writes(&self) {
        let writes = std::mem::take(&mut *self.lock_pending_writes());
        if writes.is_empty() {
            return;
        }
        tracing::info!(count = writes.len(), "Retrying failed job status writes");
        for write in writes {
            self.apply_write(write).await;
        }
    }

    async fn apply_write(&self, write: PendingWrite) {
        match self.persist_terminal(&write).await {
            Ok(job) => {
                tracing::debug!(job_id = job.id, status = %job.status, "Job status persisted");
                self.lock_in_flight().remove(&job.id);
                self.events.publish(JobEvent::Updated(job));
            }
            Err(SupervisorError::JobNotFound(job_id)) => {
                tracing::warn!(job_id, "Job was deleted while running, dropping its final status");
                self.lock_in_flight().remove(&job_id);
            }
            Err(e @ SupervisorError::InvalidTransition { .. }) => {
                tracing::warn!(job_id = write.job_id, error = %e, "Job changed while running, dropping its final status");
                self.lock_in_flight().remove(&write.job_id);
            }
            Err(e) => {
                tracing::error!(
                    job_id = write.job_id,
                    status = %write.status,
                    error = %e,
                    "Failed to persist final job status, retrying next tick"
                );
                self.lock_pending_writes().push(write);
            }
        }
    }

    /// Write the terminal status, first catching up on a `running` write
    /// that never landed so `running` is still observed before the end state.
    async fn persist_terminal(&self, write: &PendingWrite) -> Result<Job> {
        if let Some(start) = &write.start {
            let fields = TransitionFields::started(
                start.pid,
                start.log_path.clone(),
                start.err_log_path.clone(),
            );
            match self
                .store
                .transition(write.job_id, &[JobStatus::Scheduled], JobStatus::Running, fields)
                .await
            {
                Ok(job) => self.events.publish(JobEvent::Updated(job)),
                Err(SupervisorError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.store
            .transition(
                write.job_id,
                &[write.from],
                write.status,
                TransitionFields::finished(write.exit_code),
            )
            .await
    }
}
