use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdout, Command};

use crate::config::ShellConfig;
use crate::events::{EventBus, JobEvent};
use crate::scheduler::{Job, JobId, JobStatus};
use crate::worker::log_line::{self, OutputStream};

const CHUNK_SIZE: usize = 8 * 1024;

/// Handed to the caller once the OS process exists, before any of its
/// output is consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStart {
    pub pid: u32,
    pub log_path: String,
    pub err_log_path: String,
}

/// How one execution ended.
///
/// A process that never started has `error` set and no exit code; a process
/// that ran has an exit code, or a signal when it was terminated by one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub error: Option<String>,
}

impl Outcome {
    fn failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_spawn_failure(&self) -> bool {
        self.error.is_some() && self.exit_code.is_none() && self.signal.is_none()
    }

    /// Terminal job status: `done` only for a clean zero exit.
    pub fn status(&self) -> JobStatus {
        if self.error.is_none() && self.exit_code == Some(0) {
            JobStatus::Done
        } else {
            JobStatus::Error
        }
    }
}

/// Runs job scripts as child processes and captures their output.
///
/// stdout and stderr are interleaved into one log file per job, every chunk
/// tagged with its stream (see [`log_line`]). stderr chunks are also copied
/// to a separate error log. Each line is published on the [`EventBus`]
/// after it has been written to disk.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    shell: ShellConfig,
    log_directory: PathBuf,
    events: EventBus,
}

impl ProcessExecutor {
    pub fn new(shell: ShellConfig, log_directory: impl Into<PathBuf>, events: EventBus) -> Self {
        Self {
            shell,
            log_directory: log_directory.into(),
            events,
        }
    }

    pub fn log_directory(&self) -> &Path {
        &self.log_directory
    }

    pub fn log_path(&self, job_id: JobId) -> PathBuf {
        self.log_directory.join(format!("{}.stdout.log", job_id))
    }

    pub fn err_log_path(&self, job_id: JobId) -> PathBuf {
        self.log_directory.join(format!("{}.stderr.log", job_id))
    }

    /// Execute `job` to completion.
    ///
    /// `on_start` runs once the pid is known and is awaited before output
    /// is read. Log files are truncated, so a restarted job starts with empty
    /// logs at the same paths. Never fails: every failure is described by the
    /// returned [`Outcome`].
    pub async fn execute<F, Fut>(&self, job: &Job, on_start: F) -> Outcome
    where
        F: FnOnce(ProcessStart) -> Fut,
        Fut: Future<Output = ()>,
    {
        let log_path = self.log_path(job.id);
        let err_log_path = self.err_log_path(job.id);

        let mut log = match File::create(&log_path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(job_id = job.id, path = %log_path.display(), error = %e, "Failed to create job log");
                return Outcome::failed(format!("failed to create log file: {}", e));
            }
        };
        let mut err_log = match File::create(&err_log_path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(job_id = job.id, path = %err_log_path.display(), error = %e, "Failed to create job error log");
                return Outcome::failed(format!("failed to create error log file: {}", e));
            }
        };

        let args = self.shell.invocation(&job.script_path, job.id);
        let mut command = Command::new(&self.shell.command);
        command
            .args(&args)
            .env("JOB_ID", job.id.to_string())
            .env("JOB_PAYLOAD", &job.script_payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        tracing::info!(job_id = job.id, command = %self.shell.command, args = ?args, "Spawning job");

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Job failed to spawn");
                return Outcome::failed(e.to_string());
            }
        };

        let pid = child.id().unwrap_or_default();
        on_start(ProcessStart {
            pid,
            log_path: log_path.to_string_lossy().into_owned(),
            err_log_path: err_log_path.to_string_lossy().into_owned(),
        })
        .await;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.capture(job.id, stdout, stderr, &mut log, &mut err_log)
            .await;

        let outcome = match child.wait().await {
            Ok(status) => Outcome {
                exit_code: status.code(),
                signal: exit_signal(&status),
                error: None,
            },
            Err(e) => {
                tracing::error!(job_id = job.id, pid, error = %e, "Failed to wait for job process");
                Outcome::failed(format!("failed to wait for process: {}", e))
            }
        };

        tracing::info!(
            job_id = job.id,
            pid,
            exit_code = ?outcome.exit_code,
            signal = ?outcome.signal,
            "Job process exited"
        );
        outcome
    }

    /// Drain both pipes until they close, one log line per chunk read.
    async fn capture(
        &self,
        job_id: JobId,
        mut stdout: Option<ChildStdout>,
        mut stderr: Option<ChildStderr>,
        log: &mut File,
        err_log: &mut File,
    ) {
        let mut out_buf = vec![0u8; CHUNK_SIZE];
        let mut err_buf = vec![0u8; CHUNK_SIZE];
        let mut log_ok = true;
        let mut err_log_ok = true;

        while stdout.is_some() || stderr.is_some() {
            let (stream, read) = tokio::select! {
                read = read_chunk(&mut stdout, &mut out_buf) => (OutputStream::Stdout, read),
                read = read_chunk(&mut stderr, &mut err_buf) => (OutputStream::Stderr, read),
            };

            let n = match read {
                Ok(0) => {
                    close(stream, &mut stdout, &mut stderr);
                    continue;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(job_id, stream = ?stream, error = %e, "Failed to read job output");
                    close(stream, &mut stdout, &mut stderr);
                    continue;
                }
            };

            let chunk = match stream {
                OutputStream::Stdout => &out_buf[..n],
                OutputStream::Stderr => &err_buf[..n],
            };
            let line = log_line::encode(stream, chunk);

            if log_ok {
                if let Err(e) = append(log, &line).await {
                    tracing::error!(job_id, error = %e, "Failed to write job log");
                    log_ok = false;
                }
            }
            if stream == OutputStream::Stderr && err_log_ok {
                if let Err(e) = append(err_log, &line).await {
                    tracing::error!(job_id, error = %e, "Failed to write job error log");
                    err_log_ok = false;
                }
            }

            self.events.publish(JobEvent::Log {
                job_id,
                log_data: String::from_utf8_lossy(&line).into_owned(),
            });
        }
    }
}

async fn read_chunk<R>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

fn close(stream: OutputStream, stdout: &mut Option<ChildStdout>, stderr: &mut Option<ChildStderr>) {
    match stream {
        OutputStream::Stdout => *stdout = None,
        OutputStream::Stderr => *stderr = None,
    }
}

async fn append(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(crate::worker::signal::signal_name)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}
