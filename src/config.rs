use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SupervisorError};

/// Operating system family that decides how a job's shell line is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    Windows,
}

impl Platform {
    /// Platform of the running supervisor.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }
}

/// How a job's script is handed to the operating system.
///
/// Every job runs as `<command> -c "<source_cmd> && <interpreter> <script> <job_id>"`
/// on POSIX and with `;` as the separator on Windows (PowerShell).
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Shell executable (e.g. "bash", "powershell.exe")
    pub command: String,
    /// Environment activation run before the script (e.g. "source venv/bin/activate")
    pub source_cmd: Option<String>,
    /// Program the script is passed to (e.g. "python3 -u").
    /// When unset the script path itself is executed.
    pub interpreter: Option<String>,
    /// Controls the invocation syntax
    pub platform: Platform,
}

impl ShellConfig {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Posix => Self {
                command: "bash".to_string(),
                source_cmd: None,
                interpreter: Some("python3 -u".to_string()),
                platform,
            },
            Platform::Windows => Self {
                command: "powershell.exe".to_string(),
                source_cmd: None,
                interpreter: Some("python -u".to_string()),
                platform,
            },
        }
    }

    /// Build the argument list passed to `command` for one job run.
    pub fn invocation(&self, script_path: &str, job_id: u64) -> Vec<String> {
        let script = match self.platform {
            Platform::Posix => posix_quote(script_path),
            Platform::Windows => format!("\"{}\"", script_path.replace('"', "`\"")),
        };
        let run = match self.interpreter.as_deref().filter(|i| !i.trim().is_empty()) {
            Some(interpreter) => format!("{} {} {}", interpreter, script, job_id),
            None => format!("{} {}", script, job_id),
        };

        let line = match self.source_cmd.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(source) => match self.platform {
                Platform::Posix => format!("{} && {}", source, run),
                Platform::Windows => format!("{}; {}", source, run),
            },
            None => run,
        };

        vec!["-c".to_string(), line]
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self::for_platform(Platform::current())
    }
}

fn posix_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Scheduler loop settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound of jobs in `running` state
    pub max_parallel: usize,
    /// Period of the dispatch tick, measured from the start of one tick to the next
    pub interval: Duration,
    /// Directory holding per-job log files; created at startup if absent
    pub log_directory: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            interval: Duration::from_millis(1000),
            log_directory: PathBuf::from(".scheduler"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub listen_addr: SocketAddr,
    /// JSON snapshot of the job table. `None` keeps jobs in memory only.
    pub store_path: Option<PathBuf>,
    /// Directory that submitted script names are resolved against
    pub modules_dir: Option<PathBuf>,
    /// Buffered events per subscriber before slow subscribers start lagging
    pub event_capacity: usize,
    pub scheduler: SchedulerConfig,
    pub shell: ShellConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:4000"
                .parse()
                .expect("default listen address is valid"),
            store_path: None,
            modules_dir: None,
            event_capacity: 1024,
            scheduler: SchedulerConfig::default(),
            shell: ShellConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Reject settings under which the scheduler could never run a job.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_parallel == 0 {
            return Err(SupervisorError::InvalidConfig(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        if self.scheduler.interval.is_zero() {
            return Err(SupervisorError::InvalidConfig(
                "scheduler interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.scheduler.max_parallel = max_parallel;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.scheduler.interval = interval;
        self
    }

    pub fn with_log_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scheduler.log_directory = dir.into();
        self
    }

    pub fn with_shell(mut self, shell: ShellConfig) -> Self {
        self.shell = shell;
        self
    }
}
