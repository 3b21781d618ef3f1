//! Process execution for jobs.
//!
//! - [`ProcessExecutor`]: spawns a job's script, captures its output and
//!   resolves with an [`Outcome`]
//! - [`log_line`]: the tagged, escaped line format of job logs
//! - [`log_tail`]: windowed reads of persisted logs
//! - [`signal`]: stop/kill delivery to running jobs
//!
//! # Execution Flow
//!
//! 1. The dispatcher hands a `scheduled` job to [`ProcessExecutor::execute`]
//! 2. Log files are created and the script is spawned through the configured shell
//! 3. The start callback receives the pid and log paths
//! 4. stdout/stderr chunks are written to the log and published as events
//! 5. The exit code or terminating signal is returned

pub mod executor;
pub mod log_line;
pub mod log_tail;
pub mod signal;

pub use executor::{Outcome, ProcessExecutor, ProcessStart};
pub use log_tail::LogWindow;
pub use signal::StopSignal;
