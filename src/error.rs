use thiserror::Error;

use crate::scheduler::{JobId, JobStatus};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {0} is running and has to be stopped first")]
    JobRunning(JobId),

    #[error("Invalid script name: {0}")]
    InvalidScriptName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
