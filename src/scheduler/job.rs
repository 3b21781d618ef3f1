use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Scheduled,
    Running,
    Done,
    Error,
}

impl JobStatus {
    /// `done` or `error`: nothing moves the job again without a restart.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Edges of the job state machine, excluding the explicit restart edge.
    ///
    /// `scheduled -> error` covers jobs whose process never started.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Scheduled, JobStatus::Running)
                | (JobStatus::Scheduled, JobStatus::Error)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Error)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Scheduled => write!(f, "scheduled"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Ok(JobStatus::Scheduled),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub script_path: String,
    pub script_payload: String,
    pub created_by_user_id: u64,
    pub status: JobStatus,
    /// Last known OS process id; cleared when the job is rescheduled.
    pub pid: Option<u32>,
    pub log_path: Option<String>,
    pub err_log_path: Option<String>,
    pub exit_code: Option<i32>,
    pub creation_date: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, script_path: String, script_payload: String, user_id: u64) -> Self {
        Self {
            id,
            script_path,
            script_payload,
            created_by_user_id: user_id,
            status: JobStatus::Scheduled,
            pid: None,
            log_path: None,
            err_log_path: None,
            exit_code: None,
            creation_date: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// File name of the script, used for display and name filters.
    pub fn script_name(&self) -> &str {
        self.script_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.script_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_scheduled_without_pid() {
        let job = Job::new(1, "/opt/modules/train.py".to_string(), "{}".to_string(), 9);
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.created_by_user_id, 9);
        assert!(job.pid.is_none());
        assert!(job.log_path.is_none());
        assert_eq!(job.script_name(), "train.py");
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Scheduled,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>(), Ok(status));
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Scheduled).unwrap();
        assert_eq!(json, "\"scheduled\"");
    }

    #[test]
    fn state_machine_edges() {
        assert!(JobStatus::Scheduled.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Scheduled.can_transition_to(JobStatus::Error));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Done));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Error));

        assert!(!JobStatus::Running.can_transition_to(JobStatus::Scheduled));
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Error.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Scheduled.can_transition_to(JobStatus::Done));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Scheduled.is_terminal());
    }
}
