//! Notification channel for job status changes and captured log lines.
//!
//! Publishing never blocks and never fails: with no subscriber attached the
//! event is simply dropped, and a subscriber that falls more than the channel
//! capacity behind skips the events it missed. The log file remains the
//! durable record of a job's output.

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::scheduler::{Job, JobId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobEvent {
    /// Job row after a status transition
    Updated(Job),
    /// One encoded log line, including its stream prefix
    Log { job_id: JobId, log_data: String },
}

impl JobEvent {
    /// Event name used by stream subscribers.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Updated(_) => "job",
            JobEvent::Log { .. } => "job-log",
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Updated(job) => job.id,
            JobEvent::Log { job_id, .. } => *job_id,
        }
    }

    /// Wire payload: `{ "event_type": "update", "data": ... }`.
    pub fn payload(&self) -> Value {
        json!({
            "event_type": "update",
            "data": self,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: JobEvent) {
        // An error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(JobEvent::Log {
            job_id: 1,
            log_data: "$&hello\n".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(JobEvent::Log {
            job_id: 3,
            log_data: "&$oops\n".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "job-log");
        assert_eq!(event.job_id(), 3);
        assert_eq!(event.payload()["data"]["log_data"], "&$oops\n");
        assert_eq!(event.payload()["event_type"], "update");
    }

    #[test]
    fn job_event_payload_carries_job_row() {
        let job = Job::new(5, "/m/train.py".to_string(), "{}".to_string(), 1);
        let event = JobEvent::Updated(job);
        assert_eq!(event.name(), "job");
        assert_eq!(event.payload()["data"]["id"], 5);
        assert_eq!(event.payload()["data"]["status"], "scheduled");
    }
}
