pub mod dispatcher;
pub mod job;
pub mod store;

pub use dispatcher::Dispatcher;
pub use job::{Job, JobId, JobStatus};
pub use store::{JobFilter, JobStore, LocalJobStore, TransitionFields};
