pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

pub use error::{Result, SupervisorError};
pub use supervisor::Supervisor;
