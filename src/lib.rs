pub mod error;
pub mod logging;
pub mod util;

pub mod command_job;
pub mod config;
pub mod dispatch;
pub mod job;
pub mod job_logger;
pub mod scheduler;
pub mod status;

pub use command_job::CommandJob;
pub use dispatch::{DispatchQueue, Dispatcher};
pub use error::{Cancelled, DispatchClosed, ResourceExhausted, StartError};
pub use job::{Job, JobBody, JobId, JobOutcome, JobState};
pub use job_logger::{CancelToken, Console, JobLogger};
pub use scheduler::{
    BatchReport, BatchStatus, JobCounts, JobScheduler, SchedulerOptions, StatusSnapshot, TerminalClassification,
};

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod util_tests;
