//! Scheduled task service — job types, persistence, and the async timer
//! loop that fires due jobs and delivers their results to the message bus.

pub mod service;
pub mod types;

pub use service::{CronService, OnJobFn};
pub use types::{
    compute_next_run_from, CronError, CronJob, CronJobState, CronPayload, CronSchedule,
    CronStore, JobStatus, ScheduleKind,
};
