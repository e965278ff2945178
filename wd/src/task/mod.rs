//! Task definitions, state machine, and live task instances

pub mod def;
pub mod proxy;
pub mod state;

pub use def::{TaskDef, TaskTrigger};
pub use proxy::{JobInfo, TaskId, TaskProxy, parse_job_id};
pub use state::{
    OUTPUT_EXPIRED, OUTPUT_FAILED, OUTPUT_STARTED, OUTPUT_SUBMITTED, OUTPUT_SUBMIT_FAILED,
    OUTPUT_SUCCEEDED, Prerequisite, TaskState, TaskStatus,
};
