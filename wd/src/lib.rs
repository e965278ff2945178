//! workflowd - cyclic workflow scheduler daemon
//!
//! workflowd drives a dependency-graph workflow to completion: it spawns
//! task instances along cycling sequences, tracks their states, submits
//! jobs to local or remote platforms, and reacts to timers, external
//! events, and operator commands.
//!
//! # Core Concepts
//!
//! - **Single-writer loop**: the main loop is the only writer of task-pool
//!   and data-store state; the server thread and helpers feed queues.
//! - **Spawn on demand**: downstream tasks come into existence when an
//!   upstream output completes, staged behind a runahead window.
//! - **Flows**: each graph traversal carries integer flow numbers; manual
//!   triggers can start new flows or merge into existing ones.
//! - **Everything restartable**: pool state, flow numbers, retries, and
//!   stop conditions round-trip through the private database.
//!
//! # Modules
//!
//! - [`scheduler`] - startup, the main loop, shutdown and auto-restart
//! - [`pool`] - the task pool and its state rules
//! - [`events`] - message-driven transitions, retries, handler dispatch
//! - [`jobs`] - the submission pipeline and remote install fan-out
//! - [`config`] - workflow configuration loading
//! - [`cli`] - command-line interface

pub mod broadcast;
pub mod cli;
pub mod command;
pub mod config;
pub mod cycling;
pub mod datastore;
pub mod db;
pub mod error;
pub mod events;
pub mod flow;
pub mod jobs;
pub mod platform;
pub mod pool;
pub mod procpool;
pub mod queues;
pub mod scheduler;
pub mod server;
pub mod status;
pub mod task;
pub mod timer;
pub mod xtrigger;

// Re-export commonly used types
pub use broadcast::BroadcastManager;
pub use command::Command;
pub use config::{RunOptions, WorkflowConfig};
pub use cycling::{CyclePoint, Interval, Sequence};
pub use datastore::{DataStore, Delta};
pub use db::{DatabaseManager, DbOp};
pub use error::{CyclingError, WorkflowError};
pub use events::TaskEventsManager;
pub use flow::{FlowManager, FlowSpec};
pub use jobs::{JobRunner, TaskJobManager};
pub use platform::Platform;
pub use pool::TaskPool;
pub use procpool::SubProcPool;
pub use queues::{ExtTriggerMsg, IngestQueue, Severity, TaskMsg};
pub use scheduler::Scheduler;
pub use server::{ClientRequest, ClientResponse, ContactFile, Server};
pub use status::{AutoRestartMode, RunMode, StopMode};
pub use task::{TaskDef, TaskId, TaskProxy, TaskStatus};
pub use timer::{Timer, WorkflowEvent};
pub use xtrigger::XtriggerManager;
