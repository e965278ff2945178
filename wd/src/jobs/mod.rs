//! The job manager: prepare, submit, poll, and kill task jobs
//!
//! Tasks released from the queues re-enter `submit_task_jobs` every tick
//! until they reach `submitted`; the asynchronous stages (remote init, file
//! install) park them in `preparing` meanwhile. No staging list is kept
//! between ticks, so the pool is always the single source of truth.
//!
//! Job outcomes are reported as ordinary task messages on the message
//! queue, so submission failures follow the same retry path as runtime
//! failures.

pub mod remote;
pub mod runner;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use eyre::{Context, Result};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastManager;
use crate::platform::Platform;
use crate::pool::TaskPool;
use crate::procpool::SubProcPool;
use crate::queues::{Severity, TaskMsg};
use crate::task::{
    JobInfo, OUTPUT_FAILED, OUTPUT_STARTED, OUTPUT_SUBMIT_FAILED, OUTPUT_SUBMITTED, TaskId,
};

pub use remote::{RemoteManager, RemoteState};
pub use runner::{BackgroundRunner, JobPollStatus, JobRunner};

pub struct TaskJobManager {
    platforms: HashMap<String, Platform>,
    runners: HashMap<String, Arc<dyn JobRunner>>,
    pub remote_mgr: RemoteManager,
    pub bad_hosts: HashSet<String>,
    job_log_dir: PathBuf,
    simulation: bool,
    message_tx: UnboundedSender<TaskMsg>,
    /// Environment exported to every job script.
    workflow_env: Vec<(String, String)>,
}

impl TaskJobManager {
    pub fn new(
        platforms: HashMap<String, Platform>,
        job_log_dir: PathBuf,
        service_dir: PathBuf,
        simulation: bool,
        message_tx: UnboundedSender<TaskMsg>,
    ) -> Self {
        let runners: HashMap<String, Arc<dyn JobRunner>> =
            [("background".to_string(), Arc::new(BackgroundRunner) as Arc<dyn JobRunner>)].into();
        Self {
            platforms,
            runners,
            remote_mgr: RemoteManager::new(service_dir.display().to_string()),
            bad_hosts: HashSet::new(),
            job_log_dir,
            simulation,
            message_tx,
            workflow_env: Vec::new(),
        }
    }

    /// Static workflow variables for job scripts (id, cycle points, mode).
    pub fn set_workflow_env(&mut self, env: Vec<(String, String)>) {
        self.workflow_env = env;
    }

    pub fn reload_platforms(&mut self, platforms: HashMap<String, Platform>) {
        self.platforms = platforms;
    }

    fn platform_for(&self, name: &str) -> Option<Platform> {
        self.platforms.get(name).cloned().or_else(|| {
            (name == "localhost").then(Platform::localhost)
        })
    }

    fn send_message(&self, job_id: String, severity: Severity, message: &str) {
        let _ = self.message_tx.send(TaskMsg::new(job_id, severity, message));
    }

    fn submit_failed(&self, itask_job_id: String, reason: &str) {
        warn!(job = %itask_job_id, reason, "job submission failed");
        self.send_message(itask_job_id, Severity::Critical, OUTPUT_SUBMIT_FAILED);
    }

    /// Push each pre-prep task one stage further through the pipeline:
    /// host select, remote init, file install, job file write, submit.
    /// Returns the ids that reached `submitted` in this pass.
    pub async fn submit_task_jobs(
        &mut self,
        pool: &mut TaskPool,
        pre_prep: &[TaskId],
        broadcasts: &BroadcastManager,
        proc_pool: &mut SubProcPool,
    ) -> Vec<TaskId> {
        let mut submitted = Vec::new();
        for id in pre_prep {
            let Some(itask) = pool.get(id) else { continue };
            let job_identity = itask.job_identity();
            let Some(def) = pool.def(&id.name) else { continue };
            let (platform_name, script) = (def.platform.clone(), def.script.clone());

            // Stage 1: platform and host selection.
            let Some(platform) = self.platform_for(&platform_name) else {
                self.submit_failed(job_identity, "unknown platform");
                continue;
            };
            let host = match platform.select_host(&self.bad_hosts) {
                Ok(host) => host,
                Err(e) => {
                    self.submit_failed(job_identity, &e.to_string());
                    continue;
                }
            };

            // Stages 2-3: remote init and file install, once per target.
            if !self.remote_mgr.ready_for(&platform) {
                match self.remote_mgr.state(platform.install_target()) {
                    None => self.remote_mgr.remote_init(&platform, proc_pool),
                    Some(RemoteState::InitDone) => self.remote_mgr.file_install(&platform, proc_pool),
                    Some(state) if state.is_failed() => {
                        if state == RemoteState::Unreachable {
                            self.bad_hosts.insert(host.clone());
                        }
                        // Forget the target so a later attempt re-inits.
                        self.remote_mgr.clear_target(platform.install_target());
                        self.submit_failed(job_identity, "remote setup failed");
                        continue;
                    }
                    // Pending: stay preparing, re-enter next tick.
                    Some(_) => {}
                }
                continue;
            }

            // Simulation mode submits nothing: the job "runs" in-process.
            if self.simulation {
                let Some(itask) = pool.get_mut(id) else { continue };
                itask.job = Some(JobInfo {
                    job_runner: "simulation".to_string(),
                    platform: platform_name,
                    host,
                    job_id: "simulated".to_string(),
                });
                self.send_message(job_identity.clone(), Severity::Info, OUTPUT_SUBMITTED);
                self.send_message(job_identity, Severity::Info, OUTPUT_STARTED);
                submitted.push(id.clone());
                continue;
            }

            // Stage 4: job file write.
            let submit_num = itask.submit_num;
            let env = broadcasts.get_broadcast(itask);
            let job_file = match self.write_job_file(id, submit_num, &script, &env) {
                Ok(path) => path,
                Err(e) => {
                    self.submit_failed(job_identity, &e.to_string());
                    continue;
                }
            };

            // Stage 5: submit through the platform's job runner.
            let Some(runner) = self.runners.get(&platform.job_runner).cloned() else {
                self.submit_failed(job_identity, "unknown job runner");
                continue;
            };
            match runner.submit(&job_file).await {
                Ok(runner_job_id) => {
                    let Some(itask) = pool.get_mut(id) else { continue };
                    itask.job = Some(JobInfo {
                        job_runner: platform.job_runner.clone(),
                        platform: platform_name,
                        host,
                        job_id: runner_job_id,
                    });
                    self.send_message(job_identity, Severity::Info, OUTPUT_SUBMITTED);
                    submitted.push(id.clone());
                }
                Err(e) => self.submit_failed(job_identity, &e.to_string()),
            }
        }
        submitted
    }

    fn write_job_file(
        &self,
        id: &TaskId,
        submit_num: u32,
        script: &str,
        broadcast_env: &HashMap<String, serde_json::Value>,
    ) -> Result<PathBuf> {
        let job_dir = self
            .job_log_dir
            .join(id.point.to_string())
            .join(&id.name)
            .join(format!("{:02}", submit_num));
        std::fs::create_dir_all(&job_dir).context("failed to create job directory")?;
        let job_file = job_dir.join("job");
        let mut content = String::from("#!/bin/sh\n");
        for (key, value) in &self.workflow_env {
            content.push_str(&format!("export {}='{}'\n", key, value));
        }
        content.push_str(&format!("export WD_TASK_ID='{}'\n", id));
        content.push_str(&format!("export WD_TASK_SUBMIT_NUM='{}'\n", submit_num));
        for (key, value) in broadcast_env {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            content.push_str(&format!("export {}='{}'\n", key, value));
        }
        content.push_str(script);
        content.push('\n');
        std::fs::write(&job_file, content).context("failed to write job file")?;
        debug!(job_file = %job_file.display(), "job file written");
        Ok(job_file)
    }

    fn job_file_path(&self, id: &TaskId, submit_num: u32) -> PathBuf {
        self.job_log_dir
            .join(id.point.to_string())
            .join(&id.name)
            .join(format!("{:02}", submit_num))
            .join("job")
    }

    /// Poll the given tasks' jobs. Only active tasks are ever polled;
    /// waiting tasks are filtered out by the caller's contract and again
    /// here.
    pub async fn poll_task_jobs(&mut self, pool: &mut TaskPool, ids: &[TaskId]) {
        for id in ids {
            let Some(itask) = pool.get(id) else { continue };
            if !itask.status().is_active() {
                debug!(id = %id, status = %itask.status(), "not polling inactive task");
                continue;
            }
            let Some(job) = itask.job.clone() else { continue };
            let Some(runner) = self.runners.get(&job.job_runner).cloned() else { continue };
            let job_file = self.job_file_path(id, itask.submit_num);
            let job_identity = itask.job_identity();
            match runner.poll(&job_file, &job.job_id).await {
                Ok(JobPollStatus::Running) => {
                    debug!(id = %id, "poll: job still running");
                    // A submitted job found running has started.
                    self.send_message(job_identity, Severity::Info, OUTPUT_STARTED);
                }
                Ok(JobPollStatus::Exited(0)) => {
                    info!(id = %id, "poll: job succeeded");
                    self.send_message(job_identity, Severity::Info, "succeeded");
                }
                Ok(JobPollStatus::Exited(code)) => {
                    warn!(id = %id, code, "poll: job failed");
                    self.send_message(job_identity, Severity::Critical, OUTPUT_FAILED);
                }
                Ok(JobPollStatus::Vanished) => {
                    warn!(id = %id, "poll: job vanished");
                    self.send_message(job_identity, Severity::Critical, OUTPUT_FAILED);
                }
                Err(e) => warn!(id = %id, error = %e, "poll failed"),
            }
        }
    }

    /// Kill the given tasks' jobs. The resulting failure arrives through
    /// the normal message path (and remains retryable).
    pub async fn kill_task_jobs(&mut self, pool: &mut TaskPool, ids: &[TaskId]) {
        for id in ids {
            let Some(itask) = pool.get(id) else { continue };
            if !itask.status().is_active() {
                continue;
            }
            let Some(job) = itask.job.clone() else { continue };
            let Some(runner) = self.runners.get(&job.job_runner).cloned() else { continue };
            let job_identity = itask.job_identity();
            match runner.kill(&job.job_id).await {
                Ok(()) => {
                    info!(id = %id, "job killed");
                    self.send_message(job_identity, Severity::Critical, OUTPUT_FAILED);
                }
                Err(e) => warn!(id = %id, error = %e, "kill failed"),
            }
        }
    }

    /// Find active tasks whose submission/execution timeout has passed;
    /// the caller polls them.
    pub fn check_task_jobs(&self, pool: &TaskPool) -> Vec<TaskId> {
        let now = Utc::now();
        let mut to_poll = Vec::new();
        for itask in pool.tasks() {
            let Some(def) = pool.def(&itask.id.name) else { continue };
            let timed_out = match itask.status() {
                crate::task::TaskStatus::Submitted => def
                    .submission_timeout_secs
                    .zip(itask.submitted_at)
                    .is_some_and(|(secs, at)| now > at + chrono::Duration::seconds(secs)),
                crate::task::TaskStatus::Running => def
                    .execution_timeout_secs
                    .zip(itask.started_at)
                    .is_some_and(|(secs, at)| now > at + chrono::Duration::seconds(secs)),
                _ => false,
            };
            if timed_out {
                warn!(id = %itask.id, "job timeout, polling");
                to_poll.push(itask.id.clone());
            }
        }
        to_poll
    }
}
