//! Bounded subprocess pool
//!
//! Event handlers, xtrigger checks, and remote init/file-install all run as
//! short-lived child processes through this pool. The main loop calls
//! `process` once per tick to reap finished jobs and launch queued ones;
//! results are routed back to their owner by the job kind tag.

use std::collections::VecDeque;
use std::process::Stdio;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default maximum concurrent child processes.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Who asked for a job, and where its result goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcJobKind {
    /// An xtrigger check; keyed by signature so identical calls share.
    Xtrigger { signature: String },
    /// A task or workflow event handler.
    EventHandler { context: String },
    /// Remote init for an install target.
    RemoteInit { install_target: String },
    /// File install for an install target.
    FileInstall { install_target: String },
}

/// A queued helper command, run through `sh -c`.
#[derive(Debug, Clone)]
pub struct ProcJob {
    pub kind: ProcJobKind,
    pub command: String,
}

/// Outcome of a finished helper.
#[derive(Debug)]
pub struct ProcResult {
    pub kind: ProcJobKind,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// SSH reports an unreachable host with exit status 255.
    pub fn unreachable(&self) -> bool {
        self.exit_code == Some(255)
    }
}

/// The pool itself: a queue plus a bounded set of running children.
pub struct SubProcPool {
    max_parallel: usize,
    queued: VecDeque<ProcJob>,
    running: Vec<JoinHandle<ProcResult>>,
    closed: bool,
}

impl SubProcPool {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            queued: VecDeque::new(),
            running: Vec::new(),
            closed: false,
        }
    }

    /// Queue a helper for execution. Jobs submitted after `close` are
    /// dropped with a warning.
    pub fn submit(&mut self, job: ProcJob) {
        if self.closed {
            warn!(kind = ?job.kind, "subprocess pool closed, dropping job");
            return;
        }
        debug!(kind = ?job.kind, "queued helper");
        self.queued.push_back(job);
    }

    /// Reap finished children, then launch queued jobs up to the cap.
    /// Returns the results of everything that finished since the last call.
    pub fn process(&mut self) -> Vec<ProcResult> {
        let mut results = Vec::new();
        let mut still_running = Vec::with_capacity(self.running.len());
        for mut handle in self.running.drain(..) {
            if handle.is_finished() {
                match (&mut handle).now_or_never() {
                    Some(Ok(result)) => results.push(result),
                    Some(Err(e)) => warn!(error = %e, "helper task panicked"),
                    None => still_running.push(handle),
                }
            } else {
                still_running.push(handle);
            }
        }
        self.running = still_running;

        while self.running.len() < self.max_parallel {
            let Some(job) = self.queued.pop_front() else { break };
            self.running.push(spawn_helper(job));
        }
        results
    }

    /// Whether any work is queued or running.
    pub fn is_not_done(&self) -> bool {
        !self.queued.is_empty() || !self.running.is_empty()
    }

    /// Stop accepting new jobs (shutdown is beginning).
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Abandon everything: abort running children, drop the queue.
    pub fn terminate(&mut self) {
        self.queued.clear();
        for handle in self.running.drain(..) {
            handle.abort();
        }
    }
}

fn spawn_helper(job: ProcJob) -> JoinHandle<ProcResult> {
    tokio::spawn(async move {
        debug!(kind = ?job.kind, command = %job.command, "running helper");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&job.command)
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(output) => ProcResult {
                kind: job.kind,
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(e) => ProcResult {
                kind: job.kind,
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn job(cmd: &str) -> ProcJob {
        ProcJob {
            kind: ProcJobKind::EventHandler {
                context: "test".into(),
            },
            command: cmd.to_string(),
        }
    }

    async fn drain(pool: &mut SubProcPool) -> Vec<ProcResult> {
        let mut results = Vec::new();
        while pool.is_not_done() {
            results.extend(pool.process());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        results.extend(pool.process());
        results
    }

    #[tokio::test]
    async fn test_runs_and_reaps() {
        let mut pool = SubProcPool::new(2);
        pool.submit(job("true"));
        pool.submit(job("false"));
        let results = drain(&mut pool).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| r.succeeded()));
        assert!(results.iter().any(|r| r.exit_code == Some(1)));
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let mut pool = SubProcPool::new(1);
        pool.submit(job("true"));
        pool.submit(job("true"));
        pool.process();
        // Only one child may run at once.
        assert_eq!(pool.running.len(), 1);
        assert_eq!(pool.queued.len(), 1);
        let results = drain(&mut pool).await;
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_pool_drops_jobs() {
        let mut pool = SubProcPool::new(1);
        pool.close();
        pool.submit(job("true"));
        assert!(!pool.is_not_done());
    }

    #[tokio::test]
    async fn test_terminate_abandons_work() {
        let mut pool = SubProcPool::new(1);
        pool.submit(job("sleep 30"));
        pool.submit(job("true"));
        pool.process();
        pool.terminate();
        assert!(!pool.is_not_done());
    }

    #[tokio::test]
    async fn test_captures_output() {
        let mut pool = SubProcPool::new(1);
        pool.submit(job("echo hello"));
        let results = drain(&mut pool).await;
        assert_eq!(results[0].stdout.trim(), "hello");
    }
}
