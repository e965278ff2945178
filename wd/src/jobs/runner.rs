//! Job runners: the platform-specific seam for managing job processes
//!
//! A runner submits a written job file, polls the resulting job, and kills
//! it. The built-in "background" runner manages plain local processes with
//! a status file written on exit.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use tracing::debug;

/// What a poll found out about a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPollStatus {
    Running,
    Exited(i32),
    /// Process gone with no status file: treat as failed.
    Vanished,
}

/// Platform-specific job management.
#[async_trait]
pub trait JobRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Submit the job file; returns the runner's job id.
    async fn submit(&self, job_file: &Path) -> Result<String>;

    async fn poll(&self, job_file: &Path, job_id: &str) -> Result<JobPollStatus>;

    async fn kill(&self, job_id: &str) -> Result<()>;
}

/// Runs jobs as detached local processes. The job id is the pid; the exit
/// status lands in `<job_file>.status`.
pub struct BackgroundRunner;

fn status_path(job_file: &Path) -> PathBuf {
    let mut path = job_file.as_os_str().to_owned();
    path.push(".status");
    PathBuf::from(path)
}

fn pid_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid), None).is_ok()
}

#[async_trait]
impl JobRunner for BackgroundRunner {
    fn name(&self) -> &str {
        "background"
    }

    async fn submit(&self, job_file: &Path) -> Result<String> {
        let wrapper = format!(
            "sh {job} >{job}.out 2>{job}.err; echo $? >{job}.status",
            job = job_file.display()
        );
        let child = Command::new("sh")
            .arg("-c")
            .arg(&wrapper)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn background job")?;
        let pid = child.id();
        debug!(job_file = %job_file.display(), pid, "background job submitted");
        Ok(pid.to_string())
    }

    async fn poll(&self, job_file: &Path, job_id: &str) -> Result<JobPollStatus> {
        let status_file = status_path(job_file);
        if let Ok(content) = std::fs::read_to_string(&status_file) {
            let code: i32 = content.trim().parse().unwrap_or(1);
            return Ok(JobPollStatus::Exited(code));
        }
        let pid: i32 = job_id.parse().map_err(|_| eyre!("bad background job id: '{}'", job_id))?;
        if pid_alive(pid) {
            Ok(JobPollStatus::Running)
        } else {
            Ok(JobPollStatus::Vanished)
        }
    }

    async fn kill(&self, job_id: &str) -> Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let pid: i32 = job_id.parse().map_err(|_| eyre!("bad background job id: '{}'", job_id))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).context("failed to kill background job")?;
        debug!(pid, "sent SIGTERM to background job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn wait_exit(runner: &BackgroundRunner, job_file: &Path, job_id: &str) -> JobPollStatus {
        for _ in 0..100 {
            match runner.poll(job_file, job_id).await.unwrap() {
                JobPollStatus::Running => tokio::time::sleep(Duration::from_millis(20)).await,
                done => return done,
            }
        }
        panic!("job did not finish");
    }

    #[tokio::test]
    async fn test_background_submit_and_poll_success() {
        let dir = TempDir::new().unwrap();
        let job_file = dir.path().join("job");
        std::fs::write(&job_file, "exit 0\n").unwrap();
        let runner = BackgroundRunner;
        let job_id = runner.submit(&job_file).await.unwrap();
        assert_eq!(wait_exit(&runner, &job_file, &job_id).await, JobPollStatus::Exited(0));
    }

    #[tokio::test]
    async fn test_background_poll_failure_code() {
        let dir = TempDir::new().unwrap();
        let job_file = dir.path().join("job");
        std::fs::write(&job_file, "exit 3\n").unwrap();
        let runner = BackgroundRunner;
        let job_id = runner.submit(&job_file).await.unwrap();
        assert_eq!(wait_exit(&runner, &job_file, &job_id).await, JobPollStatus::Exited(3));
    }

    #[tokio::test]
    async fn test_poll_vanished_without_status() {
        let dir = TempDir::new().unwrap();
        let job_file = dir.path().join("job");
        std::fs::write(&job_file, "exit 0\n").unwrap();
        let runner = BackgroundRunner;
        // A pid that cannot exist and no status file.
        let status = runner.poll(&job_file, "999999999").await;
        assert!(matches!(status, Ok(JobPollStatus::Vanished) | Err(_)));
    }
}
