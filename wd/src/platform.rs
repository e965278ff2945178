//! Execution platforms and host selection
//!
//! A platform is an addressable execution environment: the hosts jobs can
//! land on, how to reach them, and which job runner manages them. Remote
//! init and file install are done once per install target, not per host.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::WorkflowError;

/// A concrete platform record. Every field is enumerated; there is no
/// pass-through configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Platform {
    /// Identity for remote init/file install deduplication. Empty means
    /// "same as the first host".
    pub install_target: String,
    pub hosts: Vec<String>,
    pub ssh_command: String,
    pub job_runner: String,
    pub use_login_shell: bool,
    pub run_dir: String,
    pub work_dir: String,
    pub share_dir: String,
    /// Files rsynced to the install target during file install.
    pub install_includes: Vec<String>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            install_target: String::new(),
            hosts: vec!["localhost".to_string()],
            ssh_command: "ssh -oBatchMode=yes -oConnectTimeout=10".to_string(),
            job_runner: "background".to_string(),
            use_login_shell: true,
            run_dir: "$HOME/wd-run".to_string(),
            work_dir: "$HOME/wd-run/work".to_string(),
            share_dir: "$HOME/wd-run/share".to_string(),
            install_includes: Vec::new(),
        }
    }
}

impl Platform {
    /// The built-in local platform.
    pub fn localhost() -> Self {
        Self {
            install_target: "localhost".to_string(),
            ..Default::default()
        }
    }

    /// Resolved install target: the configured one, else the first host.
    pub fn install_target(&self) -> &str {
        if !self.install_target.is_empty() {
            &self.install_target
        } else {
            self.hosts.first().map(String::as_str).unwrap_or("localhost")
        }
    }

    /// Whether jobs on this platform run on the scheduler host.
    pub fn is_local(&self) -> bool {
        self.install_target() == "localhost"
    }

    /// Pick a host for a job: first candidate not in the bad-host set.
    pub fn select_host(&self, bad_hosts: &HashSet<String>) -> Result<String, WorkflowError> {
        for host in &self.hosts {
            if !bad_hosts.contains(host) {
                debug!(host = %host, "selected job host");
                return Ok(host.clone());
            }
        }
        Err(WorkflowError::HostSelect(format!(
            "no hosts available ({} candidate(s), all unreachable)",
            self.hosts.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localhost_is_local() {
        let platform = Platform::localhost();
        assert!(platform.is_local());
        assert_eq!(platform.install_target(), "localhost");
    }

    #[test]
    fn test_install_target_falls_back_to_first_host() {
        let platform = Platform {
            hosts: vec!["hpc-login1".into(), "hpc-login2".into()],
            ..Default::default()
        };
        assert_eq!(platform.install_target(), "hpc-login1");
        assert!(!platform.is_local());
    }

    #[test]
    fn test_select_host_skips_bad_hosts() {
        let platform = Platform {
            hosts: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        let bad: HashSet<String> = ["a".to_string()].into();
        assert_eq!(platform.select_host(&bad).unwrap(), "b");
    }

    #[test]
    fn test_select_host_exhausted() {
        let platform = Platform {
            hosts: vec!["a".into()],
            ..Default::default()
        };
        let bad: HashSet<String> = ["a".to_string()].into();
        assert!(matches!(
            platform.select_host(&bad),
            Err(WorkflowError::HostSelect(_))
        ));
    }
}
